use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::{ContainerId, EntityKind, LocalId};

#[derive(Debug, Error, Diagnostic)]
pub enum MirrorError {
    #[error("{kind} not found in openBIS: {perm_id}")]
    EntityNotFound { kind: EntityKind, perm_id: String },

    #[error("openBIS request failed: {0}")]
    #[diagnostic(help("the request can be retried"))]
    TransientFetch(String),

    #[error("openBIS returned status {status}: {message}")]
    QueryStatus { status: u16, message: String },

    #[error("openBIS transport failure: {0}")]
    Transport(String),

    #[error("malformed openBIS payload: {0}")]
    MalformedPayload(String),

    #[error("{0} records cannot be fetched individually")]
    UnsupportedKind(EntityKind),

    #[error("no local mirror with id {0}")]
    MirrorNotFound(LocalId),

    #[error("{perm_id} is already mirrored in container {container}")]
    AlreadyMirrored {
        perm_id: String,
        container: ContainerId,
    },

    #[error("invalid openBIS permId: {0}")]
    InvalidPermId(String),

    #[error("invalid openBIS endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("missing config file openbis-mirror.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("missing credential: {0}")]
    #[diagnostic(help("set it in openbis-mirror.json or the OPENBIS_PASSWORD environment variable"))]
    MissingCredential(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl MirrorError {
    /// Whether a caller may safely repeat the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MirrorError::TransientFetch(_))
    }
}
