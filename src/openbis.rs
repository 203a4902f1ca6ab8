use std::io::Write;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;

use crate::connection::ConnectionInfo;
use crate::domain::{EntityKind, PermId};
use crate::error::MirrorError;

pub const PERM_ID_ATTRIBUTE: &str = "PermID";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Attribute,
    All,
}

/// Which openBIS server a query goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Server {
    Application,
    Datastore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub entity_type: &'static str,
    pub query_type: QueryType,
    pub attribute: &'static str,
    pub attribute_value: String,
}

impl QueryRequest {
    pub fn by_perm_id(kind: EntityKind, value: impl Into<String>) -> Self {
        Self {
            entity_type: kind.type_name(),
            query_type: QueryType::Attribute,
            attribute: PERM_ID_ATTRIBUTE,
            attribute_value: value.into(),
        }
    }

    pub fn all(kind: EntityKind) -> Self {
        Self {
            entity_type: kind.type_name(),
            query_type: QueryType::All,
            attribute: PERM_ID_ATTRIBUTE,
            attribute_value: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadRequest {
    #[serde(rename = "downloadType")]
    pub download_type: String,
    #[serde(rename = "permID")]
    pub perm_id: PermId,
    pub source: String,
}

pub trait QueryClient: Send + Sync {
    fn query(
        &self,
        ctx: &ConnectionInfo,
        server: Server,
        request: &QueryRequest,
    ) -> Result<Value, MirrorError>;

    /// Streams a datastore file to `destination`, returning the byte count.
    fn download(
        &self,
        ctx: &ConnectionInfo,
        request: &DownloadRequest,
        destination: &Path,
    ) -> Result<u64, MirrorError>;
}

#[derive(Clone)]
pub struct OpenbisHttpClient {
    client: Client,
}

impl OpenbisHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, MirrorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("openbis-mirror/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MirrorError::TransientFetch(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| MirrorError::TransientFetch(err.to_string()))?;
        Ok(Self { client })
    }

    fn post(
        &self,
        ctx: &ConnectionInfo,
        url: Url,
        body: &impl Serialize,
    ) -> Result<Response, MirrorError> {
        let response = self
            .client
            .post(url)
            .basic_auth(&ctx.username, Some(&ctx.password))
            .json(body)
            .send()
            .map_err(|err| classify_send_error(&err))?;
        handle_status(response)
    }
}

impl QueryClient for OpenbisHttpClient {
    fn query(
        &self,
        ctx: &ConnectionInfo,
        server: Server,
        request: &QueryRequest,
    ) -> Result<Value, MirrorError> {
        let base = match server {
            Server::Application => &ctx.endpoint,
            Server::Datastore => ctx.datastore(),
        };
        let url = endpoint_url(base, "query")?;
        tracing::debug!(
            url = %url,
            entity_type = request.entity_type,
            value = %request.attribute_value,
            "openbis.query"
        );
        let start = std::time::Instant::now();
        let response = self.post(ctx, url, request)?;
        let value: Value = response
            .json()
            .map_err(|err| MirrorError::MalformedPayload(err.to_string()))?;
        tracing::debug!(latency_ms = start.elapsed().as_millis() as u64, "openbis.response");
        Ok(value)
    }

    fn download(
        &self,
        ctx: &ConnectionInfo,
        request: &DownloadRequest,
        destination: &Path,
    ) -> Result<u64, MirrorError> {
        let url = endpoint_url(ctx.datastore(), "download")?;
        let response = self.post(ctx, url, request)?;
        write_response_to_file(response, destination)
    }
}

fn endpoint_url(base: &Url, path: &str) -> Result<Url, MirrorError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|err| MirrorError::InvalidEndpoint(err.to_string()))
}

fn handle_status(response: Response) -> Result<Response, MirrorError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "openBIS request failed".to_string());
    Err(classify_status(status, message))
}

fn classify_status(status: u16, message: String) -> MirrorError {
    if is_retryable_status(status) {
        return MirrorError::TransientFetch(format!("status {status}: {message}"));
    }
    MirrorError::QueryStatus { status, message }
}

fn write_response_to_file(mut response: Response, destination: &Path) -> Result<u64, MirrorError> {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => return Err(MirrorError::Filesystem("invalid destination path".to_string())),
    };
    std::fs::create_dir_all(parent).map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix("openbis-mirror-download")
        .tempfile_in(parent)
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    let written = response
        .copy_to(&mut temp)
        .map_err(|err| classify_send_error(&err))?;
    temp.flush()
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    temp.persist(destination)
        .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
    Ok(written)
}

fn classify_send_error(err: &reqwest::Error) -> MirrorError {
    if err.is_decode() {
        return MirrorError::MalformedPayload(err.to_string());
    }
    if is_retryable_error(err) {
        return MirrorError::TransientFetch(err.to_string());
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), err.to_string());
    }
    MirrorError::Transport(err.to_string())
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}
