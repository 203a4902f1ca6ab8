use std::fmt;

use reqwest::Url;

use crate::error::MirrorError;

/// Credentials and endpoints for one session against openBIS.
///
/// Passed by reference into every repository call so that concurrent
/// operations never share credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub username: String,
    pub password: String,
    pub endpoint: Url,
    pub datastore_endpoint: Option<Url>,
}

impl ConnectionInfo {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        endpoint: &str,
    ) -> Result<Self, MirrorError> {
        Ok(Self {
            username: username.into(),
            password: password.into(),
            endpoint: parse_endpoint(endpoint)?,
            datastore_endpoint: None,
        })
    }

    pub fn with_datastore(mut self, endpoint: &str) -> Result<Self, MirrorError> {
        self.datastore_endpoint = Some(parse_endpoint(endpoint)?);
        Ok(self)
    }

    /// Datastore server endpoint, falling back to the application server.
    pub fn datastore(&self) -> &Url {
        self.datastore_endpoint.as_ref().unwrap_or(&self.endpoint)
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("endpoint", &self.endpoint.as_str())
            .field(
                "datastore_endpoint",
                &self.datastore_endpoint.as_ref().map(Url::as_str),
            )
            .finish()
    }
}

pub fn parse_endpoint(value: &str) -> Result<Url, MirrorError> {
    let url = Url::parse(value.trim()).map_err(|err| {
        MirrorError::InvalidEndpoint(format!("{value}: {err}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(MirrorError::InvalidEndpoint(value.to_string()));
    }
    Ok(url)
}
