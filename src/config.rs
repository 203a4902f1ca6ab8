use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionInfo;
use crate::error::MirrorError;
use crate::openbis::DEFAULT_TIMEOUT_SECS;

pub const CONFIG_FILE: &str = "openbis-mirror.json";
pub const PASSWORD_ENV: &str = "OPENBIS_PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub endpoint: String,
    #[serde(default)]
    pub datastore_endpoint: Option<String>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub cache: Option<CacheMode>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub connection: ConnectionInfo,
    pub timeout: Duration,
    pub cache: CacheMode,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MirrorError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(MirrorError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MirrorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| MirrorError::ConfigParse(err.to_string()))?;

        Self::resolve_with_env(config, std::env::var(PASSWORD_ENV).ok())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MirrorError> {
        Self::resolve_with_env(config, None)
    }

    /// `env_password` fills in a password the config file leaves out.
    pub fn resolve_with_env(
        config: Config,
        env_password: Option<String>,
    ) -> Result<ResolvedConfig, MirrorError> {
        let password = config
            .password
            .filter(|value| !value.is_empty())
            .or(env_password.filter(|value| !value.trim().is_empty()))
            .ok_or_else(|| MirrorError::MissingCredential("password".to_string()))?;
        if config.username.trim().is_empty() {
            return Err(MirrorError::MissingCredential("username".to_string()));
        }

        let mut connection =
            ConnectionInfo::new(config.username.trim(), password, &config.endpoint)?;
        if let Some(datastore) = config.datastore_endpoint.as_deref() {
            connection = connection.with_datastore(datastore)?;
        }

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            connection,
            timeout: Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            cache: config.cache.unwrap_or_default(),
        })
    }
}
