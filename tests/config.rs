use std::time::Duration;

use assert_matches::assert_matches;

use openbis_mirror::config::{CacheMode, Config, ConfigLoader};
use openbis_mirror::error::MirrorError;

fn config(password: Option<&str>) -> Config {
    Config {
        schema_version: None,
        endpoint: "https://openbis.example.org/openbis".to_string(),
        datastore_endpoint: Some("https://dss.example.org/datastore_server".to_string()),
        username: "alice".to_string(),
        password: password.map(str::to_string),
        timeout_secs: Some(5),
        cache: Some(CacheMode::Disk),
    }
}

#[test]
fn resolve_explicit_values() {
    let resolved = ConfigLoader::resolve_config(config(Some("pw"))).unwrap();
    assert_eq!(resolved.schema_version, 1);
    assert_eq!(resolved.timeout, Duration::from_secs(5));
    assert_eq!(resolved.cache, CacheMode::Disk);
    assert_eq!(resolved.connection.password, "pw");
    assert_eq!(
        resolved.connection.datastore().as_str(),
        "https://dss.example.org/datastore_server"
    );
}

#[test]
fn password_falls_back_to_environment() {
    let resolved =
        ConfigLoader::resolve_with_env(config(None), Some("from-env".to_string())).unwrap();
    assert_eq!(resolved.connection.password, "from-env");

    let file_wins =
        ConfigLoader::resolve_with_env(config(Some("pw")), Some("from-env".to_string())).unwrap();
    assert_eq!(file_wins.connection.password, "pw");
}

#[test]
fn missing_password_is_reported() {
    assert_matches!(
        ConfigLoader::resolve_with_env(config(None), None),
        Err(MirrorError::MissingCredential(field)) if field == "password"
    );
}

#[test]
fn invalid_endpoint_is_rejected() {
    let mut bad = config(Some("pw"));
    bad.endpoint = "ftp://openbis.example.org".to_string();
    assert_matches!(
        ConfigLoader::resolve_config(bad),
        Err(MirrorError::InvalidEndpoint(_))
    );
}

#[test]
fn resolve_reads_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("openbis-mirror.json");
    std::fs::write(
        &path,
        r#"{"schema_version": 1, "endpoint": "http://localhost:8443/openbis", "username": "bob", "password": "pw", "cache": "memory"}"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.connection.username, "bob");
    assert_eq!(resolved.cache, CacheMode::Memory);
    assert_eq!(
        resolved.connection.datastore(),
        &resolved.connection.endpoint
    );

    std::fs::write(&path, "{not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(MirrorError::ConfigParse(_))
    );

    let missing = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(MirrorError::ConfigRead(_))
    );
}
