#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use camino::Utf8Path;
use serde_json::{Value, json};

use openbis_mirror::connection::ConnectionInfo;
use openbis_mirror::domain::EntityKind;
use openbis_mirror::error::MirrorError;
use openbis_mirror::openbis::{DownloadRequest, QueryClient, QueryRequest, QueryType, Server};

const KINDS: [EntityKind; 4] = [
    EntityKind::Sample,
    EntityKind::DataSet,
    EntityKind::Experiment,
    EntityKind::DataSetFile,
];

/// Canned openBIS server: answers queries from in-memory records and counts
/// every request it sees.
#[derive(Default)]
pub struct MockOpenbis {
    records: Mutex<HashMap<EntityKind, Vec<Value>>>,
    overrides: Mutex<HashMap<EntityKind, Value>>,
    calls: Mutex<Vec<(Server, QueryRequest)>>,
    downloads: Mutex<Vec<DownloadRequest>>,
}

impl MockOpenbis {
    pub fn with(records: Vec<(EntityKind, Value)>) -> Self {
        let mock = Self::default();
        for (kind, record) in records {
            mock.put(kind, record);
        }
        mock
    }

    /// Adds a record, replacing one with the same permId.
    pub fn put(&self, kind: EntityKind, record: Value) {
        let mut guard = self.records.lock().unwrap();
        let list = guard.entry(kind).or_default();
        let id = record_id(kind, &record);
        list.retain(|existing| record_id(kind, existing) != id);
        list.push(record);
    }

    /// Answers every query for `kind` with `payload` verbatim.
    pub fn respond_raw(&self, kind: EntityKind, payload: Value) {
        self.overrides.lock().unwrap().insert(kind, payload);
    }

    pub fn clear_raw(&self, kind: EntityKind) {
        self.overrides.lock().unwrap().remove(&kind);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<(Server, QueryRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<DownloadRequest> {
        self.downloads.lock().unwrap().clone()
    }
}

impl QueryClient for MockOpenbis {
    fn query(
        &self,
        _ctx: &ConnectionInfo,
        server: Server,
        request: &QueryRequest,
    ) -> Result<Value, MirrorError> {
        self.calls.lock().unwrap().push((server, request.clone()));
        let kind = KINDS
            .into_iter()
            .find(|kind| kind.type_name() == request.entity_type)
            .ok_or_else(|| MirrorError::QueryStatus {
                status: 400,
                message: format!("unknown entity type {}", request.entity_type),
            })?;
        if let Some(payload) = self.overrides.lock().unwrap().get(&kind) {
            return Ok(payload.clone());
        }

        let wanted: BTreeSet<&str> = request.attribute_value.split(',').collect();
        let records = self.records.lock().unwrap();
        let matching: Vec<Value> = records
            .get(&kind)
            .into_iter()
            .flatten()
            .filter(|record| {
                request.query_type == QueryType::All
                    || wanted.contains(match_field(kind, record).as_str())
            })
            .cloned()
            .collect();
        Ok(json!({ kind.json_key(): matching }))
    }

    fn download(
        &self,
        _ctx: &ConnectionInfo,
        request: &DownloadRequest,
        destination: &Path,
    ) -> Result<u64, MirrorError> {
        self.downloads.lock().unwrap().push(request.clone());
        let content = format!("{}:{}", request.perm_id, request.source);
        std::fs::write(destination, &content)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(content.len() as u64)
    }
}

fn record_id(kind: EntityKind, record: &Value) -> String {
    match kind {
        EntityKind::DataSetFile => record["filePermId"].as_str().unwrap_or_default().to_string(),
        _ => record["permId"].as_str().unwrap_or_default().to_string(),
    }
}

fn match_field(kind: EntityKind, record: &Value) -> String {
    match kind {
        EntityKind::DataSetFile => record["dataSetPermId"].as_str().unwrap_or_default().to_string(),
        _ => record["permId"].as_str().unwrap_or_default().to_string(),
    }
}

pub fn ctx() -> ConnectionInfo {
    ConnectionInfo::new("alice", "secret", "https://openbis.example.org/openbis").unwrap()
}

pub fn sample(perm_id: &str, modified: i64, datasets: &[&str], comment: &str) -> Value {
    json!({
        "permId": perm_id,
        "code": format!("CODE-{perm_id}"),
        "properties": {"COMMENT": comment},
        "registrationDate": 0,
        "modificationDate": modified,
        "sampleType": {"code": "YEAST", "description": "Yeast strain"},
        "experiment": "E1",
        "datasets": datasets,
    })
}

pub fn dataset(perm_id: &str, modified: i64, samples: &[&str]) -> Value {
    json!({
        "permId": perm_id,
        "code": format!("CODE-{perm_id}"),
        "properties": {},
        "registrationDate": 0,
        "modificationDate": modified,
        "dataSetType": {"code": "RAW_DATA"},
        "experiment": "E1",
        "samples": samples,
    })
}

pub fn experiment(perm_id: &str, modified: i64, samples: &[&str], datasets: &[&str]) -> Value {
    json!({
        "permId": perm_id,
        "code": format!("CODE-{perm_id}"),
        "registrationDate": 0,
        "modificationDate": modified,
        "experimentType": {"code": "GROWTH"},
        "samples": samples,
        "datasets": datasets,
    })
}

pub fn file(dataset: &str, path: &str, is_directory: bool) -> Value {
    json!({
        "filePermId": format!("{dataset}::{path}"),
        "path": path,
        "isDirectory": is_directory,
        "fileLength": 128,
        "dataSetPermId": dataset,
    })
}

pub fn utf8(path: &Path) -> &Utf8Path {
    Utf8Path::from_path(path).unwrap()
}
