use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;

use crate::cache::{QueryCache, digest};
use crate::connection::ConnectionInfo;
use crate::domain::{EntityKind, PermId};
use crate::entity::{Dataset, DatasetFile, Entity, EntityRecord, Experiment, Sample};
use crate::error::MirrorError;
use crate::openbis::{DownloadRequest, QueryClient, QueryRequest, Server};

/// Cached, typed access to openBIS records.
#[derive(Clone)]
pub struct EntityRepository<C: QueryClient> {
    client: C,
    cache: QueryCache,
}

impl<C: QueryClient> EntityRepository<C> {
    pub fn new(client: C, cache: QueryCache) -> Self {
        Self { client, cache }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn cache_key(kind: EntityKind, value: &str) -> String {
        format!("openbis-{}-{}", kind.type_name(), digest(value))
    }

    pub fn datastore_cache_key(kind: EntityKind, value: &str) -> String {
        format!("openbis-datastore-server-{}-{}", kind.type_name(), digest(value))
    }

    pub fn by_id<E: EntityRecord>(
        &self,
        ctx: &ConnectionInfo,
        perm_id: &PermId,
    ) -> Result<E, MirrorError> {
        let key = Self::cache_key(E::KIND, perm_id.as_str());
        let request = QueryRequest::by_perm_id(E::KIND, perm_id.as_str());
        let records = self.records(ctx, Server::Application, E::KIND, &key, &request)?;

        let Some(record) = records
            .into_iter()
            .find(|record| record.get("permId").and_then(Value::as_str) == Some(perm_id.as_str()))
        else {
            self.cache.invalidate(&key)?;
            return Err(MirrorError::EntityNotFound {
                kind: E::KIND,
                perm_id: perm_id.to_string(),
            });
        };
        self.parse_or_evict(&key, || E::from_json(record))
    }

    /// Kind-dispatched variant of [`Self::by_id`].
    pub fn fetch(
        &self,
        ctx: &ConnectionInfo,
        kind: EntityKind,
        perm_id: &PermId,
    ) -> Result<Entity, MirrorError> {
        match kind {
            EntityKind::Sample => self.by_id::<Sample>(ctx, perm_id).map(Sample::into_entity),
            EntityKind::DataSet => self.by_id::<Dataset>(ctx, perm_id).map(Dataset::into_entity),
            EntityKind::Experiment => self
                .by_id::<Experiment>(ctx, perm_id)
                .map(Experiment::into_entity),
            EntityKind::DataSetFile => Err(MirrorError::UnsupportedKind(kind)),
        }
    }

    /// Every record of a kind, most recently modified first.
    pub fn all<E: EntityRecord>(&self, ctx: &ConnectionInfo) -> Result<Vec<E>, MirrorError> {
        let key = Self::cache_key(E::KIND, "");
        let request = QueryRequest::all(E::KIND);
        let records = self.records(ctx, Server::Application, E::KIND, &key, &request)?;
        let mut entities = self.parse_or_evict(&key, || parse_all::<E>(records))?;
        sort_newest_first(&mut entities);
        Ok(entities)
    }

    /// One batched query for a set of permIds, most recently modified first.
    ///
    /// Ids are deduplicated and sorted before joining so the cache key does
    /// not depend on caller ordering.
    pub fn by_ids<'a, E, I>(&self, ctx: &ConnectionInfo, ids: I) -> Result<Vec<E>, MirrorError>
    where
        E: EntityRecord,
        I: IntoIterator<Item = &'a PermId>,
    {
        let ids: BTreeSet<&str> = ids.into_iter().map(PermId::as_str).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids.into_iter().collect::<Vec<_>>().join(",");
        let key = Self::cache_key(E::KIND, &joined);
        let request = QueryRequest::by_perm_id(E::KIND, joined);
        let records = self.records(ctx, Server::Application, E::KIND, &key, &request)?;
        let mut entities = self.parse_or_evict(&key, || parse_all::<E>(records))?;
        sort_newest_first(&mut entities);
        Ok(entities)
    }

    /// File listing of one dataset, served by the datastore server.
    pub fn files(
        &self,
        ctx: &ConnectionInfo,
        dataset: &PermId,
    ) -> Result<Vec<DatasetFile>, MirrorError> {
        let kind = EntityKind::DataSetFile;
        let key = Self::datastore_cache_key(kind, dataset.as_str());
        let request = QueryRequest::by_perm_id(kind, dataset.as_str());
        let records = self.records(ctx, Server::Datastore, kind, &key, &request)?;
        self.parse_or_evict(&key, || {
            records
                .into_iter()
                .map(DatasetFile::from_json)
                .collect::<Result<Vec<_>, _>>()
        })
    }

    pub fn download(
        &self,
        ctx: &ConnectionInfo,
        file: &DatasetFile,
        destination: &Path,
    ) -> Result<u64, MirrorError> {
        let request = DownloadRequest {
            download_type: (if file.is_directory() { "folder" } else { "file" }).to_string(),
            perm_id: file.dataset_ref().clone(),
            source: file.path().to_string(),
        };
        tracing::info!(dataset = %file.dataset_ref(), path = file.path(), "downloading dataset file");
        self.client.download(ctx, &request, destination)
    }

    /// Drops the cached by-id query so the next fetch goes to openBIS.
    pub fn invalidate(&self, kind: EntityKind, perm_id: &PermId) -> Result<(), MirrorError> {
        self.cache.invalidate(&Self::cache_key(kind, perm_id.as_str()))
    }

    fn records(
        &self,
        ctx: &ConnectionInfo,
        server: Server,
        kind: EntityKind,
        key: &str,
        request: &QueryRequest,
    ) -> Result<Vec<Value>, MirrorError> {
        let payload = self.cache.fetch_or_compute(key, || {
            let payload = self.client.query(ctx, server, request)?;
            records_of(kind, &payload)?;
            Ok(payload)
        })?;
        match records_of(kind, &payload) {
            Ok(records) => Ok(records.to_vec()),
            Err(err) => {
                self.cache.invalidate(key)?;
                Err(err)
            }
        }
    }

    fn parse_or_evict<T, F>(&self, key: &str, parse: F) -> Result<T, MirrorError>
    where
        F: FnOnce() -> Result<T, MirrorError>,
    {
        parse().or_else(|err| {
            self.cache.invalidate(key)?;
            Err(err)
        })
    }
}

fn records_of(kind: EntityKind, payload: &Value) -> Result<&[Value], MirrorError> {
    payload
        .get(kind.json_key())
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or_else(|| {
            MirrorError::MalformedPayload(format!(
                "response has no `{}` array",
                kind.json_key()
            ))
        })
}

fn parse_all<E: EntityRecord>(records: Vec<Value>) -> Result<Vec<E>, MirrorError> {
    records.into_iter().map(E::from_json).collect()
}

fn sort_newest_first<E: EntityRecord>(entities: &mut [E]) {
    entities.sort_by(|a, b| b.modified_at().cmp(&a.modified_at()));
}
