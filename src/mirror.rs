use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{ErrorKind, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::ConnectionInfo;
use crate::domain::{ContainerId, EntityKind, LocalId, PermId};
use crate::entity::{Dataset, EntityRecord, Sample};
use crate::error::MirrorError;
use crate::openbis::QueryClient;
use crate::repository::EntityRepository;

const CATALOG_SCHEMA_VERSION: u32 = 1;

/// Local snapshot of one openBIS sample, attached to a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleMirror {
    pub(crate) local_id: LocalId,
    pub(crate) perm_id: PermId,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) last_synced_at: DateTime<Utc>,
    pub(crate) snapshot: Value,
    pub(crate) container: ContainerId,
    #[serde(default)]
    pub(crate) data_files: BTreeSet<LocalId>,
}

impl SampleMirror {
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    pub fn perm_id(&self) -> &PermId {
        &self.perm_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn last_synced_at(&self) -> DateTime<Utc> {
        self.last_synced_at
    }

    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Local data file records this sample is linked to.
    pub fn data_files(&self) -> &BTreeSet<LocalId> {
        &self.data_files
    }

    fn sync_from(&mut self, sample: &Sample, now: DateTime<Utc>) {
        self.title = sample.code().to_string();
        self.description = sample.comment().to_string();
        self.snapshot = sample.header().raw().clone();
        self.last_synced_at = now;
    }
}

/// Local file record derived from one openBIS dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileMirror {
    pub(crate) local_id: LocalId,
    pub(crate) perm_id: PermId,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) last_synced_at: DateTime<Utc>,
    pub(crate) snapshot: Value,
    pub(crate) container: ContainerId,
}

impl DataFileMirror {
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    /// PermId of the originating dataset.
    pub fn perm_id(&self) -> &PermId {
        &self.perm_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn last_synced_at(&self) -> DateTime<Utc> {
        self.last_synced_at
    }

    pub fn snapshot(&self) -> &Value {
        &self.snapshot
    }

    pub fn container(&self) -> &ContainerId {
        &self.container
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerWipe {
    pub samples: usize,
    pub data_files: usize,
}

/// Every locally persisted mirror record. Saved and loaded as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    schema_version: u32,
    next_id: u64,
    #[serde(default)]
    samples: BTreeMap<LocalId, SampleMirror>,
    #[serde(default)]
    data_files: BTreeMap<LocalId, DataFileMirror>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            schema_version: CATALOG_SCHEMA_VERSION,
            next_id: 1,
            samples: BTreeMap::new(),
            data_files: BTreeMap::new(),
        }
    }
}

impl Catalog {
    pub fn sample(&self, id: LocalId) -> Option<&SampleMirror> {
        self.samples.get(&id)
    }

    pub fn data_file(&self, id: LocalId) -> Option<&DataFileMirror> {
        self.data_files.get(&id)
    }

    pub fn samples(&self) -> impl Iterator<Item = &SampleMirror> {
        self.samples.values()
    }

    pub fn samples_in<'a>(
        &'a self,
        container: &'a ContainerId,
    ) -> impl Iterator<Item = &'a SampleMirror> + 'a {
        self.samples
            .values()
            .filter(move |mirror| &mirror.container == container)
    }

    pub fn data_files_in<'a>(
        &'a self,
        container: &'a ContainerId,
    ) -> impl Iterator<Item = &'a DataFileMirror> + 'a {
        self.data_files
            .values()
            .filter(move |file| &file.container == container)
    }

    pub fn samples_by_perm_id<'a>(
        &'a self,
        perm_id: &'a PermId,
    ) -> impl Iterator<Item = &'a SampleMirror> + 'a {
        self.samples
            .values()
            .filter(move |mirror| &mirror.perm_id == perm_id)
    }

    pub fn insert_sample(
        &mut self,
        sample: &Sample,
        container: &ContainerId,
        now: DateTime<Utc>,
    ) -> Result<SampleMirror, MirrorError> {
        if self
            .samples_in(container)
            .any(|mirror| &mirror.perm_id == sample.perm_id())
        {
            return Err(MirrorError::AlreadyMirrored {
                perm_id: sample.perm_id().to_string(),
                container: container.clone(),
            });
        }
        let local_id = self.allocate_id();
        let mirror = SampleMirror {
            local_id,
            perm_id: sample.perm_id().clone(),
            title: sample.code().to_string(),
            description: sample.comment().to_string(),
            last_synced_at: now,
            snapshot: sample.header().raw().clone(),
            container: container.clone(),
            data_files: BTreeSet::new(),
        };
        self.samples.insert(local_id, mirror.clone());
        Ok(mirror)
    }

    pub fn insert_data_file(
        &mut self,
        dataset: &Dataset,
        container: &ContainerId,
        now: DateTime<Utc>,
    ) -> Result<DataFileMirror, MirrorError> {
        if self
            .data_files_in(container)
            .any(|file| &file.perm_id == dataset.perm_id())
        {
            return Err(MirrorError::AlreadyMirrored {
                perm_id: dataset.perm_id().to_string(),
                container: container.clone(),
            });
        }
        let local_id = self.allocate_id();
        let file = DataFileMirror {
            local_id,
            perm_id: dataset.perm_id().clone(),
            title: dataset.code().to_string(),
            description: dataset.comment().to_string(),
            last_synced_at: now,
            snapshot: dataset.header().raw().clone(),
            container: container.clone(),
        };
        self.data_files.insert(local_id, file.clone());
        Ok(file)
    }

    /// Overwrites title, description and snapshot from a fresh fetch.
    pub fn resync_sample(
        &mut self,
        id: LocalId,
        sample: &Sample,
        now: DateTime<Utc>,
    ) -> Result<SampleMirror, MirrorError> {
        let mirror = self
            .samples
            .get_mut(&id)
            .ok_or(MirrorError::MirrorNotFound(id))?;
        if &mirror.perm_id != sample.perm_id() {
            return Err(MirrorError::EntityNotFound {
                kind: EntityKind::Sample,
                perm_id: mirror.perm_id.to_string(),
            });
        }
        mirror.sync_from(sample, now);
        Ok(mirror.clone())
    }

    /// Replaces the data file links of one sample mirror.
    pub fn link(&mut self, id: LocalId, files: &BTreeSet<LocalId>) -> Result<(), MirrorError> {
        if let Some(missing) = files.iter().find(|file| !self.data_files.contains_key(*file)) {
            return Err(MirrorError::MirrorNotFound(*missing));
        }
        let mirror = self
            .samples
            .get_mut(&id)
            .ok_or(MirrorError::MirrorNotFound(id))?;
        mirror.data_files = files.clone();
        Ok(())
    }

    pub fn remove_sample(&mut self, id: LocalId) -> Result<SampleMirror, MirrorError> {
        self.samples.remove(&id).ok_or(MirrorError::MirrorNotFound(id))
    }

    pub fn remove_container(&mut self, container: &ContainerId) -> ContainerWipe {
        let samples_before = self.samples.len();
        let files_before = self.data_files.len();
        self.samples.retain(|_, mirror| &mirror.container != container);
        self.data_files.retain(|_, file| &file.container != container);
        ContainerWipe {
            samples: samples_before - self.samples.len(),
            data_files: files_before - self.data_files.len(),
        }
    }

    fn allocate_id(&mut self) -> LocalId {
        let id = LocalId::new(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Durable storage for the [`Catalog`].
pub trait MirrorStore: Send + Sync {
    fn load(&self) -> Result<Catalog, MirrorError>;

    /// Replaces the stored catalog in one step; readers see either the old
    /// or the new catalog, never a mix.
    fn save(&self, catalog: &Catalog) -> Result<(), MirrorError>;
}

/// Catalog kept as one JSON document, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: Utf8PathBuf,
}

impl JsonStore {
    pub fn new() -> Result<Self, MirrorError> {
        let cwd =
            std::env::current_dir().map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".openbis-mirror"))
            .map_err(|_| MirrorError::Filesystem("invalid project path".to_string()))?;
        Ok(Self::new_with_root(&root))
    }

    pub fn new_with_root(root: &Utf8Path) -> Self {
        Self {
            path: root.join("catalog.json"),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl MirrorStore for JsonStore {
    fn load(&self) -> Result<Catalog, MirrorError> {
        let content = match fs::read_to_string(self.path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Catalog::default()),
            Err(err) => return Err(MirrorError::Filesystem(err.to_string())),
        };
        serde_json::from_str(&content).map_err(|err| {
            MirrorError::Filesystem(format!("corrupt catalog {}: {err}", self.path))
        })
    }

    fn save(&self, catalog: &Catalog) -> Result<(), MirrorError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| MirrorError::Filesystem("invalid catalog path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let content = serde_json::to_vec_pretty(catalog)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("openbis-mirror-catalog")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Import, refresh and destroy of sample mirrors.
pub struct Mirroring<'a, C: QueryClient, S: MirrorStore> {
    repo: &'a EntityRepository<C>,
    store: &'a S,
}

impl<'a, C: QueryClient, S: MirrorStore> Mirroring<'a, C, S> {
    pub fn new(repo: &'a EntityRepository<C>, store: &'a S) -> Self {
        Self { repo, store }
    }

    pub fn import_sample(
        &self,
        ctx: &ConnectionInfo,
        perm_id: &PermId,
        container: &ContainerId,
    ) -> Result<SampleMirror, MirrorError> {
        let sample = self.repo.by_id::<Sample>(ctx, perm_id)?;
        let mut catalog = self.store.load()?;
        let mirror = catalog.insert_sample(&sample, container, Utc::now())?;
        self.store.save(&catalog)?;
        tracing::info!(
            perm_id = %perm_id,
            local_id = %mirror.local_id,
            container = %container,
            "imported sample mirror"
        );
        Ok(mirror)
    }

    /// Re-fetches the sample from openBIS, bypassing the query cache.
    ///
    /// Nothing is written unless the fetch and the catalog update succeed.
    pub fn refresh(
        &self,
        ctx: &ConnectionInfo,
        id: LocalId,
    ) -> Result<SampleMirror, MirrorError> {
        let mut catalog = self.store.load()?;
        let perm_id = catalog
            .sample(id)
            .map(|mirror| mirror.perm_id.clone())
            .ok_or(MirrorError::MirrorNotFound(id))?;
        self.repo.invalidate(EntityKind::Sample, &perm_id)?;
        let sample = self.repo.by_id::<Sample>(ctx, &perm_id)?;
        let mirror = catalog.resync_sample(id, &sample, Utc::now())?;
        self.store.save(&catalog)?;
        tracing::info!(perm_id = %perm_id, local_id = %id, "refreshed sample mirror");
        Ok(mirror)
    }

    /// Whether openBIS reports a newer modification than the snapshot holds.
    ///
    /// Always asks openBIS; the cached by-id entry is dropped first.
    pub fn is_stale(&self, ctx: &ConnectionInfo, id: LocalId) -> Result<bool, MirrorError> {
        let catalog = self.store.load()?;
        let mirror = catalog.sample(id).ok_or(MirrorError::MirrorNotFound(id))?;
        let snapshot = Sample::from_json(mirror.snapshot.clone())?;
        self.repo.invalidate(EntityKind::Sample, &mirror.perm_id)?;
        let current = self.repo.by_id::<Sample>(ctx, &mirror.perm_id)?;
        Ok(current.modified_at() > snapshot.modified_at())
    }

    pub fn mirrors(&self, container: &ContainerId) -> Result<Vec<SampleMirror>, MirrorError> {
        let catalog = self.store.load()?;
        Ok(catalog.samples_in(container).cloned().collect())
    }

    pub fn destroy(&self, id: LocalId) -> Result<SampleMirror, MirrorError> {
        let mut catalog = self.store.load()?;
        let removed = catalog.remove_sample(id)?;
        self.store.save(&catalog)?;
        tracing::info!(local_id = %id, perm_id = %removed.perm_id, "destroyed sample mirror");
        Ok(removed)
    }

    /// Removes every sample mirror and data file record of a container.
    pub fn destroy_container(&self, container: &ContainerId) -> Result<ContainerWipe, MirrorError> {
        let mut catalog = self.store.load()?;
        let wiped = catalog.remove_container(container);
        self.store.save(&catalog)?;
        tracing::info!(
            container = %container,
            samples = wiped.samples,
            data_files = wiped.data_files,
            "wiped container mirrors"
        );
        Ok(wiped)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    fn sample(perm_id: &str, comment: Option<&str>) -> Sample {
        let mut properties = serde_json::Map::new();
        if let Some(comment) = comment {
            properties.insert("COMMENT".to_string(), json!(comment));
        }
        Sample::from_json(json!({
            "permId": perm_id,
            "code": format!("CODE-{perm_id}"),
            "properties": properties,
            "registrationDate": 1000,
            "modificationDate": 2000,
            "sampleType": {"code": "CELL"}
        }))
        .unwrap()
    }

    fn dataset(perm_id: &str) -> Dataset {
        Dataset::from_json(json!({
            "permId": perm_id,
            "code": format!("DS-{perm_id}"),
            "registrationDate": 1000,
            "modificationDate": 2000,
            "datasetType": {"code": "RAW"}
        }))
        .unwrap()
    }

    #[test]
    fn insert_sample_copies_entity_fields() {
        let mut catalog = Catalog::default();
        let container = ContainerId::new("assay-1");
        let now = Utc::now();
        let mirror = catalog
            .insert_sample(&sample("S1", Some("hello")), &container, now)
            .unwrap();
        assert_eq!(mirror.local_id(), LocalId::new(1));
        assert_eq!(mirror.title(), "CODE-S1");
        assert_eq!(mirror.description(), "hello");
        assert_eq!(mirror.snapshot()["permId"], "S1");
        assert_eq!(mirror.last_synced_at(), now);

        let without_comment = catalog
            .insert_sample(&sample("S2", None), &container, now)
            .unwrap();
        assert_eq!(without_comment.description(), "");
        assert_eq!(without_comment.local_id(), LocalId::new(2));
    }

    #[test]
    fn duplicate_mirror_in_container_rejected() {
        let mut catalog = Catalog::default();
        let container = ContainerId::new("assay-1");
        catalog
            .insert_sample(&sample("S1", None), &container, Utc::now())
            .unwrap();
        assert_matches!(
            catalog.insert_sample(&sample("S1", None), &container, Utc::now()),
            Err(MirrorError::AlreadyMirrored { .. })
        );
        let other = ContainerId::new("assay-2");
        assert!(catalog
            .insert_sample(&sample("S1", None), &other, Utc::now())
            .is_ok());
    }

    #[test]
    fn link_replaces_previous_links() {
        let mut catalog = Catalog::default();
        let container = ContainerId::new("assay-1");
        let mirror = catalog
            .insert_sample(&sample("S1", None), &container, Utc::now())
            .unwrap();
        let file = catalog
            .insert_data_file(&dataset("D1"), &container, Utc::now())
            .unwrap();
        catalog
            .link(mirror.local_id(), &BTreeSet::from([file.local_id()]))
            .unwrap();
        assert_eq!(
            catalog.sample(mirror.local_id()).unwrap().data_files().len(),
            1
        );

        catalog.link(mirror.local_id(), &BTreeSet::new()).unwrap();
        assert!(catalog
            .sample(mirror.local_id())
            .unwrap()
            .data_files()
            .is_empty());
    }

    #[test]
    fn link_rejects_unknown_file() {
        let mut catalog = Catalog::default();
        let container = ContainerId::new("assay-1");
        let mirror = catalog
            .insert_sample(&sample("S1", None), &container, Utc::now())
            .unwrap();
        assert_matches!(
            catalog.link(mirror.local_id(), &BTreeSet::from([LocalId::new(99)])),
            Err(MirrorError::MirrorNotFound(_))
        );
    }

    #[test]
    fn json_store_round_trips_catalog() {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join(".openbis-mirror")).unwrap();
        let store = JsonStore::new_with_root(&root);
        assert_eq!(store.load().unwrap(), Catalog::default());

        let mut catalog = Catalog::default();
        catalog
            .insert_sample(&sample("S1", Some("c")), &ContainerId::new("a"), Utc::now())
            .unwrap();
        store.save(&catalog).unwrap();
        assert_eq!(store.load().unwrap(), catalog);
    }
}
