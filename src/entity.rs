//! Typed views over openBIS query records.
//!
//! Entities are rebuilt from JSON on every fetch and compare equal by kind
//! and permId only. Relationships are kept as permId sets; the resolver
//! methods go through [`EntityRepository`] on each call, and callers that
//! want to reuse a resolved collection wrap it in a [`Memo`].

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::connection::ConnectionInfo;
use crate::domain::{EntityKind, PermId};
use crate::error::MirrorError;
use crate::openbis::QueryClient;
use crate::repository::EntityRepository;

const COMMENT_PROPERTY: &str = "COMMENT";

/// Fields shared by every entity kind.
#[derive(Debug, Clone, Serialize)]
pub struct EntityHeader {
    perm_id: PermId,
    code: String,
    properties: BTreeMap<String, String>,
    registered_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    registrator: Option<String>,
    modifier: Option<String>,
    #[serde(skip)]
    raw: Value,
}

impl EntityHeader {
    pub fn perm_id(&self) -> &PermId {
        &self.perm_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Free-text `COMMENT` property, empty when absent.
    pub fn comment(&self) -> &str {
        self.property(COMMENT_PROPERTY).unwrap_or("")
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn registrator(&self) -> Option<&str> {
        self.registrator.as_deref()
    }

    pub fn modifier(&self) -> Option<&str> {
        self.modifier.as_deref()
    }

    /// The record exactly as openBIS returned it.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl TypeInfo {
    /// Description for display, or the code when the description is blank.
    pub fn text(&self) -> &str {
        match self.description.as_deref() {
            Some(description) if !description.trim().is_empty() => description,
            _ => &self.code,
        }
    }
}

/// A kind of record that can be parsed out of a query response.
pub trait EntityRecord: Sized + Send + Sync {
    const KIND: EntityKind;

    fn from_json(raw: Value) -> Result<Self, MirrorError>;

    fn header(&self) -> &EntityHeader;

    fn into_entity(self) -> Entity;

    fn perm_id(&self) -> &PermId {
        self.header().perm_id()
    }

    fn code(&self) -> &str {
        self.header().code()
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.header().modified_at()
    }

    fn comment(&self) -> &str {
        self.header().comment()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    #[serde(flatten)]
    header: EntityHeader,
    sample_type: TypeInfo,
    experiment: Option<PermId>,
    datasets: BTreeSet<PermId>,
}

impl Sample {
    pub fn sample_type(&self) -> &TypeInfo {
        &self.sample_type
    }

    pub fn experiment_ref(&self) -> Option<&PermId> {
        self.experiment.as_ref()
    }

    pub fn dataset_refs(&self) -> &BTreeSet<PermId> {
        &self.datasets
    }

    pub fn experiment<C: QueryClient>(
        &self,
        repo: &EntityRepository<C>,
        ctx: &ConnectionInfo,
    ) -> Result<Option<Experiment>, MirrorError> {
        self.experiment
            .as_ref()
            .map(|id| repo.by_id::<Experiment>(ctx, id))
            .transpose()
    }

    pub fn datasets<C: QueryClient>(
        &self,
        repo: &EntityRepository<C>,
        ctx: &ConnectionInfo,
    ) -> Result<Vec<Dataset>, MirrorError> {
        repo.by_ids(ctx, &self.datasets)
    }
}

impl EntityRecord for Sample {
    const KIND: EntityKind = EntityKind::Sample;

    fn from_json(raw: Value) -> Result<Self, MirrorError> {
        let record: RawSample = parse_record(Self::KIND, &raw)?;
        Ok(Self {
            header: record.header.into_header(raw)?,
            sample_type: record.sample_type,
            experiment: record.experiment,
            datasets: record.datasets.into_iter().collect(),
        })
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn into_entity(self) -> Entity {
        Entity::Sample(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    #[serde(flatten)]
    header: EntityHeader,
    dataset_type: TypeInfo,
    experiment: Option<PermId>,
    samples: BTreeSet<PermId>,
}

impl Dataset {
    pub fn dataset_type(&self) -> &TypeInfo {
        &self.dataset_type
    }

    pub fn experiment_ref(&self) -> Option<&PermId> {
        self.experiment.as_ref()
    }

    pub fn sample_refs(&self) -> &BTreeSet<PermId> {
        &self.samples
    }

    pub fn experiment<C: QueryClient>(
        &self,
        repo: &EntityRepository<C>,
        ctx: &ConnectionInfo,
    ) -> Result<Option<Experiment>, MirrorError> {
        self.experiment
            .as_ref()
            .map(|id| repo.by_id::<Experiment>(ctx, id))
            .transpose()
    }

    pub fn samples<C: QueryClient>(
        &self,
        repo: &EntityRepository<C>,
        ctx: &ConnectionInfo,
    ) -> Result<Vec<Sample>, MirrorError> {
        repo.by_ids(ctx, &self.samples)
    }

    /// File listing from the datastore server.
    pub fn files<C: QueryClient>(
        &self,
        repo: &EntityRepository<C>,
        ctx: &ConnectionInfo,
    ) -> Result<Vec<DatasetFile>, MirrorError> {
        repo.files(ctx, self.perm_id())
    }
}

impl EntityRecord for Dataset {
    const KIND: EntityKind = EntityKind::DataSet;

    fn from_json(raw: Value) -> Result<Self, MirrorError> {
        let record: RawDataset = parse_record(Self::KIND, &raw)?;
        Ok(Self {
            header: record.header.into_header(raw)?,
            dataset_type: record.dataset_type,
            experiment: record.experiment,
            samples: record.samples.into_set(),
        })
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn into_entity(self) -> Entity {
        Entity::Dataset(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Experiment {
    #[serde(flatten)]
    header: EntityHeader,
    experiment_type: TypeInfo,
    datasets: BTreeSet<PermId>,
    samples: BTreeSet<PermId>,
}

impl Experiment {
    pub fn experiment_type(&self) -> &TypeInfo {
        &self.experiment_type
    }

    pub fn dataset_refs(&self) -> &BTreeSet<PermId> {
        &self.datasets
    }

    pub fn sample_refs(&self) -> &BTreeSet<PermId> {
        &self.samples
    }

    pub fn datasets<C: QueryClient>(
        &self,
        repo: &EntityRepository<C>,
        ctx: &ConnectionInfo,
    ) -> Result<Vec<Dataset>, MirrorError> {
        repo.by_ids(ctx, &self.datasets)
    }

    pub fn samples<C: QueryClient>(
        &self,
        repo: &EntityRepository<C>,
        ctx: &ConnectionInfo,
    ) -> Result<Vec<Sample>, MirrorError> {
        repo.by_ids(ctx, &self.samples)
    }
}

impl EntityRecord for Experiment {
    const KIND: EntityKind = EntityKind::Experiment;

    fn from_json(raw: Value) -> Result<Self, MirrorError> {
        let record: RawExperiment = parse_record(Self::KIND, &raw)?;
        Ok(Self {
            header: record.header.into_header(raw)?,
            experiment_type: record.experiment_type,
            datasets: record.datasets.into_iter().collect(),
            samples: record.samples.into_iter().collect(),
        })
    }

    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn into_entity(self) -> Entity {
        Entity::Experiment(self)
    }
}

macro_rules! identity_by_perm_id {
    ($($ty:ty),*) => {
        $(
            impl PartialEq for $ty {
                fn eq(&self, other: &Self) -> bool {
                    self.perm_id() == other.perm_id()
                }
            }

            impl Eq for $ty {}

            impl Hash for $ty {
                fn hash<H: Hasher>(&self, state: &mut H) {
                    self.perm_id().hash(state);
                }
            }
        )*
    };
}

identity_by_perm_id!(Sample, Dataset, Experiment);

/// Any record that can be fetched by permId.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Sample(Sample),
    Dataset(Dataset),
    Experiment(Experiment),
}

impl Entity {
    pub fn from_json(kind: EntityKind, raw: Value) -> Result<Self, MirrorError> {
        match kind {
            EntityKind::Sample => Sample::from_json(raw).map(Entity::Sample),
            EntityKind::DataSet => Dataset::from_json(raw).map(Entity::Dataset),
            EntityKind::Experiment => Experiment::from_json(raw).map(Entity::Experiment),
            EntityKind::DataSetFile => Err(MirrorError::UnsupportedKind(kind)),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Sample(_) => EntityKind::Sample,
            Entity::Dataset(_) => EntityKind::DataSet,
            Entity::Experiment(_) => EntityKind::Experiment,
        }
    }

    pub fn header(&self) -> &EntityHeader {
        match self {
            Entity::Sample(sample) => sample.header(),
            Entity::Dataset(dataset) => dataset.header(),
            Entity::Experiment(experiment) => experiment.header(),
        }
    }

    pub fn perm_id(&self) -> &PermId {
        self.header().perm_id()
    }

    /// Display text of the kind-specific type.
    pub fn type_text(&self) -> &str {
        match self {
            Entity::Sample(sample) => sample.sample_type().text(),
            Entity::Dataset(dataset) => dataset.dataset_type().text(),
            Entity::Experiment(experiment) => experiment.experiment_type().text(),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.perm_id() == other.perm_id()
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.perm_id().hash(state);
    }
}

/// One entry of a dataset's file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetFile {
    file_id: String,
    path: String,
    size_bytes: u64,
    is_directory: bool,
    dataset: PermId,
    #[serde(skip)]
    raw: Value,
}

impl DatasetFile {
    pub fn from_json(raw: Value) -> Result<Self, MirrorError> {
        let record: RawDatasetFile = parse_record(EntityKind::DataSetFile, &raw)?;
        Ok(Self {
            file_id: record.file_id,
            path: record.path,
            size_bytes: record.file_length,
            is_directory: record.is_directory,
            dataset: record.dataset,
            raw,
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn dataset_ref(&self) -> &PermId {
        &self.dataset
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// Caller-held memoization for a resolved relationship.
///
/// Entities stay plain values; whoever wants to reuse a resolution keeps a
/// `Memo` next to the entity for as long as it likes.
pub struct Memo<T> {
    cell: OnceCell<Arc<T>>,
}

impl<T> Memo<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Runs `init` on the first call only; a failed `init` leaves the memo
    /// empty so the next call tries again.
    pub fn get_or_try_init<F>(&self, init: F) -> Result<Arc<T>, MirrorError>
    where
        F: FnOnce() -> Result<T, MirrorError>,
    {
        self.cell
            .get_or_try_init(|| init().map(Arc::new))
            .map(Arc::clone)
    }

    pub fn reset(&mut self) {
        self.cell.take();
    }
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeader {
    perm_id: PermId,
    code: String,
    #[serde(default)]
    properties: BTreeMap<String, Value>,
    registration_date: i64,
    modification_date: i64,
    #[serde(default, alias = "registrator")]
    registerator: Option<Value>,
    #[serde(default)]
    modifier: Option<Value>,
}

impl RawHeader {
    fn into_header(self, raw: Value) -> Result<EntityHeader, MirrorError> {
        let properties = self
            .properties
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(text) => Some((key, text)),
                other => Some((key, other.to_string())),
            })
            .collect();
        Ok(EntityHeader {
            registered_at: millis_to_datetime(self.registration_date, "registrationDate")?,
            modified_at: millis_to_datetime(self.modification_date, "modificationDate")?,
            registrator: self.registerator.as_ref().and_then(user_name),
            modifier: self.modifier.as_ref().and_then(user_name),
            perm_id: self.perm_id,
            code: self.code,
            properties,
            raw,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSample {
    #[serde(flatten)]
    header: RawHeader,
    #[serde(alias = "sample_type")]
    sample_type: TypeInfo,
    #[serde(default, deserialize_with = "optional_ref")]
    experiment: Option<PermId>,
    #[serde(default)]
    datasets: Vec<PermId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDataset {
    #[serde(flatten)]
    header: RawHeader,
    #[serde(alias = "dataSetType", alias = "dataset_type")]
    dataset_type: TypeInfo,
    #[serde(default, deserialize_with = "optional_ref")]
    experiment: Option<PermId>,
    #[serde(default)]
    samples: RefGroups,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExperiment {
    #[serde(flatten)]
    header: RawHeader,
    #[serde(alias = "experiment_type")]
    experiment_type: TypeInfo,
    #[serde(default)]
    datasets: Vec<PermId>,
    #[serde(default)]
    samples: Vec<PermId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDatasetFile {
    #[serde(alias = "filePermId", alias = "file_id")]
    file_id: String,
    path: String,
    #[serde(default, alias = "is_directory")]
    is_directory: bool,
    #[serde(default, alias = "file_length")]
    file_length: u64,
    #[serde(rename = "datasetPermId", alias = "dataSetPermId", alias = "dataset_id")]
    dataset: PermId,
}

/// Dataset sample references arrive either flat or grouped; when grouped the
/// last group is the current one.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RefGroups {
    Flat(Vec<PermId>),
    Grouped(Vec<Vec<PermId>>),
}

impl Default for RefGroups {
    fn default() -> Self {
        RefGroups::Flat(Vec::new())
    }
}

impl RefGroups {
    fn into_set(self) -> BTreeSet<PermId> {
        match self {
            RefGroups::Flat(ids) => ids.into_iter().collect(),
            RefGroups::Grouped(groups) => groups
                .into_iter()
                .next_back()
                .unwrap_or_default()
                .into_iter()
                .collect(),
        }
    }
}

fn optional_ref<'de, D>(deserializer: D) -> Result<Option<PermId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    match value {
        Some(text) if !text.trim().is_empty() => text
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn parse_record<T>(kind: EntityKind, raw: &Value) -> Result<T, MirrorError>
where
    T: for<'de> Deserialize<'de>,
{
    T::deserialize(raw).map_err(|err| MirrorError::MalformedPayload(format!("{kind} record: {err}")))
}

fn millis_to_datetime(millis: i64, field: &str) -> Result<DateTime<Utc>, MirrorError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| MirrorError::MalformedPayload(format!("{field} out of range: {millis}")))
}

fn user_name(value: &Value) -> Option<String> {
    match value {
        Value::String(name) => Some(name.clone()),
        Value::Object(map) => map
            .get("userId")
            .or_else(|| map.get("email"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
