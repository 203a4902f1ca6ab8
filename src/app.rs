use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::connection::ConnectionInfo;
use crate::domain::{ContainerId, EntityKind, LocalId, PermId};
use crate::entity::{Dataset, DatasetFile, Entity, EntityRecord, Experiment, Sample};
use crate::error::MirrorError;
use crate::mirror::{ContainerWipe, DataFileMirror, MirrorStore, Mirroring, SampleMirror};
use crate::openbis::QueryClient;
use crate::reconcile::{ImportReconciler, ImportReport, ImportRequest};
use crate::repository::EntityRepository;

#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub kind: EntityKind,
    pub perm_id: String,
    pub code: String,
    pub type_text: String,
    pub modified_at: DateTime<Utc>,
    pub comment: String,
}

impl From<&Entity> for EntitySummary {
    fn from(entity: &Entity) -> Self {
        let header = entity.header();
        Self {
            kind: entity.kind(),
            perm_id: header.perm_id().to_string(),
            code: header.code().to_string(),
            type_text: entity.type_text().to_string(),
            modified_at: header.modified_at(),
            comment: header.comment().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Related {
    pub experiment: Option<EntitySummary>,
    pub samples: Vec<EntitySummary>,
    pub datasets: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowResult {
    pub entity: Entity,
    pub related: Option<Related>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub kind: EntityKind,
    pub entities: Vec<EntitySummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesResult {
    pub dataset: String,
    pub files: Vec<DatasetFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub dataset: String,
    pub path: String,
    pub destination: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorsResult {
    pub container: ContainerId,
    pub samples: Vec<SampleMirror>,
    pub data_files: Vec<DataFileMirror>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleResult {
    pub local_id: LocalId,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: QueryClient, S: MirrorStore> {
    repo: EntityRepository<C>,
    store: S,
}

impl<C: QueryClient, S: MirrorStore> App<C, S> {
    pub fn new(repo: EntityRepository<C>, store: S) -> Self {
        Self { repo, store }
    }

    pub fn repository(&self) -> &EntityRepository<C> {
        &self.repo
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn show(
        &self,
        ctx: &ConnectionInfo,
        kind: EntityKind,
        perm_id: &PermId,
        with_related: bool,
        sink: &dyn ProgressSink,
    ) -> Result<ShowResult, MirrorError> {
        emit(sink, format!("phase=Resolve; {kind} {perm_id}"));
        let start = std::time::Instant::now();
        let entity = self.repo.fetch(ctx, kind, perm_id)?;
        sink.event(ProgressEvent {
            message: "openbis.response".to_string(),
            elapsed: Some(start.elapsed()),
        });

        let related = if with_related {
            emit(sink, "phase=Related; resolving references".to_string());
            Some(self.related(ctx, &entity)?)
        } else {
            None
        };
        Ok(ShowResult { entity, related })
    }

    /// All records of a kind, most recently modified first.
    pub fn list(
        &self,
        ctx: &ConnectionInfo,
        kind: EntityKind,
        sink: &dyn ProgressSink,
    ) -> Result<ListResult, MirrorError> {
        emit(sink, format!("phase=Resolve; listing {kind}"));
        let entities = match kind {
            EntityKind::Sample => summarize(self.repo.all::<Sample>(ctx)?),
            EntityKind::DataSet => summarize(self.repo.all::<Dataset>(ctx)?),
            EntityKind::Experiment => summarize(self.repo.all::<Experiment>(ctx)?),
            EntityKind::DataSetFile => return Err(MirrorError::UnsupportedKind(kind)),
        };
        Ok(ListResult { kind, entities })
    }

    pub fn files(
        &self,
        ctx: &ConnectionInfo,
        dataset: &PermId,
        sink: &dyn ProgressSink,
    ) -> Result<FilesResult, MirrorError> {
        emit(sink, format!("phase=Resolve; files of {dataset}"));
        let files = self.repo.files(ctx, dataset)?;
        Ok(FilesResult {
            dataset: dataset.to_string(),
            files,
        })
    }

    pub fn download(
        &self,
        ctx: &ConnectionInfo,
        dataset: &PermId,
        path: &str,
        destination: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, MirrorError> {
        emit(sink, format!("phase=Resolve; {dataset}:{path}"));
        let file = self
            .repo
            .files(ctx, dataset)?
            .into_iter()
            .find(|file| file.path() == path)
            .ok_or_else(|| MirrorError::EntityNotFound {
                kind: EntityKind::DataSetFile,
                perm_id: format!("{dataset}:{path}"),
            })?;
        emit(sink, "phase=Download; streaming file".to_string());
        let start = std::time::Instant::now();
        let bytes = self.repo.download(ctx, &file, destination)?;
        sink.event(ProgressEvent {
            message: format!("openbis.download bytes={bytes}"),
            elapsed: Some(start.elapsed()),
        });
        Ok(DownloadResult {
            dataset: dataset.to_string(),
            path: path.to_string(),
            destination: destination.display().to_string(),
            bytes,
        })
    }

    pub fn import(
        &self,
        ctx: &ConnectionInfo,
        container: &ContainerId,
        request: &ImportRequest,
        sink: &dyn ProgressSink,
    ) -> Result<ImportReport, MirrorError> {
        emit(
            sink,
            format!(
                "phase=Import; datasets={} samples={}",
                request.datasets.len(),
                request.samples.len()
            ),
        );
        let report = ImportReconciler::new(&self.repo, &self.store).import(ctx, container, request)?;
        emit(
            sink,
            format!(
                "phase=Store; files={} samples={} links={} skipped={}",
                report.files.len(),
                report.mirrors.len(),
                report.links,
                report.skipped.len()
            ),
        );
        Ok(report)
    }

    pub fn refresh(
        &self,
        ctx: &ConnectionInfo,
        id: LocalId,
        sink: &dyn ProgressSink,
    ) -> Result<SampleMirror, MirrorError> {
        emit(sink, format!("phase=Refresh; mirror {id}"));
        Mirroring::new(&self.repo, &self.store).refresh(ctx, id)
    }

    pub fn check(
        &self,
        ctx: &ConnectionInfo,
        id: LocalId,
        sink: &dyn ProgressSink,
    ) -> Result<StaleResult, MirrorError> {
        emit(sink, format!("phase=Resolve; checking mirror {id}"));
        let stale = Mirroring::new(&self.repo, &self.store).is_stale(ctx, id)?;
        Ok(StaleResult {
            local_id: id,
            stale,
        })
    }

    pub fn destroy(&self, id: LocalId, sink: &dyn ProgressSink) -> Result<SampleMirror, MirrorError> {
        emit(sink, format!("phase=Store; destroying mirror {id}"));
        Mirroring::new(&self.repo, &self.store).destroy(id)
    }

    pub fn wipe(
        &self,
        container: &ContainerId,
        sink: &dyn ProgressSink,
    ) -> Result<ContainerWipe, MirrorError> {
        emit(sink, format!("phase=Store; wiping container {container}"));
        Mirroring::new(&self.repo, &self.store).destroy_container(container)
    }

    pub fn mirrors(&self, container: &ContainerId) -> Result<MirrorsResult, MirrorError> {
        let catalog = self.store.load()?;
        Ok(MirrorsResult {
            container: container.clone(),
            samples: catalog.samples_in(container).cloned().collect(),
            data_files: catalog.data_files_in(container).cloned().collect(),
        })
    }

    pub fn clear_cache(&self, sink: &dyn ProgressSink) -> Result<ClearResult, MirrorError> {
        emit(sink, "phase=Cache; clearing query cache".to_string());
        self.repo.cache().invalidate_all()?;
        Ok(ClearResult { cleared: true })
    }

    fn related(&self, ctx: &ConnectionInfo, entity: &Entity) -> Result<Related, MirrorError> {
        let related = match entity {
            Entity::Sample(sample) => Related {
                experiment: sample
                    .experiment(&self.repo, ctx)?
                    .map(summary),
                samples: Vec::new(),
                datasets: summarize(sample.datasets(&self.repo, ctx)?),
            },
            Entity::Dataset(dataset) => Related {
                experiment: dataset
                    .experiment(&self.repo, ctx)?
                    .map(summary),
                samples: summarize(dataset.samples(&self.repo, ctx)?),
                datasets: Vec::new(),
            },
            Entity::Experiment(experiment) => Related {
                experiment: None,
                samples: summarize(experiment.samples(&self.repo, ctx)?),
                datasets: summarize(experiment.datasets(&self.repo, ctx)?),
            },
        };
        Ok(related)
    }
}

fn emit(sink: &dyn ProgressSink, message: String) {
    sink.event(ProgressEvent {
        message,
        elapsed: None,
    });
}

fn summary<E: EntityRecord>(entity: E) -> EntitySummary {
    EntitySummary::from(&entity.into_entity())
}

fn summarize<E: EntityRecord>(entities: Vec<E>) -> Vec<EntitySummary> {
    entities.into_iter().map(summary).collect()
}
