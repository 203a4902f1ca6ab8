//! Bulk import of datasets and samples into a container, and the link step
//! that attaches each sample mirror to the imported files of its datasets.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::Serialize;

use crate::connection::ConnectionInfo;
use crate::domain::{ContainerId, EntityKind, LocalId, PermId};
use crate::entity::{Dataset, Sample};
use crate::error::MirrorError;
use crate::mirror::{DataFileMirror, MirrorStore, SampleMirror};
use crate::openbis::QueryClient;
use crate::repository::EntityRepository;

/// One batch entity that was left out of an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationSkip {
    pub kind: EntityKind,
    pub perm_id: String,
    pub reason: String,
}

impl ReconciliationSkip {
    fn new(kind: EntityKind, perm_id: &PermId, err: &MirrorError) -> Self {
        tracing::warn!(kind = %kind, perm_id = %perm_id, error = %err, "skipping batch entity");
        Self {
            kind,
            perm_id: perm_id.to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub files: Vec<DataFileMirror>,
    pub mirrors: Vec<SampleMirror>,
    pub skipped: Vec<ReconciliationSkip>,
}

impl Reconciliation {
    pub fn link_count(&self) -> usize {
        self.mirrors.iter().map(|mirror| mirror.data_files.len()).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
    pub datasets: Vec<PermId>,
    pub samples: Vec<PermId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub container: ContainerId,
    pub files: Vec<DataFileMirror>,
    pub mirrors: Vec<SampleMirror>,
    pub links: usize,
    pub skipped: Vec<ReconciliationSkip>,
}

pub struct ImportReconciler<'a, C: QueryClient, S: MirrorStore> {
    repo: &'a EntityRepository<C>,
    store: &'a S,
}

impl<'a, C: QueryClient, S: MirrorStore> ImportReconciler<'a, C, S> {
    pub fn new(repo: &'a EntityRepository<C>, store: &'a S) -> Self {
        Self { repo, store }
    }

    /// Sets each mirror's links to exactly the files whose dataset the
    /// sample references. Mirrors whose sample cannot be fetched are
    /// dropped and reported as skipped; files pass through unchanged.
    pub fn link(
        &self,
        ctx: &ConnectionInfo,
        files: Vec<DataFileMirror>,
        mirrors: Vec<SampleMirror>,
    ) -> Reconciliation {
        let mut by_dataset: BTreeMap<&PermId, BTreeSet<LocalId>> = BTreeMap::new();
        for file in &files {
            by_dataset
                .entry(&file.perm_id)
                .or_default()
                .insert(file.local_id);
        }

        let mut linked = Vec::with_capacity(mirrors.len());
        let mut skipped = Vec::new();
        for mut mirror in mirrors {
            match self.repo.by_id::<Sample>(ctx, &mirror.perm_id) {
                Ok(sample) => {
                    mirror.data_files = sample
                        .dataset_refs()
                        .iter()
                        .filter_map(|dataset| by_dataset.get(dataset))
                        .flatten()
                        .copied()
                        .collect();
                    linked.push(mirror);
                }
                Err(err) => {
                    skipped.push(ReconciliationSkip::new(
                        EntityKind::Sample,
                        &mirror.perm_id,
                        &err,
                    ));
                }
            }
        }

        Reconciliation {
            files,
            mirrors: linked,
            skipped,
        }
    }

    /// Imports datasets as data files and samples as mirrors, links them,
    /// and commits the whole batch in one store write.
    ///
    /// A dataset or sample that fails to fetch or insert is skipped; the
    /// rest of the batch proceeds. Only a failing load or save of the
    /// catalog fails the call, in which case nothing is stored.
    pub fn import(
        &self,
        ctx: &ConnectionInfo,
        container: &ContainerId,
        request: &ImportRequest,
    ) -> Result<ImportReport, MirrorError> {
        let mut catalog = self.store.load()?;
        let now = Utc::now();
        let mut skipped = Vec::new();

        let mut files = Vec::new();
        for perm_id in unique(&request.datasets) {
            let staged = self
                .repo
                .by_id::<Dataset>(ctx, perm_id)
                .and_then(|dataset| catalog.insert_data_file(&dataset, container, now));
            match staged {
                Ok(file) => files.push(file),
                Err(err) => skipped.push(ReconciliationSkip::new(EntityKind::DataSet, perm_id, &err)),
            }
        }

        let mut mirrors = Vec::new();
        for perm_id in unique(&request.samples) {
            let staged = self
                .repo
                .by_id::<Sample>(ctx, perm_id)
                .and_then(|sample| catalog.insert_sample(&sample, container, now));
            match staged {
                Ok(mirror) => mirrors.push(mirror),
                Err(err) => skipped.push(ReconciliationSkip::new(EntityKind::Sample, perm_id, &err)),
            }
        }

        let staged_ids: Vec<LocalId> = mirrors.iter().map(SampleMirror::local_id).collect();
        let mut reconciliation = self.link(ctx, files, mirrors);
        let kept: BTreeSet<LocalId> = reconciliation
            .mirrors
            .iter()
            .map(SampleMirror::local_id)
            .collect();
        for id in staged_ids.into_iter().filter(|id| !kept.contains(id)) {
            catalog.remove_sample(id)?;
        }
        for mirror in &reconciliation.mirrors {
            catalog.link(mirror.local_id, &mirror.data_files)?;
        }

        self.store.save(&catalog)?;

        skipped.append(&mut reconciliation.skipped);
        let links = reconciliation.link_count();
        tracing::info!(
            container = %container,
            files = reconciliation.files.len(),
            samples = reconciliation.mirrors.len(),
            links,
            skipped = skipped.len(),
            "import committed"
        );
        Ok(ImportReport {
            container: container.clone(),
            files: reconciliation.files,
            mirrors: reconciliation.mirrors,
            links,
            skipped,
        })
    }
}

fn unique(ids: &[PermId]) -> impl Iterator<Item = &PermId> {
    let mut seen = BTreeSet::new();
    ids.iter().filter(move |id| seen.insert(*id))
}
