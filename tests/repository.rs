mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;

use openbis_mirror::cache::{DiskCache, QueryCache};
use openbis_mirror::domain::{EntityKind, PermId};
use openbis_mirror::entity::{Dataset, EntityRecord, Experiment, Sample};
use openbis_mirror::error::MirrorError;
use openbis_mirror::openbis::{QueryType, Server};
use openbis_mirror::repository::EntityRepository;

use common::{MockOpenbis, ctx, dataset, experiment, file, sample};

fn id(value: &str) -> PermId {
    value.parse().unwrap()
}

fn repo(mock: MockOpenbis) -> EntityRepository<MockOpenbis> {
    EntityRepository::new(mock, QueryCache::in_memory())
}

#[test]
fn repeated_lookup_hits_cache() {
    let repo = repo(MockOpenbis::with(vec![(
        EntityKind::Sample,
        sample("S1", 1000, &[], "first"),
    )]));

    let first = repo.by_id::<Sample>(&ctx(), &id("S1")).unwrap();
    let second = repo.by_id::<Sample>(&ctx(), &id("S1")).unwrap();

    assert_eq!(first, second);
    assert_eq!(second.comment(), "first");
    assert_eq!(repo.client().calls(), 1);
}

#[test]
fn not_found_is_not_cached() {
    let repo = repo(MockOpenbis::default());

    let missing = repo.by_id::<Sample>(&ctx(), &id("S9"));
    assert_matches!(
        missing,
        Err(MirrorError::EntityNotFound { kind: EntityKind::Sample, ref perm_id }) if perm_id == "S9"
    );

    repo.client().put(EntityKind::Sample, sample("S9", 1000, &[], ""));
    let found = repo.by_id::<Sample>(&ctx(), &id("S9")).unwrap();
    assert_eq!(found.perm_id().as_str(), "S9");
    assert_eq!(repo.client().calls(), 2);
}

#[test]
fn batch_key_ignores_order_and_duplicates() {
    let repo = repo(MockOpenbis::with(vec![
        (EntityKind::Sample, sample("a", 1000, &[], "")),
        (EntityKind::Sample, sample("b", 2000, &[], "")),
    ]));

    let first = repo
        .by_ids::<Sample, _>(&ctx(), &[id("b"), id("a")])
        .unwrap();
    let second = repo
        .by_ids::<Sample, _>(&ctx(), &[id("a"), id("b"), id("a")])
        .unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
    assert_eq!(repo.client().calls(), 1);
    let requests = repo.client().requests();
    assert_eq!(requests[0].1.attribute_value, "a,b");
    assert_eq!(requests[0].1.query_type, QueryType::Attribute);
}

#[test]
fn empty_batch_issues_no_query() {
    let repo = repo(MockOpenbis::default());
    let none: Vec<PermId> = Vec::new();
    let result = repo.by_ids::<Dataset, _>(&ctx(), &none).unwrap();
    assert!(result.is_empty());
    assert_eq!(repo.client().calls(), 0);
}

#[test]
fn batch_results_are_newest_first() {
    let repo = repo(MockOpenbis::with(vec![
        (EntityKind::Sample, sample("S1", 100_000, &[], "")),
        (EntityKind::Sample, sample("S2", 300_000, &[], "")),
        (EntityKind::Sample, sample("S3", 200_000, &[], "")),
    ]));

    let samples = repo
        .by_ids::<Sample, _>(&ctx(), &[id("S1"), id("S2"), id("S3")])
        .unwrap();
    let stamps: Vec<i64> = samples.iter().map(|s| s.modified_at().timestamp()).collect();
    assert_eq!(stamps, vec![300, 200, 100]);
}

#[test]
fn all_orders_by_millisecond_modification() {
    let repo = repo(MockOpenbis::with(vec![
        (EntityKind::DataSet, dataset("D100", 100, &[])),
        (EntityKind::DataSet, dataset("D300", 300, &[])),
        (EntityKind::DataSet, dataset("D200", 200, &[])),
    ]));

    let datasets = repo.all::<Dataset>(&ctx()).unwrap();
    let stamps: Vec<i64> = datasets
        .iter()
        .map(|d| d.modified_at().timestamp_millis())
        .collect();
    assert_eq!(stamps, vec![300, 200, 100]);
}

#[test]
fn list_all_experiments_newest_first() {
    let repo = repo(MockOpenbis::with(vec![
        (EntityKind::Experiment, experiment("E1", 5_000, &[], &[])),
        (EntityKind::Experiment, experiment("E2", 9_000, &[], &[])),
    ]));

    let experiments = repo.all::<Experiment>(&ctx()).unwrap();
    let ids: Vec<_> = experiments.iter().map(|e| e.perm_id().as_str()).collect();
    assert_eq!(ids, vec!["E2", "E1"]);
    assert_eq!(repo.client().requests()[0].1.query_type, QueryType::All);
}

#[test]
fn malformed_payload_is_not_cached() {
    let mock = MockOpenbis::with(vec![(EntityKind::Sample, sample("S1", 1000, &[], ""))]);
    mock.respond_raw(EntityKind::Sample, json!({"items": []}));
    let repo = repo(mock);

    assert_matches!(
        repo.by_id::<Sample>(&ctx(), &id("S1")),
        Err(MirrorError::MalformedPayload(_))
    );

    repo.client().clear_raw(EntityKind::Sample);
    assert!(repo.by_id::<Sample>(&ctx(), &id("S1")).is_ok());
    assert_eq!(repo.client().calls(), 2);
}

#[test]
fn unparseable_record_is_evicted() {
    let mock = MockOpenbis::default();
    mock.respond_raw(
        EntityKind::Sample,
        json!({"samples": [{"permId": "S1", "code": "S1"}]}),
    );
    let repo = repo(mock);

    assert_matches!(
        repo.by_id::<Sample>(&ctx(), &id("S1")),
        Err(MirrorError::MalformedPayload(_))
    );
    assert_matches!(
        repo.by_id::<Sample>(&ctx(), &id("S1")),
        Err(MirrorError::MalformedPayload(_))
    );
    assert_eq!(repo.client().calls(), 2);
}

#[test]
fn invalidate_forces_refetch() {
    let repo = repo(MockOpenbis::with(vec![(
        EntityKind::Sample,
        sample("S1", 1000, &[], "old"),
    )]));
    repo.by_id::<Sample>(&ctx(), &id("S1")).unwrap();

    repo.client().put(EntityKind::Sample, sample("S1", 2000, &[], "new"));
    assert_eq!(repo.by_id::<Sample>(&ctx(), &id("S1")).unwrap().comment(), "old");

    repo.invalidate(EntityKind::Sample, &id("S1")).unwrap();
    assert_eq!(repo.by_id::<Sample>(&ctx(), &id("S1")).unwrap().comment(), "new");
    assert_eq!(repo.client().calls(), 2);
}

#[test]
fn fetch_dispatches_by_kind() {
    let repo = repo(MockOpenbis::with(vec![(
        EntityKind::DataSet,
        dataset("D1", 1000, &["S1"]),
    )]));

    let entity = repo.fetch(&ctx(), EntityKind::DataSet, &id("D1")).unwrap();
    assert_eq!(entity.kind(), EntityKind::DataSet);
    assert_eq!(entity.type_text(), "RAW_DATA");
    assert_matches!(
        repo.fetch(&ctx(), EntityKind::DataSetFile, &id("D1")),
        Err(MirrorError::UnsupportedKind(EntityKind::DataSetFile))
    );
}

#[test]
fn relationships_resolve_through_repository() {
    let repo = repo(MockOpenbis::with(vec![
        (EntityKind::Sample, sample("S1", 1000, &["D1", "D2"], "")),
        (EntityKind::DataSet, dataset("D1", 1000, &["S1"])),
        (EntityKind::DataSet, dataset("D2", 3000, &["S1"])),
        (EntityKind::Experiment, experiment("E1", 1000, &["S1"], &["D1", "D2"])),
    ]));

    let sample = repo.by_id::<Sample>(&ctx(), &id("S1")).unwrap();
    let datasets = sample.datasets(&repo, &ctx()).unwrap();
    let ids: Vec<_> = datasets.iter().map(|d| d.perm_id().as_str()).collect();
    assert_eq!(ids, vec!["D2", "D1"]);

    let experiment = sample.experiment(&repo, &ctx()).unwrap().unwrap();
    assert_eq!(experiment.perm_id().as_str(), "E1");

    let back = datasets[0].samples(&repo, &ctx()).unwrap();
    assert_eq!(back, vec![sample]);
}

#[test]
fn files_come_from_datastore() {
    let repo = repo(MockOpenbis::with(vec![
        (EntityKind::DataSetFile, file("D1", "original", true)),
        (EntityKind::DataSetFile, file("D1", "original/a.csv", false)),
        (EntityKind::DataSetFile, file("D2", "original/b.csv", false)),
    ]));

    let files = repo.files(&ctx(), &id("D1")).unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.dataset_ref().as_str() == "D1"));
    assert_eq!(repo.client().requests()[0].0, Server::Datastore);

    repo.files(&ctx(), &id("D1")).unwrap();
    assert_eq!(repo.client().calls(), 1);
}

#[test]
fn disk_cache_survives_new_repository() {
    let dir = tempfile::tempdir().unwrap();
    let root = common::utf8(dir.path()).to_owned();

    let first = EntityRepository::new(
        MockOpenbis::with(vec![(EntityKind::Sample, sample("S1", 1000, &[], "kept"))]),
        QueryCache::new(Arc::new(DiskCache::new_with_root(root.clone()))),
    );
    first.by_id::<Sample>(&ctx(), &id("S1")).unwrap();

    let second = EntityRepository::new(
        MockOpenbis::default(),
        QueryCache::new(Arc::new(DiskCache::new_with_root(root))),
    );
    let cached = second.by_id::<Sample>(&ctx(), &id("S1")).unwrap();
    assert_eq!(cached.comment(), "kept");
    assert_eq!(second.client().calls(), 0);
}
