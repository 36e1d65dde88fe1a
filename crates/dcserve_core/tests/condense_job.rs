mod common;

use common::{raw_container, Fixture, EVENTS};
use dcserve_core::dataset::RtdcDataset;
use dcserve_core::lock::{FileResourceLock, ResourceLock};
use dcserve_core::repo::{ArtifactKind, ArtifactStore};
use dcserve_core::service::{BatchEvent, CancelToken};
use dcserve_core::{run_condense_batch, CondenseError, CondenseOutcome};
use serde_json::json;
use std::sync::{Arc, Barrier};

fn condensed_view(fixture: &Fixture, resource_id: &dcserve_core::ResourceId) -> RtdcDataset {
    let container = fixture
        .store
        .open_artifact(&fixture.location(ArtifactKind::Condensed, resource_id))
        .expect("condensed artifact");
    RtdcDataset::new(container, None).expect("condensed view")
}

#[test]
fn condense_local_upload_stores_artifact_with_three_basins() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    fixture.upload_raw(&resource.id, &raw_container());

    let created = fixture.engine().condense(&resource, false).expect("condense");
    assert!(created);

    let condensed = condensed_view(&fixture, &resource.id);
    assert_eq!(condensed.len(), EVENTS);
    let features = condensed.local_features();
    for name in ["circ", "deform", "index", "time", "area_um", "area_ratio", "aspect"] {
        assert!(features.iter().any(|feature| feature == name), "missing {name}");
    }
    assert!(!features.iter().any(|feature| feature == "image"));

    let descriptors = condensed.basin_descriptors();
    let formats: Vec<_> = descriptors.iter().map(|item| item["format"].clone()).collect();
    assert_eq!(formats, vec![json!("dcor"), json!("s3"), json!("http")]);
    assert_eq!(
        descriptors[0]["urls"],
        json!([format!(
            "https://dcor.example.org/api/3/action/dcserv?id={}",
            resource.id
        )])
    );
    let raw_url = fixture
        .store
        .object_url(&fixture.location(ArtifactKind::Resource, &resource.id));
    assert_eq!(descriptors[1]["urls"], json!([raw_url.clone()]));
    assert_eq!(descriptors[2]["urls"], json!([raw_url]));
    assert_eq!(descriptors[1]["features"], json!(["image", "mask", "trace"]));
}

#[test]
fn condense_reads_remote_upload_when_no_local_copy_exists() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.upload_raw(&resource.id, &raw_container());

    assert!(fixture.engine().condense(&resource, false).expect("condense"));
    assert_eq!(condensed_view(&fixture, &resource.id).len(), EVENTS);
}

#[test]
fn existing_artifact_is_only_replaced_with_override() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    let engine = fixture.engine();

    assert!(engine.condense(&resource, false).expect("first"));
    assert!(!engine.condense(&resource, false).expect("second"));
    assert!(engine.condense(&resource, true).expect("override"));
}

#[test]
fn non_rtdc_resources_and_disabled_feature_flag_are_skipped() {
    let fixture = Fixture::new();
    let csv = fixture.register_with_mime(false, "text/csv");
    fixture.write_local(&csv.id, &raw_container());
    assert!(!fixture.engine().condense(&csv, false).expect("csv"));
    assert!(!fixture
        .store
        .artifact_exists(&fixture.location(ArtifactKind::Condensed, &csv.id))
        .expect("exists"));

    let mut fixture = fixture;
    fixture.config.create_condensed_datasets = false;
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    assert!(!fixture.engine().condense(&resource, false).expect("disabled"));
}

#[test]
fn busy_lock_skips_without_waiting() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());

    let guard = fixture
        .lock
        .try_acquire(&resource.id, "another-worker")
        .expect("lock")
        .expect("free");
    assert!(!fixture.engine().condense(&resource, false).expect("locked"));
    drop(guard);

    assert!(fixture.engine().condense(&resource, false).expect("unlocked"));
    assert_eq!(fixture.lock.holder(&resource.id), None);
}

#[test]
fn concurrent_workers_create_exactly_one_artifact() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    let lock: Arc<dyn ResourceLock> =
        Arc::new(FileResourceLock::new(fixture.path().join("locks")));
    let engine = fixture.engine_with_lock(lock);

    let workers = 4;
    let barrier = Barrier::new(workers);
    let created = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    engine.condense(&resource, false).expect("condense")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|created| *created)
            .count()
    });
    assert_eq!(created, 1);
}

#[test]
fn missing_upload_fails_softly_and_releases_lock() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);

    let outcome = fixture
        .engine()
        .condense_outcome(&resource, false)
        .expect("unavailable");
    assert!(matches!(
        outcome,
        CondenseOutcome::Failed { kind: "NotFound", ref message }
            if message.contains("did not become available")
    ));
    assert_eq!(fixture.lock.holder(&resource.id), None);
    assert!(!fixture
        .store
        .artifact_exists(&fixture.location(ArtifactKind::Condensed, &resource.id))
        .expect("exists"));
}

#[test]
fn scratch_file_is_removed_after_upload() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());

    assert!(fixture.engine().condense(&resource, false).expect("condense"));
    let scratch = fixture.path().join("scratch");
    let leftovers = std::fs::read_dir(&scratch)
        .expect("scratch dir")
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn cancellation_is_fatal() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());

    let token = CancelToken::new();
    token.cancel();
    let engine = fixture.engine().with_cancel_token(token);
    let err = engine.condense(&resource, false).expect_err("cancelled");
    assert!(matches!(err, CondenseError::Cancelled));
    assert_eq!(fixture.lock.holder(&resource.id), None);
}

#[test]
fn batch_reports_created_artifacts_and_keeps_going() {
    let fixture = Fixture::new();
    let good = fixture.register(false);
    fixture.write_local(&good.id, &raw_container());
    let csv = fixture.register_with_mime(false, "text/csv");
    let missing = fixture.register(false);

    let engine = fixture.engine();
    let mut created = Vec::new();
    let mut failed = Vec::new();
    let mut checking = 0;
    let summary = run_condense_batch(fixture.catalog.as_ref(), &engine, None, |event| {
        match event {
            BatchEvent::Checking { .. } => checking += 1,
            BatchEvent::Created { resource, .. } => created.push(resource.id.clone()),
            BatchEvent::Failed {
                resource, kind, ..
            } => failed.push((resource.id.clone(), kind)),
        }
    })
    .expect("batch");

    assert_eq!(checking, 3);
    assert_eq!(created, vec![good.id.clone()]);
    assert_eq!(summary.checked, 3);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(failed, vec![(missing.id.clone(), "NotFound")]);
    for skipped in [&csv, &missing] {
        assert!(!fixture
            .store
            .artifact_exists(&fixture.location(ArtifactKind::Condensed, &skipped.id))
            .expect("exists"));
    }
}
