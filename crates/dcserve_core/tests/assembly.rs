mod common;

use common::{container_with_external_link, raw_container, Fixture, EVENTS};
use dcserve_core::container::{write_container, Array, Container};
use dcserve_core::service::{AccessMode, AssemblyError};
use std::sync::{Arc, Barrier};

fn companion_container() -> Container {
    let mut container = Container::new();
    container
        .insert_dataset("events/circ", Array::from_f64(vec![1.0; EVENTS]))
        .expect("circ");
    container
        .insert_dataset("events/deform", Array::from_f64(vec![0.0; EVENTS]))
        .expect("deform");
    container
}

#[test]
fn local_assembly_prefers_condensed_companion() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    write_container(
        fixture.locator().condensed_companion_path(&resource.id),
        &companion_container(),
    )
    .expect("companion");

    let assembler = fixture.assembler();
    assert_eq!(assembler.access_mode(&resource.id, false), AccessMode::Local);
    let dataset = assembler.open(&resource.id, false).expect("open");

    assert_eq!(dataset.len(), EVENTS);
    assert_eq!(
        dataset.scalar_values("circ").expect("circ"),
        Some(vec![1.0; EVENTS])
    );
    let features = dataset.features_loaded();
    for name in ["area_cvx", "deform", "image", "mask", "trace"] {
        assert!(features.iter().any(|feature| feature == name), "missing {name}");
    }
}

#[test]
fn local_assembly_without_companion_serves_raw_upload() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());

    let dataset = fixture.assembler().open(&resource.id, false).expect("open");
    let circ = dataset.scalar_values("circ").expect("circ").expect("present");
    assert_eq!(circ[0], 0.5);
    assert!(dataset.logs().contains_key("acquisition"));
}

#[test]
fn remote_view_reaches_raw_features_through_basins() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.upload_raw(&resource.id, &raw_container());
    assert!(fixture.engine().condense(&resource, false).expect("condense"));

    let assembler = fixture.assembler();
    assert_eq!(assembler.access_mode(&resource.id, false), AccessMode::Remote);
    let dataset = assembler.open(&resource.id, true).expect("open");

    assert_eq!(dataset.len(), EVENTS);
    assert_eq!(dataset.basins().len(), 3);
    assert!(dataset.local_features().iter().any(|name| name == "deform"));
    assert!(!dataset.local_features().iter().any(|name| name == "image"));
    let image = dataset.event_json("image", 3).expect("image").expect("event");
    assert_eq!(image.as_array().map(Vec::len), Some(4));
    assert_eq!(dataset.trace_names().expect("traces"), vec!["fl1_median", "fl1_raw"]);
}

#[test]
fn remote_view_falls_back_to_raw_artifact() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.upload_raw(&resource.id, &raw_container());

    let dataset = fixture.assembler().open(&resource.id, true).expect("open");
    assert!(dataset.basins().is_empty());
    assert!(dataset.local_features().iter().any(|name| name == "image"));
}

#[test]
fn external_link_in_any_input_aborts_assembly() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    write_container(
        fixture.locator().condensed_companion_path(&resource.id),
        &container_with_external_link(),
    )
    .expect("companion");

    let err = fixture
        .assembler()
        .open(&resource.id, false)
        .expect_err("external link");
    match err {
        AssemblyError::ForbiddenExternalLink { source, path } => {
            assert!(source.ends_with("_condensed.rtdc"), "{source}");
            assert_eq!(path, "events/deform");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unknown_data_is_unavailable() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);

    let err = fixture
        .assembler()
        .open(&resource.id, false)
        .expect_err("nothing stored");
    assert!(matches!(err, AssemblyError::Unavailable(_)));
}

#[test]
fn opened_views_are_memoized_until_cleared() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    let assembler = fixture.assembler();

    let first = assembler.open(&resource.id, false).expect("first");
    let second = assembler.open(&resource.id, false).expect("second");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(assembler.cached_views(), 1);

    assembler.clear();
    assert_eq!(assembler.cached_views(), 0);
    let third = assembler.open(&resource.id, false).expect("third");
    assert!(!Arc::ptr_eq(&first, &third));
}

#[test]
fn concurrent_cold_opens_share_one_view() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    let assembler = fixture.assembler();

    let workers = 8;
    let barrier = Barrier::new(workers);
    let views: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    assembler.open(&resource.id, false).expect("open")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect()
    });
    assert!(views.iter().all(|view| Arc::ptr_eq(view, &views[0])));
}

#[test]
fn metadata_is_read_without_opening_a_view() {
    let fixture = Fixture::new();
    let resource = fixture.register(false);
    fixture.write_local(&resource.id, &raw_container());
    let assembler = fixture.assembler();

    let sections = assembler.read_metadata(&resource.id).expect("metadata");
    assert_eq!(assembler.cached_views(), 0);
    let imaging = sections.get("imaging").expect("imaging section");
    assert!(imaging.contains_key("frame rate"));
}
