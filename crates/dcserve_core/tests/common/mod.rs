#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use dcserve_core::container::{write_container, Array, ArrayData, Container, Node};
use dcserve_core::lock::{MemoryResourceLock, ResourceLock};
use dcserve_core::model::resource::{Package, Resource, ResourceId};
use dcserve_core::repo::{
    ArtifactKind, ArtifactLocation, ArtifactStore, InMemoryCatalog, LocalObjectStore,
    ResourceCatalog, ResourceLocator,
};
use dcserve_core::{CondensationEngine, DatasetAssembler, QueryDispatcher, ServeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const EVENTS: usize = 47;
pub const ORGANIZATION: &str = "org-42";
pub const PACKAGE_ID: &str = "calibration-beads";
pub const ENDPOINT: &str = "http://objects.local";

/// Raw RT-DC container with scalar, image, mask and trace features.
pub fn raw_container() -> Container {
    let mut container = Container::new();
    container.set_attr("experiment:sample", "calibration beads");
    container.set_attr("experiment:event count", EVENTS as i64);
    container.set_attr("imaging:frame rate", 2000.0);
    container.set_attr("imaging:pixel size", 0.34);
    container.set_attr("setup:channel width", 20.0);

    let scalar = |offset: f64| -> Vec<f64> {
        (0..EVENTS).map(|index| offset + index as f64 * 0.01).collect()
    };
    for (name, values) in [
        ("circ", scalar(0.5)),
        ("area_cvx", scalar(100.0)),
        ("area_msd", scalar(90.0)),
        ("size_x", scalar(20.0)),
        ("size_y", scalar(10.0)),
        ("frame", (0..EVENTS).map(|index| (index * 4) as f64).collect()),
    ] {
        container
            .insert_dataset(&format!("events/{name}"), Array::from_f64(values))
            .expect("scalar feature");
    }

    let pixels = EVENTS * 4 * 5;
    container
        .insert_dataset(
            "events/image",
            Array::new(
                vec![EVENTS, 4, 5],
                ArrayData::U8((0..pixels).map(|index| (index % 251) as u8).collect()),
            )
            .expect("image"),
        )
        .expect("image");
    container
        .insert_dataset(
            "events/mask",
            Array::new(
                vec![EVENTS, 4, 5],
                ArrayData::Bool((0..pixels).map(|index| index % 3 != 0).collect()),
            )
            .expect("mask"),
        )
        .expect("mask");
    for trace in ["fl1_median", "fl1_raw"] {
        container
            .insert_dataset(
                &format!("events/trace/{trace}"),
                Array::new(
                    vec![EVENTS, 10],
                    ArrayData::F64((0..EVENTS * 10).map(|index| index as f64).collect()),
                )
                .expect("trace"),
            )
            .expect("trace");
    }

    container
        .insert_dataset(
            "logs/acquisition",
            Array::text(vec!["[General]".to_string(), "Shutter = 1".to_string()]),
        )
        .expect("log");
    container
        .insert_dataset(
            "tables/cytoshot_monitor",
            Array::table(
                vec!["brightness".to_string(), "temperature".to_string()],
                vec![vec![120.0, 23.5], vec![121.0, 23.6]],
            )
            .expect("table"),
        )
        .expect("table");
    container
}

/// Isolated storage, object store and catalog for one test.
pub struct Fixture {
    pub dir: TempDir,
    pub config: ServeConfig,
    pub catalog: Arc<InMemoryCatalog>,
    pub store: Arc<LocalObjectStore>,
    pub lock: Arc<MemoryResourceLock>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ServeConfig::default();
        config.storage_path = dir.path().join("storage");
        config.tmp_dir = Some(dir.path().join("scratch"));
        config.site_url = "https://dcor.example.org".to_string();
        config.object_store.endpoint_url = ENDPOINT.to_string();
        config.object_store.root = dir.path().join("objects");
        config.object_store.presign_secret = "fixture-secret".to_string();
        config.wait_for_resource.timeout_ms = 50;
        config.wait_for_resource.poll_interval_ms = 10;

        let store = Arc::new(LocalObjectStore::new(
            config.object_store.root.clone(),
            ENDPOINT,
            config.object_store.presign_secret.clone(),
        ));
        Self {
            dir,
            config,
            catalog: Arc::new(InMemoryCatalog::new()),
            store,
            lock: Arc::new(MemoryResourceLock::new()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn locator(&self) -> ResourceLocator {
        ResourceLocator::new(self.config.storage_path.clone())
    }

    pub fn bucket(&self) -> String {
        self.config.bucket_name(ORGANIZATION)
    }

    pub fn location(&self, kind: ArtifactKind, resource_id: &ResourceId) -> ArtifactLocation {
        ArtifactLocation::new(self.bucket(), kind, resource_id.clone())
    }

    /// Registers an RT-DC resource in a package of the fixture organization.
    pub fn register(&self, private: bool) -> Resource {
        self.register_with_mime(private, "RT-DC")
    }

    pub fn register_with_mime(&self, private: bool, mimetype: &str) -> Resource {
        let resource = Resource::upload(
            ResourceId::generate(),
            PACKAGE_ID,
            "beads.rtdc",
            mimetype,
        );
        let mut package = self
            .catalog
            .package(PACKAGE_ID)
            .expect("catalog")
            .unwrap_or_else(|| Package {
                id: PACKAGE_ID.to_string(),
                name: "calibration-beads".to_string(),
                organization_id: ORGANIZATION.to_string(),
                private,
                metadata_modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                resources: Vec::new(),
            });
        package.private = private;
        package.resources.push(resource.clone());
        self.catalog.insert_package(package);
        resource
    }

    /// Writes `container` as the local raw upload of `resource_id`.
    pub fn write_local(&self, resource_id: &ResourceId, container: &Container) -> PathBuf {
        let path = self.locator().resource_path(resource_id);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        write_container(&path, container).expect("write raw");
        path
    }

    /// Uploads `container` as the `resource` artifact of `resource_id`.
    pub fn upload_raw(&self, resource_id: &ResourceId, container: &Container) {
        let staged = self.path().join(format!("{resource_id}.upload"));
        write_container(&staged, container).expect("write staged");
        self.store
            .upload_artifact(
                &self.location(ArtifactKind::Resource, resource_id),
                &staged,
                false,
            )
            .expect("upload raw");
        std::fs::remove_file(staged).expect("remove staged");
    }

    pub fn engine(&self) -> CondensationEngine {
        self.engine_with_lock(self.lock.clone())
    }

    pub fn engine_with_lock(&self, lock: Arc<dyn ResourceLock>) -> CondensationEngine {
        CondensationEngine::new(
            self.config.clone(),
            self.catalog.clone(),
            self.store.clone(),
            lock,
        )
    }

    pub fn assembler(&self) -> Arc<DatasetAssembler> {
        Arc::new(DatasetAssembler::new(
            self.config.clone(),
            self.catalog.clone(),
            self.store.clone(),
        ))
    }

    pub fn dispatcher(&self) -> QueryDispatcher {
        QueryDispatcher::new(
            self.assembler(),
            self.catalog.clone(),
            self.config.cache.mimetype_capacity,
        )
    }
}

/// Container whose `events/deform` is an external link.
pub fn container_with_external_link() -> Container {
    let mut container = Container::new();
    container
        .insert_dataset("events/circ", Array::from_f64(vec![0.5; EVENTS]))
        .expect("circ");
    container
        .insert_node(
            "events/deform",
            Node::ExternalLink {
                file: "/etc/passwd".to_string(),
                target: "/deform".to_string(),
            },
        )
        .expect("link");
    container
}
