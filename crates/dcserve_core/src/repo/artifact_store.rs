//! Object-store access for resource and condensed artifacts.
//!
//! # Responsibility
//! - Name artifacts deterministically: `<class>/<abc>/<def>/<rest>` inside
//!   the organization bucket.
//! - Check existence, upload with override semantics, open containers and
//!   produce public or presigned URLs.
//! - Resolve object-store and HTTP basins into containers.
//!
//! # Invariants
//! - An upload becomes visible atomically; readers never observe a partial
//!   artifact.
//! - URLs are only mapped back to objects below the store root.

use crate::container::{read_container, Container, ContainerError};
use crate::dataset::BasinResolver;
use crate::model::basin::{Basin, BasinKind};
use crate::model::resource::ResourceId;
use chrono::Utc;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

/// Artifact class stored per resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// The original upload.
    Resource,
    Condensed,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::Condensed => "condensed",
        }
    }
}

/// Fully qualified artifact address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactLocation {
    pub bucket: String,
    pub kind: ArtifactKind,
    pub resource_id: ResourceId,
}

impl ArtifactLocation {
    pub fn new(bucket: impl Into<String>, kind: ArtifactKind, resource_id: ResourceId) -> Self {
        Self {
            bucket: bucket.into(),
            kind,
            resource_id,
        }
    }

    /// Object key inside the bucket.
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.resource_id.shard_path())
    }
}

/// Object-store errors.
#[derive(Debug)]
pub enum StoreError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    NotFound(String),
    /// The URL does not point into this store.
    InvalidUrl(String),
    Container(ContainerError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "object store i/o error at `{}`: {source}", path.display())
            }
            Self::NotFound(key) => write!(f, "object not found: {key}"),
            Self::InvalidUrl(url) => write!(f, "url is not served by this store: {url}"),
            Self::Container(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Container(err) => Some(err),
            Self::NotFound(_) | Self::InvalidUrl(_) => None,
        }
    }
}

impl From<ContainerError> for StoreError {
    fn from(value: ContainerError) -> Self {
        match value {
            ContainerError::NotFound(path) => Self::NotFound(path.display().to_string()),
            other => Self::Container(other),
        }
    }
}

/// Object-store operations used by condensation and serving.
pub trait ArtifactStore: Send + Sync {
    fn artifact_exists(&self, location: &ArtifactLocation) -> StoreResult<bool>;

    /// Uploads the file at `path`; an existing object is kept unless
    /// `override_existing` is set.
    fn upload_artifact(
        &self,
        location: &ArtifactLocation,
        path: &Path,
        override_existing: bool,
    ) -> StoreResult<()>;

    fn open_artifact(&self, location: &ArtifactLocation) -> StoreResult<Container>;

    /// Opens the container behind a public object URL.
    fn open_url(&self, url: &str) -> StoreResult<Container>;

    /// Public (unsigned) URL of the object.
    fn object_url(&self, location: &ArtifactLocation) -> String;

    fn presigned_url(&self, location: &ArtifactLocation, expires_in: Duration)
        -> StoreResult<String>;
}

/// Object store kept in a local directory, one subdirectory per bucket.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    endpoint_url: String,
    presign_secret: String,
}

impl LocalObjectStore {
    pub fn new(
        root: impl Into<PathBuf>,
        endpoint_url: impl Into<String>,
        presign_secret: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            endpoint_url: endpoint_url.into().trim_end_matches('/').to_string(),
            presign_secret: presign_secret.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path backing `location`.
    pub fn object_path(&self, location: &ArtifactLocation) -> PathBuf {
        self.root
            .join(&location.bucket)
            .join(location.object_key())
    }

    /// Checks a signature produced by `presigned_url`.
    pub fn verify_signature(
        &self,
        location: &ArtifactLocation,
        expires_at: i64,
        signature: &str,
    ) -> bool {
        expires_at >= Utc::now().timestamp() && self.sign(location, expires_at) == signature
    }

    fn sign(&self, location: &ArtifactLocation, expires_at: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.presign_secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(location.bucket.as_bytes());
        hasher.update(b"/");
        hasher.update(location.object_key().as_bytes());
        hasher.update(b"\n");
        hasher.update(expires_at.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn path_for_url(&self, url: &str) -> StoreResult<PathBuf> {
        let invalid = || StoreError::InvalidUrl(url.to_string());
        let relative = url
            .strip_prefix(&self.endpoint_url)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(invalid)?;
        let relative = relative.split(['?', '#']).next().unwrap_or_default();
        let mut path = self.root.clone();
        for segment in relative.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(invalid());
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn open_path(&self, path: &Path, label: &str) -> StoreResult<Container> {
        if !path.is_file() {
            return Err(StoreError::NotFound(label.to_string()));
        }
        Ok(read_container(path)?)
    }
}

impl ArtifactStore for LocalObjectStore {
    fn artifact_exists(&self, location: &ArtifactLocation) -> StoreResult<bool> {
        Ok(self.object_path(location).is_file())
    }

    fn upload_artifact(
        &self,
        location: &ArtifactLocation,
        path: &Path,
        override_existing: bool,
    ) -> StoreResult<()> {
        let destination = self.object_path(location);
        if !override_existing && destination.is_file() {
            debug!(
                "event=artifact_upload module=artifact_store status=skip reason=exists key={}",
                location.object_key()
            );
            return Ok(());
        }
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StoreError::Io { path, source }
        };
        let parent = destination
            .parent()
            .ok_or_else(|| StoreError::InvalidUrl(destination.display().to_string()))?;
        fs::create_dir_all(parent).map_err(io_error(parent))?;

        let mut source = File::open(path).map_err(io_error(path))?;
        let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(io_error(parent))?;
        let bytes = std::io::copy(&mut source, &mut staged).map_err(io_error(path))?;
        staged
            .persist(&destination)
            .map_err(|err| StoreError::Io {
                path: destination.clone(),
                source: err.error,
            })?;

        info!(
            "event=artifact_upload module=artifact_store status=ok bucket={} key={} bytes={}",
            location.bucket,
            location.object_key(),
            bytes
        );
        Ok(())
    }

    fn open_artifact(&self, location: &ArtifactLocation) -> StoreResult<Container> {
        self.open_path(&self.object_path(location), &location.object_key())
    }

    fn open_url(&self, url: &str) -> StoreResult<Container> {
        let path = self.path_for_url(url)?;
        self.open_path(&path, url)
    }

    fn object_url(&self, location: &ArtifactLocation) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint_url,
            location.bucket,
            location.object_key()
        )
    }

    fn presigned_url(
        &self,
        location: &ArtifactLocation,
        expires_in: Duration,
    ) -> StoreResult<String> {
        if !self.artifact_exists(location)? {
            return Err(StoreError::NotFound(location.object_key()));
        }
        let expires_at = Utc::now().timestamp() + expires_in.as_secs() as i64;
        Ok(format!(
            "{}?expires={expires_at}&signature={}",
            self.object_url(location),
            self.sign(location, expires_at)
        ))
    }
}

/// Resolves object-store and HTTP basins through an `ArtifactStore`.
///
/// API basins point back at the serving endpoint and are never followed.
pub struct StoreBasinResolver {
    store: Arc<dyn ArtifactStore>,
}

impl StoreBasinResolver {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

impl BasinResolver for StoreBasinResolver {
    fn resolve(&self, basin: &Basin) -> Option<Container> {
        if basin.kind == BasinKind::DcorApi {
            return None;
        }
        for url in &basin.locations {
            match self.store.open_url(url) {
                Ok(container) => return Some(container),
                Err(err) => warn!(
                    "event=basin_resolve module=artifact_store status=error format={} error={}",
                    basin.kind.format(),
                    err
                ),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{ArtifactKind, ArtifactLocation, ArtifactStore, LocalObjectStore, StoreError};
    use crate::container::{write_container, Array, Container};
    use crate::model::resource::ResourceId;
    use std::time::Duration;

    fn store(root: &std::path::Path) -> LocalObjectStore {
        LocalObjectStore::new(root, "https://objects.example.org/", "secret")
    }

    fn sample_file(dir: &std::path::Path, value: f64) -> std::path::PathBuf {
        let mut container = Container::new();
        container
            .insert_dataset("events/deform", Array::from_f64(vec![value]))
            .expect("insert");
        let path = dir.join(format!("sample_{value}.rtdc"));
        write_container(&path, &container).expect("write");
        path
    }

    #[test]
    fn upload_respects_override_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir.path().join("objects"));
        let location =
            ArtifactLocation::new("circle-org", ArtifactKind::Condensed, ResourceId::generate());

        assert!(!store.artifact_exists(&location).expect("exists"));
        store
            .upload_artifact(&location, &sample_file(dir.path(), 1.0), false)
            .expect("upload");
        store
            .upload_artifact(&location, &sample_file(dir.path(), 2.0), false)
            .expect("noop upload");
        let deform = |store: &LocalObjectStore| {
            store
                .open_artifact(&location)
                .expect("open")
                .events()
                .and_then(|events| events.dataset("deform"))
                .and_then(|dataset| dataset.array.to_f64_vec())
                .expect("deform")
        };
        assert_eq!(deform(&store), vec![1.0]);

        store
            .upload_artifact(&location, &sample_file(dir.path(), 3.0), true)
            .expect("override upload");
        assert_eq!(deform(&store), vec![3.0]);
    }

    #[test]
    fn object_url_maps_back_to_the_stored_object() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let location =
            ArtifactLocation::new("circle-org", ArtifactKind::Resource, ResourceId::generate());
        store
            .upload_artifact(&location, &sample_file(dir.path(), 1.0), false)
            .expect("upload");

        let url = store.object_url(&location);
        assert!(url.starts_with("https://objects.example.org/circle-org/resource/"));
        assert!(store.open_url(&url).is_ok());
        assert!(matches!(
            store.open_url("https://objects.example.org/circle-org/../../etc/passwd"),
            Err(StoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            store.open_url("https://elsewhere.example.org/circle-org/x"),
            Err(StoreError::InvalidUrl(_))
        ));
    }

    #[test]
    fn presigned_url_carries_verifiable_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path());
        let location =
            ArtifactLocation::new("circle-org", ArtifactKind::Condensed, ResourceId::generate());
        assert!(matches!(
            store.presigned_url(&location, Duration::from_secs(60)),
            Err(StoreError::NotFound(_))
        ));

        store
            .upload_artifact(&location, &sample_file(dir.path(), 1.0), false)
            .expect("upload");
        let url = store
            .presigned_url(&location, Duration::from_secs(60))
            .expect("presign");
        let query = url.split_once('?').expect("query").1;
        let mut expires_at = 0;
        let mut signature = "";
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires_at = value.parse().expect("timestamp"),
                Some(("signature", value)) => signature = value,
                _ => {}
            }
        }
        assert!(store.verify_signature(&location, expires_at, signature));
        assert!(!store.verify_signature(&location, expires_at, "forged"));
    }
}
