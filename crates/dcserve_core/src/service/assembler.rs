//! Federated dataset assembly for serving.
//!
//! # Responsibility
//! - Open a resource as one logical dataset: locally as the combination of
//!   condensed file (local companion or uploaded artifact) and raw upload,
//!   remotely as the condensed artifact
//!   whose basins reach the raw artifact.
//! - Memoize opened views per `(resource id, access mode)`.
//!
//! # Invariants
//! - Local assembly order is `[condensed, raw upload]`; a local companion is
//!   preferred over the uploaded condensed artifact.
//! - A view is never built from a container holding external links.
//! - Concurrent opens of a cold key build exactly one view.
//! - Cached views are not invalidated by later condensation runs; callers
//!   clear the cache explicitly.

use crate::cache::MemoCache;
use crate::config::ServeConfig;
use crate::container::{read_attributes, read_container, Attributes, Container, ContainerError};
use crate::dataset::{
    combine_containers, config_sections, BasinResolver, CombineError, ConfigSections, DatasetError,
    RtdcDataset,
};
use crate::model::resource::ResourceId;
use crate::repo::{
    ArtifactKind, ArtifactLocation, ArtifactStore, CatalogError, ResourceCatalog,
    ResourceLocator, StoreBasinResolver, StoreError,
};
use log::{debug, error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

/// How a view was assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Combined from local block storage.
    Local,
    /// Backed by object-store artifacts and their basins.
    Remote,
}

impl AccessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// Assembly errors.
#[derive(Debug)]
pub enum AssemblyError {
    /// An input holds an external link; nothing was assembled.
    ForbiddenExternalLink { source: String, path: String },
    Container(ContainerError),
    Dataset(DatasetError),
    Catalog(CatalogError),
    Store(StoreError),
    UnknownResource(ResourceId),
    /// Neither a local upload nor a remote artifact exists.
    Unavailable(ResourceId),
}

impl Display for AssemblyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForbiddenExternalLink { source, path } => write!(
                f,
                "input `{source}` contains a forbidden external link at `{path}`"
            ),
            Self::Container(err) => write!(f, "{err}"),
            Self::Dataset(err) => write!(f, "{err}"),
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::UnknownResource(id) => write!(f, "unknown resource {id}"),
            Self::Unavailable(id) => write!(f, "resource {id} is not available"),
        }
    }
}

impl Error for AssemblyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Container(err) => Some(err),
            Self::Dataset(err) => Some(err),
            Self::Catalog(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CombineError> for AssemblyError {
    fn from(value: CombineError) -> Self {
        match value {
            CombineError::ForbiddenExternalLink { source, path } => {
                Self::ForbiddenExternalLink { source, path }
            }
            CombineError::Container(err) => Self::Container(err),
            CombineError::NoInputs => Self::Container(ContainerError::InvalidData(
                "no containers to combine".to_string(),
            )),
        }
    }
}

impl From<ContainerError> for AssemblyError {
    fn from(value: ContainerError) -> Self {
        Self::Container(value)
    }
}

impl From<CatalogError> for AssemblyError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<StoreError> for AssemblyError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Opens and caches logical dataset views.
pub struct DatasetAssembler {
    config: ServeConfig,
    catalog: Arc<dyn ResourceCatalog>,
    store: Arc<dyn ArtifactStore>,
    locator: ResourceLocator,
    handles: MemoCache<(ResourceId, AccessMode), Arc<RtdcDataset>>,
}

impl DatasetAssembler {
    pub fn new(
        config: ServeConfig,
        catalog: Arc<dyn ResourceCatalog>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let locator = ResourceLocator::new(config.storage_path.clone());
        let handles = MemoCache::new(config.cache.handle_capacity);
        Self {
            config,
            catalog,
            store,
            locator,
            handles,
        }
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    /// Local unless the upload is missing locally or `prefer_remote` is set.
    pub fn access_mode(&self, resource_id: &ResourceId, prefer_remote: bool) -> AccessMode {
        if !prefer_remote && self.locator.has_local_resource(resource_id) {
            AccessMode::Local
        } else {
            AccessMode::Remote
        }
    }

    /// Returns the memoized view of `resource_id`.
    ///
    /// # Errors
    /// - `ForbiddenExternalLink` when any input holds an external link.
    /// - `Unavailable` when no local or remote data exists.
    pub fn open(
        &self,
        resource_id: &ResourceId,
        prefer_remote: bool,
    ) -> Result<Arc<RtdcDataset>, AssemblyError> {
        let mode = self.access_mode(resource_id, prefer_remote);
        self.handles
            .get_or_try_init((resource_id.clone(), mode), || {
                let started_at = Instant::now();
                let built = match mode {
                    AccessMode::Local => self.open_local(resource_id),
                    AccessMode::Remote => self.open_remote(resource_id),
                };
                match &built {
                    Ok(_) => info!(
                        "event=dataset_open module=assembler status=ok mode={} resource_id={} duration_ms={}",
                        mode.as_str(),
                        resource_id,
                        started_at.elapsed().as_millis()
                    ),
                    Err(err) => error!(
                        "event=dataset_open module=assembler status=error mode={} resource_id={} error={}",
                        mode.as_str(),
                        resource_id,
                        err
                    ),
                }
                built.map(Arc::new)
            })
    }

    /// Metadata sections read straight from storage, bypassing the cache.
    pub fn read_metadata(&self, resource_id: &ResourceId) -> Result<ConfigSections, AssemblyError> {
        let path = self.locator.resource_path(resource_id);
        let attrs: Attributes = if path.is_file() {
            read_attributes(&path)?
        } else {
            let location = self.location(resource_id, ArtifactKind::Resource)?;
            match self.store.open_artifact(&location) {
                Ok(container) => container.attrs().clone(),
                Err(StoreError::NotFound(_)) => {
                    return Err(AssemblyError::Unavailable(resource_id.clone()))
                }
                Err(err) => return Err(err.into()),
            }
        };
        Ok(config_sections(&attrs))
    }

    /// Returns whether the raw upload is reachable locally or remotely.
    pub fn is_available(&self, resource_id: &ResourceId) -> Result<bool, AssemblyError> {
        if self.locator.has_local_resource(resource_id) {
            return Ok(true);
        }
        let location = self.location(resource_id, ArtifactKind::Resource)?;
        Ok(self.store.artifact_exists(&location)?)
    }

    /// Number of cached views.
    pub fn cached_views(&self) -> usize {
        self.handles.len()
    }

    /// Drops every cached view.
    pub fn clear(&self) {
        self.handles.clear();
        debug!("event=cache_clear module=assembler status=ok");
    }

    fn open_local(&self, resource_id: &ResourceId) -> Result<RtdcDataset, AssemblyError> {
        let raw_path = self.locator.resource_path(resource_id);
        let companion = self.locator.condensed_companion_path(resource_id);
        let condensed = if companion.is_file() {
            Some((companion.display().to_string(), read_container(&companion)?))
        } else {
            self.remote_condensed(resource_id)?
                .map(|container| (ArtifactKind::Condensed.as_str().to_string(), container))
        };

        let mut inputs = Vec::with_capacity(2);
        inputs.extend(condensed);
        inputs.push((raw_path.display().to_string(), read_container(&raw_path)?));
        let combined = combine_containers(inputs)?;
        self.view(combined, "local")
    }

    /// Condensed artifact in the object store, if one was uploaded.
    fn remote_condensed(&self, resource_id: &ResourceId) -> Result<Option<Container>, AssemblyError> {
        let location = match self.location(resource_id, ArtifactKind::Condensed) {
            Ok(location) => location,
            Err(AssemblyError::UnknownResource(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        match self.store.open_artifact(&location) {
            Ok(container) => Ok(Some(container)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn open_remote(&self, resource_id: &ResourceId) -> Result<RtdcDataset, AssemblyError> {
        for kind in [ArtifactKind::Condensed, ArtifactKind::Resource] {
            let location = self.location(resource_id, kind)?;
            match self.store.open_artifact(&location) {
                Ok(container) => return self.view(container, kind.as_str()),
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(AssemblyError::Unavailable(resource_id.clone()))
    }

    fn view(
        &self,
        container: Container,
        label: &str,
    ) -> Result<RtdcDataset, AssemblyError> {
        let resolver: Arc<dyn BasinResolver> =
            Arc::new(StoreBasinResolver::new(Arc::clone(&self.store)));
        RtdcDataset::new(container, Some(resolver)).map_err(|err| match err {
            DatasetError::ForbiddenExternalLink { path } => AssemblyError::ForbiddenExternalLink {
                source: label.to_string(),
                path,
            },
            other => AssemblyError::Dataset(other),
        })
    }

    fn location(
        &self,
        resource_id: &ResourceId,
        kind: ArtifactKind,
    ) -> Result<ArtifactLocation, AssemblyError> {
        let resource = self
            .catalog
            .resource(resource_id)?
            .ok_or_else(|| AssemblyError::UnknownResource(resource_id.clone()))?;
        let package = self
            .catalog
            .package(&resource.package_id)?
            .ok_or_else(|| AssemblyError::UnknownResource(resource_id.clone()))?;
        Ok(ArtifactLocation::new(
            self.config.bucket_name(&package.organization_id),
            kind,
            resource_id.clone(),
        ))
    }
}
