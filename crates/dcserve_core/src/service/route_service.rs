//! Download routes for raw and condensed artifacts.
//!
//! # Invariants
//! - Link resources redirect to their own URL.
//! - Remote artifacts win over local files.
//! - Private packages are only ever served through presigned URLs.
//! - Every lookup failure (access, membership, missing data) is a 404.

use super::access::AccessPolicy;
use crate::config::ServeConfig;
use crate::model::resource::ResourceId;
use crate::repo::{
    ArtifactKind, ArtifactLocation, ArtifactStore, CatalogError, ResourceCatalog,
    ResourceLocator, StoreError,
};
use log::{debug, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

/// How the host should answer a download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Download {
    Redirect(String),
    LocalFile(PathBuf),
}

/// Download route errors.
#[derive(Debug)]
pub enum RouteError {
    /// Maps to HTTP 404; the message is safe to show.
    NotFound(&'static str),
    Catalog(CatalogError),
    Store(StoreError),
}

impl Display for RouteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(message) => write!(f, "{message}"),
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RouteError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotFound(_) => None,
            Self::Catalog(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<CatalogError> for RouteError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<StoreError> for RouteError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Resolves download requests to redirects or local files.
pub struct DownloadService {
    config: ServeConfig,
    catalog: Arc<dyn ResourceCatalog>,
    store: Arc<dyn ArtifactStore>,
    locator: ResourceLocator,
}

impl DownloadService {
    pub fn new(
        config: ServeConfig,
        catalog: Arc<dyn ResourceCatalog>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let locator = ResourceLocator::new(config.storage_path.clone());
        Self {
            config,
            catalog,
            store,
            locator,
        }
    }

    /// Condensed artifact of `resource_id` in package `package_id`.
    pub fn condensed(
        &self,
        policy: &dyn AccessPolicy,
        package_id: &str,
        resource_id: &str,
    ) -> Result<Download, RouteError> {
        self.download(policy, package_id, resource_id, ArtifactKind::Condensed)
    }

    /// Original upload of `resource_id` in package `package_id`.
    pub fn resource(
        &self,
        policy: &dyn AccessPolicy,
        package_id: &str,
        resource_id: &str,
    ) -> Result<Download, RouteError> {
        self.download(policy, package_id, resource_id, ArtifactKind::Resource)
    }

    fn download(
        &self,
        policy: &dyn AccessPolicy,
        package_id: &str,
        resource_id: &str,
        kind: ArtifactKind,
    ) -> Result<Download, RouteError> {
        const NOT_FOUND: RouteError = RouteError::NotFound("Resource not found");

        if policy.check_resource_access(resource_id).is_err() {
            return Err(NOT_FOUND);
        }
        let resource_id = ResourceId::parse(resource_id).map_err(|_| NOT_FOUND)?;
        let resource = self.catalog.resource(&resource_id)?.ok_or(NOT_FOUND)?;
        let package = self.catalog.package(package_id)?.ok_or(NOT_FOUND)?;
        if resource.package_id != package.id {
            return Err(NOT_FOUND);
        }

        if !resource.is_upload() {
            let url = resource
                .url
                .ok_or(RouteError::NotFound("No download is available"))?;
            info!(
                "event=download module=route status=ok kind={} target=link resource_id={}",
                kind.as_str(),
                resource_id
            );
            return Ok(Download::Redirect(url));
        }

        let location = ArtifactLocation::new(
            self.config.bucket_name(&package.organization_id),
            kind,
            resource_id.clone(),
        );
        if self.store.artifact_exists(&location)? {
            let url = if package.private {
                self.store
                    .presigned_url(&location, self.config.presign_expiry())?
            } else {
                self.store.object_url(&location)
            };
            info!(
                "event=download module=route status=ok kind={} target=redirect private={} resource_id={}",
                kind.as_str(),
                package.private,
                resource_id
            );
            return Ok(Download::Redirect(url));
        }

        let local = match kind {
            ArtifactKind::Condensed => self.locator.condensed_companion_path(&resource_id),
            ArtifactKind::Resource => self.locator.resource_path(&resource_id),
        };
        if local.is_file() {
            debug!(
                "event=download module=route status=ok kind={} target=local resource_id={}",
                kind.as_str(),
                resource_id
            );
            return Ok(Download::LocalFile(local));
        }

        Err(RouteError::NotFound(match kind {
            ArtifactKind::Condensed => "Preview not found",
            ArtifactKind::Resource => "No download is available",
        }))
    }
}
