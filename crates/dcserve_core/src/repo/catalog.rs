//! Read-only view of the host catalog (packages and their resources).
//!
//! # Invariants
//! - Resource ids are unique across all packages.
//! - Catalog data is never mutated by condensation or serving code.

use crate::model::resource::{Package, Resource, ResourceId};
use log::info;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Catalog access errors.
#[derive(Debug)]
pub enum CatalogError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(serde_json::Error),
}

impl Display for CatalogError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read catalog `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid catalog json: {err}"),
        }
    }
}

impl Error for CatalogError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Catalog lookups needed by condensation and serving.
pub trait ResourceCatalog: Send + Sync {
    fn resource(&self, resource_id: &ResourceId) -> CatalogResult<Option<Resource>>;
    fn package(&self, package_id: &str) -> CatalogResult<Option<Package>>;
    /// All packages ordered by id.
    fn packages(&self) -> CatalogResult<Vec<Package>>;
}

/// Catalog kept in memory, optionally seeded from a JSON export.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    packages: RwLock<BTreeMap<String, Package>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_packages(packages: impl IntoIterator<Item = Package>) -> Self {
        let catalog = Self::new();
        for package in packages {
            catalog.insert_package(package);
        }
        catalog
    }

    /// Loads a JSON array of packages.
    pub fn from_json_file(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let packages: Vec<Package> = serde_json::from_str(&raw)?;
        info!(
            "event=catalog_load module=catalog status=ok packages={}",
            packages.len()
        );
        Ok(Self::from_packages(packages))
    }

    /// Inserts or replaces a package.
    pub fn insert_package(&self, package: Package) {
        self.packages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package.id.clone(), package);
    }
}

impl ResourceCatalog for InMemoryCatalog {
    fn resource(&self, resource_id: &ResourceId) -> CatalogResult<Option<Resource>> {
        let packages = self.packages.read().unwrap_or_else(PoisonError::into_inner);
        Ok(packages
            .values()
            .flat_map(|package| package.resources.iter())
            .find(|resource| &resource.id == resource_id)
            .cloned())
    }

    fn package(&self, package_id: &str) -> CatalogResult<Option<Package>> {
        let packages = self.packages.read().unwrap_or_else(PoisonError::into_inner);
        Ok(packages.get(package_id).cloned())
    }

    fn packages(&self) -> CatalogResult<Vec<Package>> {
        let packages = self.packages.read().unwrap_or_else(PoisonError::into_inner);
        Ok(packages.values().cloned().collect())
    }
}
