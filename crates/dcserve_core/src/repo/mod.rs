//! Access to data that lives outside the process.
//!
//! # Responsibility
//! - `locator`: local block-storage paths of raw uploads.
//! - `catalog`: package and resource records of the host catalog.
//! - `artifact_store`: object-store artifacts and basin resolution.
//!
//! # Invariants
//! - Repository APIs return semantic errors (`NotFound`) in addition to
//!   transport errors.

pub mod artifact_store;
pub mod catalog;
pub mod locator;

pub use artifact_store::{
    ArtifactKind, ArtifactLocation, ArtifactStore, LocalObjectStore, StoreBasinResolver,
    StoreError, StoreResult,
};
pub use catalog::{CatalogError, CatalogResult, InMemoryCatalog, ResourceCatalog};
pub use locator::{ResourceLocator, CONDENSED_SUFFIX};
