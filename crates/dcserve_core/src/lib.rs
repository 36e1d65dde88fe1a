//! Dataset condensation and federated access for RT-DC resources.
//!
//! Condensed companions are built next to raw uploads and linked back to
//! them through basins; the query and download services serve the
//! combined logical dataset.

pub mod cache;
pub mod config;
pub mod container;
pub mod dataset;
pub mod lock;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{ConfigError, ServeConfig};
pub use logging::{default_log_level, init_from_config, init_logging, logging_status};
pub use model::resource::{Package, Resource, ResourceId};
pub use service::{
    run_condense_batch, AccessPolicy, AllowAll, BatchEvent, BatchSummary, CancelToken,
    CondensationEngine, CondenseError, CondenseOutcome, DatasetAssembler, Download, DownloadService,
    QueryDispatcher, QueryError, QueryRequest,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
