//! Core use-case services.
//!
//! # Responsibility
//! - `condense_service`: condensation job and batch driver.
//! - `assembler`: open and cache federated dataset views.
//! - `query_service`: the versioned data-access API.
//! - `route_service`: artifact download routes.
//! - Keep host frameworks decoupled from storage details.

pub mod access;
pub mod assembler;
pub mod condense_service;
pub mod query_service;
pub mod route_service;

pub use access::{AccessPolicy, AllowAll};
pub use assembler::{AccessMode, AssemblyError, DatasetAssembler};
pub use condense_service::{
    run_condense_batch, BatchError, BatchEvent, BatchSummary, CancelToken, CondensationEngine,
    CondenseError, CondenseOutcome, CONDENSE_LOCKER_ID,
};
pub use query_service::{EventIndex, QueryDispatcher, QueryError, QueryRequest};
pub use route_service::{Download, DownloadService, RouteError};
