//! RT-DC dataset views, local assembly and condensation.
//!
//! # Responsibility
//! - `rtdc`: feature/metadata access over one container plus its basins.
//! - `combine`: merge several containers into one composite.
//! - `condense`: derive the condensed container from a raw dataset.

pub mod combine;
pub mod condense;
pub mod rtdc;

pub use combine::{combine_containers, CombineError};
pub use condense::{condense_dataset, upstream_features, CONDENSE_LOG_NAME};
pub use rtdc::{
    config_sections, BasinHandle, BasinResolver, ConfigSections, DatasetError, DatasetResult,
    RtdcDataset, TableData,
};
