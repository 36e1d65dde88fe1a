//! Domain model for catalog records, basins and feature definitions.
//!
//! # Responsibility
//! - Define the plain data shapes shared by every core layer.
//!
//! # Invariants
//! - Model types carry no I/O; persistence lives in `container` and `repo`.

pub mod basin;
pub mod feature;
pub mod resource;
