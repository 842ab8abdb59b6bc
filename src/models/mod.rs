//! Models module
//!
//! Defines the row and table shapes moved between adapters, the warehouse,
//! and the dynamic query client.

pub mod frame;
pub mod row;

pub use frame::{Frame, Record};
pub use row::{CanonicalRow, Location, esri_timestamp_to_date, today};
