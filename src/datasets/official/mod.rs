//! Adapters for state health department publications
//!
//! These write into the shared `us_covid` table tagged with provider
//! `state`, overwriting earlier values for the same key.

pub mod delaware;
pub mod wisconsin;

pub use delaware::Delaware;
pub use wisconsin::Wisconsin;

/// Provider tag for state-published data
pub const STATE_PROVIDER: &str = "state";
