//! On-disk state: atomic JSON files and the versioned stats store.

pub mod atomic;
pub mod stats;

pub use stats::{Stats, StatsStore};
