//! Snapshot module
//!
//! Downloads point-in-time order books and merges them into stored state.

mod fetcher;
mod reconciler;

pub use fetcher::SnapshotFetcher;
pub use reconciler::{reconcile, ReconcileSummary};
