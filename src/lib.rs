//! Order-flow recorder library
//!
//! Streams a level-3 exchange feed into a durable history of trades and
//! resting-order intervals, reconciled against REST snapshots so that the
//! book can be rebuilt at any past instant.

use std::sync::Arc;

pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod parser;
pub mod persister;
pub mod snapshot;
pub mod storage;
pub mod websocket;

pub use classifier::{classify, Classifier, Event, SequenceCursor};
pub use config::Config;
pub use error::{RecorderError, Result};
pub use metrics::Metrics;
pub use parser::{BookSnapshot, FeedMessage, MessageType, RestingOrder};
pub use persister::{Batch, BatchBuilder, Persister, PersisterHandle};
pub use snapshot::{reconcile, ReconcileSummary, SnapshotFetcher};
pub use storage::{OrderState, Store, Trade};
pub use websocket::RecorderManager;

/// Application state shared across components
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub metrics: Arc<Metrics>,
}
