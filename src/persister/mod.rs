//! Batch persister
//!
//! Applies classified batches to storage on its own task, fed through a
//! bounded channel, so storage latency never stalls the feed reader.

mod batch;

pub use batch::{Batch, BatchBuilder};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{RecorderError, Result};
use crate::metrics::Metrics;
use crate::storage::{self, Store};

/// Base delay for exponential backoff between whole-batch retries
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Work item on the hand-off channel
#[derive(Debug)]
enum Job {
    Apply(Batch),
    /// Acknowledged once every job queued before it has been applied
    Barrier(oneshot::Sender<()>),
}

/// Rows written by one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub trades: u64,
    pub opened: u64,
    pub changed: u64,
    pub closed: u64,
}

/// Sending side of the persister, owned by the ingestion loop
#[derive(Debug, Clone)]
pub struct PersisterHandle {
    tx: mpsc::Sender<Job>,
}

impl PersisterHandle {
    /// Hand a full batch over. Waits while the channel is at capacity.
    pub async fn submit(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Job::Apply(batch))
            .await
            .map_err(|_| RecorderError::PersisterStopped("batch channel closed".to_string()))
    }

    /// Wait until every batch submitted so far is in storage
    pub async fn barrier(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Job::Barrier(ack_tx))
            .await
            .map_err(|_| RecorderError::PersisterStopped("batch channel closed".to_string()))?;
        ack_rx
            .await
            .map_err(|_| RecorderError::PersisterStopped("persister exited before barrier".to_string()))
    }
}

/// Storage-bound stage of the pipeline
pub struct Persister {
    store: Store,
    max_retries: u32,
    metrics: Arc<Metrics>,
}

impl Persister {
    pub fn new(store: Store, max_retries: u32, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            max_retries,
            metrics,
        }
    }

    /// Start the persister task. It runs until every handle is dropped and the
    /// queue is drained, or until a batch cannot be written.
    pub fn spawn(self, capacity: usize) -> (PersisterHandle, JoinHandle<Result<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (PersisterHandle { tx }, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<Job>) -> Result<()> {
        info!("Persister started");

        while let Some(job) = rx.recv().await {
            match job {
                Job::Apply(batch) => {
                    if let Err(e) = self.apply_with_retry(&batch).await {
                        error!(
                            error = %e,
                            events = batch.len(),
                            "Batch could not be persisted, halting"
                        );
                        return Err(e);
                    }
                }
                Job::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        info!("Persister drained and stopped");
        Ok(())
    }

    async fn apply_with_retry(&self, batch: &Batch) -> Result<BatchOutcome> {
        let mut attempt = 0;
        loop {
            let start = Instant::now();
            match apply_batch(&self.store, batch).await {
                Ok(outcome) => {
                    self.metrics.batches_flushed.inc();
                    self.metrics.events_persisted.inc_by(batch.len() as u64);
                    debug!(
                        trades = outcome.trades,
                        opened = outcome.opened,
                        changed = outcome.changed,
                        closed = outcome.closed,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Batch persisted"
                    );
                    return Ok(outcome);
                }
                Err(e) if attempt < self.max_retries => {
                    self.metrics.flush_failures.inc();
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Batch write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.metrics.flush_failures.inc();
                    return Err(e);
                }
            }
        }
    }
}

/// Apply one batch as a single transaction.
///
/// Order matters: trades, then new states, then changes, then closes, since
/// the last two may refer to orders opened earlier in the same batch. On any
/// failure the transaction rolls back and nothing of the batch is visible.
pub async fn apply_batch(store: &Store, batch: &Batch) -> Result<BatchOutcome> {
    let mut tx = store.begin().await?;
    let mut outcome = BatchOutcome::default();

    outcome.trades = storage::insert_trades(&mut tx, &batch.trades).await?;
    outcome.opened = storage::insert_order_states(&mut tx, &batch.new_states).await?;

    for change in &batch.changed_states {
        if storage::reopen_state(&mut tx, &change.to_state()).await? {
            outcome.changed += 1;
        } else {
            debug!(order_id = %change.order_id, "Change for an order with no open state");
        }
    }

    if !batch.closed_states.is_empty() {
        let mut closes = HashMap::with_capacity(batch.closed_states.len());
        for close in &batch.closed_states {
            closes.entry(close.order_id).or_insert(close.ending_at);
        }
        outcome.closed = storage::close_states_by_id(&mut tx, &closes).await?;
    }

    tx.commit().await?;
    Ok(outcome)
}
