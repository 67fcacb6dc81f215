//! Ingestion stage
//!
//! Everything between the socket and the batch hand-off: decode, stamp,
//! classify, accumulate. No I/O happens here, so the feed reader never waits
//! on anything but the socket.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::classifier::Classifier;
use crate::clock::FeedClock;
use crate::error::{RecorderError, Result};
use crate::metrics::Metrics;
use crate::parser::{FeedMessage, MessageType};
use crate::persister::{Batch, BatchBuilder};

pub struct Ingestor {
    classifier: Classifier,
    builder: BatchBuilder,
    clock: FeedClock,
    metrics: Arc<Metrics>,
    resync_on_gap: bool,
}

impl Ingestor {
    pub fn new(batch_size: usize, resync_on_gap: bool, metrics: Arc<Metrics>) -> Self {
        Self {
            classifier: Classifier::new(),
            builder: BatchBuilder::new(batch_size),
            clock: FeedClock::new(),
            metrics,
            resync_on_gap,
        }
    }

    /// Next instant on the shared receipt clock
    pub fn now(&mut self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Never stamp anything at or before `floor`
    pub fn advance_clock(&mut self, floor: DateTime<Utc>) {
        self.clock.observe(floor);
    }

    /// Discard everything at or below `sequence` for `product` from now on
    pub fn baseline(&mut self, product: &str, sequence: u64) {
        self.classifier.reset(product, sequence);
    }

    /// Process one raw frame. Returns a batch when the threshold was reached.
    ///
    /// Undecodable frames are dropped. Exchange error messages and, when
    /// configured, sequence gaps are returned as transient errors so the
    /// caller resynchronizes.
    pub fn ingest(&mut self, raw: &str) -> Result<Option<Batch>> {
        self.metrics.messages_received.inc();
        let received_at = self.clock.now();

        let msg = match FeedMessage::parse(raw) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.messages_malformed.inc();
                warn!(error = %e, len = raw.len(), "Dropping undecodable feed message");
                return Ok(None);
            }
        };

        if msg.kind == MessageType::Error {
            return Err(RecorderError::WebSocketMessage(
                msg.message
                    .or(msg.reason)
                    .unwrap_or_else(|| "exchange reported an error".to_string()),
            ));
        }

        let (event, gap) = self.classifier.classify(&msg, received_at);
        if let Some(gap) = gap {
            self.metrics.sequence_gaps.inc();
            if self.resync_on_gap {
                return Err(gap);
            }
            warn!(error = %gap, "Sequence gap, continuing without resync");
        }

        let Some(event) = event else {
            return Ok(None);
        };

        if let Some(exchange_time) = msg.time {
            debug!(
                kind = event.kind(),
                sequence = ?msg.sequence,
                lag_ms = (received_at - exchange_time).num_milliseconds(),
                "Event classified"
            );
        }
        self.metrics
            .events_classified
            .with_label_values(&[event.kind()])
            .inc();

        Ok(self.builder.accept(event))
    }

    /// Take the partial batch, if any
    pub fn take_partial(&mut self) -> Option<Batch> {
        self.builder.flush()
    }

    /// Whether the partial batch has waited longer than `max_age`
    pub fn is_due(&self, max_age: Duration) -> bool {
        self.builder.is_due(max_age)
    }

    pub fn pending(&self) -> usize {
        self.builder.pending()
    }
}
