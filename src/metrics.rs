//! Pipeline metrics
//!
//! Kept in a crate-owned registry so several pipelines (and tests) can coexist.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported on `/metrics`
pub struct Metrics {
    registry: Registry,
    pub messages_received: IntCounter,
    pub messages_malformed: IntCounter,
    pub events_classified: IntCounterVec,
    pub sequence_gaps: IntCounter,
    pub batches_flushed: IntCounter,
    pub events_persisted: IntCounter,
    pub flush_failures: IntCounter,
    pub resyncs: IntCounter,
    pub reconciled_states: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("orderflow".to_string()), None)?;

        let messages_received =
            IntCounter::new("messages_received_total", "Feed messages read from the socket")?;
        let messages_malformed =
            IntCounter::new("messages_malformed_total", "Feed frames that failed to decode")?;
        let events_classified = IntCounterVec::new(
            Opts::new("events_classified_total", "Events produced by the classifier"),
            &["kind"],
        )?;
        let sequence_gaps = IntCounter::new("sequence_gaps_total", "Skipped feed sequence numbers")?;
        let batches_flushed = IntCounter::new("batches_flushed_total", "Batches committed")?;
        let events_persisted = IntCounter::new("events_persisted_total", "Events committed")?;
        let flush_failures = IntCounter::new("flush_failures_total", "Failed batch commits")?;
        let resyncs = IntCounter::new("resyncs_total", "Snapshot reconciliations run")?;
        let reconciled_states = IntCounterVec::new(
            Opts::new("reconciled_states_total", "Order states touched by reconciliation"),
            &["action"],
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_malformed.clone()))?;
        registry.register(Box::new(events_classified.clone()))?;
        registry.register(Box::new(sequence_gaps.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(events_persisted.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(resyncs.clone()))?;
        registry.register(Box::new(reconciled_states.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            messages_malformed,
            events_classified,
            sequence_gaps,
            batches_flushed,
            events_persisted,
            flush_failures,
            resyncs,
            reconciled_states,
        })
    }

    /// Prometheus text exposition of every metric
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
