//! Typed event batches
//!
//! Events accumulate in four lists, one per kind, until the combined count
//! reaches the flush threshold. The full batch is then moved out whole.

use std::mem;
use std::time::{Duration, Instant};

use crate::classifier::{ChangedState, ClosedState, Event};
use crate::storage::{OrderState, Trade};

/// Events to be applied to storage in one transaction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub trades: Vec<Trade>,
    pub new_states: Vec<OrderState>,
    pub changed_states: Vec<ChangedState>,
    pub closed_states: Vec<ClosedState>,
}

impl Batch {
    pub fn push(&mut self, event: Event) {
        match event {
            Event::NewTrade(trade) => self.trades.push(trade),
            Event::NewState(state) => self.new_states.push(state),
            Event::ChangedState(change) => self.changed_states.push(change),
            Event::ClosedState(close) => self.closed_states.push(close),
        }
    }

    pub fn len(&self) -> usize {
        self.trades.len()
            + self.new_states.len()
            + self.changed_states.len()
            + self.closed_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accumulates events and cuts batches at the size threshold
#[derive(Debug)]
pub struct BatchBuilder {
    current: Batch,
    threshold: usize,
    opened_at: Option<Instant>,
}

impl BatchBuilder {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            current: Batch::default(),
            threshold,
            opened_at: None,
        }
    }

    /// Add an event. Returns the batch once it reached the threshold.
    pub fn accept(&mut self, event: Event) -> Option<Batch> {
        if self.current.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.current.push(event);

        if self.current.len() >= self.threshold {
            self.flush()
        } else {
            None
        }
    }

    /// Take whatever has accumulated, if anything
    pub fn flush(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            return None;
        }
        self.opened_at = None;
        Some(mem::take(&mut self.current))
    }

    /// Whether a non-empty partial batch has been open longer than `max_age`
    pub fn is_due(&self, max_age: Duration) -> bool {
        self.opened_at
            .is_some_and(|opened| opened.elapsed() >= max_age)
    }

    pub fn pending(&self) -> usize {
        self.current.len()
    }
}
