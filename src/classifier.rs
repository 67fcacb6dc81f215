//! Event classifier
//!
//! Turns decoded feed messages into the four event kinds storage understands,
//! and discards anything the reference snapshot already covers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::trace;
use uuid::Uuid;

use crate::error::RecorderError;
use crate::parser::{FeedMessage, MessageType};
use crate::storage::{BookSide, OrderState, Trade};

/// An order's remaining amount changed while it rested
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedState {
    pub order_id: Uuid,
    pub product: String,
    pub side: BookSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
}

impl ChangedState {
    /// The interval that replaces the current one
    pub fn to_state(&self) -> OrderState {
        OrderState {
            order_id: self.order_id,
            product: self.product.clone(),
            side: self.side,
            price: self.price,
            amount: self.amount,
            starting_at: self.time,
            ending_at: None,
        }
    }
}

/// An order left the book
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedState {
    pub order_id: Uuid,
    pub ending_at: DateTime<Utc>,
}

/// Classified feed event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NewTrade(Trade),
    NewState(OrderState),
    ChangedState(ChangedState),
    ClosedState(ClosedState),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::NewTrade(_) => "trade",
            Event::NewState(_) => "new_state",
            Event::ChangedState(_) => "changed_state",
            Event::ClosedState(_) => "closed_state",
        }
    }
}

/// Per-product highest sequence already reflected in storage
#[derive(Debug, Clone, Default)]
pub struct SequenceCursor {
    sequences: HashMap<String, u64>,
}

impl SequenceCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the baseline established by a snapshot
    pub fn reset(&mut self, product: &str, sequence: u64) {
        self.sequences.insert(product.to_string(), sequence);
    }

    pub fn get(&self, product: &str) -> Option<u64> {
        self.sequences.get(product).copied()
    }

    /// Whether `sequence` is newer than what `product` already reflects.
    /// Untracked products are never newer.
    pub fn is_newer(&self, product: &str, sequence: u64) -> bool {
        self.get(product).is_some_and(|current| sequence > current)
    }

    /// Advance past `sequence`. Returns the expected sequence when it skipped
    /// ahead of `current + 1`.
    fn advance(&mut self, product: &str, sequence: u64) -> Option<u64> {
        let current = self.sequences.get_mut(product)?;
        if sequence <= *current {
            return None;
        }
        let expected = *current + 1;
        *current = sequence;
        (sequence != expected).then_some(expected)
    }
}

/// Map one message to an event, stamped with `received_at`.
///
/// `None` when the message is stale against the cursor, unsequenced, of a
/// type that does not change book state, or missing the fields its type needs.
pub fn classify(
    msg: &FeedMessage,
    cursor: &SequenceCursor,
    received_at: DateTime<Utc>,
) -> Option<Event> {
    let sequence = msg.sequence?;
    let product = msg.product_id.as_deref()?;
    if !cursor.is_newer(product, sequence) {
        return None;
    }

    match msg.kind {
        MessageType::Match => Some(Event::NewTrade(Trade {
            side: msg.side?,
            product: product.to_string(),
            price: msg.price?,
            amount: msg.size?,
            time: received_at,
        })),
        MessageType::Open => Some(Event::NewState(OrderState {
            order_id: msg.order_id?,
            product: product.to_string(),
            side: msg.side?.into(),
            price: msg.price?,
            amount: msg.remaining_size?,
            starting_at: received_at,
            ending_at: None,
        })),
        // Market-order amendments never rest on the book
        MessageType::Change => Some(Event::ChangedState(ChangedState {
            order_id: msg.order_id?,
            product: product.to_string(),
            side: msg.side?.into(),
            price: msg.price?,
            amount: msg.new_size?,
            time: received_at,
        })),
        MessageType::Done => {
            if msg.price.is_none() && msg.remaining_size.is_none() {
                return None;
            }
            Some(Event::ClosedState(ClosedState {
                order_id: msg.order_id?,
                ending_at: received_at,
            }))
        }
        _ => None,
    }
}

/// Classifier that owns the sequence cursor and watches for gaps
#[derive(Debug, Default)]
pub struct Classifier {
    cursor: SequenceCursor,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline a product at the sequence of a freshly reconciled snapshot
    pub fn reset(&mut self, product: &str, sequence: u64) {
        self.cursor.reset(product, sequence);
    }

    /// Classify `msg` and move the cursor past it.
    ///
    /// The cursor advances on every sequenced message, including ones that
    /// produce no event. Skipping ahead of `cursor + 1` is reported as
    /// `SequenceGap` together with the event, since both are known once the
    /// message has been seen.
    pub fn classify(
        &mut self,
        msg: &FeedMessage,
        received_at: DateTime<Utc>,
    ) -> (Option<Event>, Option<RecorderError>) {
        let event = classify(msg, &self.cursor, received_at);

        let gap = match (msg.product_id.as_deref(), msg.sequence) {
            (Some(product), Some(sequence)) => {
                self.cursor.advance(product, sequence).map(|expected| {
                    RecorderError::SequenceGap {
                        product: product.to_string(),
                        expected,
                        got: sequence,
                    }
                })
            }
            _ => None,
        };

        if event.is_none() {
            trace!(kind = ?msg.kind, sequence = ?msg.sequence, "Message dropped by classifier");
        }

        (event, gap)
    }
}
