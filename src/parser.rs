//! Parser module for full-channel feed messages and level-3 snapshots
//!
//! Handles deserialization of the self-describing feed messages, the
//! subscription request, and the REST order-book listing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::storage::{BookSide, TradeSide};

/// Message `type` tag of the full channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Received,
    Open,
    Done,
    Match,
    Change,
    Activate,
    Subscriptions,
    Heartbeat,
    Error,
    #[serde(other)]
    Other,
}

/// One decoded feed message
///
/// Every field except the type tag is optional: which ones are present depends
/// on the message type, and market orders omit price-related fields.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default)]
    pub product_id: Option<String>,

    /// Absent only on control messages
    #[serde(default)]
    pub sequence: Option<u64>,

    /// Exchange timestamp
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub order_id: Option<Uuid>,

    #[serde(default)]
    pub side: Option<TradeSide>,

    #[serde(default)]
    pub price: Option<Decimal>,

    /// Trade size on `match`
    #[serde(default)]
    pub size: Option<Decimal>,

    /// Resting size on `open` and `done`
    #[serde(default)]
    pub remaining_size: Option<Decimal>,

    /// Amended size on `change`
    #[serde(default)]
    pub new_size: Option<Decimal>,

    #[serde(default)]
    pub reason: Option<String>,

    /// Human-readable text on `error`
    #[serde(default)]
    pub message: Option<String>,
}

impl FeedMessage {
    /// Parse a raw feed frame
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Subscription request sent right after the socket opens
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub product_ids: &'a [String],
    pub channels: [&'static str; 1],
}

impl<'a> SubscribeRequest<'a> {
    pub fn full(product_ids: &'a [String]) -> Self {
        Self {
            kind: "subscribe",
            product_ids,
            channels: ["full"],
        }
    }
}

/// One resting order of a snapshot listing
#[derive(Debug, Clone, PartialEq)]
pub struct RestingOrder {
    pub price: Decimal,
    pub amount: Decimal,
    pub order_id: Uuid,
    pub side: BookSide,
}

/// Level-3 order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct BookSnapshot {
    /// Feed sequence at which the listing is exact
    pub sequence: u64,

    #[serde(deserialize_with = "deserialize_bids")]
    pub bids: Vec<RestingOrder>,

    #[serde(deserialize_with = "deserialize_asks")]
    pub asks: Vec<RestingOrder>,
}

impl BookSnapshot {
    /// Every resting order, bids first
    pub fn resting_orders(&self) -> impl Iterator<Item = &RestingOrder> {
        self.bids.iter().chain(self.asks.iter())
    }

    pub fn len(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

fn deserialize_bids<'de, D>(deserializer: D) -> Result<Vec<RestingOrder>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_resting_orders(deserializer, BookSide::Bid)
}

fn deserialize_asks<'de, D>(deserializer: D) -> Result<Vec<RestingOrder>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_resting_orders(deserializer, BookSide::Ask)
}

/// Custom deserializer for `[price, size, order_id]` string triples
fn deserialize_resting_orders<'de, D>(
    deserializer: D,
    side: BookSide,
) -> Result<Vec<RestingOrder>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|entry| {
            if entry.len() != 3 {
                return Err(serde::de::Error::custom("Invalid resting order format"));
            }
            Ok(RestingOrder {
                price: Decimal::from_str(&entry[0]).map_err(serde::de::Error::custom)?,
                amount: Decimal::from_str(&entry[1]).map_err(serde::de::Error::custom)?,
                order_id: Uuid::parse_str(&entry[2]).map_err(serde::de::Error::custom)?,
                side,
            })
        })
        .collect()
}
