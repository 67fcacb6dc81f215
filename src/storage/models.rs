//! Persisted record types
//!
//! Amounts and prices are stored as decimal text and timestamps as fixed-width
//! UTC text, so lexical order in SQL equals chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

/// Taker-facing side of a feed message (`buy` / `sell`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side: {}", other)),
        }
    }
}

/// Side of the book an order rests on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Ask,
    Bid,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Ask => "ask",
            BookSide::Bid => "bid",
        }
    }
}

impl FromStr for BookSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(BookSide::Ask),
            "bid" => Ok(BookSide::Bid),
            other => Err(format!("unknown book side: {}", other)),
        }
    }
}

/// A buy order rests on the bid side, a sell order on the ask side
impl From<TradeSide> for BookSide {
    fn from(side: TradeSide) -> Self {
        match side {
            TradeSide::Buy => BookSide::Bid,
            TradeSide::Sell => BookSide::Ask,
        }
    }
}

/// One execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: TradeSide,
    pub product: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub time: DateTime<Utc>,
}

/// One interval during which an order rested with a fixed price and amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: Uuid,
    pub product: String,
    pub side: BookSide,
    pub price: Decimal,
    pub amount: Decimal,
    pub starting_at: DateTime<Utc>,
    /// `None` while the interval is open
    pub ending_at: Option<DateTime<Utc>>,
}

impl OrderState {
    pub fn is_open(&self) -> bool {
        self.ending_at.is_none()
    }
}

pub fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_time(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn decode_decimal(raw: &str) -> Result<Decimal, sqlx::Error> {
    Decimal::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn decode_str<T: FromStr<Err = String>>(raw: &str) -> Result<T, sqlx::Error> {
    T::from_str(raw).map_err(|e| sqlx::Error::Decode(e.into()))
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Trade {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            side: decode_str(row.try_get("side")?)?,
            product: row.try_get("product")?,
            price: decode_decimal(row.try_get("price")?)?,
            amount: decode_decimal(row.try_get("amount")?)?,
            time: decode_time(row.try_get("time")?)?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for OrderState {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let order_id: &str = row.try_get("order_id")?;
        let ending_at: Option<&str> = row.try_get("ending_at")?;

        Ok(Self {
            order_id: Uuid::parse_str(order_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            product: row.try_get("product")?,
            side: decode_str(row.try_get("side")?)?,
            price: decode_decimal(row.try_get("price")?)?,
            amount: decode_decimal(row.try_get("amount")?)?,
            starting_at: decode_time(row.try_get("starting_at")?)?,
            ending_at: ending_at.map(decode_time).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_encoded_time_sorts_chronologically() {
        let base = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        let times = [
            base,
            base + Duration::microseconds(1),
            base + Duration::milliseconds(10),
            base + Duration::seconds(1),
        ];
        let encoded: Vec<String> = times.iter().map(encode_time).collect();

        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(sorted, encoded);
        assert!(encoded.iter().all(|s| s.len() == encoded[0].len()));
    }

    #[test]
    fn test_time_survives_encoding() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap() + Duration::microseconds(42);
        assert_eq!(decode_time(&encode_time(&t)).unwrap(), t);
    }

    #[test]
    fn test_book_side_from_trade_side() {
        assert_eq!(BookSide::from(TradeSide::Buy), BookSide::Bid);
        assert_eq!(BookSide::from(TradeSide::Sell), BookSide::Ask);
    }
}
