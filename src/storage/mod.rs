//! Storage module
//!
//! Owns the connection pool, bootstraps the schema, and holds every SQL
//! statement the recorder issues. Write helpers take a bare connection so the
//! reconciler and the persister can compose them inside one transaction.

mod models;

pub use models::{decode_time, encode_time, BookSide, OrderState, Trade, TradeSide};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

pub const INIT_SQL: &str = include_str!("../../schema/init.sql");

/// Rows per multi-row statement, well under SQLite's bind limit
const CHUNK_ROWS: usize = 500;

/// Handle to the recorder's relational store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database and apply the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(url = %url, max_connections, "Storage ready");
        Ok(store)
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Round-trip a trivial query
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in INIT_SQL.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Order states of `product` resting at instant `at`
    pub async fn states_open_at(&self, product: &str, at: DateTime<Utc>) -> Result<Vec<OrderState>> {
        let at = encode_time(&at);
        let states = sqlx::query_as::<_, OrderState>(
            "SELECT order_id, product, side, price, amount, starting_at, ending_at
             FROM order_states
             WHERE product = ?1 AND starting_at <= ?2 AND (ending_at IS NULL OR ending_at > ?2)
             ORDER BY starting_at, order_id",
        )
        .bind(product)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    /// Trades of `product` in `[from, to)`, in insertion order
    pub async fn trades_between(
        &self,
        product: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Trade>> {
        let trades = sqlx::query_as::<_, Trade>(
            "SELECT side, product, price, amount, time
             FROM trades
             WHERE product = ?1 AND time >= ?2 AND time < ?3
             ORDER BY id",
        )
        .bind(product)
        .bind(encode_time(&from))
        .bind(encode_time(&to))
        .fetch_all(&self.pool)
        .await?;
        Ok(trades)
    }

    /// Full interval history of one order
    pub async fn order_history(&self, order_id: Uuid) -> Result<Vec<OrderState>> {
        let states = sqlx::query_as::<_, OrderState>(
            "SELECT order_id, product, side, price, amount, starting_at, ending_at
             FROM order_states
             WHERE order_id = ?1
             ORDER BY starting_at",
        )
        .bind(order_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(states)
    }

    /// Latest instant written to any interval boundary or trade
    pub async fn latest_stamp(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(t) AS latest FROM (
                 SELECT MAX(starting_at) AS t FROM order_states
                 UNION ALL SELECT MAX(ending_at) FROM order_states
                 UNION ALL SELECT MAX(time) FROM trades
             )",
        )
        .fetch_one(&self.pool)
        .await?;
        let latest: Option<String> = row.try_get("latest")?;
        Ok(latest.as_deref().map(decode_time).transpose()?)
    }

    pub async fn count_trades(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trades")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn count_order_states(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM order_states")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

/// Currently open interval of an order, as seen by the reconciler
#[derive(Debug, Clone, PartialEq)]
pub struct OpenState {
    pub order_id: Uuid,
    pub amount: Decimal,
}

/// Every open interval of `product`
pub async fn open_states(conn: &mut SqliteConnection, product: &str) -> Result<Vec<OpenState>> {
    let states = sqlx::query_as::<_, OrderState>(
        "SELECT order_id, product, side, price, amount, starting_at, ending_at
         FROM order_states
         WHERE product = ?1 AND ending_at IS NULL",
    )
    .bind(product)
    .fetch_all(&mut *conn)
    .await?;

    Ok(states
        .into_iter()
        .map(|s| OpenState {
            order_id: s.order_id,
            amount: s.amount,
        })
        .collect())
}

pub async fn insert_trades(conn: &mut SqliteConnection, trades: &[Trade]) -> Result<u64> {
    let mut inserted = 0;
    for chunk in trades.chunks(CHUNK_ROWS) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO trades (side, product, price, amount, time) ");
        qb.push_values(chunk, |mut row, trade| {
            row.push_bind(trade.side.as_str())
                .push_bind(trade.product.as_str())
                .push_bind(trade.price.to_string())
                .push_bind(trade.amount.to_string())
                .push_bind(encode_time(&trade.time));
        });
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

pub async fn insert_order_states(conn: &mut SqliteConnection, states: &[OrderState]) -> Result<u64> {
    let mut inserted = 0;
    for chunk in states.chunks(CHUNK_ROWS) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO order_states \
             (order_id, product, side, price, amount, starting_at, ending_at) ",
        );
        qb.push_values(chunk, |mut row, state| {
            row.push_bind(state.order_id.to_string())
                .push_bind(state.product.as_str())
                .push_bind(state.side.as_str())
                .push_bind(state.price.to_string())
                .push_bind(state.amount.to_string())
                .push_bind(encode_time(&state.starting_at))
                .push_bind(state.ending_at.as_ref().map(encode_time));
        });
        inserted += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(inserted)
}

/// Close the open intervals of the listed orders of `product` at one instant
pub async fn close_states_at(
    conn: &mut SqliteConnection,
    product: &str,
    order_ids: &[Uuid],
    ending_at: DateTime<Utc>,
) -> Result<u64> {
    let ending_at = encode_time(&ending_at);
    let mut closed = 0;
    for chunk in order_ids.chunks(CHUNK_ROWS) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE order_states SET ending_at = ");
        qb.push_bind(ending_at.as_str());
        qb.push(" WHERE ending_at IS NULL AND product = ");
        qb.push_bind(product);
        qb.push(" AND order_id IN (");
        let mut ids = qb.separated(", ");
        for id in chunk {
            ids.push_bind(id.to_string());
        }
        ids.push_unseparated(")");
        closed += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(closed)
}

/// Close each listed order's open interval at its own instant
///
/// One `CASE` statement per chunk, driven by the order_id -> ending_at table.
pub async fn close_states_by_id(
    conn: &mut SqliteConnection,
    closes: &HashMap<Uuid, DateTime<Utc>>,
) -> Result<u64> {
    let entries: Vec<(&Uuid, &DateTime<Utc>)> = closes.iter().collect();
    let mut closed = 0;
    for chunk in entries.chunks(CHUNK_ROWS) {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE order_states SET ending_at = CASE order_id");
        for (id, at) in chunk {
            qb.push(" WHEN ");
            qb.push_bind(id.to_string());
            qb.push(" THEN ");
            qb.push_bind(encode_time(at));
        }
        qb.push(" END WHERE ending_at IS NULL AND order_id IN (");
        let mut ids = qb.separated(", ");
        for (id, _) in chunk {
            ids.push_bind(id.to_string());
        }
        ids.push_unseparated(")");
        closed += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(closed)
}

/// Close the order's open interval that started before `next.starting_at`
/// and open `next` in its place. Returns false when no such interval exists.
pub async fn reopen_state(conn: &mut SqliteConnection, next: &OrderState) -> Result<bool> {
    let at = encode_time(&next.starting_at);
    let closed = sqlx::query(
        "UPDATE order_states SET ending_at = ?1
         WHERE order_id = ?2 AND ending_at IS NULL AND starting_at < ?1",
    )
    .bind(at.as_str())
    .bind(next.order_id.to_string())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if closed == 0 {
        return Ok(false);
    }

    insert_order_states(conn, std::slice::from_ref(next)).await?;
    Ok(true)
}
