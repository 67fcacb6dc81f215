//! Snapshot reconciliation
//!
//! Makes the stored set of open order states equal the snapshot as of a single
//! instant: open states missing from the snapshot are closed at `as_of`, and
//! snapshot orders without a matching open state are opened at `as_of`. Both
//! writes commit together or not at all.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

use crate::error::{RecorderError, Result};
use crate::parser::{BookSnapshot, RestingOrder};
use crate::storage::{self, OrderState, Store};

/// What a reconciliation changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub closed: u64,
    pub opened: u64,
    pub unchanged: u64,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.closed == 0 && self.opened == 0
    }
}

pub async fn reconcile(
    store: &Store,
    snapshot: &BookSnapshot,
    product: &str,
    as_of: DateTime<Utc>,
) -> Result<ReconcileSummary> {
    // Stage
    let mut scratch: HashMap<Uuid, &RestingOrder> = snapshot
        .resting_orders()
        .map(|order| (order.order_id, order))
        .collect();

    let mut tx = store.begin().await?;
    let open = storage::open_states(&mut tx, product).await?;

    let mut seen = HashSet::with_capacity(open.len());
    for state in &open {
        if !seen.insert(state.order_id) {
            return Err(RecorderError::Reconciliation {
                product: product.to_string(),
                reason: format!("order {} has more than one open state", state.order_id),
            });
        }
    }

    // Diff: stored intervals that still match exactly stay as they are
    let mut to_close = Vec::new();
    let mut unchanged = 0;
    for state in &open {
        let still_resting = scratch
            .get(&state.order_id)
            .is_some_and(|order| order.amount == state.amount);
        if still_resting {
            scratch.remove(&state.order_id);
            unchanged += 1;
        } else {
            to_close.push(state.order_id);
        }
    }

    let to_open: Vec<OrderState> = scratch
        .into_values()
        .map(|order| OrderState {
            order_id: order.order_id,
            product: product.to_string(),
            side: order.side,
            price: order.price,
            amount: order.amount,
            starting_at: as_of,
            ending_at: None,
        })
        .collect();

    // Close before insert so an amended order never has two open intervals
    let closed = storage::close_states_at(&mut tx, product, &to_close, as_of).await?;
    let opened = storage::insert_order_states(&mut tx, &to_open).await?;
    tx.commit().await?;

    let summary = ReconcileSummary {
        closed,
        opened,
        unchanged,
    };
    info!(
        product = %product,
        sequence = snapshot.sequence,
        closed = summary.closed,
        opened = summary.opened,
        unchanged = summary.unchanged,
        "Snapshot reconciled"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BookSide;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn resting(order_id: Uuid, amount: Decimal) -> RestingOrder {
        RestingOrder {
            price: dec!(10),
            amount,
            order_id,
            side: BookSide::Bid,
        }
    }

    fn snapshot(sequence: u64, orders: Vec<RestingOrder>) -> BookSnapshot {
        BookSnapshot {
            sequence,
            bids: orders,
            asks: vec![],
        }
    }

    #[tokio::test]
    async fn test_closes_vanished_opens_new_keeps_unchanged() {
        let store = Store::in_memory().await.unwrap();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        reconcile(
            &store,
            &snapshot(1, vec![resting(a, dec!(5)), resting(b, dec!(3))]),
            "BTC-USD",
            t(0),
        )
        .await
        .unwrap();

        let summary = reconcile(
            &store,
            &snapshot(2, vec![resting(a, dec!(5)), resting(c, dec!(2))]),
            "BTC-USD",
            t(10),
        )
        .await
        .unwrap();
        assert_eq!(
            summary,
            ReconcileSummary {
                closed: 1,
                opened: 1,
                unchanged: 1,
            }
        );

        let a_history = store.order_history(a).await.unwrap();
        assert_eq!(a_history.len(), 1);
        assert_eq!(a_history[0].starting_at, t(0));
        assert!(a_history[0].is_open());

        let b_history = store.order_history(b).await.unwrap();
        assert_eq!(b_history[0].ending_at, Some(t(10)));

        let c_history = store.order_history(c).await.unwrap();
        assert_eq!(c_history.len(), 1);
        assert_eq!(c_history[0].starting_at, t(10));
        assert_eq!(c_history[0].amount, dec!(2));
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let store = Store::in_memory().await.unwrap();
        let snap = snapshot(1, vec![resting(Uuid::new_v4(), dec!(1)), resting(Uuid::new_v4(), dec!(2))]);

        reconcile(&store, &snap, "BTC-USD", t(0)).await.unwrap();
        let rows = store.count_order_states().await.unwrap();

        let second = reconcile(&store, &snap, "BTC-USD", t(5)).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 2);
        assert_eq!(store.count_order_states().await.unwrap(), rows);
    }

    #[tokio::test]
    async fn test_amount_change_reopens_interval() {
        let store = Store::in_memory().await.unwrap();
        let a = Uuid::new_v4();

        reconcile(&store, &snapshot(1, vec![resting(a, dec!(5))]), "BTC-USD", t(0))
            .await
            .unwrap();
        // Same amount at a different scale is the same amount
        let same = reconcile(&store, &snapshot(2, vec![resting(a, dec!(5.000))]), "BTC-USD", t(5))
            .await
            .unwrap();
        assert!(same.is_noop());

        reconcile(&store, &snapshot(3, vec![resting(a, dec!(4))]), "BTC-USD", t(10))
            .await
            .unwrap();

        let history = store.order_history(a).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].ending_at, Some(t(10)));
        assert_eq!(history[1].starting_at, t(10));
        assert!(history[1].is_open());
    }

    #[tokio::test]
    async fn test_other_products_untouched() {
        let store = Store::in_memory().await.unwrap();
        let a = Uuid::new_v4();

        reconcile(&store, &snapshot(1, vec![resting(a, dec!(5))]), "ETH-USD", t(0))
            .await
            .unwrap();
        reconcile(&store, &snapshot(1, vec![]), "BTC-USD", t(10))
            .await
            .unwrap();

        assert!(store.order_history(a).await.unwrap()[0].is_open());
    }

    #[tokio::test]
    async fn test_failure_commits_nothing() {
        let store = Store::in_memory().await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        reconcile(&store, &snapshot(1, vec![resting(a, dec!(5))]), "BTC-USD", t(10))
            .await
            .unwrap();

        // as_of not after a's start: closing a would break the interval check
        let result = reconcile(&store, &snapshot(2, vec![resting(b, dec!(1))]), "BTC-USD", t(10)).await;
        assert!(result.is_err());

        assert!(store.order_history(a).await.unwrap()[0].is_open());
        assert!(store.order_history(b).await.unwrap().is_empty());
    }
}
