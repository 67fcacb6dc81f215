//! Recorder connection manager
//!
//! Sequences the pipeline: connect, drain the persister, reconcile a fresh
//! snapshot per product, then stream. Any transient failure goes back to the
//! start of that sequence after a backoff; reading never resumes without a
//! fresh reconciliation.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{self as tokio_time, interval, sleep, sleep_until, MissedTickBehavior};
use tracing::{error, info, warn};

use super::client::{Frame, WebSocketClient};
use crate::error::{RecorderError, Result};
use crate::ingest::Ingestor;
use crate::persister::PersisterHandle;
use crate::snapshot::{reconcile, SnapshotFetcher};
use crate::AppState;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
/// Consecutive silent read windows tolerated before the socket is declared stale.
/// The first one sends a keepalive ping.
const MAX_IDLE_READS: u32 = 2;

/// Why a streaming session ended without error
enum SessionEnd {
    Shutdown,
}

/// Outcome of one wait in the streaming loop
enum Step {
    Shutdown,
    Idle,
    Tick,
    Frame(Result<Frame>),
}

/// Owns the feed connection and the ingestion stage
pub struct RecorderManager {
    state: Arc<AppState>,
    client: WebSocketClient,
    fetcher: SnapshotFetcher,
    ingestor: Ingestor,
    persister: PersisterHandle,
    shutdown: watch::Receiver<bool>,
    reconnect_attempts: u32,
    last_successful_sync: Option<Instant>,
}

impl RecorderManager {
    pub fn new(
        state: Arc<AppState>,
        persister: PersisterHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let config = &state.config;
        let client = WebSocketClient::new(&config.ws_endpoint, config.products.clone());
        let fetcher = SnapshotFetcher::new(&config.rest_endpoint)?;
        let ingestor = Ingestor::new(
            config.batch_size,
            config.resync_on_gap,
            state.metrics.clone(),
        );

        Ok(Self {
            state,
            client,
            fetcher,
            ingestor,
            persister,
            shutdown,
            reconnect_attempts: 0,
            last_successful_sync: None,
        })
    }

    /// Run until shutdown is signalled or a fatal error occurs.
    ///
    /// Consumes the manager so the persister handle is dropped on return,
    /// which lets the persister drain and exit.
    pub async fn run(mut self) -> Result<()> {
        info!(products = ?self.state.config.products, "Starting recorder");

        // Stored stamps may be ahead of a wall clock that stepped back
        match self.state.store.latest_stamp().await {
            Ok(Some(latest)) => self.ingestor.advance_clock(latest),
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Could not read latest stored timestamp");
                return Err(e);
            }
        }

        let result = loop {
            if self.is_shutting_down() {
                break Ok(());
            }

            // Reset reconnect attempts if we've been stable for a while
            if let Some(last_success) = self.last_successful_sync {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            match self.connect_and_process().await {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Err(e) if e.is_transient() => {
                    self.client.close().await;
                    self.reconnect_attempts += 1;

                    let max = self.state.config.max_reconnect_attempts;
                    if max > 0 && self.reconnect_attempts > max {
                        error!(attempts = self.reconnect_attempts, error = %e, "Giving up");
                        break Err(RecorderError::MaxReconnectAttemptsExceeded);
                    }

                    let delay = backoff_delay(self.state.config.reconnect_delay_ms, self.reconnect_attempts);
                    warn!(
                        error = %e,
                        attempt = self.reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Feed interrupted, resynchronizing after backoff"
                    );
                    if self.wait_or_shutdown(delay).await {
                        break Ok(());
                    }
                }
                Err(e) => {
                    error!(error = %e, "Fatal recorder error");
                    break Err(e);
                }
            }
        };

        self.finish().await;
        result
    }

    /// Connect, resynchronize, then stream until something breaks
    async fn connect_and_process(&mut self) -> Result<SessionEnd> {
        // Subscribe first so nothing after the snapshots is missed
        self.client.connect().await?;
        self.resync().await?;

        self.last_successful_sync = Some(Instant::now());
        self.reconnect_attempts = 0;

        let read_timeout = self.state.config.read_timeout();
        let flush_interval = self.state.config.flush_interval();
        let mut flush_tick = interval(flush_interval.max(Duration::from_millis(10)));
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Idle deadline lives outside the read so flush ticks cannot reset it
        let mut last_frame = tokio_time::Instant::now();
        let mut idle_reads = 0;

        loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.changed() => Step::Shutdown,
                _ = sleep_until(last_frame + read_timeout) => Step::Idle,
                _ = flush_tick.tick() => Step::Tick,
                frame = self.client.recv() => Step::Frame(frame),
            };

            match step {
                Step::Shutdown => return Ok(SessionEnd::Shutdown),
                Step::Idle => {
                    idle_reads += 1;
                    if idle_reads >= MAX_IDLE_READS {
                        return Err(RecorderError::ConnectionTimeout);
                    }
                    warn!(
                        timeout_secs = read_timeout.as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    self.client.ping().await?;
                    last_frame = tokio_time::Instant::now();
                }
                Step::Tick => {
                    if self.ingestor.is_due(flush_interval) {
                        if let Some(batch) = self.ingestor.take_partial() {
                            self.persister.submit(batch).await?;
                        }
                    }
                }
                Step::Frame(Ok(frame)) => {
                    idle_reads = 0;
                    last_frame = tokio_time::Instant::now();
                    match frame {
                        Frame::Text(raw) => {
                            if let Some(batch) = self.ingestor.ingest(&raw)? {
                                self.persister.submit(batch).await?;
                            }
                        }
                        Frame::Control => {}
                        Frame::End => return Err(RecorderError::FeedClosed),
                    }
                }
                Step::Frame(Err(e)) => return Err(e),
            }
        }
    }

    /// Re-establish the baseline for every product.
    ///
    /// Pending events are older than any snapshot taken now, so they are
    /// written out before reconciling.
    async fn resync(&mut self) -> Result<()> {
        if let Some(batch) = self.ingestor.take_partial() {
            self.persister.submit(batch).await?;
        }
        self.persister.barrier().await?;

        let metrics = &self.state.metrics;
        for product in &self.state.config.products {
            let snapshot = self.fetcher.fetch(product).await?;
            let as_of = self.ingestor.now();
            let summary = reconcile(&self.state.store, &snapshot, product, as_of).await?;

            self.ingestor.baseline(product, snapshot.sequence);
            metrics.reconciled_states.with_label_values(&["closed"]).inc_by(summary.closed);
            metrics.reconciled_states.with_label_values(&["opened"]).inc_by(summary.opened);
            metrics
                .reconciled_states
                .with_label_values(&["unchanged"])
                .inc_by(summary.unchanged);
        }

        metrics.resyncs.inc();
        info!("All products synchronized, streaming");
        Ok(())
    }

    /// Sleep for `delay`. Returns true if shutdown was requested meanwhile.
    async fn wait_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => self.is_shutting_down(),
            _ = self.shutdown.changed() => true,
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Close the socket and hand off whatever was still pending
    async fn finish(&mut self) {
        self.client.close().await;

        if let Some(batch) = self.ingestor.take_partial() {
            let events = batch.len();
            match self.persister.submit(batch).await {
                Ok(()) => info!(events, "Handed off final partial batch"),
                Err(e) => error!(error = %e, events, "Final partial batch could not be handed off"),
            }
        }
    }
}

/// Exponential backoff, capped at `MAX_BACKOFF_MS`
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let delay = base_ms.saturating_mul(2u64.pow(attempt.min(6)));
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use crate::persister::Persister;
    use crate::storage::Store;
    use futures_util::{SinkExt, StreamExt};
    use rust_decimal_macros::dec;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::{accept_async, tungstenite::Message};
    use uuid::Uuid;

    const X: &str = "7b3c2a51-1f0e-4d2b-9c6a-3e5f8d7c1b20";
    const Y: &str = "0d9e4f3a-6b21-4c8e-a7d5-2f1b9c0e8a64";

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1000, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(1000, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(1000, 20), Duration::from_secs(60));
        assert_eq!(backoff_delay(u64::MAX, 2), Duration::from_secs(60));
    }

    /// Empty level-3 book at `sequence`; counts snapshot requests
    async fn serve_books(sequence: u64) -> (String, Arc<AtomicUsize>) {
        use axum::{extract::State, routing::get, Json, Router};

        let requests = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/products/:product/book",
                get(move |State(requests): State<Arc<AtomicUsize>>| async move {
                    requests.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"sequence": sequence, "bids": [], "asks": []}))
                }),
            )
            .with_state(requests.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), requests)
    }

    /// Feed server. Connection `n` receives `sessions[n]` after subscribing.
    ///
    /// With `drain` the server keeps reading and counts close frames.
    /// Without it the socket is held open and never read, like a dead peer.
    async fn serve_feed(
        sessions: Vec<Vec<String>>,
        drain: bool,
    ) -> (String, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let (conn_count, close_count) = (connections.clone(), closes.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let n = conn_count.fetch_add(1, Ordering::SeqCst);
                let frames = sessions.get(n).cloned().unwrap_or_default();
                let close_count = close_count.clone();

                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(socket).await else {
                        return;
                    };
                    let _subscribe = ws.next().await;
                    for frame in frames {
                        if ws.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    if drain {
                        while let Some(Ok(msg)) = ws.next().await {
                            if msg.is_close() {
                                close_count.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                        }
                    } else {
                        sleep(Duration::from_secs(60)).await;
                        drop(ws);
                    }
                });
            }
        });

        (format!("ws://{}", addr), connections, closes)
    }

    fn open(sequence: u64, order_id: &str) -> String {
        serde_json::json!({
            "type": "open", "product_id": "BTC-USD", "sequence": sequence,
            "order_id": order_id, "price": "10", "remaining_size": "1", "side": "sell"
        })
        .to_string()
    }

    fn trade(sequence: u64) -> String {
        serde_json::json!({
            "type": "match", "product_id": "BTC-USD", "sequence": sequence,
            "price": "10", "size": "0.5", "side": "sell"
        })
        .to_string()
    }

    fn config(ws: &str, rest: &str) -> Config {
        Config {
            products: vec!["BTC-USD".to_string()],
            ws_endpoint: ws.to_string(),
            rest_endpoint: rest.to_string(),
            flush_interval_ms: 60_000,
            reconnect_delay_ms: 10,
            ..Config::default()
        }
    }

    struct Running {
        store: Store,
        metrics: Arc<Metrics>,
        shutdown: watch::Sender<bool>,
        manager: JoinHandle<Result<()>>,
        persister: JoinHandle<Result<()>>,
    }

    async fn start(config: Config) -> Running {
        let store = Store::in_memory().await.unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let (persister, persister_task) =
            Persister::new(store.clone(), config.flush_max_retries, metrics.clone())
                .spawn(config.channel_capacity);

        let state = Arc::new(AppState {
            config: Arc::new(config),
            store: store.clone(),
            metrics: metrics.clone(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = RecorderManager::new(state, persister, shutdown_rx).unwrap();

        Running {
            store,
            metrics,
            shutdown: shutdown_tx,
            manager: tokio::spawn(manager.run()),
            persister: persister_task,
        }
    }

    impl Running {
        /// Signal shutdown and join both stages
        async fn stop(self) -> Store {
            self.shutdown.send(true).unwrap();
            self.manager.await.unwrap().unwrap();
            self.persister.await.unwrap().unwrap();
            self.store
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !check().await {
            assert!(Instant::now() < deadline, "condition not reached within 10s");
            sleep(Duration::from_millis(20)).await;
        }
    }

    fn at_least(counter: &Arc<AtomicUsize>, n: usize) -> impl FnMut() -> std::future::Ready<bool> {
        let counter = counter.clone();
        move || std::future::ready(counter.load(Ordering::SeqCst) >= n)
    }

    #[tokio::test]
    async fn test_silent_feed_reconnects_while_flush_ticks_fire() {
        let (rest, snapshots) = serve_books(100).await;
        let (ws, connections, _) = serve_feed(vec![], false).await;

        let running = start(Config {
            read_timeout_secs: 1,
            flush_interval_ms: 100,
            ..config(&ws, &rest)
        })
        .await;

        eventually(at_least(&connections, 2)).await;
        eventually(at_least(&snapshots, 2)).await;
        running.stop().await;
    }

    #[tokio::test]
    async fn test_gap_resyncs_after_pending_events_are_stored() {
        let (rest, snapshots) = serve_books(100).await;
        let (ws, connections, closes) =
            serve_feed(vec![vec![open(101, X), open(105, Y)]], true).await;

        let running = start(config(&ws, &rest)).await;
        let x = Uuid::parse_str(X).unwrap();

        // X was handed off and stored before the second reconciliation, which
        // then closed it because the fresh snapshot no longer lists it
        let store = running.store.clone();
        eventually(move || {
            let store = store.clone();
            async move {
                let history = store.order_history(x).await.unwrap();
                history.len() == 1 && history[0].ending_at.is_some()
            }
        })
        .await;

        assert!(snapshots.load(Ordering::SeqCst) >= 2);
        assert!(connections.load(Ordering::SeqCst) >= 2);
        assert_eq!(running.metrics.sequence_gaps.get(), 1);
        let metrics = running.metrics.clone();
        eventually(move || std::future::ready(metrics.resyncs.get() >= 2)).await;
        eventually(at_least(&closes, 1)).await;

        let store = running.stop().await;
        let y = Uuid::parse_str(Y).unwrap();
        assert!(store.order_history(y).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_persists_partial_batch() {
        let (rest, snapshots) = serve_books(100).await;
        let (ws, _, closes) = serve_feed(vec![vec![open(101, X), trade(102)]], true).await;

        let running = start(config(&ws, &rest)).await;
        let metrics = running.metrics.clone();
        eventually(move || std::future::ready(metrics.messages_received.get() >= 2)).await;

        // Nothing reached storage yet: batch threshold and flush age are far away
        assert_eq!(running.store.count_trades().await.unwrap(), 0);

        let store = running.stop().await;
        assert_eq!(store.count_trades().await.unwrap(), 1);
        let history = store.order_history(Uuid::parse_str(X).unwrap()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_open());
        assert_eq!(history[0].amount, dec!(1));

        assert_eq!(snapshots.load(Ordering::SeqCst), 1);
        eventually(at_least(&closes, 1)).await;
    }
}
