//! Level-3 snapshot download

use std::time::Duration;
use tracing::info;

use crate::error::{RecorderError, Result};
use crate::parser::BookSnapshot;

const USER_AGENT: &str = concat!("orderflow-recorder/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pulls full order-book listings over REST
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    client: reqwest::Client,
    rest_endpoint: String,
}

impl SnapshotFetcher {
    pub fn new(rest_endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            rest_endpoint: rest_endpoint.trim_end_matches('/').to_string(),
        })
    }

    pub fn book_url(&self, product: &str) -> String {
        format!("{}/products/{}/book?level=3", self.rest_endpoint, product)
    }

    /// Every resting order of `product` plus the sequence the listing is exact at.
    ///
    /// Non-2xx responses and undecodable payloads are errors; retrying is the
    /// caller's decision.
    pub async fn fetch(&self, product: &str) -> Result<BookSnapshot> {
        let url = self.book_url(product);
        info!(product = %product, url = %url, "Fetching order book snapshot");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecorderError::RestApiError(format!(
                "snapshot for {} returned {}: {}",
                product, status, body
            )));
        }

        let bytes = response.bytes().await?;
        let snapshot: BookSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| RecorderError::RestApiError(format!("malformed snapshot for {}: {}", product, e)))?;

        info!(
            product = %product,
            sequence = snapshot.sequence,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Snapshot downloaded"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_url() {
        let fetcher = SnapshotFetcher::new("https://api.exchange.coinbase.com/").unwrap();
        assert_eq!(
            fetcher.book_url("BTC-USD"),
            "https://api.exchange.coinbase.com/products/BTC-USD/book?level=3"
        );
    }

    /// Serve canned book responses on an ephemeral local port
    async fn serve_books() -> String {
        use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};

        async fn book(Path(product): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
            match product.as_str() {
                "BTC-USD" => (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "sequence": 42,
                        "bids": [["10.00", "1.5", "3b0f1225-7f84-490b-a29f-0faef9de823a"]],
                        "asks": []
                    })),
                ),
                "BAD-USD" => (StatusCode::OK, Json(serde_json::json!({"bids": []}))),
                _ => (
                    StatusCode::NOT_FOUND,
                    Json(serde_json::json!({"message": "NotFound"})),
                ),
            }
        }

        let app = Router::new().route("/products/:product/book", get(book));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_fetch_snapshot() {
        let fetcher = SnapshotFetcher::new(&serve_books().await).unwrap();

        let snapshot = fetcher.fetch("BTC-USD").await.unwrap();
        assert_eq!(snapshot.sequence, 42);
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_surfaces_failures() {
        let fetcher = SnapshotFetcher::new(&serve_books().await).unwrap();

        assert!(matches!(
            fetcher.fetch("NOPE-USD").await,
            Err(RecorderError::RestApiError(_))
        ));
        assert!(matches!(
            fetcher.fetch("BAD-USD").await,
            Err(RecorderError::RestApiError(_))
        ));
    }
}
