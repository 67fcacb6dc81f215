//! WebSocket client for the full-detail feed
//!
//! Handles connection, subscription, and frame reception. Reconnecting is left
//! to the manager, which has to resynchronize before reading again.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::error::{RecorderError, Result};
use crate::parser::SubscribeRequest;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One read from the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data message, in arrival order
    Text(String),
    /// Ping/pong or other frame without a payload for us
    Control,
    /// The exchange closed the stream gracefully
    End,
}

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
    endpoint: String,
    products: Vec<String>,
}

impl WebSocketClient {
    /// Create a new WebSocket client
    pub fn new(endpoint: &str, products: Vec<String>) -> Self {
        Self {
            stream: None,
            endpoint: endpoint.to_string(),
            products,
        }
    }

    /// Connect to the feed and subscribe to the full channel
    pub async fn connect(&mut self) -> Result<()> {
        info!(url = %self.endpoint, products = ?self.products, "Connecting to feed");

        let (mut ws_stream, response) = connect_async(&self.endpoint).await.map_err(|e| {
            RecorderError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;
        info!(status = ?response.status(), "WebSocket connected");

        let request = serde_json::to_string(&SubscribeRequest::full(&self.products))?;
        ws_stream
            .send(Message::Text(request))
            .await
            .map_err(|e| RecorderError::WebSocketConnection(format!("Failed to subscribe: {}", e)))?;

        self.stream = Some(ws_stream);
        Ok(())
    }

    /// Receive the next frame.
    ///
    /// Cancel-safe up to the point a frame is taken off the stream, so it can
    /// sit in a `select!` next to the caller's idle deadline.
    pub async fn recv(&mut self) -> Result<Frame> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RecorderError::WebSocketConnection("Not connected".to_string()))?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Frame::Text(text)),
            Some(Ok(Message::Binary(data))) => {
                Ok(Frame::Text(String::from_utf8_lossy(&data).into_owned()))
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(stream) = self.stream.as_mut() {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Ok(Frame::Control)
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(Frame::Control),
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Ok(Frame::End)
            }
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(RecorderError::WebSocketMessage(e.to_string()))
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Ok(Frame::End)
            }
        }
    }

    /// Send a ping to keep connection alive
    pub async fn ping(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream
                .send(Message::Ping(vec![]))
                .await
                .map_err(|e| RecorderError::WebSocketMessage(e.to_string()))?;
        }
        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the connection
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}
