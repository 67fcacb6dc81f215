//! WebSocket module for feed connection management

mod client;
mod manager;

pub use client::{Frame, WebSocketClient};
pub use manager::RecorderManager;
