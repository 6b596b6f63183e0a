//! Alert transport
//!
//! Long-lived WebSocket connection to the alert service with automatic
//! reconnection and background keepalive.

pub mod backoff;
pub mod channel;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use channel::{AppPhase, ChannelConfig, EventChannel, ALERT_TITLE};
pub use websocket::{AlertConnector, AlertFrame, AlertSink, AlertSocket, AlertStream, TungsteniteConnector};

/// Alert socket failures. All of them route into the reconnect path.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
}
