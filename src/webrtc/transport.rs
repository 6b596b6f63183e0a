//! Media transport capability used by the WHEP session.
//!
//! The session never talks to a WebRTC stack directly. It drives a
//! [`MediaTransport`] created by a [`TransportFactory`] and listens for
//! [`TransportEvent`]s on a channel handed to the factory.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Errors reported by a media transport
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport creation failed: {0}")]
    Create(String),
    #[error("{0}")]
    Sdp(String),
    #[error("transceiver error: {0}")]
    Transceiver(String),
    #[error("transport already closed")]
    Closed,
}

/// Peer connection settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    /// STUN/TURN URLs; the live view uses none and relies on a direct path
    pub ice_servers: Vec<String>,
}

/// ICE connectivity as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States after which the session tears itself down
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IceConnectionState::Failed | IceConnectionState::Disconnected | IceConnectionState::Closed
        )
    }
}

/// Media flow state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReadyState {
    Live,
    Ended,
}

/// Inbound video track. Owned by the transport; the session only toggles it.
pub trait VideoTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn ready_state(&self) -> TrackReadyState;
}

pub type SharedTrack = Arc<dyn VideoTrack>;

/// Asynchronous notifications from a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Legacy stream-based notification carrying the stream's first video track
    StreamAdded(SharedTrack),
    /// Receiver-based notification
    ReceiverAdded(SharedTrack),
    IceConnectionStateChanged(IceConnectionState),
}

/// An exclusively owned peer connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Add one video transceiver with receive-only direction
    async fn add_recvonly_video_transceiver(&self) -> Result<(), TransportError>;
    /// Create a local offer and return its SDP text
    async fn create_offer(&self) -> Result<String, TransportError>;
    /// Apply the local offer. Returns the SDP to send, which may carry
    /// candidates gathered after the offer was created.
    async fn set_local_description(&self, sdp: &str) -> Result<String, TransportError>;
    /// Apply the remote answer SDP
    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError>;
    async fn close(&self);
}

/// Creates transports; events for the new transport go to `events`.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError>;
}
