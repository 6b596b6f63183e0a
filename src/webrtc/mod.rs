//! WHEP live view
//!
//! This module provides the receive-only WebRTC side of the client:
//! - WHEP endpoint normalization
//! - SDP offer/answer exchange over HTTP
//! - Peer connection lifecycle and inbound video track handling
//! - Track supervision against stale renderers

pub mod endpoint;
pub mod transport;
pub mod signaling;
pub mod session;
pub mod supervisor;
#[cfg(feature = "webrtc-streaming")]
pub mod peer_connection;

pub use endpoint::{normalize_endpoint, validate_endpoint, WHEP_PATH_SUFFIX};
pub use session::SignalingSession;
pub use signaling::{HttpWhepSignaler, SignalingError, WhepSignaler, WhepTimeouts};
pub use supervisor::TrackSupervisor;
pub use transport::{
    IceConnectionState, MediaTransport, SharedTrack, TrackReadyState, TransportConfig,
    TransportError, TransportEvent, TransportFactory, VideoTrack,
};
#[cfg(feature = "webrtc-streaming")]
pub use peer_connection::{PeerConnectionFactory, RemoteVideoTrack, VideoFrame};

use crate::state::FailureReason;

/// Errors raised while bringing up a WHEP session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// URL is not http(s) or has no host
    #[error("invalid WHEP URL: {0}")]
    InvalidUrl(String),
    /// Media transport could not be created
    #[error("peer connection creation failed: {0}")]
    TransportCreate(TransportError),
    /// Receive-only transceiver could not be attached
    #[error("transceiver setup failed: {0}")]
    Transceiver(TransportError),
    /// Local offer creation failed
    #[error("offer creation failed: {0}")]
    Offer(TransportError),
    /// Applying the local offer failed
    #[error("setting local description failed: {0}")]
    LocalDescription(TransportError),
    /// Offer POST failed at the HTTP layer
    #[error("signaling request failed: {0}")]
    Signaling(SignalingError),
    /// Remote description was rejected
    #[error("setting remote description failed: {0}")]
    RemoteDescription(TransportError),
    /// A newer connect() or a disconnect() superseded this attempt
    #[error("negotiation superseded")]
    Stale,
}

impl SessionError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            SessionError::InvalidUrl(url) => FailureReason::InvalidUrl(url.clone()),
            other => FailureReason::Negotiation(other.to_string()),
        }
    }
}
