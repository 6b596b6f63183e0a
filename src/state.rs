//! Connection state shared by the WHEP session and the alert channel.

use std::fmt;

/// Why a component stopped in [`ConnectionState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Input rejected before any resource was allocated
    InvalidUrl(String),
    /// Offer/answer exchange failed for the current attempt
    Negotiation(String),
    /// Automatic reconnection gave up
    ReconnectExhausted { attempts: u32 },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::InvalidUrl(url) => write!(f, "invalid URL: {}", url),
            FailureReason::Negotiation(msg) => write!(f, "negotiation failed: {}", msg),
            FailureReason::ReconnectExhausted { attempts } => {
                write!(f, "gave up after {} reconnect attempts", attempts)
            }
        }
    }
}

/// Lifecycle of a connection-owning component
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing open
    #[default]
    Idle,
    /// Resources allocated, waiting for the remote side
    Connecting,
    /// Media track or socket is live
    Connected,
    /// Stopped; resources were torn down in the same transition
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Idle)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    /// Connecting or connected
    pub fn is_active(&self) -> bool {
        self.is_connecting() || self.is_connected()
    }

    /// Short label for status displays ("Offline" / "Connecting" / "Live")
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Offline",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Live",
            ConnectionState::Failed(_) => "Offline",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}
