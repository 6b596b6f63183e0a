//! octrum-core - client core for the Octrum camera monitor
//!
//! A receive-only WHEP live view session and a resilient WebSocket alert channel.

pub mod collaborators;
pub mod config;
pub mod state;
pub mod timer;
pub mod transport;
pub mod webrtc;

#[cfg(test)]
mod testing;

// Re-exports
pub use collaborators::{LogNotificationSink, NotificationSink, SessionProvider, StaticSession};
pub use config::{Config, ConfigError};
pub use state::{ConnectionState, FailureReason};
pub use transport::{AppPhase, ChannelConfig, ChannelError, EventChannel, ReconnectPolicy};
pub use crate::webrtc::{SessionError, SignalingSession, TrackSupervisor};
