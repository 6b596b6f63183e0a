//! octrum-monitor - Main entry point
//!
//! Headless client: keeps the alert channel open and, when a stream URL is
//! configured, holds a WHEP live view. State changes and alerts are logged.

mod args;

use args::Args;
use clap::Parser;
use log::{info, warn};
use octrum_core::{
    AppPhase, ConnectionState, EventChannel, LogNotificationSink, SessionProvider, StaticSession,
};
use octrum_core::transport::TungsteniteConnector;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    let config = args.load_config()?;

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { config.logging.level.as_str() };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("OCTRUM_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("octrum-monitor v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let session: Arc<dyn SessionProvider> = Arc::new(StaticSession::new(
        config.session.access_token.clone(),
        config.session.store_id.clone(),
    ));

    // Alert channel
    let channel = EventChannel::with_session(
        config.alerts.channel_config()?,
        Arc::new(TungsteniteConnector),
        Arc::new(LogNotificationSink),
        session,
    );
    let channel_watch = spawn_state_logger("alerts", channel.subscribe_state());
    channel.connect();
    if args.background {
        channel.set_app_phase(AppPhase::Background);
    }

    // Live view
    #[cfg(feature = "webrtc-streaming")]
    let live_view = match config.whep.url.as_deref() {
        Some(url) => {
            let session = octrum_core::SignalingSession::with_timeouts(config.whep.timeouts())?;
            let handle = spawn_state_logger("live view", session.subscribe_state());
            session.connect(url);
            Some((session, handle))
        }
        None => {
            info!("No WHEP url configured, live view disabled");
            None
        }
    };
    #[cfg(not(feature = "webrtc-streaming"))]
    if config.whep.url.is_some() {
        warn!("Built without webrtc-streaming, ignoring WHEP url");
    }

    // Wait for shutdown signal
    let _ = signal::ctrl_c().await;
    info!("Initiating graceful shutdown...");

    #[cfg(feature = "webrtc-streaming")]
    if let Some((session, handle)) = live_view {
        session.disconnect().await;
        handle.abort();
    }
    channel.disconnect().await;
    channel_watch.abort();

    info!("octrum-monitor stopped ({} alerts received)", channel.message_log().len());
    Ok(())
}

fn spawn_state_logger(
    component: &'static str,
    mut state: watch::Receiver<ConnectionState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            match current {
                ConnectionState::Failed(ref reason) => warn!("{}: {} ({})", component, current.label(), reason),
                _ => info!("{}: {}", component, current.label()),
            }
        }
    })
}
