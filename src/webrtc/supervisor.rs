//! Inbound track supervision
//!
//! Workaround for renderers that keep showing a black or frozen frame while
//! the track reports itself live and enabled: toggling `enabled` forces the
//! decode pipeline to re-attach. The delays were tuned against real decoders
//! and must not be changed casually.

use super::transport::{SharedTrack, TrackReadyState};
use crate::timer::OneShotTimer;
use log::{debug, info};
use std::time::Duration;
use tokio::time::{self, Instant};

/// Delay between track acquisition and the first validation
pub const VALIDATION_DELAY: Duration = Duration::from_millis(3000);
/// Disabled interval of an automatic refresh pulse
pub const REFRESH_PULSE_GAP: Duration = Duration::from_millis(200);
/// Wait after the first pulse before the second one
pub const SECOND_PULSE_DELAY: Duration = Duration::from_millis(1000);
/// Disabled interval of a manual refresh pulse
pub const MANUAL_PULSE_GAP: Duration = Duration::from_millis(300);

/// Owns the validation and manual-refresh timers of one session.
#[derive(Debug)]
pub struct TrackSupervisor {
    validation: OneShotTimer,
    manual_refresh: OneShotTimer,
}

impl Default for TrackSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackSupervisor {
    pub fn new() -> Self {
        Self {
            validation: OneShotTimer::new("track-validation"),
            manual_refresh: OneShotTimer::new("track-refresh"),
        }
    }

    /// Arm the validation cycle for `track`, replacing any pending one.
    ///
    /// A manual refresh still in flight belongs to the previous track and is
    /// dropped, so it cannot re-enable that track.
    pub fn start_validation(&mut self, track: SharedTrack) {
        self.manual_refresh.cancel();
        self.validation.arm(VALIDATION_DELAY, validate(track));
    }

    /// Single disable -> 300ms -> enable pulse, then `republish`.
    pub fn refresh<F>(&mut self, track: SharedTrack, republish: F)
    where
        F: FnOnce(&SharedTrack) + Send + 'static,
    {
        info!("WHEP: Manual video track refresh requested");
        track.set_enabled(false);
        self.manual_refresh.arm(MANUAL_PULSE_GAP, async move {
            track.set_enabled(true);
            info!("WHEP: Manual refresh completed");
            republish(&track);
        });
    }

    /// Stop all pending supervision work.
    pub fn cancel(&mut self) {
        self.validation.cancel();
        self.manual_refresh.cancel();
    }

    pub fn validation_deadline(&self) -> Option<Instant> {
        self.validation.deadline()
    }

    pub fn is_validation_pending(&self) -> bool {
        self.validation.is_pending()
    }
}

async fn validate(track: SharedTrack) {
    debug!(
        "WHEP: Validating video track {} - enabled: {}, readyState: {:?}",
        track.id(),
        track.is_enabled(),
        track.ready_state()
    );

    if !track.is_enabled() {
        info!("WHEP: Re-enabling video track {}", track.id());
        track.set_enabled(true);
    }

    if track.ready_state() != TrackReadyState::Live {
        return;
    }

    info!("WHEP: Refresh pulse for black screen prevention");
    pulse(&track, REFRESH_PULSE_GAP).await;

    time::sleep(SECOND_PULSE_DELAY).await;
    if track.ready_state() == TrackReadyState::Live && track.is_enabled() {
        info!("WHEP: Secondary validation refresh");
        pulse(&track, REFRESH_PULSE_GAP).await;
    }
}

async fn pulse(track: &SharedTrack, gap: Duration) {
    track.set_enabled(false);
    time::sleep(gap).await;
    track.set_enabled(true);
}
