//! WHEP session management
//!
//! Manages the lifecycle of one receive-only live view:
//! - Peer connection creation and teardown
//! - Offer/answer exchange with the WHEP endpoint
//! - Inbound video track publication and supervision
//!
//! Every connect() starts a new generation. Completions carry the generation
//! they were started with and are dropped once it is no longer current, so a
//! late answer or track can never revive a torn-down session.

use super::endpoint::{normalize_endpoint, validate_endpoint};
use super::signaling::WhepSignaler;
use super::supervisor::TrackSupervisor;
use super::transport::{
    MediaTransport, SharedTrack, TransportConfig, TransportEvent, TransportFactory,
};
use super::SessionError;
use crate::state::ConnectionState;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

/// One live view: at most one peer connection at a time.
pub struct SignalingSession {
    shared: Arc<Shared>,
}

struct Shared {
    factory: Arc<dyn TransportFactory>,
    signaler: Arc<dyn WhepSignaler>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    track_tx: watch::Sender<Option<SharedTrack>>,
}

struct Inner {
    generation: u64,
    state: ConnectionState,
    session_id: String,
    endpoint: Option<Url>,
    transport: Option<Arc<dyn MediaTransport>>,
    track: Option<SharedTrack>,
    supervisor: TrackSupervisor,
    events_task: Option<JoinHandle<()>>,
}

impl Inner {
    /// Drop everything the current generation owns and start a new one.
    /// The returned transport still has to be closed by the caller.
    fn release(&mut self) -> Option<Arc<dyn MediaTransport>> {
        self.generation += 1;
        self.supervisor.cancel();
        if let Some(task) = self.events_task.take() {
            task.abort();
        }
        if let Some(track) = self.track.take() {
            track.set_enabled(false);
        }
        self.transport.take()
    }
}

impl SignalingSession {
    pub fn new(factory: Arc<dyn TransportFactory>, signaler: Arc<dyn WhepSignaler>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (track_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                factory,
                signaler,
                inner: Mutex::new(Inner {
                    generation: 0,
                    state: ConnectionState::Idle,
                    session_id: String::new(),
                    endpoint: None,
                    transport: None,
                    track: None,
                    supervisor: TrackSupervisor::new(),
                    events_task: None,
                }),
                state_tx,
                track_tx,
            }),
        }
    }

    /// Session backed by webrtc-rs and reqwest.
    #[cfg(feature = "webrtc-streaming")]
    pub fn with_timeouts(
        timeouts: super::signaling::WhepTimeouts,
    ) -> Result<Self, super::signaling::SignalingError> {
        let signaler = super::signaling::HttpWhepSignaler::new(timeouts)?;
        Ok(Self::new(
            Arc::new(super::peer_connection::PeerConnectionFactory::new()),
            Arc::new(signaler),
        ))
    }

    /// Start negotiating with the stream at `raw_url`.
    ///
    /// Returns immediately; progress is reported through [`Self::subscribe_state`]
    /// and [`Self::subscribe_track`]. A session that is already up is torn
    /// down first. Must be called from within a tokio runtime.
    pub fn connect(&self, raw_url: &str) {
        let normalized = normalize_endpoint(raw_url);
        let url = match validate_endpoint(&normalized) {
            Ok(url) => url,
            Err(e) => {
                error!("WHEP: {}", e);
                self.shared.fail_now(e);
                return;
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let (generation, previous) = {
            let mut inner = self.shared.inner.lock();
            let previous = inner.release();
            self.shared.track_tx.send_replace(None);
            inner.session_id = session_id.clone();
            inner.endpoint = Some(url.clone());
            self.shared.set_state(&mut inner, ConnectionState::Connecting);
            (inner.generation, previous)
        };
        info!("WHEP: Starting connection {} to {}", session_id, url);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                debug!("WHEP: Closing superseded peer connection");
                previous.close().await;
            }
            match shared.negotiate(generation, &url).await {
                Ok(()) => {
                    info!("WHEP: Remote description set for {}, waiting for tracks", session_id)
                }
                Err(SessionError::Stale) => {
                    debug!("WHEP: Discarding superseded negotiation {}", session_id)
                }
                Err(e) => shared.fail(generation, e).await,
            }
        });
    }

    /// Tear the session down. No-op when already idle.
    pub async fn disconnect(&self) {
        self.shared.disconnect(None).await;
    }

    /// Pulse the current track and republish it so renderers re-attach.
    pub fn refresh_video_track(&self) {
        let mut inner = self.shared.inner.lock();
        let Some(track) = inner.track.clone() else {
            warn!("WHEP: No video track to refresh");
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        inner.supervisor.refresh(track, move |track| {
            if let Some(shared) = weak.upgrade() {
                shared.republish(track);
            }
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn inbound_track(&self) -> Option<SharedTrack> {
        self.shared.inner.lock().track.clone()
    }

    /// Track changes; a refresh republishes the same track to force re-attach.
    pub fn subscribe_track(&self) -> watch::Receiver<Option<SharedTrack>> {
        self.shared.track_tx.subscribe()
    }

    /// Normalized endpoint of the latest connect()
    pub fn endpoint(&self) -> Option<Url> {
        self.shared.inner.lock().endpoint.clone()
    }

    /// When the pending track validation fires, if one is armed
    pub fn validation_deadline(&self) -> Option<Instant> {
        self.shared.inner.lock().supervisor.validation_deadline()
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        let transport = self.shared.inner.lock().release();
        if let Some(transport) = transport {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { transport.close().await });
            }
        }
    }
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!("WHEP: state {} -> {}", inner.state, state);
        }
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn ensure_current(&self, generation: u64) -> Result<(), SessionError> {
        if self.inner.lock().generation == generation {
            Ok(())
        } else {
            Err(SessionError::Stale)
        }
    }

    async fn negotiate(self: &Arc<Self>, generation: u64, url: &Url) -> Result<(), SessionError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // Direct path only: no STUN/TURN servers.
        let config = TransportConfig::default();
        let transport = self
            .factory
            .create(&config, events_tx)
            .await
            .map_err(SessionError::TransportCreate)?;

        if !self.install(generation, transport.clone(), events_rx) {
            transport.close().await;
            return Err(SessionError::Stale);
        }

        transport
            .add_recvonly_video_transceiver()
            .await
            .map_err(SessionError::Transceiver)?;

        let offer = transport.create_offer().await.map_err(SessionError::Offer)?;
        self.ensure_current(generation)?;

        let local_sdp = transport
            .set_local_description(&offer)
            .await
            .map_err(SessionError::LocalDescription)?;
        self.ensure_current(generation)?;
        info!("WHEP: Local description set. Sending offer...");

        let answer = self
            .signaler
            .post_offer(url, &local_sdp)
            .await
            .map_err(SessionError::Signaling)?;
        self.ensure_current(generation)?;

        transport
            .set_remote_description(&answer)
            .await
            .map_err(SessionError::RemoteDescription)?;
        Ok(())
    }

    /// Adopt `transport` if `generation` is still current.
    fn install(
        self: &Arc<Self>,
        generation: u64,
        transport: Arc<dyn MediaTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.transport = Some(transport);
        let weak = Arc::downgrade(self);
        inner.events_task = Some(tokio::spawn(pump_events(weak, generation, events)));
        true
    }

    fn acquire_track(&self, generation: u64, track: SharedTrack) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if inner.track.as_ref().is_some_and(|current| current.id() == track.id()) {
            debug!("WHEP: Track {} already acquired", track.id());
            return;
        }

        info!("WHEP: Video track received - enabled: {}", track.is_enabled());
        track.set_enabled(true);
        if let Some(old) = inner.track.replace(track.clone()) {
            info!("WHEP: Disabling previous video track {}", old.id());
            old.set_enabled(false);
        }
        self.track_tx.send_replace(Some(track.clone()));
        self.set_state(&mut inner, ConnectionState::Connected);
        info!(
            "WHEP: Video track {} set - readyState: {:?}",
            track.id(),
            track.ready_state()
        );
        inner.supervisor.start_validation(track);
    }

    fn republish(&self, track: &SharedTrack) {
        let inner = self.inner.lock();
        if inner.track.as_ref().is_some_and(|current| current.id() == track.id()) {
            self.track_tx.send_replace(Some(track.clone()));
        }
    }

    /// Teardown into Failed for the given generation.
    async fn fail(&self, generation: u64, err: SessionError) {
        let transport = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!("WHEP: Ignoring failure of superseded negotiation: {}", err);
                return;
            }
            error!("WHEP: Session {} failed: {}", inner.session_id, err);
            let transport = inner.release();
            self.track_tx.send_replace(None);
            self.set_state(&mut inner, ConnectionState::Failed(err.failure_reason()));
            transport
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    /// Failure detected before a negotiation was started (bad input).
    fn fail_now(self: &Arc<Self>, err: SessionError) {
        let transport = {
            let mut inner = self.inner.lock();
            let transport = inner.release();
            self.track_tx.send_replace(None);
            self.set_state(&mut inner, ConnectionState::Failed(err.failure_reason()));
            transport
        };
        if let Some(transport) = transport {
            tokio::spawn(async move { transport.close().await });
        }
    }

    /// With `expected`, only tear down if that generation is still current.
    async fn disconnect(&self, expected: Option<u64>) {
        let transport = {
            let mut inner = self.inner.lock();
            if expected.is_some_and(|generation| generation != inner.generation) {
                return;
            }
            if inner.state.is_idle() {
                return;
            }
            info!("WHEP: Disconnecting session {}", inner.session_id);
            let transport = inner.release();
            self.track_tx.send_replace(None);
            self.set_state(&mut inner, ConnectionState::Idle);
            transport
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}

async fn pump_events(
    shared: Weak<Shared>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = shared.upgrade() else {
            return;
        };
        match event {
            TransportEvent::StreamAdded(track) | TransportEvent::ReceiverAdded(track) => {
                session.acquire_track(generation, track);
            }
            TransportEvent::IceConnectionStateChanged(state) => {
                info!("WHEP: Connection state changed to {:?}", state);
                if state.is_terminal() {
                    // Teardown aborts this task, so run it detached.
                    tokio::spawn(async move { session.disconnect(Some(generation)).await });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FailureReason;
    use crate::testing::{settle, MockFactory, MockSignaler, MockTrack};
    use crate::webrtc::supervisor::VALIDATION_DELAY;
    use crate::webrtc::transport::{IceConnectionState, VideoTrack};
    use std::time::Duration;
    use tokio::time;

    const ANSWER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\n";

    fn session(factory: &Arc<MockFactory>, signaler: &Arc<MockSignaler>) -> SignalingSession {
        SignalingSession::new(factory.clone(), signaler.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_supervises_inbound_track() {
        let factory = MockFactory::new();
        let signaler = MockSignaler::answering(ANSWER);
        let session = session(&factory, &signaler);

        session.connect("https://cam.local:8889/stream1");
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(
            session.endpoint().map(|u| u.to_string()),
            Some("https://cam.local:8889/stream1/whep".to_string())
        );
        settle().await;

        let posts = signaler.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "https://cam.local:8889/stream1/whep");
        let transport = factory.last().unwrap();
        assert_eq!(transport.recvonly_transceivers(), 1);
        assert_eq!(transport.local_sdp().as_deref(), Some(posts[0].1.as_str()));
        assert_eq!(transport.remote_sdp().as_deref(), Some(ANSWER));
        assert_eq!(factory.configs()[0].ice_servers.len(), 0);

        time::sleep(Duration::from_millis(50)).await;
        let track = MockTrack::live("video0");
        track.set_enabled(false);
        transport.emit(TransportEvent::ReceiverAdded(track.clone()));
        let mut state = session.subscribe_state();
        state.wait_for(|s| s.is_connected()).await.unwrap();

        assert!(track.is_enabled());
        assert_eq!(session.inbound_track().map(|t| t.id().to_string()), Some("video0".into()));
        let deadline = session.validation_deadline().expect("validation armed");
        let remaining = deadline - Instant::now();
        assert!(remaining <= VALIDATION_DELAY && remaining > VALIDATION_DELAY - Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn http_error_fails_and_closes_transport() {
        let factory = MockFactory::new();
        let signaler = MockSignaler::status(500);
        let session = session(&factory, &signaler);

        session.connect("https://cam.local:8889/stream1");
        settle().await;

        assert!(matches!(session.state(), ConnectionState::Failed(FailureReason::Negotiation(_))));
        assert!(session.inbound_track().is_none());
        assert!(factory.last().unwrap().is_closed());
        assert_eq!(factory.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn each_negotiation_step_failure_is_terminal() {
        for step in ["offer", "local", "remote", "transceiver"] {
            let factory = MockFactory::new();
            factory.fail_step(step);
            let signaler = MockSignaler::answering(ANSWER);
            let session = session(&factory, &signaler);

            session.connect("http://cam.local/s");
            settle().await;

            assert!(session.state().is_failed(), "step {}", step);
            assert!(factory.last().unwrap().is_closed(), "step {}", step);
        }

        let factory = MockFactory::new();
        factory.fail_step("create");
        let session = session(&factory, &MockSignaler::answering(ANSWER));
        session.connect("http://cam.local/s");
        settle().await;
        assert!(session.state().is_failed());
        assert!(factory.last().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_url_fails_without_allocating() {
        let factory = MockFactory::new();
        let signaler = MockSignaler::answering(ANSWER);
        let session = session(&factory, &signaler);

        session.connect("rtsp://cam.local/stream1");
        assert_eq!(
            session.state(),
            ConnectionState::Failed(FailureReason::InvalidUrl("rtsp://cam.local/stream1/whep".into()))
        );
        settle().await;
        assert!(factory.last().is_none());
        assert!(signaler.posts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_leaves_one_live_transport() {
        let factory = MockFactory::new();
        let signaler = MockSignaler::answering(ANSWER);
        let session = session(&factory, &signaler);

        session.connect("http://cam.local/a");
        session.connect("http://cam.local/b");
        settle().await;

        assert_eq!(factory.live_count(), 1);
        let transports = factory.transports();
        assert!(transports[..transports.len() - 1].iter().all(|t| t.is_closed()));
        assert_eq!(signaler.posts().len(), 1);
        assert_eq!(signaler.posts()[0].0, "http://cam.local/b/whep");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_during_inflight_post_disposes_first_transport() {
        let factory = MockFactory::new();
        let signaler = MockSignaler::answering(ANSWER);
        signaler.hold();
        let session = session(&factory, &signaler);

        session.connect("http://cam.local/a");
        settle().await;
        let first = factory.last().unwrap();
        assert_eq!(signaler.posts().len(), 1);

        session.connect("http://cam.local/b");
        settle().await;
        signaler.release_all();
        settle().await;

        assert!(first.is_closed());
        assert!(first.remote_sdp().is_none(), "stale answer must not be applied");
        assert_eq!(factory.transports().len(), 2);
        assert_eq!(factory.live_count(), 1);
        assert!(factory.last().unwrap().remote_sdp().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let factory = MockFactory::new();
        let session = session(&factory, &MockSignaler::answering(ANSWER));
        let mut state = session.subscribe_state();
        state.mark_unchanged();

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(!state.has_changed().unwrap());

        session.connect("http://cam.local/a");
        settle().await;
        let transport = factory.last().unwrap();
        let track = MockTrack::live("v");
        transport.emit(TransportEvent::StreamAdded(track.clone()));
        settle().await;
        assert!(session.state().is_connected());

        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(transport.is_closed());
        assert_eq!(transport.close_calls(), 1);
        assert!(!track.is_enabled());
        assert!(session.inbound_track().is_none());
        assert!(session.validation_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_post_discards_response() {
        for status in [None, Some(502)] {
            let factory = MockFactory::new();
            let signaler = match status {
                None => MockSignaler::answering(ANSWER),
                Some(code) => MockSignaler::status(code),
            };
            signaler.hold();
            let session = session(&factory, &signaler);

            session.connect("http://cam.local/a");
            settle().await;
            session.disconnect().await;
            assert_eq!(session.state(), ConnectionState::Idle);

            signaler.release_all();
            settle().await;
            let transport = factory.last().unwrap();
            transport.emit(TransportEvent::ReceiverAdded(MockTrack::live("late")));
            settle().await;

            assert_eq!(session.state(), ConnectionState::Idle);
            assert!(session.inbound_track().is_none());
            assert!(transport.remote_sdp().is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_track_notifications_acquire_once() {
        let factory = MockFactory::new();
        let session = session(&factory, &MockSignaler::answering(ANSWER));
        let mut tracks = session.subscribe_track();

        session.connect("http://cam.local/a");
        settle().await;
        tracks.mark_unchanged();
        let transport = factory.last().unwrap();
        let track = MockTrack::live("v");
        transport.emit(TransportEvent::StreamAdded(track.clone()));
        transport.emit(TransportEvent::ReceiverAdded(track.clone()));
        settle().await;

        assert!(tracks.has_changed().unwrap());
        tracks.mark_unchanged();
        assert_eq!(track.toggles(), vec![true]);

        let replacement = MockTrack::live("v2");
        transport.emit(TransportEvent::ReceiverAdded(replacement.clone()));
        settle().await;
        assert!(!track.is_enabled(), "previous track disabled, not destroyed");
        assert_eq!(session.inbound_track().map(|t| t.id().to_string()), Some("v2".into()));
        assert!(tracks.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_ice_state_tears_down_without_reconnect() {
        for ice in [
            IceConnectionState::Failed,
            IceConnectionState::Disconnected,
            IceConnectionState::Closed,
        ] {
            let factory = MockFactory::new();
            let session = session(&factory, &MockSignaler::answering(ANSWER));
            session.connect("http://cam.local/a");
            settle().await;
            let transport = factory.last().unwrap();
            transport.emit(TransportEvent::ReceiverAdded(MockTrack::live("v")));
            transport.emit(TransportEvent::IceConnectionStateChanged(IceConnectionState::Checking));
            settle().await;
            assert!(session.state().is_connected());

            transport.emit(TransportEvent::IceConnectionStateChanged(ice));
            settle().await;
            assert_eq!(session.state(), ConnectionState::Idle, "{:?}", ice);
            assert!(transport.is_closed());

            time::sleep(Duration::from_secs(60)).await;
            assert_eq!(factory.transports().len(), 1, "no automatic reconnect");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_republishes_track() {
        let factory = MockFactory::new();
        let session = session(&factory, &MockSignaler::answering(ANSWER));
        session.connect("http://cam.local/a");
        settle().await;
        let track = MockTrack::live("v");
        factory.last().unwrap().emit(TransportEvent::ReceiverAdded(track.clone()));
        settle().await;

        let mut tracks = session.subscribe_track();
        tracks.mark_unchanged();
        session.refresh_video_track();
        assert!(!track.is_enabled());
        time::sleep(Duration::from_millis(310)).await;

        assert!(track.is_enabled());
        assert!(tracks.has_changed().unwrap());
        assert_eq!(tracks.borrow_and_update().as_ref().map(|t| t.id().to_string()), Some("v".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_track_stays_disabled_after_refresh() {
        let factory = MockFactory::new();
        let session = session(&factory, &MockSignaler::answering(ANSWER));
        session.connect("http://cam.local/a");
        settle().await;
        let transport = factory.last().unwrap();
        let first = MockTrack::live("a");
        transport.emit(TransportEvent::ReceiverAdded(first.clone()));
        settle().await;

        session.refresh_video_track();
        assert!(!first.is_enabled());
        transport.emit(TransportEvent::ReceiverAdded(MockTrack::live("b")));
        settle().await;
        time::sleep(Duration::from_millis(400)).await;

        assert!(!first.is_enabled(), "refresh of the replaced track was dropped");
        assert_eq!(session.inbound_track().map(|t| t.id().to_string()), Some("b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_without_track_is_harmless() {
        let factory = MockFactory::new();
        let session = session(&factory, &MockSignaler::answering(ANSWER));
        session.refresh_video_track();
        assert_eq!(session.state(), ConnectionState::Idle);
    }
}
