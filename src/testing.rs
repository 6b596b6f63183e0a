//! In-memory doubles for the transport, signaling and socket seams.

use crate::collaborators::NotificationSink;
use crate::transport::websocket::{AlertConnector, AlertFrame, AlertSink, AlertSocket, AlertStream};
use crate::transport::ChannelError;
use crate::webrtc::signaling::{SignalingError, WhepSignaler};
use crate::webrtc::transport::{
    MediaTransport, TrackReadyState, TransportConfig, TransportError, TransportEvent,
    TransportFactory, VideoTrack,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use url::Url;

/// Let every ready task run, then advance the paused clock by 1ms.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    enabled: AtomicBool,
    ended: AtomicBool,
    toggles: Mutex<Vec<bool>>,
}

impl MockTrack {
    /// Live, enabled track
    pub fn live(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            toggles: Mutex::new(Vec::new()),
        })
    }

    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    /// Every set_enabled() value, in call order
    pub fn toggles(&self) -> Vec<bool> {
        self.toggles.lock().clone()
    }

    pub fn clear_toggles(&self) {
        self.toggles.lock().clear();
    }
}

impl VideoTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        self.toggles.lock().push(enabled);
    }

    fn ready_state(&self) -> TrackReadyState {
        if self.ended.load(Ordering::SeqCst) {
            TrackReadyState::Ended
        } else {
            TrackReadyState::Live
        }
    }
}

/// Records every transport it creates.
#[derive(Default)]
pub struct MockFactory {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    configs: Mutex<Vec<TransportConfig>>,
    failing: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make one step fail: "create", "transceiver", "offer", "local" or "remote".
    pub fn fail_step(&self, step: &str) {
        self.failing.lock().push(step.to_string());
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().last().cloned()
    }

    pub fn configs(&self) -> Vec<TransportConfig> {
        self.configs.lock().clone()
    }

    /// Transports not yet closed
    pub fn live_count(&self) -> usize {
        self.transports.lock().iter().filter(|t| !t.is_closed()).count()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, TransportError> {
        self.configs.lock().push(config.clone());
        let failing = self.failing.lock().clone();
        if failing.iter().any(|s| s == "create") {
            return Err(TransportError::Create("scripted".into()));
        }
        let transport = Arc::new(MockTransport {
            serial: self.transports.lock().len() as u32,
            events,
            failing,
            transceivers: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport as Arc<dyn MediaTransport>)
    }
}

pub struct MockTransport {
    serial: u32,
    events: mpsc::UnboundedSender<TransportEvent>,
    failing: Vec<String>,
    transceivers: AtomicU32,
    closes: AtomicU32,
    local: Mutex<Option<String>>,
    remote: Mutex<Option<String>>,
}

impl MockTransport {
    /// Deliver an event as the stack would; ignored once the session stopped listening.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }

    pub fn close_calls(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn recvonly_transceivers(&self) -> u32 {
        self.transceivers.load(Ordering::SeqCst)
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.local.lock().clone()
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.remote.lock().clone()
    }

    fn step(&self, name: &str) -> Result<(), TransportError> {
        if self.failing.iter().any(|s| s == name) {
            Err(TransportError::Sdp(format!("scripted {} failure", name)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn add_recvonly_video_transceiver(&self) -> Result<(), TransportError> {
        self.step("transceiver")?;
        self.transceivers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        self.step("offer")?;
        Ok(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n",
            self.serial
        ))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<String, TransportError> {
        self.step("local")?;
        *self.local.lock() = Some(sdp.to_string());
        Ok(sdp.to_string())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError> {
        self.step("remote")?;
        *self.remote.lock() = Some(sdp.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Signaler with a scripted response and an optional hold on in-flight POSTs
pub struct MockSignaler {
    response: Result<String, u16>,
    posts: Mutex<Vec<(String, String)>>,
    gate: watch::Sender<bool>,
}

impl MockSignaler {
    pub fn answering(answer: &str) -> Arc<Self> {
        Self::build(Ok(answer.to_string()))
    }

    /// Every POST fails with this HTTP status
    pub fn status(code: u16) -> Arc<Self> {
        Self::build(Err(code))
    }

    fn build(response: Result<String, u16>) -> Arc<Self> {
        let (gate, _) = watch::channel(false);
        Arc::new(Self {
            response,
            posts: Mutex::new(Vec::new()),
            gate,
        })
    }

    /// Park subsequent POSTs until release_all()
    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_all(&self) {
        self.gate.send_replace(false);
    }

    /// (endpoint, offer) of every POST so far
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().clone()
    }
}

#[async_trait]
impl WhepSignaler for MockSignaler {
    async fn post_offer(&self, endpoint: &Url, offer_sdp: &str) -> Result<String, SignalingError> {
        self.posts.lock().push((endpoint.to_string(), offer_sdp.to_string()));
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|held| !*held).await;
        match &self.response {
            Ok(answer) => Ok(answer.clone()),
            Err(status) => Err(SignalingError::Status {
                status: *status,
                body: None,
            }),
        }
    }
}

/// Connector that refuses unless a socket was queued with accept_next()
#[derive(Default)]
pub struct MockConnector {
    queued: Mutex<VecDeque<(mpsc::UnboundedReceiver<Option<Result<AlertFrame, ChannelError>>>, Arc<SocketLog>)>>,
    urls: Mutex<Vec<Url>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one successful connect; returns the server side of that socket.
    pub fn accept_next(&self) -> MockServer {
        let (frames, rx) = mpsc::unbounded_channel();
        let log = Arc::new(SocketLog::default());
        self.queued.lock().push_back((rx, log.clone()));
        MockServer { frames, log }
    }

    /// Connect calls so far, successful or not
    pub fn attempts(&self) -> usize {
        self.urls.lock().len()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl AlertConnector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<AlertSocket, ChannelError> {
        self.urls.lock().push(url.clone());
        let Some((frames, log)) = self.queued.lock().pop_front() else {
            return Err(ChannelError::Connect("connection refused".into()));
        };
        Ok(AlertSocket {
            sink: Box::new(MockSink { log }),
            stream: Box::new(MockStream { frames }),
        })
    }
}

#[derive(Default)]
struct SocketLog {
    sent: Mutex<Vec<String>>,
    pings: AtomicU32,
    fail_pings: AtomicBool,
    going_away: AtomicBool,
}

/// Server end of a mock socket
pub struct MockServer {
    frames: mpsc::UnboundedSender<Option<Result<AlertFrame, ChannelError>>>,
    log: Arc<SocketLog>,
}

impl MockServer {
    pub fn push(&self, frame: AlertFrame) {
        let _ = self.frames.send(Some(Ok(frame)));
    }

    pub fn push_text(&self, text: &str) {
        self.push(AlertFrame::Text(text.to_string()));
    }

    pub fn fail_receive(&self) {
        let _ = self.frames.send(Some(Err(ChannelError::Receive("connection reset".into()))));
    }

    /// End of stream
    pub fn end(&self) {
        let _ = self.frames.send(None);
    }

    pub fn fail_pings(&self) {
        self.log.fail_pings.store(true, Ordering::SeqCst);
    }

    pub fn pings(&self) -> u32 {
        self.log.pings.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.log.sent.lock().clone()
    }

    pub fn closed_going_away(&self) -> bool {
        self.log.going_away.load(Ordering::SeqCst)
    }
}

struct MockSink {
    log: Arc<SocketLog>,
}

#[async_trait]
impl AlertSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.log.sent.lock().push(text);
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ChannelError> {
        if self.log.fail_pings.load(Ordering::SeqCst) {
            return Err(ChannelError::Send("broken pipe".into()));
        }
        self.log.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close_going_away(&mut self) -> Result<(), ChannelError> {
        self.log.going_away.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockStream {
    frames: mpsc::UnboundedReceiver<Option<Result<AlertFrame, ChannelError>>>,
}

#[async_trait]
impl AlertStream for MockStream {
    async fn next_frame(&mut self) -> Option<Result<AlertFrame, ChannelError>> {
        // Closed sender behaves like an idle server, not a disconnect.
        match self.frames.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }
}

/// Notification sink that records (title, body, badge)
#[derive(Default)]
pub struct RecordingSink {
    notifications: Mutex<Vec<(String, String, u32)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notifications(&self) -> Vec<(String, String, u32)> {
        self.notifications.lock().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, title: &str, body: &str, badge: u32) {
        self.notifications
            .lock()
            .push((title.to_string(), body.to_string(), badge));
    }
}
