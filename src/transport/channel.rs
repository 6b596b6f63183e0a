//! Resilient alert channel
//!
//! Keeps one WebSocket connection to the alert service open:
//! - Every delivered text frame becomes a notification, in arrival order
//! - Transport errors reconnect with linear backoff until the attempt cap
//! - While the host application is in the background, a ping keeps the
//!   connection from being dropped by intermediaries
//!
//! Like the WHEP session, each connection attempt carries a generation and
//! completions from superseded attempts are ignored.

use super::backoff::ReconnectPolicy;
use super::websocket::{AlertConnector, AlertFrame, AlertSink, AlertSocket, AlertStream};
use super::ChannelError;
use crate::collaborators::{NotificationSink, SessionProvider};
use crate::state::{ConnectionState, FailureReason};
use crate::timer::OneShotTimer;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

/// Title of every alert notification
pub const ALERT_TITLE: &str = "New Alert";

const MESSAGE_BROADCAST_CAPACITY: usize = 256;

type SharedSink = Arc<tokio::sync::Mutex<Box<dyn AlertSink>>>;

/// Host application lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppPhase {
    #[default]
    Foreground,
    Background,
}

/// Alert channel settings
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    /// Append `store_id` from the session provider as a query parameter
    pub store_scoped: bool,
    pub policy: ReconnectPolicy,
    pub ping_interval: Duration,
    /// How long the new-event flag stays raised after a message
    pub new_event_reset: Duration,
    /// How long a socket must stay open before the attempt counter resets
    pub stable_after: Duration,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            store_scoped: false,
            policy: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(10),
            new_event_reset: Duration::from_millis(500),
            stable_after: Duration::from_secs(10),
        }
    }
}

/// Resilient WebSocket alert channel
pub struct EventChannel {
    shared: Arc<Shared>,
}

struct Shared {
    config: ChannelConfig,
    connector: Arc<dyn AlertConnector>,
    notifier: Arc<dyn NotificationSink>,
    session: Option<Arc<dyn SessionProvider>>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    new_event_tx: Arc<watch::Sender<bool>>,
    messages_tx: broadcast::Sender<String>,
}

struct Inner {
    state: ConnectionState,
    generation: u64,
    should_reconnect: bool,
    reconnect_attempts: u32,
    phase: AppPhase,
    message_log: Vec<String>,
    badge: u32,
    sink: Option<SharedSink>,
    connect_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<()>>,
    reconnect_timer: OneShotTimer,
    ping_timer: OneShotTimer,
    stable_timer: OneShotTimer,
    new_event_timer: OneShotTimer,
}

impl Inner {
    /// Forget the current socket and start a new generation.
    fn drop_socket(&mut self) -> Option<SharedSink> {
        self.generation += 1;
        self.stable_timer.cancel();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(task) = self.receive_task.take() {
            task.abort();
        }
        self.sink.take()
    }
}

impl EventChannel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn AlertConnector>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::build(config, connector, notifier, None)
    }

    /// Channel whose URL is scoped by the provider's store id.
    pub fn with_session(
        config: ChannelConfig,
        connector: Arc<dyn AlertConnector>,
        notifier: Arc<dyn NotificationSink>,
        session: Arc<dyn SessionProvider>,
    ) -> Self {
        Self::build(config, connector, notifier, Some(session))
    }

    fn build(
        config: ChannelConfig,
        connector: Arc<dyn AlertConnector>,
        notifier: Arc<dyn NotificationSink>,
        session: Option<Arc<dyn SessionProvider>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (new_event_tx, _) = watch::channel(false);
        let (messages_tx, _) = broadcast::channel(MESSAGE_BROADCAST_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                notifier,
                session,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    generation: 0,
                    should_reconnect: false,
                    reconnect_attempts: 0,
                    phase: AppPhase::Foreground,
                    message_log: Vec::new(),
                    badge: 0,
                    sink: None,
                    connect_task: None,
                    receive_task: None,
                    reconnect_timer: OneShotTimer::new("alert-reconnect"),
                    ping_timer: OneShotTimer::new("alert-ping"),
                    stable_timer: OneShotTimer::new("alert-stable"),
                    new_event_timer: OneShotTimer::new("alert-new-event"),
                }),
                state_tx,
                new_event_tx: Arc::new(new_event_tx),
                messages_tx,
            }),
        }
    }

    /// Open the channel and enable automatic reconnection.
    ///
    /// Resets the attempt counter and replaces any existing socket.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut inner = self.shared.inner.lock();
        inner.should_reconnect = true;
        inner.reconnect_attempts = 0;
        self.shared.start_attempt(&mut inner);
        if inner.phase == AppPhase::Background && !inner.ping_timer.is_pending() {
            self.shared.start_keepalive(&mut inner);
        }
    }

    /// Close the channel with going-away and stop reconnecting.
    pub async fn disconnect(&self) {
        let sink = {
            let mut inner = self.shared.inner.lock();
            info!("Alerts: Disconnecting");
            inner.should_reconnect = false;
            inner.reconnect_timer.cancel();
            inner.ping_timer.cancel();
            let sink = inner.drop_socket();
            self.shared.set_state(&mut inner, ConnectionState::Idle);
            sink
        };
        if let Some(sink) = sink {
            if let Err(e) = sink.lock().await.close_going_away().await {
                debug!("Alerts: close failed: {}", e);
            }
        }
    }

    /// Foreground reconnects at once; background keeps the socket alive with pings.
    pub fn set_app_phase(&self, phase: AppPhase) {
        let mut inner = self.shared.inner.lock();
        if inner.phase == phase {
            return;
        }
        inner.phase = phase;
        match phase {
            AppPhase::Background => {
                info!("Alerts: App in background, starting keepalive");
                self.shared.start_keepalive(&mut inner);
            }
            AppPhase::Foreground => {
                inner.ping_timer.cancel();
                let user_disconnected = !inner.should_reconnect && inner.state.is_idle();
                if !inner.state.is_connected() && !user_disconnected {
                    info!("Alerts: App in foreground, reconnecting now");
                    inner.should_reconnect = true;
                    inner.reconnect_attempts = 0;
                    self.shared.start_attempt(&mut inner);
                }
            }
        }
    }

    /// Send a text frame on the open socket. A failed send triggers reconnection.
    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        let (generation, sink) = {
            let inner = self.shared.inner.lock();
            (inner.generation, inner.sink.clone())
        };
        let Some(sink) = sink else {
            warn!("Alerts: Cannot send, not connected");
            return Err(ChannelError::NotConnected);
        };
        let result = sink.lock().await.send_text(text.to_string()).await;
        if let Err(ref e) = result {
            self.shared.on_error(generation, e.clone());
        }
        result
    }

    /// Reset the unread counter.
    pub fn clear_badge(&self) {
        self.shared.inner.lock().badge = 0;
    }

    pub fn badge(&self) -> u32 {
        self.shared.inner.lock().badge
    }

    /// All messages received since creation, oldest first
    pub fn message_log(&self) -> Vec<String> {
        self.shared.inner.lock().message_log.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Raised on each message, lowered once messages stop for a moment.
    pub fn subscribe_new_events(&self) -> watch::Receiver<bool> {
        self.shared.new_event_tx.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.shared.messages_tx.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.inner.lock().reconnect_attempts
    }

    pub fn should_reconnect(&self) -> bool {
        self.shared.inner.lock().should_reconnect
    }

    /// When the pending reconnect fires, if one is scheduled
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.shared.inner.lock().reconnect_timer.deadline()
    }

    pub fn is_keepalive_active(&self) -> bool {
        self.shared.inner.lock().ping_timer.is_pending()
    }

    /// Endpoint the next attempt will use
    pub fn endpoint(&self) -> Url {
        self.shared.endpoint()
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        inner.should_reconnect = false;
        inner.reconnect_timer.cancel();
        inner.ping_timer.cancel();
        inner.new_event_timer.cancel();
        if let Some(sink) = inner.drop_socket() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = sink.lock().await.close_going_away().await;
                });
            }
        }
    }
}

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!("Alerts: state {} -> {}", inner.state, state);
        }
        inner.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn endpoint(&self) -> Url {
        let mut url = self.config.url.clone();
        if self.config.store_scoped {
            match self.session.as_ref().and_then(|s| s.store_id()) {
                Some(store_id) => {
                    url.query_pairs_mut().append_pair("store_id", &store_id);
                }
                None => warn!("Alerts: Store-scoped channel without a store id"),
            }
        }
        url
    }

    /// Replace the current socket with a fresh connection attempt.
    fn start_attempt(self: &Arc<Self>, inner: &mut Inner) {
        inner.reconnect_timer.cancel();
        if let Some(old) = inner.drop_socket() {
            tokio::spawn(async move {
                let _ = old.lock().await.close_going_away().await;
            });
        }
        let generation = inner.generation;
        self.set_state(inner, ConnectionState::Connecting);

        let url = self.endpoint();
        info!("Alerts: Connecting to {}", url);
        let weak = Arc::downgrade(self);
        let connector = self.connector.clone();
        inner.connect_task = Some(tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(socket) => shared.on_open(generation, socket),
                Err(e) => shared.on_error(generation, e),
            }
        }));
    }

    fn on_open(self: &Arc<Self>, generation: u64, socket: AlertSocket) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!("Alerts: Dropping superseded socket");
            let mut sink = socket.sink;
            tokio::spawn(async move {
                let _ = sink.close_going_away().await;
            });
            return;
        }
        info!("Alerts: Connected");
        inner.connect_task = None;
        // Attempts reset only once the socket has stayed open for `stable_after`.
        let weak = Arc::downgrade(self);
        inner.stable_timer.arm(self.config.stable_after, async move {
            if let Some(shared) = weak.upgrade() {
                let mut inner = shared.inner.lock();
                if inner.generation == generation && inner.reconnect_attempts > 0 {
                    debug!("Alerts: Connection stable, resetting reconnect attempts");
                    inner.reconnect_attempts = 0;
                }
            }
        });
        inner.sink = Some(Arc::new(tokio::sync::Mutex::new(socket.sink)));
        let weak = Arc::downgrade(self);
        inner.receive_task = Some(tokio::spawn(receive_loop(weak, generation, socket.stream)));
        self.set_state(&mut inner, ConnectionState::Connected);
    }

    /// Any transport failure of `generation`. Stale generations are ignored.
    fn on_error(self: &Arc<Self>, generation: u64, err: ChannelError) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            debug!("Alerts: Ignoring error from superseded socket: {}", err);
            return;
        }
        error!("Alerts: WebSocket error: {}", err);
        inner.drop_socket();
        self.schedule_reconnect(&mut inner);
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if !inner.should_reconnect {
            self.set_state(inner, ConnectionState::Idle);
            return;
        }
        if !self.config.policy.allows(inner.reconnect_attempts) {
            warn!(
                "Alerts: Giving up after {} reconnect attempts",
                inner.reconnect_attempts
            );
            let attempts = inner.reconnect_attempts;
            self.set_state(inner, ConnectionState::Failed(FailureReason::ReconnectExhausted { attempts }));
            return;
        }

        inner.reconnect_attempts += 1;
        let delay = self.config.policy.delay_for(inner.reconnect_attempts);
        info!(
            "Alerts: Reconnect attempt {} in {:?}",
            inner.reconnect_attempts, delay
        );
        self.set_state(inner, ConnectionState::Connecting);
        let weak = Arc::downgrade(self);
        inner.reconnect_timer.arm(delay, async move {
            if let Some(shared) = weak.upgrade() {
                let mut inner = shared.inner.lock();
                if inner.should_reconnect {
                    shared.start_attempt(&mut inner);
                }
            }
        });
    }

    fn start_keepalive(self: &Arc<Self>, inner: &mut Inner) {
        let weak = Arc::downgrade(self);
        inner.ping_timer.arm_every(self.config.ping_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    shared.ping().await;
                }
            }
        });
    }

    async fn ping(self: Arc<Self>) {
        let (generation, sink) = {
            let inner = self.inner.lock();
            (inner.generation, inner.sink.clone())
        };
        let Some(sink) = sink else {
            return;
        };
        debug!("Alerts: Sending keepalive ping");
        let result = sink.lock().await.ping().await;
        if let Err(e) = result {
            warn!("Alerts: Ping failed: {}", e);
            self.on_error(generation, e);
        }
    }

    fn deliver(&self, generation: u64, text: String) {
        let badge = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return;
            }
            inner.message_log.push(text.clone());
            inner.badge += 1;

            self.new_event_tx.send_replace(true);
            let flag = self.new_event_tx.clone();
            inner.new_event_timer.arm(self.config.new_event_reset, async move {
                flag.send_replace(false);
            });
            inner.badge
        };
        info!("Alerts: Received message #{}", badge);
        self.notifier.notify(ALERT_TITLE, &text, badge);
        let _ = self.messages_tx.send(text);
    }
}

async fn receive_loop(shared: Weak<Shared>, generation: u64, mut stream: Box<dyn AlertStream>) {
    loop {
        let next = stream.next_frame().await;
        let Some(channel) = shared.upgrade() else {
            return;
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                channel.on_error(generation, e);
                return;
            }
            None => {
                channel.on_error(generation, ChannelError::Closed);
                return;
            }
        };
        match frame {
            AlertFrame::Text(text) => channel.deliver(generation, text),
            AlertFrame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => channel.deliver(generation, text),
                Err(e) => warn!("Alerts: Dropping non-UTF-8 binary frame ({} bytes)", e.as_bytes().len()),
            },
            AlertFrame::Close(code) => {
                info!("Alerts: Server closed connection ({:?})", code);
                channel.on_error(generation, ChannelError::Closed);
                return;
            }
            AlertFrame::Ping | AlertFrame::Pong | AlertFrame::Other => {
                debug!("Alerts: Ignoring control frame");
            }
        }
    }
}
