use crate::{
    channel::{Channel, ChannelRegistry},
    error::{ClientError, TransportError},
    extension::{Extension, ExtensionChain},
    transport::{ws::WebSocketTransport, Transport, TransportListener, TransportOptions},
};
use bayeux_core::{
    Advice, ChannelId, Message, ReconnectPolicy, BAYEUX_VERSION, META_HANDSHAKE,
};
use futures_channel::oneshot;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

// how long a vetoed /meta/disconnect may leave the session in DISCONNECTING
// before the transition is forced locally
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle of a [`BayeuxClient`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Handshaking,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Verbosity of the session's own diagnostics, on top of whatever `tracing`
/// subscriber the embedder installs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Warn = 0,
    Info = 1,
    Debug = 2,
}

/// Geometric backoff added to the advised interval on consecutive failures.
#[derive(Debug)]
struct Backoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { base: Duration::from_secs(1), cap: Duration::from_secs(30), failures: 0 }
    }

    fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    fn set_cap(&mut self, cap: Duration) {
        self.cap = cap;
    }

    /// `min(base * 2^(n-1), cap)` after `n` consecutive failures.
    fn delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO
        }
        let exponent = (self.failures - 1).min(16);
        self.base.saturating_mul(2u32.saturating_pow(exponent)).min(self.cap)
    }
}

/// A Bayeux client session: drives handshake → connect → subscribe/publish →
/// disconnect over its transports, owns the channel registry and the
/// extension chain.
///
/// The handle is cheap to clone. State transitions are published through a
/// watch channel so callers (and tests) can await them instead of sleeping:
///
/// ```no_run
/// # async fn demo() -> Result<(), bayeux_client::ClientError> {
/// use bayeux_client::BayeuxClient;
///
/// let client = BayeuxClient::new("http://localhost:8080/cometd");
/// client.handshake(None).await?;
/// client.wait_connected().await;
///
/// let channel = client.get_channel("/chat/demo")?;
/// channel.subscribe(std::sync::Arc::new(|msg| println!("{:?}", msg.data))).await?;
/// channel.publish(serde_json::json!({"text": "hello"})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BayeuxClient {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    transports: Vec<Arc<dyn Transport>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    options: TransportOptions,
    channels: Arc<ChannelRegistry>,
    extensions: ExtensionChain,
    state: watch::Sender<SessionState>,
    client_id: Mutex<Option<String>>,
    advice: Mutex<Advice>,
    backoff: Mutex<Backoff>,
    message_id: AtomicU64,
    handshake_ext: Mutex<Option<Map<String, Value>>>,
    // messages created while handshaking, flushed with the first connect
    queue: Mutex<Vec<Message>>,
    // callers awaiting a reply, keyed by message id
    waiters: Mutex<HashMap<String, oneshot::Sender<Result<Message, ClientError>>>>,
    log_level: AtomicU8,
    aborted: AtomicBool,
}

impl BayeuxClient {
    /// A session over a single WebSocket transport for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::with_transports(
            vec![Arc::new(WebSocketTransport::new(url))],
            TransportOptions::default(),
        )
    }

    /// A session negotiating over the given transports, in preference order.
    pub fn with_transports(
        transports: Vec<Arc<dyn Transport>>,
        options: TransportOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Unconnected);
        Self {
            inner: Arc::new(SessionInner {
                transports,
                transport: Mutex::new(None),
                options,
                channels: Arc::new(ChannelRegistry::new()),
                extensions: ExtensionChain::new(),
                state,
                client_id: Mutex::new(None),
                advice: Mutex::new(Advice::default()),
                backoff: Mutex::new(Backoff::new()),
                message_id: AtomicU64::new(0),
                handshake_ext: Mutex::new(None),
                queue: Mutex::new(Vec::new()),
                waiters: Mutex::new(HashMap::new()),
                log_level: AtomicU8::new(LogLevel::Info as u8),
                aborted: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// A receiver observing every state transition.
    pub fn state_events(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub async fn wait_connected(&self) {
        self.wait_for(|state| state == SessionState::Connected).await
    }

    pub async fn wait_disconnected(&self) {
        self.wait_for(|state| state == SessionState::Disconnected).await
    }

    async fn wait_for(&self, predicate: impl Fn(SessionState) -> bool) {
        let mut events = self.inner.state.subscribe();
        loop {
            if predicate(*events.borrow_and_update()) {
                return
            }
            if events.changed().await.is_err() {
                return
            }
        }
    }

    /// Starts the session: negotiates a transport and sends
    /// `/meta/handshake`, optionally carrying an `ext` object. Completion is
    /// observable through [`BayeuxClient::wait_connected`].
    pub async fn handshake(&self, ext: Option<Map<String, Value>>) -> Result<(), ClientError> {
        if self.inner.aborted.load(Ordering::SeqCst) {
            return Err(ClientError::illegal_state("session has been aborted"))
        }
        *self.inner.handshake_ext.lock().unwrap() = ext;
        let result = self.inner.rehandshake().await;
        if result.is_err() {
            self.inner.set_state(SessionState::Disconnected);
        }
        result
    }

    /// Sends `/meta/disconnect` and resolves once the session reaches
    /// `DISCONNECTED`, whether through the server's ack, an exchange
    /// timeout, or the veto grace period.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Disconnected => return Ok(()),
            SessionState::Unconnected => {
                self.inner.set_state(SessionState::Disconnected);
                return Ok(())
            }
            _ => {}
        }
        self.inner.set_state(SessionState::Disconnecting);
        // every outcome (reply, failure, veto) eventually forces the state
        let _ = self.inner.send_request(Message::disconnect()).await;
        self.wait_disconnected().await;
        let transport = self.inner.transport.lock().unwrap().clone();
        if let Some(transport) = transport {
            transport.terminate().await;
        }
        Ok(())
    }

    /// Forced synchronous shutdown: pending exchanges fail with `Aborted`
    /// and no disconnect message is sent.
    pub fn abort(&self) {
        let inner = &self.inner;
        inner.aborted.store(true, Ordering::SeqCst);
        let transport = inner.transport.lock().unwrap().clone();
        if let Some(transport) = transport {
            transport.abort();
        }
        inner.fail_waiters("session aborted");
        inner.set_state(SessionState::Disconnected);
    }

    /// Looks up (or interns) the channel for `name`.
    pub fn get_channel(&self, name: &str) -> Result<Channel, ClientError> {
        let id = ChannelId::parse(name)?;
        Ok(self.inner.channels.get_or_create(id, Arc::downgrade(&self.inner)))
    }

    /// Appends a named extension; `false` if the name is taken.
    pub fn add_extension(&self, name: impl Into<String>, extension: Arc<dyn Extension>) -> bool {
        self.inner.extensions.register(name, extension)
    }

    pub fn remove_extension(&self, name: &str) -> bool {
        self.inner.extensions.unregister(name)
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.log_level.store(level as u8, Ordering::Relaxed);
    }
}

impl fmt::Debug for BayeuxClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BayeuxClient")
            .field("state", &*self.inner.state.borrow())
            .field("client_id", &*self.inner.client_id.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(?prev, ?next, "session state changed");
        }
    }

    fn state_now(&self) -> SessionState {
        *self.state.borrow()
    }

    fn log_level(&self) -> LogLevel {
        match self.log_level.load(Ordering::Relaxed) {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    fn listener(self: &Arc<Self>) -> Arc<dyn TransportListener> {
        Arc::new(SessionListener(Arc::downgrade(self)))
    }

    fn next_id(&self) -> String {
        (self.message_id.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn current_advice(&self) -> Advice {
        self.advice.lock().unwrap().clone()
    }

    fn transport_name(&self) -> &'static str {
        self.transport.lock().unwrap().as_ref().map(|t| t.name()).unwrap_or("websocket")
    }

    fn negotiate_transport(&self) -> Result<Arc<dyn Transport>, ClientError> {
        self.transports
            .iter()
            .find(|transport| transport.accept(BAYEUX_VERSION))
            .cloned()
            .ok_or_else(|| ClientError::NoTransport(BAYEUX_VERSION.to_string()))
    }

    /// Negotiates a transport and sends a fresh `/meta/handshake`, dropping
    /// any previous `clientId`.
    async fn rehandshake(self: &Arc<Self>) -> Result<(), ClientError> {
        let transport = self.negotiate_transport()?;
        transport.init(self.options.clone(), self.listener());
        {
            let mut current = self.transport.lock().unwrap();
            if let Some(previous) = current.as_ref() {
                if !Arc::ptr_eq(previous, &transport) {
                    previous.reset();
                }
            }
            *current = Some(transport.clone());
        }
        *self.client_id.lock().unwrap() = None;
        self.set_state(SessionState::Handshaking);

        let mut message = Message::handshake(
            self.transports.iter().map(|transport| transport.name().to_string()).collect(),
        );
        message.id = Some(self.next_id());
        message.ext = self.handshake_ext.lock().unwrap().clone();
        self.send_batch(vec![message]).await;
        Ok(())
    }

    /// Sends a request and awaits its correlated reply.
    pub(crate) async fn send_request(
        self: &Arc<Self>,
        mut message: Message,
    ) -> Result<Message, ClientError> {
        if self.aborted.load(Ordering::SeqCst) {
            return Err(ClientError::illegal_state("session has been aborted"))
        }
        let id = self.next_id();
        message.id = Some(id.clone());
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(id, tx);
        self.enqueue_or_send(message).await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::SessionGone),
        }
    }

    async fn enqueue_or_send(self: &Arc<Self>, message: Message) {
        let queued =
            self.state_now() == SessionState::Handshaking && message.channel != META_HANDSHAKE;
        if queued {
            trace!(channel = message.channel, "queueing message until the handshake completes");
            self.queue.lock().unwrap().push(message);
            return
        }
        self.send_batch(vec![message]).await
    }

    /// Stamps the session's `clientId`, runs the outgoing extension chain
    /// once per message, and hands the surviving batch to the transport.
    async fn send_batch(self: &Arc<Self>, messages: Vec<Message>) {
        let client_id = self.client_id.lock().unwrap().clone();
        let mut batch = Vec::with_capacity(messages.len());
        for mut message in messages {
            if message.client_id.is_none() && message.channel != META_HANDSHAKE {
                message.client_id = client_id.clone();
            }
            let id = message.id.clone();
            let is_disconnect = message.is_meta_disconnect();
            match self.extensions.outgoing(message) {
                Some(message) => batch.push(message),
                None => {
                    if let Some(id) = &id {
                        self.resolve_waiter(id, Err(ClientError::Vetoed));
                    }
                    if is_disconnect {
                        self.force_disconnect_after_grace();
                    }
                }
            }
        }
        if batch.is_empty() {
            return
        }
        if self.log_level() >= LogLevel::Debug {
            trace!(?batch, "sending batch");
        }
        let transport = self.transport.lock().unwrap().clone();
        match transport {
            Some(transport) => transport.send(self.listener(), batch).await,
            None => {
                for message in &batch {
                    if let Some(id) = &message.id {
                        self.resolve_waiter(
                            id,
                            Err(ClientError::illegal_state("no transport initialized")),
                        );
                    }
                }
            }
        }
    }

    /// Entry point for every message coming off a transport: interprets
    /// advice and meta replies, runs the incoming chain, dispatches to
    /// channels, and resolves the caller awaiting the reply.
    fn receive(self: &Arc<Self>, message: Message) {
        if self.log_level() >= LogLevel::Debug {
            trace!(channel = message.channel, id = ?message.id, "received message");
        }

        // the session's own bookkeeping is not subject to extension veto:
        // fresh advice is visible before any extension or listener observes
        // the reply, and the meta-connect loop must reschedule (or
        // terminate) no matter what the chain decides below
        if let Some(advice) = &message.advice {
            *self.advice.lock().unwrap() = advice.clone();
            if let Some(max_interval) = advice.max_interval {
                self.backoff.lock().unwrap().set_cap(Duration::from_millis(max_interval));
            }
        }

        if message.channel == META_HANDSHAKE {
            self.handshake_reply(&message);
        } else if message.is_meta_connect() {
            self.connect_reply(&message);
        } else if message.is_meta_disconnect() {
            self.disconnect_reply(&message);
        }

        // a veto only prevents dispatch: channel observers see nothing, and
        // a caller awaiting the reply is failed rather than left hanging
        let incoming_id = message.id.clone();
        let message = match self.extensions.incoming(message) {
            Some(message) => message,
            None => {
                if let Some(id) = &incoming_id {
                    self.resolve_waiter(id, Err(ClientError::Vetoed));
                }
                return
            }
        };

        self.channels.dispatch(&message);

        if message.is_reply() {
            if let Some(id) = &message.id {
                self.resolve_waiter(id, Ok(message.clone()));
            }
        }
    }

    fn handshake_reply(self: &Arc<Self>, reply: &Message) {
        if reply.is_successful() {
            *self.client_id.lock().unwrap() = reply.client_id.clone();
            self.backoff.lock().unwrap().reset();
            self.set_state(SessionState::Connecting);
            // first meta-connect, batched with whatever queued up meanwhile
            let mut batch = vec![self.new_connect()];
            batch.append(&mut self.queue.lock().unwrap());
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.send_batch(batch).await });
        } else {
            warn!(error = ?reply.error, "handshake rejected");
            self.backoff.lock().unwrap().record_failure();
            match self.current_advice().reconnect() {
                ReconnectPolicy::None => self.terminate_session(),
                // retry and handshake both mean a fresh handshake here
                _ => self.schedule_handshake(),
            }
        }
    }

    fn connect_reply(self: &Arc<Self>, reply: &Message) {
        if reply.is_successful() {
            self.backoff.lock().unwrap().reset();
            if self.state_now() == SessionState::Connecting {
                self.set_state(SessionState::Connected);
            }
        } else {
            self.backoff.lock().unwrap().record_failure();
        }
        // the meta-connect loop stops once the session is going away
        if matches!(
            self.state_now(),
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            return
        }
        match self.current_advice().reconnect() {
            ReconnectPolicy::None => self.terminate_session(),
            ReconnectPolicy::Handshake => self.schedule_handshake(),
            ReconnectPolicy::Retry => self.schedule_connect(),
        }
    }

    fn disconnect_reply(self: &Arc<Self>, _reply: &Message) {
        self.set_state(SessionState::Disconnected);
    }

    fn new_connect(&self) -> Message {
        let mut message = Message::connect(self.transport_name());
        message.id = Some(self.next_id());
        message.client_id = self.client_id.lock().unwrap().clone();
        message
    }

    /// Next meta-connect after `advice.interval` plus accrued backoff.
    fn schedule_connect(self: &Arc<Self>) {
        let delay = Duration::from_millis(self.current_advice().interval())
            + self.backoff.lock().unwrap().delay();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if inner.aborted.load(Ordering::SeqCst)
                || matches!(
                    inner.state_now(),
                    SessionState::Disconnecting | SessionState::Disconnected
                )
            {
                return
            }
            let batch = vec![inner.new_connect()];
            inner.send_batch(batch).await;
        });
    }

    fn schedule_handshake(self: &Arc<Self>) {
        let delay = Duration::from_millis(self.current_advice().interval())
            + self.backoff.lock().unwrap().delay();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if inner.aborted.load(Ordering::SeqCst)
                || matches!(
                    inner.state_now(),
                    SessionState::Disconnecting | SessionState::Disconnected
                )
            {
                return
            }
            if let Err(err) = inner.rehandshake().await {
                warn!(%err, "re-handshake failed; terminating session");
                inner.terminate_session();
            }
        });
    }

    /// `advice.reconnect = none`, or nothing left to try: the session ends.
    fn terminate_session(self: &Arc<Self>) {
        self.set_state(SessionState::Disconnected);
        self.fail_waiters("session terminated");
        let transport = self.transport.lock().unwrap().clone();
        if let Some(transport) = transport {
            tokio::spawn(async move { transport.terminate().await });
        }
    }

    fn force_disconnect_after_grace(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(DISCONNECT_GRACE).await;
            if inner.state_now() == SessionState::Disconnecting {
                warn!("forcing local disconnect after vetoed /meta/disconnect");
                inner.terminate_session();
            }
        });
    }

    /// Transport-reported failure for specific messages: resolve their
    /// waiters, then recover per the remembered advice.
    fn handle_failure(self: &Arc<Self>, error: &ClientError, messages: &[Message]) {
        warn!(%error, count = messages.len(), "transport failure");
        for message in messages {
            if let Some(id) = &message.id {
                self.resolve_waiter(id, Err(ClientError::RequestFailed(error.to_string())));
            }
        }
        if self.aborted.load(Ordering::SeqCst) {
            return
        }

        if messages.iter().any(Message::is_meta_disconnect) {
            // the server never acked; disconnect locally regardless
            self.set_state(SessionState::Disconnected);
            return
        }
        if matches!(
            self.state_now(),
            SessionState::Disconnecting | SessionState::Disconnected
        ) {
            return
        }

        let upgrade_rejected = matches!(
            error,
            ClientError::Transport(TransportError::UpgradeRejected { .. })
        );
        let handshake_failed = messages.iter().any(|message| message.channel == META_HANDSHAKE);
        let connect_failed = messages.iter().any(Message::is_meta_connect);

        if upgrade_rejected || handshake_failed {
            // on upgrade rejection the transport has latched itself
            // unsupported, so the next negotiation falls back
            self.backoff.lock().unwrap().record_failure();
            self.schedule_handshake();
        } else if connect_failed {
            self.backoff.lock().unwrap().record_failure();
            match self.current_advice().reconnect() {
                ReconnectPolicy::None => self.terminate_session(),
                ReconnectPolicy::Handshake => self.schedule_handshake(),
                ReconnectPolicy::Retry => self.schedule_connect(),
            }
        }
    }

    fn resolve_waiter(&self, id: &str, result: Result<Message, ClientError>) {
        let waiter = self.waiters.lock().unwrap().remove(id);
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
    }

    fn fail_waiters(&self, reason: &str) {
        let waiters: Vec<_> = self.waiters.lock().unwrap().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(ClientError::RequestFailed(reason.to_string())));
        }
    }
}

/// The session's face toward its transports. Holds a weak reference so a
/// transport outliving the session delivers into the void instead of keeping
/// it alive.
struct SessionListener(Weak<SessionInner>);

impl TransportListener for SessionListener {
    fn on_sending(&self, messages: &[Message]) {
        if let Some(inner) = self.0.upgrade() {
            if inner.log_level() >= LogLevel::Debug {
                trace!(count = messages.len(), "batch handed to transport");
            }
        }
    }

    fn on_messages(&self, messages: Vec<Message>) {
        if let Some(inner) = self.0.upgrade() {
            for message in messages {
                inner.receive(message);
            }
        }
    }

    fn on_failure(&self, error: &ClientError, messages: &[Message]) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_failure(error, messages);
        }
    }
}
