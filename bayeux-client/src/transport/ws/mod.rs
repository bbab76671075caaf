mod backend;

use backend::{BackendDriver, WsBackend, WsOut};

use crate::{
    error::{ClientError, TransportError},
    transport::{
        exchange::{Exchange, ExchangeTable},
        scheduler::{Scheduler, TimeoutHandle},
        Transport, TransportListener, TransportOptions,
    },
};
use async_trait::async_trait;
use bayeux_core::{generate_json, Message};
use futures_channel::{mpsc, oneshot};
use futures_util::{select_biased, StreamExt};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, protocol::WebSocketConfig,
};
use tracing::{debug, warn};

// an expiry firing this long past its deadline means the scheduler is lagging
const MAX_EXPIRY_SKEW: Duration = Duration::from_secs(5);

const NORMAL_CLOSE: u16 = 1000;

/// Rewrites an HTTP(S) endpoint into its websocket form. Other schemes pass
/// through unchanged.
pub fn websocket_url(url: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else { return url.to_string() };
    let scheme = match parsed.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return url.to_string(),
    };
    if parsed.set_scheme(scheme).is_err() {
        return url.to_string()
    }
    parsed.to_string()
}

/// Bayeux transport over a single multiplexed websocket.
///
/// The socket is opened lazily on the first `send` after `init`. Every
/// message in a batch registers an exchange with an expiry task; replies are
/// correlated back by id on the receive loop. A rejected websocket upgrade
/// marks the transport permanently unsupported so the session can fall back
/// to another transport.
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WsTransportInner>,
}

struct ActiveBackend {
    generation: u64,
    dispatcher: mpsc::UnboundedSender<WsOut>,
    // dropping this tells the backend task to stop
    _shutdown: oneshot::Sender<()>,
}

struct WsTransportInner {
    url: String,
    options: Mutex<TransportOptions>,
    exchanges: ExchangeTable,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    scheduler_injected: bool,
    // receives server pushes and is installed at init
    push_listener: Mutex<Option<Arc<dyn TransportListener>>>,
    // current socket, if any; never held across an await
    backend: Mutex<Option<ActiveBackend>>,
    // serializes session establishment on the first concurrent sends
    connect_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    ws_supported: AtomicBool,
    running: AtomicBool,
    aborted: AtomicBool,
    // timeout advised by the last successful meta-connect reply
    advice_timeout: Mutex<Option<Duration>>,
    // a meta-connect exchange is outstanding
    connect_pending: AtomicBool,
    // a successful /meta/disconnect reply has been observed
    disconnected: AtomicBool,
}

impl WebSocketTransport {
    /// Creates a transport for the given server URL, owning its scheduler.
    pub fn new(url: impl Into<String>) -> Self {
        Self::build(url.into(), None)
    }

    /// Creates a transport sharing an externally owned scheduler; `reset`
    /// and `terminate` will not shut it down.
    pub fn with_scheduler(url: impl Into<String>, scheduler: Arc<Scheduler>) -> Self {
        Self::build(url.into(), Some(scheduler))
    }

    fn build(url: String, scheduler: Option<Arc<Scheduler>>) -> Self {
        Self {
            inner: Arc::new(WsTransportInner {
                url,
                options: Mutex::new(TransportOptions::default()),
                exchanges: ExchangeTable::new(),
                scheduler_injected: scheduler.is_some(),
                scheduler: Mutex::new(scheduler),
                push_listener: Mutex::new(None),
                backend: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                ws_supported: AtomicBool::new(true),
                running: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                advice_timeout: Mutex::new(None),
                connect_pending: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
            }),
        }
    }
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport").field("url", &self.inner.url).finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn init(&self, options: TransportOptions, listener: Arc<dyn TransportListener>) {
        let inner = &self.inner;
        *inner.options.lock().unwrap() = options;
        *inner.push_listener.lock().unwrap() = Some(listener);
        {
            let mut scheduler = inner.scheduler.lock().unwrap();
            let usable = scheduler.as_ref().map(|s| !s.is_shutdown()).unwrap_or(false);
            if !usable && !inner.scheduler_injected {
                *scheduler = Some(Arc::new(Scheduler::new()));
            }
        }
        inner.aborted.store(false, Ordering::SeqCst);
        inner.disconnected.store(false, Ordering::SeqCst);
        inner.connect_pending.store(false, Ordering::SeqCst);
        inner.running.store(true, Ordering::SeqCst);
    }

    fn accept(&self, bayeux_version: &str) -> bool {
        bayeux_version.starts_with("1.") && self.inner.ws_supported.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip_all, fields(count = messages.len()))]
    async fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>) {
        let inner = &self.inner;
        if messages.is_empty() {
            return
        }
        if inner.aborted.load(Ordering::SeqCst) || !inner.running.load(Ordering::SeqCst) {
            listener
                .on_failure(&ClientError::illegal_state("transport is not running"), &messages);
            return
        }

        let frame = match generate_json(&messages) {
            Ok(frame) => frame,
            Err(err) => {
                listener.on_failure(&ClientError::Transport(err.into()), &messages);
                return
            }
        };

        let dispatcher = {
            let _guard = inner.connect_lock.lock().await;
            let existing =
                inner.backend.lock().unwrap().as_ref().map(|active| active.dispatcher.clone());
            match existing {
                Some(dispatcher) => dispatcher,
                None => match inner.open_session().await {
                    Ok(dispatcher) => dispatcher,
                    Err(err) => {
                        if matches!(err, TransportError::UpgradeRejected { .. }) {
                            inner.ws_supported.store(false, Ordering::SeqCst);
                        }
                        listener.on_failure(&ClientError::Transport(err), &messages);
                        return
                    }
                },
            }
        };

        // an abort may have raced the connection attempt
        if inner.aborted.load(Ordering::SeqCst) {
            listener.on_failure(&ClientError::Transport(TransportError::Aborted), &messages);
            return
        }

        inner.register_exchanges(&listener, &messages);
        // a reply, however fast, must not be observable ahead of this
        listener.on_sending(&messages);

        if dispatcher.unbounded_send(WsOut::Frame(frame)).is_err() {
            for message in &messages {
                if let Some(id) = message.id.as_deref() {
                    let _ = inner.exchanges.complete(id);
                }
                if message.is_meta_connect() {
                    inner.connect_pending.store(false, Ordering::SeqCst);
                }
            }
            inner.close_session(NORMAL_CLOSE, "Exception");
            listener.on_failure(&ClientError::Transport(TransportError::DeadChannel), &messages);
        }
    }

    fn abort(&self) {
        let inner = &self.inner;
        inner.aborted.store(true, Ordering::SeqCst);
        inner.running.store(false, Ordering::SeqCst);
        inner.fail_pending(TransportError::Aborted);
        inner.backend.lock().unwrap().take();
    }

    fn reset(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        inner.backend.lock().unwrap().take();
        *inner.push_listener.lock().unwrap() = None;
        if !inner.scheduler_injected {
            if let Some(scheduler) = inner.scheduler.lock().unwrap().take() {
                scheduler.shutdown();
            }
        }
    }

    async fn terminate(&self) {
        let inner = &self.inner;
        inner.running.store(false, Ordering::SeqCst);
        inner.close_session(NORMAL_CLOSE, "Disconnect");
        if !inner.scheduler_injected {
            if let Some(scheduler) = inner.scheduler.lock().unwrap().as_ref() {
                scheduler.shutdown();
            }
        }
    }
}

impl WsTransportInner {
    /// Opens the websocket session and spawns the backend and receive-loop
    /// tasks. Callers hold `connect_lock`.
    async fn open_session(
        self: &Arc<Self>,
    ) -> Result<mpsc::UnboundedSender<WsOut>, TransportError> {
        let options = self.options.lock().unwrap().clone();
        let url = websocket_url(&self.url);
        debug!(url, "opening websocket session");

        let mut request = url.into_client_request()?;
        let protocol = http::HeaderValue::from_str(&options.protocol)
            .map_err(|err| tungstenite::Error::HttpFormat(err.into()))?;
        request.headers_mut().insert(http::header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let config = options.max_message_size.map(|max| WebSocketConfig {
            max_message_size: Some(max),
            max_frame_size: Some(max),
            ..Default::default()
        });

        let (backend, driver) =
            WsBackend::connect(request, config, options.connect_timeout, options.idle_timeout)
                .await?;
        backend.spawn();

        let BackendDriver { to_handle, error, dispatcher, shutdown } = driver;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.backend.lock().unwrap() = Some(ActiveBackend {
            generation,
            dispatcher: dispatcher.clone(),
            _shutdown: shutdown,
        });
        self.disconnected.store(false, Ordering::SeqCst);
        self.connect_pending.store(false, Ordering::SeqCst);
        self.spawn_receive_loop(generation, to_handle, error, dispatcher.clone());
        Ok(dispatcher)
    }

    fn spawn_receive_loop(
        self: &Arc<Self>,
        generation: u64,
        mut to_handle: mpsc::UnboundedReceiver<Vec<Message>>,
        mut error: oneshot::Receiver<TransportError>,
        dispatcher: mpsc::UnboundedSender<WsOut>,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // bias toward delivering whatever already arrived before
                // acting on a terminal error
                select_biased! {
                    batch = to_handle.next() => match batch {
                        Some(messages) => inner.handle_incoming(messages, &dispatcher),
                        None => {
                            inner.fail_pending(TransportError::Closed {
                                code: NORMAL_CLOSE,
                                reason: "connection closed".to_string(),
                            });
                            break
                        }
                    },
                    err = &mut error => {
                        let err = err.unwrap_or(TransportError::DeadChannel);
                        inner.fail_pending(err);
                        break
                    }
                }
            }
            inner.clear_backend(generation);
        });
    }

    /// Registers one exchange per message, each with an expiry task sized
    /// `maxNetworkDelay` plus, for a meta-connect, the advised timeout.
    fn register_exchanges(
        self: &Arc<Self>,
        listener: &Arc<dyn TransportListener>,
        messages: &[Message],
    ) {
        let max_network_delay = self.options.lock().unwrap().max_network_delay;
        for message in messages {
            let Some(id) = message.id.clone() else { continue };
            let mut delay = max_network_delay;
            if message.is_meta_connect() {
                if let Some(advised) = *self.advice_timeout.lock().unwrap() {
                    delay += advised;
                }
                self.connect_pending.store(true, Ordering::SeqCst);
            }
            let timeout = self.schedule_expiry(id.clone(), delay);
            self.exchanges.register(id, Exchange::new(message.clone(), listener.clone(), timeout));
        }
    }

    fn schedule_expiry(self: &Arc<Self>, id: String, delay: Duration) -> Option<TimeoutHandle> {
        let scheduler = self.scheduler.lock().unwrap().clone()?;
        let weak = Arc::downgrade(self);
        let deadline = Instant::now() + delay;
        Some(scheduler.schedule(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.expire(&id, deadline);
            }
        }))
    }

    /// Timer path of the reply-vs-expiry race: whoever removes the exchange
    /// from the table notifies.
    fn expire(&self, id: &str, deadline: Instant) {
        if !self.running.load(Ordering::SeqCst) {
            return
        }
        let Some(exchange) = self.exchanges.complete(id) else { return };
        let skew = deadline.elapsed();
        if skew > MAX_EXPIRY_SKEW {
            warn!(?skew, id, "expiry fired late; the scheduler is lagging");
        }
        if exchange.message.is_meta_connect() {
            self.connect_pending.store(false, Ordering::SeqCst);
        }
        debug!(id, "exchange expired");
        exchange.fail(&ClientError::Transport(TransportError::Timeout));
    }

    fn handle_incoming(&self, messages: Vec<Message>, dispatcher: &mpsc::UnboundedSender<WsOut>) {
        for message in messages {
            if message.is_reply() {
                let Some(id) = message.id.clone() else {
                    self.push(message);
                    continue
                };
                if let Some(exchange) = self.exchanges.complete(&id) {
                    if message.is_meta_connect() {
                        if message.is_successful() {
                            // snapshot the advised timeout before any listener
                            // can issue the next meta-connect
                            if let Some(timeout) =
                                message.advice.as_ref().and_then(|advice| advice.timeout)
                            {
                                *self.advice_timeout.lock().unwrap() =
                                    Some(Duration::from_millis(timeout));
                            }
                        }
                        self.connect_pending.store(false, Ordering::SeqCst);
                    } else if message.is_meta_disconnect() && message.is_successful() {
                        self.disconnected.store(true, Ordering::SeqCst);
                    }
                    exchange.listener.on_messages(vec![message]);
                } else {
                    // the exchange expired; a late reply must not be
                    // delivered a second time
                    debug!(id, "dropping reply for expired exchange");
                }
            } else {
                self.push(message);
            }
        }
        if self.disconnected.load(Ordering::SeqCst) && !self.connect_pending.load(Ordering::SeqCst)
        {
            let _ = dispatcher.unbounded_send(WsOut::Close {
                code: NORMAL_CLOSE,
                reason: "Disconnect".to_string(),
            });
        }
    }

    fn push(&self, message: Message) {
        let listener = self.push_listener.lock().unwrap().clone();
        match listener {
            Some(listener) => listener.on_messages(vec![message]),
            None => debug!(channel = message.channel, "dropping push without a listener"),
        }
    }

    fn fail_pending(&self, error: TransportError) {
        self.connect_pending.store(false, Ordering::SeqCst);
        let drained = self.exchanges.drain();
        if drained.is_empty() {
            return
        }
        debug!(count = drained.len(), %error, "failing pending exchanges");
        let error = ClientError::Transport(error);
        for exchange in drained {
            exchange.fail(&error);
        }
    }

    fn close_session(&self, code: u16, reason: &str) {
        let backend = self.backend.lock().unwrap();
        if let Some(active) = backend.as_ref() {
            let _ =
                active.dispatcher.unbounded_send(WsOut::Close { code, reason: reason.to_string() });
        }
    }

    fn clear_backend(&self, generation: u64) {
        let mut backend = self.backend.lock().unwrap();
        if backend.as_ref().map(|active| active.generation) == Some(generation) {
            backend.take();
        }
    }
}
