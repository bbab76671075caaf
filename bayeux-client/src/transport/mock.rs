use crate::transport::{Transport, TransportListener, TransportOptions};
use bayeux_core::{Advice, Message, ReconnectPolicy};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::watch;

/// Scripted in-process Bayeux server half, used in test environments.
///
/// It acknowledges handshakes and (un)subscribes immediately, replies to the
/// first meta-connect and long-polls the ones after it (releasing the held
/// connect when the disconnect arrives, like a real server ending the poll),
/// and echoes publishes back as broadcasts on subscribed channels. Every
/// batch is recorded for assertions.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

struct MockInner {
    client_id: String,
    sent: Mutex<Vec<Message>>,
    subscriptions: Mutex<HashSet<String>>,
    held_connect: Mutex<Option<Message>>,
    // observable flag: a meta-connect is currently long-polled
    holding: watch::Sender<bool>,
    connects_seen: AtomicUsize,
    reject_handshakes: AtomicBool,
    running: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (holding, _) = watch::channel(false);
        Self {
            inner: Arc::new(MockInner {
                client_id: "mock-client".to_string(),
                sent: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(HashSet::new()),
                held_connect: Mutex::new(None),
                holding,
                connects_seen: AtomicUsize::new(0),
                reject_handshakes: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Every message the client has sent, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.inner.sent.lock().unwrap().clone()
    }

    /// How many of the sent messages targeted `channel`.
    pub fn sent_to(&self, channel: &str) -> usize {
        self.inner.sent.lock().unwrap().iter().filter(|m| m.channel == channel).count()
    }

    /// Resolves once a meta-connect is being long-polled; the deterministic
    /// stand-in for "the client is idle in its connect loop".
    pub async fn wait_for_held_connect(&self) {
        let mut holding = self.inner.holding.subscribe();
        loop {
            if *holding.borrow_and_update() {
                return
            }
            if holding.changed().await.is_err() {
                return
            }
        }
    }

    /// Makes subsequent handshakes fail with the given advice.
    pub fn reject_handshakes(&self, reject: bool) {
        self.inner.reject_handshakes.store(reject, Ordering::SeqCst);
    }

    /// Delivers a server-originated broadcast outside any exchange.
    pub fn push(&self, listener: &Arc<dyn TransportListener>, message: Message) {
        listener.on_messages(vec![message]);
    }

    fn reply_to(&self, request: &Message) -> Vec<Message> {
        let inner = &self.inner;
        let mut reply = Message::new(request.channel.clone());
        reply.id = request.id.clone();
        reply.client_id = Some(inner.client_id.clone());
        reply.successful = Some(true);

        match request.channel.as_str() {
            bayeux_core::META_HANDSHAKE => {
                if inner.reject_handshakes.load(Ordering::SeqCst) {
                    reply.successful = Some(false);
                    reply.error = Some("403::handshake denied".to_string());
                    reply.advice = Some(Advice {
                        reconnect: Some(ReconnectPolicy::None),
                        ..Default::default()
                    });
                } else {
                    reply.version = Some(bayeux_core::BAYEUX_VERSION.to_string());
                    reply.supported_connection_types = Some(vec!["websocket".to_string()]);
                }
                vec![reply]
            }
            bayeux_core::META_CONNECT => {
                let first = inner.connects_seen.fetch_add(1, Ordering::SeqCst) == 0;
                if first {
                    reply.advice = Some(Advice {
                        reconnect: Some(ReconnectPolicy::Retry),
                        interval: Some(0),
                        ..Default::default()
                    });
                    vec![reply]
                } else {
                    // long poll: park the request until the disconnect
                    *inner.held_connect.lock().unwrap() = Some(request.clone());
                    let _ = inner.holding.send(true);
                    Vec::new()
                }
            }
            bayeux_core::META_SUBSCRIBE => {
                if let Some(subscription) = &request.subscription {
                    inner.subscriptions.lock().unwrap().insert(subscription.clone());
                    reply.subscription = Some(subscription.clone());
                }
                vec![reply]
            }
            bayeux_core::META_UNSUBSCRIBE => {
                if let Some(subscription) = &request.subscription {
                    inner.subscriptions.lock().unwrap().remove(subscription);
                    reply.subscription = Some(subscription.clone());
                }
                vec![reply]
            }
            bayeux_core::META_DISCONNECT => {
                let mut replies = Vec::new();
                // end the long poll before acking the disconnect
                if let Some(held) = inner.held_connect.lock().unwrap().take() {
                    let _ = inner.holding.send(false);
                    let mut connect_reply = Message::new(held.channel);
                    connect_reply.id = held.id;
                    connect_reply.client_id = Some(inner.client_id.clone());
                    connect_reply.successful = Some(true);
                    connect_reply.advice = Some(Advice {
                        reconnect: Some(ReconnectPolicy::None),
                        ..Default::default()
                    });
                    replies.push(connect_reply);
                }
                replies.push(reply);
                replies
            }
            channel => {
                // a publish: ack it, and echo a broadcast to subscribers
                reply.client_id = None;
                let mut replies = vec![reply];
                if inner.subscriptions.lock().unwrap().contains(channel) {
                    let mut broadcast = Message::new(channel);
                    broadcast.data = request.data.clone();
                    replies.push(broadcast);
                }
                replies
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn init(&self, _options: TransportOptions, _listener: Arc<dyn TransportListener>) {
        self.inner.running.store(true, Ordering::SeqCst);
    }

    fn accept(&self, _bayeux_version: &str) -> bool {
        true
    }

    async fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>) {
        self.inner.sent.lock().unwrap().extend(messages.iter().cloned());
        listener.on_sending(&messages);
        for message in &messages {
            for reply in self.reply_to(message) {
                listener.on_messages(vec![reply]);
            }
        }
    }

    fn abort(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    async fn terminate(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("sent", &self.inner.sent.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}
