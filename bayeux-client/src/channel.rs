use crate::{
    error::ClientError,
    session::{BayeuxClient, SessionInner},
};
use bayeux_core::{ChannelId, Message};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};
use tracing::trace;

/// Callback receiving messages for a channel. Runs on whatever task the
/// transport delivers from; the core never holds internal locks during the
/// call.
pub type MessageListener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle identifying one registered listener or subscriber on a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A topic on the server, obtained from [`BayeuxClient::get_channel`].
///
/// Channels are interned: as long as a channel has not been released,
/// looking its path up again yields the same instance. A successful
/// [`Channel::release`] evicts it, and every subsequent operation on the
/// released instance fails with [`ClientError::IllegalState`].
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: ChannelId,
    // lookup only, never lifetime: channels must not keep their session alive
    session: Weak<SessionInner>,
    registry: Weak<ChannelRegistry>,
    next_listener: AtomicU64,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    listeners: Vec<(ListenerId, MessageListener)>,
    subscribers: Vec<(ListenerId, MessageListener)>,
    attributes: HashMap<String, Value>,
    released: bool,
}

impl Channel {
    fn new(id: ChannelId, session: Weak<SessionInner>, registry: Weak<ChannelRegistry>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                session,
                registry,
                next_listener: AtomicU64::new(1),
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.inner.id
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.lock().unwrap().released
    }

    /// Locks the state, failing if the channel has been released.
    fn guard(&self) -> Result<MutexGuard<'_, ChannelState>, ClientError> {
        let state = self.inner.state.lock().unwrap();
        if state.released {
            return Err(ClientError::illegal_state(format!(
                "channel {} has been released",
                self.inner.id
            )))
        }
        Ok(state)
    }

    fn session_inner(&self) -> Result<Arc<SessionInner>, ClientError> {
        // interrogating a released channel fails before the weak lookup does
        let _guard = self.guard()?;
        self.inner.session.upgrade().ok_or(ClientError::SessionGone)
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    /// The session this channel belongs to.
    pub fn session(&self) -> Result<BayeuxClient, ClientError> {
        self.session_inner().map(BayeuxClient::from_inner)
    }

    /// Adds a general channel listener, notified of every message dispatched
    /// to this channel.
    pub fn add_listener(&self, listener: MessageListener) -> Result<ListenerId, ClientError> {
        let mut state = self.guard()?;
        let id = self.next_listener_id();
        state.listeners.push((id, listener));
        Ok(id)
    }

    /// Removes a listener, returning whether it was present.
    pub fn remove_listener(&self, id: ListenerId) -> Result<bool, ClientError> {
        let mut state = self.guard()?;
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| *existing != id);
        Ok(state.listeners.len() != before)
    }

    pub fn listeners(&self) -> Result<Vec<ListenerId>, ClientError> {
        Ok(self.guard()?.listeners.iter().map(|(id, _)| *id).collect())
    }

    pub fn subscribers(&self) -> Result<Vec<ListenerId>, ClientError> {
        Ok(self.guard()?.subscribers.iter().map(|(id, _)| *id).collect())
    }

    /// Subscribes to this channel. The first subscriber sends
    /// `/meta/subscribe` and the subscriber is attached only once the server
    /// acknowledges it.
    pub async fn subscribe(&self, listener: MessageListener) -> Result<ListenerId, ClientError> {
        if self.inner.id.is_meta() {
            return Err(ClientError::illegal_state(format!(
                "cannot subscribe to meta channel {}",
                self.inner.id
            )))
        }
        let session = self.session_inner()?;
        let first = self.guard()?.subscribers.is_empty();
        if first {
            let reply = session.send_request(Message::subscribe(self.inner.id.as_str())).await?;
            if !reply.is_successful() {
                return Err(ClientError::Rejected {
                    channel: self.inner.id.to_string(),
                    error: reply.error.unwrap_or_else(|| "subscribe denied".to_string()),
                })
            }
        }
        // the channel may have been released while the reply was in flight
        let mut state = self.guard()?;
        let id = self.next_listener_id();
        state.subscribers.push((id, listener));
        Ok(id)
    }

    /// Removes one subscriber (or all, with `None`). When the last
    /// subscriber goes, `/meta/unsubscribe` is sent; the local removal holds
    /// even if the server rejects it, and the rejection is returned.
    pub async fn unsubscribe(&self, listener: Option<ListenerId>) -> Result<bool, ClientError> {
        let session = self.session_inner()?;
        let (removed, now_empty) = {
            let mut state = self.guard()?;
            let before = state.subscribers.len();
            match listener {
                Some(id) => state.subscribers.retain(|(existing, _)| *existing != id),
                None => state.subscribers.clear(),
            }
            (state.subscribers.len() != before, state.subscribers.is_empty())
        };
        if removed && now_empty {
            let reply = session.send_request(Message::unsubscribe(self.inner.id.as_str())).await?;
            if !reply.is_successful() {
                return Err(ClientError::Rejected {
                    channel: self.inner.id.to_string(),
                    error: reply.error.unwrap_or_else(|| "unsubscribe denied".to_string()),
                })
            }
        }
        Ok(removed)
    }

    /// Publishes `data` on this channel and returns the publish-reply,
    /// correlated back by message id. Delivery is best-effort: a reply with
    /// `successful: false` is returned, not an error.
    pub async fn publish(&self, data: Value) -> Result<Message, ClientError> {
        let session = self.session_inner()?;
        session.send_request(Message::publish(self.inner.id.as_str(), data)).await
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Value) -> Result<(), ClientError> {
        self.guard()?.attributes.insert(name.into(), value);
        Ok(())
    }

    pub fn get_attribute(&self, name: &str) -> Result<Option<Value>, ClientError> {
        Ok(self.guard()?.attributes.get(name).cloned())
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<Value>, ClientError> {
        Ok(self.guard()?.attributes.remove(name))
    }

    pub fn attribute_names(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.guard()?.attributes.keys().cloned().collect())
    }

    /// Releases this channel if it has no listeners and no subscribers.
    ///
    /// On success the channel is evicted from the registry and becomes
    /// inert; the next lookup of the same path creates a fresh instance.
    /// Releasing an already-released channel is a no-op returning `true`.
    pub fn release(&self) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.released {
                return true
            }
            if !state.listeners.is_empty() || !state.subscribers.is_empty() {
                return false
            }
            state.released = true;
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.evict(self.inner.id.as_str());
        }
        trace!(channel = %self.inner.id, "channel released");
        true
    }

    /// Delivers a message to this channel's observers, cloning the callback
    /// list first so no internal lock is held during user code.
    pub(crate) fn deliver(&self, message: &Message, include_subscribers: bool) {
        let callbacks: Vec<MessageListener> = {
            let state = self.inner.state.lock().unwrap();
            if state.released {
                return
            }
            let listeners = state.listeners.iter().map(|(_, l)| l.clone());
            if include_subscribers {
                listeners.chain(state.subscribers.iter().map(|(_, s)| s.clone())).collect()
            } else {
                listeners.collect()
            }
        };
        for callback in callbacks {
            callback(message);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("listeners", &state.listeners.len())
            .field("subscribers", &state.subscribers.len())
            .field("released", &state.released)
            .finish()
    }
}

/// Interned tree of channels, owned by the session.
///
/// `get_or_create` is observably single per path: concurrent lookups of the
/// same name return the same instance until a successful release evicts it.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_or_create(
        self: &Arc<Self>,
        id: ChannelId,
        session: Weak<SessionInner>,
    ) -> Channel {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(id.as_str().to_string())
            .or_insert_with(|| Channel::new(id, session, Arc::downgrade(self)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        self.channels.lock().unwrap().get(name).cloned()
    }

    /// Drops the interned instance for `name` if it has been released.
    pub(crate) fn evict(&self, name: &str) {
        let mut channels = self.channels.lock().unwrap();
        if channels.get(name).map(Channel::is_released).unwrap_or(false) {
            channels.remove(name);
        }
    }

    /// Routes an incoming message: meta traffic to the meta channel's
    /// listeners, broadcasts to the exact channel and every matching
    /// wildcard channel. Publish-replies are not dispatched here; they
    /// resolve their caller's pending request instead.
    pub(crate) fn dispatch(&self, message: &Message) {
        if message.is_publish_reply() {
            return
        }
        let Ok(id) = message.channel_id() else { return };
        let broadcast = !message.is_meta();
        let targets: Vec<Channel> = {
            let channels = self.channels.lock().unwrap();
            let mut targets = Vec::new();
            if let Some(channel) = channels.get(id.as_str()) {
                targets.push(channel.clone());
            }
            if broadcast {
                for wild in id.wilds() {
                    if let Some(channel) = channels.get(&wild) {
                        targets.push(channel.clone());
                    }
                }
            }
            targets
        };
        for channel in targets {
            channel.deliver(message, broadcast);
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().unwrap().len() == 0
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry").field("channels", &self.len()).finish()
    }
}
