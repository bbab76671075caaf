pub mod exchange;
pub mod mock;
pub mod scheduler;
pub mod ws;

use crate::error::ClientError;
use async_trait::async_trait;
use bayeux_core::Message;
use std::{fmt::Debug, sync::Arc, time::Duration};

/// Configuration applied to a transport at [`Transport::init`] time.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Subprotocol announced during the websocket upgrade.
    pub protocol: String,
    /// Bound on establishing the websocket session.
    pub connect_timeout: Duration,
    /// Tear the connection down after this long without inbound traffic.
    pub idle_timeout: Duration,
    /// Maximum size of a single incoming frame; `None` defers to the
    /// websocket stack's default policy.
    pub max_message_size: Option<usize>,
    /// Budget for a request's reply before its exchange expires. Meta-connect
    /// exchanges additionally get the server's advised `timeout`.
    pub max_network_delay: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            protocol: "cometd".to_string(),
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_message_size: None,
            max_network_delay: Duration::from_secs(15),
        }
    }
}

/// Callbacks through which a transport reports progress.
///
/// The listener handed to [`Transport::init`] receives server pushes and
/// transport-wide failures; the listener handed to each [`Transport::send`]
/// receives the per-batch notifications. For every sent message,
/// `on_sending` strictly precedes either its reply (`on_messages`) or its
/// failure (`on_failure`), and exactly one of the latter two fires.
pub trait TransportListener: Send + Sync {
    fn on_sending(&self, _messages: &[Message]) {}
    fn on_messages(&self, _messages: Vec<Message>) {}
    fn on_failure(&self, _error: &ClientError, _messages: &[Message]) {}
}

/// Delivers batches of Bayeux messages and correlates their replies.
///
/// Lifecycle: `init` → `send`* → `terminate`, with `abort` as the forced
/// synchronous teardown and `reset` releasing resources created at `init`
/// (after which `init` may be called again).
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// The connection type advertised in `/meta/handshake`.
    fn name(&self) -> &'static str;

    /// Applies configuration and installs the listener for unsolicited
    /// messages. Idempotent relative to a subsequent `reset`.
    fn init(&self, options: TransportOptions, listener: Arc<dyn TransportListener>);

    /// Whether this transport is willing to carry the given protocol
    /// version. May veto based on prior failures.
    fn accept(&self, bayeux_version: &str) -> bool;

    /// Delivers a batch. Failures are reported through the listener; there
    /// is no ordering guarantee between independent batches.
    async fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>);

    /// Forced shutdown: every pending exchange fails with `Aborted`.
    fn abort(&self);

    /// Releases resources created at `init`.
    fn reset(&self);

    /// Graceful shutdown after the last reply.
    async fn terminate(&self);
}
