use crate::{
    error::ClientError,
    transport::{scheduler::TimeoutHandle, TransportListener},
};
use bayeux_core::Message;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// The tracking record for one in-flight request awaiting its reply.
pub struct Exchange {
    pub message: Message,
    pub listener: Arc<dyn TransportListener>,
    timeout: Option<TimeoutHandle>,
}

impl Exchange {
    pub fn new(
        message: Message,
        listener: Arc<dyn TransportListener>,
        timeout: Option<TimeoutHandle>,
    ) -> Self {
        Self { message, listener, timeout }
    }

    /// Reports this exchange as failed through its listener.
    pub fn fail(&self, error: &ClientError) {
        self.listener.on_failure(error, std::slice::from_ref(&self.message));
    }

    fn cancel_timeout(&self) {
        if let Some(timeout) = &self.timeout {
            timeout.cancel();
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange").field("id", &self.message.id).finish_non_exhaustive()
    }
}

/// Maps outgoing message ids to their pending [`Exchange`]s.
///
/// `complete` is a linearizable remove-and-return, so the reply path, the
/// expiry path, and `drain` race safely: whoever removes the entry notifies,
/// everyone else stays silent. Timers are cancelled strictly after removal
/// so a cancelled timer can never resurrect an entry.
#[derive(Debug, Default)]
pub struct ExchangeTable {
    entries: Mutex<HashMap<String, Exchange>>,
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending exchange. Registering two exchanges for the same
    /// message id is a programming error and panics.
    pub fn register(&self, id: String, exchange: Exchange) {
        let prev = self.entries.lock().unwrap().insert(id.clone(), exchange);
        assert!(prev.is_none(), "duplicate exchange registered for message id {id}");
    }

    /// Removes and returns the pending exchange for `id`, if any. At most
    /// one caller observes `Some` for a given registration.
    pub fn complete(&self, id: &str) -> Option<Exchange> {
        let exchange = self.entries.lock().unwrap().remove(id);
        if let Some(exchange) = &exchange {
            exchange.cancel_timeout();
        }
        exchange
    }

    /// Snapshots and clears every pending exchange, for transport shutdown.
    pub fn drain(&self) -> Vec<Exchange> {
        let drained: Vec<Exchange> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, exchange)| exchange).collect()
        };
        for exchange in &drained {
            exchange.cancel_timeout();
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
