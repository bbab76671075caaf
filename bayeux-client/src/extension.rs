use bayeux_core::Message;
use std::sync::{Arc, RwLock};
use tracing::trace;

/// A named interceptor running on every message in each direction.
///
/// Both hooks default to pass-through, so an extension may implement only
/// the direction it cares about (or neither; an empty extension is legal and
/// effectively skipped). Returning `None` vetoes the message: an incoming
/// message is not dispatched, an outgoing message is not sent.
pub trait Extension: Send + Sync {
    /// Runs on every received message before the session processes it.
    fn incoming(&self, message: Message) -> Option<Message> {
        Some(message)
    }

    /// Runs on every message about to be sent.
    fn outgoing(&self, message: Message) -> Option<Message> {
        Some(message)
    }
}

/// Ordered, named chain of [`Extension`]s.
///
/// Extensions run in registration order in both directions, exactly once per
/// message per direction. A veto short-circuits the rest of the chain.
#[derive(Default)]
pub struct ExtensionChain {
    entries: RwLock<Vec<(String, Arc<dyn Extension>)>>,
}

impl ExtensionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an extension. Returns `false` (and leaves the chain
    /// unchanged) if the name is already taken.
    pub fn register(&self, name: impl Into<String>, extension: Arc<dyn Extension>) -> bool {
        let name = name.into();
        let mut entries = self.entries.write().unwrap();
        if entries.iter().any(|(existing, _)| *existing == name) {
            return false
        }
        entries.push((name, extension));
        true
    }

    /// Removes the named extension, returning whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|(existing, _)| existing != name);
        entries.len() != before
    }

    pub fn incoming(&self, message: Message) -> Option<Message> {
        self.run(message, |extension, message| extension.incoming(message), "incoming")
    }

    pub fn outgoing(&self, message: Message) -> Option<Message> {
        self.run(message, |extension, message| extension.outgoing(message), "outgoing")
    }

    fn run(
        &self,
        mut message: Message,
        hook: impl Fn(&dyn Extension, Message) -> Option<Message>,
        direction: &'static str,
    ) -> Option<Message> {
        // snapshot so user hooks never run under the chain's lock
        let entries: Vec<(String, Arc<dyn Extension>)> =
            self.entries.read().unwrap().iter().cloned().collect();
        for (name, extension) in entries {
            match hook(extension.as_ref(), message) {
                Some(next) => message = next,
                None => {
                    trace!(name, direction, "message vetoed by extension");
                    return None
                }
            }
        }
        Some(message)
    }
}

impl std::fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> =
            self.entries.read().unwrap().iter().map(|(name, _)| name.clone()).collect();
        f.debug_struct("ExtensionChain").field("extensions", &names).finish()
    }
}
