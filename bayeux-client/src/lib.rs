#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::type_complexity)]

//! Client side of the Bayeux pub/sub protocol.
//!
//! A [`BayeuxClient`] drives the handshake → connect → subscribe/publish →
//! disconnect lifecycle over a pluggable [`Transport`] (the provided
//! realization is a multiplexing [`WebSocketTransport`]), exposes an
//! interned channel tree with release semantics, and runs an ordered
//! [`Extension`] chain on every message in both directions.

mod channel;
pub use channel::{Channel, ChannelRegistry, ListenerId, MessageListener};

mod error;
pub use error::{ClientError, TransportError};

mod extension;
pub use extension::{Extension, ExtensionChain};

mod session;
pub use session::{BayeuxClient, LogLevel, SessionState};

pub mod transport;
pub use transport::{
    exchange::{Exchange, ExchangeTable},
    mock::MockTransport,
    scheduler::{Scheduler, TimeoutHandle},
    ws::WebSocketTransport,
    Transport, TransportListener, TransportOptions,
};

// wire model, re-exported for convenience
pub use bayeux_core::{
    generate_json, parse_messages, Advice, ChannelId, Message, ReconnectPolicy, BAYEUX_VERSION,
};
