#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

//! Wire-level model for the Bayeux pub/sub protocol: the message envelope,
//! channel identifiers, server advice, and the JSON codec used to frame
//! batches of messages.
//!
//! This crate is I/O free. The transports and the client session live in
//! `bayeux-client`.

mod message;
pub use message::Message;

mod channel_id;
pub use channel_id::{
    ChannelId, InvalidChannelName, META_CONNECT, META_DISCONNECT, META_HANDSHAKE, META_SUBSCRIBE,
    META_UNSUBSCRIBE,
};

mod advice;
pub use advice::{Advice, ReconnectPolicy};

mod codec;
pub use codec::{generate_json, parse_messages};

/// The Bayeux protocol version spoken by this implementation.
pub const BAYEUX_VERSION: &str = "1.0";
