use bayeux_core::InvalidChannelName;

/// Failures raised by a transport, from connection establishment through
/// frame processing and exchange expiry.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Thrown if a frame could not be serialized or deserialized
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Internal websocket error
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    /// The websocket session did not open within `connect_timeout`
    #[error("websocket connect timed out")]
    ConnectTimeout,

    /// The server refused the websocket upgrade; the transport marks itself
    /// permanently unsupported so the session can fall back
    #[error("websocket upgrade rejected: HTTP {status} (close code {close_code})")]
    UpgradeRejected { status: u16, close_code: u16 },

    /// Remote closed the connection
    #[error("connection closed: code {code}, reason {reason:?}")]
    Closed { code: u16, reason: String },

    /// Nothing was received within `idle_timeout`
    #[error("connection idle for too long")]
    IdleTimeout,

    /// A pending exchange saw neither reply nor failure within its
    /// network-delay budget
    #[error("Exchange expired")]
    Timeout,

    /// The transport was aborted while the exchange was pending
    #[error("transport aborted")]
    Aborted,

    /// Thrown if the websocket responds with binary data
    #[error("websocket responded with unexpected binary data")]
    UnexpectedBinary,

    /// Unexpected internal channel closure. This is likely a bug
    #[error("unexpected internal channel closure")]
    DeadChannel,
}

/// Session-level failures surfaced to the embedding application.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Channel name failed validation
    #[error(transparent)]
    InvalidChannel(#[from] InvalidChannelName),

    /// Operation attempted against a released channel, an aborted transport,
    /// or a session in the wrong lifecycle state
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A reply carried `successful: false` for a request the caller awaited
    #[error("server rejected request on {channel}: {error}")]
    Rejected { channel: String, error: String },

    /// An extension dropped the caller's own outgoing message
    #[error("message vetoed by an extension")]
    Vetoed,

    /// The request was in flight when its transport failed or timed out
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// No registered transport accepted the protocol version
    #[error("no transport available for Bayeux version {0}")]
    NoTransport(String),

    /// The channel outlived its session
    #[error("session has been dropped")]
    SessionGone,
}

impl ClientError {
    pub(crate) fn illegal_state(what: impl Into<String>) -> Self {
        Self::IllegalState(what.into())
    }

    /// Whether the underlying cause is an exchange expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout))
    }
}
