use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the server wants the client to do when the meta-connect loop breaks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Keep the current session and retry `/meta/connect`.
    #[default]
    Retry,
    /// Drop the session and start over with `/meta/handshake`.
    Handshake,
    /// Give up; the session is over.
    None,
}

/// Server-sent hints steering reconnect cadence and timeouts.
///
/// Unknown advice members are preserved in `rest` so that replies survive a
/// parse/generate round trip unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Advice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectPolicy>,
    /// Delay in milliseconds before the next `/meta/connect`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// How long the server intends to hold a `/meta/connect`, in
    /// milliseconds. Added to the client's network-delay budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Upper bound on the retry interval, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<u64>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Advice {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        self.reconnect.unwrap_or_default()
    }

    pub fn interval(&self) -> u64 {
        self.interval.unwrap_or(0)
    }
}
