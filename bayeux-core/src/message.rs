use crate::{
    advice::Advice,
    channel_id::{self, ChannelId, InvalidChannelName},
    BAYEUX_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A Bayeux message envelope, immutable once handed to a transport.
///
/// Every known Bayeux 1.0 member gets a typed field; anything else lands in
/// `rest` and is re-emitted verbatim, so parsing and regenerating a frame
/// preserves its content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    /// Correlation key between a request and its reply. Unique per session,
    /// minted monotonically, rendered as a decimal string on the wire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub channel: String,
    /// Session identifier assigned by the server in the handshake reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Present on replies only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The channel being (un)subscribed, on `/meta/(un)subscribe` traffic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Message {
    pub fn new(channel: impl Into<String>) -> Self {
        Self { channel: channel.into(), ..Default::default() }
    }

    /// A `/meta/handshake` request advertising the given connection types.
    pub fn handshake(connection_types: Vec<String>) -> Self {
        Self {
            version: Some(BAYEUX_VERSION.to_string()),
            minimum_version: Some(BAYEUX_VERSION.to_string()),
            supported_connection_types: Some(connection_types),
            ..Self::new(channel_id::META_HANDSHAKE)
        }
    }

    pub fn connect(connection_type: impl Into<String>) -> Self {
        Self {
            connection_type: Some(connection_type.into()),
            ..Self::new(channel_id::META_CONNECT)
        }
    }

    pub fn subscribe(subscription: impl Into<String>) -> Self {
        Self { subscription: Some(subscription.into()), ..Self::new(channel_id::META_SUBSCRIBE) }
    }

    pub fn unsubscribe(subscription: impl Into<String>) -> Self {
        Self { subscription: Some(subscription.into()), ..Self::new(channel_id::META_UNSUBSCRIBE) }
    }

    pub fn disconnect() -> Self {
        Self::new(channel_id::META_DISCONNECT)
    }

    pub fn publish(channel: impl Into<String>, data: Value) -> Self {
        Self { data: Some(data), ..Self::new(channel) }
    }

    pub fn channel_id(&self) -> Result<ChannelId, InvalidChannelName> {
        ChannelId::parse(&self.channel)
    }

    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    /// A reply to a publish: a non-meta message carrying the `successful`
    /// flag and echoing the request id.
    pub fn is_publish_reply(&self) -> bool {
        !self.is_meta() && self.successful.is_some()
    }

    /// Replies are correlated back to their exchange; everything else is a
    /// server push.
    pub fn is_reply(&self) -> bool {
        self.is_meta() || self.is_publish_reply()
    }

    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    pub fn is_meta_connect(&self) -> bool {
        self.channel == channel_id::META_CONNECT
    }

    pub fn is_meta_disconnect(&self) -> bool {
        self.channel == channel_id::META_DISCONNECT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_id::META_CONNECT;
    use serde_json::json;

    #[test]
    fn it_classifies_messages() {
        let mut connect = Message::connect("websocket");
        assert!(connect.is_meta());
        assert!(connect.is_meta_connect());
        assert!(!connect.is_publish_reply());
        // a meta message is treated as a reply even before `successful` is set
        assert!(connect.is_reply());
        connect.successful = Some(true);
        assert!(connect.is_successful());

        let broadcast = Message::publish("/chat/demo", json!({"text": "hi"}));
        assert!(!broadcast.is_meta());
        assert!(!broadcast.is_reply());

        let mut reply = broadcast.clone();
        reply.successful = Some(true);
        reply.data = None;
        assert!(reply.is_publish_reply());
        assert!(reply.is_reply());
    }

    #[test]
    fn it_round_trips_unknown_members() {
        let raw = json!({
            "id": "7",
            "channel": META_CONNECT,
            "clientId": "abc123",
            "successful": true,
            "advice": {"reconnect": "retry", "interval": 0, "timeout": 20_000},
            "timestamp": "2024-01-01T00:00:00Z",
        });
        let msg: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(msg.client_id.as_deref(), Some("abc123"));
        assert_eq!(msg.rest["timestamp"], json!("2024-01-01T00:00:00Z"));
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }
}
