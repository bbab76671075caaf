use crate::message::Message;

/// Parses a received frame into messages.
///
/// Bayeux frames are JSON arrays, but some servers send a bare object for
/// single-message frames; both are accepted.
pub fn parse_messages(json: &str) -> Result<Vec<Message>, serde_json::Error> {
    if json.trim_start().starts_with('[') {
        serde_json::from_str(json)
    } else {
        serde_json::from_str::<Message>(json).map(|msg| vec![msg])
    }
}

/// Serializes a batch of messages into a single frame.
pub fn generate_json(messages: &[Message]) -> Result<String, serde_json::Error> {
    serde_json::to_string(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn it_parses_arrays_and_bare_objects() {
        let batch = parse_messages(
            r#"[{"channel":"/meta/handshake","version":"1.0"},{"channel":"/foo","data":1}]"#,
        )
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].channel, "/foo");

        let single = parse_messages(r#"{"channel":"/foo","data":{"x":1}}"#).unwrap();
        assert_eq!(single.len(), 1);

        assert!(parse_messages("not json").is_err());
        assert!(parse_messages(r#"[{"channel":"#).is_err());
    }

    #[test]
    fn it_round_trips_frames() {
        let frame = r#"[{"id":"3","channel":"/meta/subscribe","clientId":"c1","subscription":"/echo","successful":true,"ext":{"ack":true}},{"channel":"/echo","data":{"n":42},"extra":"member"}]"#;
        let regenerated = generate_json(&parse_messages(frame).unwrap()).unwrap();
        // equality modulo whitespace and key order
        let a: Value = serde_json::from_str(frame).unwrap();
        let b: Value = serde_json::from_str(&regenerated).unwrap();
        assert_eq!(a, b);
    }
}
