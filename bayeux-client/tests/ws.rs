//! WebSocket transport against a scripted in-process server: a real TCP
//! socket, a real upgrade, and Bayeux frames on the wire.

use bayeux_client::{
    BayeuxClient, ClientError, Message, SessionState, Transport, TransportError,
    TransportListener, TransportOptions, WebSocketTransport,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

/// One scripted Bayeux server session: immediate handshake/subscribe/publish
/// replies, long-polled second meta-connect, released on disconnect.
async fn run_server(listener: TcpListener) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
    let mut connects = 0usize;
    let mut held: Option<Value> = None;

    while let Some(frame) = ws.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(_) => break,
        };
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let requests: Vec<Value> = serde_json::from_str(&text).unwrap();
        let mut replies = Vec::new();
        for request in requests {
            let channel = request["channel"].as_str().unwrap().to_string();
            let id = request["id"].clone();
            match channel.as_str() {
                "/meta/handshake" => replies.push(json!({
                    "id": id,
                    "channel": channel,
                    "successful": true,
                    "clientId": "srv-1",
                    "version": "1.0",
                    "supportedConnectionTypes": ["websocket"],
                })),
                "/meta/connect" => {
                    connects += 1;
                    if connects == 1 {
                        replies.push(json!({
                            "id": id,
                            "channel": channel,
                            "successful": true,
                            "advice": {"reconnect": "retry", "interval": 0, "timeout": 10_000},
                        }));
                    } else {
                        held = Some(id);
                    }
                }
                "/meta/disconnect" => {
                    if let Some(held_id) = held.take() {
                        replies.push(json!({
                            "id": held_id,
                            "channel": "/meta/connect",
                            "successful": true,
                            "advice": {"reconnect": "none"},
                        }));
                    }
                    replies.push(json!({"id": id, "channel": channel, "successful": true}));
                }
                publish => replies.push(json!({
                    "id": id,
                    "channel": publish,
                    "successful": true,
                })),
            }
        }
        if !replies.is_empty() {
            let frame = serde_json::to_string(&replies).unwrap();
            if ws.send(WsMessage::Text(frame)).await.is_err() {
                break
            }
        }
    }
}

#[tokio::test]
async fn full_session_over_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_server(listener));

    // http scheme: the transport rewrites it to ws://
    let client = BayeuxClient::new(format!("http://{addr}/cometd"));
    client.handshake(None).await.unwrap();
    client.wait_connected().await;
    assert!(client.is_connected());

    let reply = client.get_channel("/echo").unwrap().publish(json!({"n": 1})).await.unwrap();
    assert!(reply.is_successful());
    assert_eq!(reply.channel, "/echo");

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[derive(Default)]
struct RecordingListener {
    rejections: Mutex<Vec<(u16, u16)>>,
}

impl TransportListener for RecordingListener {
    fn on_failure(&self, error: &ClientError, _messages: &[Message]) {
        if let ClientError::Transport(TransportError::UpgradeRejected { status, close_code }) =
            error
        {
            self.rejections.lock().unwrap().push((*status, *close_code));
        }
    }
}

#[tokio::test]
async fn rejected_upgrade_disables_the_transport() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 2048];
        let _ = stream.read(&mut buf).await;
        let _ = stream
            .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
            .await;
    });

    let transport = WebSocketTransport::new(format!("http://{addr}/cometd"));
    let recorder = Arc::new(RecordingListener::default());
    transport.init(TransportOptions::default(), recorder.clone());
    assert!(transport.accept("1.0"));

    let mut handshake = Message::handshake(vec!["websocket".to_string()]);
    handshake.id = Some("1".to_string());
    transport.send(recorder.clone(), vec![handshake]).await;

    let rejections = recorder.rejections.lock().unwrap().clone();
    assert_eq!(rejections, vec![(403, 1002)]);
    // permanently unsupported for this instance: the session falls back
    assert!(!transport.accept("1.0"));
}
