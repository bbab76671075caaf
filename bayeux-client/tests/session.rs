//! End-to-end session scenarios over the in-crate mock transport. All
//! synchronization keys off session state events and the mock's held
//! meta-connect; no test sleeps on the wall clock.

use bayeux_client::{
    BayeuxClient, ClientError, Extension, Message, MockTransport, SessionState, TransportOptions,
};
use serde_json::json;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

#[derive(Default)]
struct Counting {
    incoming: AtomicUsize,
    outgoing: AtomicUsize,
}

impl Extension for Counting {
    fn incoming(&self, message: Message) -> Option<Message> {
        self.incoming.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }

    fn outgoing(&self, message: Message) -> Option<Message> {
        self.outgoing.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }
}

struct IncomingOnly(Arc<AtomicUsize>);

impl Extension for IncomingOnly {
    fn incoming(&self, message: Message) -> Option<Message> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }
}

struct OutgoingOnly(Arc<AtomicUsize>);

impl Extension for OutgoingOnly {
    fn outgoing(&self, message: Message) -> Option<Message> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Some(message)
    }
}

struct Empty;

impl Extension for Empty {}

struct VetoDisconnect;

impl Extension for VetoDisconnect {
    fn outgoing(&self, message: Message) -> Option<Message> {
        if message.is_meta_disconnect() {
            None
        } else {
            Some(message)
        }
    }
}

struct VetoConnectReplies;

impl Extension for VetoConnectReplies {
    fn incoming(&self, message: Message) -> Option<Message> {
        if message.is_meta_connect() {
            None
        } else {
            Some(message)
        }
    }
}

fn client_with_mock() -> (BayeuxClient, MockTransport) {
    let mock = MockTransport::new();
    let client = BayeuxClient::with_transports(
        vec![Arc::new(mock.clone())],
        TransportOptions::default(),
    );
    (client, mock)
}

async fn connected_client() -> (BayeuxClient, MockTransport) {
    let (client, mock) = client_with_mock();
    client.handshake(None).await.unwrap();
    client.wait_connected().await;
    mock.wait_for_held_connect().await;
    (client, mock)
}

#[tokio::test]
async fn extension_register_and_unregister() {
    let (client, mock) = client_with_mock();
    let incoming = Arc::new(AtomicUsize::new(0));
    let outgoing = Arc::new(AtomicUsize::new(0));
    assert!(client.add_extension("in", Arc::new(IncomingOnly(incoming.clone()))));
    assert!(client.add_extension("out", Arc::new(OutgoingOnly(outgoing.clone()))));
    assert!(client.add_extension("empty", Arc::new(Empty)));
    assert!(!client.add_extension("in", Arc::new(Empty)), "duplicate names are refused");

    client.handshake(None).await.unwrap();
    client.wait_connected().await;
    mock.wait_for_held_connect().await;

    // handshake-reply + connect1-reply in; handshake, connect1, connect2 out
    assert_eq!(incoming.load(Ordering::SeqCst), 2);
    assert_eq!(outgoing.load(Ordering::SeqCst), 3);

    assert!(client.remove_extension("in"));
    assert!(client.remove_extension("out"));

    let channel = client.get_channel("/echo").unwrap();
    let reply = channel.publish(json!("ping")).await.unwrap();
    assert!(reply.is_successful());

    // unregistered extensions see nothing
    assert_eq!(incoming.load(Ordering::SeqCst), 2);
    assert_eq!(outgoing.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn extension_counts_across_a_full_session() {
    let (client, mock) = client_with_mock();
    let counter = Arc::new(Counting::default());
    client.add_extension("count", counter.clone());

    client.handshake(None).await.unwrap();
    client.wait_connected().await;
    mock.wait_for_held_connect().await;
    assert_eq!(counter.outgoing.load(Ordering::SeqCst), 3);
    assert_eq!(counter.incoming.load(Ordering::SeqCst), 2);

    let channel = client.get_channel("/echo").unwrap();
    let subscription = channel.subscribe(Arc::new(|_| {})).await.unwrap();
    assert_eq!(counter.outgoing.load(Ordering::SeqCst), 4);
    assert_eq!(counter.incoming.load(Ordering::SeqCst), 3);

    let reply = channel.publish(json!("test")).await.unwrap();
    assert!(reply.is_successful());
    // the publish goes out once; its reply and the echoed broadcast come in
    assert_eq!(counter.outgoing.load(Ordering::SeqCst), 5);
    assert_eq!(counter.incoming.load(Ordering::SeqCst), 5);

    channel.unsubscribe(Some(subscription)).await.unwrap();
    assert_eq!(counter.outgoing.load(Ordering::SeqCst), 6);
    assert_eq!(counter.incoming.load(Ordering::SeqCst), 6);

    client.disconnect().await.unwrap();
    // the disconnect goes out; the released connect2-reply and the
    // disconnect-reply come in
    assert_eq!(counter.outgoing.load(Ordering::SeqCst), 7);
    assert_eq!(counter.incoming.load(Ordering::SeqCst), 8);
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn subscribers_receive_echoed_broadcasts() {
    let (client, _mock) = connected_client().await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let channel = client.get_channel("/echo").unwrap();
    channel
        .subscribe(Arc::new(move |message: &Message| {
            sink.lock().unwrap().push(message.data.clone());
        }))
        .await
        .unwrap();

    channel.publish(json!({"text": "hello"})).await.unwrap();

    let received = received.lock().unwrap();
    assert_eq!(*received, vec![Some(json!({"text": "hello"}))]);
}

#[tokio::test]
async fn session_reaches_connected_and_reports_client_id_messages() {
    let (client, mock) = connected_client().await;
    assert!(client.is_connected());

    // everything after the handshake carries the server-assigned clientId
    let sent = mock.sent();
    assert_eq!(sent[0].channel, "/meta/handshake");
    assert!(sent[0].client_id.is_none());
    for message in &sent[1..] {
        assert_eq!(message.client_id.as_deref(), Some("mock-client"));
    }
}

#[tokio::test]
async fn channel_release_yields_a_fresh_instance() {
    let (client, _mock) = client_with_mock();

    let channel = client.get_channel("/foo").unwrap();
    channel.set_attribute("marker", json!(1)).unwrap();

    // interned: the same instance comes back while not released
    let same = client.get_channel("/foo").unwrap();
    assert_eq!(same.get_attribute("marker").unwrap(), Some(json!(1)));

    assert!(channel.release());
    let fresh = client.get_channel("/foo").unwrap();
    assert_eq!(fresh.get_attribute("marker").unwrap(), None);

    // the released instance stays inert
    assert!(matches!(
        channel.set_attribute("marker", json!(2)),
        Err(ClientError::IllegalState(_))
    ));
}

#[tokio::test]
async fn channel_with_subscriber_cannot_be_released() {
    let (client, _mock) = connected_client().await;

    let channel = client.get_channel("/echo").unwrap();
    let subscription = channel.subscribe(Arc::new(|_| {})).await.unwrap();
    channel.publish(json!("")).await.unwrap();

    assert!(!channel.release());
    channel.set_attribute("marker", json!(true)).unwrap();
    let same = client.get_channel("/echo").unwrap();
    assert_eq!(same.get_attribute("marker").unwrap(), Some(json!(true)));

    assert!(channel.unsubscribe(Some(subscription)).await.unwrap());
    assert!(channel.release());
}

#[tokio::test]
async fn vetoed_incoming_connect_reply_does_not_stall_the_connect_loop() {
    let (client, mock) = client_with_mock();
    client.add_extension("veto-connect", Arc::new(VetoConnectReplies));

    // a listener on the meta channel must not observe the vetoed replies
    let observed = Arc::new(AtomicUsize::new(0));
    let counter = observed.clone();
    client
        .get_channel("/meta/connect")
        .unwrap()
        .add_listener(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    client.handshake(None).await.unwrap();
    client.wait_connected().await;
    // the vetoed connect1 reply still drove the loop: the next meta-connect
    // went out and is being long-polled
    mock.wait_for_held_connect().await;
    assert_eq!(mock.sent_to("/meta/connect"), 2);
    assert!(client.is_connected());
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    // the loop also winds down per advice with the veto still in place
    client.disconnect().await.unwrap();
    assert_eq!(client.state(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn vetoed_disconnect_forces_the_local_transition() {
    let (client, mock) = connected_client().await;
    client.add_extension("veto", Arc::new(VetoDisconnect));

    client.disconnect().await.unwrap();

    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(mock.sent_to("/meta/disconnect"), 0, "the vetoed disconnect never left");
}

#[tokio::test]
async fn rejected_handshake_with_advice_none_ends_the_session() {
    let (client, mock) = client_with_mock();
    mock.reject_handshakes(true);

    client.handshake(None).await.unwrap();
    client.wait_disconnected().await;

    assert!(!client.is_connected());
    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(mock.sent_to("/meta/connect"), 0, "no connect follows a dead handshake");
}

#[tokio::test]
async fn abort_ends_the_session_without_a_disconnect() {
    let (client, mock) = connected_client().await;

    client.abort();
    assert_eq!(client.state(), SessionState::Disconnected);
    assert_eq!(mock.sent_to("/meta/disconnect"), 0);

    // an aborted session refuses further work
    let channel = client.get_channel("/echo").unwrap();
    assert!(matches!(
        channel.publish(json!(1)).await,
        Err(ClientError::IllegalState(_))
    ));
}

#[tokio::test]
async fn handshake_ext_is_carried_on_the_wire() {
    let (client, mock) = client_with_mock();
    let mut ext = serde_json::Map::new();
    ext.insert("token".to_string(), json!("secret"));

    client.handshake(Some(ext)).await.unwrap();
    client.wait_connected().await;

    let sent = mock.sent();
    assert_eq!(sent[0].channel, "/meta/handshake");
    assert_eq!(sent[0].ext.as_ref().unwrap()["token"], json!("secret"));
    assert_eq!(sent[0].version.as_deref(), Some("1.0"));
    assert_eq!(
        sent[0].supported_connection_types.as_ref().unwrap(),
        &vec!["mock".to_string()]
    );
}
