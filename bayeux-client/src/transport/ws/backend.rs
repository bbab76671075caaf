use crate::error::TransportError;
use bayeux_core::{parse_messages, Message};
use futures_channel::{mpsc, oneshot};
use futures_util::{select, sink::SinkExt, stream::StreamExt, FutureExt};
use std::time::Duration;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{error, trace};

type WsMessage = tungstenite::protocol::Message;
type InternalStream =
    futures_util::stream::Fuse<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Outbound items the transport hands to the socket task.
#[derive(Debug)]
pub(super) enum WsOut {
    /// A serialized batch of Bayeux messages.
    Frame(String),
    /// Close the session with the given code and human-readable reason.
    Close { code: u16, reason: String },
}

/// `BackendDriver` drives a specific `WsBackend`. It is used to dispatch
/// outbound items, receive parsed inbound batches, observe the terminal
/// error, and shut the backend down.
pub(super) struct BackendDriver {
    // Parsed message batches received via WS
    pub to_handle: mpsc::UnboundedReceiver<Vec<Message>>,
    // Notification from the backend of a terminal error
    pub error: oneshot::Receiver<TransportError>,

    // Items that the backend should write to the socket
    pub dispatcher: mpsc::UnboundedSender<WsOut>,
    // Notify the backend of intentional shutdown
    pub shutdown: oneshot::Sender<()>,
}

/// `WsBackend` owns the websocket and converts between frames and message
/// batches. It keeps the connection alive with pings and enforces the idle
/// timeout.
///
/// The `WsBackend` shuts down when instructed to by the transport or when
/// the transport drops (because the inbound channel will close). A parse
/// error on an inbound frame is terminal: the transport fails every pending
/// exchange and the session is closed with reason `"Exception"`.
pub(super) struct WsBackend {
    server: InternalStream,
    idle_timeout: Duration,

    // channel to the transport, through which to send parsed batches
    handler: mpsc::UnboundedSender<Vec<Message>>,
    // notify the transport of an error causing this task to halt
    error: oneshot::Sender<TransportError>,

    // channel of outbound items to write
    to_dispatch: mpsc::UnboundedReceiver<WsOut>,
    // notification from the transport of intentional shutdown
    shutdown: oneshot::Receiver<()>,
}

impl WsBackend {
    /// Opens the websocket session, bounded by `connect_timeout`. An HTTP
    /// error response to the upgrade is reported as `UpgradeRejected` with
    /// websocket close code 1002.
    pub async fn connect(
        request: http::Request<()>,
        config: Option<WebSocketConfig>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<(Self, BackendDriver), TransportError> {
        let connect = connect_async_with_config(request, config);
        let (ws, _) = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(|err| match err {
                tungstenite::Error::Http(response) => TransportError::UpgradeRejected {
                    status: response.status().as_u16(),
                    close_code: u16::from(CloseCode::Protocol),
                },
                err => TransportError::Ws(err),
            })?;
        Ok(Self::new(ws.fuse(), idle_timeout))
    }

    pub fn new(server: InternalStream, idle_timeout: Duration) -> (Self, BackendDriver) {
        let (handler, to_handle) = mpsc::unbounded();
        let (dispatcher, to_dispatch) = mpsc::unbounded();
        let (error_tx, error_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            WsBackend {
                server,
                idle_timeout,
                handler,
                error: error_tx,
                to_dispatch,
                shutdown: shutdown_rx,
            },
            BackendDriver {
                to_handle,
                error: error_rx,
                dispatcher,
                shutdown: shutdown_tx,
            },
        )
    }

    fn handle_text(&mut self, text: String) -> Result<(), TransportError> {
        trace!(text, "Received frame");
        let batch = parse_messages(&text)?;
        self.handler.unbounded_send(batch).map_err(|_| TransportError::DeadChannel)
    }

    /// Returns `Ok(true)` when a close handshake completed cleanly.
    fn handle(
        &mut self,
        item: Result<WsMessage, tungstenite::Error>,
        closing: bool,
    ) -> Result<bool, TransportError> {
        match item? {
            WsMessage::Text(text) => self.handle_text(text).map(|_| false),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(false),
            WsMessage::Binary(_) => Err(TransportError::UnexpectedBinary),
            WsMessage::Close(frame) => {
                if closing {
                    return Ok(true)
                }
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((u16::from(CloseCode::Abnormal), String::new()));
                Err(TransportError::Closed { code, reason })
            }
        }
    }

    pub fn spawn(mut self) {
        let fut = async move {
            let mut err: Option<TransportError> = None;
            // set once we have sent a close frame and only await the echo
            let mut closing = false;
            let mut last_rx = tokio::time::Instant::now();
            loop {
                let keepalive = tokio::time::sleep(KEEPALIVE_INTERVAL).fuse();
                tokio::pin!(keepalive);
                let idle = tokio::time::sleep_until(last_rx + self.idle_timeout).fuse();
                tokio::pin!(idle);

                select! {
                    _ = keepalive => {
                        if let Err(e) = self.server.send(WsMessage::Ping(vec![])).await {
                            error!(err = %e, "WS connection error");
                            err = Some(e.into());
                            break
                        }
                    }
                    _ = idle => {
                        err = Some(TransportError::IdleTimeout);
                        break
                    }
                    resp = self.server.next() => {
                        match resp {
                            Some(item) => {
                                last_rx = tokio::time::Instant::now();
                                match self.handle(item, closing) {
                                    Ok(false) => {}
                                    // clean close handshake
                                    Ok(true) => break,
                                    Err(e) => {
                                        error!(err = %e, "WS connection error");
                                        err = Some(e);
                                        break
                                    }
                                }
                            }
                            None => {
                                if !closing {
                                    error!("WS server has gone away");
                                    err = Some(TransportError::Closed {
                                        code: u16::from(CloseCode::Abnormal),
                                        reason: "server has gone away".to_string(),
                                    });
                                }
                                break
                            }
                        }
                    }
                    out = self.to_dispatch.next() => {
                        match out {
                            Some(WsOut::Frame(frame)) => {
                                if let Err(e) = self.server.send(WsMessage::Text(frame)).await {
                                    error!(err = %e, "WS connection error");
                                    err = Some(e.into());
                                    break
                                }
                            }
                            Some(WsOut::Close { code, reason }) => {
                                trace!(code, reason, "Closing WS session");
                                closing = true;
                                let frame = CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: reason.into(),
                                };
                                if self.server.send(WsMessage::Close(Some(frame))).await.is_err() {
                                    break
                                }
                            }
                            // dispatcher has gone away
                            None => break,
                        }
                    }
                    // break on shutdown recv, or on shutdown recv error
                    _ = &mut self.shutdown => {
                        break
                    }
                }
            }
            if let Some(err) = err {
                // best effort: tell the server why before tearing down
                let frame =
                    CloseFrame { code: CloseCode::Error, reason: "Exception".into() };
                let _ = self.server.send(WsMessage::Close(Some(frame))).await;
                let _ = self.error.send(err);
            }
        };

        tokio::spawn(fut);
    }
}
