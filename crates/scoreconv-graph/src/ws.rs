//! WebSocket transport speaking the `graphql-ws` sub-protocol.
//!
//! A single background task owns the socket. Callers talk to it through a
//! command channel, so [`WsTransport`] is cheap to share behind an `Arc`.
//!
//! Connection loss is handled inside the task: in-flight requests fail with
//! [`Error::Remote`], registered subscriptions are kept and re-sent after the
//! next successful handshake, and new requests fail immediately while no
//! connection is up. Reconnect attempts never stop until shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use scoreconv_core::{defaults, Error, Result};

use crate::protocol::{describe_error_payload, ClientMessage, ServerMessage};
use crate::reconnect::{Backoff, ReconnectConfig};
use crate::transport::{
    ConnectionEvent, GraphRequest, GraphResponse, GraphTransport, NotificationStream,
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Subscriber = futures::channel::mpsc::UnboundedSender<GraphResponse>;

/// Settings for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Endpoint URL (`ws://` or `wss://`).
    pub url: String,
    /// Time to wait for the response to one query or mutation.
    pub request_timeout: Duration,
    /// Time to wait for `connection_ack` after `connection_init`.
    pub ack_timeout: Duration,
    /// Optional `connection_init` payload.
    pub connection_params: Option<JsonValue>,
    pub reconnect: ReconnectConfig,
}

impl WsTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(defaults::GRAPH_REQUEST_TIMEOUT_SECS),
            ack_timeout: Duration::from_secs(defaults::CONNECTION_ACK_TIMEOUT_SECS),
            connection_params: None,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_connection_params(mut self, params: JsonValue) -> Self {
        self.connection_params = Some(params);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

enum Command {
    Execute {
        id: String,
        request: GraphRequest,
        reply: oneshot::Sender<Result<GraphResponse>>,
    },
    Subscribe {
        id: String,
        request: GraphRequest,
        sink: Subscriber,
    },
    Cancel {
        id: String,
    },
}

struct Registration {
    request: GraphRequest,
    sink: Subscriber,
}

/// Why a live session ended.
enum SessionExit {
    Shutdown,
    Lost(String),
}

/// Production [`GraphTransport`] over a persistent WebSocket.
pub struct WsTransport {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    next_id: AtomicU64,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl WsTransport {
    /// Spawn the connection task and return immediately.
    ///
    /// The first connection attempt happens in the background; observe
    /// [`GraphTransport::connection_events`] to learn when it is up.
    pub fn start(config: WsTransportConfig) -> Arc<Self> {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(defaults::CONNECTION_EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let transport = Arc::new(Self {
            commands,
            events: events.clone(),
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout,
            cancel: cancel.clone(),
        });

        tokio::spawn(connection_loop(config, commands_rx, events, cancel));
        transport
    }

    /// Close the socket and stop reconnecting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Remote("Graph transport has shut down".to_string()))
    }
}

#[async_trait]
impl GraphTransport for WsTransport {
    async fn execute(&self, request: GraphRequest) -> Result<GraphResponse> {
        let id = self.allocate_id();
        let operation = request.operation_name().to_string();
        let (reply, rx) = oneshot::channel();
        self.send(Command::Execute {
            id: id.clone(),
            request,
            reply,
        })?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Remote(format!(
                "{} aborted: graph transport stopped",
                operation
            ))),
            Err(_) => {
                let _ = self.send(Command::Cancel { id });
                Err(Error::Remote(format!(
                    "{} timed out after {}s",
                    operation,
                    self.request_timeout.as_secs()
                )))
            }
        }
    }

    async fn subscribe(&self, request: GraphRequest) -> Result<NotificationStream> {
        let (sink, stream) = futures::channel::mpsc::unbounded();
        self.send(Command::Subscribe {
            id: self.allocate_id(),
            request,
            sink,
        })?;
        Ok(stream)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open a socket, negotiate the sub-protocol and complete the handshake.
async fn open_connection(config: &WsTransportConfig) -> Result<Socket> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::Remote(format!("Invalid graph endpoint {}: {e}", config.url)))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(defaults::GRAPHQL_WS_PROTOCOL),
    );

    let (mut socket, _response) = connect_async(request)
        .await
        .map_err(|e| Error::Remote(format!("Failed to connect to {}: {e}", config.url)))?;

    let init = ClientMessage::ConnectionInit {
        payload: config.connection_params.clone(),
    };
    socket
        .send(Message::Text(init.to_json()?))
        .await
        .map_err(|e| Error::Remote(format!("Failed to send connection_init: {e}")))?;

    match tokio::time::timeout(config.ack_timeout, wait_for_ack(&mut socket)).await {
        Ok(result) => result.map(|_| socket),
        Err(_) => Err(Error::Remote(format!(
            "No connection_ack within {}s",
            config.ack_timeout.as_secs()
        ))),
    }
}

async fn wait_for_ack(socket: &mut Socket) -> Result<()> {
    while let Some(frame) = socket.next().await {
        match frame {
            Ok(Message::Text(text)) => match ServerMessage::parse(&text) {
                Ok(ServerMessage::ConnectionAck { .. }) => return Ok(()),
                Ok(ServerMessage::ConnectionError { payload }) => {
                    return Err(Error::Remote(format!(
                        "Connection rejected: {}",
                        describe_error_payload(&payload.unwrap_or_default())
                    )));
                }
                Ok(ServerMessage::KeepAlive {}) => {}
                Ok(other) => trace!(?other, "Ignoring frame before connection_ack"),
                Err(e) => warn!(error = %e, "Unparseable frame during handshake"),
            },
            Ok(Message::Close(frame)) => {
                return Err(Error::Remote(format!(
                    "Connection closed during handshake: {:?}",
                    frame
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Remote(format!("Handshake failed: {e}"))),
        }
    }
    Err(Error::Remote(
        "Connection ended during handshake".to_string(),
    ))
}

/// Own the socket for the lifetime of the transport.
async fn connection_loop(
    config: WsTransportConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    let mut subscriptions: HashMap<String, Registration> = HashMap::new();
    let mut backoff = Backoff::new(config.reconnect.clone());
    let mut ever_connected = false;

    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = open_connection(&config) => result,
        };

        match attempt {
            Ok(socket) => {
                if ever_connected {
                    info!(
                        subsystem = "graph",
                        component = "ws_transport",
                        attempts = backoff.attempts(),
                        "Reconnected to graph endpoint"
                    );
                    let _ = events.send(ConnectionEvent::Reconnected);
                } else {
                    info!(
                        subsystem = "graph",
                        component = "ws_transport",
                        url = %config.url,
                        "Connected to graph endpoint"
                    );
                    let _ = events.send(ConnectionEvent::Connected);
                }
                ever_connected = true;
                backoff.reset();

                let exit = run_session(socket, &mut subscriptions, &mut commands, &cancel).await;
                match exit {
                    SessionExit::Shutdown => return,
                    SessionExit::Lost(reason) => {
                        warn!(
                            subsystem = "graph",
                            component = "ws_transport",
                            reason = %reason,
                            "Graph connection lost"
                        );
                        let _ = events.send(ConnectionEvent::Disconnected { reason });
                    }
                }
            }
            Err(e) => {
                warn!(
                    subsystem = "graph",
                    component = "ws_transport",
                    error = %e,
                    "Graph connection attempt failed"
                );
                let _ = events.send(ConnectionEvent::Error {
                    message: e.job_message(),
                });
            }
        }

        let (attempt, delay) = backoff.next();
        info!(
            subsystem = "graph",
            component = "ws_transport",
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to graph endpoint"
        );
        let _ = events.send(ConnectionEvent::Reconnecting {
            attempt,
            delay_ms: delay.as_millis() as u64,
        });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(command) => handle_offline(command, &mut subscriptions),
                    None => return,
                },
            }
        }
    }
}

/// Commands arriving while no connection is up.
fn handle_offline(command: Command, subscriptions: &mut HashMap<String, Registration>) {
    match command {
        Command::Execute { request, reply, .. } => {
            let _ = reply.send(Err(Error::Remote(format!(
                "{} failed: not connected to graph endpoint",
                request.operation_name()
            ))));
        }
        Command::Subscribe { id, request, sink } => {
            debug!(id = %id, op = request.operation_name(), "Queued subscription until reconnect");
            subscriptions.insert(id, Registration { request, sink });
        }
        Command::Cancel { id } => {
            subscriptions.remove(&id);
        }
    }
}

async fn run_session(
    socket: Socket,
    subscriptions: &mut HashMap<String, Registration>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    cancel: &CancellationToken,
) -> SessionExit {
    let (mut writer, mut reader) = socket.split();
    let mut pending: HashMap<String, oneshot::Sender<Result<GraphResponse>>> = HashMap::new();

    let exit = 'session: {
        for (id, registration) in subscriptions.iter() {
            let start = ClientMessage::Start {
                id: id.clone(),
                payload: registration.request.clone(),
            };
            if let Err(reason) = send_frame(&mut writer, &start).await {
                break 'session SessionExit::Lost(reason);
            }
            debug!(id = %id, op = registration.request.operation_name(), "Subscription registered");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = send_frame(&mut writer, &ClientMessage::ConnectionTerminate {}).await;
                    let _ = writer.close().await;
                    break 'session SessionExit::Shutdown;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        let _ = send_frame(&mut writer, &ClientMessage::ConnectionTerminate {}).await;
                        let _ = writer.close().await;
                        break 'session SessionExit::Shutdown;
                    };
                    let frame = match command {
                        Command::Execute { id, request, reply } => {
                            trace!(id = %id, op = request.operation_name(), "Sending operation");
                            pending.insert(id.clone(), reply);
                            ClientMessage::Start { id, payload: request }
                        }
                        Command::Subscribe { id, request, sink } => {
                            let frame = ClientMessage::Start { id: id.clone(), payload: request.clone() };
                            subscriptions.insert(id, Registration { request, sink });
                            frame
                        }
                        Command::Cancel { id } => {
                            let known = pending.remove(&id).is_some() || subscriptions.remove(&id).is_some();
                            if !known {
                                continue;
                            }
                            ClientMessage::Stop { id }
                        }
                    };
                    if let Err(reason) = send_frame(&mut writer, &frame).await {
                        break 'session SessionExit::Lost(reason);
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let stop = match ServerMessage::parse(&text) {
                            Ok(message) => dispatch(message, &mut pending, subscriptions),
                            Err(e) => {
                                warn!(error = %e, raw_message = %text, "Failed to parse graph frame");
                                Dispatch::Continue
                            }
                        };
                        match stop {
                            Dispatch::Continue => {}
                            Dispatch::Stop(id) => {
                                if let Err(reason) = send_frame(&mut writer, &ClientMessage::Stop { id }).await {
                                    break 'session SessionExit::Lost(reason);
                                }
                            }
                            Dispatch::Close(reason) => break 'session SessionExit::Lost(reason),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break 'session SessionExit::Lost(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(Message::Binary(_))) => {
                        trace!("Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => break 'session SessionExit::Lost(e.to_string()),
                    None => break 'session SessionExit::Lost("stream ended".to_string()),
                },
            }
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(Error::Remote(
            "Graph connection closed before a response arrived".to_string(),
        )));
    }
    exit
}

enum Dispatch {
    Continue,
    /// Subscriber went away; tell the server to stop this operation.
    Stop(String),
    Close(String),
}

fn dispatch(
    message: ServerMessage,
    pending: &mut HashMap<String, oneshot::Sender<Result<GraphResponse>>>,
    subscriptions: &mut HashMap<String, Registration>,
) -> Dispatch {
    match message {
        ServerMessage::Data { id, payload } => {
            if let Some(reply) = pending.remove(&id) {
                let _ = reply.send(Ok(payload));
            } else if let Some(registration) = subscriptions.get(&id) {
                if registration.sink.unbounded_send(payload).is_err() {
                    subscriptions.remove(&id);
                    return Dispatch::Stop(id);
                }
            } else {
                trace!(id = %id, "Data for unknown operation");
            }
        }
        ServerMessage::Error { id, payload } => {
            let message = describe_error_payload(&payload);
            if let Some(reply) = pending.remove(&id) {
                let _ = reply.send(Err(Error::Remote(message)));
            } else if let Some(registration) = subscriptions.remove(&id) {
                // An error frame ends the operation; no `complete` follows.
                // Dropping the sink ends the stream so the consumer can
                // subscribe again.
                warn!(id = %id, error = %message, "Subscription ended with error");
                let _ = registration
                    .sink
                    .unbounded_send(GraphResponse::from_error(message));
            }
        }
        ServerMessage::Complete { id } => {
            if let Some(reply) = pending.remove(&id) {
                let _ = reply.send(Err(Error::Remote(
                    "Operation completed without a result".to_string(),
                )));
            } else if subscriptions.remove(&id).is_some() {
                info!(id = %id, "Subscription completed by server");
            }
        }
        ServerMessage::ConnectionError { payload } => {
            return Dispatch::Close(describe_error_payload(&payload.unwrap_or_default()));
        }
        ServerMessage::KeepAlive {} => trace!("Keep-alive"),
        ServerMessage::ConnectionAck { .. } => {}
    }
    Dispatch::Continue
}

async fn send_frame<S>(writer: &mut S, message: &ClientMessage) -> std::result::Result<(), String>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = message.to_json().map_err(|e| e.to_string())?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|e| e.to_string())
}
