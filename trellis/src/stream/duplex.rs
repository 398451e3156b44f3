//! Duplex (WebSocket) connections: upgrade, typed message dispatch, and the
//! single-writer queue discipline.
//!
//! Each connection runs two cooperating tasks once the socket is handed
//! over: a reader that decodes `{"type": ...}` text frames and dispatches
//! them to the handler registered for that type, and a writer that alone
//! drains the bounded outbound queue, emits pings, and performs the closing
//! handshake. Handler errors are reported to the peer in-band and never
//! close the connection by themselves.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::{OnUpgrade, Upgraded};
use log::{debug, info, trace, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::handler::{Handler, HandlerError, HandlerFuture};
use crate::observer::Annotations;
use crate::router::tree::segment::PathParams;
use crate::state::State;
use crate::stream::manager::ConnectionManager;
use crate::stream::ws;
use crate::stream::{ConnectionState, Metadata, RequestSnapshot, StateCell, StreamError};

/// A live duplex connection, shared between the framework's reader/writer
/// tasks, message handlers, and any broadcast producers.
pub struct DuplexConnection {
    client_id: String,
    params: PathParams,
    request: RequestSnapshot,
    metadata: Metadata,
    peer_addr: Option<SocketAddr>,
    state: StateCell,
    tx: mpsc::Sender<Message>,
    close: Notify,
    close_code: Mutex<Option<CloseCode>>,
}

impl DuplexConnection {
    pub(crate) fn new(
        params: PathParams,
        request: RequestSnapshot,
        peer_addr: Option<SocketAddr>,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let conn = Arc::new(DuplexConnection {
            client_id: Uuid::new_v4().as_hyphenated().to_string(),
            params,
            request,
            metadata: Metadata::default(),
            peer_addr,
            state: StateCell::new(),
            tx,
            close: Notify::new(),
            close_code: Mutex::new(None),
        });
        (conn, rx)
    }

    /// The stable identifier assigned to this client at upgrade time.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The path parameters captured when the stream route matched.
    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// The request that initiated the upgrade.
    pub fn request(&self) -> &RequestSnapshot {
        &self.request
    }

    /// The connection's metadata bag.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The remote peer address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The connection's current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Serializes `message` as a text frame and enqueues it.
    ///
    /// Messages enqueued by one task arrive at the peer in enqueue order. A
    /// full queue fails immediately with `SlowConsumer` and closes the
    /// connection with code `1013`.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), StreamError> {
        self.send_text(serde_json::to_string(message)?)
    }

    pub(crate) fn send_text(&self, text: String) -> Result<(), StreamError> {
        if self.state.get() >= ConnectionState::Closing {
            return Err(StreamError::Closed);
        }

        match self.tx.try_send(Message::Text(text)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "[ws:{}] write queue full; closing slow consumer",
                    self.client_id
                );
                self.begin_close(CloseCode::Again);
                Err(StreamError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StreamError::Closed),
        }
    }

    /// Begins a graceful close with code `1000`.
    pub fn close(&self) {
        self.begin_close(CloseCode::Normal);
    }

    #[cfg(test)]
    pub(crate) fn mark_open(&self) {
        self.state.advance(ConnectionState::Open);
    }

    /// Transitions to `Closing` (at most once), records the close code for
    /// the writer's closing handshake, and wakes the writer.
    pub(crate) fn begin_close(&self, code: CloseCode) {
        if self.state.advance(ConnectionState::Closing) {
            *self.close_code.lock().expect("close code lock poisoned") = Some(code);
            self.close.notify_one();
        }
    }

    fn enqueue_control(&self, frame: Message) {
        // Control frames are best-effort; a full queue is handled by the
        // next data send.
        let _ = self.tx.try_send(frame);
    }

    fn send_error_envelope(&self, err: &HandlerError) {
        let envelope = json!({ "type": "error", "error": err.envelope()["error"] });
        if let Ok(text) = serde_json::to_string(&envelope) {
            let _ = self.send_text(text);
        }
    }
}

/// A handler for one inbound message type, dispatched by the connection's
/// reader.
pub(crate) trait MessageHandler: Send + Sync {
    fn call(
        &self,
        conn: Arc<DuplexConnection>,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, HandlerError>> + Send>>;
}

pub(crate) type MessageRegistry = HashMap<String, Arc<dyn MessageHandler>>;

/// Monomorphized wrapper adapting a typed message function to the boxed
/// `MessageHandler` the registry stores.
struct TypedMessageHandler<F, Req, Res> {
    f: F,
    msg_type: String,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<F, Fut, Req, Res> MessageHandler for TypedMessageHandler<F, Req, Res>
where
    F: Fn(Arc<DuplexConnection>, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Res>, HandlerError>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    fn call(
        &self,
        conn: Arc<DuplexConnection>,
        payload: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Value>, HandlerError>> + Send>> {
        let msg_type = self.msg_type.clone();

        let req = match serde_json::from_value::<Req>(payload) {
            Ok(req) => req,
            Err(err) => {
                return Box::pin(futures_util::future::err(HandlerError::bad_request(
                    format!("invalid `{}` payload: {}", msg_type, err),
                )))
            }
        };

        let fut = (self.f)(conn, req);
        Box::pin(async move {
            match fut.await? {
                None => Ok(None),
                Some(res) => {
                    let mut value = serde_json::to_value(&res)
                        .map_err(|e| HandlerError::internal("internal server error").with_source(e.into()))?;
                    // Replies are discriminated like requests; fill in the
                    // registered type when the response doesn't carry one.
                    if let Value::Object(map) = &mut value {
                        map.entry("type".to_string())
                            .or_insert_with(|| Value::String(msg_type));
                    }
                    Ok(Some(value))
                }
            }
        })
    }
}

/// Configures a duplex route: which message types it accepts and how each is
/// handled.
#[derive(Default)]
pub struct DuplexRouteBuilder {
    messages: MessageRegistry,
    annotations: Annotations,
}

impl DuplexRouteBuilder {
    pub(crate) fn new() -> Self {
        DuplexRouteBuilder::default()
    }

    /// Registers the handler for inbound messages whose `type` field equals
    /// `msg_type`. Registering the same type again replaces the handler.
    ///
    /// A `None` result sends nothing; `Some(response)` is serialized and
    /// enqueued on the same connection. Errors are reported to the peer as
    /// an in-band `{"type": "error", ...}` envelope.
    pub fn message<Req, Res, F, Fut>(&mut self, msg_type: &str, f: F) -> &mut Self
    where
        F: Fn(Arc<DuplexConnection>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Res>, HandlerError>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
    {
        self.messages.insert(
            msg_type.to_string(),
            Arc::new(TypedMessageHandler {
                f,
                msg_type: msg_type.to_string(),
                _marker: PhantomData,
            }),
        );
        self
    }

    /// Attaches documentation surfaced to registration observers.
    pub fn annotate(&mut self, annotations: Annotations) -> &mut Self {
        self.annotations = annotations;
        self
    }

    pub(crate) fn into_parts(self) -> (MessageRegistry, Annotations) {
        (self.messages, self.annotations)
    }
}

/// The terminal handler registered for a duplex route: performs the
/// handshake, registers the connection, and spawns the socket driver.
pub(crate) struct DuplexUpgradeHandler {
    registry: Arc<MessageRegistry>,
    manager: Arc<ConnectionManager>,
    config: StreamConfig,
}

impl DuplexUpgradeHandler {
    pub(crate) fn new(
        registry: MessageRegistry,
        manager: Arc<ConnectionManager>,
        config: StreamConfig,
    ) -> Self {
        DuplexUpgradeHandler {
            registry: Arc::new(registry),
            manager,
            config,
        }
    }
}

impl Handler for DuplexUpgradeHandler {
    fn handle(&self, mut state: State) -> Pin<Box<HandlerFuture>> {
        let registry = self.registry.clone();
        let manager = self.manager.clone();
        let config = self.config;

        Box::pin(async move {
            if !ws::requested(state.headers()) {
                return Err((state, HandlerError::bad_request("websocket upgrade required")));
            }
            let response = match ws::accept(state.headers()) {
                Ok(response) => response,
                Err(()) => {
                    return Err((
                        state,
                        HandlerError::bad_request("missing Sec-WebSocket-Key header"),
                    ))
                }
            };

            let on_upgrade = match state.take_upgrade() {
                Some(on_upgrade) => on_upgrade,
                None => {
                    return Err((
                        state,
                        HandlerError::internal("connection does not support upgrades"),
                    ))
                }
            };

            let params = state.params().clone();
            let snapshot = RequestSnapshot::of(&state);
            let peer_addr = state.client_addr();

            let (conn, rx) =
                DuplexConnection::new(params, snapshot, peer_addr, config.write_queue_depth);
            manager.register_duplex(conn.clone());

            tokio::spawn(drive(on_upgrade, conn, rx, registry, manager, config));

            Ok((state, response))
        })
    }
}

/// Owns the socket for the life of the connection.
async fn drive(
    on_upgrade: OnUpgrade,
    conn: Arc<DuplexConnection>,
    rx: mpsc::Receiver<Message>,
    registry: Arc<MessageRegistry>,
    manager: Arc<ConnectionManager>,
    config: StreamConfig,
) {
    let id = conn.client_id().to_string();

    match on_upgrade.await {
        Ok(upgraded) => {
            let socket = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
            conn.state.advance(ConnectionState::Open);
            info!("[ws:{}] connection open", id);

            let (sink, stream) = socket.split();
            let writer = tokio::spawn(write_loop(sink, rx, conn.clone(), config));
            read_loop(stream, &conn, &registry, config).await;

            conn.begin_close(CloseCode::Normal);
            let _ = writer.await;
        }
        Err(err) => debug!("[ws:{}] upgrade failed: {}", id, err),
    }

    conn.state.set(ConnectionState::Closed);
    manager.unregister_duplex(&id);
    info!("[ws:{}] connection closed", id);
}

async fn read_loop(
    mut stream: SplitStream<WebSocketStream<Upgraded>>,
    conn: &Arc<DuplexConnection>,
    registry: &MessageRegistry,
    config: StreamConfig,
) {
    loop {
        if conn.state.get() >= ConnectionState::Closing {
            break;
        }

        // An attentive peer answers pings well inside the read deadline, so
        // read silence past it means the pong is overdue.
        let frame = match timeout(config.read_deadline, stream.next()).await {
            Err(_) => {
                debug!("[ws:{}] read deadline elapsed", conn.client_id());
                conn.begin_close(CloseCode::Error);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!("[ws:{}] read error: {}", conn.client_id(), err);
                conn.begin_close(CloseCode::Error);
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => dispatch_message(conn, registry, &text).await,
            Message::Binary(_) => {
                conn.send_error_envelope(&HandlerError::bad_request(
                    "binary frames are not supported",
                ));
            }
            Message::Ping(data) => conn.enqueue_control(Message::Pong(data)),
            Message::Pong(_) => trace!("[ws:{}] pong", conn.client_id()),
            Message::Close(_) => {
                conn.begin_close(CloseCode::Normal);
                break;
            }
            Message::Frame(_) => {}
        }
    }
}

/// Decodes one inbound text frame and routes it to the registered handler.
async fn dispatch_message(conn: &Arc<DuplexConnection>, registry: &MessageRegistry, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            conn.send_error_envelope(&HandlerError::bad_request("frame is not valid JSON"));
            return;
        }
    };

    let msg_type = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => {
            conn.send_error_envelope(&HandlerError::bad_request("message has no `type` field"));
            return;
        }
    };

    let handler = match registry.get(&msg_type) {
        Some(handler) => handler,
        None => {
            conn.send_error_envelope(&HandlerError::not_found(format!(
                "unknown message type `{}`",
                msg_type
            )));
            return;
        }
    };

    match handler.call(conn.clone(), value).await {
        Ok(Some(response)) => {
            if let Ok(text) = serde_json::to_string(&response) {
                let _ = conn.send_text(text);
            }
        }
        Ok(None) => {}
        Err(err) => conn.send_error_envelope(&err),
    }
}

/// The sole writer to the socket: drains the queue, emits pings, and
/// performs the closing handshake.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<Upgraded>, Message>,
    mut rx: mpsc::Receiver<Message>,
    conn: Arc<DuplexConnection>,
    config: StreamConfig,
) {
    let mut ping = interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(frame) => {
                    if write_frame(&mut sink, frame, config).await.is_err() {
                        conn.begin_close(CloseCode::Error);
                        break;
                    }
                }
                None => break,
            },
            _ = conn.close.notified() => break,
            _ = ping.tick() => {
                if write_frame(&mut sink, Message::Ping(Vec::new()), config).await.is_err() {
                    conn.begin_close(CloseCode::Error);
                    break;
                }
            }
        }
    }

    // Drain whatever was enqueued before the close, bounded by one write
    // deadline, then complete the closing handshake.
    let deadline = Instant::now() + config.write_deadline;
    while let Ok(frame) = rx.try_recv() {
        if Instant::now() >= deadline || write_frame(&mut sink, frame, config).await.is_err() {
            break;
        }
    }

    let code = conn
        .close_code
        .lock()
        .expect("close code lock poisoned")
        .take()
        .unwrap_or(CloseCode::Normal);
    let close = Message::Close(Some(CloseFrame {
        code,
        reason: "".into(),
    }));
    let _ = write_frame(&mut sink, close, config).await;
    let _ = sink.close().await;
}

async fn write_frame(
    sink: &mut SplitSink<WebSocketStream<Upgraded>, Message>,
    frame: Message,
    config: StreamConfig,
) -> Result<(), ()> {
    match timeout(config.write_deadline, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::HeaderMap;
    use serde::Deserialize;

    fn test_conn(queue_depth: usize) -> (Arc<DuplexConnection>, mpsc::Receiver<Message>) {
        let snapshot = RequestSnapshot {
            method: hyper::Method::GET,
            uri: "/ws".parse().unwrap(),
            headers: HeaderMap::new(),
        };
        let (conn, rx) = DuplexConnection::new(PathParams::new(), snapshot, None, queue_depth);
        conn.state.advance(ConnectionState::Open);
        (conn, rx)
    }

    #[derive(Deserialize)]
    struct EchoRequest {
        text: String,
    }

    #[derive(Serialize)]
    struct EchoResponse {
        text: String,
    }

    fn echo_registry() -> MessageRegistry {
        let mut builder = DuplexRouteBuilder::new();
        builder.message("echo", |_conn, req: EchoRequest| async move {
            Ok(Some(EchoResponse {
                text: req.text.to_uppercase(),
            }))
        });
        builder.into_parts().0
    }

    fn received_text(rx: &mut mpsc::Receiver<Message>) -> String {
        match rx.try_recv().expect("a frame was enqueued") {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn echo_message_round_trip() {
        let (conn, mut rx) = test_conn(8);
        let registry = echo_registry();

        dispatch_message(&conn, &registry, r#"{"type":"echo","text":"hi"}"#).await;

        let value: Value = serde_json::from_str(&received_text(&mut rx)).unwrap();
        assert_eq!(value["type"], "echo");
        assert_eq!(value["text"], "HI");
    }

    #[tokio::test]
    async fn unknown_message_type_reports_in_band() {
        let (conn, mut rx) = test_conn(8);
        let registry = echo_registry();

        dispatch_message(&conn, &registry, r#"{"type":"nope"}"#).await;

        let value: Value = serde_json::from_str(&received_text(&mut rx)).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], "not_found");
        // The error is in-band; the connection stays open.
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn handler_errors_do_not_close_the_connection() {
        let (conn, mut rx) = test_conn(8);
        let mut builder = DuplexRouteBuilder::new();
        builder.message("fail", |_conn, _req: Value| async move {
            Err::<Option<Value>, _>(HandlerError::conflict("already exists"))
        });
        let registry = builder.into_parts().0;

        dispatch_message(&conn, &registry, r#"{"type":"fail"}"#).await;

        let value: Value = serde_json::from_str(&received_text(&mut rx)).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], "conflict");
        assert_eq!(conn.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn sends_are_serialized_in_enqueue_order() {
        let (conn, mut rx) = test_conn(8);

        conn.send(&json!({"n": 1})).unwrap();
        conn.send(&json!({"n": 2})).unwrap();
        conn.send(&json!({"n": 3})).unwrap();

        for expected in 1..=3 {
            let value: Value = serde_json::from_str(&received_text(&mut rx)).unwrap();
            assert_eq!(value["n"], expected);
        }
    }

    #[tokio::test]
    async fn slow_consumer_is_closed_with_1013() {
        let (conn, _rx) = test_conn(2);

        conn.send(&json!({"n": 1})).unwrap();
        conn.send(&json!({"n": 2})).unwrap();

        let err = conn.send(&json!({"n": 3})).unwrap_err();
        assert!(matches!(err, StreamError::SlowConsumer));
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(
            *conn.close_code.lock().unwrap(),
            Some(CloseCode::Again),
            "1013 is `try again later`"
        );

        // Further sends are refused outright.
        assert!(matches!(
            conn.send(&json!({"n": 4})),
            Err(StreamError::Closed)
        ));
    }
}
