//! Push (Server-Sent Events) connections: a single writer serializing
//! `event:`/`data:` lines onto a streaming response body.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::{interval_at, Instant};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::handler::{Handler, HandlerFuture};
use crate::helpers::http::X_REQUEST_ID;
use crate::router::tree::segment::PathParams;
use crate::state::State;
use crate::stream::manager::ConnectionManager;
use crate::stream::{ConnectionState, Metadata, RequestSnapshot, StateCell, StreamError};

const TEXT_EVENT_STREAM: &str = "text/event-stream";

/// One event on a push stream: an `event:` name and a `data:` payload.
#[derive(Clone, Debug, PartialEq)]
pub struct SseEvent {
    event: String,
    data: String,
}

impl SseEvent {
    /// Creates an event, serializing `data` as its JSON payload.
    pub fn new<T: Serialize>(event: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(SseEvent {
            event: event.to_string(),
            data: serde_json::to_string(data)?,
        })
    }

    /// The wire form: `event:` and `data:` lines with a blank-line
    /// terminator.
    pub(crate) fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// A live push connection.
pub struct PushConnection {
    client_id: String,
    params: PathParams,
    request: RequestSnapshot,
    metadata: Metadata,
    peer_addr: Option<SocketAddr>,
    state: StateCell,
    tx: mpsc::Sender<SseEvent>,
    close: Notify,
}

impl PushConnection {
    pub(crate) fn new(
        params: PathParams,
        request: RequestSnapshot,
        peer_addr: Option<SocketAddr>,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SseEvent>) {
        let (tx, rx) = mpsc::channel(queue_depth);
        let conn = Arc::new(PushConnection {
            client_id: Uuid::new_v4().as_hyphenated().to_string(),
            params,
            request,
            metadata: Metadata::default(),
            peer_addr,
            state: StateCell::new(),
            tx,
            close: Notify::new(),
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

    /// The request that initiated the stream.
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

    /// Enqueues `event` for delivery. A full queue fails immediately with
    /// `SlowConsumer` and closes the connection.
    pub fn send(&self, event: SseEvent) -> Result<(), StreamError> {
        if self.state.get() >= ConnectionState::Closing {
            return Err(StreamError::Closed);
        }

        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "[sse:{}] write queue full; closing slow consumer",
                    self.client_id
                );
                self.begin_close();
                Err(StreamError::SlowConsumer)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StreamError::Closed),
        }
    }

    /// Begins a graceful close; the writer drains and ends the response.
    pub fn close(&self) {
        self.begin_close();
    }

    pub(crate) fn begin_close(&self) {
        if self.state.advance(ConnectionState::Closing) {
            self.close.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_open(&self) {
        self.state.advance(ConnectionState::Open);
    }
}

/// The terminal handler registered for a push route: opens the streaming
/// response, registers the connection, and spawns the writer alongside the
/// application's producer callback.
pub(crate) struct PushStreamHandler<F> {
    manager: Arc<ConnectionManager>,
    config: StreamConfig,
    on_open: Arc<F>,
}

impl<F, Fut> PushStreamHandler<F>
where
    F: Fn(Arc<PushConnection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub(crate) fn new(manager: Arc<ConnectionManager>, config: StreamConfig, on_open: F) -> Self {
        PushStreamHandler {
            manager,
            config,
            on_open: Arc::new(on_open),
        }
    }
}

impl<F, Fut> Handler for PushStreamHandler<F>
where
    F: Fn(Arc<PushConnection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, state: State) -> Pin<Box<HandlerFuture>> {
        let manager = self.manager.clone();
        let config = self.config;
        let on_open = self.on_open.clone();

        Box::pin(async move {
            let params = state.params().clone();
            let snapshot = RequestSnapshot::of(&state);
            let peer_addr = state.client_addr();

            let (conn, rx) =
                PushConnection::new(params, snapshot, peer_addr, config.write_queue_depth);
            manager.register_push(conn.clone());

            let (sender, body) = Body::channel();
            tokio::spawn(write_loop(sender, rx, conn.clone(), manager, config));
            tokio::spawn(on_open.as_ref()(conn.clone()));

            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, TEXT_EVENT_STREAM)
                .header(CACHE_CONTROL, "no-cache")
                .body(body)
                .expect("response built from valid parts");
            if let Ok(value) = HeaderValue::from_str(state.request_id()) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }

            Ok((state, response))
        })
    }
}

/// The sole writer for a push connection: drains the queue, emits heartbeat
/// comments, and tears the connection down when the client goes away.
async fn write_loop(
    mut sender: hyper::body::Sender,
    mut rx: mpsc::Receiver<SseEvent>,
    conn: Arc<PushConnection>,
    manager: Arc<ConnectionManager>,
    config: StreamConfig,
) {
    conn.state.advance(ConnectionState::Open);
    info!("[sse:{}] stream open", conn.client_id());

    let mut ping = interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(event) => {
                    if sender.send_data(Bytes::from(event.to_frame())).await.is_err() {
                        debug!("[sse:{}] client disconnected", conn.client_id());
                        break;
                    }
                }
                None => break,
            },
            _ = conn.close.notified() => {
                // Drain anything enqueued before the close was requested.
                while let Ok(event) = rx.try_recv() {
                    if sender.send_data(Bytes::from(event.to_frame())).await.is_err() {
                        break;
                    }
                }
                break;
            }
            _ = ping.tick() => {
                if sender.send_data(Bytes::from_static(b": ping\n\n")).await.is_err() {
                    debug!("[sse:{}] client disconnected", conn.client_id());
                    break;
                }
            }
        }
    }

    conn.state.set(ConnectionState::Closed);
    manager.unregister_push(conn.client_id());
    info!("[sse:{}] stream closed", conn.client_id());
}
