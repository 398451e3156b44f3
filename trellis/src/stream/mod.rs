//! Long-lived streaming connections: duplex (WebSocket) message streams and
//! push (Server-Sent Events) streams, plus the registry that tracks them.

pub mod duplex;
pub mod manager;
pub mod push;
pub(crate) mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::RwLock;

use hyper::{HeaderMap, Method, Uri};
use serde_json::Value;
use thiserror::Error;

use crate::state::State;

pub use self::duplex::{DuplexConnection, DuplexRouteBuilder};
pub use self::manager::ConnectionManager;
pub use self::push::{PushConnection, SseEvent};

/// The two streaming variants a connection can be.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StreamKind {
    /// A bidirectional message stream.
    Duplex,
    /// A server-to-client event stream.
    Push,
}

/// The lifecycle of a streaming connection.
///
/// `Closing` disables new enqueues while the writer drains; `Closed` removes
/// the connection from the manager.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ConnectionState {
    /// The 101/200 response has been sent but the socket is not yet driven.
    Upgrading,
    /// Fully established; sends are accepted.
    Open,
    /// Draining; new enqueues are rejected.
    Closing,
    /// Fully torn down and unregistered.
    Closed,
}

/// Lock-free holder for a `ConnectionState`.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU8::new(ConnectionState::Upgrading as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Upgrading,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Advances to `state` only if the current state precedes it; returns
    /// whether the transition happened.
    pub(crate) fn advance(&self, state: ConnectionState) -> bool {
        let target = state as u8;
        let mut current = self.0.load(Ordering::Acquire);
        while current < target {
            match self.0.compare_exchange_weak(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
        false
    }
}

/// Errors surfaced to callers enqueueing onto a streaming connection.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The bounded write queue was full. The connection is closed (code
    /// `1013` for duplex streams) and the message was not enqueued.
    #[error("write queue full; slow consumer")]
    SlowConsumer,

    /// The connection is closing or closed.
    #[error("connection is closed")]
    Closed,

    /// The outbound message failed to serialize.
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// An immutable snapshot of the request that initiated a streaming upgrade,
/// retained for the life of the connection.
#[derive(Clone, Debug)]
pub struct RequestSnapshot {
    /// The request method.
    pub method: Method,
    /// The full request URI.
    pub uri: Uri,
    /// The request headers.
    pub headers: HeaderMap,
}

impl RequestSnapshot {
    pub(crate) fn of(state: &State) -> Self {
        RequestSnapshot {
            method: state.method().clone(),
            uri: state.uri().clone(),
            headers: state.headers().clone(),
        }
    }
}

/// A thread-safe metadata bag carried by each streaming connection,
/// independent of any request-scoped state.
#[derive(Default)]
pub struct Metadata {
    inner: RwLock<HashMap<String, Value>>,
}

impl Metadata {
    /// Stores `value` under `key`, replacing any existing value.
    pub fn insert<K: Into<String>>(&self, key: K, value: Value) {
        self.inner
            .write()
            .expect("metadata lock poisoned")
            .insert(key.into(), value);
    }

    /// The value stored under `key`, cloned out of the bag.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .expect("metadata lock poisoned")
            .get(key)
            .cloned()
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner
            .write()
            .expect("metadata lock poisoned")
            .remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_only_advances() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Upgrading);

        assert!(cell.advance(ConnectionState::Open));
        assert!(cell.advance(ConnectionState::Closing));
        // A second transition to the same or an earlier state is refused.
        assert!(!cell.advance(ConnectionState::Closing));
        assert!(!cell.advance(ConnectionState::Open));
        assert!(cell.advance(ConnectionState::Closed));
        assert_eq!(cell.get(), ConnectionState::Closed);
    }
}
