//! Errors surfaced while building a `Router` or starting a server.
//!
//! Request-time failures are a different animal and live in
//! [`handler::HandlerError`](crate::handler::HandlerError).

use std::io;

use thiserror::Error;

/// Errors returned while registering routes with the builder API.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A terminal handler was already registered for the same method and
    /// path, or a parameter/wildcard declaration contradicts an existing one
    /// at the same tree position.
    #[error("route conflict: {0}")]
    RouteConflict(String),

    /// The route path is not well formed (missing leading `/`, a wildcard in
    /// a non-trailing position, an empty capture name, ...).
    #[error("invalid route path `{path}`: {reason}")]
    InvalidPath {
        /// The path as supplied at registration.
        path: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl RouterError {
    pub(crate) fn invalid_path(path: &str, reason: &str) -> Self {
        RouterError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors returned by [`start`](crate::start) and friends.
#[derive(Debug, Error)]
pub enum StartError {
    /// The listener address did not resolve to a usable socket address.
    #[error("unable to resolve listener address")]
    AddrResolve,

    /// Binding the TCP listener failed.
    #[error("unable to open TCP listener: {0}")]
    Bind(#[source] io::Error),

    /// Accepting an incoming connection failed fatally.
    #[error("unable to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Constructing the tokio runtime failed.
    #[error("unable to construct runtime: {0}")]
    Runtime(#[source] io::Error),
}
