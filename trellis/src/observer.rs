//! Registration observers, the hook through which documentation generators
//! and similar tooling learn about the application's surface.
//!
//! Observers are invoked synchronously while routes are being registered,
//! never during dispatch, and must not block.

use std::sync::Arc;

use hyper::Method;

use crate::binder::Descriptor;

/// The flavour of a registered route.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RouteKind {
    /// A plain request/response route.
    Http,
    /// A bidirectional message stream (WebSocket).
    Duplex,
    /// A server-push event stream (SSE).
    Push,
}

/// Free-form documentation attached to a route at registration time.
#[derive(Clone, Debug, Default)]
pub struct Annotations {
    /// A one-line summary.
    pub summary: Option<String>,
    /// A longer description.
    pub description: Option<String>,
    /// Grouping tags.
    pub tags: Vec<String>,
}

/// Everything an observer learns about one registered route.
#[derive(Clone)]
pub struct RouteRegistration {
    /// The full path, including any scope prefixes.
    pub path: String,
    /// The methods the route answers to.
    pub methods: Vec<Method>,
    /// Whether the route is plain HTTP, duplex or push.
    pub kind: RouteKind,
    /// The request type's compiled descriptor, for opinionated routes.
    pub request_descriptor: Option<Arc<Descriptor>>,
    /// The response type's name, for opinionated routes.
    pub response_type: Option<&'static str>,
    /// Documentation attached at registration.
    pub annotations: Annotations,
}

/// Receives one callback per route registration.
pub trait RouteObserver: Send + Sync {
    /// Called while the route is being registered. Must not block: dispatch
    /// never waits on observers, but registration does.
    fn route_registered(&self, registration: &RouteRegistration);
}
