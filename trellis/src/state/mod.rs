//! The request-scoped context threaded through middleware and handlers.
//!
//! Every request carries the same facts, so `State` names them as fields
//! (method, URI, headers, captured path parameters, ...) instead of hiding
//! them in a general type map. Middleware and handlers attach whatever else
//! they need through the [`RequestData`] bag.

use std::any::{Any, TypeId};
use std::net::SocketAddr;

use hyper::upgrade::OnUpgrade;
use hyper::{Body, HeaderMap, Method, Uri, Version};
use uuid::Uuid;

use crate::helpers::http::request::path::RequestPathSegments;
use crate::helpers::http::X_REQUEST_ID;
use crate::router::tree::segment::PathParams;

#[cfg(feature = "derive")]
pub use trellis_derive::StateData;

/// A marker for types that middleware and handlers may attach to a request
/// through [`State::data_mut`]. A derive is available behind the `derive`
/// feature.
pub trait StateData: Send + 'static {}

/// The per-request context. Built once per request (by the server glue, or
/// directly in tests), consumed by the handler chain, and dropped when the
/// response is finalized.
#[derive(Debug)]
pub struct State {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    request_id: String,
    body: Option<Body>,
    on_upgrade: Option<OnUpgrade>,
    client_addr: Option<SocketAddr>,
    params: PathParams,
    segments: Option<RequestPathSegments>,
    allowed_methods: Option<Vec<Method>>,
    data: RequestData,
}

impl State {
    /// Assembles the state for one request.
    ///
    /// The request id is adopted from a non-empty `X-Request-ID` header when
    /// the client supplies one, and generated (UUID v4) otherwise; it is
    /// echoed on every response and prefixes the request's log lines.
    ///
    /// ```rust
    /// # use hyper::{HeaderMap, Method, Version};
    /// # use trellis::state::{State, StateData};
    /// struct Tenant(&'static str);
    /// impl StateData for Tenant {}
    ///
    /// # fn main() {
    /// let mut state = State::new(
    ///     Method::GET,
    ///     "/reports".parse().unwrap(),
    ///     Version::HTTP_11,
    ///     HeaderMap::new(),
    /// );
    /// state.data_mut().put(Tenant("acme"));
    /// assert_eq!(state.data().get::<Tenant>().unwrap().0, "acme");
    /// # }
    /// ```
    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap) -> State {
        let request_id = headers
            .get(X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().as_hyphenated().to_string());

        State {
            method,
            uri,
            version,
            headers,
            request_id,
            body: None,
            on_upgrade: None,
            client_addr: None,
            params: PathParams::new(),
            segments: None,
            allowed_methods: None,
            data: RequestData::default(),
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The full request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The HTTP version of the request.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The id correlating this request's log lines and response.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub(crate) fn set_request_id(&mut self, request_id: String) {
        self.request_id = request_id;
    }

    /// The remote peer address, when the transport reported one.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    pub(crate) fn set_client_addr(&mut self, addr: SocketAddr) {
        self.client_addr = Some(addr);
    }

    /// The path parameters captured while the route matched. Empty until the
    /// router dispatches to a handler.
    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    /// Claims the request body, leaving `None` for later callers. The binder
    /// consumes it when a request type declares body fields.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    /// Attaches the request body.
    pub fn set_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    /// Claims the connection's protocol-upgrade handle, available on
    /// requests served over a connection that supports upgrades.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.on_upgrade.take()
    }

    pub(crate) fn set_upgrade(&mut self, on_upgrade: OnUpgrade) {
        self.on_upgrade = Some(on_upgrade);
    }

    /// For method-not-allowed handlers: the methods under which the request
    /// path would have matched, sorted.
    pub fn allowed_methods(&self) -> Option<&[Method]> {
        self.allowed_methods.as_deref()
    }

    pub(crate) fn set_allowed_methods(&mut self, methods: Vec<Method>) {
        self.allowed_methods = Some(methods);
    }

    pub(crate) fn take_segments(&mut self) -> Option<RequestPathSegments> {
        self.segments.take()
    }

    pub(crate) fn set_segments(&mut self, segments: RequestPathSegments) {
        self.segments = Some(segments);
    }

    /// Data attached to this request by middleware and handlers.
    pub fn data(&self) -> &RequestData {
        &self.data
    }

    /// Mutable access to the request's attached data.
    pub fn data_mut(&mut self) -> &mut RequestData {
        &mut self.data
    }
}

/// A type-keyed bag of request-scoped values, holding at most one value per
/// type.
///
/// A request accumulates a handful of entries at most, so lookups walk a
/// vector rather than hashing.
#[derive(Default)]
pub struct RequestData {
    items: Vec<(TypeId, Box<dyn Any + Send>)>,
}

impl std::fmt::Debug for RequestData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestData")
            .field("len", &self.items.len())
            .finish()
    }
}

impl RequestData {
    /// Stores `value`, replacing any existing value of the same type.
    pub fn put<T: StateData>(&mut self, value: T) {
        match self.items.iter_mut().find(|(id, _)| *id == TypeId::of::<T>()) {
            Some((_, slot)) => *slot = Box::new(value),
            None => self.items.push((TypeId::of::<T>(), Box::new(value))),
        }
    }

    /// Borrows the stored value of type `T`, if present.
    pub fn get<T: StateData>(&self) -> Option<&T> {
        self.items
            .iter()
            .find(|(id, _)| *id == TypeId::of::<T>())
            .and_then(|(_, value)| value.downcast_ref())
    }

    /// Mutably borrows the stored value of type `T`, if present.
    pub fn get_mut<T: StateData>(&mut self) -> Option<&mut T> {
        self.items
            .iter_mut()
            .find(|(id, _)| *id == TypeId::of::<T>())
            .and_then(|(_, value)| value.downcast_mut())
    }

    /// Removes and returns the stored value of type `T`, if present.
    pub fn take<T: StateData>(&mut self) -> Option<T> {
        let at = self
            .items
            .iter()
            .position(|(id, _)| *id == TypeId::of::<T>())?;
        self.items
            .swap_remove(at)
            .1
            .downcast()
            .ok()
            .map(|boxed| *boxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn request(headers: HeaderMap) -> State {
        State::new(
            Method::GET,
            "/inventory".parse().unwrap(),
            Version::HTTP_11,
            headers,
        )
    }

    #[test]
    fn request_id_is_adopted_from_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("trace-7f2"));

        assert_eq!(request(headers).request_id(), "trace-7f2");
    }

    #[test]
    fn request_id_is_generated_when_absent_or_empty() {
        let generated = request(HeaderMap::new());
        assert!(!generated.request_id().is_empty());

        let mut headers = HeaderMap::new();
        headers.insert(X_REQUEST_ID, HeaderValue::from_static(""));
        let fallback = request(headers);
        assert!(!fallback.request_id().is_empty());
        assert_ne!(generated.request_id(), fallback.request_id());
    }

    #[test]
    fn body_and_upgrade_can_be_claimed_once() {
        let mut state = request(HeaderMap::new());
        state.set_body(Body::from("payload"));

        assert!(state.take_body().is_some());
        assert!(state.take_body().is_none());
        assert!(state.take_upgrade().is_none());
    }

    struct Quota {
        remaining: u32,
    }

    impl StateData for Quota {}

    struct Flag;

    impl StateData for Flag {}

    #[test]
    fn attached_data_is_keyed_by_type() {
        let mut state = request(HeaderMap::new());

        state.data_mut().put(Quota { remaining: 5 });
        state.data_mut().put(Flag);
        state.data_mut().put(Quota { remaining: 4 });

        assert_eq!(state.data().get::<Quota>().unwrap().remaining, 4);
        state.data_mut().get_mut::<Quota>().unwrap().remaining -= 1;
        assert_eq!(state.data_mut().take::<Quota>().unwrap().remaining, 3);
        assert!(state.data().get::<Quota>().is_none());
        assert!(state.data().get::<Flag>().is_some());
    }
}
