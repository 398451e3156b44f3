//! Defines types for handlers, the primary building block of an application.
//!
//! A function taking `State` and returning `(State, Response<Body>)` can be
//! used directly as a handler; asynchronous functions are adapted through the
//! route builder. Middleware chains and the `Router` itself are handlers too,
//! which is what allows routers to be mounted inside other routers.

use std::future::Future;
use std::pin::Pin;

use futures_util::future;
use hyper::{Body, Response, StatusCode};
use mime::Mime;

use crate::state::State;

mod error;
pub mod typed;

pub use self::error::{ErrorKind, FieldError, HandlerError};
pub use self::typed::typed;

/// The result of a handler: the response to send, or the error to finalize
/// into one. `State` travels with both variants.
pub type HandlerResult = std::result::Result<(State, Response<Body>), (State, HandlerError)>;

/// A type alias for the futures returned by handlers.
pub type HandlerFuture = dyn Future<Output = HandlerResult> + Send;

/// A `Handler` receives some subset of requests to the application and
/// returns a future which resolves to a response.
///
/// Handlers are shared: the `Router` caches each route's fully-wrapped
/// handler at registration time and invokes it concurrently from many
/// requests, which is why `handle` borrows rather than consumes.
pub trait Handler: Send + Sync {
    /// Handles the request, returning a boxed future which resolves to a
    /// response.
    fn handle(&self, state: State) -> Pin<Box<HandlerFuture>>;
}

impl<F, R> Handler for F
where
    F: Fn(State) -> R + Send + Sync,
    R: IntoHandlerFuture,
{
    fn handle(&self, state: State) -> Pin<Box<HandlerFuture>> {
        self(state).into_handler_future()
    }
}

/// Adapts an `async fn(State) -> HandlerResult` into a `Handler`.
///
/// Used by the route builder's `to_async` registration. The returned future
/// must own its captures, so the handler itself stays shareable.
pub struct AsyncHandlerFn<F> {
    f: F,
}

impl<F, Fut> AsyncHandlerFn<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Wraps the provided function.
    pub fn new(f: F) -> Self {
        AsyncHandlerFn { f }
    }
}

impl<F, Fut> Handler for AsyncHandlerFn<F>
where
    F: Fn(State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, state: State) -> Pin<Box<HandlerFuture>> {
        Box::pin((self.f)(state))
    }
}

/// Represents a type which can be converted into the future type returned by
/// a `Handler`.
///
/// This is used to allow functions with different return types to satisfy the
/// `Handler` trait bound via the generic function implementation.
pub trait IntoHandlerFuture {
    /// Converts this value into a boxed future resolving to a state and
    /// response.
    fn into_handler_future(self) -> Pin<Box<HandlerFuture>>;
}

impl<T> IntoHandlerFuture for (State, T)
where
    T: IntoResponse,
{
    fn into_handler_future(self) -> Pin<Box<HandlerFuture>> {
        let (state, t) = self;
        let response = t.into_response(&state);
        Box::pin(future::ok((state, response)))
    }
}

impl IntoHandlerFuture for Pin<Box<HandlerFuture>> {
    fn into_handler_future(self) -> Pin<Box<HandlerFuture>> {
        self
    }
}

/// Represents a type which can be converted to a response, used to convert
/// the return type of a function into a response.
pub trait IntoResponse {
    /// Converts this value into a `hyper::Response`.
    fn into_response(self, state: &State) -> Response<Body>;
}

impl IntoResponse for Response<Body> {
    fn into_response(self, _state: &State) -> Response<Body> {
        self
    }
}

impl<B> IntoResponse for (StatusCode, Mime, B)
where
    B: Into<Body>,
{
    fn into_response(self, state: &State) -> Response<Body> {
        let (status, mime, body) = self;
        crate::helpers::http::response::create_response(state, status, mime, body)
    }
}
