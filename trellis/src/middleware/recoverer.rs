//! Converts handler panics into `500` responses with the standard error
//! envelope.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use hyper::{Body, HeaderMap, Method, Response, Uri, Version};
use log::error;

use crate::handler::{Handler, HandlerError, HandlerFuture};
use crate::middleware::Middleware;
use crate::state::State;

/// Middleware that traps panics raised while constructing or polling the
/// inner handler's future and reports them as a `500` with the stable JSON
/// envelope. The panic payload is logged, never sent to the client.
///
/// The original `State` is lost when the inner handler panics, so the
/// recoverer snapshots the request facts it needs beforehand and rebuilds a
/// minimal `State` for the error response. Install it outermost so outer
/// middleware never observe the rebuilt state.
pub struct Recoverer;

/// The request facts needed to produce a coherent error response and log
/// line after the real `State` has been lost to a panic.
struct Snapshot {
    request_id: String,
    method: Method,
    uri: Uri,
    version: Version,
}

impl Snapshot {
    fn of(state: &State) -> Self {
        Snapshot {
            request_id: state.request_id().to_string(),
            method: state.method().clone(),
            uri: state.uri().clone(),
            version: state.version(),
        }
    }

    fn recover(self, panic: Box<dyn Any + Send>) -> (State, Response<Body>) {
        error!(
            "[{}] panic while handling {} {}: {}",
            self.request_id,
            self.method,
            self.uri,
            describe_panic(&panic)
        );

        let mut state = State::new(self.method, self.uri, self.version, HeaderMap::new());
        state.set_request_id(self.request_id);

        let response = HandlerError::internal("internal server error").into_response(&state);
        (state, response)
    }
}

impl Middleware for Recoverer {
    fn call(&self, state: State, next: Arc<dyn Handler>) -> Pin<Box<HandlerFuture>> {
        let snapshot = Snapshot::of(&state);
        let attempt = catch_unwind(AssertUnwindSafe(move || next.handle(state)));

        Box::pin(async move {
            let result = match attempt {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };

            match result {
                Ok(handled) => handled,
                Err(panic) => Ok(snapshot.recover(panic)),
            }
        })
    }
}

fn describe_panic(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_executor::block_on;
    use hyper::StatusCode;

    fn test_state() -> State {
        State::new(
            Method::GET,
            "/panics".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        )
    }

    fn panicking(_state: State) -> (State, Response<Body>) {
        panic!("boom");
    }

    #[test]
    fn recovers_a_panicking_handler() {
        let next: Arc<dyn Handler> = Arc::new(panicking);

        let result = block_on(Recoverer.call(test_state(), next));
        let (_state, response) = result.expect("recoverer produces a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn preserves_the_original_request_id() {
        let state = test_state();
        let request_id = state.request_id().to_string();
        let next: Arc<dyn Handler> = Arc::new(panicking);

        let (state, _response) = block_on(Recoverer.call(state, next)).unwrap();
        assert_eq!(state.request_id(), request_id);
    }

    #[test]
    fn passes_healthy_responses_through() {
        fn healthy(state: State) -> (State, Response<Body>) {
            (state, Response::new(Body::empty()))
        }
        let next: Arc<dyn Handler> = Arc::new(healthy);

        let result = block_on(Recoverer.call(test_state(), next));
        let (_state, response) = result.expect("healthy handler passes through");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
