//! Defines `Middleware`, a reusable unit of logic wrapped around route
//! handlers.
//!
//! A middleware transforms a handler into a handler. Each router (and each
//! scope) owns an ordered stack; when a route is registered the stack is
//! folded around the terminal handler, innermost-last-added, and the wrapped
//! result is cached in the route tree. Adding middleware after a route is
//! registered does not retroactively affect it.

pub mod logger;
pub mod recoverer;

use std::pin::Pin;
use std::sync::Arc;

use crate::handler::{Handler, HandlerFuture};
use crate::state::State;

pub use self::logger::Logger;
pub use self::recoverer::Recoverer;

/// `Middleware` has the opportunity to provide additional behaviour to the
/// request / response interaction. For example:
///
/// * The request can be halted due to some unmet precondition;
/// * Middleware-specific data can be recorded in `State` for use elsewhere;
/// * The response can be manipulated after the rest of the chain completes.
///
/// Continuing the chain is a matter of invoking `next`:
///
/// ```rust
/// # use std::pin::Pin;
/// # use std::sync::Arc;
/// # use trellis::handler::{Handler, HandlerFuture};
/// # use trellis::middleware::Middleware;
/// # use trellis::state::State;
/// struct NoopMiddleware;
///
/// impl Middleware for NoopMiddleware {
///     fn call(&self, state: State, next: Arc<dyn Handler>) -> Pin<Box<HandlerFuture>> {
///         next.handle(state)
///     }
/// }
/// # fn main() {
/// #     let _ = NoopMiddleware;
/// # }
/// ```
pub trait Middleware: Send + Sync + 'static {
    /// Entry point to the middleware. To continue the request, `next` must
    /// be invoked with the `State`; to abort it, return a response future
    /// without invoking `next`.
    fn call(&self, state: State, next: Arc<dyn Handler>) -> Pin<Box<HandlerFuture>>;
}

impl<F> Middleware for F
where
    F: Fn(State, Arc<dyn Handler>) -> Pin<Box<HandlerFuture>> + Send + Sync + 'static,
{
    fn call(&self, state: State, next: Arc<dyn Handler>) -> Pin<Box<HandlerFuture>> {
        self(state, next)
    }
}

/// Folds `stack` around `terminal`, producing the effective handler for a
/// route. For a stack `[A, B, C]` the result is `A(B(C(terminal)))`: `A`
/// observes the request first and the response last.
pub(crate) fn apply(stack: &[Arc<dyn Middleware>], terminal: Arc<dyn Handler>) -> Arc<dyn Handler> {
    stack.iter().rev().fold(terminal, |next, middleware| {
        Arc::new(Wrapped {
            middleware: middleware.clone(),
            next,
        }) as Arc<dyn Handler>
    })
}

/// One layer of a materialized chain.
struct Wrapped {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn Handler>,
}

impl Handler for Wrapped {
    fn handle(&self, state: State) -> Pin<Box<HandlerFuture>> {
        self.middleware.call(state, self.next.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use futures_executor::block_on;
    use futures_util::FutureExt;
    use hyper::{Body, HeaderMap, Method, Response, Version};

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recording {
        label: &'static str,
        trace: Trace,
    }

    impl Middleware for Recording {
        fn call(&self, state: State, next: Arc<dyn Handler>) -> Pin<Box<HandlerFuture>> {
            self.trace
                .lock()
                .unwrap()
                .push(format!("{}:request", self.label));

            let label = self.label;
            let trace = self.trace.clone();
            next.handle(state)
                .map(move |result| {
                    trace.lock().unwrap().push(format!("{}:response", label));
                    result
                })
                .boxed()
        }
    }

    #[test]
    fn chains_wrap_in_registration_order() {
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));

        let stack: Vec<Arc<dyn Middleware>> = ["a", "b", "c"]
            .iter()
            .map(|label| {
                Arc::new(Recording {
                    label,
                    trace: trace.clone(),
                }) as Arc<dyn Middleware>
            })
            .collect();

        let trace_h = trace.clone();
        let terminal: Arc<dyn Handler> = Arc::new(move |state: State| {
            trace_h.lock().unwrap().push("handler".to_string());
            (state, Response::new(Body::empty()))
        });

        let wrapped = apply(&stack, terminal);
        let state = State::new(
            Method::GET,
            "/".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );
        block_on(wrapped.handle(state)).expect("handler succeeds");

        // A(B(C(H))): a sees the request first and the response last.
        let expected: Vec<String> = [
            "a:request",
            "b:request",
            "c:request",
            "handler",
            "c:response",
            "b:response",
            "a:response",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(*trace.lock().unwrap(), expected);
    }
}
