//! Bridges hyper's `Service` model onto the `Router`: builds the
//! request-scoped `State` for each request and guards the event loop against
//! escaped panics.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task;

use futures_util::FutureExt;
use hyper::service::Service;
use hyper::{Body, Request, Response, StatusCode};
use log::{error, trace};

use crate::handler::Handler;
use crate::router::Router;
use crate::state::State;

/// One instance per accepted connection, dispatching every request on it to
/// the shared `Router`.
pub(crate) struct ConnectedService {
    router: Router,
    client_addr: SocketAddr,
}

impl ConnectedService {
    pub(crate) fn new(router: Router, client_addr: SocketAddr) -> Self {
        ConnectedService {
            router,
            client_addr,
        }
    }
}

impl Service<Request<Body>> for ConnectedService {
    type Response = Response<Body>;
    type Error = std::convert::Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> task::Poll<Result<(), Self::Error>> {
        task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let router = self.router.clone();
        let client_addr = self.client_addr;

        Box::pin(async move {
            // Taken before the request is dismembered so duplex routes can
            // claim the socket after their 101 response.
            let on_upgrade = hyper::upgrade::on(&mut req);
            let (parts, body) = req.into_parts();

            let mut state = State::new(parts.method, parts.uri, parts.version, parts.headers);
            state.set_client_addr(client_addr);
            state.set_body(body);
            state.set_upgrade(on_upgrade);

            trace!("[{}] starting", state.request_id());

            let result = AssertUnwindSafe(router.handle(state)).catch_unwind().await;
            let response = match result {
                Ok(Ok((_state, response))) => response,
                Ok(Err((state, err))) => err.into_response(&state),
                Err(_) => {
                    // The recoverer middleware produces the enveloped 500;
                    // this is the last line of defence when it isn't
                    // installed.
                    error!("[PANIC] a panic escaped the handler chain");
                    Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::empty())
                        .expect("response built from valid parts")
                }
            };

            Ok(response)
        })
    }
}
