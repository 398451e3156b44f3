//! Defines the `Router`, responsible for dispatching requests to registered
//! handlers and responding with appropriate error codes when no handler can
//! be determined.

pub mod builder;
pub mod tree;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future;
use hyper::Method;
use log::trace;

use crate::config::RouterConfig;
use crate::handler::{Handler, HandlerError, HandlerFuture};
use crate::helpers::http::request::path::RequestPathSegments;
use crate::helpers::http::response::create_permanent_redirect;
use crate::router::tree::node::Delegation;
use crate::router::tree::segment::PathParams;
use crate::router::tree::Tree;
use crate::state::State;
use crate::stream::manager::ConnectionManager;

pub(crate) struct RouterData {
    pub(crate) trees: HashMap<Method, Tree>,
    pub(crate) config: RouterConfig,
    pub(crate) not_found: Arc<dyn Handler>,
    pub(crate) method_not_allowed: Arc<dyn Handler>,
    pub(crate) streams: Arc<ConnectionManager>,
}

/// Responsible for dispatching requests to registered routes and responding
/// with appropriate error codes when a route cannot be determined.
///
/// Constructed through the [`builder`](crate::router::builder) API. `Router`
/// implements [`Handler`], so one router can be mounted inside another to
/// form modular applications.
#[derive(Clone)]
pub struct Router {
    data: Arc<RouterData>,
}

impl Router {
    pub(crate) fn new(data: RouterData) -> Router {
        Router {
            data: Arc::new(data),
        }
    }

    /// The manager tracking this router's streaming connections, used for
    /// broadcasts and graceful shutdown.
    pub fn streams(&self) -> Arc<ConnectionManager> {
        self.data.streams.clone()
    }

    fn handle_miss(&self, mut state: State, rps: &RequestPathSegments) -> Pin<Box<HandlerFuture>> {
        if self.data.config.trailing_slash_redirect {
            if let Some(location) = self.trailing_slash_redirect(&state, rps) {
                trace!("[{}] redirecting to canonical slash form", state.request_id());
                let res = create_permanent_redirect(&state, location);
                return Box::pin(future::ok((state, res)));
            }
        }

        if self.data.config.fixed_path_redirect {
            let canonical = self
                .data
                .trees
                .get(state.method())
                .and_then(|tree| tree.canonical_case(state.uri().path()))
                .map(|canonical| append_query(canonical, state.uri().query()));
            if let Some(location) = canonical {
                trace!("[{}] redirecting to canonical case", state.request_id());
                let res = create_permanent_redirect(&state, location);
                return Box::pin(future::ok((state, res)));
            }
        }

        let mut allow: Vec<Method> = self
            .data
            .trees
            .iter()
            .filter(|(m, _)| *m != state.method())
            .filter(|(_, tree)| tree.matches(rps.segments()))
            .map(|(m, _)| m.clone())
            .collect();

        if !allow.is_empty() {
            allow.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
            trace!(
                "[{}] path matched other methods: {:?}",
                state.request_id(),
                allow
            );
            state.set_allowed_methods(allow);
            return self.data.method_not_allowed.handle(state);
        }

        trace!("[{}] did not find routable node", state.request_id());
        self.data.not_found.handle(state)
    }

    /// The `Location` for a trailing-slash correction, when the opposite
    /// slash form of the request path has a terminal.
    fn trailing_slash_redirect(
        &self,
        state: &State,
        rps: &RequestPathSegments,
    ) -> Option<String> {
        let tree = self.data.trees.get(state.method())?;
        let segments = rps.segments();
        let path = state.uri().path();

        if path.len() > 1 && path.ends_with('/') {
            let trimmed = &segments[..segments.len().saturating_sub(1)];
            if tree.matches(trimmed) {
                let canonical = path.trim_end_matches('/');
                let canonical = if canonical.is_empty() { "/" } else { canonical };
                return Some(append_query(canonical, state.uri().query()));
            }
        } else {
            let mut probe = segments.to_vec();
            probe.push(String::new());
            if tree.matches(&probe) {
                return Some(append_query(&format!("{}/", path), state.uri().query()));
            }
        }

        None
    }

    fn finalize(future: Pin<Box<HandlerFuture>>) -> Pin<Box<HandlerFuture>> {
        Box::pin(async move {
            match future.await {
                Ok((state, res)) => {
                    trace!("[{}] handler complete", state.request_id());
                    Ok((state, res))
                }
                Err((state, err)) => {
                    trace!(
                        "[{}] converting error into response during finalization",
                        state.request_id()
                    );
                    let res = err.into_response(&state);
                    Ok((state, res))
                }
            }
        })
    }
}

impl Handler for Router {
    /// Handles the request by selecting the tree for its method, walking it,
    /// storing captured path parameters in `State`, and dispatching to the
    /// matched handler. Misses are resolved through the redirect policies,
    /// then 405 computation, then the not-found handler.
    fn handle(&self, mut state: State) -> Pin<Box<HandlerFuture>> {
        trace!("[{}] starting dispatch", state.request_id());

        let rps = state
            .take_segments()
            .unwrap_or_else(|| RequestPathSegments::new(state.uri().path()));

        let mut params = PathParams::new();
        let found = self.data.trees.get(state.method()).and_then(|tree| {
            tree.find(rps.segments(), &mut params).map(|(node, consumed)| {
                let handler = node
                    .handler()
                    .cloned()
                    .expect("matched nodes are always routable");
                (handler, node.delegation(), consumed)
            })
        });

        let future = match found {
            Some((handler, Delegation::Internal, _)) => {
                trace!(
                    "[{}] dispatching to route ({} params)",
                    state.request_id(),
                    params.len()
                );
                state.set_params(params);
                handler.handle(state)
            }
            Some((handler, Delegation::External, consumed)) => {
                // Mounted handlers are opaque: stripped path, no captures,
                // no parent middleware.
                trace!("[{}] delegating to mounted handler", state.request_id());
                state.set_segments(rps.into_subsegments(consumed));
                handler.handle(state)
            }
            None => self.handle_miss(state, &rps),
        };

        Router::finalize(future)
    }
}

pub(crate) fn default_not_found(state: State) -> Pin<Box<HandlerFuture>> {
    let res = HandlerError::not_found("resource not found").into_response(&state);
    Box::pin(future::ok((state, res)))
}

pub(crate) fn default_method_not_allowed(state: State) -> Pin<Box<HandlerFuture>> {
    let allow = state.allowed_methods().map(<[Method]>::to_vec).unwrap_or_default();
    let res = HandlerError::method_not_allowed(allow).into_response(&state);
    Box::pin(future::ok((state, res)))
}

fn append_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_executor::block_on;
    use hyper::header::{ALLOW, LOCATION};
    use hyper::{Body, HeaderMap, Response, StatusCode, Uri, Version};

    use crate::router::builder::{build_router, build_simple_router, DrawRoutes};

    fn send(router: &Router, method: Method, uri: &str) -> (State, Response<Body>) {
        let state = State::new(
            method,
            uri.parse::<Uri>().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );

        block_on(router.handle(state)).expect("router finalizes every response")
    }

    fn body_of(response: Response<Body>) -> String {
        let bytes = block_on(hyper::body::to_bytes(response.into_body())).unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn echo_params(state: State) -> (State, Response<Body>) {
        let text = state
            .params()
            .iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>()
            .join(";");
        let res = crate::helpers::http::response::create_response(
            &state,
            StatusCode::OK,
            mime::TEXT_PLAIN,
            text,
        );
        (state, res)
    }

    fn marked(marker: &'static str) -> impl Fn(State) -> (State, Response<Body>) + Copy {
        move |state| {
            let res = crate::helpers::http::response::create_response(
                &state,
                StatusCode::OK,
                mime::TEXT_PLAIN,
                marker,
            );
            (state, res)
        }
    }

    #[test]
    fn captures_substituted_parameter_values() {
        let router = build_simple_router(|route| {
            route.get("/users/:id/posts/:post_id").to(echo_params);
        })
        .unwrap();

        let (_state, response) = send(&router, Method::GET, "/users/42/posts/hello");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response), "42;hello");
    }

    #[test]
    fn resolution_priority_is_static_param_wildcard() {
        let router = build_simple_router(|route| {
            route.get("/users/admin").to(marked("static"));
            route.get("/users/:id").to(marked("param"));
            route.get("/users/*").to(marked("wildcard"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/users/admin");
        assert_eq!(body_of(response), "static");

        let (_s, response) = send(&router, Method::GET, "/users/42");
        assert_eq!(body_of(response), "param");

        let (_s, response) = send(&router, Method::GET, "/users/42/extra");
        assert_eq!(body_of(response), "wildcard");
    }

    #[test]
    fn wildcard_captures_the_remaining_path() {
        let router = build_simple_router(|route| {
            route.get("/files/*path").to(echo_params);
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/files/a/b/c.txt");
        assert_eq!(body_of(response), "a/b/c.txt");
    }

    #[test]
    fn trailing_slash_miss_redirects_to_canonical_form() {
        let router = build_simple_router(|route| {
            route.get("/a/b").to(marked("ok"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/a/b/");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/a/b");

        // The canonical form dispatches directly; the transformation is
        // idempotent.
        let (_s, response) = send(&router, Method::GET, "/a/b");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn missing_trailing_slash_redirects_when_registered() {
        let router = build_simple_router(|route| {
            route.get("/dir/").to(marked("ok"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/dir");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/dir/");
    }

    #[test]
    fn trailing_slash_redirect_can_be_disabled() {
        let mut config = RouterConfig::default();
        config.trailing_slash_redirect = false;

        let router = build_router(config, |route| {
            route.get("/a/b").to(marked("ok"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/a/b/");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn case_insensitive_redirect_finds_canonical_case() {
        let mut config = RouterConfig::default();
        config.fixed_path_redirect = true;

        let router = build_router(config, |route| {
            route.get("/Widgets/Recent").to(marked("ok"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/widgets/RECENT");
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/Widgets/Recent");
    }

    #[test]
    fn ambiguous_case_insensitive_matches_fall_through_to_404() {
        let mut config = RouterConfig::default();
        config.fixed_path_redirect = true;

        let router = build_router(config, |route| {
            route.get("/events").to(marked("lower"));
            route.get("/Events").to(marked("upper"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/EVENTS");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn method_mismatch_responds_405_with_allow() {
        let router = build_simple_router(|route| {
            route.post("/submit").to(marked("post"));
            route.put("/submit").to(marked("put"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/submit");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "POST, PUT");
    }

    #[test]
    fn unknown_paths_get_the_json_not_found_envelope() {
        let router = build_simple_router(|_route| {}).unwrap();

        let (_s, response) = send(&router, Method::GET, "/nowhere");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body: serde_json::Value = serde_json::from_str(&body_of(response)).unwrap();
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[test]
    fn mounted_routers_receive_the_stripped_path() {
        let inner = build_simple_router(|route| {
            route.get("/hello").to(marked("inner"));
        })
        .unwrap();

        let router = build_simple_router(move |route| {
            route.mount("/svc", inner.clone());
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/svc/hello");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response), "inner");

        let (_s, response) = send(&router, Method::GET, "/svc/missing");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn query_strings_survive_redirects() {
        let router = build_simple_router(|route| {
            route.get("/a/b").to(marked("ok"));
        })
        .unwrap();

        let (_s, response) = send(&router, Method::GET, "/a/b/?page=2");
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "/a/b?page=2"
        );
    }
}
