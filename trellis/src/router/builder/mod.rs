//! Defines a builder API for constructing a `Router`.
//!
//! ```rust
//! # use trellis::router::builder::*;
//! # use trellis::state::State;
//! # use hyper::{Body, Response};
//! # fn my_handler(state: State) -> (State, Response<Body>) {
//! #     (state, Response::new(Body::empty()))
//! # }
//! # fn main() {
//! let router = build_simple_router(|route| {
//!     route.get("/request/path").to(my_handler);
//! })
//! .unwrap();
//! # drop(router);
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use hyper::Method;
use log::trace;
use serde::Serialize;

use crate::binder::{descriptor_of, Bind};
use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::handler::typed::typed;
use crate::handler::{AsyncHandlerFn, Handler, HandlerError, HandlerResult};
use crate::middleware::{self, Middleware};
use crate::observer::{Annotations, RouteKind, RouteObserver, RouteRegistration};
use crate::router::tree::node::Delegation;
use crate::router::tree::Tree;
use crate::router::{default_method_not_allowed, default_not_found, Router, RouterData};
use crate::state::State;
use crate::stream::duplex::{DuplexRouteBuilder, DuplexUpgradeHandler};
use crate::stream::manager::ConnectionManager;
use crate::stream::push::{PushConnection, PushStreamHandler};

const ALL_METHODS: [Method; 7] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
];

/// Builds a `Router` using the provided closure, with the given
/// configuration. Routes are defined through the [`DrawRoutes`] methods of
/// the `RouterBuilder` passed to the closure.
///
/// Registration problems (conflicting routes, malformed paths) are collected
/// while the closure runs and surfaced here, first one wins.
pub fn build_router<F>(config: RouterConfig, f: F) -> Result<Router, RouterError>
where
    F: FnOnce(&mut RouterBuilder),
{
    let mut builder = RouterBuilder {
        shared: Shared {
            trees: HashMap::new(),
            observers: Vec::new(),
            manager: ConnectionManager::new(),
            config,
            not_found: None,
            method_not_allowed: None,
            errors: Vec::new(),
        },
        stack: Vec::new(),
    };

    f(&mut builder);

    let Shared {
        trees,
        observers: _,
        manager,
        config,
        not_found,
        method_not_allowed,
        mut errors,
    } = builder.shared;

    if !errors.is_empty() {
        return Err(errors.remove(0));
    }

    Ok(Router::new(RouterData {
        trees,
        config,
        not_found: not_found.unwrap_or_else(|| Arc::new(default_not_found)),
        method_not_allowed: method_not_allowed
            .unwrap_or_else(|| Arc::new(default_method_not_allowed)),
        streams: manager,
    }))
}

/// Builds a `Router` with the default configuration.
pub fn build_simple_router<F>(f: F) -> Result<Router, RouterError>
where
    F: FnOnce(&mut RouterBuilder),
{
    build_router(RouterConfig::default(), f)
}

/// State accumulated across the whole builder run, shared by the root
/// builder and every scope derived from it.
#[doc(hidden)]
pub struct Shared {
    trees: HashMap<Method, Tree>,
    observers: Vec<Arc<dyn RouteObserver>>,
    manager: Arc<ConnectionManager>,
    config: RouterConfig,
    not_found: Option<Arc<dyn Handler>>,
    method_not_allowed: Option<Arc<dyn Handler>>,
    errors: Vec<RouterError>,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: Arc<dyn Handler>,
        delegation: Delegation,
        kind: RouteKind,
        request_descriptor: Option<Arc<crate::binder::Descriptor>>,
        response_type: Option<&'static str>,
        annotations: Annotations,
    ) {
        trace!(" registering {:?} {}", methods, path);

        for method in methods {
            let tree = self.trees.entry(method.clone()).or_insert_with(Tree::new);
            if let Err(err) = tree.add_route(path, handler.clone(), delegation) {
                self.errors.push(err);
                return;
            }
        }

        if !self.observers.is_empty() {
            let registration = RouteRegistration {
                path: path.to_string(),
                methods: methods.to_vec(),
                kind,
                request_descriptor,
                response_type,
                annotations,
            };
            for observer in &self.observers {
                observer.route_registered(&registration);
            }
        }
    }
}

/// The top-level builder, passed to the closure given to [`build_router`].
pub struct RouterBuilder {
    shared: Shared,
    stack: Vec<Arc<dyn Middleware>>,
}

impl RouterBuilder {
    /// Overrides the handler invoked when no route matches. The default
    /// responds `404` with the JSON error envelope.
    pub fn not_found<H: Handler + 'static>(&mut self, handler: H) {
        self.shared.not_found = Some(Arc::new(handler));
    }

    /// Overrides the handler invoked when the path matches under another
    /// method. It can read the matched methods via
    /// [`State::allowed_methods`]; the default responds `405` with an
    /// `Allow` header.
    pub fn method_not_allowed<H: Handler + 'static>(&mut self, handler: H) {
        self.shared.method_not_allowed = Some(Arc::new(handler));
    }

    /// Registers an observer notified of every subsequent route
    /// registration.
    pub fn add_observer(&mut self, observer: Arc<dyn RouteObserver>) {
        self.shared.observers.push(observer);
    }
}

/// A sub-router: registrations forward to the parent with this scope's
/// prefix prepended and its middleware stack applied.
pub struct ScopeBuilder<'a> {
    shared: &'a mut Shared,
    prefix: String,
    stack: Vec<Arc<dyn Middleware>>,
}

/// Defines the methods available for registering routes, shared by the
/// top-level builder and scopes.
pub trait DrawRoutes {
    #[doc(hidden)]
    fn component_refs(&mut self) -> (&mut Shared, &str, &Vec<Arc<dyn Middleware>>);

    #[doc(hidden)]
    fn stack_mut(&mut self) -> &mut Vec<Arc<dyn Middleware>>;

    /// Begins registering a route for the given methods and path.
    fn request(&mut self, methods: Vec<Method>, path: &str) -> SingleRouteBuilder<'_> {
        let (shared, prefix, stack) = self.component_refs();
        let stack = stack.clone();
        let path = join_paths(prefix, path);
        SingleRouteBuilder {
            shared,
            methods,
            path,
            stack,
            annotations: Annotations::default(),
        }
    }

    /// Begins registering a `GET` route.
    fn get(&mut self, path: &str) -> SingleRouteBuilder<'_> {
        self.request(vec![Method::GET], path)
    }

    /// Begins registering a `HEAD` route.
    fn head(&mut self, path: &str) -> SingleRouteBuilder<'_> {
        self.request(vec![Method::HEAD], path)
    }

    /// Begins registering a `POST` route.
    fn post(&mut self, path: &str) -> SingleRouteBuilder<'_> {
        self.request(vec![Method::POST], path)
    }

    /// Begins registering a `PUT` route.
    fn put(&mut self, path: &str) -> SingleRouteBuilder<'_> {
        self.request(vec![Method::PUT], path)
    }

    /// Begins registering a `DELETE` route.
    fn delete(&mut self, path: &str) -> SingleRouteBuilder<'_> {
        self.request(vec![Method::DELETE], path)
    }

    /// Begins registering a `PATCH` route.
    fn patch(&mut self, path: &str) -> SingleRouteBuilder<'_> {
        self.request(vec![Method::PATCH], path)
    }

    /// Begins registering an `OPTIONS` route.
    fn options(&mut self, path: &str) -> SingleRouteBuilder<'_> {
        self.request(vec![Method::OPTIONS], path)
    }

    /// Appends a middleware to this builder's stack. Only routes registered
    /// afterwards (on this builder or scopes derived from it) are wrapped;
    /// existing registrations are untouched.
    fn with_middleware<M: Middleware>(&mut self, middleware: M) {
        self.stack_mut().push(Arc::new(middleware));
    }

    /// Creates a sub-router rooted at `prefix`. Its middleware stack is a
    /// copy of this builder's at the time of the call, so middleware added
    /// to the scope never affects the parent or sibling scopes.
    fn scope<F>(&mut self, prefix: &str, f: F)
    where
        F: FnOnce(&mut ScopeBuilder<'_>),
    {
        let (shared, parent_prefix, stack) = self.component_refs();
        let mut scope = ScopeBuilder {
            prefix: join_paths(parent_prefix, prefix),
            stack: stack.clone(),
            shared,
        };
        f(&mut scope);
    }

    /// Attaches an opaque handler at `prefix`. Any request whose path begins
    /// with the prefix (plus a `/` boundary) is dispatched to it with the
    /// prefix stripped, bypassing this builder's middleware.
    fn mount<H: Handler + 'static>(&mut self, prefix: &str, handler: H) {
        let (shared, parent_prefix, _) = self.component_refs();
        let path = join_paths(parent_prefix, prefix);
        shared.register(
            &ALL_METHODS,
            &path,
            Arc::new(handler),
            Delegation::External,
            RouteKind::Http,
            None,
            None,
            Annotations::default(),
        );
    }

    /// Registers a duplex (WebSocket) stream route at `path`. The closure
    /// configures the typed message handlers the stream accepts.
    fn duplex<F>(&mut self, path: &str, f: F)
    where
        F: FnOnce(&mut DuplexRouteBuilder),
    {
        let (shared, prefix, stack) = self.component_refs();
        let stack = stack.clone();
        let path = join_paths(prefix, path);

        let mut duplex = DuplexRouteBuilder::new();
        f(&mut duplex);
        let (registry, annotations) = duplex.into_parts();

        let handler = DuplexUpgradeHandler::new(
            registry,
            shared.manager.clone(),
            shared.config.stream,
        );
        let wrapped = middleware::apply(&stack, Arc::new(handler));

        shared.register(
            &[Method::GET],
            &path,
            wrapped,
            Delegation::Internal,
            RouteKind::Duplex,
            None,
            None,
            annotations,
        );
    }

    /// Registers a push (Server-Sent Events) stream route at `path`.
    /// `on_open` is spawned with each new connection; events are also
    /// deliverable through the router's connection manager.
    fn push<F, Fut>(&mut self, path: &str, on_open: F)
    where
        F: Fn(Arc<PushConnection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shared, prefix, stack) = self.component_refs();
        let stack = stack.clone();
        let path = join_paths(prefix, path);

        let handler =
            PushStreamHandler::new(shared.manager.clone(), shared.config.stream, on_open);
        let wrapped = middleware::apply(&stack, Arc::new(handler));

        shared.register(
            &[Method::GET],
            &path,
            wrapped,
            Delegation::Internal,
            RouteKind::Push,
            None,
            None,
            Annotations::default(),
        );
    }
}

impl DrawRoutes for RouterBuilder {
    fn component_refs(&mut self) -> (&mut Shared, &str, &Vec<Arc<dyn Middleware>>) {
        (&mut self.shared, "", &self.stack)
    }

    fn stack_mut(&mut self) -> &mut Vec<Arc<dyn Middleware>> {
        &mut self.stack
    }
}

impl<'a> DrawRoutes for ScopeBuilder<'a> {
    fn component_refs(&mut self) -> (&mut Shared, &str, &Vec<Arc<dyn Middleware>>) {
        (&mut *self.shared, &self.prefix, &self.stack)
    }

    fn stack_mut(&mut self) -> &mut Vec<Arc<dyn Middleware>> {
        &mut self.stack
    }
}

/// Completes the registration of a single route.
pub struct SingleRouteBuilder<'a> {
    shared: &'a mut Shared,
    methods: Vec<Method>,
    path: String,
    stack: Vec<Arc<dyn Middleware>>,
    annotations: Annotations,
}

impl<'a> SingleRouteBuilder<'a> {
    /// Attaches documentation surfaced to registration observers.
    pub fn annotate(mut self, annotations: Annotations) -> Self {
        self.annotations = annotations;
        self
    }

    /// Directs the route to the given handler.
    pub fn to<H: Handler + 'static>(self, handler: H) {
        self.finish(Arc::new(handler), None, None);
    }

    /// Directs the route to an `async fn(State) -> HandlerResult`.
    pub fn to_async<F, Fut>(self, f: F)
    where
        F: Fn(State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.finish(Arc::new(AsyncHandlerFn::new(f)), None, None);
    }

    /// Directs the route to a typed function, wrapped per the opinionated
    /// handler contract: bind, call, serialize (or map the error). The
    /// request descriptor is compiled here, at registration.
    pub fn to_typed<F, Fut, Req, Res>(self, f: F)
    where
        F: Fn(State, Req) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = (State, Result<Res, HandlerError>)> + Send + 'static,
        Req: Bind,
        Res: Serialize + 'static,
    {
        let descriptor = descriptor_of::<Req>();
        self.finish(
            Arc::new(typed(f)),
            Some(descriptor),
            Some(std::any::type_name::<Res>()),
        );
    }

    fn finish(
        self,
        handler: Arc<dyn Handler>,
        request_descriptor: Option<Arc<crate::binder::Descriptor>>,
        response_type: Option<&'static str>,
    ) {
        let wrapped = middleware::apply(&self.stack, handler);
        self.shared.register(
            &self.methods,
            &self.path,
            wrapped,
            Delegation::Internal,
            RouteKind::Http,
            request_descriptor,
            response_type,
            self.annotations,
        );
    }
}

fn join_paths(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else if path == "/" {
        prefix.to_string()
    } else {
        format!("{}{}", prefix, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::pin::Pin;
    use std::sync::Mutex;

    use futures_executor::block_on;
    use futures_util::FutureExt;
    use hyper::header::HeaderValue;
    use hyper::{Body, HeaderMap, Response, StatusCode, Uri, Version};
    use serde::Deserialize;

    use crate::handler::HandlerFuture;

    fn send(router: &Router, method: Method, uri: &str) -> Response<Body> {
        let mut state = State::new(
            method,
            uri.parse::<Uri>().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );
        state.set_body(Body::empty());

        let (_state, response) = block_on(router.handle(state)).unwrap();
        response
    }

    fn ok(state: State) -> (State, Response<Body>) {
        (state, Response::new(Body::empty()))
    }

    /// Tags responses passing through it with a header, so tests can see
    /// which stack wrapped a route.
    struct Tag(&'static str);

    impl Middleware for Tag {
        fn call(&self, state: State, next: Arc<dyn Handler>) -> Pin<Box<HandlerFuture>> {
            let tag = self.0;
            next.handle(state)
                .map(move |result| {
                    result.map(|(state, mut response)| {
                        response
                            .headers_mut()
                            .append("x-tag", HeaderValue::from_static(tag));
                        (state, response)
                    })
                })
                .boxed()
        }
    }

    fn tags(response: &Response<Body>) -> Vec<&str> {
        response
            .headers()
            .get_all("x-tag")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect()
    }

    #[test]
    fn conflicting_registrations_fail_the_build() {
        let result = build_simple_router(|route| {
            route.get("/same").to(ok);
            route.get("/same").to(ok);
        });

        assert!(matches!(result, Err(RouterError::RouteConflict(_))));
    }

    #[test]
    fn middleware_is_not_retroactive() {
        let router = build_simple_router(|route| {
            route.get("/before").to(ok);
            route.with_middleware(Tag("m"));
            route.get("/after").to(ok);
        })
        .unwrap();

        assert!(tags(&send(&router, Method::GET, "/before")).is_empty());
        assert_eq!(tags(&send(&router, Method::GET, "/after")), vec!["m"]);
    }

    #[test]
    fn scopes_concatenate_prefixes_and_copy_middleware() {
        let router = build_simple_router(|route| {
            route.with_middleware(Tag("root"));
            route.scope("/api", |api| {
                api.with_middleware(Tag("api"));
                api.get("/users").to(ok);
                api.scope("/v2", |v2| {
                    v2.get("/users").to(ok);
                });
            });
            route.get("/plain").to(ok);
        })
        .unwrap();

        // Scope routes see the parent stack plus their own additions. Tags
        // are appended on the response path, so the innermost middleware
        // lands first.
        assert_eq!(
            tags(&send(&router, Method::GET, "/api/users")),
            vec!["api", "root"]
        );
        assert_eq!(
            tags(&send(&router, Method::GET, "/api/v2/users")),
            vec!["api", "root"]
        );

        // Middleware added inside a scope does not leak back out.
        assert_eq!(tags(&send(&router, Method::GET, "/plain")), vec!["root"]);
    }

    #[test]
    fn sibling_scopes_are_isolated() {
        let router = build_simple_router(|route| {
            route.scope("/a", |a| {
                a.with_middleware(Tag("a"));
                a.get("/x").to(ok);
            });
            route.scope("/b", |b| {
                b.get("/x").to(ok);
            });
        })
        .unwrap();

        assert_eq!(tags(&send(&router, Method::GET, "/a/x")), vec!["a"]);
        assert!(tags(&send(&router, Method::GET, "/b/x")).is_empty());
    }

    #[test]
    fn observers_learn_about_registrations() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<(String, RouteKind)>>);

        impl RouteObserver for Recorder {
            fn route_registered(&self, registration: &RouteRegistration) {
                self.0
                    .lock()
                    .unwrap()
                    .push((registration.path.clone(), registration.kind));
            }
        }

        let recorder = Arc::new(Recorder::default());
        let observed = recorder.clone();

        build_simple_router(move |route| {
            route.add_observer(observed);
            route.get("/one").to(ok);
            route.duplex("/ws", |_| {});
        })
        .unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("/one".to_string(), RouteKind::Http),
                ("/ws".to_string(), RouteKind::Duplex),
            ]
        );
    }

    #[test]
    fn typed_routes_surface_validation_failures() {
        #[derive(Deserialize, Bind)]
        struct ListItems {
            #[bind(query)]
            limit: i32,
        }

        #[derive(Serialize)]
        struct Items {
            limit: i32,
        }

        let router = build_simple_router(|route| {
            route.get("/items").to_typed(|state, req: ListItems| async move {
                (state, Ok(Items { limit: req.limit }))
            });
        })
        .unwrap();

        let response = send(&router, Method::GET, "/items?limit=abc");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = block_on(hyper::body::to_bytes(response.into_body())).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "validation_failed");
        assert_eq!(body["error"]["details"]["fields"][0]["field"], "limit");
        assert_eq!(body["error"]["details"]["fields"][0]["value"], "abc");
        assert_eq!(
            body["error"]["details"]["fields"][0]["reason"],
            "not an integer"
        );

        let response = send(&router, Method::GET, "/items?limit=25");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn duplex_routes_reject_plain_requests() {
        let router = build_simple_router(|route| {
            route.duplex("/ws", |ws| {
                ws.message("echo", |_conn, value: serde_json::Value| async move {
                    Ok(Some(value))
                });
            });
        })
        .unwrap();

        let response = send(&router, Method::GET, "/ws");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn push_routes_open_an_event_stream() {
        let router = build_simple_router(|route| {
            route.push("/events", |_conn| async move {});
        })
        .unwrap();

        let state = State::new(
            Method::GET,
            "/events".parse::<Uri>().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );

        let (_state, response) = router.handle(state).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(router.streams().push_connections().len(), 1);
    }
}
