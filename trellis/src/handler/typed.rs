//! The opinionated handler wrapper: decode → call → encode, or map the error
//! onto the JSON envelope.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use hyper::{Method, StatusCode};
use serde::Serialize;

use crate::binder::{bind, Bind};
use crate::handler::{Handler, HandlerError, HandlerFuture};
use crate::helpers::http::response::create_json_response;
use crate::state::State;

/// Wraps a typed function into a raw [`Handler`].
///
/// The request type is bound per its descriptor; a bind failure short-circuits
/// into a `400` with the structured validation envelope. The response value is
/// serialized as the top-level JSON document with status `200`, or `201` when
/// the route method is `POST`. Returned errors map onto the envelope via
/// [`HandlerError`].
///
/// ```rust,ignore
/// route.post("/users/:user_id/notes").to_typed(
///     |state, req: CreateNote| async move {
///         let note = store.create(req).await;
///         (state, note.map_err(HandlerError::from))
///     },
/// );
/// ```
pub fn typed<F, Fut, Req, Res>(f: F) -> TypedHandler<F, Req, Res>
where
    F: Fn(State, Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = (State, Result<Res, HandlerError>)> + Send + 'static,
    Req: Bind,
    Res: Serialize + 'static,
{
    TypedHandler {
        f,
        _marker: PhantomData,
    }
}

/// The monomorphized wrapper produced by [`typed`], one instance per
/// `(RequestT, ResponseT)` pair.
pub struct TypedHandler<F, Req, Res> {
    f: F,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<F, Fut, Req, Res> Handler for TypedHandler<F, Req, Res>
where
    F: Fn(State, Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = (State, Result<Res, HandlerError>)> + Send + 'static,
    Req: Bind,
    Res: Serialize + 'static,
{
    fn handle(&self, mut state: State) -> Pin<Box<HandlerFuture>> {
        let f = self.f.clone();

        Box::pin(async move {
            let req = match bind::<Req>(&mut state).await {
                Ok(req) => req,
                Err(err) => return Err((state, err)),
            };

            let (state, result) = f(state, req).await;
            match result {
                Ok(res) => {
                    let status = if *state.method() == Method::POST {
                        StatusCode::CREATED
                    } else {
                        StatusCode::OK
                    };
                    let response = create_json_response(&state, status, &res);
                    Ok((state, response))
                }
                Err(err) => Err((state, err)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_executor::block_on;
    use hyper::{Body, HeaderMap, Uri, Version};
    use serde::Deserialize;

    use crate::binder::Bind;

    #[derive(Deserialize, Bind)]
    struct Greet {
        #[bind(query)]
        name: String,
    }

    #[derive(Serialize)]
    struct Greeting {
        message: String,
    }

    fn test_state(method: Method, uri: &str) -> State {
        let mut state = State::new(
            method,
            uri.parse::<Uri>().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );
        state.set_body(Body::empty());
        state
    }

    fn greeter() -> impl Handler {
        typed(|state, req: Greet| async move {
            let greeting = Greeting {
                message: format!("hello, {}", req.name),
            };
            (state, Ok(greeting))
        })
    }

    #[test]
    fn successful_binding_returns_200_json() {
        let handler = greeter();
        let state = test_state(Method::GET, "/greet?name=ferris");

        let (_state, response) = block_on(handler.handle(state)).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn post_routes_signal_created() {
        let handler = greeter();
        let state = test_state(Method::POST, "/greet?name=ferris");

        let (_state, response) = block_on(handler.handle(state)).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn bind_failure_maps_to_validation_error() {
        let handler = greeter();
        let state = test_state(Method::GET, "/greet");

        let (_state, err) = block_on(handler.handle(state)).unwrap_err();
        assert_eq!(err.kind(), crate::handler::ErrorKind::Validation);
        assert_eq!(err.fields()[0].field, "name");
        assert_eq!(err.fields()[0].reason, "missing");
    }

    #[test]
    fn handler_errors_pass_through() {
        let handler = typed(|state, _req: Greet| async move {
            (
                state,
                Err::<Greeting, _>(HandlerError::forbidden("members only")),
            )
        });
        let state = test_state(Method::GET, "/greet?name=ferris");

        let (_state, err) = block_on(handler.handle(state)).unwrap_err();
        assert_eq!(err.kind(), crate::handler::ErrorKind::Forbidden);
    }
}
