//! Helpers for HTTP response generation

use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Body, Response, StatusCode};
use mime::Mime;
use serde::Serialize;

use crate::helpers::http::X_REQUEST_ID;
use crate::state::State;

/// Creates a `Response` object with the provided body and content type, and
/// echoes the request id.
pub fn create_response<B: Into<Body>>(
    state: &State,
    status: StatusCode,
    mime: Mime,
    body: B,
) -> Response<Body> {
    construct_response(state, status, Some(mime), Some(body.into()))
}

/// Produces a simple empty `Response` with the provided status.
pub fn create_empty_response(state: &State, status: StatusCode) -> Response<Body> {
    construct_response(state, status, None, None)
}

/// Serializes `data` as the top-level JSON document of a response.
///
/// Falls back to an empty `500` if serialization fails, which only occurs for
/// types whose `Serialize` implementation can error.
pub fn create_json_response<S: Serialize>(
    state: &State,
    status: StatusCode,
    data: &S,
) -> Response<Body> {
    match serde_json::to_string(data) {
        Ok(body) => create_response(state, status, mime::APPLICATION_JSON, body),
        Err(_) => create_empty_response(state, StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Produces an empty `Response` with a `301 Moved Permanently` status and a
/// `Location` header set to the provided location.
pub fn create_permanent_redirect<L: Into<String>>(state: &State, location: L) -> Response<Body> {
    let mut res = create_empty_response(state, StatusCode::MOVED_PERMANENTLY);
    if let Ok(value) = HeaderValue::from_str(&location.into()) {
        res.headers_mut().insert(LOCATION, value);
    }
    res
}

fn construct_response(
    state: &State,
    status: StatusCode,
    mime: Option<Mime>,
    body: Option<Body>,
) -> Response<Body> {
    let mut builder = Response::builder().status(status);

    if let Some(mime) = mime {
        builder = builder.header(CONTENT_TYPE, mime.as_ref());
    }
    if let Ok(value) = HeaderValue::from_str(state.request_id()) {
        builder = builder.header(X_REQUEST_ID, value);
    }

    builder
        .body(body.unwrap_or_else(Body::empty))
        .expect("response built from valid parts")
}
