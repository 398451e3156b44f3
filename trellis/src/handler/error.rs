//! Defines the errors that handlers surface at the HTTP boundary, and their
//! mapping onto status codes and the JSON error envelope.

use std::fmt;

use hyper::header::{HeaderValue, ALLOW};
use hyper::{Body, Method, Response};
use log::error;
use serde::Serialize;
use serde_json::json;

use crate::helpers::http::response::create_json_response;
use crate::state::State;

/// The classification of a `HandlerError`, determining the response status
/// and envelope `code`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// 404, no resource at the requested location.
    NotFound,
    /// 405, the path exists under a different method.
    MethodNotAllowed,
    /// 400, the client supplied an invalid request.
    BadRequest,
    /// 400 with per-field details accumulated by the binder.
    Validation,
    /// 401, authentication required.
    Unauthorized,
    /// 403, authenticated but not permitted.
    Forbidden,
    /// 409, the request conflicts with current state.
    Conflict,
    /// 429, the client is being rate limited.
    TooManyRequests,
    /// 500, an internal failure; messages are redacted.
    Internal,
    /// 503, the service is temporarily unable to respond.
    Unavailable,
}

impl ErrorKind {
    pub(crate) fn status(self) -> hyper::StatusCode {
        use hyper::StatusCode;

        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::BadRequest | ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub(crate) fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::MethodNotAllowed => "method_not_allowed",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Validation => "validation_failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::Internal => "internal",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// A single field failure reported by the binder.
#[derive(Clone, Debug, Serialize)]
pub struct FieldError {
    /// The external field name.
    pub field: String,
    /// The value as supplied by the client, empty when missing.
    pub value: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl FieldError {
    /// Creates a new field failure record.
    pub fn new<F, V, R>(field: F, value: V, reason: R) -> Self
    where
        F: Into<String>,
        V: Into<String>,
        R: Into<String>,
    {
        FieldError {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Describes an error which occurred during handler execution, and allows the
/// assignment of a status code and envelope to be returned to the client.
///
/// Typed handlers return this directly; raw handlers may also construct one
/// and let the `Router` finalize it into the JSON error envelope.
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
    fields: Vec<FieldError>,
    details: Option<serde_json::Value>,
    allow: Vec<Method>,
    source: Option<anyhow::Error>,
}

impl fmt::Display for HandlerError {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(out, "{}: {}", self.kind.code(), self.message)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        out.debug_struct("HandlerError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("fields", &self.fields)
            .field("source", &self.source)
            .finish()
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<anyhow::Error> for HandlerError {
    /// Opaque errors become a 500 with a redacted message; the original is
    /// retained for logging only.
    fn from(source: anyhow::Error) -> Self {
        HandlerError {
            kind: ErrorKind::Internal,
            message: "internal server error".to_string(),
            fields: Vec::new(),
            details: None,
            allow: Vec::new(),
            source: Some(source),
        }
    }
}

macro_rules! constructor {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        pub fn $name<M: Into<String>>(message: M) -> Self {
            HandlerError::new($kind, message.into())
        }
    };
}

impl HandlerError {
    fn new(kind: ErrorKind, message: String) -> Self {
        HandlerError {
            kind,
            message,
            fields: Vec::new(),
            details: None,
            allow: Vec::new(),
            source: None,
        }
    }

    constructor!(
        /// A 404 error.
        not_found,
        ErrorKind::NotFound
    );
    constructor!(
        /// A 400 error for malformed client input.
        bad_request,
        ErrorKind::BadRequest
    );
    constructor!(
        /// A 401 error.
        unauthorized,
        ErrorKind::Unauthorized
    );
    constructor!(
        /// A 403 error.
        forbidden,
        ErrorKind::Forbidden
    );
    constructor!(
        /// A 409 error.
        conflict,
        ErrorKind::Conflict
    );
    constructor!(
        /// A 429 error.
        too_many_requests,
        ErrorKind::TooManyRequests
    );
    constructor!(
        /// A 500 error. The message is sent to the client, so keep it bland.
        internal,
        ErrorKind::Internal
    );
    constructor!(
        /// A 503 error.
        unavailable,
        ErrorKind::Unavailable
    );

    /// A 405 error carrying the methods to advertise via `Allow`.
    pub fn method_not_allowed(allow: Vec<Method>) -> Self {
        let mut err = HandlerError::new(
            ErrorKind::MethodNotAllowed,
            "method not allowed".to_string(),
        );
        err.allow = allow;
        err
    }

    /// A 400 validation failure carrying all accumulated per-field errors.
    pub fn validation(fields: Vec<FieldError>) -> Self {
        let mut err = HandlerError::new(ErrorKind::Validation, "request validation failed".to_string());
        err.fields = fields;
        err
    }

    /// Attaches a free-form `details` object to the envelope.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attaches the underlying error for logging; it is never sent to the
    /// client.
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The per-field failures, non-empty only for validation errors.
    pub fn fields(&self) -> &[FieldError] {
        &self.fields
    }

    /// The JSON error envelope for this error.
    pub fn envelope(&self) -> serde_json::Value {
        let mut error = json!({
            "code": self.kind.code(),
            "message": self.message,
        });

        let details = if self.kind == ErrorKind::Validation {
            Some(json!({ "fields": self.fields }))
        } else {
            self.details.clone()
        };

        if let Some(details) = details {
            error["details"] = details;
        }

        json!({ "error": error })
    }

    /// Finalizes this error into an HTTP response, logging the underlying
    /// source if one was attached.
    pub fn into_response(self, state: &State) -> Response<Body> {
        if let Some(source) = &self.source {
            error!("[{}] handler error: {:#}", state.request_id(), source);
        }

        let mut res = create_json_response(state, self.kind.status(), &self.envelope());

        if self.kind == ErrorKind::MethodNotAllowed {
            let allow = self
                .allow
                .iter()
                .map(Method::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&allow) {
                res.headers_mut().insert(ALLOW, value);
            }
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Version};

    fn test_state() -> State {
        State::new(
            Method::GET,
            "/".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        )
    }

    #[test]
    fn validation_envelope_lists_fields() {
        let err = HandlerError::validation(vec![FieldError::new("limit", "abc", "not an integer")]);
        let envelope = err.envelope();

        assert_eq!(envelope["error"]["code"], "validation_failed");
        assert_eq!(envelope["error"]["details"]["fields"][0]["field"], "limit");
        assert_eq!(envelope["error"]["details"]["fields"][0]["value"], "abc");
        assert_eq!(
            envelope["error"]["details"]["fields"][0]["reason"],
            "not an integer"
        );
    }

    #[test]
    fn method_not_allowed_sets_allow_header() {
        let state = test_state();
        let err = HandlerError::method_not_allowed(vec![Method::GET, Method::PUT]);
        let res = err.into_response(&state);

        assert_eq!(res.status(), hyper::StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(res.headers().get(ALLOW).unwrap(), "GET, PUT");
    }

    #[test]
    fn opaque_sources_are_redacted() {
        let err: HandlerError = anyhow::anyhow!("connection refused to 10.0.0.3").into();

        assert_eq!(err.kind(), ErrorKind::Internal);
        let envelope = err.envelope();
        assert_eq!(envelope["error"]["message"], "internal server error");
    }
}
