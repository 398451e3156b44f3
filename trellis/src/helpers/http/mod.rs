//! Helpers for HTTP request handling and response generation

pub mod request;
pub mod response;

use percent_encoding::percent_decode_str;

/// The header carrying the request id: adopted from the client when present,
/// echoed on every response.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Percent-decodes one path segment. `+` is an ordinary character here;
/// sequences that do not decode to valid UTF-8 are rejected.
pub(crate) fn decode_path_segment(raw: &str) -> Option<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

/// Decodes one `x-www-form-urlencoded` component (query-string key or
/// value): `+` stands for a space, then percent sequences apply.
pub(crate) fn decode_form_component(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}
