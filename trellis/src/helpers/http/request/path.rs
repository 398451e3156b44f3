//! Defines helper functions for processing the request path

use crate::helpers::http::decode_path_segment;

/// Holder for request URI path segments that have been split and
/// percent-decoded.
///
/// Interior empty segments are dropped, but a trailing empty segment is kept
/// so that `/some/path` and `/some/path/` remain distinguishable for the
/// trailing-slash redirect policy. A request path of `/some//path/` splits
/// into:
///
/// ```plain
/// ["some", "path", ""]
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RequestPathSegments {
    segments: Vec<String>,
}

impl RequestPathSegments {
    /// Creates a new `RequestPathSegments` instance by splitting a request
    /// URI path. Segments that fail to percent-decode are dropped.
    pub(crate) fn new(path: &str) -> Self {
        let parts: Vec<&str> = path.split('/').collect();
        let last = parts.len().saturating_sub(1);

        let segments = parts
            .iter()
            .enumerate()
            .filter(|(i, s)| !s.is_empty() || (*i == last && *i > 0 && path.len() > 1))
            .filter_map(|(_, s)| decode_path_segment(s))
            .collect();

        RequestPathSegments { segments }
    }

    /// Provide segments that still need to be processed.
    pub(crate) fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns a copy with the first `offset` segments discarded, used when
    /// delegating to a mounted handler with a stripped prefix.
    pub(crate) fn into_subsegments(&self, offset: usize) -> Self {
        RequestPathSegments {
            segments: self.segments.split_at(offset.min(self.segments.len())).1.to_vec(),
        }
    }
}
