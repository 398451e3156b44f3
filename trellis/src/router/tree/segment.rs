//! Route path segments and the parameters captured while matching them.

use crate::error::RouterError;

/// The ordered set of path parameters captured during a route lookup.
///
/// Carried in `State` for the lifetime of the request; handlers that outlive
/// the request (streaming upgrades) receive their own clone at upgrade time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathParams {
    items: Vec<(String, String)>,
}

impl PathParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        PathParams::default()
    }

    /// The value captured under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates captures in the order they appeared along the matched path.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The number of captured parameters.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn push(&mut self, name: &str, value: &str) {
        self.items.push((name.to_string(), value.to_string()));
    }

    /// Discards captures pushed after `len`, used when the tree walk
    /// backtracks out of a parameter branch.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }
}

/// One segment of a registered route path.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RouteSegment {
    /// Matched by string equality against the request segment.
    Static(String),
    /// Matches any single segment, capturing it under the given name.
    Param(String),
    /// Matches the remainder of the request path, capturing it (including
    /// embedded `/`) under the given name. Must be the final segment.
    Wildcard(String),
}

/// Splits a registered route path into typed segments.
///
/// A trailing `/` produces a final empty static segment, keeping `/a/b` and
/// `/a/b/` distinct registrations so the trailing-slash redirect can map
/// between them.
pub(crate) fn parse_route(path: &str) -> Result<Vec<RouteSegment>, RouterError> {
    if !path.starts_with('/') {
        return Err(RouterError::invalid_path(path, "must begin with `/`"));
    }

    if path == "/" {
        return Ok(Vec::new());
    }

    let parts: Vec<&str> = path[1..].split('/').collect();
    let last = parts.len() - 1;
    let mut segments = Vec::with_capacity(parts.len());

    for (i, part) in parts.iter().enumerate() {
        let segment = if let Some(name) = part.strip_prefix(':') {
            if name.is_empty() {
                return Err(RouterError::invalid_path(path, "parameter without a name"));
            }
            RouteSegment::Param(name.to_string())
        } else if let Some(name) = part.strip_prefix('*') {
            if i != last {
                return Err(RouterError::invalid_path(
                    path,
                    "wildcard must be the final segment",
                ));
            }
            let name = if name.is_empty() { "*" } else { name };
            RouteSegment::Wildcard(name.to_string())
        } else if part.is_empty() {
            if i != last {
                return Err(RouterError::invalid_path(path, "empty segment"));
            }
            // The trailing-slash terminal.
            RouteSegment::Static(String::new())
        } else {
            RouteSegment::Static((*part).to_string())
        };

        segments.push(segment);
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_static_param_and_wildcard() {
        let segments = parse_route("/users/:id/files/*path").unwrap();
        assert_eq!(
            segments,
            vec![
                RouteSegment::Static("users".to_string()),
                RouteSegment::Param("id".to_string()),
                RouteSegment::Static("files".to_string()),
                RouteSegment::Wildcard("path".to_string()),
            ]
        );
    }

    #[test]
    fn trailing_slash_is_a_distinct_terminal() {
        assert_eq!(
            parse_route("/a/b/").unwrap(),
            vec![
                RouteSegment::Static("a".to_string()),
                RouteSegment::Static("b".to_string()),
                RouteSegment::Static(String::new()),
            ]
        );
        assert_ne!(parse_route("/a/b").unwrap(), parse_route("/a/b/").unwrap());
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_route("no-slash").is_err());
        assert!(parse_route("/a//b").is_err());
        assert!(parse_route("/a/:/b").is_err());
        assert!(parse_route("/a/*rest/more").is_err());
    }

    #[test]
    fn root_path_has_no_segments() {
        assert!(parse_route("/").unwrap().is_empty());
    }
}
