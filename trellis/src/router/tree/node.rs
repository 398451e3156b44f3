//! Defines `Node`, the recursive member of a route tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::trace;

use crate::error::RouterError;
use crate::handler::Handler;
use crate::router::tree::segment::{PathParams, RouteSegment};

/// Determines how a matched terminal is dispatched.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Delegation {
    /// The handler consumes the request directly.
    Internal,
    /// The handler is a mounted sub-handler; the matched prefix is stripped
    /// from the request path before dispatch and no further segments are
    /// consumed by this tree.
    External,
}

/// A recursive member of a route tree, representing one segment of a
/// registered path.
///
/// Children are held by match priority: an exact static child wins over the
/// parameter child, which wins over the wildcard child. The wildcard child is
/// always terminal.
pub(crate) struct Node {
    segment: String,
    handler: Option<Arc<dyn Handler>>,
    delegation: Delegation,
    static_children: BTreeMap<String, Node>,
    param_child: Option<Box<Node>>,
    wildcard_child: Option<Box<Node>>,
}

impl Node {
    pub(crate) fn new<S: Into<String>>(segment: S) -> Self {
        Node {
            segment: segment.into(),
            handler: None,
            delegation: Delegation::Internal,
            static_children: BTreeMap::new(),
            param_child: None,
            wildcard_child: None,
        }
    }

    /// The capture name for parameter and wildcard nodes, or the literal
    /// segment for static nodes.
    pub(crate) fn segment(&self) -> &str {
        &self.segment
    }

    pub(crate) fn handler(&self) -> Option<&Arc<dyn Handler>> {
        self.handler.as_ref()
    }

    pub(crate) fn delegation(&self) -> Delegation {
        self.delegation
    }

    pub(crate) fn is_routable(&self) -> bool {
        self.handler.is_some()
    }

    /// Inserts a terminal at the end of `segments`, creating intermediate
    /// nodes as required. `path` is carried for error reporting only.
    pub(crate) fn insert(
        &mut self,
        segments: &[RouteSegment],
        handler: Arc<dyn Handler>,
        delegation: Delegation,
        path: &str,
    ) -> Result<(), RouterError> {
        if self.delegation == Delegation::External {
            return Err(RouterError::RouteConflict(format!(
                "`{}` descends into a mounted prefix",
                path
            )));
        }

        match segments.split_first() {
            None => {
                if self.handler.is_some() {
                    return Err(RouterError::RouteConflict(format!(
                        "a handler is already registered for `{}`",
                        path
                    )));
                }
                if delegation == Delegation::External
                    && !(self.static_children.is_empty()
                        && self.param_child.is_none()
                        && self.wildcard_child.is_none())
                {
                    return Err(RouterError::RouteConflict(format!(
                        "`{}` cannot be mounted over existing routes",
                        path
                    )));
                }
                trace!(" adding terminal to `{}`", self.segment);
                self.handler = Some(handler);
                self.delegation = delegation;
                Ok(())
            }
            Some((RouteSegment::Static(s), rest)) => self
                .static_children
                .entry(s.clone())
                .or_insert_with(|| Node::new(s.clone()))
                .insert(rest, handler, delegation, path),
            Some((RouteSegment::Param(name), rest)) => {
                match &self.param_child {
                    Some(existing) if existing.segment != *name => {
                        return Err(RouterError::RouteConflict(format!(
                            "`{}` redeclares parameter `:{}` as `:{}`",
                            path, existing.segment, name
                        )));
                    }
                    Some(_) => {}
                    None => self.param_child = Some(Box::new(Node::new(name.clone()))),
                }
                self.param_child
                    .as_mut()
                    .expect("parameter child just ensured")
                    .insert(rest, handler, delegation, path)
            }
            Some((RouteSegment::Wildcard(name), rest)) => {
                debug_assert!(rest.is_empty(), "wildcard is validated to be final");
                match &self.wildcard_child {
                    Some(existing) if existing.segment != *name => {
                        return Err(RouterError::RouteConflict(format!(
                            "`{}` redeclares wildcard `*{}` as `*{}`",
                            path, existing.segment, name
                        )));
                    }
                    Some(existing) if existing.handler.is_some() => {
                        return Err(RouterError::RouteConflict(format!(
                            "a handler is already registered for `{}`",
                            path
                        )));
                    }
                    Some(_) => {}
                    None => self.wildcard_child = Some(Box::new(Node::new(name.clone()))),
                }
                let wildcard = self.wildcard_child.as_mut().expect("wildcard child just ensured");
                wildcard.handler = Some(handler);
                wildcard.delegation = delegation;
                Ok(())
            }
        }
    }

    /// Recursively locates the highest-priority terminal matching
    /// `segments`, pushing captures into `params` along the way.
    ///
    /// Returns the terminal node and the number of request segments consumed
    /// (relevant for mounted terminals, which stop consuming at the prefix).
    /// Captures pushed along branches that fail to produce a terminal are
    /// rolled back before the next branch is attempted.
    pub(crate) fn find<'a>(
        &'a self,
        segments: &[String],
        params: &mut PathParams,
    ) -> Option<(&'a Node, usize)> {
        if self.delegation == Delegation::External && self.handler.is_some() {
            trace!(" found delegated terminal `{}`", self.segment);
            return Some((self, 0));
        }

        let (head, rest) = match segments.split_first() {
            None => return self.handler.as_ref().map(|_| (self, 0)),
            Some(split) => split,
        };

        if let Some(child) = self.static_children.get(head) {
            if let Some((node, consumed)) = child.find(rest, params) {
                return Some((node, consumed + 1));
            }
        }

        if let Some(param) = &self.param_child {
            let mark = params.len();
            params.push(&param.segment, head);
            if let Some((node, consumed)) = param.find(rest, params) {
                return Some((node, consumed + 1));
            }
            params.truncate(mark);
        }

        if let Some(wildcard) = &self.wildcard_child {
            if wildcard.handler.is_some() {
                let mut remainder = head.clone();
                for segment in rest {
                    remainder.push('/');
                    remainder.push_str(segment);
                }
                params.push(&wildcard.segment, &remainder);
                return Some((wildcard, segments.len()));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::helpers::http::request::path::RequestPathSegments;
    use crate::router::tree::segment::parse_route;
    use crate::state::State;

    fn noop() -> Arc<dyn Handler> {
        fn handler(state: State) -> (State, hyper::Response<hyper::Body>) {
            (state, hyper::Response::new(hyper::Body::empty()))
        }
        Arc::new(handler)
    }

    fn insert(root: &mut Node, path: &str) {
        let segments = parse_route(path).expect("valid test route");
        root.insert(&segments, noop(), Delegation::Internal, path)
            .expect("insert succeeds");
    }

    fn find<'a>(root: &'a Node, path: &str, params: &mut PathParams) -> Option<(&'a Node, usize)> {
        let rps = RequestPathSegments::new(path);
        root.find(rps.segments(), params)
    }

    #[test]
    fn captures_parameters_in_path_order() {
        let mut root = Node::new("/");
        insert(&mut root, "/users/:id/posts/:post_id");

        let mut params = PathParams::new();
        let (node, consumed) = find(&root, "/users/42/posts/hello", &mut params).unwrap();

        assert!(node.is_routable());
        assert_eq!(consumed, 4);
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("post_id"), Some("hello"));
        assert_eq!(
            params.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            vec!["id", "post_id"]
        );
    }

    #[test]
    fn static_beats_param_beats_wildcard() {
        let mut root = Node::new("/");
        insert(&mut root, "/users/admin");
        insert(&mut root, "/users/:id");
        insert(&mut root, "/users/*");

        let mut params = PathParams::new();
        let (node, _) = find(&root, "/users/admin", &mut params).unwrap();
        assert_eq!(node.segment(), "admin");
        assert!(params.is_empty());

        let mut params = PathParams::new();
        let (node, _) = find(&root, "/users/42", &mut params).unwrap();
        assert_eq!(node.segment(), "id");
        assert_eq!(params.get("id"), Some("42"));

        let mut params = PathParams::new();
        let (node, _) = find(&root, "/users/42/extra", &mut params).unwrap();
        assert_eq!(node.segment(), "*");
        assert_eq!(params.get("*"), Some("42/extra"));
    }

    #[test]
    fn backtracks_out_of_failed_param_branches() {
        let mut root = Node::new("/");
        insert(&mut root, "/a/:x/end");
        insert(&mut root, "/a/*rest");

        // `:x` matches `b` but `c` is not `end`; the walk must roll the `x`
        // capture back before falling through to the wildcard.
        let mut params = PathParams::new();
        let (node, _) = find(&root, "/a/b/c", &mut params).unwrap();
        assert_eq!(node.segment(), "rest");
        assert_eq!(params.get("x"), None);
        assert_eq!(params.get("rest"), Some("b/c"));
    }

    #[test]
    fn duplicate_terminal_is_a_conflict() {
        let mut root = Node::new("/");
        insert(&mut root, "/users/:id");

        let segments = parse_route("/users/:id").unwrap();
        let result = root.insert(&segments, noop(), Delegation::Internal, "/users/:id");
        assert!(matches!(result, Err(RouterError::RouteConflict(_))));
    }

    #[test]
    fn conflicting_param_names_are_rejected() {
        let mut root = Node::new("/");
        insert(&mut root, "/users/:id");

        let segments = parse_route("/users/:name/profile").unwrap();
        let result = root.insert(&segments, noop(), Delegation::Internal, "/users/:name/profile");
        assert!(matches!(result, Err(RouterError::RouteConflict(_))));
    }

    #[test]
    fn trailing_slash_terminals_are_distinct() {
        let mut root = Node::new("/");
        insert(&mut root, "/a/b");
        insert(&mut root, "/a/b/");

        let mut params = PathParams::new();
        assert!(find(&root, "/a/b", &mut params).is_some());
        assert!(find(&root, "/a/b/", &mut params).is_some());
    }
}
