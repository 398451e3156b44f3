//! Defines a hierarchical route tree with one root per HTTP method.

pub(crate) mod node;
pub mod segment;

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::error::RouterError;
use crate::handler::Handler;
use crate::router::tree::node::{Delegation, Node};
use crate::router::tree::segment::{parse_route, PathParams, RouteSegment};

/// A tree of routable nodes for a single HTTP method, plus an index of its
/// fully-static paths used by the case-insensitive fixed-path redirect.
pub(crate) struct Tree {
    root: Node,
    /// Case-folded full path → canonical path. `None` marks a case-folded
    /// collision between distinct registrations, which disables the redirect
    /// for that key rather than choosing nondeterministically.
    static_index: HashMap<String, Option<String>>,
}

impl Tree {
    pub(crate) fn new() -> Self {
        trace!(" creating new tree");
        Tree {
            root: Node::new("/"),
            static_index: HashMap::new(),
        }
    }

    /// Registers a terminal for `path`.
    pub(crate) fn add_route(
        &mut self,
        path: &str,
        handler: Arc<dyn Handler>,
        delegation: Delegation,
    ) -> Result<(), RouterError> {
        let segments = parse_route(path)?;
        self.root.insert(&segments, handler, delegation, path)?;

        let fully_static = segments
            .iter()
            .all(|s| matches!(s, RouteSegment::Static(_)));
        if fully_static && delegation == Delegation::Internal {
            self.index_static_path(path);
        }

        Ok(())
    }

    fn index_static_path(&mut self, path: &str) {
        let key = path.to_lowercase();
        match self.static_index.get_mut(&key) {
            Some(existing) => {
                if existing.as_deref() != Some(path) {
                    // Two registrations differ only in case; poison the key.
                    *existing = None;
                }
            }
            None => {
                self.static_index.insert(key, Some(path.to_string()));
            }
        }
    }

    /// Attempts to locate a terminal matching the request path segments.
    pub(crate) fn find<'a>(
        &'a self,
        segments: &[String],
        params: &mut PathParams,
    ) -> Option<(&'a Node, usize)> {
        self.root.find(segments, params)
    }

    /// True when some terminal (of any delegation) matches `segments`.
    /// Captures are discarded; used by the redirect and 405 probes.
    pub(crate) fn matches(&self, segments: &[String]) -> bool {
        let mut scratch = PathParams::new();
        self.root.find(segments, &mut scratch).is_some()
    }

    /// The canonical-case path registered for the case-folded form of
    /// `path`, unless the folded form is ambiguous.
    pub(crate) fn canonical_case(&self, path: &str) -> Option<&str> {
        self.static_index
            .get(&path.to_lowercase())
            .and_then(|canonical| canonical.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::helpers::http::request::path::RequestPathSegments;
    use crate::state::State;

    fn noop() -> Arc<dyn Handler> {
        fn handler(state: State) -> (State, hyper::Response<hyper::Body>) {
            (state, hyper::Response::new(hyper::Body::empty()))
        }
        Arc::new(handler)
    }

    #[test]
    fn static_index_tracks_canonical_case() {
        let mut tree = Tree::new();
        tree.add_route("/Widgets/Recent", noop(), Delegation::Internal)
            .unwrap();

        assert_eq!(tree.canonical_case("/widgets/RECENT"), Some("/Widgets/Recent"));
        assert_eq!(tree.canonical_case("/widgets/missing"), None);
    }

    #[test]
    fn case_folded_collisions_are_poisoned() {
        let mut tree = Tree::new();
        tree.add_route("/events", noop(), Delegation::Internal).unwrap();
        tree.add_route("/Events", noop(), Delegation::Internal).unwrap();

        assert_eq!(tree.canonical_case("/EVENTS"), None);
    }

    #[test]
    fn param_routes_are_not_indexed() {
        let mut tree = Tree::new();
        tree.add_route("/users/:id", noop(), Delegation::Internal)
            .unwrap();

        assert_eq!(tree.canonical_case("/users/:id"), None);

        let rps = RequestPathSegments::new("/users/7");
        assert!(tree.matches(rps.segments()));
    }
}
