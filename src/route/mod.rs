//! Method-keyed route registration and lookup.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use percent_encoding::percent_decode_str;
use tracing::debug;

use crate::context::{HandlersChain, ABORT_INDEX};

pub(crate) mod tree;

use self::tree::{Route, Tree};

/// Captured path parameters, in route order.
#[derive(Clone, Debug, Default)]
pub struct Params {
    items: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Params {
        Params::default()
    }

    pub(crate) fn with_capacity(n: usize) -> Params {
        Params {
            items: Vec::with_capacity(n),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.push((name.into(), value.into()));
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}

/// Outcome of a routing lookup.
pub(crate) struct RouteMatch {
    pub(crate) route: Option<Arc<Route>>,
    pub(crate) values: Vec<String>,
    pub(crate) tsr: bool,
}

/// Per-method radix trees.
pub(crate) struct Router {
    trees: HashMap<Method, Tree>,
    max_params: usize,
}

impl Router {
    pub(crate) fn new() -> Router {
        Router {
            trees: HashMap::new(),
            max_params: 0,
        }
    }

    /// Registers a handler chain. Panics on malformed paths, duplicate
    /// registration, and over-long chains; all registration happens before
    /// startup and fails loudly.
    pub(crate) fn add_route(&mut self, method: Method, path: &str, handlers: HandlersChain) {
        assert!(
            !handlers.is_empty(),
            "route {:?} registered with an empty handler chain",
            path
        );
        assert!(
            (handlers.len() as i64) < ABORT_INDEX as i64,
            "handler chain for {:?} is too long: {} handlers",
            path,
            handlers.len()
        );
        debug!("register {} {}", method, path);
        let tree = self.trees.entry(method).or_insert_with(Tree::new);
        let params = tree.add(path, handlers);
        if params > self.max_params {
            self.max_params = params;
        }
    }

    /// Largest identifier count across all registered paths, used to
    /// pre-size parameter storage.
    pub(crate) fn max_params(&self) -> usize {
        self.max_params
    }

    /// Looks up `path` in the tree for `method`.
    ///
    /// `unescape` percent-decodes each captured value individually; values
    /// that fail to decode are left as captured.
    pub(crate) fn find(&self, method: &Method, path: &str) -> RouteMatch {
        match self.trees.get(method) {
            Some(tree) => {
                let found = tree.find(path);
                RouteMatch {
                    route: found.route,
                    values: found.values,
                    tsr: found.tsr,
                }
            }
            None => RouteMatch {
                route: None,
                values: Vec::new(),
                tsr: false,
            },
        }
    }

    /// Fills `params` from a match, decoding values when asked.
    pub(crate) fn capture(
        route: &Route,
        values: Vec<String>,
        unescape: bool,
        params: &mut Params,
    ) {
        params.clear();
        for (name, value) in route.pnames.iter().zip(values) {
            let value = if unescape {
                match percent_decode_str(&value).decode_utf8() {
                    Ok(decoded) => decoded.into_owned(),
                    Err(_) => value,
                }
            } else {
                value
            };
            params.push(name.clone(), value);
        }
    }

    /// Whether any other method's tree would match `path`; drives 405.
    pub(crate) fn allows_other_method(&self, method: &Method, path: &str) -> bool {
        self.trees
            .iter()
            .filter(|(m, _)| *m != method)
            .any(|(_, tree)| tree.find(path).route.is_some())
    }

    pub(crate) fn find_case_insensitive(
        &self,
        method: &Method,
        path: &str,
        fix_trailing_slash: bool,
    ) -> Option<String> {
        self.trees
            .get(method)?
            .find_case_insensitive(path, fix_trailing_slash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_lookup() {
        let mut p = Params::new();
        p.push("id", "42");
        p.push("rest", "a/b");
        assert_eq!(p.get("id"), Some("42"));
        assert_eq!(p.get("rest"), Some("a/b"));
        assert_eq!(p.get("nope"), None);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn find_is_per_method() {
        let mut r = Router::new();
        r.add_route(Method::GET, "/x", vec![crate::context::handler(nop)]);
        assert!(r.find(&Method::GET, "/x").route.is_some());
        assert!(r.find(&Method::POST, "/x").route.is_none());
        assert!(r.allows_other_method(&Method::POST, "/x"));
        assert!(!r.allows_other_method(&Method::GET, "/x"));
    }

    #[test]
    fn capture_unescapes_individually() {
        let mut r = Router::new();
        r.add_route(Method::GET, "/u/:name", vec![crate::context::handler(nop)]);
        let m = r.find(&Method::GET, "/u/a%20b");
        let route = m.route.unwrap();
        let mut params = Params::new();
        Router::capture(&route, m.values.clone(), true, &mut params);
        assert_eq!(params.get("name"), Some("a b"));
        let mut params = Params::new();
        Router::capture(&route, m.values, false, &mut params);
        assert_eq!(params.get("name"), Some("a%20b"));
    }

    #[test]
    fn max_params_tracks_largest_route() {
        let mut r = Router::new();
        r.add_route(Method::GET, "/a/:b", vec![crate::context::handler(nop)]);
        assert_eq!(r.max_params(), 1);
        r.add_route(
            Method::GET,
            "/c/:d/:e/*f",
            vec![crate::context::handler(nop)],
        );
        assert_eq!(r.max_params(), 3);
    }

    fn nop(_cx: &mut crate::context::Context) -> crate::common::BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
