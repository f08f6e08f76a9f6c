//! Radix tree for route lookup.
//!
//! Paths are stored byte-compressed: sibling static nodes share no first
//! byte, and inserting a diverging path splits the node at the common
//! prefix. Dynamic segments hang off their parent separately — one optional
//! param child (`:name`, one segment) and one optional catch-all child
//! (`*name`, the terminal remainder). Lookup prefers static children, then
//! param, then catch-all, backtracking with captured values rewound on a
//! dead end.

use std::sync::Arc;

use crate::context::HandlersChain;

/// A registered route stored at a leaf.
pub(crate) struct Route {
    pub(crate) handlers: HandlersChain,
    pub(crate) full_path: String,
    /// Identifier names in the order their values are captured.
    pub(crate) pnames: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Static,
    Param,
    CatchAll,
}

pub(crate) struct Node {
    kind: NodeKind,
    prefix: String,
    children: Vec<Node>,
    param_child: Option<Box<Node>>,
    any_child: Option<Box<Node>>,
    route: Option<Arc<Route>>,
}

/// The result of a lookup.
pub(crate) struct Found {
    pub(crate) route: Option<Arc<Route>>,
    /// Captured parameter values, in capture order.
    pub(crate) values: Vec<String>,
    /// Set when the path differs from a registered route only by a
    /// trailing slash.
    pub(crate) tsr: bool,
}

impl Node {
    pub(crate) fn root() -> Node {
        Node::new(NodeKind::Static, "/")
    }

    fn new(kind: NodeKind, prefix: &str) -> Node {
        Node {
            kind,
            prefix: prefix.to_owned(),
            children: Vec::new(),
            param_child: None,
            any_child: None,
            route: None,
        }
    }

    fn label(&self) -> u8 {
        self.prefix.as_bytes().first().copied().unwrap_or(0)
    }

    fn is_leaf(&self) -> bool {
        self.route.is_some()
    }

    fn static_child(&self, label: u8) -> Option<&Node> {
        self.children.iter().find(|c| c.label() == label)
    }

    /// Splits this static node at `at`, pushing the remainder (with every
    /// child and the route) down into a new single child.
    fn split(&mut self, at: usize) {
        debug_assert_eq!(self.kind, NodeKind::Static);
        debug_assert!(at < self.prefix.len());
        let rest = self.prefix.split_off(at);
        let child = Node {
            kind: NodeKind::Static,
            prefix: rest,
            children: std::mem::take(&mut self.children),
            param_child: self.param_child.take(),
            any_child: self.any_child.take(),
            route: self.route.take(),
        };
        self.children.push(child);
    }

    /// Walks/creates static nodes until `search` is fully consumed, and
    /// returns the node it ends on.
    fn insert_static<'a>(self: &'a mut Node, mut search: &str) -> &'a mut Node {
        let mut node = self;
        loop {
            if search.is_empty() {
                return node;
            }
            let label = search.as_bytes()[0];
            let pos = node.children.iter().position(|c| c.label() == label);
            match pos {
                None => {
                    node.children.push(Node::new(NodeKind::Static, search));
                    let last = node.children.len() - 1;
                    return &mut node.children[last];
                }
                Some(i) => {
                    let lcp = common_prefix_len(search, &node.children[i].prefix);
                    if lcp < node.children[i].prefix.len() {
                        node.children[i].split(lcp);
                    }
                    search = &search[lcp..];
                    node = &mut node.children[i];
                }
            }
        }
    }

    fn param_child_mut(&mut self) -> &mut Node {
        self.param_child
            .get_or_insert_with(|| Box::new(Node::new(NodeKind::Param, ":")))
    }

    fn any_child_mut(&mut self) -> &mut Node {
        self.any_child
            .get_or_insert_with(|| Box::new(Node::new(NodeKind::CatchAll, "*")))
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    let max = std::cmp::min(a.len(), b.len());
    let mut i = 0;
    let (a, b) = (a.as_bytes(), b.as_bytes());
    while i < max && a[i] == b[i] {
        i += 1;
    }
    i
}

/// A tokenized registration path.
enum Part {
    Static(String),
    Param(String),
    CatchAll(String),
}

/// Validates a registration path and breaks it into parts.
///
/// Panics on malformed paths; route registration is a startup-time
/// programming action and fails loudly.
fn tokenize(path: &str) -> Vec<Part> {
    assert!(!path.is_empty(), "path must not be empty");
    assert!(
        path.starts_with('/'),
        "path must begin with '/' in path {:?}",
        path
    );
    let mut parts = Vec::new();
    let mut rest = path;
    while let Some(pos) = rest.find([':', '*']) {
        let (head, tail) = rest.split_at(pos);
        assert!(
            head.ends_with('/') || head.is_empty(),
            "wildcards must be a full path segment in path {:?}",
            path
        );
        if !head.is_empty() {
            parts.push(Part::Static(head.to_owned()));
        }
        let marker = tail.as_bytes()[0];
        let name_end = tail[1..]
            .find('/')
            .map(|i| i + 1)
            .unwrap_or(tail.len());
        let name = &tail[1..name_end];
        assert!(
            !name.is_empty(),
            "wildcards must be named with a non-empty name in path {:?}",
            path
        );
        assert!(
            !name.contains([':', '*']),
            "only one wildcard per path segment is allowed in path {:?}",
            path
        );
        if marker == b'*' {
            assert!(
                name_end == tail.len(),
                "catch-all routes are only allowed at the end of the path in path {:?}",
                path
            );
            parts.push(Part::CatchAll(name.to_owned()));
            return parts;
        }
        parts.push(Part::Param(name.to_owned()));
        rest = &tail[name_end..];
    }
    if !rest.is_empty() {
        parts.push(Part::Static(rest.to_owned()));
    }
    parts
}

pub(crate) struct Tree {
    root: Node,
}

impl Tree {
    pub(crate) fn new() -> Tree {
        Tree { root: Node::root() }
    }

    /// Registers `path`, panicking on conflicts.
    ///
    /// Returns the number of identifiers in the path.
    pub(crate) fn add(&mut self, path: &str, handlers: HandlersChain) -> usize {
        let parts = tokenize(path);
        let mut pnames = Vec::new();
        let mut node = &mut self.root;
        // The root's "/" is the first byte of every path.
        let mut first_static_seen = false;
        for part in parts {
            match part {
                Part::Static(s) => {
                    let search = if !first_static_seen {
                        first_static_seen = true;
                        debug_assert!(s.starts_with('/'));
                        &s[1..]
                    } else {
                        &s[..]
                    };
                    node = node.insert_static(search);
                }
                Part::Param(name) => {
                    assert!(
                        !pnames.contains(&name),
                        "duplicate parameter name {:?} in path {:?}",
                        name,
                        path
                    );
                    pnames.push(name);
                    node = node.param_child_mut();
                }
                Part::CatchAll(name) => {
                    pnames.push(name);
                    node = node.any_child_mut();
                }
            }
        }
        if node.is_leaf() {
            panic!("handlers are already registered for path {:?}", path);
        }
        let count = pnames.len();
        node.route = Some(Arc::new(Route {
            handlers,
            full_path: path.to_owned(),
            pnames,
        }));
        count
    }

    /// Looks up `path`, capturing parameter values in order.
    pub(crate) fn find(&self, path: &str) -> Found {
        let mut found = Found {
            route: None,
            values: Vec::new(),
            tsr: false,
        };
        let rest = match path.strip_prefix('/') {
            Some(rest) => rest,
            None => return found,
        };
        let mut tsr = false;
        let node = descend(&self.root, rest, &mut found.values, &mut tsr);
        found.tsr = tsr;
        if let Some(node) = node {
            found.route = node.route.clone();
        }
        found
    }

    /// Case-insensitive descent returning the registered path's canonical
    /// casing, optionally fixing a trailing slash difference.
    pub(crate) fn find_case_insensitive(
        &self,
        path: &str,
        fix_trailing_slash: bool,
    ) -> Option<String> {
        let rest = path.strip_prefix('/')?;
        let mut out = String::with_capacity(path.len());
        out.push('/');
        if ci_descend(&self.root, rest, &mut out, fix_trailing_slash) {
            Some(out)
        } else {
            None
        }
    }
}

/// Core lookup: `rest` is the path remaining after `node`'s prefix.
///
/// Priority at each step is static child, then param, then catch-all;
/// captured values are rewound when an arm dead-ends.
fn descend<'a>(
    node: &'a Node,
    rest: &str,
    values: &mut Vec<String>,
    tsr: &mut bool,
) -> Option<&'a Node> {
    if rest.is_empty() {
        if node.is_leaf() {
            return Some(node);
        }
        // Registered "/x/" requested "/x".
        if let Some(slash) = node.static_child(b'/') {
            if slash.prefix == "/" && slash.is_leaf() {
                *tsr = true;
            }
        }
        if let Some(any) = &node.any_child {
            values.push(String::new());
            return Some(any);
        }
        return None;
    }

    if let Some(child) = node.static_child(rest.as_bytes()[0]) {
        if let Some(rem) = rest.strip_prefix(child.prefix.as_str()) {
            let saved = values.len();
            if let Some(hit) = descend(child, rem, values, tsr) {
                return Some(hit);
            }
            values.truncate(saved);
        } else if child.is_leaf()
            && child.prefix.len() == rest.len() + 1
            && child.prefix.ends_with('/')
            && child.prefix.as_bytes().starts_with(rest.as_bytes())
        {
            // Registered "/x/" requested "/x", undivided node.
            *tsr = true;
        }
    }

    // Registered "/x" requested "/x/".
    if rest == "/" && node.is_leaf() {
        *tsr = true;
    }

    if let Some(param) = &node.param_child {
        let seg_end = rest.find('/').unwrap_or(rest.len());
        if seg_end > 0 {
            let saved = values.len();
            values.push(rest[..seg_end].to_owned());
            if let Some(hit) = descend(param, &rest[seg_end..], values, tsr) {
                return Some(hit);
            }
            values.truncate(saved);
        }
    }

    if let Some(any) = &node.any_child {
        values.push(rest.to_owned());
        return Some(any);
    }

    None
}

fn ci_eq(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}

/// Byte length of the prefix of `rest` spanning as many chars as `prefix`.
fn ci_take(prefix: &str, rest: &str) -> Option<usize> {
    let want = prefix.chars().count();
    let mut len = 0;
    let mut seen = 0;
    for c in rest.chars() {
        if seen == want {
            break;
        }
        len += c.len_utf8();
        seen += 1;
    }
    if seen == want {
        Some(len)
    } else {
        None
    }
}

fn ci_descend(node: &Node, rest: &str, out: &mut String, fix_ts: bool) -> bool {
    if rest.is_empty() {
        if node.is_leaf() {
            return true;
        }
        if fix_ts {
            if let Some(slash) = node.static_child(b'/') {
                if slash.prefix == "/" && slash.is_leaf() {
                    out.push('/');
                    return true;
                }
            }
        }
        return false;
    }

    for child in &node.children {
        if let Some(take) = ci_take(&child.prefix, rest) {
            if ci_eq(&child.prefix, &rest[..take]) {
                let mark = out.len();
                out.push_str(&child.prefix);
                if ci_descend(child, &rest[take..], out, fix_ts) {
                    return true;
                }
                out.truncate(mark);
            }
        }
    }

    if fix_ts && rest == "/" && node.is_leaf() {
        return true;
    }

    if let Some(param) = &node.param_child {
        let seg_end = rest.find('/').unwrap_or(rest.len());
        if seg_end > 0 {
            let mark = out.len();
            out.push_str(&rest[..seg_end]);
            if ci_descend(param, &rest[seg_end..], out, fix_ts) {
                return true;
            }
            out.truncate(mark);
        }
    }

    if let Some(_any) = &node.any_child {
        out.push_str(rest);
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> HandlersChain {
        Vec::new()
    }

    fn assert_match(tree: &Tree, path: &str, full_path: &str, params: &[&str]) {
        let found = tree.find(path);
        let route = found
            .route
            .unwrap_or_else(|| panic!("expected {:?} to match", path));
        assert_eq!(route.full_path, full_path);
        assert_eq!(found.values, params);
    }

    #[test]
    fn static_routes_match_verbatim() {
        let mut tree = Tree::new();
        tree.add("/", chain());
        tree.add("/test", chain());
        tree.add("/team", chain());
        tree.add("/testify", chain());
        assert_match(&tree, "/", "/", &[]);
        assert_match(&tree, "/test", "/test", &[]);
        assert_match(&tree, "/team", "/team", &[]);
        assert_match(&tree, "/testify", "/testify", &[]);
        assert!(tree.find("/tea").route.is_none());
    }

    #[test]
    fn param_capture() {
        let mut tree = Tree::new();
        tree.add("/user/:id", chain());
        assert_match(&tree, "/user/42", "/user/:id", &["42"]);
        assert!(tree.find("/user/").route.is_none(), "empty params disallowed");
        assert!(tree.find("/user/42/x").route.is_none());
    }

    #[test]
    fn multi_param_capture_in_order() {
        let mut tree = Tree::new();
        tree.add("/hey/:user/:dept", chain());
        let found = tree.find("/hey/dy/eng");
        let route = found.route.unwrap();
        assert_eq!(route.pnames, ["user", "dept"]);
        assert_eq!(found.values, ["dy", "eng"]);
    }

    #[test]
    fn catch_all_consumes_remainder() {
        let mut tree = Tree::new();
        tree.add("/user/:name/*action", chain());
        let found = tree.find("/user/alice/read/chapter2");
        assert!(found.route.is_some());
        assert_eq!(found.values, ["alice", "read/chapter2"]);
    }

    #[test]
    fn static_wins_over_param() {
        let mut tree = Tree::new();
        tree.add("/user/:id", chain());
        tree.add("/user/me", chain());
        assert_match(&tree, "/user/me", "/user/me", &[]);
        assert_match(&tree, "/user/you", "/user/:id", &["you"]);
    }

    #[test]
    fn param_wins_over_catch_all() {
        let mut tree = Tree::new();
        tree.add("/files/*path", chain());
        tree.add("/files/:name", chain());
        assert_match(&tree, "/files/a", "/files/:name", &["a"]);
        assert_match(&tree, "/files/a/b", "/files/*path", &["a/b"]);
    }

    #[test]
    fn backtracks_out_of_static_into_param() {
        let mut tree = Tree::new();
        tree.add("/users/new", chain());
        tree.add("/users/:id", chain());
        // "ne" matches into the static "new" arm, then dead-ends and must
        // rewind into the param arm.
        assert_match(&tree, "/users/ne", "/users/:id", &["ne"]);
        assert_match(&tree, "/users/newer", "/users/:id", &["newer"]);
    }

    #[test]
    fn trailing_slash_hints() {
        let mut tree = Tree::new();
        tree.add("/foo", chain());
        tree.add("/bar/", chain());

        let found = tree.find("/foo/");
        assert!(found.route.is_none());
        assert!(found.tsr, "strip-slash hint");

        let found = tree.find("/bar");
        assert!(found.route.is_none());
        assert!(found.tsr, "append-slash hint");

        let found = tree.find("/baz");
        assert!(!found.tsr);
    }

    #[test]
    fn trailing_slash_hint_after_param() {
        let mut tree = Tree::new();
        tree.add("/user/:id", chain());
        let found = tree.find("/user/42/");
        assert!(found.route.is_none());
        assert!(found.tsr);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut tree = Tree::new();
        tree.add("/a/b", chain());
        tree.add("/a/b", chain());
    }

    #[test]
    #[should_panic(expected = "non-empty name")]
    fn unnamed_param_panics() {
        let mut tree = Tree::new();
        tree.add("/a/:", chain());
    }

    #[test]
    #[should_panic(expected = "end of the path")]
    fn interior_catch_all_panics() {
        let mut tree = Tree::new();
        tree.add("/a/*rest/b", chain());
    }

    #[test]
    #[should_panic(expected = "begin with '/'")]
    fn relative_path_panics() {
        let mut tree = Tree::new();
        tree.add("a", chain());
    }

    #[test]
    fn node_split_on_divergence() {
        let mut tree = Tree::new();
        tree.add("/search", chain());
        tree.add("/support", chain());
        tree.add("/sea", chain());
        assert_match(&tree, "/search", "/search", &[]);
        assert_match(&tree, "/support", "/support", &[]);
        assert_match(&tree, "/sea", "/sea", &[]);
        assert!(tree.find("/s").route.is_none());
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut tree = Tree::new();
        tree.add("/HELLO/world", chain());
        let fixed = tree.find_case_insensitive("/hello/WORLD", false);
        assert_eq!(fixed.as_deref(), Some("/HELLO/world"));
    }

    #[test]
    fn case_insensitive_with_trailing_slash_fix() {
        let mut tree = Tree::new();
        tree.add("/Docs/", chain());
        assert_eq!(
            tree.find_case_insensitive("/docs", true).as_deref(),
            Some("/Docs/")
        );
        assert_eq!(tree.find_case_insensitive("/docs", false), None);
    }

    #[test]
    fn case_insensitive_preserves_params() {
        let mut tree = Tree::new();
        tree.add("/User/:id/Posts", chain());
        assert_eq!(
            tree.find_case_insensitive("/user/42/posts", false).as_deref(),
            Some("/User/42/Posts")
        );
    }
}
