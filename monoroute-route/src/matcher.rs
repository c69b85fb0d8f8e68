//! The compiled routing table and request-to-route matching algorithm.
//!
//! Grounded in the literal/param router shape of a `matchit`-backed
//! `Router<T>` wrapper, generalized into a hand-rolled trie: a
//! single-best-match router can't report "every subtree ancestor of
//! this path", nor capture a raw (non-percent-decoded) wildcard tail,
//! and the candidate walk here needs both.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use regex::Regex;

use crate::loadbalancer::SharedLoadBalancer;
use crate::model::{Backend, RouteDefinition};
use crate::registry::{Filter, Predicate};

/// A route after compilation: its definition, compiled regexps,
/// instantiated secondary predicates/filters, and priority score.
pub struct CompiledRoute {
    pub def: RouteDefinition,
    pub path_regexps: Vec<Regex>,
    pub host_regexps: Vec<Regex>,
    pub header_regexps: Vec<(String, Vec<Regex>)>,
    pub predicates: Vec<Box<dyn Predicate>>,
    pub filters: Vec<Box<dyn Filter>>,
    pub priority: i64,
    pub backend: Backend,
    pub load_balancer: Option<SharedLoadBalancer>,
}

impl CompiledRoute {
    pub fn id(&self) -> &str {
        &self.def.id
    }
}

#[derive(Default)]
struct TrieNode {
    literal: HashMap<String, TrieNode>,
    param: Option<(String, Box<TrieNode>)>,
    wildcard: Option<(String, Box<TrieNode>)>,
    /// Routes whose exact path ends at this node.
    exact_routes: Vec<Rc<CompiledRoute>>,
    /// Routes whose subtree prefix is rooted at this node.
    subtree_routes: Vec<Rc<CompiledRoute>>,
}

impl TrieNode {
    fn insert_exact(&mut self, segments: &[&str], route: Rc<CompiledRoute>) {
        match segments.split_first() {
            None => self.exact_routes.push(route),
            Some((seg, rest)) => self.child_for_segment(seg).insert_exact(rest, route),
        }
    }

    fn insert_subtree(&mut self, segments: &[&str], route: Rc<CompiledRoute>) {
        match segments.split_first() {
            None => self.subtree_routes.push(route),
            Some((seg, rest)) => self.child_for_segment(seg).insert_subtree(rest, route),
        }
    }

    fn child_for_segment(&mut self, seg: &str) -> &mut TrieNode {
        if let Some(name) = seg.strip_prefix(':') {
            return &mut self
                .param
                .get_or_insert_with(|| (name.to_string(), Box::default()))
                .1;
        }
        if let Some(name) = seg.strip_prefix('*') {
            return &mut self
                .wildcard
                .get_or_insert_with(|| (name.to_string(), Box::default()))
                .1;
        }
        self.literal.entry(seg.to_string()).or_default()
    }
}

/// The compiled, immutable path index plus the catch-all bucket for
/// routes with no path constraint at all.
pub struct RoutingTable {
    root: TrieNode,
    catch_all: Vec<Rc<CompiledRoute>>,
    id_index: HashMap<String, Rc<CompiledRoute>>,
    pub generation: u64,
    pub created_at: Instant,
    pub ready: bool,
}

impl RoutingTable {
    pub fn find_by_id(&self, id: &str) -> Option<&CompiledRoute> {
        self.id_index.get(id).map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.id_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_index.is_empty()
    }
}

/// Candidate ordering class: exact matches outrank subtree matches
/// outrank catch-all routes, no matter the per-route priority; within
/// the subtree class, a deeper prefix outranks a shallower one.
type Rank = (u8, usize);

const RANK_EXACT: Rank = (0, 0);
const RANK_CATCH_ALL: Rank = (2, 0);

fn rank_subtree(depth: usize) -> Rank {
    (1, usize::MAX - depth)
}

/// One candidate produced by the path lookup: the route, its ordering
/// rank, and whatever `:param`/`*wildcard` values its trie path implied.
struct Candidate<'t> {
    route: &'t Rc<CompiledRoute>,
    rank: Rank,
    params: HashMap<String, String>,
}

/// Split a request path into segments, normalizing a single trailing
/// slash away.
fn segments(path: &str) -> Vec<&str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

impl RoutingTable {
    pub fn empty(generation: u64) -> Self {
        Self {
            root: TrieNode::default(),
            catch_all: Vec::new(),
            id_index: HashMap::new(),
            generation,
            created_at: Instant::now(),
            ready: false,
        }
    }

    pub fn builder(generation: u64) -> RoutingTableBuilder {
        RoutingTableBuilder { table: Self::empty(generation) }
    }

    /// Walk the trie collecting every exact match at the full path,
    /// every subtree ancestor along the way, and the catch-all bucket.
    fn collect_candidates(&self, path: &str) -> Vec<Candidate<'_>> {
        let segs = segments(path);
        let mut out: Vec<Candidate<'_>> = Vec::new();

        fn walk<'t>(
            node: &'t TrieNode,
            segs: &[&str],
            depth: usize,
            params: &mut HashMap<String, String>,
            out: &mut Vec<Candidate<'t>>,
        ) {
            for route in &node.subtree_routes {
                out.push(Candidate { route, rank: rank_subtree(depth), params: params.clone() });
            }
            match segs.split_first() {
                None => {
                    for route in &node.exact_routes {
                        out.push(Candidate { route, rank: RANK_EXACT, params: params.clone() });
                    }
                }
                Some((seg, rest)) => {
                    if let Some(child) = node.literal.get(*seg) {
                        walk(child, rest, depth + 1, params, out);
                    }
                    if let Some((name, child)) = &node.param {
                        params.insert(name.clone(), seg.to_string());
                        walk(child, rest, depth + 1, params, out);
                        params.remove(name);
                    }
                    if let Some((name, child)) = &node.wildcard {
                        let tail = std::iter::once(*seg).chain(rest.iter().copied()).collect::<Vec<_>>().join("/");
                        params.insert(name.clone(), tail);
                        walk(child, &[], depth + 1, params, out);
                        params.remove(name);
                    }
                }
            }
        }

        let mut params = HashMap::new();
        walk(&self.root, &segs, 0, &mut params, &mut out);

        for route in &self.catch_all {
            out.push(Candidate { route, rank: RANK_CATCH_ALL, params: HashMap::new() });
        }
        out
    }
}

pub struct RoutingTableBuilder {
    table: RoutingTable,
}

impl RoutingTableBuilder {
    pub fn insert(&mut self, route: Rc<CompiledRoute>) {
        self.table.id_index.insert(route.id().to_string(), route.clone());
        if let Some(path) = route.def.path.clone() {
            let segs = segments(&path);
            self.table.root.insert_exact(&segs, route);
        } else if let Some(prefix) = route.def.path_subtree.clone() {
            let segs = segments(&prefix);
            self.table.root.insert_subtree(&segs, route);
        } else {
            self.table.catch_all.push(route);
        }
    }

    pub fn finish(mut self, ready: bool) -> RoutingTable {
        self.table.ready = ready;
        self.table
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRoute {
    pub route_id: String,
    pub params: HashMap<String, String>,
}

/// The incoming request's matchable attributes.
pub struct MatchInput<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
}

fn normalize_host(host: &str) -> &str {
    host.strip_suffix('.').unwrap_or(host)
}

/// Evaluate one candidate's full predicate check: method, host regexps
/// (any may match), path regexps (all must match), header exact values,
/// header regexps, then every secondary predicate.
fn route_matches(route: &CompiledRoute, input: &MatchInput<'_>, req: &crate::engine::RequestView<'_>) -> bool {
    let def = &route.def;

    if !def.method.is_empty() && def.method != input.method {
        return false;
    }

    if !def.host_regexps.is_empty() {
        let host = normalize_host(input.host);
        if !route.host_regexps.iter().any(|r| r.is_match(host)) {
            return false;
        }
    }

    if !route.path_regexps.iter().all(|r| r.is_match(input.path)) {
        return false;
    }

    for (name, expected) in &def.headers {
        match input.headers.get(name) {
            Some(v) if v.to_str().map(|s| s == expected).unwrap_or(false) => {}
            _ => return false,
        }
    }

    for (name, regexes) in &route.header_regexps {
        let matched = input
            .headers
            .get_all(name.as_str())
            .iter()
            .any(|v| v.to_str().map(|s| regexes.iter().any(|r| r.is_match(s))).unwrap_or(false));
        if !matched {
            return false;
        }
    }

    route.predicates.iter().all(|p| p.matches(req))
}

/// Result of [`match_request`]: the winning route's id and params, plus
/// the set of route ids that shared the leading rank and priority and
/// had to be separated by id order (reported once per table generation
/// by the engine).
pub struct MatchOutcome {
    pub matched: Option<MatchedRoute>,
    pub tie: Option<Vec<String>>,
}

/// Full matching algorithm: candidate assembly (exact, then subtrees
/// deepest-first, then catch-all), descending priority within each rank,
/// id-lexicographic order as the final, deterministic tie-break, and the
/// first candidate whose whole predicate check passes wins.
pub fn match_request(
    table: &RoutingTable,
    input: &MatchInput<'_>,
    req: &crate::engine::RequestView<'_>,
) -> MatchOutcome {
    let mut candidates = table.collect_candidates(input.path);

    candidates.sort_by(|a, b| {
        a.rank
            .cmp(&b.rank)
            .then_with(|| b.route.priority.cmp(&a.route.priority))
            .then_with(|| a.route.id().cmp(b.route.id()))
    });

    // Routes sharing the leading rank and priority are only separable by
    // id; report them so the ambiguity is visible to operators.
    let tie = match candidates.first() {
        Some(first) => {
            let mut ids: Vec<String> = candidates
                .iter()
                .take_while(|c| c.rank == first.rank && c.route.priority == first.route.priority)
                .map(|c| c.route.id().to_string())
                .collect();
            if ids.len() > 1 {
                ids.sort();
                Some(ids)
            } else {
                None
            }
        }
        None => None,
    };

    for candidate in &candidates {
        if route_matches(candidate.route, input, req) {
            return MatchOutcome {
                matched: Some(MatchedRoute {
                    route_id: candidate.route.id().to_string(),
                    params: candidate.params.clone(),
                }),
                tie,
            };
        }
    }

    MatchOutcome { matched: None, tie }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{default_filter_registry, default_predicate_registry};

    fn compile_one(src: &str) -> Rc<CompiledRoute> {
        let nodes = crate::script::parse_routes(src).unwrap();
        let mut counter = 0;
        let def = crate::model::canonicalize(&nodes[0], &mut counter).unwrap();
        let preg = default_predicate_registry();
        let freg = default_filter_registry();
        crate::compiler::compile_route(def, &preg, &freg, &crate::endpoint::EndpointRegistry::new())
            .map(Rc::new)
            .unwrap()
    }

    fn view<'a>(
        method: &'a http::Method,
        uri: &'a http::Uri,
        headers: &'a http::HeaderMap,
        state: &'a monoroute_core::context::state::RequestState,
    ) -> crate::engine::RequestView<'a> {
        crate::engine::RequestView { method, uri, headers, peer_ip: None, state }
    }

    fn match_one(table: &RoutingTable, method: &str, path: &'static str, host: &str) -> MatchOutcome {
        let parsed_method: http::Method = method.parse().unwrap();
        let uri = http::Uri::from_static(path);
        let headers = http::HeaderMap::new();
        let state = monoroute_core::context::state::RequestState::new(host.to_string(), 1);
        let input = MatchInput { method, host, path, headers: &headers };
        match_request(table, &input, &view(&parsed_method, &uri, &headers, &state))
    }

    #[test]
    fn exact_beats_subtree() {
        let exact = compile_one(r#"r1: Path("/a/b") -> "http://exact";"#);
        let subtree = compile_one(r#"r2: PathSubtree("/a") -> "http://sub";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(subtree);
        builder.insert(exact);
        let table = builder.finish(true);

        let outcome = match_one(&table, "GET", "/a/b", "h");
        assert_eq!(outcome.matched.unwrap().route_id, "r1");
    }

    #[test]
    fn exact_beats_subtree_regardless_of_weight() {
        let exact = compile_one(r#"r1: Path("/a/b") -> "http://exact";"#);
        let subtree = compile_one(r#"r2: PathSubtree("/a") && Weight(100) -> "http://sub";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(subtree);
        builder.insert(exact);
        let table = builder.finish(true);

        let outcome = match_one(&table, "GET", "/a/b", "h");
        assert_eq!(outcome.matched.unwrap().route_id, "r1");
    }

    #[test]
    fn deeper_subtree_beats_shallower() {
        let shallow = compile_one(r#"r1: PathSubtree("/a") -> "http://shallow";"#);
        let deep = compile_one(r#"r2: PathSubtree("/a/b") -> "http://deep";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(shallow);
        builder.insert(deep);
        let table = builder.finish(true);

        let outcome = match_one(&table, "GET", "/a/b/c", "h");
        assert_eq!(outcome.matched.unwrap().route_id, "r2");
    }

    #[test]
    fn priority_tie_breaks_by_id_and_is_reported() {
        let r1 = compile_one(r#"r1: Path("/a") -> "http://x";"#);
        let r2 = compile_one(r#"r2: Path("/a") -> "http://y";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(r2);
        builder.insert(r1);
        let table = builder.finish(true);

        let outcome = match_one(&table, "GET", "/a", "h");
        assert_eq!(outcome.matched.unwrap().route_id, "r1");
        assert_eq!(outcome.tie, Some(vec!["r1".to_string(), "r2".to_string()]));
    }

    #[test]
    fn weighted_route_wins_tie() {
        let r1 = compile_one(r#"r1: Path("/a") -> "http://x";"#);
        let r2 = compile_one(r#"r2: Path("/a") && Weight(10) -> "http://y";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(r1);
        builder.insert(r2);
        let table = builder.finish(true);

        let outcome = match_one(&table, "GET", "/a", "h");
        assert_eq!(outcome.matched.unwrap().route_id, "r2");
        assert!(outcome.tie.is_none());
    }

    #[test]
    fn wildcard_captures_joined_remainder() {
        let route = compile_one(r#"r: Path("/files/*rest") -> "http://x";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(route);
        let table = builder.finish(true);

        let outcome = match_one(&table, "GET", "/files/a/b/c", "h");
        let matched = outcome.matched.unwrap();
        assert_eq!(matched.params.get("rest").map(String::as_str), Some("a/b/c"));
    }

    #[test]
    fn param_captures_single_segment() {
        let route = compile_one(r#"r: Path("/users/:id/posts") -> "http://x";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(route);
        let table = builder.finish(true);

        let outcome = match_one(&table, "GET", "/users/42/posts", "h");
        assert_eq!(outcome.matched.unwrap().params.get("id").map(String::as_str), Some("42"));
        assert!(match_one(&table, "GET", "/users/42", "h").matched.is_none());
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let route = compile_one(r#"r: Path("/a/") -> "http://x";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(route);
        let table = builder.finish(true);

        assert!(match_one(&table, "GET", "/a", "h").matched.is_some());
        assert!(match_one(&table, "GET", "/a/", "h").matched.is_some());
    }

    #[test]
    fn host_regexp_or_semantics() {
        let route = compile_one(r#"r: Host(/^a$/) && Host(/^b$/) -> "http://x";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(route);
        let table = builder.finish(true);

        assert!(match_one(&table, "GET", "/", "b").matched.is_some());
        assert!(match_one(&table, "GET", "/", "a").matched.is_some());
        assert!(match_one(&table, "GET", "/", "c").matched.is_none());
    }

    #[test]
    fn trailing_dot_in_host_is_stripped() {
        let route = compile_one(r#"r: Host(/^example\.org$/) -> "http://x";"#);
        let mut builder = RoutingTable::builder(1);
        builder.insert(route);
        let table = builder.finish(true);

        assert!(match_one(&table, "GET", "/", "example.org.").matched.is_some());
    }
}
