//! The in-memory route definition model: [`RouteDefinition`], its
//! canonicalization, and validation.

use std::collections::BTreeMap;
use std::fmt;

use crate::script::ast::{ArgNode, BackendNode, CallNode, PredicateClause, RouteNode};

/// A named call with positional arguments, used for both predicates and
/// filters once lifted out of the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct PredicateRef {
    pub name: String,
    pub args: Vec<ArgNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterRef {
    pub name: String,
    pub args: Vec<ArgNode>,
}

/// Where a route sends the request: a network URL, a filter-served
/// sink, a matcher re-entry, a filter-chosen URL, or a balanced set.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    Network(String),
    Shunt,
    Loopback,
    Dynamic,
    LoadBalanced { algorithm: String, endpoints: Vec<String>, fade_in_duration_ms: Option<u64> },
}

/// Validation/canonicalization failures, recoverable at the per-route
/// level: the offending route is dropped, the rest of the batch stands.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    MutuallyExclusivePath,
    InvalidRegex { pattern: String, detail: String },
    MalformedBackendUrl(String),
    InvalidAlgorithm(String),
    EmptyEndpointList,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::MutuallyExclusivePath => {
                write!(f, "route has both path and path_subtree, or conflicting Path/PathSubtree predicates")
            }
            ModelError::InvalidRegex { pattern, detail } => {
                write!(f, "invalid regex {pattern:?}: {detail}")
            }
            ModelError::MalformedBackendUrl(u) => write!(f, "malformed backend url: {u}"),
            ModelError::InvalidAlgorithm(a) => write!(f, "invalid load-balancer algorithm: {a}"),
            ModelError::EmptyEndpointList => write!(f, "load-balanced backend has no endpoints"),
        }
    }
}

impl std::error::Error for ModelError {}

/// The canonicalized, immutable route record.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDefinition {
    pub id: String,
    pub predicates: Vec<PredicateRef>,
    pub path: Option<String>,
    pub path_subtree: Option<String>,
    pub path_regexps: Vec<String>,
    pub host_regexps: Vec<String>,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub header_regexps: BTreeMap<String, Vec<String>>,
    pub filters: Vec<FilterRef>,
    pub backend: Backend,
    pub weight: i64,
}

fn arg_as_string(arg: &ArgNode) -> Option<String> {
    match arg {
        ArgNode::String(s) => Some(s.clone()),
        ArgNode::Regex(r) => Some(r.clone()),
        ArgNode::Number(n) => Some(n.to_string()),
    }
}

fn next_auto_id(counter: &mut u64) -> String {
    *counter += 1;
    format!("_auto{counter}")
}

/// Turn a parsed [`RouteNode`] into a canonical [`RouteDefinition`],
/// lifting `Path`/`PathSubtree` predicate refs into their dedicated
/// fields, uppercasing the method, case-folding header names, and
/// sorting non-order-sensitive sets.
pub fn canonicalize(node: &RouteNode, auto_id_counter: &mut u64) -> Result<RouteDefinition, ModelError> {
    let id = node.id.clone().unwrap_or_else(|| next_auto_id(auto_id_counter));

    let mut predicates = Vec::new();
    let mut path: Option<String> = None;
    let mut path_subtree: Option<String> = None;
    let mut path_regexps = Vec::new();
    let mut host_regexps = Vec::new();
    let mut method = String::new();
    let mut headers = BTreeMap::new();
    let mut header_regexps: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut weight = 0i64;

    let calls: &[CallNode] = match &node.predicates {
        PredicateClause::Any => &[],
        PredicateClause::All(calls) => calls,
    };

    for call in calls {
        match call.name.as_str() {
            "Path" => {
                let p = call.args.first().and_then(arg_as_string).unwrap_or_default();
                if path.is_some() || path_subtree.is_some() {
                    return Err(ModelError::MutuallyExclusivePath);
                }
                path = Some(p);
            }
            "PathSubtree" => {
                let p = call.args.first().and_then(arg_as_string).unwrap_or_default();
                if path.is_some() || path_subtree.is_some() {
                    return Err(ModelError::MutuallyExclusivePath);
                }
                path_subtree = Some(p);
            }
            "PathRegexp" => {
                if let Some(r) = call.args.first().and_then(arg_as_string) {
                    validate_regex(&r)?;
                    path_regexps.push(r);
                }
            }
            "Host" => {
                if let Some(r) = call.args.first().and_then(arg_as_string) {
                    validate_regex(&r)?;
                    host_regexps.push(r);
                }
            }
            "Method" => {
                if let Some(m) = call.args.first().and_then(arg_as_string) {
                    method = m.to_uppercase();
                }
            }
            "Header" => {
                if let (Some(name), Some(value)) =
                    (call.args.first().and_then(arg_as_string), call.args.get(1).and_then(arg_as_string))
                {
                    headers.insert(name.to_lowercase(), value);
                }
            }
            "HeaderRegexp" => {
                if let (Some(name), Some(pattern)) =
                    (call.args.first().and_then(arg_as_string), call.args.get(1).and_then(arg_as_string))
                {
                    validate_regex(&pattern)?;
                    header_regexps.entry(name.to_lowercase()).or_default().push(pattern);
                }
            }
            "Weight" => {
                if let Some(ArgNode::Number(n)) = call.args.first() {
                    weight = *n as i64;
                }
            }
            _ => predicates.push(PredicateRef { name: call.name.clone(), args: call.args.clone() }),
        }
    }

    if path.is_some() && path_subtree.is_some() {
        return Err(ModelError::MutuallyExclusivePath);
    }

    path_regexps.sort();
    path_regexps.dedup();
    host_regexps.sort();
    host_regexps.dedup();
    for list in header_regexps.values_mut() {
        list.sort();
        list.dedup();
    }

    let filters = node
        .filters
        .iter()
        .map(|c| FilterRef { name: c.name.clone(), args: c.args.clone() })
        .collect();

    let backend = canonicalize_backend(&node.backend)?;

    Ok(RouteDefinition {
        id,
        predicates,
        path,
        path_subtree,
        path_regexps,
        host_regexps,
        method,
        headers,
        header_regexps,
        filters,
        backend,
        weight,
    })
}

fn validate_regex(pattern: &str) -> Result<(), ModelError> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| ModelError::InvalidRegex { pattern: pattern.to_string(), detail: e.to_string() })
}

fn canonicalize_backend(node: &BackendNode) -> Result<Backend, ModelError> {
    match node {
        BackendNode::Network(url) => {
            if url.is_empty() {
                return Err(ModelError::MalformedBackendUrl(url.clone()));
            }
            Ok(Backend::Network(url.clone()))
        }
        BackendNode::Shunt => Ok(Backend::Shunt),
        BackendNode::Loopback => Ok(Backend::Loopback),
        BackendNode::Dynamic => Ok(Backend::Dynamic),
        BackendNode::LoadBalanced { algorithm, endpoints } => {
            if endpoints.is_empty() {
                return Err(ModelError::EmptyEndpointList);
            }
            if !crate::loadbalancer::is_known_algorithm(algorithm) {
                return Err(ModelError::InvalidAlgorithm(algorithm.clone()));
            }
            Ok(Backend::LoadBalanced {
                algorithm: algorithm.clone(),
                endpoints: endpoints.clone(),
                fade_in_duration_ms: None,
            })
        }
    }
}

impl RouteDefinition {
    /// Structural equality ignoring `id`, used to detect duplicate
    /// definitions after canonicalization.
    pub fn eq_ignoring_id(&self, other: &RouteDefinition) -> bool {
        self.predicates == other.predicates
            && self.path == other.path
            && self.path_subtree == other.path_subtree
            && self.path_regexps == other.path_regexps
            && self.host_regexps == other.host_regexps
            && self.method == other.method
            && self.headers == other.headers
            && self.header_regexps == other.header_regexps
            && self.filters == other.filters
            && self.backend == other.backend
            && self.weight == other.weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse_routes;

    #[test]
    fn lifts_path_predicate_into_dedicated_field() {
        let nodes = parse_routes(r#"r: Path("/a") -> "http://x";"#).unwrap();
        let mut counter = 0;
        let def = canonicalize(&nodes[0], &mut counter).unwrap();
        assert_eq!(def.path.as_deref(), Some("/a"));
        assert!(def.predicates.is_empty());
    }

    #[test]
    fn rejects_conflicting_path_forms() {
        let nodes = parse_routes(r#"r: Path("/a") && PathSubtree("/b") -> "http://x";"#).unwrap();
        let mut counter = 0;
        assert_eq!(canonicalize(&nodes[0], &mut counter), Err(ModelError::MutuallyExclusivePath));
    }

    #[test]
    fn uppercases_method_and_lowercases_header_name() {
        let nodes = parse_routes(r#"r: Method("get") && Header("X-Foo", "bar") -> "http://x";"#).unwrap();
        let mut counter = 0;
        let def = canonicalize(&nodes[0], &mut counter).unwrap();
        assert_eq!(def.method, "GET");
        assert_eq!(def.headers.get("x-foo").map(String::as_str), Some("bar"));
    }

    #[test]
    fn auto_generates_missing_id() {
        let nodes = parse_routes(r#"* -> <shunt>;"#).unwrap();
        let mut counter = 0;
        let def = canonicalize(&nodes[0], &mut counter).unwrap();
        assert!(!def.id.is_empty());
    }
}
