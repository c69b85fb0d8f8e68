//! Route compiler: turns a slice of [`RouteDefinition`] into a
//! matcher-ready [`RoutingTable`] plus per-route diagnostics.

use std::rc::Rc;

use regex::Regex;

use crate::diagnostics::Diagnostic;
use crate::endpoint::EndpointRegistry;
use crate::loadbalancer::{Algorithm, FadeIn, LoadBalancer};
use crate::matcher::{CompiledRoute, RoutingTable};
use crate::model::{Backend, RouteDefinition};
use crate::registry::{instantiate_filter, instantiate_predicate, FilterRegistry, PredicateRegistry, SpecError};
use crate::script::ast::ArgNode;

pub struct CompileResult {
    pub table: RoutingTable,
    pub diagnostics: Vec<Diagnostic>,
}

/// A pure rewrite pass over the merged route list, run in order before
/// per-route compilation. The list is chosen by whoever constructs the
/// controller.
pub type Postprocessor = fn(Vec<RouteDefinition>) -> Vec<RouteDefinition>;

pub fn default_postprocessors() -> Vec<Postprocessor> {
    vec![dedup_by_canonical_form]
}

/// A route's traffic share is fully carried by its own
/// `Traffic`/`TrafficSegment` predicate in this grammar, so there are no
/// sibling-count hints to expand into duplicated variants; the pass is
/// kept as a named stage so a grammar that grows such hints has an
/// obvious place to put the rewrite.
fn expand_traffic(defs: Vec<RouteDefinition>) -> Vec<RouteDefinition> {
    defs
}

/// Drop exact structural duplicates (ignoring id) introduced by merging
/// multiple data clients.
pub fn dedup_by_canonical_form(defs: Vec<RouteDefinition>) -> Vec<RouteDefinition> {
    let mut out: Vec<RouteDefinition> = Vec::with_capacity(defs.len());
    for def in defs {
        if !out.iter().any(|existing| existing.eq_ignoring_id(&def)) {
            out.push(def);
        }
    }
    out
}

fn compile_regexes(patterns: &[String]) -> Result<Vec<Regex>, SpecError> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| SpecError(format!("invalid regex {p:?}: {e}"))))
        .collect()
}

/// Compile one definition into a matcher-ready [`CompiledRoute`]: regex
/// compilation, secondary predicate/filter instantiation, priority
/// computation, and load-balancer construction.
pub fn compile_route(
    def: RouteDefinition,
    predicates: &PredicateRegistry,
    filters: &FilterRegistry,
    endpoints: &EndpointRegistry,
) -> Result<CompiledRoute, SpecError> {
    let path_regexps = compile_regexes(&def.path_regexps)?;
    let host_regexps = compile_regexes(&def.host_regexps)?;
    let mut header_regexps = Vec::new();
    for (name, patterns) in &def.header_regexps {
        header_regexps.push((name.clone(), compile_regexes(patterns)?));
    }

    let mut priority = def.weight;
    let mut instantiated_predicates = Vec::new();
    for p in &def.predicates {
        // Script-sourced definitions fold Weight into `def.weight` during
        // canonicalization; definitions built directly by a data client
        // may still carry it as a plain predicate ref.
        if p.name == "Weight" {
            if let Some(ArgNode::Number(n)) = p.args.first() {
                priority += *n as i64;
            }
            continue;
        }
        let (predicate, weight) = instantiate_predicate(predicates, p)?;
        priority += weight;
        instantiated_predicates.push(predicate);
    }

    let mut instantiated_filters = Vec::new();
    for f in &def.filters {
        instantiated_filters.push(instantiate_filter(filters, f)?);
    }

    let load_balancer = match &def.backend {
        Backend::LoadBalanced { algorithm, endpoints: urls, fade_in_duration_ms } => {
            let algo = Algorithm::parse(algorithm)
                .ok_or_else(|| SpecError(format!("unknown load-balancer algorithm: {algorithm}")))?;
            let fade_in = fade_in_duration_ms.map(|ms| FadeIn { duration_ms: ms, exponent: 1.0 });
            Some(Rc::new(LoadBalancer::new(algo, urls.clone(), fade_in, endpoints.clone())))
        }
        Backend::Network(url) => {
            endpoints.observe(&crate::endpoint::endpoint_key(url));
            None
        }
        _ => None,
    };

    let backend = def.backend.clone();

    Ok(CompiledRoute {
        def,
        path_regexps,
        host_regexps,
        header_regexps,
        predicates: instantiated_predicates,
        filters: instantiated_filters,
        priority,
        backend,
        load_balancer,
    })
}

/// Compile a full merged route slice into a [`RoutingTable`]. Per-route
/// failures are dropped and surfaced as compile-error diagnostics; the
/// remaining routes still make it into the table.
pub fn compile(
    defs: Vec<RouteDefinition>,
    predicates: &PredicateRegistry,
    filters: &FilterRegistry,
    endpoints: &EndpointRegistry,
    postprocessors: &[Postprocessor],
    generation: u64,
) -> CompileResult {
    let mut defs = expand_traffic(defs);
    for postprocess in postprocessors {
        defs = postprocess(defs);
    }

    let mut diagnostics = Vec::new();
    let mut builder = RoutingTable::builder(generation);

    for def in defs {
        let id = def.id.clone();
        match compile_route(def, predicates, filters, endpoints) {
            Ok(route) => builder.insert(Rc::new(route)),
            Err(e) => diagnostics.push(Diagnostic::compile_error(id, e.to_string())),
        }
    }

    CompileResult { table: builder.finish(true), diagnostics }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{default_filter_registry, default_predicate_registry};

    fn canonicalize_all(src: &str) -> Vec<RouteDefinition> {
        let nodes = crate::script::parse_routes(src).unwrap();
        let mut counter = 0;
        nodes.iter().map(|n| crate::model::canonicalize(n, &mut counter).unwrap()).collect()
    }

    fn compile_all(defs: Vec<RouteDefinition>, generation: u64) -> CompileResult {
        let preg = default_predicate_registry();
        let freg = default_filter_registry();
        let endpoints = EndpointRegistry::new();
        compile(defs, &preg, &freg, &endpoints, &default_postprocessors(), generation)
    }

    #[test]
    fn drops_route_with_unknown_predicate_but_keeps_others() {
        let defs = canonicalize_all(
            r#"
            r1: TotallyUnknownPredicate("x") -> "http://a";
            r2: Path("/ok") -> "http://b";
            "#,
        );
        let result = compile_all(defs, 1);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.table.len(), 1);
        assert!(result.table.find_by_id("r2").is_some());
    }

    #[test]
    fn drops_route_with_invalid_regex_but_keeps_others() {
        // A broken pattern in a script is refused at canonicalization; a
        // definition built directly by a data client takes the compile
        // path instead.
        let defs = canonicalize_all(r#"r2: Path("/ok") -> "http://b";"#);
        let mut direct = defs[0].clone();
        direct.id = "r1".to_string();
        direct.path = None;
        direct.path_regexps = vec!["(unclosed".to_string()];
        let result = compile_all(vec![direct, defs[0].clone()], 1);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.table.len(), 1);
        assert!(result.table.find_by_id("r2").is_some());
    }

    #[test]
    fn dedups_structurally_identical_routes() {
        let defs = canonicalize_all(
            r#"
            r1: Path("/a") -> "http://x";
            r2: Path("/a") -> "http://x";
            "#,
        );
        let result = compile_all(defs, 1);
        assert_eq!(result.table.len(), 1);
    }

    #[test]
    fn weight_ref_contributes_to_priority_without_canonicalization() {
        let mut defs = canonicalize_all(r#"r1: Path("/a") -> "http://x";"#);
        defs[0].predicates.push(crate::model::PredicateRef {
            name: "Weight".to_string(),
            args: vec![ArgNode::Number(7.0)],
        });
        let result = compile_all(defs, 1);
        assert_eq!(result.table.find_by_id("r1").unwrap().priority, 7);
    }

    #[test]
    fn deterministic_compile_yields_same_route_count() {
        let defs1 = canonicalize_all(r#"r: Path("/a") -> "http://x";"#);
        let defs2 = canonicalize_all(r#"r: Path("/a") -> "http://x";"#);
        let r1 = compile_all(defs1, 1);
        let r2 = compile_all(defs2, 2);
        assert_eq!(r1.table.len(), r2.table.len());
    }
}
