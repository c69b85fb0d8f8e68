//! Canonical printer, the inverse of [`super::parser`].

use std::fmt::Write as _;

use super::ast::{ArgNode, BackendNode, CallNode, PredicateClause, RouteNode};

#[derive(Debug, Clone, Copy, Default)]
pub struct PrintOptions {
    pub pretty: bool,
}

fn write_args(out: &mut String, args: &[ArgNode]) {
    out.push('(');
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{a}");
    }
    out.push(')');
}

fn write_call(out: &mut String, call: &CallNode) {
    out.push_str(&call.name);
    write_args(out, &call.args);
}

fn write_predicates(out: &mut String, clause: &PredicateClause) {
    match clause {
        PredicateClause::Any => out.push('*'),
        PredicateClause::All(calls) => {
            for (i, c) in calls.iter().enumerate() {
                if i > 0 {
                    out.push_str(" && ");
                }
                write_call(out, c);
            }
        }
    }
}

fn write_backend(out: &mut String, backend: &BackendNode) {
    match backend {
        BackendNode::Network(url) => {
            let _ = write!(out, "{:?}", url);
        }
        BackendNode::Shunt => out.push_str("<shunt>"),
        BackendNode::Loopback => out.push_str("<loopback>"),
        BackendNode::Dynamic => out.push_str("<dynamic>"),
        BackendNode::LoadBalanced { algorithm, endpoints } => {
            out.push('<');
            out.push_str(algorithm);
            for ep in endpoints {
                out.push_str(", ");
                let _ = write!(out, "{:?}", ep);
            }
            out.push('>');
        }
    }
}

fn write_route(out: &mut String, route: &RouteNode, opts: PrintOptions) {
    if let Some(id) = &route.id {
        out.push_str(id);
        out.push_str(": ");
    }
    write_predicates(out, &route.predicates);
    if opts.pretty {
        out.push_str("\n    -> ");
    } else {
        out.push_str(" -> ");
    }
    for f in &route.filters {
        write_call(out, f);
        if opts.pretty {
            out.push_str("\n    -> ");
        } else {
            out.push_str(" -> ");
        }
    }
    write_backend(out, &route.backend);
    out.push(';');
}

/// Render route nodes back to route-script text. Output re-parses to a
/// definition set equal to the input up to canonical ordering and
/// default-equivalent forms.
pub fn print_routes(routes: &[RouteNode], opts: PrintOptions) -> String {
    let mut out = String::new();
    for (i, route) in routes.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        write_route(&mut out, route, opts);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_routes;
    use super::*;

    #[test]
    fn round_trips_through_parse() {
        let src = r#"r: Path("/old") -> status(302) -> <shunt>;"#;
        let routes = parse_routes(src).unwrap();
        let printed = print_routes(&routes, PrintOptions::default());
        let reparsed = parse_routes(&printed).unwrap();
        assert_eq!(routes, reparsed);
    }

    #[test]
    fn reparse_of_printed_script_is_stable() {
        let src = r#"
            a: Path("/x/:id") && Method("GET") -> setQuery("k", "v") -> "http://x";
            b: Host(/^api\./) && Weight(5) -> <roundRobin, "http://a:80", "http://b:80">;
            * -> <shunt>
        "#;
        let first = parse_routes(src).unwrap();
        let printed = print_routes(&first, PrintOptions::default());
        let second = parse_routes(&printed).unwrap();
        assert_eq!(first, second);
        assert_eq!(printed, print_routes(&second, PrintOptions::default()));
    }

    #[test]
    fn compact_and_pretty_both_reparse() {
        let src = r#"* -> <roundRobin, "http://a:80", "http://b:80">;"#;
        let routes = parse_routes(src).unwrap();
        for pretty in [false, true] {
            let printed = print_routes(&routes, PrintOptions { pretty });
            assert_eq!(parse_routes(&printed).unwrap(), routes);
        }
    }
}
