//! The always-available predicate set: everything not lifted into
//! [`crate::model::RouteDefinition`]'s dedicated fields by
//! canonicalization (Path/PathSubtree/Host/Method/Header/HeaderRegexp
//! are handled there instead).

use std::cell::Cell;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::RequestView;
use crate::registry::{Predicate, PredicateRegistry, PredicateSpec, SpecError};
use crate::script::ast::ArgNode;

fn arg_str(args: &[ArgNode], idx: usize) -> Result<String, SpecError> {
    match args.get(idx) {
        Some(ArgNode::String(s)) => Ok(s.clone()),
        Some(ArgNode::Regex(r)) => Ok(r.clone()),
        Some(ArgNode::Number(n)) => Ok(n.to_string()),
        None => Err(SpecError(format!("missing argument {idx}"))),
    }
}

fn arg_num(args: &[ArgNode], idx: usize) -> Result<f64, SpecError> {
    match args.get(idx) {
        Some(ArgNode::Number(n)) => Ok(*n),
        other => Err(SpecError(format!("expected number argument, found {other:?}"))),
    }
}

macro_rules! simple_spec {
    ($spec_name:ident, $name:literal, $predicate_ty:ty, $create:expr) => {
        struct $spec_name;
        impl PredicateSpec for $spec_name {
            fn name(&self) -> &str {
                $name
            }
            fn create(&self, args: &[ArgNode]) -> Result<Box<dyn Predicate>, SpecError> {
                let f: fn(&[ArgNode]) -> Result<$predicate_ty, SpecError> = $create;
                f(args).map(|p| Box::new(p) as Box<dyn Predicate>)
            }
        }
    };
}

// -- Methods(...) : matches if the request method is one of the listed verbs.
struct Methods(Vec<String>);
impl Predicate for Methods {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        self.0.iter().any(|m| m.eq_ignore_ascii_case(req.method.as_str()))
    }
}
simple_spec!(MethodsSpec, "Methods", Methods, |args| {
    let methods = args
        .iter()
        .map(|a| match a {
            ArgNode::String(s) => Ok(s.to_uppercase()),
            other => Err(SpecError(format!("expected string method name, found {other:?}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Methods(methods))
});

// -- Cookie(name, value?) : a cookie header containing name=value (or just name present).
struct Cookie {
    name: String,
    value: Option<String>,
}
impl Predicate for Cookie {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        req.headers.get_all(http::header::COOKIE).iter().any(|v| {
            let Ok(s) = v.to_str() else { return false };
            s.split(';').map(str::trim).any(|kv| match kv.split_once('=') {
                Some((k, v)) => k == self.name && self.value.as_deref().map_or(true, |want| v == want),
                None => kv == self.name && self.value.is_none(),
            })
        })
    }
}
simple_spec!(CookieSpec, "Cookie", Cookie, |args| {
    Ok(Cookie { name: arg_str(args, 0)?, value: arg_str(args, 1).ok() })
});

// -- QueryParam(name, value?) : a query string parameter, optionally with a required value.
struct QueryParam {
    name: String,
    value: Option<String>,
}
impl Predicate for QueryParam {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        let Some(query) = req.uri.query() else { return false };
        url_query_pairs(query).any(|(k, v)| k == self.name && self.value.as_deref().map_or(true, |want| v == want))
    }
}
simple_spec!(QueryParamSpec, "QueryParam", QueryParam, |args| {
    Ok(QueryParam { name: arg_str(args, 0)?, value: arg_str(args, 1).ok() })
});

fn url_query_pairs(query: &str) -> impl Iterator<Item = (String, String)> + '_ {
    query.split('&').filter(|s| !s.is_empty()).map(|pair| match pair.split_once('=') {
        Some((k, v)) => (k.to_string(), v.to_string()),
        None => (pair.to_string(), String::new()),
    })
}

// -- Source(cidrs...) : the immediate peer IP belongs to one of the listed CIDRs.
struct Source(Vec<ipnet::IpNet>);
impl Predicate for Source {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        match req.peer_ip {
            Some(ip) => self.0.iter().any(|net| net.contains(&ip)),
            None => false,
        }
    }
}
fn parse_cidrs(args: &[ArgNode]) -> Result<Vec<ipnet::IpNet>, SpecError> {
    args.iter()
        .map(|a| match a {
            ArgNode::String(s) => s.parse::<ipnet::IpNet>().map_err(|e| SpecError(format!("invalid cidr {s:?}: {e}"))),
            other => Err(SpecError(format!("expected cidr string, found {other:?}"))),
        })
        .collect()
}
simple_spec!(SourceSpec, "Source", Source, |args| { parse_cidrs(args).map(Source) });

// -- SourceFromLast(cidrs...) : same as Source, against the last entry of X-Forwarded-For.
struct SourceFromLast(Vec<ipnet::IpNet>);
impl Predicate for SourceFromLast {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        let Some(last) = xff_last(req) else { return false };
        self.0.iter().any(|net| net.contains(&last))
    }
}
simple_spec!(SourceFromLastSpec, "SourceFromLast", SourceFromLast, |args| {
    parse_cidrs(args).map(SourceFromLast)
});

fn xff_last(req: &RequestView<'_>) -> Option<IpAddr> {
    req.headers
        .get(http::header::HeaderName::from_static("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').last())
        .and_then(|s| IpAddr::from_str(s.trim()).ok())
}

// -- ClientIP(cidrs...) : X-Forwarded-For stripped by a configured hop count, falling back to the peer IP.
struct ClientIp {
    nets: Vec<ipnet::IpNet>,
    hops: usize,
}
impl Predicate for ClientIp {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        let ip = client_ip(req, self.hops).or(req.peer_ip);
        match ip {
            Some(ip) => self.nets.iter().any(|net| net.contains(&ip)),
            None => false,
        }
    }
}
fn client_ip(req: &RequestView<'_>, hops: usize) -> Option<IpAddr> {
    let header = req
        .headers
        .get(http::header::HeaderName::from_static("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())?;
    let entries: Vec<&str> = header.split(',').map(str::trim).collect();
    let idx = entries.len().checked_sub(1 + hops)?;
    IpAddr::from_str(entries[idx]).ok()
}
struct ClientIpSpec;
impl PredicateSpec for ClientIpSpec {
    fn name(&self) -> &str {
        "ClientIP"
    }
    fn create(&self, args: &[ArgNode]) -> Result<Box<dyn Predicate>, SpecError> {
        let hops = arg_num(args, args.len().saturating_sub(1))
            .ok()
            .filter(|_| matches!(args.last(), Some(ArgNode::Number(_))))
            .map(|n| n as usize)
            .unwrap_or(0);
        let cidr_args: &[ArgNode] = if hops > 0 && !args.is_empty() { &args[..args.len() - 1] } else { args };
        Ok(Box::new(ClientIp { nets: parse_cidrs(cidr_args)?, hops }))
    }
}

// -- Tee(url) : shadow the request to a second backend; a pass-through predicate, always true.
struct Tee;
impl Predicate for Tee {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        true
    }
}
simple_spec!(TeeSpec, "Tee", Tee, |_args| Ok(Tee));

// -- Traffic(p) : matches with probability p, drawn fresh per evaluation.
struct Traffic(f64);
impl Predicate for Traffic {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        traffic_rng_draw() < self.0
    }
}
simple_spec!(TrafficSpec, "Traffic", Traffic, |args| { Ok(Traffic(arg_num(args, 0)?)) });

// -- TrafficSegment(start, end) : matches if the per-request draw falls in [start, end).
struct TrafficSegment {
    start: f64,
    end: f64,
}
impl Predicate for TrafficSegment {
    fn matches(&self, req: &RequestView<'_>) -> bool {
        // All segment predicates evaluated for one request share a
        // single draw, so non-overlapping segments partition traffic
        // exactly: [0, 0.3) and [0.3, 1.0) really split 30/70.
        let t = match req.state.traffic_draw.get() {
            Some(t) => t,
            None => {
                let t = traffic_rng_draw();
                req.state.traffic_draw.set(Some(t));
                t
            }
        };
        t >= self.start && t < self.end
    }
}
simple_spec!(TrafficSegmentSpec, "TrafficSegment", TrafficSegment, |args| {
    Ok(TrafficSegment { start: arg_num(args, 0)?, end: arg_num(args, 1)? })
});

thread_local! {
    static TRAFFIC_RNG_SEED: Cell<Option<u64>> = Cell::new(None);
}

/// Seed the per-thread traffic RNG so split ratios are reproducible in
/// tests. Unseeded threads draw from the process RNG.
pub fn seed_traffic_rng(seed: u64) {
    TRAFFIC_RNG_SEED.with(|cell| cell.set(Some(seed)));
}

fn traffic_rng_draw() -> f64 {
    use rand::Rng;
    TRAFFIC_RNG_SEED.with(|cell| match cell.get() {
        Some(seed) => {
            use rand::SeedableRng;
            // Advance a fresh seeded generator per call so repeated draws within a
            // single seeded test run are still varied but reproducible across runs.
            let mixed = seed.wrapping_add(monotonic_tick());
            let mut rng = rand::rngs::StdRng::seed_from_u64(mixed);
            rng.gen_range(0.0..1.0)
        }
        None => rand::thread_rng().gen_range(0.0..1.0),
    })
}

fn monotonic_tick() -> u64 {
    thread_local! {
        static TICK: Cell<u64> = Cell::new(0);
    }
    TICK.with(|t| {
        let v = t.get();
        t.set(v.wrapping_add(1));
        v
    })
}

// -- True()/False() : constants for test routes, weight 0.
struct AlwaysTrue;
impl Predicate for AlwaysTrue {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        true
    }
}
simple_spec!(TrueSpec, "True", AlwaysTrue, |_args| Ok(AlwaysTrue));

struct AlwaysFalse;
impl Predicate for AlwaysFalse {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        false
    }
}
simple_spec!(FalseSpec, "False", AlwaysFalse, |_args| Ok(AlwaysFalse));

// -- After/Before/Between(timestamp) : wall-clock comparisons against a unix-epoch instant.
fn parse_instant(s: &str) -> Result<SystemTime, SpecError> {
    s.parse::<u64>()
        .map(|secs| UNIX_EPOCH + std::time::Duration::from_secs(secs))
        .map_err(|_| SpecError(format!("invalid timestamp (expected unix seconds): {s}")))
}

struct After(SystemTime);
impl Predicate for After {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        SystemTime::now() >= self.0
    }
}
simple_spec!(AfterSpec, "After", After, |args| { Ok(After(parse_instant(&arg_str(args, 0)?)?)) });

struct Before(SystemTime);
impl Predicate for Before {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        SystemTime::now() < self.0
    }
}
simple_spec!(BeforeSpec, "Before", Before, |args| { Ok(Before(parse_instant(&arg_str(args, 0)?)?)) });

struct Between {
    start: SystemTime,
    end: SystemTime,
}
impl Predicate for Between {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        let now = SystemTime::now();
        now >= self.start && now < self.end
    }
}
simple_spec!(BetweenSpec, "Between", Between, |args| {
    Ok(Between { start: parse_instant(&arg_str(args, 0)?)?, end: parse_instant(&arg_str(args, 1)?)? })
});

// -- Cron(expr) : a 5-field cron expression, matched against the current local minute.
struct Cron(cron_expr::CronExpr);
impl Predicate for Cron {
    fn matches(&self, _req: &RequestView<'_>) -> bool {
        self.0.matches_now()
    }
}
simple_spec!(CronSpec, "Cron", Cron, |args| {
    let expr = arg_str(args, 0)?;
    cron_expr::CronExpr::parse(&expr).map(Cron).map_err(SpecError)
});

/// A minimal 5-field (minute hour day-of-month month day-of-week) cron
/// matcher covering `*`, literal numbers, comma lists, and ranges — the
/// forms route scripts in this corpus actually use. Not a full crontab
/// implementation; unsupported syntax (steps, named months/days) is
/// rejected at parse time rather than silently mismatched.
mod cron_expr {
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Debug, Clone)]
    struct Field(Vec<u32>);

    impl Field {
        fn parse(s: &str, min: u32, max: u32) -> Result<Self, String> {
            if s == "*" {
                return Ok(Field((min..=max).collect()));
            }
            let mut values = Vec::new();
            for part in s.split(',') {
                if let Some((lo, hi)) = part.split_once('-') {
                    let lo: u32 = lo.parse().map_err(|_| format!("invalid cron range: {part}"))?;
                    let hi: u32 = hi.parse().map_err(|_| format!("invalid cron range: {part}"))?;
                    values.extend(lo..=hi);
                } else {
                    values.push(part.parse().map_err(|_| format!("invalid cron field: {part}"))?);
                }
            }
            if values.iter().any(|v| *v < min || *v > max) {
                return Err(format!("cron field {s} out of range {min}-{max}"));
            }
            Ok(Field(values))
        }

        fn contains(&self, v: u32) -> bool {
            self.0.contains(&v)
        }
    }

    #[derive(Debug, Clone)]
    pub struct CronExpr {
        minute: Field,
        hour: Field,
        day_of_month: Field,
        month: Field,
        day_of_week: Field,
    }

    impl CronExpr {
        pub fn parse(s: &str) -> Result<Self, String> {
            let parts: Vec<&str> = s.split_whitespace().collect();
            if parts.len() != 5 {
                return Err(format!("expected 5 cron fields, found {}", parts.len()));
            }
            Ok(CronExpr {
                minute: Field::parse(parts[0], 0, 59)?,
                hour: Field::parse(parts[1], 0, 23)?,
                day_of_month: Field::parse(parts[2], 1, 31)?,
                month: Field::parse(parts[3], 1, 12)?,
                day_of_week: Field::parse(parts[4], 0, 6)?,
            })
        }

        pub fn matches_now(&self) -> bool {
            let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            let (minute, hour, day_of_month, month, day_of_week) = civil_from_unix(secs);
            self.minute.contains(minute)
                && self.hour.contains(hour)
                && self.day_of_month.contains(day_of_month)
                && self.month.contains(month)
                && self.day_of_week.contains(day_of_week)
        }
    }

    /// Decompose a unix timestamp (UTC) into cron fields using the
    /// civil_from_days algorithm (Howard Hinnant's `chrono`-equivalent
    /// public-domain formula).
    fn civil_from_unix(secs: u64) -> (u32, u32, u32, u32, u32) {
        let days = (secs / 86400) as i64;
        let rem = (secs % 86400) as u32;
        let hour = rem / 3600;
        let minute = (rem % 3600) / 60;
        let day_of_week = ((days % 7 + 11) % 7) as u32; // 1970-01-01 was a Thursday (=4)

        let z = days + 719468;
        let era = if z >= 0 { z } else { z - 146096 } / 146097;
        let doe = (z - era * 146097) as u64;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
        let y = yoe as i64 + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
        let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
        let _year = if month <= 2 { y + 1 } else { y };

        (minute, hour, day, month, day_of_week)
    }
}

/// Register the always-available predicate set into a fresh registry.
pub fn register_all(reg: &mut PredicateRegistry) {
    reg.register("Methods", std::rc::Rc::new(MethodsSpec));
    reg.register("Cookie", std::rc::Rc::new(CookieSpec));
    reg.register("QueryParam", std::rc::Rc::new(QueryParamSpec));
    reg.register("Source", std::rc::Rc::new(SourceSpec));
    reg.register("SourceFromLast", std::rc::Rc::new(SourceFromLastSpec));
    reg.register("ClientIP", std::rc::Rc::new(ClientIpSpec));
    reg.register("Tee", std::rc::Rc::new(TeeSpec));
    reg.register("Traffic", std::rc::Rc::new(TrafficSpec));
    reg.register("TrafficSegment", std::rc::Rc::new(TrafficSegmentSpec));
    reg.register("True", std::rc::Rc::new(TrueSpec));
    reg.register("False", std::rc::Rc::new(FalseSpec));
    reg.register("After", std::rc::Rc::new(AfterSpec));
    reg.register("Before", std::rc::Rc::new(BeforeSpec));
    reg.register("Between", std::rc::Rc::new(BetweenSpec));
    reg.register("Cron", std::rc::Rc::new(CronSpec));
}

#[cfg(test)]
mod tests {
    use super::cron_expr::CronExpr;
    use super::*;
    use monoroute_core::context::state::RequestState;

    #[test]
    fn cron_wildcard_always_matches() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert!(expr.matches_now());
    }

    #[test]
    fn cron_rejects_wrong_field_count() {
        assert!(CronExpr::parse("* * *").is_err());
    }

    #[test]
    fn complementary_segments_partition_each_request() {
        let seg_a = TrafficSegmentSpec.create(&[ArgNode::Number(0.0), ArgNode::Number(0.5)]).unwrap();
        let seg_b = TrafficSegmentSpec.create(&[ArgNode::Number(0.5), ArgNode::Number(1.0)]).unwrap();
        let method = http::Method::GET;
        let uri = http::Uri::from_static("/");
        let headers = http::HeaderMap::new();
        for _ in 0..100 {
            let state = RequestState::new("h".into(), 1);
            let req = RequestView { method: &method, uri: &uri, headers: &headers, peer_ip: None, state: &state };
            let a = seg_a.matches(&req);
            let b = seg_b.matches(&req);
            assert!(a != b, "exactly one segment should claim the request");
        }
    }
}
