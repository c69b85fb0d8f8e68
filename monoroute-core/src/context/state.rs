//! Per-request mutable state threaded through predicate matching, the filter
//! chain, and backend dispatch.
use std::{any::Any, cell::Cell, collections::HashMap, sync::Arc};

/// Well-known state-bag key carrying the URL a dynamic-backend route
/// should dispatch to; a filter on the route must write it before the
/// backend step runs.
pub const KEY_DYNAMIC_BACKEND: &str = "monoroute.dynamic_backend";
/// Well-known state-bag key a filter writes to override the outgoing
/// `Host` header for the backend request.
pub const KEY_OUTGOING_HOST: &str = "monoroute.outgoing_host";
/// Well-known state-bag key written by the `preserveHost` filter; `false`
/// tells the engine to derive the outgoing `Host` header from the chosen
/// backend endpoint instead of the original inbound request.
pub const KEY_PRESERVE_HOST: &str = "monoroute.preserve_host";
/// Well-known state-bag key a request-side filter sets to send the
/// request back through the matcher regardless of the route's declared
/// backend. The engine consumes (removes) the key on each re-entry.
pub const KEY_LOOPBACK: &str = "monoroute.loopback";
/// Well-known state-bag key supplying the consistent-hash load-balancer
/// key for this request; without it the engine hashes client IP + path.
pub const KEY_LB_KEY: &str = "monoroute.lb_key";

/// An opaque value stored in the filter [`StateBag`].
///
/// Filters agree on key names and the concrete type behind `Any` out of
/// band; the engine only inspects the well-known keys documented on the
/// constants in this module.
#[derive(Clone)]
pub enum StateValue {
    String(String),
    Bool(bool),
    Int(i64),
    Any(Arc<dyn Any + Send + Sync>),
}

impl StateValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::String(s)
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Bool(b)
    }
}

/// Opaque per-request key-value store shared by the whole filter chain and
/// the engine.
#[derive(Debug, Clone, Default)]
pub struct StateBag(HashMap<String, StateValue>);

impl std::fmt::Debug for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::String(s) => write!(f, "String({s:?})"),
            StateValue::Bool(b) => write!(f, "Bool({b:?})"),
            StateValue::Int(i) => write!(f, "Int({i:?})"),
            StateValue::Any(_) => write!(f, "Any(..)"),
        }
    }
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }
}

/// Per-request state carried by the execution engine across the matcher, the
/// filter chain, and backend dispatch. A loopback re-entry reuses the same
/// `RequestState`, incrementing `loop_count`.
#[derive(Debug, Clone)]
pub struct RequestState {
    /// `:param`/`*wildcard` captures from the winning route's path match.
    pub params: HashMap<String, String>,
    /// Opaque cross-filter key-value store.
    pub state: StateBag,
    /// Outgoing `Host` header/authority to use when proxying; seeded from the
    /// request's own `Host` and may be overridden by a filter (e.g.
    /// `preserveHost`).
    pub outgoing_host: String,
    /// Set to `true` once a filter has written a synthetic response (shunt,
    /// or early response from a request-side filter).
    pub served: bool,
    /// Number of loopback re-entries performed so far for this request.
    pub loop_count: u32,
    /// The routing-table generation this request is pinned to: a request
    /// that started against generation N keeps resolving against N for
    /// its whole lifetime, loopbacks included.
    pub table_generation: u64,
    /// The request's traffic-split draw, filled lazily by the first
    /// segment predicate that needs it. Sharing one draw across every
    /// segment predicate evaluated for this request is what makes
    /// non-overlapping segments partition traffic exactly. A `Cell`
    /// because predicates see the state through a shared reference.
    pub traffic_draw: Cell<Option<f64>>,
}

impl RequestState {
    pub fn new(outgoing_host: String, table_generation: u64) -> Self {
        Self {
            params: HashMap::new(),
            state: StateBag::new(),
            outgoing_host,
            served: false,
            loop_count: 0,
            table_generation,
            traffic_draw: Cell::new(None),
        }
    }

    /// Reset the per-match fields ahead of a loopback re-entry, preserving
    /// `loop_count`'s running total and the table generation pin.
    pub fn reset_for_rematch(&mut self) {
        self.params.clear();
        self.served = false;
        self.traffic_draw.set(None);
    }
}
