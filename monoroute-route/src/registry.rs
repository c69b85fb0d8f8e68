//! Predicate and filter registries: name-to-factory lookup, used by
//! the compiler to instantiate typed predicates/filters from
//! route-script arguments.

use std::collections::HashMap;
use std::rc::Rc;

use crate::model::{FilterRef, PredicateRef};
use crate::script::ast::ArgNode;

/// A predicate evaluated against each candidate during matching, after
/// the indexed checks (method, host, path, headers) have passed.
pub trait Predicate {
    fn matches(&self, req: &crate::engine::RequestView<'_>) -> bool;
}

/// A filter's request/response hooks plus whatever private state it
/// closed over at creation time.
pub trait Filter {
    fn on_request(&self, ctx: &mut crate::engine::FilterContext<'_>) {
        let _ = ctx;
    }
    fn on_response(&self, ctx: &mut crate::engine::FilterContext<'_>) {
        let _ = ctx;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecError(pub String);

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SpecError {}

/// A registered predicate kind: its name and a factory from AST
/// arguments to a boxed [`Predicate`]. `weight()` is the contribution
/// this predicate kind makes to a route's priority score, zero for
/// most predicates.
pub trait PredicateSpec {
    fn name(&self) -> &str;
    fn create(&self, args: &[ArgNode]) -> Result<Box<dyn Predicate>, SpecError>;
    fn weight(&self) -> i64 {
        0
    }
}

/// A registered filter kind: its name and a factory from AST arguments
/// to a boxed [`Filter`].
pub trait FilterSpec {
    fn name(&self) -> &str;
    fn create(&self, args: &[ArgNode]) -> Result<Box<dyn Filter>, SpecError>;
}

/// Insertion-only `name -> spec` map.
pub struct Registry<S: ?Sized> {
    specs: HashMap<String, Rc<S>>,
}

impl<S: ?Sized> Default for Registry<S> {
    fn default() -> Self {
        Self { specs: HashMap::new() }
    }
}

impl<S: ?Sized> Registry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, spec: Rc<S>) {
        self.specs.insert(name.into(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&Rc<S>> {
        self.specs.get(name)
    }
}

pub type PredicateRegistry = Registry<dyn PredicateSpec>;
pub type FilterRegistry = Registry<dyn FilterSpec>;

/// Build a registry preloaded with the always-available predicate set.
pub fn default_predicate_registry() -> PredicateRegistry {
    let mut reg = PredicateRegistry::new();
    crate::predicates::register_all(&mut reg);
    reg
}

/// Build a registry preloaded with the bundled filter set.
pub fn default_filter_registry() -> FilterRegistry {
    let mut reg = FilterRegistry::new();
    crate::filters::register_all(&mut reg);
    reg
}

/// Instantiate a secondary predicate from a [`PredicateRef`] via the
/// registry. Unknown names are a per-route compile error.
pub fn instantiate_predicate(
    reg: &PredicateRegistry,
    p: &PredicateRef,
) -> Result<(Box<dyn Predicate>, i64), SpecError> {
    let spec = reg
        .get(&p.name)
        .ok_or_else(|| SpecError(format!("unknown predicate: {}", p.name)))?;
    let predicate = spec.create(&p.args)?;
    Ok((predicate, spec.weight()))
}

/// Instantiate a filter from a [`FilterRef`] via the registry.
pub fn instantiate_filter(reg: &FilterRegistry, f: &FilterRef) -> Result<Box<dyn Filter>, SpecError> {
    let spec = reg.get(&f.name).ok_or_else(|| SpecError(format!("unknown filter: {}", f.name)))?;
    spec.create(&f.args)
}
