//! The routing core: route script, definition model, predicate/filter
//! registries, compiler, matcher, controller, execution engine, and
//! load-balancer.

pub use monoroute_core::{AnyError, AnyResult};

pub mod cancel;
pub mod compiler;
pub mod controller;
pub mod diagnostics;
pub mod endpoint;
pub mod engine;
pub mod filters;
pub mod loadbalancer;
pub mod matcher;
pub mod model;
pub mod predicates;
pub mod registry;
pub mod script;
