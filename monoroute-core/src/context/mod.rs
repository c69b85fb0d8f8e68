//! Request-scoped context types.
//!
//! [`state`] holds the per-request mutable state the routing engine threads
//! through predicate matching, the filter chain, and backend dispatch —
//! captured path parameters, the filter state bag, the outgoing host
//! override, and the loopback counter. It is rebuilt fresh for every
//! request (a loopback re-entry resets the per-match fields in place rather
//! than starting over), designed to be cheap to mutate rather than
//! typestate-checked.
pub mod state;
