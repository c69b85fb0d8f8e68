//! Boundary error aliases. Typed `thiserror` enums live next to the code
//! that produces them; these aliases are for the outermost seams (the
//! CLI, data-client trait objects) where callers only need to log or
//! propagate.

/// Any boxed error, via `anyhow`.
pub type AnyError = anyhow::Error;

/// Result defaulting its error to [`AnyError`].
pub type AnyResult<T, E = AnyError> = std::result::Result<T, E>;
