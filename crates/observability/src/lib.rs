//! Tracing/logging setup shared by the pipeline binaries.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::init;
