//! Shared setup for applications embedding procbridge.

pub mod tracing;

pub use self::tracing::{TracingConfig, TracingError, TracingOutputFormat, default_directive, init_tracing};
