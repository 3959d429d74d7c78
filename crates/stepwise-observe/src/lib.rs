//! Observability setup for stepwise: structured logging plus an optional
//! OpenTelemetry span bridge.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
