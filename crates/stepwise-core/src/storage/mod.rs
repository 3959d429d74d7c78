//! Storage abstractions for stepwise.
//!
//! Defines the per-instance `DurableStore` port, its object-safe wrapper and
//! an in-memory implementation. The SQLite implementation lives in
//! stepwise-infra.

pub mod box_store;
pub mod durable_store;
pub mod memory;
