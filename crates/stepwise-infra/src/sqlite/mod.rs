//! SQLite storage layer.
//!
//! `DurableStore` implementation backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod durable_store;
pub mod pool;
