//! Infrastructure layer for stepwise.
//!
//! Contains implementations of the ports defined in `stepwise-core`:
//! the SQLite `DurableStore`, SHA-256 content hashing, and the
//! `config.toml` loader.

pub mod config;
pub mod crypto;
pub mod sqlite;
