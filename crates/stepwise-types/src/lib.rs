//! Shared domain types for stepwise.
//!
//! This crate contains the types shared by the engine, its storage adapters
//! and the CLI: instance status and log events, step configuration, wake-queue
//! entries, external events, engine configuration and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod instance;
pub mod step;
pub mod wake;
