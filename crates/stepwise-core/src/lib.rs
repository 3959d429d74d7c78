//! Durable workflow engine and storage port definitions for stepwise.
//!
//! This crate defines the "ports" (storage, hashing, host timers) that the
//! infrastructure layer implements, plus the engine itself. It depends only
//! on `stepwise-types` -- never on `stepwise-infra` or any database crate.

pub mod service;
pub mod storage;
pub mod workflow;
