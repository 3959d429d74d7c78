//! Durable workflow execution.
//!
//! The `Engine` owns one instance's event log, status and wake queue and
//! drives the user's `Workflow::run` through a `Context`. Every `do_step`,
//! `sleep` and `wait_for_event` call is memoized under a cache key derived
//! from its name and occurrence count, so re-entering `run()` after a crash
//! replays committed results instead of re-executing them.
//!
//! Replay requires determinism: the sequence and names of context calls must
//! be identical on every entry into `run()`.

pub mod binding;
pub mod clock;
pub mod context;
pub mod engine;
pub mod keys;
pub mod modifier;
pub mod retry;
pub mod validators;
pub mod wake_queue;

pub use binding::{InstanceHandle, StoreProvider, WorkflowBinding};
pub use context::Context;
pub use engine::{Engine, FnWorkflow, Workflow};
pub use modifier::InstanceModifier;
