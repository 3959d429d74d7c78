//! Host services consumed by the engine.

pub mod hash;
