//! ContentHasher trait for deriving step cache keys.
//!
//! Defined in stepwise-core so the engine can hash step names without coupling
//! to a specific hashing algorithm. The `Sha256ContentHasher` adapter lives in
//! stepwise-infra.

/// Abstraction over content hashing.
///
/// The engine derives every cache key as `compute_hash(name) + "-" + count`,
/// so implementations must be deterministic across processes.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}
