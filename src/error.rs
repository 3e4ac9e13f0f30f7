//! Error types returned by the bounded (non-spinning) entry points.
//!
//! The source this crate is modeled on has no error-return surface at all:
//! arena exhaustion spins forever and a use-after-remove handle is undefined
//! behavior. Spinning `allocate`/`wait` paths are kept for parity, but every
//! structure also exposes a bounded variant that surfaces these two failure
//! modes instead of hanging or corrupting memory.

use std::fmt;

/// Which arena a [`BroadphaseError::CapacityExhausted`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// The SAP list's node arena.
    Sap,
    /// The spatial grid's node arena.
    Grid,
    /// The task pool's task-node arena.
    Task,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Sap => f.write_str("SAP"),
            PoolKind::Grid => f.write_str("grid"),
            PoolKind::Task => f.write_str("task"),
        }
    }
}

/// Errors produced by the bounded-retry entry points.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BroadphaseError {
    /// No free node was available within the configured retry budget.
    ///
    /// The caller's narrow-phase should elide the update for this tick
    /// rather than treat this as fatal.
    #[error("{pool} arena exhausted after bounded retry")]
    CapacityExhausted {
        /// The arena that was exhausted.
        pool: PoolKind,
    },

    /// The handle's generation does not match the arena slot's current
    /// generation, meaning the slot was removed (and possibly reused) since
    /// the handle was issued.
    #[error("handle refers to a removed or reused slot")]
    StaleHandle,
}

/// Convenience alias for fallible broadphase operations.
pub type Result<T> = std::result::Result<T, BroadphaseError>;
