//! Concurrent broadphase collision-detection core.
//!
//! Three lock-free data structures, each a compare-and-swap retry loop over
//! a packed atomic reference backed by a preallocated node arena:
//!
//! - [`sap::SapList`]: a Sweep-And-Prune ordered list for one-dimensional
//!   overlap queries.
//! - [`grid::Grid`]: a uniform spatial hash grid with toroidal wraparound.
//! - [`taskpool::TaskPool`]: a pool of worker threads draining a shared
//!   lock-free task stack, used to run either structure's `add`/`query`
//!   calls in parallel across entities.
//!
//! None of this crate performs narrow-phase collision math, integration
//! physics, or rendering — callers wire the structures' callbacks and
//! handles into whatever simulation loop they already have. See each
//! module's docs for its specific contract, and `DESIGN.md` for the
//! grounding behind each piece.

mod arena;
pub mod error;
pub mod grid;
pub mod packed;
pub mod sap;
pub mod taskpool;

pub use error::{BroadphaseError, PoolKind, Result};
pub use grid::{Grid, GridConfig, GridRefList};
pub use sap::{SapHandle, SapList};
pub use taskpool::{TaskPool, TaskPoolConfig};

/// Aggregate sizing for every subsystem, with defaults matching the
/// source's compile-time constants.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Capacity of the SAP list's node arena, not counting its two
    /// permanent sentinels.
    pub sap_capacity: usize,
    /// Sizing for the spatial grid (cell layout plus its two node arenas).
    pub grid: GridConfig,
    /// Capacity of the task pool's task-node arena.
    pub task_capacity: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            sap_capacity: 102_400,
            grid: GridConfig::default(),
            task_capacity: 10_240,
        }
    }
}

impl Config {
    /// Builds a [`SapList`] sized per `self.sap_capacity`.
    pub fn build_sap(&self) -> SapList {
        SapList::new(self.sap_capacity)
    }

    /// Builds a [`Grid`] sized per `self.grid`.
    pub fn build_grid(&self) -> Grid {
        Grid::new(self.grid)
    }

    /// Builds a [`TaskPool`] sized per `self.task_capacity`. Not yet
    /// started; call [`TaskPool::start`] on the returned pool (wrapped in
    /// an `Arc`) to spawn workers.
    pub fn build_task_pool(&self) -> TaskPool {
        TaskPool::new(TaskPoolConfig {
            capacity: self.task_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_every_subsystem() {
        let config = Config::default();
        let sap = config.build_sap();
        let grid = config.build_grid();
        let pool = config.build_task_pool();

        let h = sap.add(1, 0.0, 1.0);
        sap.query_callback(h, |_, _| {}).unwrap();

        let r = grid.add(1, 0.0, 0.0, 1.0, 1.0);
        grid.query_callback(r, |_, _| {}).unwrap();

        assert_eq!(pool.issued(), 0);
    }
}
