//! Exercises the three broadphase structures against small, fixed synthetic
//! data. Not a simulator: no integration, no narrow-phase geometry, no
//! window. Candidate pairs are reported via a trivial arithmetic stand-in so
//! the wiring between structures and a task pool is visible end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use broadphase::Config;

fn main() {
    env_logger::init();

    let config = Config::default();
    let sap = Arc::new(config.build_sap());
    let grid = Arc::new(config.build_grid());
    let pool = Arc::new(config.build_task_pool());
    pool.start(4);

    // Fixed synthetic entities: (eid, x, y, half_extent).
    let entities: &[(i32, f32, f32, f32)] = &[
        (1, 0.0, 0.0, 5.0),
        (2, 8.0, 1.0, 5.0),
        (3, 500.0, 500.0, 5.0),
        (4, 10_050.0, 50.0, 5.0),
        (5, 50.0, 50.0, 5.0),
    ];

    let mut sap_handles = Vec::new();
    let mut grid_refs = Vec::new();
    for &(eid, x, y, half) in entities {
        sap_handles.push(sap.add(eid, x - half, half * 2.0));
        grid_refs.push(grid.add(eid, x - half, y - half, x + half, y + half));
    }

    let pair_count = Arc::new(AtomicUsize::new(0));
    for &handle in &sap_handles {
        let sap = Arc::clone(&sap);
        let pair_count = Arc::clone(&pair_count);
        pool.add(move || {
            let _ = sap.query_callback(handle, |self_eid, other_eid| {
                // Stand-in for narrow-phase resolution: a real simulator
                // would test the pair's exact geometry here.
                log::info!("sap candidate pair ({self_eid}, {other_eid})");
                pair_count.fetch_add(1, Ordering::Relaxed);
            });
        });
    }
    for &list in &grid_refs {
        let grid = Arc::clone(&grid);
        let pair_count = Arc::clone(&pair_count);
        pool.add(move || {
            let _ = grid.query_callback(list, |self_eid, other_eid| {
                log::info!("grid candidate pair ({self_eid}, {other_eid})");
                pair_count.fetch_add(1, Ordering::Relaxed);
            });
        });
    }

    pool.wait();
    println!("candidate pairs emitted: {}", pair_count.load(Ordering::Relaxed));

    for list in grid_refs {
        let _ = grid.return_refs(list);
    }
    grid.clear();
    pool.stop();
}
