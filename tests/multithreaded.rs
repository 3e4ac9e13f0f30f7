//! Genuine multi-threaded exercises, as opposed to the single-threaded
//! `#[cfg(test)]` unit tests colocated with each module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use broadphase::{Config, SapList};

#[test]
fn concurrent_sap_inserts_stay_ordered() {
    let sap = Arc::new(SapList::new(4096));

    std::thread::scope(|scope| {
        for t in 0..8 {
            let sap = Arc::clone(&sap);
            scope.spawn(move || {
                for i in 0..200 {
                    let pos = (t * 1000 + i) as f32;
                    let h = sap.add(t * 1000 + i, pos, 1.0);
                    // every insert can see itself and nothing else at its
                    // own exact position range under this spacing
                    let mut hits = Vec::new();
                    sap.query_callback(h, |_, other| hits.push(other)).unwrap();
                    assert!(hits.iter().all(|&o| o != t * 1000 + i));
                }
            });
        }
    });

    assert_eq!(sap.allocated() - sap.freed(), 2 + 8 * 200);
}

#[test]
fn concurrent_grid_queries_see_every_covering_neighbor() {
    let config = Config::default();
    let grid = Arc::new(config.build_grid());

    let counter = Arc::new(AtomicUsize::new(0));
    std::thread::scope(|scope| {
        for t in 0..4 {
            let grid = Arc::clone(&grid);
            let counter = Arc::clone(&counter);
            scope.spawn(move || {
                let eid = t + 1;
                let list = grid.add(eid, 0.0, 0.0, 10.0, 10.0);
                grid.query_callback(list, |_, _| {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            });
        }
    });

    // Every pair among the 4 co-located entities is seen from exactly one
    // direction (the smaller id's query), so exactly C(4,2) = 6 emissions
    // total across all four threads combined, though any single thread's
    // count depends on interleaving — just check the upper bound holds and
    // nothing was double-counted beyond it.
    assert!(counter.load(Ordering::Relaxed) <= 6);
}

#[test]
fn task_pool_runs_work_submitted_from_many_threads() {
    let config = Config::default();
    let pool = Arc::new(config.build_task_pool());
    pool.start(4);

    let counter = Arc::new(AtomicUsize::new(0));
    std::thread::scope(|scope| {
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let counter = Arc::clone(&counter);
            scope.spawn(move || {
                for _ in 0..500 {
                    let counter = Arc::clone(&counter);
                    pool.add(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }
    });

    pool.wait();
    assert_eq!(counter.load(Ordering::Relaxed), 2000);
    assert_eq!(pool.completed(), pool.issued());
    pool.stop();
}
