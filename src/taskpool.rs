//! Lock-free task pool.
//!
//! Worker threads spin-pop a Treiber stack of pending task nodes; submitters
//! push onto the same stack. Task nodes are themselves arena-allocated, so
//! submission and completion only ever touch atomics — no lock anywhere
//! between `add` and a worker picking the task up.

use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::arena::Arena;
use crate::error::{BroadphaseError, PoolKind, Result};
use crate::packed::FreeRef;

type Task = Box<dyn FnOnce() + Send>;

struct TaskNode {
    task: UnsafeCell<Option<Task>>,
    next: AtomicU64,
}

// SAFETY: `task` is written by the submitting thread before the pending-list
// push (release) and taken by exactly one worker after the matching pop
// (acquire); no two threads ever touch it concurrently.
unsafe impl Sync for TaskNode {}

impl TaskNode {
    fn blank() -> TaskNode {
        TaskNode {
            task: UnsafeCell::new(None),
            next: AtomicU64::new(0),
        }
    }
}

/// Runtime-configurable sizing for a [`TaskPool`].
#[derive(Debug, Clone, Copy)]
pub struct TaskPoolConfig {
    pub capacity: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> TaskPoolConfig {
        TaskPoolConfig { capacity: 10_240 }
    }
}

/// A lock-free pool of worker threads draining a shared task stack.
pub struct TaskPool {
    arena: Arena<TaskNode>,
    pending: AtomicU64,
    issued: AtomicU64,
    completed: AtomicU64,
    pause: AtomicBool,
    quit: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    pub fn new(config: TaskPoolConfig) -> TaskPool {
        TaskPool {
            arena: Arena::new(config.capacity, TaskNode::blank),
            pending: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            pause: AtomicBool::new(true),
            quit: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Number of tasks submitted so far.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Number of tasks that have finished running (including panicked ones).
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn push_pending(&self, idx: u32) {
        let node = self.arena.get(idx);
        loop {
            let head = FreeRef(self.pending.load(Ordering::Acquire));
            node.next.store(FreeRef::build(0, head.index()).0, Ordering::Relaxed);
            let new_head = FreeRef::build(head.counter().wrapping_add(1), idx + 1);
            if self
                .pending
                .compare_exchange_weak(head.0, new_head.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn try_pop_pending(&self) -> Option<u32> {
        let head = FreeRef(self.pending.load(Ordering::Acquire));
        let idx0 = head.index0()?;
        let node = self.arena.get(idx0);
        let next = FreeRef(node.next.load(Ordering::Relaxed));
        let new_head = FreeRef::build(head.counter().wrapping_add(1), next.index());
        if self
            .pending
            .compare_exchange_weak(head.0, new_head.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(idx0)
        } else {
            None
        }
    }

    /// Submits a callable, spinning if the task arena is momentarily
    /// exhausted. `quit`/`pause` do not affect submission, only execution.
    ///
    /// `F` need not be `UnwindSafe`: a submitted closure typically closes
    /// over a shared `Arc<SapList>`/`Arc<Grid>` handle, and those are never
    /// `UnwindSafe` (their arenas are `UnsafeCell`-backed). Catching a
    /// panicking task is the worker's concern, not something the submitter
    /// should have to prove — see `worker_loop`.
    pub fn add<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = self.arena.allocate();
        self.install(idx, task);
    }

    /// As [`TaskPool::add`], but reports
    /// [`BroadphaseError::CapacityExhausted`] after `retries` failed
    /// allocation attempts instead of spinning.
    pub fn try_add<F>(&self, task: F, retries: u32) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = self
            .arena
            .try_allocate(retries)
            .ok_or(BroadphaseError::CapacityExhausted { pool: PoolKind::Task })?;
        self.install(idx, task);
        Ok(())
    }

    fn install<F>(&self, idx: u32, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let node = self.arena.get(idx);
        unsafe {
            *node.task.get() = Some(Box::new(task));
        }
        self.push_pending(idx);
        self.issued.fetch_add(1, Ordering::Release);
    }

    /// Spins until every task submitted before this call has completed.
    /// Submissions made concurrently with `wait` are not guaranteed to be
    /// observed — `wait` is a barrier on `issued` as read at entry, not a
    /// generational one.
    pub fn wait(&self) {
        let target = self.issued.load(Ordering::Acquire);
        while self.completed.load(Ordering::Acquire) < target {
            std::thread::yield_now();
        }
    }

    /// Spawns `size` worker threads. They block on an internal `pause` flag
    /// until every thread has been spawned, so the pool doesn't start
    /// draining tasks with only a fraction of its intended concurrency.
    pub fn start(self: &Arc<TaskPool>, size: usize) {
        self.pause.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);

        let mut workers = self.workers.lock().unwrap();
        for _ in 0..size {
            let pool = Arc::clone(self);
            workers.push(std::thread::spawn(move || TaskPool::worker_loop(&pool)));
        }
        drop(workers);

        self.pause.store(false, Ordering::Release);
    }

    /// Waits for outstanding work, then signals every worker to exit and
    /// joins them. Performing a final `wait` here (rather than just setting
    /// `quit`) means `stop` never silently drops submitted-but-unrun tasks.
    pub fn stop(&self) {
        self.wait();
        self.quit.store(true, Ordering::Release);
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    fn worker_loop(pool: &Arc<TaskPool>) {
        loop {
            if pool.quit.load(Ordering::Acquire) {
                return;
            }
            if pool.pause.load(Ordering::Acquire) {
                std::thread::yield_now();
                continue;
            }
            let idx = match pool.try_pop_pending() {
                Some(idx) => idx,
                None => {
                    std::hint::spin_loop();
                    continue;
                }
            };

            let node = pool.arena.get(idx);
            let task = unsafe { (*node.task.get()).take() };
            if let Some(task) = task {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log::error!("task panicked; pool continues");
                }
            }
            pool.arena.recycle(idx);
            pool.completed.fetch_add(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn all_submitted_tasks_run_exactly_once() {
        let pool = Arc::new(TaskPool::new(TaskPoolConfig { capacity: 256 }));
        pool.start(4);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let c = Arc::clone(&counter);
            pool.add(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();

        assert_eq!(counter.load(Ordering::Relaxed), 1000);
        assert_eq!(pool.completed(), pool.issued());
        pool.stop();
    }

    #[test]
    fn stress_one_hundred_thousand_tasks() {
        let pool = Arc::new(TaskPool::new(TaskPoolConfig { capacity: 4096 }));
        pool.start(8);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100_000 {
            let c = Arc::clone(&counter);
            pool.add(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();

        assert_eq!(counter.load(Ordering::Relaxed), 100_000);
        pool.stop();
    }

    #[test]
    fn panicking_task_does_not_stop_the_worker() {
        let pool = Arc::new(TaskPool::new(TaskPoolConfig { capacity: 64 }));
        pool.start(2);

        pool.add(|| panic!("deliberate"));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.add(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        pool.wait();

        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(pool.completed(), 2);
        pool.stop();
    }

    #[test]
    fn stop_drains_pending_work_before_joining() {
        let pool = Arc::new(TaskPool::new(TaskPoolConfig { capacity: 64 }));
        pool.start(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let c = Arc::clone(&counter);
            pool.add(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }
}
