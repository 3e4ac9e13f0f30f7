//! Lock-free Sweep-And-Prune (SAP) ordered list.
//!
//! Objects are kept in a singly-owned arena, indexed by small integers, and
//! threaded into a position-ordered doubly linked list through a single
//! packed [`SapRef`] word per node. Every structural change — insertion,
//! removal, relocation — goes through a CAS retry loop on that word; there
//! is no lock anywhere on the hot path.
//!
//! The `prev` link is a locality hint, not an authoritative structure (see
//! the crate-level design notes in `DESIGN.md`, Option C): it speeds up
//! [`SapList::update_fast`], whose bounded retry budget falls back to a
//! `next`-only traversal if the hint turns out to be stale. `remove` also
//! reads `prev` to find the predecessor it splices — this mirrors the
//! source's own approach and its known unsoundness under heavy concurrent
//! mutation (spec §9): if another thread's insertion or removal has raced
//! ahead since `prev` was last fixed up, the splice can target a node that
//! is no longer the live predecessor. Insertion point search and query,
//! which never consult `prev`, remain correct regardless.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::Arena;
use crate::error::{BroadphaseError, PoolKind, Result};
use crate::packed::SapRef;

/// Maximum number of live nodes a [`SapList`] can address: `prev`/`next` are
/// 20-bit fields in the packed reference.
pub const MAX_CAPACITY: usize = 1 << 20;

/// Bounded retry budget for [`SapList::update_fast`] before it falls back to
/// [`SapList::update`]. Matches the source's `iters > 1000` fence.
const UPDATE_FAST_RETRY_BUDGET: u32 = 1000;

/// An opaque reference to a live node, returned by [`SapList::add`].
///
/// Carries a generation counter independent of the node's internal packed
/// reference so that using a handle after its node has been removed (and
/// possibly reused by another `add`) is reported as
/// [`BroadphaseError::StaleHandle`] rather than silently operating on the
/// wrong entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SapHandle {
    index: u32,
    generation: u32,
}

struct SapNode {
    // Written once by whichever `add`/`update` call owns this slot, before
    // the node is published into the live list via a CAS; read afterwards
    // by any thread walking the list. Synchronization is provided by the
    // publishing CAS's release and subsequent loads' acquire, matching the
    // source's plain-field node layout.
    eid: UnsafeCell<i32>,
    position: UnsafeCell<f32>,
    width: UnsafeCell<f32>,
    /// prev | next | counter | marked, meaningful while the node is live.
    link: AtomicU64,
}

// SAFETY: see the note on `eid`/`position`/`width` above.
unsafe impl Sync for SapNode {}

impl SapNode {
    fn blank() -> SapNode {
        SapNode {
            eid: UnsafeCell::new(0),
            position: UnsafeCell::new(0.0),
            width: UnsafeCell::new(0.0),
            link: AtomicU64::new(0),
        }
    }

    #[inline]
    fn eid(&self) -> i32 {
        unsafe { *self.eid.get() }
    }

    #[inline]
    fn position(&self) -> f32 {
        unsafe { *self.position.get() }
    }

    #[inline]
    fn width(&self) -> f32 {
        unsafe { *self.width.get() }
    }

    #[inline]
    fn init(&self, eid: i32, position: f32, width: f32) {
        unsafe {
            *self.eid.get() = eid;
            *self.position.get() = position;
            *self.width.get() = width;
        }
    }
}

/// A lock-free, position-ordered list of `[position, position + width]`
/// intervals.
pub struct SapList {
    arena: Arena<SapNode>,
    min_index: u32,
    max_index: u32,
}

impl SapList {
    /// Creates a list with room for `capacity` live nodes plus the two
    /// permanent sentinels. `capacity` must not exceed [`MAX_CAPACITY`].
    pub fn new(capacity: usize) -> SapList {
        assert!(
            capacity + 2 <= MAX_CAPACITY,
            "SAP capacity exceeds the 20-bit packed index range"
        );

        let arena = Arena::new(capacity + 2, SapNode::blank);
        let min_index = arena.allocate();
        let max_index = arena.allocate();

        arena.get(min_index).init(0, f32::NEG_INFINITY, 0.0);
        arena.get(max_index).init(0, f32::INFINITY, 0.0);
        arena
            .get(min_index)
            .link
            .store(SapRef::build(max_index, max_index, 0, false).0, Ordering::Relaxed);
        arena
            .get(max_index)
            .link
            .store(SapRef::build(min_index, min_index, 0, false).0, Ordering::Relaxed);

        SapList {
            arena,
            min_index,
            max_index,
        }
    }

    /// Total number of allocations this list has ever performed (including
    /// the two sentinels), used by the "no leaks" property in tests.
    pub fn allocated(&self) -> u64 {
        self.arena.allocated()
    }

    /// Total number of recycles this list has ever performed.
    pub fn freed(&self) -> u64 {
        self.arena.freed()
    }

    fn check_handle(&self, handle: SapHandle) -> Result<()> {
        if self.arena.is_current(handle.index, handle.generation) {
            Ok(())
        } else {
            Err(BroadphaseError::StaleHandle)
        }
    }

    /// Inserts a new interval, returning a handle linearizable at some point
    /// during the call, ordered by `position`.
    pub fn add(&self, eid: i32, position: f32, width: f32) -> SapHandle {
        let idx = self.arena.allocate();
        self.init_and_link(idx, eid, position, width)
    }

    /// As [`SapList::add`], but reports [`BroadphaseError::CapacityExhausted`]
    /// after `retries` failed allocation attempts instead of spinning.
    pub fn try_add(&self, eid: i32, position: f32, width: f32, retries: u32) -> Result<SapHandle> {
        let idx = self
            .arena
            .try_allocate(retries)
            .ok_or(BroadphaseError::CapacityExhausted { pool: PoolKind::Sap })?;
        Ok(self.init_and_link(idx, eid, position, width))
    }

    fn init_and_link(&self, idx: u32, eid: i32, position: f32, width: f32) -> SapHandle {
        let node = self.arena.get(idx);
        node.init(eid, position, width);
        node.link.store(0, Ordering::Relaxed);

        loop {
            let mut prev_idx = self.min_index;
            let mut prev = self.arena.get(prev_idx);
            let mut prev_ref = SapRef(prev.link.load(Ordering::Acquire));
            let mut curr_idx = prev_ref.next();
            let mut curr = self.arena.get(curr_idx);

            while curr.position() < position {
                prev_idx = curr_idx;
                prev = curr;
                prev_ref = SapRef(prev.link.load(Ordering::Acquire));
                curr_idx = prev_ref.next();
                curr = self.arena.get(curr_idx);
            }

            let published = SapRef(node.link.load(Ordering::Relaxed)).middle(prev_idx, curr_idx);
            node.link.store(published.0, Ordering::Relaxed);

            let new_prev_ref = prev_ref.to_next(idx, false);
            if prev
                .link
                .compare_exchange_weak(prev_ref.0, new_prev_ref.0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            // Advisory backward fix-up: retried until it succeeds, but never
            // a precondition for any other operation's correctness.
            loop {
                let cur = SapRef(node.link.load(Ordering::Acquire));
                let succ_idx = cur.next();
                let succ = self.arena.get(succ_idx);
                let succ_ref = SapRef(succ.link.load(Ordering::Acquire));
                let new_succ_ref = succ_ref.to_prev(idx, false);
                if succ
                    .link
                    .compare_exchange_weak(succ_ref.0, new_succ_ref.0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }

            return SapHandle {
                index: idx,
                generation: self.arena.generation(idx),
            };
        }
    }

    /// Removes a node, returning it to the free list. `handle` is invalid
    /// after this call returns `Ok`.
    pub fn remove(&self, handle: SapHandle) -> Result<()> {
        self.check_handle(handle)?;
        let idx = handle.index;
        let node = self.arena.get(idx);

        loop {
            let r = SapRef(node.link.load(Ordering::Acquire));
            if r.marked() {
                break;
            }
            let marked = r.marked_copy();
            if node
                .link
                .compare_exchange_weak(r.0, marked.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        loop {
            let r = SapRef(node.link.load(Ordering::Acquire));
            let prev_idx = r.prev();
            let succ_idx = r.next();
            let prev = self.arena.get(prev_idx);
            let prev_ref = SapRef(prev.link.load(Ordering::Acquire));
            let new_prev_ref = prev_ref.to_next(succ_idx, false);
            if prev
                .link
                .compare_exchange_weak(prev_ref.0, new_prev_ref.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        loop {
            let r = SapRef(node.link.load(Ordering::Acquire));
            let prev_idx = r.prev();
            let succ_idx = r.next();
            let succ = self.arena.get(succ_idx);
            let succ_ref = SapRef(succ.link.load(Ordering::Acquire));
            let new_succ_ref = succ_ref.to_prev(prev_idx, false);
            if succ
                .link
                .compare_exchange_weak(succ_ref.0, new_succ_ref.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        self.arena.recycle(idx);
        Ok(())
    }

    /// Moves a node to a new `(position, width)`. Equivalent to `add` then
    /// `remove`, atomic in appearance: the old handle is invalid after this
    /// returns `Ok`.
    pub fn update(&self, handle: SapHandle, position: f32, width: f32) -> Result<SapHandle> {
        self.check_handle(handle)?;
        let eid = self.arena.get(handle.index).eid();
        let new_handle = self.add(eid, position, width);
        self.remove(handle)?;
        Ok(new_handle)
    }

    /// As [`SapList::update`], but walks from the old node's `prev`/`next`
    /// links to exploit locality instead of restarting from the head
    /// sentinel. Falls back to [`SapList::update`] if the traversal exceeds
    /// [`UPDATE_FAST_RETRY_BUDGET`] steps (the `prev` chain is a hint, not a
    /// guarantee — see the crate-level design notes).
    pub fn update_fast(&self, handle: SapHandle, position: f32, width: f32) -> Result<SapHandle> {
        self.check_handle(handle)?;
        let old_idx = handle.index;
        let old_node = self.arena.get(old_idx);
        let eid = old_node.eid();

        let new_idx = self.arena.allocate();
        let new_node = self.arena.get(new_idx);
        new_node.init(eid, position, width);
        new_node.link.store(0, Ordering::Relaxed);

        let mut iters: u32 = 0;
        loop {
            let old_ref = SapRef(old_node.link.load(Ordering::Acquire));
            let mut prev_idx = old_ref.prev();
            let mut prev = self.arena.get(prev_idx);
            let mut prev_ref = SapRef(prev.link.load(Ordering::Acquire));
            let mut succ_idx = prev_ref.next();
            let mut succ = self.arena.get(succ_idx);

            loop {
                if position > succ.position() {
                    prev_idx = prev_ref.next();
                    prev = self.arena.get(prev_idx);
                    prev_ref = SapRef(prev.link.load(Ordering::Acquire));
                    succ_idx = prev_ref.next();
                    succ = self.arena.get(succ_idx);
                } else if position < prev.position() {
                    prev_idx = prev_ref.prev();
                    prev = self.arena.get(prev_idx);
                    prev_ref = SapRef(prev.link.load(Ordering::Acquire));
                    succ_idx = prev_ref.next();
                    succ = self.arena.get(succ_idx);
                } else {
                    break;
                }

                iters += 1;
                if iters > UPDATE_FAST_RETRY_BUDGET {
                    self.arena.recycle(new_idx);
                    return self.update(handle, position, width);
                }
            }

            let published = SapRef(new_node.link.load(Ordering::Relaxed)).middle(prev_idx, succ_idx);
            new_node.link.store(published.0, Ordering::Relaxed);

            let new_prev_ref = prev_ref.to_next(new_idx, false);
            if prev
                .link
                .compare_exchange_weak(prev_ref.0, new_prev_ref.0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            // Advisory; we don't care whether this succeeds.
            let succ_ref = SapRef(succ.link.load(Ordering::Acquire));
            let new_succ_ref = succ_ref.to_prev(new_idx, false);
            let _ = succ.link.compare_exchange_weak(
                succ_ref.0,
                new_succ_ref.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            self.remove(handle)?;
            return Ok(SapHandle {
                index: new_idx,
                generation: self.arena.generation(new_idx),
            });
        }
    }

    /// Invokes `f(self_eid, other_eid)` for every successor on the live
    /// list whose position lies within `[self.position, self.position +
    /// self.width]`.
    pub fn query_callback<F: FnMut(i32, i32)>(&self, handle: SapHandle, mut f: F) -> Result<()> {
        self.check_handle(handle)?;
        let node = self.arena.get(handle.index);
        let limit = node.position() + node.width();
        let self_eid = node.eid();

        let mut r = SapRef(node.link.load(Ordering::Acquire));
        loop {
            let curr_idx = r.next();
            let curr = self.arena.get(curr_idx);
            if curr.position() > limit {
                break;
            }
            f(self_eid, curr.eid());
            r = SapRef(curr.link.load(Ordering::Acquire));
        }
        Ok(())
    }

    /// Walks the forward chain once, logging each node's span at `debug`
    /// level. Diagnostic only.
    pub fn print(&self) {
        let mut idx = self.min_index;
        loop {
            let node = self.arena.get(idx);
            log::debug!(
                "{} @ {} to {}",
                node.eid(),
                node.position(),
                node.position() + node.width()
            );
            if idx == self.max_index {
                break;
            }
            let r = SapRef(node.link.load(Ordering::Acquire));
            idx = r.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_pairs(list: &SapList, handle: SapHandle) -> Vec<(i32, i32)> {
        let mut out = Vec::new();
        list.query_callback(handle, |a, b| out.push((a, b))).unwrap();
        out
    }

    #[test]
    fn empty_list_query_is_empty() {
        let list = SapList::new(16);
        let h = list.add(1, 50.0, 10.0);
        assert_eq!(collect_pairs(&list, h), vec![]);
    }

    #[test]
    fn three_overlap_scenario() {
        let list = SapList::new(16);
        let h1 = list.add(1, 0.0, 10.0);
        let h2 = list.add(2, 5.0, 10.0);
        let h3 = list.add(3, 20.0, 5.0);

        assert_eq!(collect_pairs(&list, h1), vec![(1, 2)]);
        assert_eq!(collect_pairs(&list, h2), vec![]);
        assert_eq!(collect_pairs(&list, h3), vec![]);
    }

    #[test]
    fn update_moves_past_neighbor() {
        let list = SapList::new(16);
        let h1 = list.add(1, 0.0, 1.0);
        let h2 = list.add(2, 10.0, 1.0);

        let h1 = list.update(h1, 20.0, 1.0).unwrap();

        assert_eq!(collect_pairs(&list, h2), vec![]);

        let h2 = list.update(h2, 10.0, 20.0).unwrap();
        assert_eq!(collect_pairs(&list, h2), vec![(2, 1)]);
        let _ = h1;
    }

    #[test]
    fn update_fast_matches_update() {
        let list = SapList::new(16);
        let h1 = list.add(1, 0.0, 1.0);
        let h2 = list.add(2, 10.0, 1.0);

        let h1 = list.update_fast(h1, 20.0, 1.0).unwrap();
        assert_eq!(collect_pairs(&list, h2), vec![]);

        let h2 = list.update_fast(h2, 10.0, 20.0).unwrap();
        assert_eq!(collect_pairs(&list, h2), vec![(2, 1)]);
        let _ = h1;
    }

    #[test]
    fn removed_handle_is_stale() {
        let list = SapList::new(16);
        let h = list.add(1, 0.0, 1.0);
        list.remove(h).unwrap();
        assert_eq!(list.remove(h), Err(BroadphaseError::StaleHandle));
        assert_eq!(
            list.query_callback(h, |_, _| {}),
            Err(BroadphaseError::StaleHandle)
        );
    }

    #[test]
    fn no_leaks_after_full_round_trip() {
        let list = SapList::new(64);
        let mut handles = Vec::new();
        for i in 0..32 {
            handles.push(list.add(i, i as f32 * 2.0, 1.0));
        }
        for h in handles.drain(..) {
            list.remove(h).unwrap();
        }
        assert_eq!(list.allocated() - list.freed(), 2);
    }

    #[test]
    fn capacity_exhaustion_is_reported_not_spun() {
        let list = SapList::new(2);
        let _a = list.add(1, 0.0, 1.0);
        let _b = list.add(2, 1.0, 1.0);
        let err = list.try_add(3, 2.0, 1.0, 64);
        assert_eq!(err, Err(BroadphaseError::CapacityExhausted { pool: PoolKind::Sap }));
    }
}
