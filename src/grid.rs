//! Lock-free uniform spatial hash grid.
//!
//! Each cell holds a Treiber-stack (singly linked, push-only) bucket of
//! membership nodes; an entity's `add` call also builds its own singly
//! linked reference list recording which cells it occupies, so later
//! `query_callback`/`return_refs` calls don't need to recompute anything.
//!
//! The source pools both membership nodes and reference-list nodes out of
//! one arena; this crate keeps them in two (see `DESIGN.md`) so `clear` —
//! which must wipe every membership node without touching any caller's
//! still-live reference list — doesn't need a node-kind tag to tell them
//! apart.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::Arena;
use crate::error::{BroadphaseError, PoolKind, Result};
use crate::packed::FreeRef;

struct GridNode {
    eid: UnsafeCell<i32>,
    bucket: UnsafeCell<i32>,
    next: AtomicU64,
}

// SAFETY: fields are written once before publication (bucket push / ref-list
// link store) and read only afterwards, under acquire/release on the
// publishing atomic.
unsafe impl Sync for GridNode {}

impl GridNode {
    fn blank() -> GridNode {
        GridNode {
            eid: UnsafeCell::new(0),
            bucket: UnsafeCell::new(-1),
            next: AtomicU64::new(0),
        }
    }

    #[inline]
    fn eid(&self) -> i32 {
        unsafe { *self.eid.get() }
    }

    #[inline]
    fn bucket(&self) -> i32 {
        unsafe { *self.bucket.get() }
    }

    #[inline]
    fn init(&self, eid: i32, bucket: i32) {
        unsafe {
            *self.eid.get() = eid;
            *self.bucket.get() = bucket;
        }
    }
}

/// Runtime-configurable sizing for a [`Grid`].
#[derive(Debug, Clone, Copy)]
pub struct GridConfig {
    pub width: u32,
    pub height: u32,
    pub cell_size: f32,
    pub member_capacity: usize,
    pub reflist_capacity: usize,
}

impl Default for GridConfig {
    fn default() -> GridConfig {
        GridConfig {
            width: 100,
            height: 100,
            cell_size: 100.0,
            member_capacity: 153_600,
            reflist_capacity: 51_200,
        }
    }
}

/// An opaque list of cells an entity occupies, returned by [`Grid::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRefList {
    head: u32,
    generation: u32,
}

/// A uniform spatial hash grid with toroidal (modulo) cell wraparound.
pub struct Grid {
    member_arena: Arena<GridNode>,
    reflist_arena: Arena<GridNode>,
    buckets: Vec<AtomicU64>,
    width: u32,
    height: u32,
    cell_size: f32,
}

impl Grid {
    pub fn new(config: GridConfig) -> Grid {
        let cell_count = config.width as usize * config.height as usize;
        let mut buckets = Vec::with_capacity(cell_count);
        buckets.resize_with(cell_count, || AtomicU64::new(0));

        Grid {
            member_arena: Arena::new(config.member_capacity, GridNode::blank),
            reflist_arena: Arena::new(config.reflist_capacity, GridNode::blank),
            buckets,
            width: config.width,
            height: config.height,
            cell_size: config.cell_size,
        }
    }

    fn cell_coords(&self, x: f32, y: f32) -> (i32, i32) {
        let col = (x / self.cell_size - 0.5).round() as i32;
        let row = (y / self.cell_size - 0.5).round() as i32;
        (row, col)
    }

    fn cell_index(&self, row: i32, col: i32) -> usize {
        let w = self.width as i32;
        let h = self.height as i32;
        let c = col.rem_euclid(w);
        let r = row.rem_euclid(h);
        (c + w * r) as usize
    }

    fn bucket_push(&self, cell: usize, node_idx: u32) {
        let node = self.member_arena.get(node_idx);
        loop {
            let head = FreeRef(self.buckets[cell].load(Ordering::Acquire));
            node.next.store(FreeRef::build(0, head.index()).0, Ordering::Relaxed);
            let new_head = FreeRef::build(head.counter().wrapping_add(1), node_idx + 1);
            if self.buckets[cell]
                .compare_exchange_weak(head.0, new_head.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn check_handle(&self, list: GridRefList) -> Result<()> {
        if self.reflist_arena.is_current(list.head, list.generation) {
            Ok(())
        } else {
            Err(BroadphaseError::StaleHandle)
        }
    }

    /// Inserts one membership node per cell covered by the AABB
    /// `(x1, y1)..(x2, y2)`, and returns the entity's own reference list.
    pub fn add(&self, eid: i32, x1: f32, y1: f32, x2: f32, y2: f32) -> GridRefList {
        self.add_impl(
            eid,
            x1,
            y1,
            x2,
            y2,
            &mut || Ok(self.member_arena.allocate()),
            &mut || Ok(self.reflist_arena.allocate()),
        )
        .expect("spinning allocation never reports capacity exhaustion")
    }

    /// As [`Grid::add`], but reports [`BroadphaseError::CapacityExhausted`]
    /// after `retries` failed allocations instead of spinning. Nodes
    /// allocated before the failing one are not rolled back; the caller
    /// should treat a failure here as fatal for the in-flight tick rather
    /// than retry the same entity.
    pub fn try_add(
        &self,
        eid: i32,
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        retries: u32,
    ) -> Result<GridRefList> {
        self.add_impl(
            eid,
            x1,
            y1,
            x2,
            y2,
            &mut || {
                self.member_arena
                    .try_allocate(retries)
                    .ok_or(BroadphaseError::CapacityExhausted { pool: PoolKind::Grid })
            },
            &mut || {
                self.reflist_arena
                    .try_allocate(retries)
                    .ok_or(BroadphaseError::CapacityExhausted { pool: PoolKind::Grid })
            },
        )
    }

    fn add_impl(
        &self,
        eid: i32,
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        alloc_member: &mut dyn FnMut() -> Result<u32>,
        alloc_ref: &mut dyn FnMut() -> Result<u32>,
    ) -> Result<GridRefList> {
        let (row0, col0) = self.cell_coords(x1, y1);
        let (row1, col1) = self.cell_coords(x2, y2);
        let (row_lo, row_hi) = (row0.min(row1), row0.max(row1));
        let (col_lo, col_hi) = (col0.min(col1), col0.max(col1));

        let head_idx = alloc_ref()?;
        let header = self.reflist_arena.get(head_idx);
        header.init(eid, -1);
        header.next.store(FreeRef::NULL.0, Ordering::Relaxed);
        let mut tail_idx = head_idx;

        for row in row_lo..=row_hi {
            for col in col_lo..=col_hi {
                let cell = self.cell_index(row, col);

                let member_idx = alloc_member()?;
                self.member_arena.get(member_idx).init(eid, cell as i32);
                self.bucket_push(cell, member_idx);

                let ref_idx = alloc_ref()?;
                let ref_node = self.reflist_arena.get(ref_idx);
                ref_node.init(0, cell as i32);
                ref_node.next.store(FreeRef::NULL.0, Ordering::Relaxed);

                self.reflist_arena
                    .get(tail_idx)
                    .next
                    .store(FreeRef::build(0, ref_idx + 1).0, Ordering::Relaxed);
                tail_idx = ref_idx;
            }
        }

        Ok(GridRefList {
            head: head_idx,
            generation: self.reflist_arena.generation(head_idx),
        })
    }

    /// Recycles every membership node in every bucket. Not safe to run
    /// concurrently with `add`/`query_callback` (documented, matching the
    /// source; no runtime check enforces this).
    pub fn clear(&self) {
        for cell in 0..self.buckets.len() {
            let mut cursor = FreeRef(self.buckets[cell].swap(0, Ordering::AcqRel));
            while let Some(idx) = cursor.index0() {
                let node = self.member_arena.get(idx);
                let next = FreeRef(node.next.load(Ordering::Relaxed));
                self.member_arena.recycle(idx);
                cursor = next;
            }
        }
    }

    /// Recycles `list`'s own reference-list nodes. Does not touch bucket
    /// membership nodes; those are only released by `clear`.
    pub fn return_refs(&self, list: GridRefList) -> Result<()> {
        self.check_handle(list)?;
        let mut idx = list.head;
        loop {
            let node = self.reflist_arena.get(idx);
            let next = FreeRef(node.next.load(Ordering::Relaxed));
            self.reflist_arena.recycle(idx);
            match next.index0() {
                Some(n) => idx = n,
                None => break,
            }
        }
        Ok(())
    }

    /// Emits `f(self_eid, other_eid)` once for every distinct `other_eid >
    /// self_eid` present in any bucket `list` occupies.
    pub fn query_callback<F: FnMut(i32, i32)>(&self, list: GridRefList, mut f: F) -> Result<()> {
        self.check_handle(list)?;
        let header = self.reflist_arena.get(list.head);
        let self_eid = header.eid();

        let mut seen: Vec<i32> = Vec::new();
        let mut cursor = FreeRef(header.next.load(Ordering::Acquire));
        while let Some(ref_idx) = cursor.index0() {
            let ref_node = self.reflist_arena.get(ref_idx);
            let cell = ref_node.bucket() as usize;

            let mut bcursor = FreeRef(self.buckets[cell].load(Ordering::Acquire));
            while let Some(member_idx) = bcursor.index0() {
                let member = self.member_arena.get(member_idx);
                let other_eid = member.eid();
                if other_eid > self_eid {
                    if let Err(pos) = seen.binary_search(&other_eid) {
                        seen.insert(pos, other_eid);
                        f(self_eid, other_eid);
                    }
                }
                bcursor = FreeRef(member.next.load(Ordering::Acquire));
            }

            cursor = FreeRef(ref_node.next.load(Ordering::Acquire));
        }
        Ok(())
    }
}
