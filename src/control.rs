//! The segregated free-list control structure (spec §3 "Control", §4.2
//! "Size-class mapping", §4.3 "Free-list lookup", §4.4 "Splitting and
//! trimming", §4.5 "Coalescing", §4.6 "Allocator operations", §4.7
//! "Invariant checking", §6 "Walking").
//!
//! This plays the role of the teacher's `Tlsf<'pool, FLBitmap, SLBitmap,
//! FLLEN, SLLEN>`, but where that type borrows its pool for a lifetime `'pool`
//! and is generic over the bitmap widths, `Control` owns a fixed-size,
//! `#[repr(C)]` matrix sized for one canonical layout (see `consts.rs`) and
//! is meant to be placed *at the start of* the memory region it manages, so
//! that every attacher — including ones in other processes, per spec §5 mode
//! 3 — can find it at the region's base address and resolve every
//! [`Offset`] relative to their own local mapping of it.

use core::{mem, ptr::NonNull};

use crate::{
    block::{
        adjust_request_size, BlockHeader, Offset, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, NULL_OFFSET,
        OVERHEAD,
    },
    consts::{ALIGN, ALIGN_LOG2, FL_COUNT, SL_COUNT, SL_INDEX_LOG2, SMALL_BLOCK},
    error::TlsfError,
    init::Init,
    int::{ffs, ffs_from, fls_usize},
    sync::{NoSync, SyncPolicy},
    utils::{nonnull_slice_len, nonnull_slice_start},
};

/// Map a block size to the `(fl, sl)` coordinates of the free list it
/// belongs in (spec §4.2, "floor" mapping). Grounded on
/// `original_source/vcalloc/control.h`'s `MappingInsert`.
fn mapping_insert(size: usize) -> (usize, usize) {
    debug_assert!(size > 0);
    if size < SMALL_BLOCK {
        (0, size >> ALIGN_LOG2)
    } else {
        let fl_raw = fls_usize(size).unwrap();
        let sl = (size >> (fl_raw - SL_INDEX_LOG2)) & (SL_COUNT - 1);
        let fl = (fl_raw - (crate::consts::FL_SHIFT - 1)) as usize;
        (fl, sl)
    }
}

/// Map a requested size to the `(fl, sl)` coordinates to *search* from (spec
/// §4.3, "ceiling" mapping): rounds `size` up to the top of its size class
/// first, so any free block found this way is guaranteed big enough.
/// Grounded on `original_source/vcalloc/control.h`'s `MappingSearch`.
fn mapping_search(size: usize) -> (usize, usize) {
    if size >= SMALL_BLOCK {
        let fl_raw = fls_usize(size).unwrap();
        let round = (1usize << (fl_raw - SL_INDEX_LOG2)) - 1;
        mapping_insert(size + round)
    } else {
        mapping_insert(size)
    }
}

/// A defect found by [`Control::check`] (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Violation {
    /// `fl_bitmap`/`sl_bitmap` disagree with which `(fl, sl)` lists are
    /// actually non-empty.
    BitmapMismatch,
    /// A block linked into list `(fl, sl)` doesn't actually map to `(fl,
    /// sl)` under [`mapping_insert`], or isn't marked free.
    FreeListEntryMismatch,
    /// Two physically adjacent blocks are both free (should have been
    /// coalesced).
    UncoalescedNeighbors,
    /// A block's `is_prev_free`/physical-neighbor linkage disagrees with its
    /// neighbor's actual state.
    PhysicalLinkageBroken,
    /// The chain of physical blocks doesn't end in a used, zero-size
    /// sentinel.
    MissingSentinel,
}

/// A block as reported by [`Control::walk`].
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// The block's usable size, as returned by [`BlockHeader::size`].
    pub size: usize,
    /// Whether the block is currently free.
    pub is_free: bool,
}

#[cfg_attr(doc, svgbobdoc::transform)]
/// The segregated free-list allocator state (spec §3 "Control").
///
/// `S` selects one of spec §5's three concurrency modes; see [`SyncPolicy`].
/// Every participant sharing a region must instantiate the same `S`, since
/// it's part of this type's layout.
///
/// # Data structure overview
///
/// <center>
/// ```svgbob
///   First level
///                                                                    FL_COUNT
///                            ,-----+-----+-----+-----+-----+-----+-----+-----,
///          fl_bitmap: u32  = |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///                            +-----+-----+-----+-----+-----+-----+-----+-----+
///                                              |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second level                                |
///                                               v                   SL_COUNT
///                               ,-----+-----+-----+-----+-----+-----+-----,
///      sl_bitmap[fl]: u32    =  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///                               +-----+-----+-----+-----+-----+-----+-----+
///                     heads[fl][sl]: Offset -----'
/// ```
/// </center>
#[repr(C)]
pub struct Control<S: SyncPolicy = NoSync> {
    sync: S,
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_COUNT],
    heads: [[Offset; SL_COUNT]; FL_COUNT],
    /// Offset of the pool's first block header, set once by [`Self::init_pool`].
    pool_offset: Offset,
    used_size: usize,
    max_size: usize,
}

impl<S: SyncPolicy> Init for Control<S> {
    const INIT: Self = Self {
        sync: S::INIT,
        fl_bitmap: 0,
        sl_bitmap: [0; FL_COUNT],
        heads: [[NULL_OFFSET; SL_COUNT]; FL_COUNT],
        pool_offset: NULL_OFFSET,
        used_size: 0,
        max_size: 0,
    };
}

/// Bytes a region must be at minimum for [`Control::init_pool`] to accept it:
/// spec §4.6 step 2's `pool_overhead = 2 × overhead` (one word for the gap
/// before the first block's virtual `prev_phys`, one for the sentinel's
/// header tail) plus the smallest possible first block.
pub const MIN_POOL_SIZE: usize = 2 * OVERHEAD + MIN_BLOCK_SIZE;

impl<S: SyncPolicy> Control<S> {
    /// Construct a fresh, pool-less `Control` in place at `region`'s start.
    ///
    /// # Safety
    /// `region` must be valid for writes for `mem::size_of::<Self>()` bytes
    /// and suitably aligned for `Self`.
    pub unsafe fn init(region: NonNull<Self>) {
        region.as_ptr().write(Self::INIT);
    }

    /// Upgrade `self.sync` for sharing with other attachers, if `S` needs it
    /// (spec §5: "the Control's mutex/condvar are initialized exactly once
    /// by the first attacher").
    ///
    /// # Safety
    /// Must be called exactly once, by the first attacher, after
    /// [`Self::init`] and before any other attacher calls any method that
    /// locks `self.sync`.
    pub unsafe fn init_shared(&self) {
        self.sync.init_shared();
    }

    /// Register the memory following this `Control` (or any other
    /// caller-chosen, disjoint region) as the pool this allocator serves.
    ///
    /// Only one pool per `Control` is supported (spec Non-goals: growable,
    /// multi-region heaps are out of scope).
    ///
    /// # Safety
    /// `pool` must be valid for reads and writes for its entire length,
    /// live for as long as `self` is in use, and not otherwise aliased.
    pub unsafe fn init_pool(&mut self, pool: NonNull<[u8]>) -> Result<(), TlsfError> {
        let start = nonnull_slice_start(pool);
        let len = nonnull_slice_len(pool);

        if start.as_ptr() as usize % ALIGN != 0 {
            return Err(TlsfError::Misaligned);
        }
        let aligned_len = crate::consts::align_down(len);
        if aligned_len < MIN_POOL_SIZE {
            return Err(TlsfError::RegionTooSmall {
                supplied: len,
                required: MIN_POOL_SIZE,
            });
        }

        // spec §4.6 step 2 / §9 "Pool prologue trick": `pool_size` is the
        // size stamped on the first block itself, with `2 × overhead`
        // reserved around it — one word for its own virtual `prev_phys`
        // (never dereferenced, since the first block can never be the
        // successor of anything) and one for the sentinel's header tail.
        let block_size = aligned_len - 2 * OVERHEAD;
        if block_size >= MAX_BLOCK_SIZE {
            return Err(TlsfError::RegionTooLarge);
        }

        // Offset the header `OVERHEAD` bytes before `start` so its
        // `prev_phys` field falls outside the pool — it is never read,
        // since `first` is never anyone's physical successor.
        let first: NonNull<BlockHeader> =
            NonNull::new_unchecked(start.as_ptr().sub(OVERHEAD)).cast();
        BlockHeader::init_raw(first, block_size);
        let sentinel = BlockHeader::next_phys(first);
        BlockHeader::init_raw(sentinel, 0);

        self.pool_offset = self.offset_of(first);
        self.max_size = block_size;
        self.used_size = OVERHEAD;

        BlockHeader::mark_as_free(first);
        self.insert_free_block(first);

        Ok(())
    }

    #[inline]
    fn offset_of(&self, block: NonNull<BlockHeader>) -> Offset {
        block.as_ptr() as usize - self as *const Self as usize
    }

    #[inline]
    unsafe fn block_at(&self, offset: Offset) -> NonNull<BlockHeader> {
        debug_assert_ne!(offset, NULL_OFFSET);
        NonNull::new_unchecked((self as *const Self as usize + offset) as *mut BlockHeader)
    }

    /// Translate a live payload pointer into a [`Control`]-relative offset
    /// stable across attachers of the same region (spec §4.6
    /// "offset translation").
    pub fn to_offset(&self, ptr: NonNull<u8>) -> Offset {
        ptr.as_ptr() as usize - self as *const Self as usize
    }

    /// The inverse of [`Self::to_offset`].
    ///
    /// # Safety
    /// `offset` must have been produced by [`Self::to_offset`] on this same
    /// `Control` (or an equally-laid-out attacher of the same region) and
    /// still denote a live allocation.
    pub unsafe fn from_offset(&self, offset: Offset) -> NonNull<u8> {
        NonNull::new_unchecked((self as *const Self as usize + offset) as *mut u8)
    }

    // -- free-list bookkeeping (spec §4.3) ---------------------------------

    unsafe fn insert_free_block(&mut self, mut block: NonNull<BlockHeader>) {
        let (fl, sl) = mapping_insert(block.as_ref().size());
        let head = self.heads[fl][sl];
        let block_offset = self.offset_of(block);

        block.as_mut().next_free = head;
        block.as_mut().prev_free = NULL_OFFSET;
        if head != NULL_OFFSET {
            self.block_at(head).as_mut().prev_free = block_offset;
        }
        self.heads[fl][sl] = block_offset;
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
    }

    unsafe fn remove_free_block(&mut self, block: NonNull<BlockHeader>, fl: usize, sl: usize) {
        let prev = block.as_ref().prev_free;
        let next = block.as_ref().next_free;

        if next != NULL_OFFSET {
            self.block_at(next).as_mut().prev_free = prev;
        }
        if prev != NULL_OFFSET {
            self.block_at(prev).as_mut().next_free = next;
        } else {
            self.heads[fl][sl] = next;
            if next == NULL_OFFSET {
                self.sl_bitmap[fl] &= !(1 << sl);
                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap &= !(1 << fl);
                }
            }
        }
    }

    /// Find the `(fl, sl)` of the smallest non-empty free list that can
    /// satisfy a request of `size` bytes, if any (spec §4.3).
    fn search_suitable_block(&self, size: usize) -> Option<(usize, usize)> {
        let (fl, sl) = mapping_search(size);
        if fl >= FL_COUNT {
            return None;
        }
        if let Some(sl) = ffs_from(self.sl_bitmap[fl], sl as u32) {
            return Some((fl, sl as usize));
        }
        let fl_map = if fl + 1 < u32::BITS as usize {
            self.fl_bitmap & (u32::MAX << (fl + 1))
        } else {
            0
        };
        let fl = ffs(fl_map)? as usize;
        let sl = ffs(self.sl_bitmap[fl])?;
        Some((fl, sl as usize))
    }

    // -- splitting and coalescing (spec §4.4, §4.5) ------------------------

    /// Carve a used block of `size` bytes out of `block`, reinserting any
    /// leftover remainder into the free lists.
    unsafe fn prepare_used(&mut self, block: NonNull<BlockHeader>, size: usize) {
        if block.as_ref().can_split(size) {
            let remaining = BlockHeader::split(block, size);
            BlockHeader::mark_as_free(remaining);
            self.insert_free_block(remaining);
        }
        BlockHeader::mark_as_used(block);
    }

    /// Absorb `right` into `left`, restamping the physical chain past the
    /// merged block. Neither block may still be linked into a free list.
    unsafe fn merge(&self, mut left: NonNull<BlockHeader>, right: NonNull<BlockHeader>) -> NonNull<BlockHeader> {
        let merged = left.as_ref().size() + OVERHEAD + right.as_ref().size();
        left.as_mut().set_size(merged);
        BlockHeader::link_next(left);
        left
    }

    // -- allocation / deallocation (spec §4.6) -----------------------------

    /// Allocate `size` bytes, returning `None` if no free block is big
    /// enough (or, in non-blocking modes, if the request is degenerate: zero
    /// or larger than [`crate::block::MAX_BLOCK_SIZE`]).
    ///
    /// Under [`SyncPolicy::BLOCKING`] policies (spec §5 mode 3), this blocks
    /// the calling thread until another participant frees enough memory,
    /// rather than returning `None` for mere exhaustion.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let adjusted = adjust_request_size(size)?;
        self.sync.lock();
        loop {
            if let Some((fl, sl)) = self.search_suitable_block(adjusted) {
                unsafe {
                    let block = self.block_at(self.heads[fl][sl]);
                    self.remove_free_block(block, fl, sl);
                    self.prepare_used(block, adjusted);
                    // `block.size()` reflects the post-split size when a
                    // split happened, or the whole donated block otherwise
                    // (internal fragmentation); either way it matches what
                    // `deallocate` will later subtract (spec §4.6 step 4:
                    // "used_size += B.size + overhead").
                    self.used_size += block.as_ref().size() + OVERHEAD;
                    let ptr = BlockHeader::to_ptr(block);
                    self.sync.unlock();
                    return Some(ptr);
                }
            }
            if S::BLOCKING {
                unsafe { self.sync.wait() };
            } else {
                unsafe { self.sync.unlock() };
                return None;
            }
        }
    }

    /// Return a previously [`Self::allocate`]d block to the pool.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by [`Self::allocate`] on
    /// this same pool, not already deallocated.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let mut block = BlockHeader::from_ptr(ptr);
        self.sync.lock();

        // spec §4.6 step 5: "used_size -= B.size + overhead".
        self.used_size -= block.as_ref().size() + OVERHEAD;

        let next = BlockHeader::next_phys(block);
        if next.as_ref().is_free() {
            let (fl, sl) = mapping_insert(next.as_ref().size());
            self.remove_free_block(next, fl, sl);
            block = self.merge(block, next);
        }
        if block.as_ref().is_prev_free() {
            let prev = BlockHeader::prev_phys(block);
            let (fl, sl) = mapping_insert(prev.as_ref().size());
            self.remove_free_block(prev, fl, sl);
            block = self.merge(prev, block);
        }
        BlockHeader::mark_as_free(block);
        self.insert_free_block(block);

        if S::BLOCKING {
            self.sync.notify();
        }
        self.sync.unlock();
    }

    /// Bytes currently handed out to callers.
    pub fn used_size(&self) -> usize {
        self.used_size
    }

    /// Total bytes the pool can ever hold at once (spec §4.6 "usage
    /// statistics"); fixed at [`Self::init_pool`] time since growable pools
    /// are out of scope.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Fraction of [`Self::max_size`] currently in use, in `[0.0, 1.0]`.
    pub fn usage_rate(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.used_size as f64 / self.max_size as f64
        }
    }

    // -- diagnostics (spec §4.7, §6) ----------------------------------------

    /// Visit every physical block in the pool, in address order, without
    /// mutating anything. Unlike the original `vcalloc::Walk`, this never
    /// prints: the caller's closure decides what, if anything, to do with
    /// each [`BlockInfo`] (spec §6 "no printf-style debug walker").
    ///
    /// # Safety
    /// `self` must have a pool installed via [`Self::init_pool`].
    pub unsafe fn walk<F: FnMut(BlockInfo)>(&self, mut f: F) {
        let mut cur = self.block_at(self.pool_offset);
        loop {
            let hdr = cur.as_ref();
            f(BlockInfo {
                size: hdr.size(),
                is_free: hdr.is_free(),
            });
            if hdr.is_sentinel() {
                break;
            }
            cur = BlockHeader::next_phys(cur);
        }
    }

    /// Verify the allocator's internal invariants (spec §4.7). Intended for
    /// tests and debug builds, not the allocation hot path.
    ///
    /// # Safety
    /// `self` must have a pool installed via [`Self::init_pool`].
    pub unsafe fn check(&self) -> Result<(), Violation> {
        for fl in 0..FL_COUNT {
            let fl_set = self.fl_bitmap & (1 << fl) != 0;
            if fl_set != (self.sl_bitmap[fl] != 0) {
                return Err(Violation::BitmapMismatch);
            }
            for sl in 0..SL_COUNT {
                let sl_set = self.sl_bitmap[fl] & (1 << sl) != 0;
                let head = self.heads[fl][sl];
                if sl_set != (head != NULL_OFFSET) {
                    return Err(Violation::BitmapMismatch);
                }
                if head != NULL_OFFSET {
                    let block = self.block_at(head);
                    let block = block.as_ref();
                    if !block.is_free() || mapping_insert(block.size()) != (fl, sl) {
                        return Err(Violation::FreeListEntryMismatch);
                    }
                }
            }
        }

        let mut cur = self.block_at(self.pool_offset);
        let mut prev_was_free = false;
        loop {
            let hdr = cur.as_ref();
            if hdr.is_free() {
                if prev_was_free {
                    return Err(Violation::UncoalescedNeighbors);
                }
                let (fl, sl) = mapping_insert(hdr.size());
                if fl >= FL_COUNT || self.heads[fl][sl] == NULL_OFFSET {
                    return Err(Violation::FreeListEntryMismatch);
                }
            }
            if hdr.is_sentinel() {
                if hdr.is_free() {
                    return Err(Violation::MissingSentinel);
                }
                return Ok(());
            }
            let next = BlockHeader::next_phys(cur);
            if next.as_ref().is_prev_free() != hdr.is_free() {
                return Err(Violation::PhysicalLinkageBroken);
            }
            prev_was_free = hdr.is_free();
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sync::NoSync, utils::nonnull_slice_from_raw_parts};
    use std::alloc::Layout;

    /// Leaks a suitably-aligned buffer and carves a `Control<NoSync>` plus
    /// its pool out of it. Tests don't free it; the process exits shortly
    /// after anyway.
    fn fresh_pool(bytes: usize) -> NonNull<Control<NoSync>> {
        let layout = Layout::from_size_align(bytes, 4096).unwrap();
        let raw = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
        let control_ptr: NonNull<Control<NoSync>> = raw.cast();
        unsafe {
            Control::init(control_ptr);
            let control_bytes = mem::size_of::<Control<NoSync>>();
            let pool_start = NonNull::new(raw.as_ptr().add(control_bytes)).unwrap();
            let pool = nonnull_slice_from_raw_parts(pool_start, bytes - control_bytes);
            control_ptr.as_ptr().as_mut().unwrap().init_pool(pool).unwrap();
        }
        control_ptr
    }

    #[test]
    fn mapping_insert_small_blocks_are_linear() {
        assert_eq!(mapping_insert(ALIGN), (0, 1));
        assert_eq!(mapping_insert(SMALL_BLOCK - ALIGN), (0, (SMALL_BLOCK - ALIGN) >> ALIGN_LOG2));
    }

    #[test]
    fn mapping_search_rounds_up_to_at_least_insert_class() {
        let size = SMALL_BLOCK * 3 + ALIGN;
        let (fl_i, sl_i) = mapping_insert(size);
        let (fl_s, sl_s) = mapping_search(size);
        assert!((fl_s, sl_s) >= (fl_i, sl_i));
    }

    #[test]
    fn allocate_then_deallocate_round_trips() {
        let mut control = fresh_pool(1 << 16);
        unsafe {
            let control = control.as_mut();
            // spec §4.6 step 3: `used_size` starts at one `overhead`, not
            // zero, and every alloc/dealloc pair should return to it.
            let baseline = control.used_size();
            assert_eq!(baseline, OVERHEAD);
            let a = control.allocate(64).unwrap();
            let b = control.allocate(128).unwrap();
            assert_ne!(a, b);
            assert!(control.check().is_ok());
            control.deallocate(a);
            control.deallocate(b);
            assert!(control.check().is_ok());
            assert_eq!(control.used_size(), baseline);
        }
    }

    #[test]
    fn deallocate_coalesces_adjacent_free_blocks() {
        let mut control = fresh_pool(1 << 16);
        unsafe {
            let control = control.as_mut();
            let a = control.allocate(64).unwrap();
            let b = control.allocate(64).unwrap();
            let c = control.allocate(64).unwrap();
            control.deallocate(a);
            control.deallocate(c);
            assert!(control.check().is_ok());
            control.deallocate(b);
            assert!(control.check().is_ok());

            // With everything freed and coalesced, a large allocation should
            // succeed again.
            let d = control.allocate(1024).unwrap();
            assert!(control.check().is_ok());
            control.deallocate(d);
        }
    }

    #[test]
    fn exhaustion_returns_none_without_blocking_policy() {
        let mut control = fresh_pool(1 << 12);
        unsafe {
            let control = control.as_mut();
            let mut allocations = Vec::new();
            while let Some(p) = control.allocate(32) {
                allocations.push(p);
            }
            assert!(control.allocate(32).is_none());
            for p in allocations {
                control.deallocate(p);
            }
        }
    }
}
