//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic memory
//! allocation algorithm¹, adapted to serve allocation requests out of a
//! single, caller-supplied, *position-independent* region of memory rather
//! than growing the process heap.
//!
//!  - **Allocation and deallocation operations are guaranteed to complete in
//!    constant time.** TLSF is suitable for real-time applications.
//!
//!  - **The memory region is provided by an application.** It may be an
//!    ordinary heap buffer, a `mmap`-ed file, or a shared-memory segment
//!    attached by more than one process. This crate never allocates the
//!    region itself; it only initializes and manages one that already
//!    exists (see [`Tlsf::new`]).
//!
//!  - **Internal linkage is self-relative.** Free-list links and the
//!    physical-neighbor chain are stored as [`Offset`]s from the region's
//!    own base rather than as absolute pointers, so a region mapped at
//!    different virtual addresses in cooperating processes still makes
//!    sense to every attacher (see [`Control::to_offset`]/[`Control::from_offset`]).
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications as well as in multi-process, shared-memory
//!    pools on a hosted OS.
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Examples
//!
//! ## Single-process, single-threaded
//!
//! ```rust
//! use tlsf_region::Tlsf;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = vec![MaybeUninit::uninit(); 65536];
//! let mut tlsf = Tlsf::new(&mut pool[..]).unwrap();
//!
//! let ptr1 = tlsf.allocate(64).unwrap();
//! let ptr2 = tlsf.allocate(128).unwrap();
//! assert_ne!(ptr1, ptr2);
//! unsafe {
//!     tlsf.deallocate(ptr1);
//!     tlsf.deallocate(ptr2);
//! }
//! ```
//!
//! ## Multi-threaded, single process
//!
//! Instantiate [`Tlsf`] with [`Spinlock`] to guard every mutation with a
//! single spinlock instead of relying on external serialization:
//!
//! ```rust
//! use tlsf_region::{Tlsf, Spinlock};
//! use std::mem::MaybeUninit;
//!
//! let mut pool = vec![MaybeUninit::uninit(); 65536];
//! let mut tlsf: Tlsf<'_, Spinlock> = Tlsf::new(&mut pool[..]).unwrap();
//! let ptr = tlsf.allocate(32).unwrap();
//! unsafe { tlsf.deallocate(ptr) };
//! ```
//!
//! # What this crate does *not* do
//!
//! Acquiring the backing region (shared-memory attach, file mapping, or
//! resolving its size/name from the environment — conventionally the two
//! environment variables an embedder might define for a shared region's
//! identifier and byte size) is the embedder's job, not this crate's.
//! Routing the language-level `alloc`/`dealloc` operators through a
//! [`Tlsf`] instance (a `#[global_allocator]`-style wrapper) is likewise an
//! embedder concern this crate does not provide, since that requires a
//! process-wide singleton and this crate's regions are explicitly meant to
//! also be non-process-wide (shared-memory pools). Growing a pool, running
//! multiple pools as one heap, per-thread arenas, and compaction are out of
//! scope; see `SPEC_FULL.md` in the repository for the full non-goal list.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod block;
mod consts;
mod control;
mod error;
mod init;
pub mod int;
mod sync;
mod utils;

pub use self::{
    block::{Offset, NULL_OFFSET},
    consts::{ALIGN, FL_COUNT, SL_COUNT},
    control::{BlockInfo, Violation},
    error::TlsfError,
    init::Init,
    sync::{NoSync, Spinlock, SyncPolicy},
};

#[cfg(unix)]
pub use self::sync::SharedMutex;

use core::{alloc::Layout, marker::PhantomData, mem, mem::MaybeUninit, ptr::NonNull};

use self::control::Control;

/// The allocator façade (spec §4.6 "public operations", §6 "external
/// interfaces"): a [`Control`] placed at the start of a caller-supplied
/// region, borrowed for the region's lifetime `'pool`.
///
/// `S` selects one of the three concurrency modes a region can be shared
/// under (spec §5): [`NoSync`] (the default — single-threaded, single
/// process), [`Spinlock`] (multi-threaded, single process), or
/// [`SharedMutex`] (multi-process, with blocking-on-exhaustion semantics).
/// Every attacher of a given region must agree on `S`; it is baked into the
/// region's byte layout the moment [`Tlsf::new`] runs.
pub struct Tlsf<'pool, S: SyncPolicy = NoSync> {
    control: NonNull<Control<S>>,
    _pool: PhantomData<&'pool mut [MaybeUninit<u8>]>,
}

// Safety: all mutable state lives behind `S::lock`/`S::unlock`, so a
// `Tlsf<S>` may cross thread boundaries precisely when `S` itself is safe to
// share (`NoSync` opts out: it upholds exclusion only by the caller's own
// discipline, same as the teacher crate's single-threaded `Tlsf`).
unsafe impl<S: SyncPolicy + Send> Send for Tlsf<'_, S> {}
unsafe impl<S: SyncPolicy + Sync> Sync for Tlsf<'_, S> {}

impl<'pool, S: SyncPolicy> Tlsf<'pool, S> {
    /// Initialize a fresh [`Control`] and pool over `region` (spec §4.6
    /// `Init(region, size)`), as the *first* attacher.
    ///
    /// For [`SharedMutex`], this also performs the one-time upgrade to
    /// `PTHREAD_PROCESS_SHARED` primitives (spec §5 mode 3: "the Control's
    /// mutex/condvar are initialized exactly once by the first attacher").
    /// Every subsequent attacher of the same region must use
    /// [`Self::attach`] instead, never `new` again — calling `new` a second
    /// time on an already-initialized region stomps its bitmaps and free
    /// lists out from under any other attacher.
    ///
    /// `region` must be large enough to hold the control header plus at
    /// least one allocatable block and the sentinel — in practice a region
    /// under a few hundred bytes will be rejected.
    pub fn new(region: &'pool mut [MaybeUninit<u8>]) -> Result<Self, TlsfError> {
        let (control, pool) = Self::layout(region)?;

        unsafe {
            Control::init(control);
            let control = control.as_ptr().as_mut().unwrap();
            control.init_shared();
            control.init_pool(pool)?;
        }

        Ok(Self {
            control,
            _pool: PhantomData,
        })
    }

    /// Attach to a region a prior call to [`Self::new`] (possibly in another
    /// process, for [`SharedMutex`]) already initialized, without touching
    /// its [`Control`] or pool contents (spec §5: "subsequent attachers must
    /// not re-initialize").
    ///
    /// # Safety
    /// `region` must be the exact byte range a successful [`Self::new`] call
    /// was given, still holding that call's [`Control`]/pool bytes untouched,
    /// and every attacher (including the one that called `new`) must agree
    /// on `S`.
    pub unsafe fn attach(region: &'pool mut [MaybeUninit<u8>]) -> Result<Self, TlsfError> {
        let (control, _pool) = Self::layout(region)?;
        Ok(Self {
            control,
            _pool: PhantomData,
        })
    }

    /// Shared bounds/alignment checks and control/pool pointer arithmetic for
    /// [`Self::new`] and [`Self::attach`].
    fn layout(
        region: &'pool mut [MaybeUninit<u8>],
    ) -> Result<(NonNull<Control<S>>, NonNull<[u8]>), TlsfError> {
        let control_bytes = mem::size_of::<Control<S>>();
        if (region.as_ptr() as usize) % mem::align_of::<Control<S>>() != 0 {
            return Err(TlsfError::Misaligned);
        }
        if region.len() < control_bytes {
            return Err(TlsfError::RegionTooSmall {
                supplied: region.len(),
                required: control_bytes,
            });
        }

        let base = region.as_mut_ptr() as *mut u8;
        let control: NonNull<Control<S>> = unsafe { NonNull::new_unchecked(base as *mut _) };
        let pool_start = unsafe { NonNull::new_unchecked(base.add(control_bytes)) };
        let pool =
            crate::utils::nonnull_slice_from_raw_parts(pool_start, region.len() - control_bytes);

        Ok((control, pool))
    }

    #[inline]
    fn control(&mut self) -> &mut Control<S> {
        // Safety: `self.control` was initialized by `Self::new` and is kept
        // alive for `'pool` by the borrow this `Tlsf` holds.
        unsafe { self.control.as_mut() }
    }

    #[inline]
    fn control_ref(&self) -> &Control<S> {
        unsafe { self.control.as_ref() }
    }

    /// Allocate `size` bytes, aligned to [`ALIGN`] (spec §4.6 `Allocate`).
    ///
    /// Returns `None` when no free block is large enough or `size` is
    /// degenerate (zero, or beyond the largest representable block). Under
    /// [`SharedMutex`] this blocks the caller until another participant
    /// frees enough memory instead of returning `None` for mere exhaustion
    /// (spec §5 mode 3).
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.control().allocate(size)
    }

    /// Allocate memory satisfying `layout`, for callers that think in terms
    /// of [`Layout`] rather than a raw size (teacher-style convenience atop
    /// [`Self::allocate`]).
    ///
    /// Returns `None` if `layout.align()` exceeds [`ALIGN`]: supporting
    /// alignment beyond the pool's native word alignment is out of scope
    /// (spec §1 Non-goals).
    #[inline]
    pub fn allocate_layout(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > ALIGN {
            return None;
        }
        self.allocate(layout.size())
    }

    /// Return a block previously obtained from [`Self::allocate`] or
    /// [`Self::allocate_layout`] on this same `Tlsf` (spec §4.6
    /// `Deallocate`).
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this `Tlsf`, not already freed.
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.control().deallocate(ptr)
    }

    /// Bytes currently handed out to callers.
    #[inline]
    pub fn used_size(&self) -> usize {
        self.control_ref().used_size()
    }

    /// Total bytes the pool can ever hold at once.
    #[inline]
    pub fn max_size(&self) -> usize {
        self.control_ref().max_size()
    }

    /// Fraction of [`Self::max_size`] currently in use, in `[0.0, 1.0]`
    /// (spec §6 `usage_rate`).
    #[inline]
    pub fn usage_rate(&self) -> f64 {
        self.control_ref().usage_rate()
    }

    /// Translate a live payload pointer into a position-independent
    /// [`Offset`], valid across every attacher of the same shared region
    /// (spec §4.6 "offset translation", §6 `to_offset`).
    #[inline]
    pub fn to_offset(&self, ptr: NonNull<u8>) -> Offset {
        self.control_ref().to_offset(ptr)
    }

    /// The inverse of [`Self::to_offset`] (spec §6 `from_offset`).
    ///
    /// # Safety
    /// `offset` must have been produced by [`Self::to_offset`] on this same
    /// region (possibly by another attacher sharing it) and still denote a
    /// live allocation.
    #[inline]
    pub unsafe fn from_offset(&self, offset: Offset) -> NonNull<u8> {
        self.control_ref().from_offset(offset)
    }

    /// Verify the allocator's internal invariants (spec §4.7, §8). Returns
    /// the first [`Violation`] found, if any.
    ///
    /// # Safety
    /// No other thread may be concurrently mutating this `Tlsf` for the
    /// duration of the check (the check itself takes no lock, so that it
    /// can run even under [`NoSync`]).
    #[inline]
    pub unsafe fn check(&self) -> Result<(), Violation> {
        self.control_ref().check()
    }

    /// Visit every physical block in the pool, in address order (spec §6
    /// `walk`). Performs no I/O and prints nothing; pairing this with a
    /// logger or a `println!` is left to the caller (spec §1: printing
    /// walkers are out of scope).
    ///
    /// # Safety
    /// No other thread may be concurrently mutating this `Tlsf` for the
    /// duration of the walk.
    #[inline]
    pub unsafe fn walk<F: FnMut(BlockInfo)>(&self, f: F) {
        self.control_ref().walk(f)
    }
}

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(test)]
mod tests;
