//! Geometry constants (spec §3 "Constants").
//!
//! These fix the two-level bitmap's shape once and for all instead of
//! exposing it as a type parameter the way the teacher crate's
//! `Tlsf<FLBitmap, SLBitmap, const FLLEN, const SLLEN>` does. The spec
//! requires a single canonical [`Control`](crate::control::Control) layout
//! that stays byte-identical across every attacher of a shared region
//! (spec §6: "fixed across all attachers — any change requires a new format
//! version"), so the parameters can't be a per-instantiation choice; they're
//! fixed `const`s derived from the pointer width instead.

/// `log2` of the number of second-level slots per first-level class.
pub const SL_INDEX_LOG2: u32 = 5;

/// Number of second-level slots per first-level class (`SL_COUNT = 32`).
pub const SL_COUNT: usize = 1 << SL_INDEX_LOG2;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// `log2` of the minimum alignment, in bytes.
        pub const ALIGN_LOG2: u32 = 3;
        /// Highest first-level index a block size can map to.
        pub const FL_INDEX_MAX: u32 = 32;
    } else {
        pub const ALIGN_LOG2: u32 = 2;
        pub const FL_INDEX_MAX: u32 = 30;
    }
}

/// Minimum alignment (and block-size granularity) in bytes.
pub const ALIGN: usize = 1 << ALIGN_LOG2;

/// `fl` is shifted down by this much so that `fl == 0` covers everything
/// below [`SMALL_BLOCK`].
pub const FL_SHIFT: u32 = SL_INDEX_LOG2 + ALIGN_LOG2;

/// Number of first-level rows in the free-list matrix.
pub const FL_COUNT: usize = (FL_INDEX_MAX - FL_SHIFT + 1) as usize;

/// Sizes below this go through the small-block linear mapping (`fl == 0`)
/// instead of the `fls`-based logarithmic one.
pub const SMALL_BLOCK: usize = 1 << FL_SHIFT;

const _: () = assert!(FL_COUNT <= 32, "fl_bitmap is a u32; FL_COUNT must fit");

#[inline]
pub(crate) const fn align_up(x: usize) -> usize {
    (x + (ALIGN - 1)) & !(ALIGN - 1)
}

#[inline]
pub(crate) const fn align_down(x: usize) -> usize {
    x & !(ALIGN - 1)
}
