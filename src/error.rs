//! Error types (spec §4.6, §7 "Error handling").
//!
//! The teacher crate never needs an error enum: `Tlsf::allocate` returns a
//! bare `Option<NonNull<u8>>` because the only failure mode is exhaustion.
//! Here `Control::init`/`init_pool` have more ways to fail (a caller-supplied
//! region can be too small, misaligned, or mismatched with an existing
//! region's format), so those get a real error type; `allocate` keeps the
//! teacher's `Option`, since exhaustion is its only failure mode too.

use core::fmt;

/// Why [`Control::init`](crate::control::Control::init) or
/// [`Control::init_pool`](crate::control::Control::init_pool) refused a
/// caller-supplied region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsfError {
    /// The region is smaller than the minimum needed to hold a `Control`
    /// plus one allocatable block plus the sentinel.
    RegionTooSmall {
        /// Bytes the caller supplied.
        supplied: usize,
        /// Bytes required at minimum.
        required: usize,
    },
    /// The region's starting address or length isn't a multiple of
    /// [`crate::consts::ALIGN`].
    Misaligned,
    /// The region is larger than [`crate::block::MAX_BLOCK_SIZE`] can
    /// address as a single pool.
    RegionTooLarge,
}

impl fmt::Display for TlsfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsfError::RegionTooSmall { supplied, required } => write!(
                f,
                "region of {supplied} bytes is smaller than the minimum of {required} bytes"
            ),
            TlsfError::Misaligned => {
                write!(f, "region start or length is not alignment-clean")
            }
            TlsfError::RegionTooLarge => {
                write!(f, "region exceeds the maximum size a single pool can address")
            }
        }
    }
}

#[cfg(any(test, feature = "std"))]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for TlsfError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn display_mentions_the_numbers() {
        let e = TlsfError::RegionTooSmall {
            supplied: 4,
            required: 128,
        };
        let s = e.to_string();
        assert!(s.contains('4'));
        assert!(s.contains("128"));
    }
}
