extern crate std;

use std::{alloc::Layout, collections::BTreeMap, ops::Range, ptr::NonNull};

pub struct ShadowAllocator {
    regions: BTreeMap<usize, SaRegion>,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SaRegion {
    Free,
    Used,
    Invalid,
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self {
            regions: Some((0, SaRegion::Invalid)).into_iter().collect(),
        }
    }

    pub fn convert_range(
        &mut self,
        range: Range<usize>,
        old_region: SaRegion,
        new_region: SaRegion,
    ) {
        if range.len() == 0 {
            return;
        }

        assert_ne!(old_region, new_region);
        log::trace!(
            "sa: converting {:?} from {:?} to {:?}",
            range,
            old_region,
            new_region
        );

        let (&addr, &region) = self.regions.range(0..range.end).rev().next().unwrap();
        if addr > range.start {
            panic!("there's a discontinuity in range {:?}", range);
        } else if region != old_region {
            panic!(
                "range {:?} is {:?} (expected {:?})",
                range, region, old_region
            );
        }

        // Insert an element at `range.start`
        if addr == range.start {
            *self.regions.get_mut(&addr).unwrap() = new_region;
        } else {
            self.regions.insert(range.start, new_region);
        }

        // Each element must represent a discontinuity. If it doesnt't represent
        // a discontinuity, it must be removed.
        if let Some((_, &region)) = self.regions.range(0..range.start).rev().next() {
            if region == new_region {
                self.regions.remove(&range.start);
            }
        }

        if let Some(&end_region) = self.regions.get(&range.end) {
            // Each element must represent a discontinuity. If it doesnt't
            // represent a discontinuity, it must be removed.
            if end_region == new_region {
                self.regions.remove(&range.end);
            }
        } else {
            // Insert an element at `range.end`
            self.regions.insert(range.end, old_region);
        }
    }

    pub fn insert_free_block(&mut self, start: NonNull<u8>, end: NonNull<u8>) {
        self.convert_range(
            start.as_ptr() as usize..end.as_ptr() as usize,
            SaRegion::Invalid,
            SaRegion::Free,
        );
    }

    pub fn allocate(&mut self, layout: Layout, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        let len = layout.size();
        assert!(
            start % layout.align() == 0,
            "0x{:x} is not properly aligned (0x{:x} bytes alignment required)",
            start,
            layout.align()
        );
        self.convert_range(start..start + len, SaRegion::Free, SaRegion::Used);
    }

    pub fn deallocate(&mut self, layout: Layout, start: NonNull<u8>) {
        let start = start.as_ptr() as usize;
        let len = layout.size();
        assert!(
            start % layout.align() == 0,
            "0x{:x} is not properly aligned (0x{:x} bytes alignment required)",
            start,
            layout.align()
        );
        self.convert_range(start..start + len, SaRegion::Used, SaRegion::Free);
    }
}

#[cfg(test)]
mod scenarios {
    //! Direct scenarios from spec.md §8 "End-to-end scenarios", exercised
    //! through the public [`crate::Tlsf`] facade rather than [`Control`]
    //! directly.

    use crate::Tlsf;
    use std::{mem::MaybeUninit, vec::Vec};

    fn pool(bytes: usize) -> Vec<MaybeUninit<u8>> {
        vec![MaybeUninit::uninit(); bytes]
    }

    #[test]
    fn minimal() {
        let mut buf = pool(4096);
        let mut tlsf = Tlsf::new(&mut buf[..]).unwrap();
        let initial_max = tlsf.max_size();
        // spec §4.6 step 3: `used_size` starts at one `overhead`, not zero.
        let initial_used = tlsf.used_size();

        let p = tlsf.allocate(100).unwrap();
        assert_eq!(p.as_ptr() as usize % crate::ALIGN, 0);
        unsafe { tlsf.deallocate(p) };

        assert_eq!(tlsf.used_size(), initial_used);
        assert_eq!(tlsf.max_size(), initial_max);
        assert!(unsafe { tlsf.check() }.is_ok());
    }

    /// alloc, dealloc, alloc, alloc: a freed block gets reused rather than
    /// growing the pool further.
    #[test]
    fn adaa() {
        let mut buf = pool(1 << 16);
        let mut tlsf = Tlsf::new(&mut buf[..]).unwrap();

        let a = tlsf.allocate(200).unwrap();
        unsafe { tlsf.deallocate(a) };
        let b = tlsf.allocate(200).unwrap();
        let c = tlsf.allocate(200).unwrap();
        assert_eq!(a, b, "the freed block should be reused verbatim");
        assert_ne!(b, c);
        assert!(unsafe { tlsf.check() }.is_ok());
    }

    /// alloc, alloc, dealloc, dealloc: freeing both in either order
    /// coalesces back to a single free block (spec scenario 2).
    #[test]
    fn aadd() {
        for reverse in [false, true] {
            let mut buf = pool(1 << 16);
            let mut tlsf = Tlsf::new(&mut buf[..]).unwrap();
            let initial_max = tlsf.max_size();
            let initial_used = tlsf.used_size();

            let a = tlsf.allocate(200).unwrap();
            let b = tlsf.allocate(200).unwrap();
            if reverse {
                unsafe {
                    tlsf.deallocate(b);
                    tlsf.deallocate(a);
                }
            } else {
                unsafe {
                    tlsf.deallocate(a);
                    tlsf.deallocate(b);
                }
            }
            assert_eq!(tlsf.used_size(), initial_used);
            assert_eq!(tlsf.max_size(), initial_max);
            assert!(unsafe { tlsf.check() }.is_ok());
        }
    }

    #[test]
    fn exhaustion_then_free_recovers() {
        let mut buf = pool(1024);
        let mut tlsf = Tlsf::new(&mut buf[..]).unwrap();

        let mut allocs = Vec::new();
        while let Some(p) = tlsf.allocate(128) {
            allocs.push(p);
        }
        assert!(unsafe { tlsf.check() }.is_ok());
        assert!(tlsf.allocate(128).is_none());

        let freed = allocs.pop().unwrap();
        unsafe { tlsf.deallocate(freed) };
        assert!(tlsf.allocate(128).is_some());
    }

    /// Emulates spec scenario 5 (cross-process handles) within one process:
    /// an offset captured from one allocation resolves back to the same
    /// payload bytes through the same `Control`.
    #[test]
    fn offset_round_trip() {
        let mut buf = pool(1 << 16);
        let mut tlsf = Tlsf::new(&mut buf[..]).unwrap();

        let ptr = tlsf.allocate(64).unwrap();
        unsafe { *ptr.as_ptr() = 0x42 };

        let off = tlsf.to_offset(ptr);
        let resolved = unsafe { tlsf.from_offset(off) };
        assert_eq!(ptr, resolved);
        assert_eq!(unsafe { *resolved.as_ptr() }, 0x42);
    }
}

#[cfg(test)]
mod proptests {
    //! Shadow-allocator property test (spec.md §8 round-trip/stress
    //! scenarios), adapted from the teacher crate's own
    //! `Tlsf`-against-`ShadowAllocator` fuzz harness.

    use quickcheck_macros::quickcheck;
    use std::{alloc::Layout, mem::MaybeUninit, vec::Vec};

    use super::ShadowAllocator;
    use crate::Tlsf;

    #[quickcheck]
    fn random(pool_size: u16, bytecode: Vec<u8>) {
        random_inner(pool_size, bytecode);
    }

    fn random_inner(pool_size: u16, bytecode: Vec<u8>) -> Option<()> {
        let _ = env_logger::builder().is_test(true).try_init();

        // Stay comfortably above the minimum pool size so most bytecodes
        // exercise real allocation traffic instead of bottoming out on the
        // very first `Tlsf::new` call.
        let pool_size = 512 + pool_size as usize;
        let mut buf = vec![MaybeUninit::uninit(); pool_size];
        let buf_start = std::ptr::NonNull::new(buf.as_mut_ptr() as *mut u8)?;
        let buf_end = unsafe { std::ptr::NonNull::new_unchecked(buf_start.as_ptr().add(pool_size)) };
        let mut tlsf = Tlsf::new(&mut buf[..]).ok()?;
        let mut sa = ShadowAllocator::new();
        // The control header occupies a prefix of `buf` that `allocate`
        // never hands out, so marking the whole buffer free up front is
        // sound: the shadow only ever sees addresses `allocate` returned.
        sa.insert_free_block(buf_start, buf_end);

        struct Alloc {
            ptr: std::ptr::NonNull<u8>,
            layout: Layout,
        }
        let mut allocs: Vec<Alloc> = Vec::new();

        let mut it = bytecode.iter().cloned();
        loop {
            match it.next()? % 4 {
                0 | 1 => {
                    let len = (it.next()? as usize) * (it.next()? as usize);
                    let layout = Layout::from_size_align(len.max(1), crate::ALIGN).ok()?;
                    if let Some(ptr) = tlsf.allocate(layout.size()) {
                        sa.allocate(
                            Layout::from_size_align(layout.size(), crate::ALIGN).unwrap(),
                            ptr,
                        );
                        allocs.push(Alloc { ptr, layout });
                    }
                }
                _ => {
                    let i = it.next()?;
                    if !allocs.is_empty() {
                        let a = allocs.swap_remove(i as usize % allocs.len());
                        sa.deallocate(
                            Layout::from_size_align(a.layout.size(), crate::ALIGN).unwrap(),
                            a.ptr,
                        );
                        unsafe { tlsf.deallocate(a.ptr) };
                    }
                }
            }
            assert!(unsafe { tlsf.check() }.is_ok());
            assert!(tlsf.used_size() <= tlsf.max_size());
        }
    }
}
