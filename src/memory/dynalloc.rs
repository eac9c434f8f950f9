//! The segregated-fit dynamic allocator.
//!
//! Manages a contiguous region of pages, each either *unformatted* (on
//! the free-pages list) or formatted as a *slab* for one power-of-two
//! size class between `2^LOG2_MIN_SIZE` and `2^LOG2_MAX_SIZE`. Each
//! class keeps a free list of cells; a slab whose cells are all free is
//! unformatted again and its backing page returned.
//!
//! The allocator owns no frames itself: the [`PageSource`] seam hands
//! pages in and out, so the same allocator serves the kernel heap
//! (pages mapped eagerly) and the user heap (pages merely reserved and
//! faulted in on demand).

use alloc::vec::Vec;

use super::layout::{DYN_ALLOC_MAX_BLOCK_SIZE, DYN_ALLOC_MAX_SIZE, LOG2_MAX_SIZE, LOG2_MIN_SIZE};
use super::{AllocatorStatistics, VAddr, PAGE_SIZE};
use crate::error::KError;
use crate::prelude::PowersOf2;

/// Number of size classes.
pub const NUM_CLASSES: usize = (LOG2_MAX_SIZE - LOG2_MIN_SIZE + 1) as usize;

/// Smallest serveable block.
pub const MIN_BLOCK_SIZE: usize = 1 << LOG2_MIN_SIZE;

/// How a heap backs the allocator's pages.
pub trait PageSource {
    /// Make the page at `va` usable (map a frame for the kernel heap,
    /// reserve the page for the user heap).
    fn get_page(&mut self, va: VAddr) -> Result<(), KError>;

    /// Give the page at `va` back.
    fn return_page(&mut self, va: VAddr);

    /// Copy `len` bytes between two block addresses, for realloc.
    fn copy_block(&mut self, src: VAddr, dst: VAddr, len: usize);
}

#[derive(Clone, Copy)]
struct PageInfo {
    /// 0 while the page is unformatted, otherwise the slab's class size.
    block_size: u16,
    free_cells: u16,
}

impl PageInfo {
    const UNFORMATTED: PageInfo = PageInfo {
        block_size: 0,
        free_cells: 0,
    };
}

pub struct DynamicAllocator {
    start: VAddr,
    end: VAddr,
    pages: Vec<PageInfo>,
    /// Per-class free-cell lists; head is the vector tail.
    free_cells: Vec<Vec<VAddr>>,
    /// Unformatted pages, by page index.
    free_pages: Vec<usize>,
}

fn class_index(size: usize) -> usize {
    let rounded = size.max(MIN_BLOCK_SIZE).next_power_of_two();
    (rounded.log2() - LOG2_MIN_SIZE) as usize
}

fn class_size(class: usize) -> usize {
    1 << (LOG2_MIN_SIZE as usize + class)
}

impl DynamicAllocator {
    /// Set up the allocator over `[start, end)`; every page starts
    /// unformatted.
    pub fn new(start: VAddr, end: VAddr) -> DynamicAllocator {
        assert!(start.is_page_aligned() && end.is_page_aligned());
        assert!(end.as_u32() > start.as_u32());
        assert!(end - start <= DYN_ALLOC_MAX_SIZE);
        let npages = (end - start) / PAGE_SIZE;
        DynamicAllocator {
            start,
            end,
            pages: alloc::vec![PageInfo::UNFORMATTED; npages],
            free_cells: alloc::vec![Vec::new(); NUM_CLASSES],
            free_pages: (0..npages).rev().collect(),
        }
    }

    pub fn contains(&self, va: VAddr) -> bool {
        va >= self.start && va < self.end
    }

    fn page_index(&self, va: VAddr) -> usize {
        debug_assert!(self.contains(va));
        (va - self.start) / PAGE_SIZE
    }

    fn page_va(&self, idx: usize) -> VAddr {
        self.start + idx * PAGE_SIZE
    }

    /// The class size of the slab holding `va`, or 0 for an
    /// unformatted page.
    pub fn block_size(&self, va: VAddr) -> usize {
        self.pages[self.page_index(va)].block_size as usize
    }

    /// Allocate a block of at least `size` bytes.
    ///
    /// Serves the exact class first, then formats a fresh page, then
    /// falls back to a larger class (the block is returned unsplit and
    /// keeps the larger class). `OutOfMemory` means the caller may
    /// block on the allocation wait queue and retry.
    pub fn alloc_block<S: PageSource>(
        &mut self,
        size: usize,
        src: &mut S,
    ) -> Result<VAddr, KError> {
        if size == 0 {
            return Err(KError::ZeroAllocation);
        }
        if size > DYN_ALLOC_MAX_BLOCK_SIZE {
            return Err(KError::AllocationTooLarge { size });
        }
        let class = class_index(size);

        if let Some(va) = self.free_cells[class].pop() {
            let idx = self.page_index(va);
            self.pages[idx].free_cells -= 1;
            return Ok(va);
        }

        if let Some(idx) = self.free_pages.pop() {
            let pva = self.page_va(idx);
            if let Err(e) = src.get_page(pva) {
                self.free_pages.push(idx);
                return Err(e);
            }
            let bs = class_size(class);
            self.pages[idx] = PageInfo {
                block_size: bs as u16,
                free_cells: (PAGE_SIZE / bs) as u16,
            };
            for off in (0..PAGE_SIZE).step_by(bs) {
                self.free_cells[class].push(pva + off);
            }
            trace!("formatted page {} as a {}-byte slab", idx, bs);
            let va = self.free_cells[class].pop().unwrap();
            self.pages[idx].free_cells -= 1;
            return Ok(va);
        }

        // No page to format: serve from a larger class, unsplit.
        for bigger in class + 1..NUM_CLASSES {
            if let Some(va) = self.free_cells[bigger].pop() {
                let idx = self.page_index(va);
                self.pages[idx].free_cells -= 1;
                return Ok(va);
            }
        }

        Err(KError::OutOfMemory)
    }

    /// Free the block at `va`. Returns the page's base address when the
    /// slab dissolved and its page went back to the source.
    ///
    /// Panics on a free into an unformatted page — that is a corrupt
    /// caller, not a recoverable state.
    pub fn free_block<S: PageSource>(&mut self, va: VAddr, src: &mut S) -> Option<VAddr> {
        let idx = self.page_index(va);
        let info = self.pages[idx];
        assert!(
            info.block_size != 0,
            "free_block into unformatted page: {:#x}",
            va
        );
        let bs = info.block_size as usize;
        assert!(
            (va - self.page_va(idx)) % bs == 0,
            "free_block of a misaligned cell: {:#x}",
            va
        );
        let class = class_index(bs);

        self.free_cells[class].push(va);
        self.pages[idx].free_cells += 1;

        if self.pages[idx].free_cells as usize == PAGE_SIZE / bs {
            // Whole slab free: pull its cells out and unformat the page.
            let lo = self.page_va(idx);
            let hi = lo + PAGE_SIZE;
            self.free_cells[class].retain(|&cell| cell < lo || cell >= hi);
            src.return_page(lo);
            self.pages[idx] = PageInfo::UNFORMATTED;
            self.free_pages.push(idx);
            return Some(lo);
        }
        None
    }

    /// Grow or shrink a block. `None` in means plain allocation, size 0
    /// means free (returning `Ok(None)`). A block whose class already
    /// fits the new size is returned unchanged; otherwise a new block
    /// is allocated, the old contents copied, and the old block freed.
    pub fn realloc_block<S: PageSource>(
        &mut self,
        va: Option<VAddr>,
        new_size: usize,
        src: &mut S,
    ) -> Result<Option<VAddr>, KError> {
        match (va, new_size) {
            (None, 0) => Ok(None),
            (None, n) => self.alloc_block(n, src).map(Some),
            (Some(old), 0) => {
                self.free_block(old, src);
                Ok(None)
            }
            (Some(old), n) => {
                let cur = self.block_size(old);
                assert!(cur != 0, "realloc_block of a non-block address: {:#x}", old);
                if n <= cur {
                    return Ok(Some(old));
                }
                let new = self.alloc_block(n, src)?;
                src.copy_block(old, new, cur);
                self.free_block(old, src);
                Ok(Some(new))
            }
        }
    }

    /// Free cells currently on the list for the class of `size`.
    pub fn free_cells_in_class(&self, size: usize) -> usize {
        self.free_cells[class_index(size)].len()
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.len()
    }

    pub fn start_va(&self) -> VAddr {
        self.start
    }

    pub fn npages(&self) -> usize {
        self.pages.len()
    }

    /// Check the slab bookkeeping invariants; for tests.
    ///
    /// Every formatted page's free count matches the cells on its
    /// class list, and every listed cell lies inside a slab of its
    /// class.
    pub fn assert_consistent(&self) {
        for (idx, info) in self.pages.iter().enumerate() {
            if info.block_size == 0 {
                assert!(
                    self.free_pages.contains(&idx),
                    "unformatted page {} missing from the free-pages list",
                    idx
                );
                continue;
            }
            let bs = info.block_size as usize;
            let lo = self.page_va(idx);
            let hi = lo + PAGE_SIZE;
            let listed = self.free_cells[class_index(bs)]
                .iter()
                .filter(|&&c| c >= lo && c < hi)
                .count();
            assert_eq!(
                listed, info.free_cells as usize,
                "page {} free-cell count out of sync",
                idx
            );
        }
        for (class, cells) in self.free_cells.iter().enumerate() {
            for &cell in cells {
                let bs = self.block_size(cell);
                assert_eq!(
                    class_index(bs),
                    class,
                    "cell {:#x} listed under the wrong class",
                    cell
                );
            }
        }
    }
}

impl AllocatorStatistics for DynamicAllocator {
    fn allocated(&self) -> usize {
        self.pages
            .iter()
            .filter(|p| p.block_size != 0)
            .map(|p| {
                let bs = p.block_size as usize;
                (PAGE_SIZE / bs - p.free_cells as usize) * bs
            })
            .sum()
    }

    fn size(&self) -> usize {
        self.end - self.start
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::collections::HashSet;

    /// A page source backed by nothing: hands out up to `limit` pages
    /// and records which are live.
    pub struct MockSource {
        pub live: HashSet<u32>,
        pub limit: usize,
        pub copies: Vec<(VAddr, VAddr, usize)>,
    }

    impl MockSource {
        pub fn new(limit: usize) -> MockSource {
            MockSource {
                live: HashSet::new(),
                limit,
                copies: Vec::new(),
            }
        }
    }

    impl PageSource for MockSource {
        fn get_page(&mut self, va: VAddr) -> Result<(), KError> {
            if self.live.len() == self.limit {
                return Err(KError::OutOfMemory);
            }
            assert!(self.live.insert(va.as_u32()), "page handed out twice");
            Ok(())
        }

        fn return_page(&mut self, va: VAddr) {
            assert!(self.live.remove(&va.as_u32()), "returned a page never taken");
        }

        fn copy_block(&mut self, src: VAddr, dst: VAddr, len: usize) {
            self.copies.push((src, dst, len));
        }
    }

    fn da16() -> DynamicAllocator {
        let start = VAddr::from_u32(0xc000_0000);
        DynamicAllocator::new(start, start + 16 * PAGE_SIZE)
    }

    #[test]
    /// A 40-byte request is served from the 64-byte class; a second
    /// request comes from the same slab, and freeing the first leaves
    /// the second valid.
    fn alloc_rounds_to_class() {
        let mut da = da16();
        let mut src = MockSource::new(16);

        let p = da.alloc_block(40, &mut src).unwrap();
        assert_eq!(da.block_size(p), 64);

        let q = da.alloc_block(40, &mut src).unwrap();
        assert_ne!(p, q);
        assert_eq!(p.align_down(), q.align_down());

        da.free_block(p, &mut src);
        assert_eq!(da.block_size(q), 64);
        da.assert_consistent();
    }

    #[test]
    fn alloc_free_restores_state() {
        let mut da = da16();
        let mut src = MockSource::new(16);

        let free_pages_before = da.free_page_count();
        let p = da.alloc_block(100, &mut src).unwrap();
        assert_eq!(da.free_page_count(), free_pages_before - 1);

        da.free_block(p, &mut src);
        assert_eq!(da.free_page_count(), free_pages_before);
        assert_eq!(da.free_cells_in_class(100), 0);
        assert!(src.live.is_empty());
        da.assert_consistent();
    }

    #[test]
    fn zero_and_oversize_requests_are_rejected() {
        let mut da = da16();
        let mut src = MockSource::new(16);
        assert_eq!(da.alloc_block(0, &mut src), Err(KError::ZeroAllocation));
        assert_eq!(
            da.alloc_block(DYN_ALLOC_MAX_BLOCK_SIZE + 1, &mut src),
            Err(KError::AllocationTooLarge {
                size: DYN_ALLOC_MAX_BLOCK_SIZE + 1
            })
        );
    }

    #[test]
    /// With no free page left, a small request is served unsplit from a
    /// larger class.
    fn larger_class_serves_unsplit() {
        let mut da = da16();
        let mut src = MockSource::new(16);

        // Use up all 16 pages as 2048-byte slabs (2 cells each).
        let mut blocks = Vec::new();
        for _ in 0..32 {
            blocks.push(da.alloc_block(2048, &mut src).unwrap());
        }
        assert_eq!(da.free_page_count(), 0);

        // One freed 2048 cell, no unformatted page anywhere.
        da.free_block(blocks.pop().unwrap(), &mut src);
        let small = da.alloc_block(8, &mut src).unwrap();
        assert_eq!(da.block_size(small), 2048);
        da.assert_consistent();
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut da = da16();
        let mut src = MockSource::new(1);

        let mut blocks = Vec::new();
        for _ in 0..2 {
            blocks.push(da.alloc_block(2048, &mut src).unwrap());
        }
        assert_eq!(da.alloc_block(2048, &mut src), Err(KError::OutOfMemory));

        da.free_block(blocks.pop().unwrap(), &mut src);
        assert!(da.alloc_block(2048, &mut src).is_ok());
    }

    #[test]
    #[should_panic]
    fn free_into_unformatted_page_panics() {
        let mut da = da16();
        let mut src = MockSource::new(16);
        da.free_block(VAddr::from_u32(0xc000_2000), &mut src);
    }

    #[test]
    fn realloc_in_place_when_class_fits() {
        let mut da = da16();
        let mut src = MockSource::new(16);

        let p = da.alloc_block(100, &mut src).unwrap();
        assert_eq!(da.block_size(p), 128);
        assert_eq!(da.realloc_block(Some(p), 120, &mut src).unwrap(), Some(p));

        let q = da.realloc_block(Some(p), 200, &mut src).unwrap().unwrap();
        assert_ne!(q, p);
        assert_eq!(da.block_size(q), 256);
        assert_eq!(src.copies, vec![(p, q, 128)]);

        assert_eq!(da.realloc_block(Some(q), 0, &mut src).unwrap(), None);
        da.assert_consistent();
    }
}
