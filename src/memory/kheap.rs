//! The cluster page allocator and the kernel-heap surface.
//!
//! Multi-page allocations live in the page-allocator region above the
//! dynamic-allocator region. A cluster is a run of contiguous pages
//! recorded by signed boundary tags in a flat per-page array: a free
//! cluster of `n+1` pages carries `+n` at its first and last page, an
//! allocated run carries `-n`, interior pages carry 0. A single-page
//! run therefore tags 0, which only the row index can tell apart from
//! an interior page — `rows[0]` is authoritative for one-page free
//! clusters.
//!
//! Free clusters are indexed by length (`rows[r]` holds starts of free
//! clusters of `r+1` pages) with a cached `(max_len, example)` pair for
//! worst-fit. Freeing coalesces with both neighbours; a cluster that
//! ends at the break retracts the break instead of being listed.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::dynalloc::{DynamicAllocator, PageSource};
use super::frames::FrameTable;
use super::layout::{LayoutParams, DYN_ALLOC_MAX_BLOCK_SIZE, MAX_CLUSTER_PAGES};
use super::vspace::{AddressSpace, PtePerms};
use super::{AllocatorStatistics, DataSize, PAddr, VAddr, PAGE_SIZE};
use crate::error::KError;
use crate::process::Pid;

/// How the page allocator picks a free cluster.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PlacementStrategy {
    /// Extend the break only; never reuse freed clusters.
    ContAlloc,
    /// Lowest-addressed free cluster that fits.
    FirstFit,
    /// Smallest free cluster that fits.
    BestFit,
    /// Like first fit, resuming after the previous allocation.
    NextFit,
    /// Largest free cluster.
    WorstFit,
    /// Exact-size row first, then worst fit, then the break.
    CustomFit,
}

impl Default for PlacementStrategy {
    fn default() -> Self {
        PlacementStrategy::CustomFit
    }
}

/// Boundary-tag arena over one page-allocator region.
pub struct ClusterArena {
    base: VAddr,
    npages: usize,
    tags: Vec<i32>,
    /// `rows[r]`: start indexes of free clusters of `r+1` pages.
    rows: Vec<Vec<usize>>,
    /// Cached `(length, example start)` of the largest free cluster;
    /// `(0, 0)` when no cluster is free.
    max_free: (usize, usize),
    /// Break, as a page count from `base`; pages at and above it have
    /// never been handed out (or were retracted back into it).
    brk_pages: usize,
    /// Rotor for next fit.
    next_hint: usize,
}

impl ClusterArena {
    pub fn new(base: VAddr, npages: usize) -> ClusterArena {
        assert!(base.is_page_aligned());
        ClusterArena {
            base,
            npages,
            tags: alloc::vec![0; npages],
            rows: alloc::vec![Vec::new(); npages],
            max_free: (0, 0),
            brk_pages: 0,
            next_hint: 0,
        }
    }

    pub fn base(&self) -> VAddr {
        self.base
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn brk(&self) -> VAddr {
        self.base + self.brk_pages * PAGE_SIZE
    }

    pub fn contains(&self, va: VAddr) -> bool {
        va >= self.base && va < self.base + self.npages * PAGE_SIZE
    }

    pub fn index_of(&self, va: VAddr) -> usize {
        debug_assert!(self.contains(va));
        (va - self.base) / PAGE_SIZE
    }

    pub fn page_va(&self, idx: usize) -> VAddr {
        self.base + idx * PAGE_SIZE
    }

    /// Raw boundary tag, for invariant checks.
    pub fn tag(&self, idx: usize) -> i32 {
        self.tags[idx]
    }

    pub fn max_free(&self) -> (usize, usize) {
        self.max_free
    }

    /// Length of the allocated run starting at `idx`, if `idx` starts
    /// one. A positive tag is a free cluster — the caller is freeing
    /// something twice or pointing into the middle of the region.
    pub fn run_len(&self, idx: usize) -> Option<usize> {
        if self.tags[idx] > 0 {
            return None;
        }
        if self.tags[idx] == 0 && self.rows[0].contains(&idx) {
            return None;
        }
        Some((-self.tags[idx]) as usize + 1)
    }

    fn is_free_start(&self, idx: usize) -> Option<usize> {
        if self.tags[idx] > 0 {
            Some(self.tags[idx] as usize + 1)
        } else if self.tags[idx] == 0 && self.rows[0].contains(&idx) {
            Some(1)
        } else {
            None
        }
    }

    fn insert_free(&mut self, start: usize, len: usize) {
        self.tags[start] = (len - 1) as i32;
        self.tags[start + len - 1] = (len - 1) as i32;
        self.rows[len - 1].push(start);
        if len > self.max_free.0 {
            self.max_free = (len, start);
        }
    }

    /// Detach a known free cluster from its row, refreshing the
    /// worst-fit cache by scanning rows downward when the largest row
    /// drained.
    fn remove_free(&mut self, start: usize, len: usize) {
        let row = &mut self.rows[len - 1];
        let pos = row
            .iter()
            .position(|&s| s == start)
            .expect("free-cluster index out of sync with boundary tags");
        row.swap_remove(pos);
        if len == self.max_free.0 {
            self.recompute_max();
        }
    }

    fn recompute_max(&mut self) {
        let from = self.max_free.0.min(self.npages);
        for r in (0..from).rev() {
            if let Some(&start) = self.rows[r].first() {
                self.max_free = (r + 1, start);
                return;
            }
        }
        self.max_free = (0, 0);
    }

    fn mark_allocated(&mut self, start: usize, pages: usize) {
        self.tags[start] = -((pages - 1) as i32);
        self.tags[start + pages - 1] = -((pages - 1) as i32);
    }

    /// Take a cluster of `total` pages starting at `start` off the free
    /// index, allocate its first `pages` pages, and reinsert the tail.
    fn split_take(&mut self, start: usize, total: usize, pages: usize) -> usize {
        self.remove_free(start, total);
        self.tags[start] = 0;
        self.tags[start + total - 1] = 0;
        self.mark_allocated(start, pages);
        if total > pages {
            self.insert_free(start + pages, total - pages);
        }
        start
    }

    fn extend_break(&mut self, pages: usize) -> Option<usize> {
        if self.brk_pages + pages > self.npages {
            return None;
        }
        let start = self.brk_pages;
        self.brk_pages += pages;
        self.mark_allocated(start, pages);
        Some(start)
    }

    fn worst_fit(&mut self, pages: usize) -> Option<usize> {
        let (len, start) = self.max_free;
        if len >= pages {
            Some(self.split_take(start, len, pages))
        } else {
            None
        }
    }

    fn first_fit_from(&mut self, pages: usize, from: usize) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for r in (pages - 1)..self.npages {
            for &s in self.rows[r].iter() {
                if s < from {
                    continue;
                }
                match best {
                    Some((bs, _)) if bs <= s => {}
                    _ => best = Some((s, r + 1)),
                }
            }
        }
        best.map(|(s, len)| self.split_take(s, len, pages))
    }

    fn best_fit(&mut self, pages: usize) -> Option<usize> {
        for r in (pages - 1)..self.npages {
            if let Some(&s) = self.rows[r].first() {
                return Some(self.split_take(s, r + 1, pages));
            }
        }
        None
    }

    /// Pick and allocate a run of `pages` pages. On success the run is
    /// tagged allocated; [`ClusterArena::release`] undoes it exactly,
    /// including a break retraction for break-extended runs.
    pub fn reserve(&mut self, pages: usize, strategy: PlacementStrategy) -> Option<usize> {
        debug_assert!(pages > 0);
        if pages > self.npages {
            return None;
        }
        let start = match strategy {
            PlacementStrategy::CustomFit => {
                if !self.rows[pages - 1].is_empty() {
                    // Serve the exact row from its head.
                    let s = self.rows[pages - 1].remove(0);
                    if pages == self.max_free.0 {
                        self.recompute_max();
                    }
                    self.tags[s] = 0;
                    self.tags[s + pages - 1] = 0;
                    self.mark_allocated(s, pages);
                    Some(s)
                } else {
                    self.worst_fit(pages).or_else(|| self.extend_break(pages))
                }
            }
            PlacementStrategy::WorstFit => {
                self.worst_fit(pages).or_else(|| self.extend_break(pages))
            }
            PlacementStrategy::FirstFit => self
                .first_fit_from(pages, 0)
                .or_else(|| self.extend_break(pages)),
            PlacementStrategy::BestFit => {
                self.best_fit(pages).or_else(|| self.extend_break(pages))
            }
            PlacementStrategy::NextFit => {
                let hint = self.next_hint;
                self.first_fit_from(pages, hint)
                    .or_else(|| self.first_fit_from(pages, 0))
                    .or_else(|| self.extend_break(pages))
            }
            PlacementStrategy::ContAlloc => self.extend_break(pages),
        };
        if let Some(s) = start {
            self.next_hint = s + pages;
        }
        start
    }

    /// Free the allocated run `[start, start + pages)`: coalesce with
    /// both neighbours, then either list the merged cluster or retract
    /// the break when the cluster ends at it.
    pub fn release(&mut self, start: usize, pages: usize) {
        self.tags[start] = 0;
        self.tags[start + pages - 1] = 0;

        let mut lo = start;
        let mut len = pages;

        // Upper neighbour: a free cluster starting right above us.
        let up = start + pages;
        if up < self.brk_pages {
            if let Some(ulen) = self.is_free_start(up) {
                self.remove_free(up, ulen);
                self.tags[up] = 0;
                self.tags[up + ulen - 1] = 0;
                len += ulen;
            }
        }

        // Lower neighbour: a free cluster ending right below us.
        if lo > 0 {
            let below = lo - 1;
            let llen = if self.tags[below] > 0 {
                Some(self.tags[below] as usize + 1)
            } else if self.tags[below] == 0 && self.rows[0].contains(&below) {
                Some(1)
            } else {
                None
            };
            if let Some(llen) = llen {
                let lstart = lo - llen;
                self.remove_free(lstart, llen);
                self.tags[lstart] = 0;
                self.tags[below] = 0;
                lo = lstart;
                len += llen;
            }
        }

        if lo + len == self.brk_pages {
            // Abuts the break: retract instead of listing.
            self.brk_pages = lo;
        } else {
            self.insert_free(lo, len);
        }
    }

    /// Check boundary-tag and index invariants; for tests.
    ///
    /// Tags at both ends of every cluster match, no interior page tags,
    /// no two adjacent free clusters, the cached maximum names a
    /// non-empty row.
    pub fn assert_consistent(&self) {
        let mut idx = 0;
        let mut prev_free = false;
        while idx < self.brk_pages {
            if let Some(len) = self.is_free_start(idx) {
                assert!(!prev_free, "adjacent free clusters at page {}", idx);
                assert_eq!(
                    self.tags[idx],
                    self.tags[idx + len - 1],
                    "free boundary tags disagree at {}",
                    idx
                );
                for i in idx + 1..idx + len - 1 {
                    assert_eq!(self.tags[i], 0, "interior page {} carries a tag", i);
                }
                prev_free = true;
                idx += len;
            } else {
                let len = (-self.tags[idx]) as usize + 1;
                assert_eq!(
                    self.tags[idx],
                    self.tags[idx + len - 1],
                    "allocated boundary tags disagree at {}",
                    idx
                );
                for i in idx + 1..idx + len - 1 {
                    assert_eq!(self.tags[i], 0, "interior page {} carries a tag", i);
                }
                prev_free = false;
                idx += len;
            }
        }
        let (max_len, example) = self.max_free;
        if max_len > 0 {
            assert!(!self.rows[max_len - 1].is_empty());
            assert!(self.rows[max_len - 1].contains(&example));
            for r in max_len..self.npages {
                assert!(self.rows[r].is_empty(), "row {} outgrew the cached maximum", r);
            }
        } else {
            assert!(self.rows.iter().all(|r| r.is_empty()));
        }
    }
}

impl AllocatorStatistics for ClusterArena {
    fn allocated(&self) -> usize {
        let mut pages = 0;
        let mut idx = 0;
        while idx < self.brk_pages {
            if let Some(len) = self.is_free_start(idx) {
                idx += len;
            } else {
                let len = (-self.tags[idx]) as usize + 1;
                pages += len;
                idx += len;
            }
        }
        pages * PAGE_SIZE
    }

    fn size(&self) -> usize {
        self.npages * PAGE_SIZE
    }
}

/// The kernel heap proper: the dynamic-allocator region, the cluster
/// arena above it, and the physical-to-virtual reverse map.
pub struct KernelHeap {
    pub(crate) da: DynamicAllocator,
    pub(crate) arena: ClusterArena,
    /// `frames_arr[pfn]`: the kernel-heap page this frame currently
    /// backs, for `kheap_virtual_address`.
    frames_arr: Vec<Option<VAddr>>,
    strategy: PlacementStrategy,
}

/// State guarded by the frame lock: the frame table, the kernel address
/// space, the kernel heap, and the allocation wait queue.
pub struct MemoryManager {
    pub frames: FrameTable,
    pub kpd: AddressSpace,
    pub heap: KernelHeap,
    pub wait_queue: VecDeque<Pid>,
}

/// Page source for the kernel heap: pages are backed eagerly by frames
/// mapped into the kernel address space, and the reverse map tracks
/// them.
struct KernelSource<'a> {
    frames: &'a mut FrameTable,
    kpd: &'a mut AddressSpace,
    frames_arr: &'a mut Vec<Option<VAddr>>,
}

impl<'a> PageSource for KernelSource<'a> {
    fn get_page(&mut self, va: VAddr) -> Result<(), KError> {
        let frame = self.frames.allocate_frame()?;
        if let Err(e) = self
            .kpd
            .map_frame(self.frames, frame, va, PtePerms::WRITEABLE)
        {
            self.frames.free_frame(frame);
            return Err(e);
        }
        self.frames_arr[frame.pfn()] = Some(va);
        Ok(())
    }

    fn return_page(&mut self, va: VAddr) {
        if let Some((pfn, _)) = self.kpd.resolve(va) {
            self.frames_arr[pfn] = None;
            self.kpd.unmap_frame(self.frames, va);
        }
    }

    fn copy_block(&mut self, src: VAddr, dst: VAddr, len: usize) {
        let mut buf = [0u8; PAGE_SIZE];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(PAGE_SIZE);
            self.kpd
                .read_bytes(self.frames, src + done, &mut buf[..n])
                .expect("kernel heap block not mapped");
            self.kpd
                .write_bytes(self.frames, dst + done, &buf[..n])
                .expect("kernel heap block not mapped");
            done += n;
        }
    }
}

impl MemoryManager {
    /// Bring up the kernel heap over `layout`.
    pub fn new(layout: &LayoutParams, nframes: usize) -> MemoryManager {
        let da = DynamicAllocator::new(layout.kernel_da_start(), layout.kernel_da_end());
        let arena = ClusterArena::new(layout.kheap_page_alloc_start(), layout.kheap_pages());
        info!(
            "kernel heap: {} dynamic, {} cluster pages",
            DataSize::from_bytes(layout.kernel_da_size),
            layout.kheap_pages()
        );
        MemoryManager {
            frames: FrameTable::new(nframes),
            kpd: AddressSpace::new(),
            heap: KernelHeap {
                da,
                arena,
                frames_arr: alloc::vec![None; nframes],
                strategy: PlacementStrategy::default(),
            },
            wait_queue: VecDeque::new(),
        }
    }

    pub fn strategy(&self) -> PlacementStrategy {
        self.heap.strategy
    }

    pub fn set_strategy(&mut self, strategy: PlacementStrategy) {
        self.heap.strategy = strategy;
    }

    /// Allocate `size` bytes from the kernel heap.
    ///
    /// Block-sized requests go to the dynamic allocator; anything
    /// larger claims a page cluster. The cluster path never partially
    /// succeeds: pages mapped before a failure are returned first.
    pub fn kmalloc(&mut self, size: usize) -> Result<VAddr, KError> {
        if size == 0 {
            return Err(KError::ZeroAllocation);
        }
        if size <= DYN_ALLOC_MAX_BLOCK_SIZE {
            let MemoryManager {
                frames, kpd, heap, ..
            } = self;
            let mut src = KernelSource {
                frames,
                kpd,
                frames_arr: &mut heap.frames_arr,
            };
            return heap.da.alloc_block(size, &mut src);
        }

        let pages = round_up!(size, PAGE_SIZE) / PAGE_SIZE;
        if pages > MAX_CLUSTER_PAGES {
            return Err(KError::AllocationTooLarge { size });
        }

        let strategy = self.heap.strategy;
        let MemoryManager {
            frames, kpd, heap, ..
        } = self;
        let start = match heap.arena.reserve(pages, strategy) {
            Some(s) => s,
            None => return Err(KError::OutOfMemory),
        };

        let mut src = KernelSource {
            frames,
            kpd,
            frames_arr: &mut heap.frames_arr,
        };
        for i in 0..pages {
            let va = heap.arena.page_va(start + i);
            if src.get_page(va).is_err() {
                for j in 0..i {
                    src.return_page(heap.arena.page_va(start + j));
                }
                heap.arena.release(start, pages);
                return Err(KError::OutOfMemory);
            }
        }
        trace!("kmalloc({}) -> cluster [{}..{}]", size, start, start + pages);
        Ok(heap.arena.page_va(start))
    }

    /// Free a kernel-heap allocation. Returns true when the address was
    /// a dynamic-allocator block.
    ///
    /// Panics on an address that starts no allocation — a corrupt tag
    /// or a double free.
    pub fn kfree(&mut self, va: VAddr) -> bool {
        let MemoryManager {
            frames, kpd, heap, ..
        } = self;
        let mut src = KernelSource {
            frames,
            kpd,
            frames_arr: &mut heap.frames_arr,
        };

        if heap.da.contains(va) {
            heap.da.free_block(va, &mut src);
            return true;
        }

        if heap.arena.contains(va) {
            assert!(va.is_page_aligned(), "kfree of an unaligned cluster: {:#x}", va);
            let start = heap.arena.index_of(va);
            let pages = heap
                .arena
                .run_len(start)
                .unwrap_or_else(|| panic!("kfree of a free or interior page: {:#x}", va));
            for i in 0..pages {
                src.return_page(heap.arena.page_va(start + i));
            }
            heap.arena.release(start, pages);
            return false;
        }

        panic!("kfree outside the kernel heap: {:#x}", va);
    }

    /// Grow or shrink an allocation, moving it between the dynamic
    /// allocator and the cluster arena as the size dictates.
    pub fn krealloc(&mut self, va: Option<VAddr>, new_size: usize) -> Result<Option<VAddr>, KError> {
        match (va, new_size) {
            (None, 0) => Ok(None),
            (None, n) => self.kmalloc(n).map(Some),
            (Some(old), 0) => {
                self.kfree(old);
                Ok(None)
            }
            (Some(old), n) => {
                let old_size = if self.heap.da.contains(old) {
                    let bs = self.heap.da.block_size(old);
                    assert!(bs != 0, "krealloc of a non-block address: {:#x}", old);
                    if n <= bs {
                        return Ok(Some(old));
                    }
                    bs
                } else {
                    assert!(
                        self.heap.arena.contains(old),
                        "krealloc outside the kernel heap: {:#x}",
                        old
                    );
                    let start = self.heap.arena.index_of(old);
                    let pages = self
                        .heap
                        .arena
                        .run_len(start)
                        .unwrap_or_else(|| panic!("krealloc of a free page: {:#x}", old));
                    if round_up!(n, PAGE_SIZE) / PAGE_SIZE == pages {
                        return Ok(Some(old));
                    }
                    pages * PAGE_SIZE
                };

                let new = self.kmalloc(n)?;
                let MemoryManager {
                    frames, kpd, heap, ..
                } = self;
                let mut src = KernelSource {
                    frames,
                    kpd,
                    frames_arr: &mut heap.frames_arr,
                };
                src.copy_block(old, new, old_size.min(n));
                self.kfree(old);
                Ok(Some(new))
            }
        }
    }

    /// Reverse-map a physical address to its kernel-heap virtual
    /// address. Misses lazily rebuild the dynamic-allocator entries by
    /// walking the kernel page tables over that region.
    pub fn kheap_virtual_address(&mut self, pa: PAddr) -> Option<VAddr> {
        let pfn = pa.pfn();
        if pfn >= self.heap.frames_arr.len() {
            return None;
        }
        if self.heap.frames_arr[pfn].is_none() {
            let start = self.heap.da.start_va();
            let npages = self.heap.da.npages();
            for i in 0..npages {
                let va = start + i * PAGE_SIZE;
                if let Some((p, _)) = self.kpd.resolve(va) {
                    self.heap.frames_arr[p] = Some(va);
                }
            }
        }
        self.heap.frames_arr[pfn].map(|page| page + pa.page_offset())
    }

    /// Walk the kernel page tables for the physical address of `va`.
    pub fn kheap_physical_address(&self, va: VAddr) -> Option<PAddr> {
        let (pfn, _) = self.kpd.resolve(va.align_down())?;
        Some(PAddr::from_u32(
            ((pfn as u32) << 12) | va.page_offset() as u32,
        ))
    }

    /// Copy bytes between kernel-heap addresses (used by realloc and
    /// tests).
    pub fn copy_kernel_bytes(&mut self, from: VAddr, to: VAddr, len: usize) {
        let MemoryManager {
            frames, kpd, heap, ..
        } = self;
        let mut src = KernelSource {
            frames,
            kpd,
            frames_arr: &mut heap.frames_arr,
        };
        src.copy_block(from, to, len);
    }
}
