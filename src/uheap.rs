//! The user-side heap.
//!
//! Mirrors the kernel heap's shape per process: a dynamic-allocator
//! region for block-sized requests and a cluster region above it for
//! multi-page ones. The difference is backing: user pages are only
//! *reserved* (tagged `UHPAGE` in the page tables) and faulted in on
//! demand, so allocation never consumes frames.
//!
//! Shared objects (`smalloc`/`sget`) borrow their virtual range from
//! the same cluster region. A freed shared range stays quarantined —
//! still reserved in the arena — until the object's last reference is
//! gone, so a plain `malloc` can never reuse the range while another
//! process still maps the object.

use alloc::vec::Vec;

use crate::error::KError;
use crate::memory::dynalloc::{DynamicAllocator, PageSource};
use crate::memory::frames::FrameTable;
use crate::memory::kheap::{ClusterArena, PlacementStrategy};
use crate::memory::layout::{LayoutParams, DYN_ALLOC_MAX_BLOCK_SIZE, MAX_CLUSTER_PAGES};
use crate::memory::vspace::{AddressSpace, PtePerms};
use crate::memory::{VAddr, PAGE_SIZE};
use crate::pagefile::PageFile;
use crate::process::{Pid, WorkingSet};

/// A shared-object mapping inside one process's heap.
#[derive(Clone, Copy, Debug)]
pub struct SharedRegion {
    pub va: VAddr,
    pub id: u32,
    pub pages: usize,
}

/// Backs the user heap: reserving a page tags it `UHPAGE`; returning
/// one drops its frame, its page-file copy, and its working-set entry.
pub struct UserSource<'a> {
    pub pid: Pid,
    pub pd: &'a mut AddressSpace,
    pub frames: &'a mut FrameTable,
    pub pagefile: &'a mut PageFile,
    pub ws: &'a mut WorkingSet,
}

impl<'a> PageSource for UserSource<'a> {
    fn get_page(&mut self, va: VAddr) -> Result<(), KError> {
        self.pd.set_pte_perms(self.frames, va, PtePerms::UHPAGE)
    }

    fn return_page(&mut self, va: VAddr) {
        self.pd.clear_pte(self.frames, va);
        self.pagefile.remove_env_page(self.pid, va);
        self.ws.remove_range(va, va + PAGE_SIZE);
    }

    fn copy_block(&mut self, src: VAddr, dst: VAddr, len: usize) {
        // Copies must see through demand paging: a non-resident page's
        // truth lives in the page file (or is all zeros).
        let mut done = 0;
        while done < len {
            let s = src + done;
            let d = dst + done;
            let n = (len - done)
                .min(PAGE_SIZE - s.page_offset())
                .min(PAGE_SIZE - d.page_offset());

            let mut chunk = [0u8; PAGE_SIZE];
            self.read_through(s, &mut chunk[..n]);
            self.write_through(d, &chunk[..n]);
            done += n;
        }
    }
}

impl<'a> UserSource<'a> {
    fn read_through(&mut self, va: VAddr, buf: &mut [u8]) {
        let page = va.align_down();
        let off = va.page_offset();
        if let Some((pfn, _)) = self.pd.resolve(page) {
            buf.copy_from_slice(&self.frames.data(pfn)[off..off + buf.len()]);
            return;
        }
        let mut copy = [0u8; PAGE_SIZE];
        if self.pagefile.read_env_page(self.pid, page, &mut copy).is_ok() {
            buf.copy_from_slice(&copy[off..off + buf.len()]);
        } else {
            buf.fill(0);
        }
    }

    fn write_through(&mut self, va: VAddr, buf: &[u8]) {
        let page = va.align_down();
        let off = va.page_offset();
        if let Some((pfn, _)) = self.pd.resolve(page) {
            self.frames.data_mut(pfn)[off..off + buf.len()].copy_from_slice(buf);
            let _ = self
                .pd
                .set_pte_perms(self.frames, page, PtePerms::USED | PtePerms::MODIFIED);
            return;
        }
        // Not resident: stage the bytes in the page file so the next
        // fault reads them back.
        let mut copy = [0u8; PAGE_SIZE];
        let _ = self.pagefile.read_env_page(self.pid, page, &mut copy);
        copy[off..off + buf.len()].copy_from_slice(buf);
        if self.pagefile.update_env_page(self.pid, page, &copy).is_err() {
            warn!(
                "pid {}: page file full while staging a realloc copy at {:#x}",
                self.pid, page
            );
        }
    }
}

pub struct UserHeap {
    da: DynamicAllocator,
    arena: ClusterArena,
    strategy: PlacementStrategy,
    shared: Vec<SharedRegion>,
    quarantine: Vec<SharedRegion>,
}

impl UserHeap {
    pub fn new(layout: &LayoutParams) -> UserHeap {
        UserHeap {
            da: DynamicAllocator::new(layout.user_da_start(), layout.user_da_end()),
            arena: ClusterArena::new(layout.uheap_page_alloc_start(), layout.uheap_pages()),
            strategy: PlacementStrategy::default(),
            shared: Vec::new(),
            quarantine: Vec::new(),
        }
    }

    pub fn brk(&self) -> VAddr {
        self.arena.brk()
    }

    pub fn arena(&self) -> &ClusterArena {
        &self.arena
    }

    pub fn da(&self) -> &DynamicAllocator {
        &self.da
    }

    /// Allocate `size` bytes of demand-paged user memory.
    pub fn malloc(&mut self, size: usize, src: &mut UserSource) -> Result<VAddr, KError> {
        if size == 0 {
            return Err(KError::ZeroAllocation);
        }
        if size <= DYN_ALLOC_MAX_BLOCK_SIZE {
            return self.da.alloc_block(size, src);
        }

        let pages = round_up!(size, PAGE_SIZE) / PAGE_SIZE;
        if pages > MAX_CLUSTER_PAGES {
            return Err(KError::AllocationTooLarge { size });
        }
        let start = match self.arena.reserve(pages, self.strategy) {
            Some(s) => s,
            None => return Err(KError::OutOfMemory),
        };
        for i in 0..pages {
            let va = self.arena.page_va(start + i);
            if src.get_page(va).is_err() {
                for j in 0..i {
                    src.return_page(self.arena.page_va(start + j));
                }
                self.arena.release(start, pages);
                return Err(KError::OutOfMemory);
            }
        }
        Ok(self.arena.page_va(start))
    }

    /// Free a `malloc` allocation. Shared mappings must go through
    /// `sfree`; freeing one here is refused.
    pub fn free(&mut self, va: VAddr, src: &mut UserSource) -> Result<(), KError> {
        if self.da.contains(va) {
            self.da.free_block(va, src);
            return Ok(());
        }
        if self.arena.contains(va) {
            if self.shared.iter().any(|r| r.va == va) {
                warn!("free() of a shared mapping at {:#x}; use sfree", va);
                return Err(KError::BadAddress { va: va.as_u32() });
            }
            if self.quarantine.iter().any(|r| r.va == va) {
                return Err(KError::BadAddress { va: va.as_u32() });
            }
            let start = self.arena.index_of(va);
            let pages = self
                .arena
                .run_len(start)
                .ok_or(KError::BadAddress { va: va.as_u32() })?;
            for i in 0..pages {
                src.return_page(self.arena.page_va(start + i));
            }
            self.arena.release(start, pages);
            return Ok(());
        }
        Err(KError::BadAddress { va: va.as_u32() })
    }

    /// Grow or shrink an allocation, copying through demand paging.
    pub fn realloc(
        &mut self,
        va: Option<VAddr>,
        new_size: usize,
        src: &mut UserSource,
    ) -> Result<Option<VAddr>, KError> {
        match (va, new_size) {
            (None, 0) => Ok(None),
            (None, n) => self.malloc(n, src).map(Some),
            (Some(old), 0) => {
                self.free(old, src)?;
                Ok(None)
            }
            (Some(old), n) => {
                let old_size = if self.da.contains(old) {
                    let bs = self.da.block_size(old);
                    if bs == 0 {
                        return Err(KError::BadAddress { va: old.as_u32() });
                    }
                    if n <= bs {
                        return Ok(Some(old));
                    }
                    bs
                } else if self.arena.contains(old) {
                    let start = self.arena.index_of(old);
                    let pages = self
                        .arena
                        .run_len(start)
                        .ok_or(KError::BadAddress { va: old.as_u32() })?;
                    if round_up!(n, PAGE_SIZE) / PAGE_SIZE == pages {
                        return Ok(Some(old));
                    }
                    pages * PAGE_SIZE
                } else {
                    return Err(KError::BadAddress { va: old.as_u32() });
                };

                let new = self.malloc(n, src)?;
                src.copy_block(old, new, old_size.min(n));
                self.free(old, src)?;
                Ok(Some(new))
            }
        }
    }

    /// Reserve a virtual range for a shared object about to be mapped.
    /// The pages carry no `UHPAGE` tag: the mapping arrives eagerly
    /// from the share registry, never through the fault path.
    pub fn reserve_shared(&mut self, npages: usize) -> Result<VAddr, KError> {
        match self.arena.reserve(npages, self.strategy) {
            Some(start) => Ok(self.arena.page_va(start)),
            None => Err(KError::OutOfMemory),
        }
    }

    /// Undo [`UserHeap::reserve_shared`] before any mapping happened.
    pub fn unreserve_shared(&mut self, va: VAddr, npages: usize) {
        self.arena.release(self.arena.index_of(va), npages);
    }

    pub fn note_shared(&mut self, region: SharedRegion) {
        self.shared.push(region);
    }

    pub fn shared_regions(&self) -> &[SharedRegion] {
        &self.shared
    }

    /// Find and detach the shared region starting at `va` (for sfree).
    pub fn take_shared(&mut self, va: VAddr) -> Option<SharedRegion> {
        let idx = self.shared.iter().position(|r| r.va == va)?;
        Some(self.shared.swap_remove(idx))
    }

    /// Park a freed-but-still-referenced shared range so malloc cannot
    /// reuse it.
    pub fn quarantine_shared(&mut self, region: SharedRegion) {
        debug!(
            "quarantining shared range {:#x} (+{} pages, id {})",
            region.va, region.pages, region.id
        );
        self.quarantine.push(region);
    }

    pub fn quarantined(&self) -> &[SharedRegion] {
        &self.quarantine
    }

    /// Release every quarantined range whose object no longer exists
    /// anywhere (`alive` consults the share registry).
    pub fn sweep_quarantine<F: Fn(u32) -> bool>(&mut self, alive: F) {
        let mut kept = Vec::new();
        for region in self.quarantine.drain(..) {
            if alive(region.id) {
                kept.push(region);
            } else {
                let start = self.arena.index_of(region.va);
                self.arena.release(start, region.pages);
            }
        }
        self.quarantine = kept;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn layout() -> LayoutParams {
        LayoutParams::small()
    }

    struct Rig {
        frames: FrameTable,
        pd: AddressSpace,
        pagefile: PageFile,
        ws: WorkingSet,
        heap: UserHeap,
    }

    fn rig() -> Rig {
        Rig {
            frames: FrameTable::new(64),
            pd: AddressSpace::new(),
            pagefile: PageFile::new(32),
            ws: WorkingSet::new(4),
            heap: UserHeap::new(&layout()),
        }
    }

    #[test]
    /// A page allocation reserves pages with `UHPAGE` but maps no
    /// frame; freeing clears the tag again.
    fn malloc_reserves_without_frames(){
        let mut r = rig();
        let free_before = r.frames.free_frames();

        let Rig { frames, pd, pagefile, ws, heap } = &mut r;
        let mut src = UserSource { pid: 1, pd, frames, pagefile, ws };
        let va = heap.malloc(3 * PAGE_SIZE, &mut src).unwrap();

        let entry = src.pd.pte(va).unwrap();
        assert!(entry.perms().contains(PtePerms::UHPAGE));
        assert!(!entry.is_present());

        heap.free(va, &mut src).unwrap();
        assert!(src.pd.pte(va).unwrap().is_unused());
        // Only the page table sticks around.
        assert_eq!(src.frames.free_frames(), free_before - 1);
    }

    #[test]
    fn small_requests_use_the_block_allocator() {
        let mut r = rig();
        let Rig { frames, pd, pagefile, ws, heap } = &mut r;
        let mut src = UserSource { pid: 1, pd, frames, pagefile, ws };

        let p = heap.malloc(100, &mut src).unwrap();
        assert!(heap.da().contains(p));
        assert_eq!(heap.da().block_size(p), 128);
        heap.free(p, &mut src).unwrap();
    }

    #[test]
    fn quarantined_ranges_are_not_reused() {
        let mut r = rig();
        let Rig { frames, pd, pagefile, ws, heap } = &mut r;
        let mut src = UserSource { pid: 1, pd, frames, pagefile, ws };

        let shared_va = heap.reserve_shared(2).unwrap();
        heap.note_shared(SharedRegion {
            va: shared_va,
            id: 9,
            pages: 2,
        });

        let region = heap.take_shared(shared_va).unwrap();
        heap.quarantine_shared(region);

        // While the object lives, malloc may not hand the range out.
        let a = heap.malloc(2 * PAGE_SIZE, &mut src).unwrap();
        assert_ne!(a, shared_va);

        // Once the object is gone everywhere the range comes back.
        heap.sweep_quarantine(|_| false);
        heap.free(a, &mut src).unwrap();
        let b = heap.malloc(2 * PAGE_SIZE, &mut src).unwrap();
        assert_eq!(b, shared_va);
    }

    #[test]
    fn free_of_a_shared_mapping_is_refused() {
        let mut r = rig();
        let Rig { frames, pd, pagefile, ws, heap } = &mut r;
        let mut src = UserSource { pid: 1, pd, frames, pagefile, ws };

        let va = heap.reserve_shared(1).unwrap();
        heap.note_shared(SharedRegion { va, id: 3, pages: 1 });
        assert!(heap.free(va, &mut src).is_err());
    }

    #[test]
    fn realloc_copies_through_the_page_file() {
        let mut r = rig();
        let Rig { frames, pd, pagefile, ws, heap } = &mut r;
        let mut src = UserSource { pid: 1, pd, frames, pagefile, ws };

        let old = heap.malloc(2 * PAGE_SIZE, &mut src).unwrap();
        // Stage contents for a non-resident page.
        let mut page = [0u8; PAGE_SIZE];
        page[..4].copy_from_slice(b"data");
        src.pagefile.update_env_page(1, old, &page).unwrap();

        let new = heap
            .realloc(Some(old), 3 * PAGE_SIZE, &mut src)
            .unwrap()
            .unwrap();
        assert_ne!(new, old);

        // The copy landed in the page file under the new address.
        let mut out = [0u8; PAGE_SIZE];
        src.pagefile.read_env_page(1, new, &mut out).unwrap();
        assert_eq!(&out[..4], b"data");
    }
}
