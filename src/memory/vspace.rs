//! Software two-level page tables.
//!
//! An [`AddressSpace`] is the model's page directory: a sparse map from
//! directory index to a page table whose 1024 entries mirror the x86
//! layout (frame number plus permission bits). Mapping a frame takes one
//! reference on it; unmapping drops the reference, which returns the
//! frame to the free list at zero. The `UHPAGE` tag survives unmapping,
//! it records that the user heap owns the page even while no frame
//! backs it.

use alloc::vec::Vec;
use bitflags::bitflags;
use hashbrown::HashMap;

use super::frames::FrameTable;
use super::{Frame, VAddr, PAGE_SIZE};
use crate::error::KError;

bitflags! {
    /// Page-table entry permission bits.
    pub struct PtePerms: u32 {
        const PRESENT   = 1 << 0;
        const WRITEABLE = 1 << 1;
        const USER      = 1 << 2;
        /// Accessed bit, driven by the access helpers and consumed by
        /// the clock-family replacement policies.
        const USED      = 1 << 5;
        /// Dirty bit.
        const MODIFIED  = 1 << 6;
        /// The user heap has reserved this page (set without PRESENT
        /// until the first fault maps a frame).
        const UHPAGE    = 1 << 9;
    }
}

const PERMS_MASK: u32 = 0xfff;

/// One page-table entry: frame number in the high bits, permissions in
/// the low 12.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PtEntry(u32);

impl PtEntry {
    pub const fn unused() -> PtEntry {
        PtEntry(0)
    }

    pub fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.perms().contains(PtePerms::PRESENT)
    }

    pub fn pfn(self) -> usize {
        (self.0 >> 12) as usize
    }

    pub fn perms(self) -> PtePerms {
        PtePerms::from_bits_truncate(self.0 & PERMS_MASK)
    }

    fn set(&mut self, pfn: usize, perms: PtePerms) {
        self.0 = ((pfn as u32) << 12) | perms.bits();
    }

    fn set_perms(&mut self, perms: PtePerms) {
        self.0 = (self.0 & !PERMS_MASK) | perms.bits();
    }
}

struct PageTable {
    entries: Vec<PtEntry>,
    /// Frame backing this table; the directory holds one reference.
    frame: Frame,
}

impl PageTable {
    fn new(frame: Frame) -> PageTable {
        PageTable {
            entries: alloc::vec![PtEntry::unused(); 1024],
            frame,
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_unused())
    }
}

/// A page directory and the tables hanging off it.
pub struct AddressSpace {
    tables: HashMap<u32, PageTable>,
    tlb_invalidations: u64,
}

impl Default for AddressSpace {
    fn default() -> Self {
        AddressSpace::new()
    }
}

impl AddressSpace {
    pub fn new() -> AddressSpace {
        AddressSpace {
            tables: HashMap::new(),
            tlb_invalidations: 0,
        }
    }

    /// Is the directory entry covering `va` present?
    pub fn has_table(&self, va: VAddr) -> bool {
        self.tables.contains_key(&va.pdx())
    }

    /// Allocate and install a page table for the directory slot covering
    /// `va`. The backing frame comes from the frame table and the
    /// directory keeps one reference on it.
    pub fn create_page_table(&mut self, frames: &mut FrameTable, va: VAddr) -> Result<(), KError> {
        if self.has_table(va) {
            return Ok(());
        }
        let frame = frames.allocate_frame()?;
        frames.incref(frame.pfn());
        frames.zero(frame.pfn());
        trace!("new page table for pdx {} (pfn {})", va.pdx(), frame.pfn());
        self.tables.insert(va.pdx(), PageTable::new(frame));
        Ok(())
    }

    pub fn pte(&self, va: VAddr) -> Option<PtEntry> {
        self.tables
            .get(&va.pdx())
            .map(|t| t.entries[va.ptx() as usize])
    }

    fn pte_mut(&mut self, va: VAddr) -> Option<&mut PtEntry> {
        self.tables
            .get_mut(&va.pdx())
            .map(|t| &mut t.entries[va.ptx() as usize])
    }

    /// Map `frame` at `va`, taking one reference on it. If another frame
    /// was mapped there it is unmapped first. The `UHPAGE` tag already
    /// on the entry is preserved.
    pub fn map_frame(
        &mut self,
        frames: &mut FrameTable,
        frame: Frame,
        va: VAddr,
        perms: PtePerms,
    ) -> Result<(), KError> {
        debug_assert!(va.is_page_aligned());
        self.create_page_table(frames, va)?;
        let entry = self.pte_mut(va).unwrap();
        let uhpage = entry.perms() & PtePerms::UHPAGE;
        if entry.is_present() {
            let old = entry.pfn();
            entry.set(0, PtePerms::empty());
            frames.decref(old);
        }
        let entry = self.pte_mut(va).unwrap();
        entry.set(frame.pfn(), perms | PtePerms::PRESENT | uhpage);
        frames.incref(frame.pfn());
        Ok(())
    }

    /// Unmap the frame at `va`, dropping its reference. The `UHPAGE`
    /// tag stays behind; everything else in the entry is cleared.
    pub fn unmap_frame(&mut self, frames: &mut FrameTable, va: VAddr) {
        if let Some(entry) = self.pte_mut(va) {
            if entry.is_present() {
                let pfn = entry.pfn();
                let uhpage = entry.perms() & PtePerms::UHPAGE;
                entry.set(0, uhpage);
                frames.decref(pfn);
                self.tlb_invalidate(va);
            }
        }
    }

    /// Clear the whole entry at `va`, including the `UHPAGE` tag,
    /// dropping the frame reference if one was mapped.
    pub fn clear_pte(&mut self, frames: &mut FrameTable, va: VAddr) {
        if let Some(entry) = self.pte_mut(va) {
            if entry.is_present() {
                let pfn = entry.pfn();
                entry.set(0, PtePerms::empty());
                frames.decref(pfn);
            } else {
                entry.set(0, PtePerms::empty());
            }
            self.tlb_invalidate(va);
        }
    }

    /// Add permission bits to the entry at `va`, creating the page table
    /// if necessary. Used to tag reserved user-heap pages with `UHPAGE`
    /// before any frame backs them.
    pub fn set_pte_perms(
        &mut self,
        frames: &mut FrameTable,
        va: VAddr,
        add: PtePerms,
    ) -> Result<(), KError> {
        self.create_page_table(frames, va)?;
        let entry = self.pte_mut(va).unwrap();
        entry.set_perms(entry.perms() | add);
        Ok(())
    }

    pub fn clear_pte_perms(&mut self, va: VAddr, remove: PtePerms) {
        if let Some(entry) = self.pte_mut(va) {
            entry.set_perms(entry.perms() - remove);
        }
    }

    /// Resolve `va` to its frame number and permissions, if present.
    pub fn resolve(&self, va: VAddr) -> Option<(usize, PtePerms)> {
        let entry = self.pte(va)?;
        if entry.is_present() {
            Some((entry.pfn(), entry.perms()))
        } else {
            None
        }
    }

    /// Drop the page table covering `va` if every entry is unused,
    /// returning its backing frame to the free list.
    pub fn drop_table_if_empty(&mut self, frames: &mut FrameTable, va: VAddr) -> bool {
        let empty = match self.tables.get(&va.pdx()) {
            Some(t) => t.is_empty(),
            None => return false,
        };
        if empty {
            let table = self.tables.remove(&va.pdx()).unwrap();
            frames.decref(table.frame.pfn());
            true
        } else {
            false
        }
    }

    /// All present mappings, for teardown walks.
    pub fn present_pages(&self) -> Vec<(VAddr, usize)> {
        let mut out = Vec::new();
        for (&pdx, table) in self.tables.iter() {
            for (ptx, entry) in table.entries.iter().enumerate() {
                if entry.is_present() {
                    let va = VAddr::from_u32((pdx << 22) | ((ptx as u32) << 12));
                    out.push((va, entry.pfn()));
                }
            }
        }
        out
    }

    /// Tear down every table, dropping references on mapped frames and
    /// on the table frames themselves.
    pub fn destroy(&mut self, frames: &mut FrameTable) {
        for (_, table) in self.tables.drain() {
            for entry in table.entries.iter() {
                if entry.is_present() {
                    frames.decref(entry.pfn());
                }
            }
            frames.decref(table.frame.pfn());
        }
        self.tlb_invalidations += 1;
    }

    pub fn tlb_invalidate(&mut self, va: VAddr) {
        trace!("invlpg {:#x}", va);
        self.tlb_invalidations += 1;
    }

    pub fn tlb_invalidations(&self) -> u64 {
        self.tlb_invalidations
    }

    /// Copy bytes out of the address space, marking touched pages USED.
    /// Fails without side effects if any page in the range is not
    /// present.
    pub fn read_bytes(
        &mut self,
        frames: &FrameTable,
        va: VAddr,
        buf: &mut [u8],
    ) -> Result<(), KError> {
        self.walk_range(va, buf.len(), false)?;
        let mut copied = 0;
        let mut cur = va;
        while copied < buf.len() {
            let (pfn, _) = self.resolve(cur.align_down()).unwrap();
            let off = cur.page_offset();
            let n = (PAGE_SIZE - off).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&frames.data(pfn)[off..off + n]);
            self.mark_access(cur.align_down(), PtePerms::USED);
            copied += n;
            cur = cur + n;
        }
        Ok(())
    }

    /// Copy bytes into the address space, marking touched pages
    /// USED|MODIFIED. Fails without side effects if any page in the
    /// range is not present or not writable.
    pub fn write_bytes(
        &mut self,
        frames: &mut FrameTable,
        va: VAddr,
        buf: &[u8],
    ) -> Result<(), KError> {
        self.walk_range(va, buf.len(), true)?;
        let mut copied = 0;
        let mut cur = va;
        while copied < buf.len() {
            let (pfn, _) = self.resolve(cur.align_down()).unwrap();
            let off = cur.page_offset();
            let n = (PAGE_SIZE - off).min(buf.len() - copied);
            frames.data_mut(pfn)[off..off + n].copy_from_slice(&buf[copied..copied + n]);
            self.mark_access(cur.align_down(), PtePerms::USED | PtePerms::MODIFIED);
            copied += n;
            cur = cur + n;
        }
        Ok(())
    }

    fn mark_access(&mut self, page: VAddr, bits: PtePerms) {
        if let Some(entry) = self.pte_mut(page) {
            entry.set_perms(entry.perms() | bits);
        }
    }

    fn walk_range(&self, va: VAddr, len: usize, write: bool) -> Result<(), KError> {
        let mut cur = va.align_down();
        let end = va + len.max(1);
        while cur.as_u32() < end.as_u32() {
            match self.resolve(cur) {
                Some((_, perms)) if !write || perms.contains(PtePerms::WRITEABLE) => {}
                _ => return Err(KError::BadAddress { va: cur.as_u32() }),
            }
            cur = cur + PAGE_SIZE;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn setup() -> (FrameTable, AddressSpace) {
        (FrameTable::new(16), AddressSpace::new())
    }

    #[test]
    fn map_resolve_unmap() {
        let (mut ft, mut asp) = setup();
        let va = VAddr::from_u32(0x8000_0000);
        let f = ft.allocate_frame().unwrap();

        asp.map_frame(&mut ft, f, va, PtePerms::WRITEABLE | PtePerms::USER)
            .unwrap();
        let (pfn, perms) = asp.resolve(va).unwrap();
        assert_eq!(pfn, f.pfn());
        assert!(perms.contains(PtePerms::PRESENT | PtePerms::WRITEABLE | PtePerms::USER));
        assert_eq!(ft.refcount(f.pfn()), 1);

        asp.unmap_frame(&mut ft, va);
        assert!(asp.resolve(va).is_none());
        // Frame went back to the free list (one frame is the table).
        assert_eq!(ft.free_frames(), 16 - 1);
    }

    #[test]
    fn uhpage_tag_survives_unmap() {
        let (mut ft, mut asp) = setup();
        let va = VAddr::from_u32(0x8000_0000);
        asp.set_pte_perms(&mut ft, va, PtePerms::UHPAGE).unwrap();

        let f = ft.allocate_frame().unwrap();
        asp.map_frame(&mut ft, f, va, PtePerms::WRITEABLE | PtePerms::USER)
            .unwrap();
        assert!(asp.pte(va).unwrap().perms().contains(PtePerms::UHPAGE));

        asp.unmap_frame(&mut ft, va);
        let entry = asp.pte(va).unwrap();
        assert!(!entry.is_present());
        assert!(entry.perms().contains(PtePerms::UHPAGE));

        asp.clear_pte(&mut ft, va);
        assert!(asp.pte(va).unwrap().is_unused());
    }

    #[test]
    fn remap_drops_old_reference() {
        let (mut ft, mut asp) = setup();
        let va = VAddr::from_u32(0x1000_0000);
        let a = ft.allocate_frame().unwrap();
        let b = ft.allocate_frame().unwrap();

        asp.map_frame(&mut ft, a, va, PtePerms::WRITEABLE).unwrap();
        asp.map_frame(&mut ft, b, va, PtePerms::WRITEABLE).unwrap();
        assert_eq!(ft.refcount(b.pfn()), 1);
        assert_eq!(asp.resolve(va).unwrap().0, b.pfn());
        // a went back to the free list when it lost its only mapping.
        assert_eq!(ft.refcount(a.pfn()), 0);
    }

    #[test]
    fn empty_table_is_reclaimed() {
        let (mut ft, mut asp) = setup();
        let va = VAddr::from_u32(0x4000_0000);
        let f = ft.allocate_frame().unwrap();
        asp.map_frame(&mut ft, f, va, PtePerms::WRITEABLE).unwrap();

        assert!(!asp.drop_table_if_empty(&mut ft, va));
        asp.clear_pte(&mut ft, va);
        assert!(asp.drop_table_if_empty(&mut ft, va));
        assert_eq!(ft.free_frames(), 16);
    }

    #[test]
    fn read_write_round_trip_sets_access_bits() {
        let (mut ft, mut asp) = setup();
        let va = VAddr::from_u32(0x8000_0000);
        let f = ft.allocate_frame().unwrap();
        asp.map_frame(&mut ft, f, va, PtePerms::WRITEABLE).unwrap();

        asp.write_bytes(&mut ft, va + 8, b"minos").unwrap();
        let perms = asp.pte(va).unwrap().perms();
        assert!(perms.contains(PtePerms::USED | PtePerms::MODIFIED));

        let mut buf = [0u8; 5];
        asp.read_bytes(&ft, va + 8, &mut buf).unwrap();
        assert_eq!(&buf, b"minos");
    }

    #[test]
    fn write_to_unmapped_range_fails() {
        let (mut ft, mut asp) = setup();
        let va = VAddr::from_u32(0x8000_0000);
        let f = ft.allocate_frame().unwrap();
        asp.map_frame(&mut ft, f, va, PtePerms::WRITEABLE).unwrap();

        // Crosses into the unmapped next page.
        let big = [0u8; PAGE_SIZE + 16];
        assert!(asp.write_bytes(&mut ft, va + (PAGE_SIZE - 8), &big).is_err());
    }
}
