//! The kernel facade: locks, entry points, and the syscall surface.
//!
//! A [`Kernel`] owns the whole memory core. The frame lock guards the
//! frame table, the kernel address space, the kernel heap, and the
//! allocation wait queue; the shares lock guards the shared-memory
//! registry. The frame lock is always taken before the shares lock,
//! never the other way around. Public entry points acquire; the workers
//! they call take `&mut` state and assume their lock is held.

use alloc::vec::Vec;
use crossbeam_utils::CachePadded;
use spin::Mutex;

use crate::error::KError;
use crate::fault::{self, FaultCtx, FaultOutcome, ReplacementPolicy, Trapframe};
use crate::memory::kheap::{MemoryManager, PlacementStrategy};
use crate::memory::layout::{LayoutParams, DYN_ALLOC_MAX_BLOCK_SIZE};
use crate::memory::shared::ShareRegistry;
use crate::memory::vspace::PtePerms;
use crate::memory::{PAddr, VAddr, PAGE_SIZE};
use crate::pagefile::PageFile;
use crate::process::{Pid, ProcessStatus, ProcessTable};
use crate::uheap::{SharedRegion, UserSource};

/// Boot-time knobs: how much physical memory and page file the machine
/// has, and the virtual layout to run under.
#[derive(Clone, Copy, Debug)]
pub struct MachineConfig {
    pub nframes: usize,
    pub pagefile_pages: usize,
    pub layout: LayoutParams,
}

impl Default for MachineConfig {
    fn default() -> MachineConfig {
        MachineConfig {
            nframes: 4096,
            pagefile_pages: 1024,
            layout: LayoutParams::default(),
        }
    }
}

impl MachineConfig {
    /// A small machine for tests.
    pub fn small() -> MachineConfig {
        MachineConfig {
            nframes: 256,
            pagefile_pages: 64,
            layout: LayoutParams::small(),
        }
    }
}

pub struct Kernel {
    mm: CachePadded<Mutex<MemoryManager>>,
    shares: CachePadded<Mutex<ShareRegistry>>,
    pagefile: Mutex<PageFile>,
    procs: Mutex<ProcessTable>,
    policy: Mutex<ReplacementPolicy>,
    layout: LayoutParams,
}

impl Kernel {
    /// Bring up the memory core: the frame table, the kernel heap, and
    /// the sharing registry.
    pub fn new(config: MachineConfig) -> Kernel {
        Kernel {
            mm: CachePadded::new(Mutex::new(MemoryManager::new(
                &config.layout,
                config.nframes,
            ))),
            shares: CachePadded::new(Mutex::new(ShareRegistry::new())),
            pagefile: Mutex::new(PageFile::new(config.pagefile_pages)),
            procs: Mutex::new(ProcessTable::new()),
            policy: Mutex::new(ReplacementPolicy::default()),
            layout: config.layout,
        }
    }

    pub fn layout(&self) -> &LayoutParams {
        &self.layout
    }

    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------

    pub fn create_process(&self, ws_max: usize) -> Pid {
        self.procs.lock().create(&self.layout, ws_max)
    }

    pub fn process_status(&self, pid: Pid) -> Option<ProcessStatus> {
        self.procs.lock().get(pid).map(|p| p.status)
    }

    /// Install the reference stream the OPTIMAL policy replays.
    pub fn set_reference_stream(&self, pid: Pid, stream: Vec<VAddr>) -> Result<(), KError> {
        let mut procs = self.procs.lock();
        let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
        proc.ref_stream = stream;
        proc.stream_cursor = 0;
        Ok(())
    }

    /// Tear a process down: all mappings, page-file copies, working-set
    /// entries, and shared-object references go.
    pub fn env_exit(&self, pid: Pid) {
        let mut procs = self.procs.lock();
        let proc = match procs.get_mut(pid) {
            Some(p) => p,
            None => return,
        };
        info!("env_exit: pid {}", pid);
        proc.status = ProcessStatus::Exited;

        let mut mm = self.mm.lock();
        proc.pd.destroy(&mut mm.frames);
        proc.ws.clear();
        self.pagefile.lock().remove_env(pid);

        let ids: Vec<u32> = proc.uheap.shared_regions().iter().map(|r| r.id).collect();
        if !ids.is_empty() {
            let mut shares = self.shares.lock();
            for id in ids {
                shares.release_ref(&mut mm.frames, id);
            }
        }

        mm.wait_queue.retain(|&p| p != pid);
    }

    // ------------------------------------------------------------------
    // Kernel heap
    // ------------------------------------------------------------------

    /// Allocate kernel-heap memory without a process context; runs out
    /// with `OutOfMemory` rather than blocking.
    pub fn kmalloc(&self, size: usize) -> Result<VAddr, KError> {
        self.mm.lock().kmalloc(size)
    }

    /// Allocate kernel-heap memory on behalf of `pid`. When the block
    /// allocator is exhausted the process is parked FIFO on the
    /// allocation wait queue and `WouldBlock` comes back; a later
    /// `kfree` wakes it for a retry.
    pub fn kmalloc_for(&self, pid: Pid, size: usize) -> Result<VAddr, KError> {
        let mut mm = self.mm.lock();
        match mm.kmalloc(size) {
            Ok(va) => Ok(va),
            Err(KError::OutOfMemory) if size <= DYN_ALLOC_MAX_BLOCK_SIZE => {
                mm.wait_queue.push_back(pid);
                drop(mm);
                if let Some(proc) = self.procs.lock().get_mut(pid) {
                    proc.status = ProcessStatus::Blocked;
                }
                debug!("pid {} blocked on the allocation wait queue", pid);
                Err(KError::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Free a kernel-heap allocation and wake the longest waiter, if
    /// any.
    pub fn kfree(&self, va: VAddr) {
        let mut mm = self.mm.lock();
        mm.kfree(va);
        let woken = mm.wait_queue.pop_front();
        drop(mm);
        if let Some(pid) = woken {
            if let Some(proc) = self.procs.lock().get_mut(pid) {
                proc.status = ProcessStatus::Ready;
                debug!("pid {} woken from the allocation wait queue", pid);
            }
        }
    }

    pub fn krealloc(&self, va: Option<VAddr>, new_size: usize) -> Result<Option<VAddr>, KError> {
        self.mm.lock().krealloc(va, new_size)
    }

    pub fn kheap_virtual_address(&self, pa: PAddr) -> Option<VAddr> {
        self.mm.lock().kheap_virtual_address(pa)
    }

    pub fn kheap_physical_address(&self, va: VAddr) -> Option<PAddr> {
        self.mm.lock().kheap_physical_address(va)
    }

    pub fn set_kheap_placement_strategy(&self, strategy: PlacementStrategy) {
        self.mm.lock().set_strategy(strategy);
    }

    pub fn kheap_placement_strategy(&self) -> PlacementStrategy {
        self.mm.lock().strategy()
    }

    // ------------------------------------------------------------------
    // Replacement policy
    // ------------------------------------------------------------------

    pub fn set_page_replacement(&self, policy: ReplacementPolicy) {
        *self.policy.lock() = policy;
    }

    pub fn page_replacement(&self) -> ReplacementPolicy {
        *self.policy.lock()
    }

    pub fn set_page_replacement_clock(&self) {
        self.set_page_replacement(ReplacementPolicy::Clock);
    }

    pub fn is_page_replacement_clock(&self) -> bool {
        self.page_replacement() == ReplacementPolicy::Clock
    }

    pub fn set_page_replacement_modified_clock(&self) {
        self.set_page_replacement(ReplacementPolicy::ModifiedClock);
    }

    pub fn is_page_replacement_modified_clock(&self) -> bool {
        self.page_replacement() == ReplacementPolicy::ModifiedClock
    }

    pub fn set_page_replacement_lru_time_approx(&self) {
        self.set_page_replacement(ReplacementPolicy::LruTimeApprox);
    }

    pub fn is_page_replacement_lru_time_approx(&self) -> bool {
        self.page_replacement() == ReplacementPolicy::LruTimeApprox
    }

    pub fn set_page_replacement_nchance_clock(&self, chances: u8) {
        self.set_page_replacement(ReplacementPolicy::NchanceClock { chances });
    }

    pub fn is_page_replacement_nchance_clock(&self) -> bool {
        matches!(
            self.page_replacement(),
            ReplacementPolicy::NchanceClock { .. }
        )
    }

    pub fn set_page_replacement_dynamic_local(&self) {
        self.set_page_replacement(ReplacementPolicy::DynamicLocal);
    }

    pub fn is_page_replacement_dynamic_local(&self) -> bool {
        self.page_replacement() == ReplacementPolicy::DynamicLocal
    }

    pub fn set_page_replacement_optimal(&self) {
        self.set_page_replacement(ReplacementPolicy::Optimal);
    }

    pub fn is_page_replacement_optimal(&self) -> bool {
        self.page_replacement() == ReplacementPolicy::Optimal
    }

    // ------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------

    /// Classify and handle a fault delivered by the trap dispatcher.
    /// A user violation tears the process down before returning
    /// `Terminated`.
    pub fn fault_handler(&self, pid: Pid, tf: &Trapframe) -> FaultOutcome {
        let outcome = {
            let mut procs = self.procs.lock();
            let proc = procs
                .get_mut(pid)
                .unwrap_or_else(|| panic!("fault from unknown pid {}", pid));
            let mut mm = self.mm.lock();
            let mut pagefile = self.pagefile.lock();
            let policy = *self.policy.lock();
            let mm = &mut *mm;
            let mut ctx = FaultCtx {
                frames: &mut mm.frames,
                pagefile: &mut *pagefile,
                policy,
                layout: &self.layout,
            };
            fault::fault_handler(&mut ctx, proc, tf)
        };
        if outcome == FaultOutcome::Terminated {
            self.env_exit(pid);
        }
        outcome
    }

    /// The working-set handler alone, for callers that already
    /// classified the fault.
    pub fn page_fault_handler(&self, pid: Pid, va: VAddr) -> FaultOutcome {
        let outcome = {
            let mut procs = self.procs.lock();
            let proc = procs
                .get_mut(pid)
                .unwrap_or_else(|| panic!("fault from unknown pid {}", pid));
            let mut mm = self.mm.lock();
            let mut pagefile = self.pagefile.lock();
            let policy = *self.policy.lock();
            let mm = &mut *mm;
            let mut ctx = FaultCtx {
                frames: &mut mm.frames,
                pagefile: &mut *pagefile,
                policy,
                layout: &self.layout,
            };
            fault::page_fault_handler(&mut ctx, proc, va)
        };
        if outcome == FaultOutcome::Terminated {
            self.env_exit(pid);
        }
        outcome
    }

    pub fn table_fault_handler(&self, pid: Pid, va: VAddr) {
        let mut procs = self.procs.lock();
        let proc = procs
            .get_mut(pid)
            .unwrap_or_else(|| panic!("fault from unknown pid {}", pid));
        let mut mm = self.mm.lock();
        let mut pagefile = self.pagefile.lock();
        let policy = *self.policy.lock();
        let mm = &mut *mm;
        let mut ctx = FaultCtx {
            frames: &mut mm.frames,
            pagefile: &mut *pagefile,
            policy,
            layout: &self.layout,
        };
        fault::table_fault_handler(&mut ctx, proc, va);
    }

    /// Timer hook for LRU time-approx aging.
    pub fn age_working_set(&self, pid: Pid) {
        if let Some(proc) = self.procs.lock().get_mut(pid) {
            fault::age_working_set(proc);
        }
    }

    // ------------------------------------------------------------------
    // User heap
    // ------------------------------------------------------------------

    /// `malloc` for `pid`. Exhaustion of the block allocator is fatal
    /// to the process (there is no user-side wait queue); a failed
    /// multi-page request just returns the error.
    pub fn malloc(&self, pid: Pid, size: usize) -> Result<VAddr, KError> {
        let result = {
            let mut procs = self.procs.lock();
            let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
            let mut mm = self.mm.lock();
            let mut pagefile = self.pagefile.lock();
            let mm = &mut *mm;

            {
                let shares = self.shares.lock();
                proc.uheap.sweep_quarantine(|id| shares.exists_id(id));
            }

            let crate::process::Process {
                pd, ws, uheap, ..
            } = proc;
            let mut src = UserSource {
                pid,
                pd,
                frames: &mut mm.frames,
                pagefile: &mut *pagefile,
                ws,
            };
            uheap.malloc(size, &mut src)
        };
        if let Err(KError::OutOfMemory) = result {
            if size > 0 && size <= DYN_ALLOC_MAX_BLOCK_SIZE {
                warn!("pid {}: user heap exhausted, terminating", pid);
                self.env_exit(pid);
            }
        }
        result
    }

    pub fn free(&self, pid: Pid, va: VAddr) -> Result<(), KError> {
        let mut procs = self.procs.lock();
        let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
        let mut mm = self.mm.lock();
        let mut pagefile = self.pagefile.lock();
        let mm = &mut *mm;
        let crate::process::Process {
            pd, ws, uheap, ..
        } = proc;
        let mut src = UserSource {
            pid,
            pd,
            frames: &mut mm.frames,
            pagefile: &mut *pagefile,
            ws,
        };
        uheap.free(va, &mut src)
    }

    pub fn realloc(
        &self,
        pid: Pid,
        va: Option<VAddr>,
        new_size: usize,
    ) -> Result<Option<VAddr>, KError> {
        let mut procs = self.procs.lock();
        let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
        let mut mm = self.mm.lock();
        let mut pagefile = self.pagefile.lock();
        let mm = &mut *mm;
        let crate::process::Process {
            pd, ws, uheap, ..
        } = proc;
        let mut src = UserSource {
            pid,
            pd,
            frames: &mut mm.frames,
            pagefile: &mut *pagefile,
            ws,
        };
        uheap.realloc(va, new_size, &mut src)
    }

    // ------------------------------------------------------------------
    // Shared memory
    // ------------------------------------------------------------------

    /// Kernel-side create: allocate frames for a named object and map
    /// them into `pid` at `va`.
    pub fn create_shared_object(
        &self,
        pid: Pid,
        name: &str,
        size: usize,
        writable: bool,
        va: VAddr,
    ) -> Result<u32, KError> {
        let mut procs = self.procs.lock();
        let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
        let mut mm = self.mm.lock();
        let mut shares = self.shares.lock();
        shares.create(&mut mm.frames, &mut proc.pd, pid, name, size, writable, va)
    }

    /// Kernel-side get: map an existing object into `pid` at `va`.
    pub fn get_shared_object(
        &self,
        pid: Pid,
        owner: Pid,
        name: &str,
        va: VAddr,
    ) -> Result<u32, KError> {
        let mut procs = self.procs.lock();
        let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
        let mut mm = self.mm.lock();
        let mut shares = self.shares.lock();
        shares.get(&mut mm.frames, &mut proc.pd, owner, name, va)
    }

    pub fn size_of_shared_object(&self, owner: Pid, name: &str) -> Result<usize, KError> {
        self.shares.lock().size_of(owner, name)
    }

    /// Kernel-side delete: unmap from the caller, reclaim emptied page
    /// tables, drop a reference. Returns the remaining reference count.
    pub fn delete_shared_object(
        &self,
        pid: Pid,
        id: u32,
        start_va: VAddr,
    ) -> Result<u32, KError> {
        let mut procs = self.procs.lock();
        let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
        let mut mm = self.mm.lock();
        let mut shares = self.shares.lock();
        shares.delete(&mut mm.frames, &mut proc.pd, id, start_va)
    }

    pub fn shared_object_count(&self) -> usize {
        self.shares.lock().len()
    }

    /// `smalloc`: reserve heap range, create the object there.
    pub fn smalloc(
        &self,
        pid: Pid,
        name: &str,
        size: usize,
        writable: bool,
    ) -> Result<VAddr, KError> {
        if size == 0 {
            return Err(KError::ZeroAllocation);
        }
        let npages = round_up!(size, PAGE_SIZE) / PAGE_SIZE;
        let va = {
            let mut procs = self.procs.lock();
            let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
            proc.uheap.reserve_shared(npages)?
        };
        match self.create_shared_object(pid, name, size, writable, va) {
            Ok(id) => {
                let mut procs = self.procs.lock();
                if let Some(proc) = procs.get_mut(pid) {
                    proc.uheap.note_shared(SharedRegion {
                        va,
                        id,
                        pages: npages,
                    });
                }
                Ok(va)
            }
            Err(e) => {
                let mut procs = self.procs.lock();
                if let Some(proc) = procs.get_mut(pid) {
                    proc.uheap.unreserve_shared(va, npages);
                }
                Err(e)
            }
        }
    }

    /// `sget`: reserve heap range, map someone else's object there.
    pub fn sget(&self, pid: Pid, owner: Pid, name: &str) -> Result<VAddr, KError> {
        let size = self.size_of_shared_object(owner, name)?;
        let npages = round_up!(size, PAGE_SIZE) / PAGE_SIZE;
        let va = {
            let mut procs = self.procs.lock();
            let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
            proc.uheap.reserve_shared(npages)?
        };
        match self.get_shared_object(pid, owner, name, va) {
            Ok(id) => {
                let mut procs = self.procs.lock();
                if let Some(proc) = procs.get_mut(pid) {
                    proc.uheap.note_shared(SharedRegion {
                        va,
                        id,
                        pages: npages,
                    });
                }
                Ok(va)
            }
            Err(e) => {
                let mut procs = self.procs.lock();
                if let Some(proc) = procs.get_mut(pid) {
                    proc.uheap.unreserve_shared(va, npages);
                }
                Err(e)
            }
        }
    }

    /// `sfree`: drop this process's mapping of the object at `va`. The
    /// range is quarantined while other processes still reference the
    /// object, released otherwise.
    pub fn sfree(&self, pid: Pid, va: VAddr) -> Result<(), KError> {
        let region = {
            let mut procs = self.procs.lock();
            let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
            proc.uheap.take_shared(va).ok_or(KError::NoShare)?
        };
        match self.delete_shared_object(pid, region.id, va) {
            Ok(remaining) => {
                let mut procs = self.procs.lock();
                if let Some(proc) = procs.get_mut(pid) {
                    if remaining > 0 {
                        proc.uheap.quarantine_shared(region);
                    } else {
                        proc.uheap.unreserve_shared(region.va, region.pages);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let mut procs = self.procs.lock();
                if let Some(proc) = procs.get_mut(pid) {
                    proc.uheap.note_shared(region);
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // User memory access (drives the fault path the way the CPU would)
    // ------------------------------------------------------------------

    /// Fault the page holding `addr` in (retrying through the fault
    /// handler) until it is mapped with the needed rights.
    fn ensure_mapped(&self, pid: Pid, addr: VAddr, write: bool) -> Result<(), KError> {
        for _ in 0..3 {
            let state = {
                let procs = self.procs.lock();
                let proc = procs.get(pid).ok_or(KError::NoSuchProcess { pid })?;
                proc.pd.pte(addr.align_down()).map(|e| e.perms())
            };
            let (present, writable) = match state {
                Some(p) => (
                    p.contains(PtePerms::PRESENT),
                    p.contains(PtePerms::WRITEABLE),
                ),
                None => (false, false),
            };
            if present && (!write || writable) {
                return Ok(());
            }
            let tf = Trapframe {
                fault_va: addr,
                present,
                write,
                user: true,
                eip: 0,
            };
            if self.fault_handler(pid, &tf) == FaultOutcome::Terminated {
                return Err(KError::BadAddress { va: addr.as_u32() });
            }
        }
        Err(KError::BadAddress { va: addr.as_u32() })
    }

    /// Write through `pid`'s address space, faulting pages in on
    /// demand.
    pub fn write_user(&self, pid: Pid, va: VAddr, buf: &[u8]) -> Result<(), KError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let n = (buf.len() - done).min(PAGE_SIZE - cur.page_offset());
            self.ensure_mapped(pid, cur, true)?;
            let mut procs = self.procs.lock();
            let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
            let mut mm = self.mm.lock();
            proc.pd
                .write_bytes(&mut mm.frames, cur, &buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Read through `pid`'s address space, faulting pages in on demand.
    pub fn read_user(&self, pid: Pid, va: VAddr, buf: &mut [u8]) -> Result<(), KError> {
        let mut done = 0;
        while done < buf.len() {
            let cur = va + done;
            let n = (buf.len() - done).min(PAGE_SIZE - cur.page_offset());
            self.ensure_mapped(pid, cur, false)?;
            let mut procs = self.procs.lock();
            let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
            let mm = self.mm.lock();
            proc.pd
                .read_bytes(&mm.frames, cur, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Touch one address (as a load or store) without moving data:
    /// faults the page in and drives the USED/MODIFIED bits.
    pub fn touch_user(&self, pid: Pid, va: VAddr, write: bool) -> Result<(), KError> {
        self.ensure_mapped(pid, va, write)?;
        let mut procs = self.procs.lock();
        let proc = procs.get_mut(pid).ok_or(KError::NoSuchProcess { pid })?;
        let mut mm = self.mm.lock();
        let mut bits = PtePerms::USED;
        if write {
            bits |= PtePerms::MODIFIED;
        }
        proc.pd
            .set_pte_perms(&mut mm.frames, va.align_down(), bits)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection (tests and diagnostics)
    // ------------------------------------------------------------------

    pub fn free_frames(&self) -> usize {
        self.mm.lock().frames.free_frames()
    }

    pub fn wait_queue_len(&self) -> usize {
        self.mm.lock().wait_queue.len()
    }

    pub fn pagefile_pages_in_use(&self) -> usize {
        self.pagefile.lock().pages_in_use()
    }

    pub fn kheap_brk(&self) -> VAddr {
        self.mm.lock().heap.arena.brk()
    }

    pub fn kheap_cluster_tag(&self, idx: usize) -> i32 {
        self.mm.lock().heap.arena.tag(idx)
    }

    pub fn kheap_cluster_index(&self, va: VAddr) -> usize {
        self.mm.lock().heap.arena.index_of(va)
    }

    pub fn kheap_max_free(&self) -> (usize, usize) {
        self.mm.lock().heap.arena.max_free()
    }

    pub fn assert_kheap_consistent(&self) {
        let mm = self.mm.lock();
        mm.heap.arena.assert_consistent();
        mm.heap.da.assert_consistent();
    }

    /// The pages (and timestamps) currently in `pid`'s working set.
    pub fn working_set(&self, pid: Pid) -> Vec<(VAddr, u32)> {
        self.procs
            .lock()
            .get(pid)
            .map(|p| p.ws.iter().map(|e| (e.va, e.time_stamp)).collect())
            .unwrap_or_default()
    }

    /// Resolve a user virtual address without faulting.
    pub fn resolve_user(&self, pid: Pid, va: VAddr) -> Option<(usize, PtePerms)> {
        self.procs
            .lock()
            .get(pid)
            .and_then(|p| p.pd.resolve(va.align_down()))
    }

    pub fn uheap_brk(&self, pid: Pid) -> Option<VAddr> {
        self.procs.lock().get(pid).map(|p| p.uheap.brk())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bring_up_and_kernel_alloc() {
        let k = Kernel::new(MachineConfig::small());
        let va = k.kmalloc(3 * PAGE_SIZE).unwrap();
        let pa = k.kheap_physical_address(va).unwrap();
        assert_eq!(k.kheap_virtual_address(pa), Some(va));
        k.kfree(va);
        k.assert_kheap_consistent();
    }

    #[test]
    fn policy_setters_round_trip() {
        let k = Kernel::new(MachineConfig::small());
        assert!(k.is_page_replacement_clock());

        k.set_page_replacement_lru_time_approx();
        assert!(k.is_page_replacement_lru_time_approx());
        assert!(!k.is_page_replacement_clock());

        k.set_page_replacement_nchance_clock(2);
        assert!(k.is_page_replacement_nchance_clock());

        k.set_page_replacement_modified_clock();
        assert!(k.is_page_replacement_modified_clock());

        k.set_page_replacement_dynamic_local();
        assert!(k.is_page_replacement_dynamic_local());

        k.set_page_replacement_optimal();
        assert!(k.is_page_replacement_optimal());
    }

    #[test]
    fn demand_paging_fills_the_working_set() {
        let k = Kernel::new(MachineConfig::small());
        let pid = k.create_process(3);
        let heap = k.malloc(pid, 2 * PAGE_SIZE).unwrap();

        // Nothing resident yet.
        assert!(k.resolve_user(pid, heap).is_none());

        k.write_user(pid, heap, b"deadbeef").unwrap();
        assert!(k.resolve_user(pid, heap).is_some());
        assert_eq!(k.working_set(pid).len(), 1);

        let mut buf = [0u8; 8];
        k.read_user(pid, heap, &mut buf).unwrap();
        assert_eq!(&buf, b"deadbeef");
    }

    #[test]
    fn access_to_unreserved_heap_terminates() {
        let k = Kernel::new(MachineConfig::small());
        let pid = k.create_process(3);
        let va = VAddr::from_u32(k.layout().user_heap_start + 0x5000);
        assert!(k.write_user(pid, va, b"x").is_err());
        assert_eq!(k.process_status(pid), Some(ProcessStatus::Exited));
    }

    #[test]
    fn stack_pages_zero_fill() {
        let k = Kernel::new(MachineConfig::small());
        let pid = k.create_process(3);
        let sp = VAddr::from_u32(k.layout().ustack_top - PAGE_SIZE as u32);
        let mut buf = [0xffu8; 16];
        k.read_user(pid, sp, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }
}
