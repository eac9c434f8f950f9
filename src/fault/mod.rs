//! The page-fault path: classification, placement, and replacement.
//!
//! Faults are classified before any policy runs: live-locked repeats
//! and stack-range violations panic, a missing directory entry gets a
//! page table, user pointers are validated (a bad one terminates the
//! process), and only then does [`page_fault_handler`] place or replace
//! a page under the working-set model.

use crate::error::KError;
use crate::memory::frames::FrameTable;
use crate::memory::layout::LayoutParams;
use crate::memory::vspace::PtePerms;
use crate::memory::{VAddr, PAGE_SIZE};
use crate::pagefile::PageFile;
use crate::process::Process;

pub mod policy;

pub use policy::{get_optimal_num_faults, ReplacementPolicy, FRESH_TIME_STAMP};

/// What the trap dispatcher hands us: the faulting linear address and
/// the page-fault error code bits.
#[derive(Clone, Copy, Debug)]
pub struct Trapframe {
    /// CR2 at trap time.
    pub fault_va: VAddr,
    /// Error-code bit 0: the fault hit a present page.
    pub present: bool,
    /// Error-code bit 1: the access was a write.
    pub write: bool,
    /// Error-code bit 2: the access came from user mode.
    pub user: bool,
    pub eip: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultOutcome {
    Handled,
    /// The faulting process must be torn down by the caller.
    Terminated,
}

/// Everything the fault path touches besides the process itself.
pub struct FaultCtx<'a> {
    pub frames: &'a mut FrameTable,
    pub pagefile: &'a mut PageFile,
    pub policy: ReplacementPolicy,
    pub layout: &'a LayoutParams,
}

/// Classify a user-mode fault and dispatch it.
///
/// Panics on live-locked repeats, stack under/overflow, and
/// access-rights violations; returns [`FaultOutcome::Terminated`] for
/// user-program violations the caller must clean up with `env_exit`.
pub fn fault_handler(ctx: &mut FaultCtx, proc: &mut Process, tf: &Trapframe) -> FaultOutcome {
    let fa = tf.fault_va;
    let l = ctx.layout;

    proc.faults.record(fa);
    if proc.faults.is_livelocked() {
        panic!(
            "page fault at {:#x} repeated three times (pid {}, eip {:#x})",
            fa, proc.pid, tf.eip
        );
    }

    // Stack-range checks come before anything else.
    if fa.as_u32() >= l.ustack_top && fa.as_u32() < l.user_top {
        panic!("user stack underflow at {:#x} (pid {})", fa, proc.pid);
    }
    if fa.as_u32() >= l.ustack_bottom - PAGE_SIZE as u32 && fa.as_u32() < l.ustack_bottom {
        panic!("user stack overflow at {:#x} (pid {})", fa, proc.pid);
    }
    let (kstack_bottom, _) = proc.kstack;
    let kstack_guard = VAddr::from_u32(kstack_bottom.as_u32() - PAGE_SIZE as u32);
    if fa >= kstack_guard && fa < kstack_bottom {
        panic!("kernel stack overflow at {:#x} (pid {})", fa, proc.pid);
    }
    if !tf.user && fa.as_u32() >= l.kernel_heap_max {
        panic!("kernel heap overflow at {:#x} (eip {:#x})", fa, tf.eip);
    }

    // A missing directory entry is a table fault, not a page fault.
    if !proc.pd.has_table(fa) {
        table_fault_handler(ctx, proc, fa);
    }

    if tf.user {
        if fa.as_u32() >= l.user_limit {
            warn!("pid {}: user access into kernel space at {:#x}", proc.pid, fa);
            return FaultOutcome::Terminated;
        }
        if l.in_user_heap(fa) {
            let reserved = proc
                .pd
                .pte(fa.align_down())
                .map(|e| e.perms().contains(PtePerms::UHPAGE))
                .unwrap_or(false);
            if !reserved {
                warn!(
                    "pid {}: access to unallocated heap page {:#x}",
                    proc.pid, fa
                );
                return FaultOutcome::Terminated;
            }
        }
        if tf.present && tf.write {
            if let Some((_, perms)) = proc.pd.resolve(fa.align_down()) {
                if !perms.contains(PtePerms::WRITEABLE) {
                    warn!("pid {}: write to read-only page {:#x}", proc.pid, fa);
                    return FaultOutcome::Terminated;
                }
            }
        }
    }

    if tf.present {
        panic!(
            "access-rights violation at {:#x} (pid {}, eip {:#x})",
            fa, proc.pid, tf.eip
        );
    }

    page_fault_handler(ctx, proc, fa)
}

/// Allocate and install the page table for the directory slot covering
/// `va`. Running out of frames for a page table is unrecoverable.
pub fn table_fault_handler(ctx: &mut FaultCtx, proc: &mut Process, va: VAddr) {
    if proc.pd.create_page_table(ctx.frames, va).is_err() {
        panic!("out of memory for a page table at {:#x}", va);
    }
}

/// The working-set fault handler: place while the set has room, evict
/// a policy-chosen victim once it is full.
pub fn page_fault_handler(ctx: &mut FaultCtx, proc: &mut Process, fa: VAddr) -> FaultOutcome {
    let va = fa.align_down();
    trace!("page fault: pid {} va {:#x}", proc.pid, va);

    if ctx.policy == ReplacementPolicy::Optimal {
        advance_stream_cursor(proc, va);
    }

    if !proc.ws.is_full() {
        // Placement.
        match install_page(ctx, proc, va) {
            Ok(()) => {
                proc.ws.push(va, FRESH_TIME_STAMP);
                FaultOutcome::Handled
            }
            Err(_) => FaultOutcome::Terminated,
        }
    } else {
        // Replacement.
        let victim = ctx.policy.select_victim(
            &mut proc.ws,
            &mut proc.pd,
            &proc.ref_stream,
            proc.stream_cursor,
        );
        if let Err(e) = evict(ctx, proc, victim) {
            warn!(
                "pid {}: eviction failed ({}), terminating",
                proc.pid, e
            );
            return FaultOutcome::Terminated;
        }
        match install_page(ctx, proc, va) {
            Ok(()) => {
                proc.ws.replace_at(victim, va, FRESH_TIME_STAMP);
                FaultOutcome::Handled
            }
            Err(_) => FaultOutcome::Terminated,
        }
    }
}

/// Write a dirty victim to the page file, then unmap it. Page-file
/// exhaustion here is a user-program violation: the caller terminates
/// the process.
fn evict(ctx: &mut FaultCtx, proc: &mut Process, victim: usize) -> Result<(), KError> {
    let vva = proc.ws.get(victim).va;
    let (pfn, perms) = proc
        .pd
        .resolve(vva)
        .expect("working-set element lost its mapping");

    if perms.contains(PtePerms::MODIFIED) {
        let data = *ctx.frames.data(pfn);
        ctx.pagefile.update_env_page(proc.pid, vva, &data)?;
        proc.pd.clear_pte_perms(vva, PtePerms::MODIFIED);
        trace!("evict: wrote dirty page {:#x} to the page file", vva);
    }
    proc.pd.unmap_frame(ctx.frames, vva);
    Ok(())
}

/// Map a fresh frame at `va` and fill it from the page file, or
/// zero-fill for stack and reserved heap pages. Any other missing page
/// is a user violation.
fn install_page(ctx: &mut FaultCtx, proc: &mut Process, va: VAddr) -> Result<(), KError> {
    let frame = match ctx.frames.allocate_frame() {
        Ok(f) => f,
        Err(_) => panic!("out of physical frames during a page fault at {:#x}", va),
    };

    let mut perms = PtePerms::USER | PtePerms::WRITEABLE;
    if ctx.layout.in_user_heap(va) {
        perms |= PtePerms::UHPAGE;
    }
    if let Err(e) = proc.pd.map_frame(ctx.frames, frame, va, perms) {
        ctx.frames.free_frame(frame);
        panic!("mapping a faulted page failed: {} at {:#x}", e, va);
    }

    let pfn = frame.pfn();
    let mut data = [0u8; PAGE_SIZE];
    match ctx.pagefile.read_env_page(proc.pid, va, &mut data) {
        Ok(()) => {
            *ctx.frames.data_mut(pfn) = data;
            Ok(())
        }
        Err(KError::PageNotInPageFile) => {
            if ctx.layout.in_user_stack(va) || ctx.layout.in_user_heap(va) {
                ctx.frames.zero(pfn);
                Ok(())
            } else {
                warn!(
                    "pid {}: page {:#x} not in the page file and outside stack/heap",
                    proc.pid, va
                );
                proc.pd.unmap_frame(ctx.frames, va);
                Err(KError::PageNotInPageFile)
            }
        }
        Err(e) => Err(e),
    }
}

/// Move the OPTIMAL cursor past the first occurrence of the faulting
/// page at or after its current position.
fn advance_stream_cursor(proc: &mut Process, va: VAddr) {
    let mut cur = proc.stream_cursor;
    while cur < proc.ref_stream.len() {
        let hit = proc.ref_stream[cur].align_down() == va;
        cur += 1;
        if hit {
            break;
        }
    }
    proc.stream_cursor = cur;
}

/// The timer-interrupt half of LRU time-approx: shift each timestamp
/// right and fold the `USED` bit into the top, clearing it.
pub fn age_working_set(proc: &mut Process) {
    let Process { ws, pd, .. } = proc;
    for e in ws.iter_mut() {
        let used = pd
            .pte(e.va)
            .map(|p| p.perms().contains(PtePerms::USED))
            .unwrap_or(false);
        e.time_stamp = (e.time_stamp >> 1) | ((used as u32) << 31);
        if used {
            pd.clear_pte_perms(e.va, PtePerms::USED);
        }
    }
}
