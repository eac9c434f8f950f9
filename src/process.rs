//! The process model as the memory core sees it.
//!
//! A process owns its address space, its bounded working set of
//! resident pages (with the clock hand the replacement policies
//! rotate), the reference stream the OPTIMAL policy replays, its
//! kernel-stack range, and its user-heap state.

use alloc::vec::Vec;
use arrayvec::ArrayVec;

use crate::memory::layout::LayoutParams;
use crate::memory::vspace::AddressSpace;
use crate::memory::VAddr;
use crate::uheap::UserHeap;

pub type Pid = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessStatus {
    Ready,
    Blocked,
    Exited,
}

/// One resident page in a working set.
#[derive(Clone, Copy, Debug)]
pub struct WsElement {
    pub va: VAddr,
    pub time_stamp: u32,
    /// Sweeps survived, for N-chance clock.
    pub chances: u8,
    /// Insertion sequence number, for OPTIMAL tie-breaks.
    pub arrival: u64,
}

/// A bounded working set with a clock hand.
///
/// The hand is unset until the set first fills to capacity, at which
/// point it starts at the head. Eviction reuses the victim's slot and
/// advances the hand past it.
pub struct WorkingSet {
    elems: Vec<WsElement>,
    max: usize,
    hand: Option<usize>,
    next_arrival: u64,
}

impl WorkingSet {
    pub fn new(max: usize) -> WorkingSet {
        assert!(max > 0);
        WorkingSet {
            elems: Vec::with_capacity(max),
            max,
            hand: None,
            next_arrival: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.elems.len() == self.max
    }

    pub fn hand(&self) -> Option<usize> {
        self.hand
    }

    pub fn get(&self, idx: usize) -> &WsElement {
        &self.elems[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut WsElement {
        &mut self.elems[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &WsElement> {
        self.elems.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WsElement> {
        self.elems.iter_mut()
    }

    pub fn contains(&self, va: VAddr) -> bool {
        self.elems.iter().any(|e| e.va == va)
    }

    /// Append a page; when this fills the set the hand starts at the
    /// head.
    pub fn push(&mut self, va: VAddr, time_stamp: u32) {
        assert!(!self.is_full());
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.elems.push(WsElement {
            va,
            time_stamp,
            chances: 0,
            arrival,
        });
        if self.is_full() && self.hand.is_none() {
            self.hand = Some(0);
        }
    }

    /// Reuse the victim's slot for a new page and advance the hand to
    /// the slot after it.
    pub fn replace_at(&mut self, idx: usize, va: VAddr, time_stamp: u32) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.elems[idx] = WsElement {
            va,
            time_stamp,
            chances: 0,
            arrival,
        };
        self.hand = Some((idx + 1) % self.elems.len());
    }

    /// Drop every element whose page lies in `[lo, hi)`; the hand is
    /// cleared once the set is below capacity and re-establishes at the
    /// head on the next fill.
    pub fn remove_range(&mut self, lo: VAddr, hi: VAddr) {
        self.elems.retain(|e| e.va < lo || e.va >= hi);
        if !self.is_full() {
            self.hand = None;
        }
    }

    pub fn clear(&mut self) {
        self.elems.clear();
        self.hand = None;
    }
}

/// Sliding window of the last faulting addresses from one origin; three
/// identical entries in a row mean the replacement policy is live-locked.
#[derive(Default)]
pub struct FaultHistory {
    recent: ArrayVec<VAddr, 3>,
}

impl FaultHistory {
    pub fn record(&mut self, va: VAddr) {
        if self.recent.last() != Some(&va) {
            self.recent.clear();
        }
        if self.recent.is_full() {
            self.recent.clear();
        }
        self.recent.push(va);
    }

    pub fn is_livelocked(&self) -> bool {
        self.recent.is_full()
    }

    pub fn reset(&mut self) {
        self.recent.clear();
    }
}

pub struct Process {
    pub pid: Pid,
    pub status: ProcessStatus,
    pub pd: AddressSpace,
    /// Kernel stack `(bottom, top)`.
    pub kstack: (VAddr, VAddr),
    pub ws: WorkingSet,
    /// Replay stream for the OPTIMAL policy.
    pub ref_stream: Vec<VAddr>,
    pub stream_cursor: usize,
    pub uheap: UserHeap,
    pub faults: FaultHistory,
}

pub struct ProcessTable {
    slots: Vec<Process>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable { slots: Vec::new() }
    }

    pub fn create(&mut self, layout: &LayoutParams, ws_max: usize) -> Pid {
        let pid = self.slots.len();
        let kstack = layout.kstack_range(pid);
        debug!("create process {} (ws max {})", pid, ws_max);
        self.slots.push(Process {
            pid,
            status: ProcessStatus::Ready,
            pd: AddressSpace::new(),
            kstack,
            ws: WorkingSet::new(ws_max),
            ref_stream: Vec::new(),
            stream_cursor: 0,
            uheap: UserHeap::new(layout),
            faults: FaultHistory::default(),
        });
        pid
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        ProcessTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hand_establishes_when_the_set_fills() {
        let mut ws = WorkingSet::new(3);
        ws.push(VAddr::from_u32(0x1000), 0);
        ws.push(VAddr::from_u32(0x2000), 0);
        assert_eq!(ws.hand(), None);

        ws.push(VAddr::from_u32(0x3000), 0);
        assert!(ws.is_full());
        assert_eq!(ws.hand(), Some(0));
    }

    #[test]
    fn replace_advances_the_hand() {
        let mut ws = WorkingSet::new(2);
        ws.push(VAddr::from_u32(0x1000), 0);
        ws.push(VAddr::from_u32(0x2000), 0);

        ws.replace_at(1, VAddr::from_u32(0x3000), 0);
        assert_eq!(ws.hand(), Some(0));
        assert!(ws.contains(VAddr::from_u32(0x3000)));
        assert!(!ws.contains(VAddr::from_u32(0x2000)));
    }

    #[test]
    fn remove_range_clears_the_hand_below_capacity() {
        let mut ws = WorkingSet::new(2);
        ws.push(VAddr::from_u32(0x1000), 0);
        ws.push(VAddr::from_u32(0x2000), 0);
        assert_eq!(ws.hand(), Some(0));

        ws.remove_range(VAddr::from_u32(0x2000), VAddr::from_u32(0x3000));
        assert_eq!(ws.len(), 1);
        assert_eq!(ws.hand(), None);
    }

    #[test]
    fn fault_history_detects_three_in_a_row() {
        let mut h = FaultHistory::default();
        let a = VAddr::from_u32(0x1000);
        let b = VAddr::from_u32(0x2000);

        h.record(a);
        h.record(a);
        assert!(!h.is_livelocked());
        h.record(b);
        assert!(!h.is_livelocked());
        h.record(b);
        h.record(b);
        assert!(h.is_livelocked());
    }
}
