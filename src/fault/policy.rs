//! Page-replacement policies.
//!
//! Each policy is one variant of [`ReplacementPolicy`] behind a uniform
//! victim-selection interface, so the fault handler stays
//! policy-agnostic. The clock family rotates the working set's hand
//! over the PTE `USED` bits; LRU approximates recency with aged
//! timestamps; OPTIMAL replays a recorded reference stream.

use crate::memory::vspace::{AddressSpace, PtePerms};
use crate::memory::VAddr;
use crate::process::WorkingSet;

/// Timestamp given to a page on installation (LRU time-approx).
pub const FRESH_TIME_STAMP: u32 = 1 << 31;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReplacementPolicy {
    Clock,
    ModifiedClock,
    LruTimeApprox,
    NchanceClock { chances: u8 },
    /// Per-process local replacement; our working sets are already
    /// local, so this is the clock sweep.
    DynamicLocal,
    /// Offline-optimal replay of the process's reference stream.
    Optimal,
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        ReplacementPolicy::Clock
    }
}

impl ReplacementPolicy {
    /// Pick the working-set slot to evict. The set must be full and the
    /// hand established.
    pub fn select_victim(
        &self,
        ws: &mut WorkingSet,
        pd: &mut AddressSpace,
        stream: &[VAddr],
        cursor: usize,
    ) -> usize {
        debug_assert!(ws.is_full());
        match *self {
            ReplacementPolicy::Clock | ReplacementPolicy::DynamicLocal => clock_sweep(ws, pd),
            ReplacementPolicy::ModifiedClock => modified_clock_sweep(ws, pd),
            ReplacementPolicy::NchanceClock { chances } => nchance_sweep(ws, pd, chances),
            ReplacementPolicy::LruTimeApprox => {
                let mut victim = 0;
                for idx in 1..ws.len() {
                    if ws.get(idx).time_stamp < ws.get(victim).time_stamp {
                        victim = idx;
                    }
                }
                victim
            }
            ReplacementPolicy::Optimal => optimal_victim(ws, stream, cursor),
        }
    }
}

fn used(pd: &AddressSpace, va: VAddr) -> bool {
    pd.pte(va)
        .map(|e| e.perms().contains(PtePerms::USED))
        .unwrap_or(false)
}

fn modified(pd: &AddressSpace, va: VAddr) -> bool {
    pd.pte(va)
        .map(|e| e.perms().contains(PtePerms::MODIFIED))
        .unwrap_or(false)
}

/// Classic clock: the first page with a clear `USED` bit is the victim;
/// set bits are cleared in passing. Bounded by two revolutions.
fn clock_sweep(ws: &WorkingSet, pd: &mut AddressSpace) -> usize {
    let n = ws.len();
    let mut idx = ws.hand().expect("clock sweep without a hand");
    for _ in 0..2 * n {
        let va = ws.get(idx).va;
        if !used(pd, va) {
            return idx;
        }
        pd.clear_pte_perms(va, PtePerms::USED);
        idx = (idx + 1) % n;
    }
    unreachable!("clock sweep did not settle within two revolutions");
}

/// Four-pass modified clock: look for (USED=0, MOD=0) without touching
/// bits, then for USED=0 clearing `USED` in passing; repeat once.
/// Terminates within two full revolutions.
fn modified_clock_sweep(ws: &WorkingSet, pd: &mut AddressSpace) -> usize {
    let n = ws.len();
    let hand = ws.hand().expect("clock sweep without a hand");
    for _ in 0..2 {
        let mut idx = hand;
        for _ in 0..n {
            let va = ws.get(idx).va;
            if !used(pd, va) && !modified(pd, va) {
                return idx;
            }
            idx = (idx + 1) % n;
        }

        let mut idx = hand;
        for _ in 0..n {
            let va = ws.get(idx).va;
            if !used(pd, va) {
                return idx;
            }
            pd.clear_pte_perms(va, PtePerms::USED);
            idx = (idx + 1) % n;
        }
    }
    unreachable!("modified clock did not settle within two revolutions");
}

/// N-chance clock: a referenced page has its bit cleared and its chance
/// count reset; an unreferenced page survives `chances` sweeps before
/// becoming the victim.
fn nchance_sweep(ws: &mut WorkingSet, pd: &mut AddressSpace, chances: u8) -> usize {
    let n = ws.len();
    let mut idx = ws.hand().expect("clock sweep without a hand");
    for _ in 0..(chances as usize + 2) * n {
        let e = ws.get_mut(idx);
        let va = e.va;
        if used(pd, va) {
            pd.clear_pte_perms(va, PtePerms::USED);
            e.chances = 0;
        } else if e.chances >= chances {
            return idx;
        } else {
            e.chances += 1;
        }
        idx = (idx + 1) % n;
    }
    unreachable!("n-chance sweep did not settle");
}

/// The resident page whose next use (at or after `cursor` in the
/// stream) is furthest away; pages never used again are preferred, ties
/// fall to the oldest arrival.
fn optimal_victim(ws: &WorkingSet, stream: &[VAddr], cursor: usize) -> usize {
    let rest = &stream[cursor.min(stream.len())..];
    let mut victim = 0;
    let mut victim_next = next_use(rest, ws.get(0).va);
    let mut victim_arrival = ws.get(0).arrival;
    for idx in 1..ws.len() {
        let e = ws.get(idx);
        let next = next_use(rest, e.va);
        if next > victim_next || (next == victim_next && e.arrival < victim_arrival) {
            victim = idx;
            victim_next = next;
            victim_arrival = e.arrival;
        }
    }
    victim
}

fn next_use(rest: &[VAddr], va: VAddr) -> usize {
    rest.iter()
        .position(|&r| r.align_down() == va.align_down())
        .unwrap_or(usize::MAX)
}

/// The fault count an OPTIMAL replacement would incur on `stream`
/// starting from `init_ws`. Pure: inputs are untouched and repeated
/// calls agree.
pub fn get_optimal_num_faults(init_ws: &[VAddr], max_ws: usize, stream: &[VAddr]) -> usize {
    let mut resident: alloc::vec::Vec<VAddr> = init_ws.to_vec();
    let mut arrivals: alloc::vec::Vec<usize> = (0..resident.len()).collect();
    let mut seq = resident.len();
    let mut faults = 0;

    for (pos, &r) in stream.iter().enumerate() {
        if resident.contains(&r) {
            continue;
        }
        faults += 1;
        seq += 1;
        if resident.len() < max_ws {
            resident.push(r);
            arrivals.push(seq);
            continue;
        }
        let rest = &stream[pos + 1..];
        let mut victim = 0;
        let mut victim_next = next_use(rest, resident[0]);
        for idx in 1..resident.len() {
            let next = next_use(rest, resident[idx]);
            if next > victim_next
                || (next == victim_next && arrivals[idx] < arrivals[victim])
            {
                victim = idx;
                victim_next = next;
            }
        }
        resident[victim] = r;
        arrivals[victim] = seq;
    }
    faults
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::frames::FrameTable;

    fn va(n: u32) -> VAddr {
        VAddr::from_u32(n * 0x1000)
    }

    /// Map a few pages and fill a working set over them.
    fn setup(n: usize) -> (FrameTable, AddressSpace, WorkingSet) {
        let mut ft = FrameTable::new(32);
        let mut pd = AddressSpace::new();
        let mut ws = WorkingSet::new(n);
        for i in 0..n {
            let f = ft.allocate_frame().unwrap();
            pd.map_frame(&mut ft, f, va(i as u32 + 1), PtePerms::WRITEABLE | PtePerms::USER)
                .unwrap();
            ws.push(va(i as u32 + 1), FRESH_TIME_STAMP);
        }
        (ft, pd, ws)
    }

    #[test]
    /// With every USED bit clear the clock behaves like FIFO.
    fn clock_is_fifo_with_clear_bits() {
        let (_ft, mut pd, mut ws) = setup(3);
        let p = ReplacementPolicy::Clock;
        assert_eq!(p.select_victim(&mut ws, &mut pd, &[], 0), 0);
    }

    #[test]
    fn clock_skips_recently_used_pages() {
        let (mut ft, mut pd, mut ws) = setup(3);
        // Touch the first page.
        pd.write_bytes(&mut ft, va(1), b"x").unwrap();
        let p = ReplacementPolicy::Clock;
        let victim = p.select_victim(&mut ws, &mut pd, &[], 0);
        assert_eq!(victim, 1);
        // The touched page's USED bit was cleared in passing.
        assert!(!pd.pte(va(1)).unwrap().perms().contains(PtePerms::USED));
    }

    #[test]
    fn modified_clock_prefers_clean_pages() {
        let (mut ft, mut pd, mut ws) = setup(3);
        // Dirty the first two pages, then clear their USED bits so the
        // sweep sees (USED=0, MOD=1).
        pd.write_bytes(&mut ft, va(1), b"x").unwrap();
        pd.write_bytes(&mut ft, va(2), b"x").unwrap();
        pd.clear_pte_perms(va(1), PtePerms::USED);
        pd.clear_pte_perms(va(2), PtePerms::USED);

        let p = ReplacementPolicy::ModifiedClock;
        assert_eq!(p.select_victim(&mut ws, &mut pd, &[], 0), 2);
    }

    #[test]
    fn lru_takes_the_oldest_time_stamp() {
        let (_ft, mut pd, mut ws) = setup(3);
        ws.get_mut(0).time_stamp = 100;
        ws.get_mut(1).time_stamp = 7;
        ws.get_mut(2).time_stamp = 50;
        let p = ReplacementPolicy::LruTimeApprox;
        assert_eq!(p.select_victim(&mut ws, &mut pd, &[], 0), 1);
    }

    #[test]
    fn nchance_gives_extra_sweeps() {
        let (_ft, mut pd, mut ws) = setup(2);
        let p = ReplacementPolicy::NchanceClock { chances: 2 };
        // Nobody referenced: the head still needs its chances used up.
        let victim = p.select_victim(&mut ws, &mut pd, &[], 0);
        assert_eq!(victim, 0);
        assert_eq!(ws.get(0).chances, 2);
    }

    #[test]
    fn optimal_evicts_the_furthest_use() {
        let (_ft, mut pd, mut ws) = setup(3);
        // Stream revisits pages 1 and 2 soon; page 3 never again.
        let stream = alloc::vec![va(1), va(2), va(1)];
        let p = ReplacementPolicy::Optimal;
        assert_eq!(p.select_victim(&mut ws, &mut pd, &stream, 0), 2);
    }

    #[test]
    /// initWS {1,2,3}, maxWS 3, stream [4,1,2,5,1,2,3,4,5] incurs 4
    /// faults under OPTIMAL.
    fn optimal_fault_count_reference_case() {
        let init = [va(1), va(2), va(3)];
        let stream = [
            va(4),
            va(1),
            va(2),
            va(5),
            va(1),
            va(2),
            va(3),
            va(4),
            va(5),
        ];
        assert_eq!(get_optimal_num_faults(&init, 3, &stream), 4);
        // Pure: same answer again, inputs untouched.
        assert_eq!(get_optimal_num_faults(&init, 3, &stream), 4);
        assert_eq!(init[0], va(1));
    }

    #[test]
    fn optimal_fault_count_with_growth() {
        // Empty start: every first use faults, then reuse is free.
        let stream = [va(1), va(2), va(1), va(2)];
        assert_eq!(get_optimal_num_faults(&[], 2, &stream), 2);
    }
}
