//! The page-file backing store.
//!
//! Holds one 4 KiB copy per swapped-out (process, page) pair with a
//! global capacity in pages. The fault handler reads copies back on
//! placement and writes dirty victims out on eviction.

use alloc::boxed::Box;
use hashbrown::HashMap;

use crate::error::KError;
use crate::memory::{VAddr, PAGE_SIZE};
use crate::process::Pid;

pub struct PageFile {
    capacity: usize,
    store: HashMap<(Pid, u32), Box<[u8; PAGE_SIZE]>>,
}

impl PageFile {
    pub fn new(capacity_pages: usize) -> PageFile {
        PageFile {
            capacity: capacity_pages,
            store: HashMap::new(),
        }
    }

    /// Copy the stored page for `(pid, va)` into `dst`.
    pub fn read_env_page(&self, pid: Pid, va: VAddr, dst: &mut [u8; PAGE_SIZE]) -> Result<(), KError> {
        match self.store.get(&(pid, va.vpn())) {
            Some(data) => {
                dst.copy_from_slice(&data[..]);
                Ok(())
            }
            None => Err(KError::PageNotInPageFile),
        }
    }

    /// Write (or overwrite) the stored page for `(pid, va)`.
    pub fn update_env_page(&mut self, pid: Pid, va: VAddr, src: &[u8; PAGE_SIZE]) -> Result<(), KError> {
        let key = (pid, va.vpn());
        if !self.store.contains_key(&key) && self.store.len() == self.capacity {
            return Err(KError::PageFileFull);
        }
        self.store.insert(key, Box::new(*src));
        Ok(())
    }

    pub fn contains(&self, pid: Pid, va: VAddr) -> bool {
        self.store.contains_key(&(pid, va.vpn()))
    }

    pub fn remove_env_page(&mut self, pid: Pid, va: VAddr) {
        self.store.remove(&(pid, va.vpn()));
    }

    /// Drop every page belonging to `pid`.
    pub fn remove_env(&mut self, pid: Pid) {
        self.store.retain(|&(p, _), _| p != pid);
    }

    pub fn pages_in_use(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let mut pf = PageFile::new(4);
        let va = VAddr::from_u32(0x8000_0000);
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0x5a;
        pf.update_env_page(1, va, &page).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        pf.read_env_page(1, va, &mut out).unwrap();
        assert_eq!(out[0], 0x5a);

        assert_eq!(
            pf.read_env_page(2, va, &mut out),
            Err(KError::PageNotInPageFile)
        );
    }

    #[test]
    fn capacity_is_enforced() {
        let mut pf = PageFile::new(2);
        let page = [0u8; PAGE_SIZE];
        pf.update_env_page(1, VAddr::from_u32(0x1000), &page).unwrap();
        pf.update_env_page(1, VAddr::from_u32(0x2000), &page).unwrap();
        assert_eq!(
            pf.update_env_page(1, VAddr::from_u32(0x3000), &page),
            Err(KError::PageFileFull)
        );
        // Overwrites never fail for space.
        pf.update_env_page(1, VAddr::from_u32(0x2000), &page).unwrap();
    }

    #[test]
    fn remove_env_drops_all_pages() {
        let mut pf = PageFile::new(8);
        let page = [0u8; PAGE_SIZE];
        pf.update_env_page(1, VAddr::from_u32(0x1000), &page).unwrap();
        pf.update_env_page(1, VAddr::from_u32(0x2000), &page).unwrap();
        pf.update_env_page(2, VAddr::from_u32(0x1000), &page).unwrap();

        pf.remove_env(1);
        assert_eq!(pf.pages_in_use(), 1);
        assert!(pf.contains(2, VAddr::from_u32(0x1000)));
    }
}
