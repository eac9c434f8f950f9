//! The virtual-memory layout the core is built around.
//!
//! A 32-bit address space: the user heap and stack live below
//! `USER_LIMIT`, the kernel heap occupies the top of the space. The
//! kernel heap splits into the dynamic-allocator region (block
//! allocations up to [`DYN_ALLOC_MAX_BLOCK_SIZE`]), one guard page, and
//! the page-allocator region whose default size is exactly [`N_ROWS`]
//! pages. The user heap has the same shape.
//!
//! The defaults below describe the full machine; tests usually run a
//! scaled-down [`LayoutParams`] with the same proportions.

use super::{VAddr, PAGE_SIZE};

/// Base of the kernel heap.
pub const KERNEL_HEAP_START: u32 = 0xf600_0000;

/// One past the last usable kernel-heap page.
pub const KERNEL_HEAP_MAX: u32 = 0xffff_f000;

/// Size of the dynamic-allocator region inside either heap.
pub const DYN_ALLOC_MAX_SIZE: usize = 32 * 1024 * 1024;

/// Largest request the dynamic allocator serves; anything bigger goes
/// to the cluster page allocator.
pub const DYN_ALLOC_MAX_BLOCK_SIZE: usize = 1 << LOG2_MAX_SIZE;

/// log2 of the smallest block class (8 bytes).
pub const LOG2_MIN_SIZE: u8 = 3;

/// log2 of the largest block class (2048 bytes).
pub const LOG2_MAX_SIZE: u8 = 11;

/// Rows of the free-cluster index: one per possible cluster length, and
/// also the page count of the default kernel page-allocator region.
pub const N_ROWS: usize = 32766;

/// Largest cluster a single allocation may claim, in pages.
pub const MAX_CLUSTER_PAGES: usize = 1024;

/// Base of the user heap.
pub const USER_HEAP_START: u32 = 0x8000_0000;

/// One past the user heap.
pub const USER_HEAP_MAX: u32 = 0xa000_0000;

/// The user stack occupies `[USTACKBOTTOM, USTACKTOP)` and grows down.
pub const USTACKTOP: u32 = 0xeebf_e000;
pub const USTACKBOTTOM: u32 = USTACKTOP - 256 * PAGE_SIZE as u32;

/// Top of user-visible memory; `[USTACKTOP, USER_TOP)` is the stack
/// underflow guard.
pub const USER_TOP: u32 = 0xeec0_0000;

/// Everything at or above this address is kernel-only.
pub const USER_LIMIT: u32 = 0xf000_0000;

/// Top of the kernel-stack area; one stack (plus guard page) per process
/// is carved downwards from here.
pub const KSTACKTOP: u32 = 0xefc0_0000;

/// Pages per kernel stack, excluding the guard page below it.
pub const KSTACK_PAGES: usize = 8;

const_assert!(DYN_ALLOC_MAX_SIZE % PAGE_SIZE == 0);
const_assert_eq!(DYN_ALLOC_MAX_BLOCK_SIZE, 2048);
// The default page-allocator region holds exactly one page per row of
// the free-cluster index.
const_assert_eq!(
    (KERNEL_HEAP_MAX as usize - KERNEL_HEAP_START as usize - DYN_ALLOC_MAX_SIZE - PAGE_SIZE)
        / PAGE_SIZE,
    N_ROWS
);

/// The layout a [`crate::kernel::Kernel`] instance runs with.
///
/// All fields are page aligned. `Default` is the full machine above;
/// [`LayoutParams::small`] is a proportionally shrunk machine for tests.
#[derive(Clone, Copy, Debug)]
pub struct LayoutParams {
    pub kernel_heap_start: u32,
    pub kernel_heap_max: u32,
    /// Size of the kernel dynamic-allocator region, in bytes.
    pub kernel_da_size: usize,
    pub user_heap_start: u32,
    pub user_heap_max: u32,
    /// Size of the user dynamic-allocator region, in bytes.
    pub user_da_size: usize,
    pub ustack_bottom: u32,
    pub ustack_top: u32,
    pub user_top: u32,
    pub user_limit: u32,
    pub kstack_top: u32,
}

impl Default for LayoutParams {
    fn default() -> LayoutParams {
        LayoutParams {
            kernel_heap_start: KERNEL_HEAP_START,
            kernel_heap_max: KERNEL_HEAP_MAX,
            kernel_da_size: DYN_ALLOC_MAX_SIZE,
            user_heap_start: USER_HEAP_START,
            user_heap_max: USER_HEAP_MAX,
            user_da_size: DYN_ALLOC_MAX_SIZE,
            ustack_bottom: USTACKBOTTOM,
            ustack_top: USTACKTOP,
            user_top: USER_TOP,
            user_limit: USER_LIMIT,
            kstack_top: KSTACKTOP,
        }
    }
}

impl LayoutParams {
    /// A small machine for tests: 16-page dynamic-allocator regions and
    /// 64-page page-allocator regions, 16-page user stack.
    pub fn small() -> LayoutParams {
        let kernel_da = 16 * PAGE_SIZE;
        let user_da = 16 * PAGE_SIZE;
        LayoutParams {
            kernel_heap_start: KERNEL_HEAP_START,
            kernel_heap_max: KERNEL_HEAP_START
                + (kernel_da + PAGE_SIZE + 64 * PAGE_SIZE) as u32,
            kernel_da_size: kernel_da,
            user_heap_start: USER_HEAP_START,
            user_heap_max: USER_HEAP_START + (user_da + PAGE_SIZE + 64 * PAGE_SIZE) as u32,
            user_da_size: user_da,
            ustack_bottom: USTACKTOP - 16 * PAGE_SIZE as u32,
            ustack_top: USTACKTOP,
            user_top: USER_TOP,
            user_limit: USER_LIMIT,
            kstack_top: KSTACKTOP,
        }
    }

    /// First page of the kernel page-allocator region (one guard page
    /// above the dynamic-allocator region).
    pub fn kheap_page_alloc_start(&self) -> VAddr {
        VAddr::from_u32(self.kernel_heap_start + self.kernel_da_size as u32 + PAGE_SIZE as u32)
    }

    /// Pages in the kernel page-allocator region.
    pub fn kheap_pages(&self) -> usize {
        (self.kernel_heap_max - self.kheap_page_alloc_start().as_u32()) as usize / PAGE_SIZE
    }

    pub fn kernel_da_start(&self) -> VAddr {
        VAddr::from_u32(self.kernel_heap_start)
    }

    pub fn kernel_da_end(&self) -> VAddr {
        VAddr::from_u32(self.kernel_heap_start + self.kernel_da_size as u32)
    }

    /// First page of the user page-allocator region.
    pub fn uheap_page_alloc_start(&self) -> VAddr {
        VAddr::from_u32(self.user_heap_start + self.user_da_size as u32 + PAGE_SIZE as u32)
    }

    /// Pages in the user page-allocator region.
    pub fn uheap_pages(&self) -> usize {
        (self.user_heap_max - self.uheap_page_alloc_start().as_u32()) as usize / PAGE_SIZE
    }

    pub fn user_da_start(&self) -> VAddr {
        VAddr::from_u32(self.user_heap_start)
    }

    pub fn user_da_end(&self) -> VAddr {
        VAddr::from_u32(self.user_heap_start + self.user_da_size as u32)
    }

    /// Kernel stack range `(bottom, top)` for a process; stacks are
    /// carved downwards from `kstack_top`, one guard page apart.
    pub fn kstack_range(&self, pid: usize) -> (VAddr, VAddr) {
        let span = ((KSTACK_PAGES + 1) * PAGE_SIZE) as u32;
        let top = self.kstack_top - pid as u32 * span;
        let bottom = top - (KSTACK_PAGES * PAGE_SIZE) as u32;
        (VAddr::from_u32(bottom), VAddr::from_u32(top))
    }

    pub fn in_user_heap(&self, va: VAddr) -> bool {
        va.as_u32() >= self.user_heap_start && va.as_u32() < self.user_heap_max
    }

    pub fn in_user_stack(&self, va: VAddr) -> bool {
        va.as_u32() >= self.ustack_bottom && va.as_u32() < self.ustack_top
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_layout_shape() {
        let l = LayoutParams::default();
        assert_eq!(l.kheap_pages(), N_ROWS);
        assert!(l.kernel_da_end().as_u32() < l.kheap_page_alloc_start().as_u32());
        assert!(l.uheap_page_alloc_start().as_u32() < l.user_heap_max);
    }

    #[test]
    fn small_layout_shape() {
        let l = LayoutParams::small();
        assert_eq!(l.kheap_pages(), 64);
        assert_eq!(l.uheap_pages(), 64);
        assert_eq!(l.kernel_da_size / PAGE_SIZE, 16);
    }

    #[test]
    fn kstacks_do_not_overlap() {
        let l = LayoutParams::default();
        let (b0, t0) = l.kstack_range(0);
        let (b1, t1) = l.kstack_range(1);
        assert!(t1 < b0 || t0 < b1);
        assert_eq!(t0 - b0, KSTACK_PAGES * PAGE_SIZE);
    }
}
