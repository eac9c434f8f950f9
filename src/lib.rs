//! The memory-management core of the Minos teaching kernel.
//!
//! Everything a small demand-paging kernel needs to own memory lives in
//! here, modelled as explicit state so it can be driven and inspected from
//! ordinary host tests:
//!
//!  * The frame table: every physical frame, its reference count, and the
//!    free list (`memory::frames`).
//!  * A segregated-fit block allocator that formats heap pages into
//!    power-of-two slabs (`memory::dynalloc`).
//!  * A cluster page allocator with boundary-tag coalescing for multi-page
//!    allocations (`memory::kheap`).
//!  * The page-fault handler and its family of working-set replacement
//!    policies (`fault`).
//!  * Named, refcounted shared-memory objects (`memory::shared`).
//!
//! The [`kernel::Kernel`] facade ties the pieces together under the
//! two-lock regime (the frame lock and the shares lock) and exposes the
//! kernel- and user-side entry points.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod prelude;

pub mod error;
pub mod fault;
pub mod kernel;
pub mod memory;
pub mod pagefile;
pub mod process;
pub mod uheap;

pub use crate::error::KError;
pub use crate::kernel::{Kernel, MachineConfig};
pub use crate::memory::{PAddr, VAddr, PAGE_SIZE};
