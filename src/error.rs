//! The error type shared by every subsystem in the core.
//!
//! Recoverable failures travel as `Result<_, KError>`; invariant
//! violations (corrupt boundary tags, frees into unformatted pages,
//! repeated faults on one address) panic with a diagnostic instead.

use alloc::string::ToString;
use custom_error::custom_error;

custom_error! {
    #[derive(Clone, PartialEq, Eq)]
    pub KError
    OutOfMemory = "out of physical memory",
    ZeroAllocation = "zero-size allocation request",
    AllocationTooLarge{size: usize} = "allocation of {size} bytes exceeds the allocator limit",
    WouldBlock = "caller enqueued on the allocation wait queue",
    BadAddress{va: u32} = "no mapping covers address {va}",
    NoShare = "no shared object backs this address",
    ShareExists = "a shared object with this owner and name already exists",
    ShareNotFound = "no shared object with this owner and name",
    PageNotInPageFile = "page has no copy in the page file",
    PageFileFull = "the page file is out of space",
    NoSuchProcess{pid: usize} = "process {pid} does not exist",
}
