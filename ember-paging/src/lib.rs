//! Paging - ARM64 translation tables for the Ember kernel
//!
//! Three-level, 4KB-granule translation (39-bit address spaces) with
//! block coalescing: runs of identical pages are folded into contiguous
//! groups, 2MB blocks and 1GB blocks, and split back apart on demand.
//!
//! # Architecture
//!
//! - `entry`: Packed descriptor model (`PageTableEntry`, `L1Entry`..`L3Entry`)
//! - `table`: The 4KB table type and the memory the tables live in
//! - `address_space`: Map, unmap, query, merge, separate, change permissions
//! - `error`: `MapError`
//!
//! # Physical-to-Virtual Mapping
//!
//! Tables are addressed by physical address. The kernel reaches them through
//! its direct map; call `set_phys_to_virt_offset()` once during
//! initialisation. Before that, the mapping is the identity.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

use spin::Once;

pub mod address_space;
pub mod entry;
pub mod error;
pub mod table;

pub use address_space::{AddressSpace, Mapping};
pub use entry::{
    L1Entry, L2Entry, L3Entry, PageAttribute, PageTableEntry, Permission, Shareable,
    SoftwareReserved,
};
pub use error::{MapError, MapResult};
pub use table::{
    DirectMapTableMemory, FrameSource, HeapTableMemory, Level, PageTable, TableMemory,
    TlbInvalidator,
};

use ember_common::memory::{BLOCKS_PER_TABLE, L2_BLOCK_SIZE, PAGE_SIZE};

const _: () = assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");
const _: () = assert!(
    PAGE_SIZE * BLOCKS_PER_TABLE == L2_BLOCK_SIZE,
    "L2 block size must be one full L3 table"
);

// -- Physical-to-Virtual Address Translation

/// Base of the kernel's direct physical map (initialised once).
static PHYS_TO_VIRT_OFFSET: Once<u64> = Once::new();

/// Set the offset to add to physical addresses when converting to virtual.
///
/// Only the first call has any effect.
pub fn set_phys_to_virt_offset(offset: u64) {
    PHYS_TO_VIRT_OFFSET.call_once(|| offset);
}

/// Try to set the physical-to-virtual offset.
///
/// Returns `true` if the offset was set, `false` if it was already configured.
#[must_use]
pub fn try_set_phys_to_virt_offset(offset: u64) -> bool {
    let mut was_set = false;
    PHYS_TO_VIRT_OFFSET.call_once(|| {
        was_set = true;
        offset
    });
    was_set
}

/// Current physical-to-virtual offset; 0 (identity) until configured.
#[inline]
#[must_use]
pub fn phys_to_virt_offset() -> u64 {
    PHYS_TO_VIRT_OFFSET.get().copied().unwrap_or(0)
}

/// Convert a physical address to its direct-map virtual address.
#[inline]
#[must_use]
pub fn phys_to_virt(phys: u64) -> u64 {
    phys.wrapping_add(phys_to_virt_offset())
}
