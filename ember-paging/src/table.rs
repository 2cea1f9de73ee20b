//! Translation tables and the memory they live in
//!
//! A table is one 4KB page of 512 entries. Tables are named by physical
//! address; [`TableMemory`] turns that address into a reference. The kernel
//! uses [`DirectMapTableMemory`] (frames reached through the direct map);
//! [`HeapTableMemory`] keeps tables on the kernel heap and names them by
//! their identity-mapped heap address.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr;

use ember_common::memory::{BLOCKS_PER_TABLE, L1_BLOCK_SIZE, L2_BLOCK_SIZE, L3_BLOCK_SIZE, PAGE_SIZE};
use ember_common::{PhysAddr, VirtAddr};

use crate::entry::{L1Entry, L2Entry, L3Entry, PageTableEntry};
use crate::phys_to_virt;

/// Mask for extracting a table index from a virtual address
const INDEX_MASK: u64 = 0x1FF;

/// One translation table
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; BLOCKS_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// A table with every entry invalid
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::INVALID; BLOCKS_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, idx: usize) -> PageTableEntry {
        self.entries[idx]
    }

    #[inline]
    pub fn set_entry(&mut self, idx: usize, entry: PageTableEntry) {
        self.entries[idx] = entry;
    }

    #[inline]
    pub fn entry_mut(&mut self, idx: usize) -> &mut PageTableEntry {
        &mut self.entries[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = PageTableEntry> + '_ {
        self.entries.iter().copied()
    }

    /// Whether no entry is in use
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_empty())
    }

    /// Index of `va` in a table at `level`
    #[inline]
    #[must_use]
    pub const fn index_for(va: VirtAddr, level: Level) -> usize {
        ((va.as_u64() >> level.shift()) & INDEX_MASK) as usize
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Translation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    L1,
    L2,
    L3,
}

impl Level {
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::L1 => 30,
            Self::L2 => 21,
            Self::L3 => 12,
        }
    }

    /// Bytes mapped by one leaf at this level
    #[must_use]
    pub const fn block_size(self) -> usize {
        match self {
            Self::L1 => L1_BLOCK_SIZE,
            Self::L2 => L2_BLOCK_SIZE,
            Self::L3 => L3_BLOCK_SIZE,
        }
    }

    /// Level whose table entry holds a table of this level, if any
    #[must_use]
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::L1 => None,
            Self::L2 => Some(Self::L1),
            Self::L3 => Some(Self::L2),
        }
    }

    /// Whether `entry` maps memory at this level.
    #[must_use]
    pub const fn is_leaf(self, entry: PageTableEntry) -> bool {
        match self {
            Self::L1 => L1Entry(entry).is_leaf(),
            Self::L2 => L2Entry(entry).is_leaf(),
            Self::L3 => L3Entry(entry).is_leaf(),
        }
    }

    /// Output address of a leaf at this level.
    #[must_use]
    pub const fn block_address(self, entry: PageTableEntry) -> PhysAddr {
        match self {
            Self::L1 => L1Entry(entry).block(),
            Self::L2 => L2Entry(entry).block(),
            Self::L3 => L3Entry(entry).block(),
        }
    }

    /// Build a leaf at this level.
    #[must_use]
    pub const fn new_block(self, pa: PhysAddr, attr: PageTableEntry, sw: u8, contig: bool) -> PageTableEntry {
        match self {
            Self::L1 => L1Entry::new_block(pa, attr, sw, contig).0,
            Self::L2 => L2Entry::new_block(pa, attr, sw, contig).0,
            Self::L3 => L3Entry::new_block(pa, attr, sw, contig).0,
        }
    }

    #[must_use]
    pub const fn is_compatible_with_attribute(
        self,
        entry: PageTableEntry,
        attr: PageTableEntry,
        sw: u8,
        contig: bool,
    ) -> bool {
        match self {
            Self::L1 => L1Entry(entry).is_compatible_with_attribute(attr, sw, contig),
            Self::L2 => L2Entry(entry).is_compatible_with_attribute(attr, sw, contig),
            Self::L3 => L3Entry(entry).is_compatible_with_attribute(attr, sw, contig),
        }
    }
}

/// TLB maintenance after entries change
pub trait TlbInvalidator {
    /// Invalidate cached translations for one virtual page
    fn invalidate_page(&mut self, va: VirtAddr);

    /// Invalidate all cached translations
    fn invalidate_all(&mut self);
}

/// Storage for translation tables
///
/// Implementations hand out zeroed, page-aligned tables and resolve a
/// table's physical address to the table itself.
pub trait TableMemory: TlbInvalidator {
    /// Allocate a zeroed table, or `None` when out of memory
    fn allocate_table(&mut self) -> Option<PhysAddr>;

    /// Return a table. It must no longer be referenced by any entry.
    fn free_table(&mut self, table: PhysAddr);

    fn table(&self, table: PhysAddr) -> &PageTable;

    fn table_mut(&mut self, table: PhysAddr) -> &mut PageTable;
}

/// Physical frame supplier for [`DirectMapTableMemory`]
pub trait FrameSource {
    /// Allocate one 4KB frame
    fn allocate_frame(&mut self) -> Option<PhysAddr>;

    /// Return a frame obtained from `allocate_frame`
    fn free_frame(&mut self, frame: PhysAddr);
}

/// Tables in physical frames, reached through the kernel's direct map
pub struct DirectMapTableMemory<F: FrameSource> {
    frames: F,
}

impl<F: FrameSource> DirectMapTableMemory<F> {
    /// # Safety
    ///
    /// Every frame `frames` hands out must be exclusively owned by this
    /// table memory and reachable at `phys_to_virt(frame)`.
    pub unsafe fn new(frames: F) -> Self {
        Self { frames }
    }

    fn table_ptr(table: PhysAddr) -> *mut PageTable {
        phys_to_virt(table.as_u64()) as *mut PageTable
    }
}

impl<F: FrameSource> TlbInvalidator for DirectMapTableMemory<F> {
    fn invalidate_page(&mut self, va: VirtAddr) {
        ember_arch::cpu::invalidate_tlb_page(va.as_u64());
    }

    fn invalidate_all(&mut self) {
        ember_arch::cpu::invalidate_tlb_all();
    }
}

impl<F: FrameSource> TableMemory for DirectMapTableMemory<F> {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        let frame = self.frames.allocate_frame()?;
        debug_assert!(frame.is_page_aligned());
        // SAFETY: The frame is owned by us (constructor contract) and mapped
        // in the direct map; a zeroed table is a valid PageTable.
        unsafe { ptr::write_bytes(Self::table_ptr(frame), 0, 1) };
        Some(frame)
    }

    fn free_table(&mut self, table: PhysAddr) {
        self.frames.free_frame(table);
    }

    fn table(&self, table: PhysAddr) -> &PageTable {
        // SAFETY: Tables are only named by addresses this memory allocated.
        unsafe { &*Self::table_ptr(table) }
    }

    fn table_mut(&mut self, table: PhysAddr) -> &mut PageTable {
        // SAFETY: As above; `&mut self` makes the access exclusive.
        unsafe { &mut *Self::table_ptr(table) }
    }
}

/// Tables boxed on the kernel heap, named by their identity-mapped address
#[derive(Default)]
pub struct HeapTableMemory {
    tables: BTreeMap<u64, Box<PageTable>>,
    limit: Option<usize>,
    invalidations: usize,
}

impl HeapTableMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory that refuses to hold more than `limit` tables at once.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Number of tables currently allocated
    #[must_use]
    pub fn live_tables(&self) -> usize {
        self.tables.len()
    }

    /// Number of TLB invalidations requested so far
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations
    }
}

impl TlbInvalidator for HeapTableMemory {
    fn invalidate_page(&mut self, _va: VirtAddr) {
        self.invalidations += 1;
    }

    fn invalidate_all(&mut self) {
        self.invalidations += 1;
    }
}

impl TableMemory for HeapTableMemory {
    fn allocate_table(&mut self) -> Option<PhysAddr> {
        if self.limit.is_some_and(|limit| self.tables.len() >= limit) {
            return None;
        }
        let table = Box::new(PageTable::new());
        let addr = ptr::addr_of!(*table) as u64;
        self.tables.insert(addr, table);
        Some(PhysAddr::new(addr))
    }

    fn free_table(&mut self, table: PhysAddr) {
        let freed = self.tables.remove(&table.as_u64());
        assert!(freed.is_some(), "free of unknown table {table:?}");
    }

    fn table(&self, table: PhysAddr) -> &PageTable {
        match self.tables.get(&table.as_u64()) {
            Some(t) => t,
            None => panic!("unknown table {table:?}"),
        }
    }

    fn table_mut(&mut self, table: PhysAddr) -> &mut PageTable {
        match self.tables.get_mut(&table.as_u64()) {
            Some(t) => t,
            None => panic!("unknown table {table:?}"),
        }
    }
}
