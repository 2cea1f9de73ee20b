//! Address spaces: mapping, unmapping and block coalescing
//!
//! An [`AddressSpace`] owns an L1 root table. Mappings are always created as
//! 4KB pages; [`AddressSpace::merge_pages`] later folds runs of compatible
//! pages into contiguous groups and larger blocks:
//!
//! ```text
//!   16 x L3 page      -> contiguous L3 group (64KB)
//!   32 x L3 group     -> L2 block (2MB), L3 table freed
//!   16 x L2 block     -> contiguous L2 group (32MB)
//!   32 x L2 group     -> L1 block (1GB), L2 table freed
//! ```
//!
//! [`AddressSpace::separate_pages`] walks the same ladder down.
//!
//! # Merge boundaries
//!
//! The first page of every `map_pages` call carries DisableMergeHead (and
//! DisableMergeHeadAndBody), the last carries DisableMergeTail, so separate
//! mappings never coalesce. Within a candidate run, members after the first
//! may not disable head merging and members before the last may not disable
//! tail merging. All members of a contiguous group share one set of bits.
//!
//! # Reference counts
//!
//! Each table entry counts the live entries of the table below it. A table
//! whose count drops to zero is freed and its parent entry cleared.

use core::cmp::min;

use log::{debug, trace};

use ember_arch::cpu;
use ember_common::memory::{
    BLOCKS_PER_CONTIGUOUS_BLOCK, BLOCKS_PER_TABLE, L1_BLOCK_SIZE, L2_BLOCK_SIZE,
    L2_CONTIGUOUS_SIZE, L3_CONTIGUOUS_SIZE, PAGE_SIZE, VA_BITS,
};
use ember_common::{PhysAddr, VirtAddr};

use crate::entry::{L1Entry, L2Entry, PageTableEntry, SoftwareReserved};
use crate::error::{MapError, MapResult};
use crate::table::{Level, PageTable, TableMemory};

/// Lowest kernel (TTBR1) virtual address
pub const KERNEL_SPACE_BASE: u64 = !((1u64 << VA_BITS) - 1);

/// Upper bound (exclusive) of user (TTBR0) virtual addresses
pub const USER_SPACE_END: u64 = 1u64 << VA_BITS;

/// Highest output address the descriptors can hold
const PHYS_ADDR_LIMIT: u64 = 1u64 << 48;

/// Above this many pages, flush the whole TLB instead of page by page
const TLB_RANGE_THRESHOLD: usize = 16;

const GROUP: usize = BLOCKS_PER_CONTIGUOUS_BLOCK;

/// A resolved translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Physical address `va` translates to
    pub pa: PhysAddr,
    /// Attribute template of the leaf
    pub template: PageTableEntry,
    /// Size of the leaf mapping `va`
    pub block_size: usize,
    /// Whether the leaf is part of a contiguous group
    pub contiguous: bool,
    /// The leaf entry itself
    pub entry: PageTableEntry,
}

/// Where a leaf lives
#[derive(Debug, Clone, Copy)]
struct Leaf {
    level: Level,
    table: PhysAddr,
    idx: usize,
    entry: PageTableEntry,
}

#[inline]
fn index(va: u64, level: Level) -> usize {
    PageTable::index_for(VirtAddr::new(va), level)
}

/// Largest power of two dividing `addr` (0 maps to the full range).
#[inline]
fn alignment(addr: u64) -> usize {
    if addr == 0 {
        usize::MAX
    } else {
        1usize << addr.trailing_zeros()
    }
}

/// An L1-rooted translation regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysAddr,
    is_kernel: bool,
}

impl AddressSpace {
    /// Allocate an empty root table.
    pub fn new<M: TableMemory + ?Sized>(mem: &mut M, is_kernel: bool) -> MapResult<Self> {
        let root = mem.allocate_table().ok_or(MapError::OutOfResource)?;
        debug!("address space created: root={root:?} kernel={is_kernel}");
        Ok(Self { root, is_kernel })
    }

    /// Physical address of the root table (the TTBR value).
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysAddr {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// Free every table, root included. Mapped memory itself is not touched.
    pub fn finalize<M: TableMemory + ?Sized>(self, mem: &mut M) {
        for i1 in 0..BLOCKS_PER_TABLE {
            let Some(l2_table) = L1Entry(mem.table(self.root).entry(i1)).table() else {
                continue;
            };
            for i2 in 0..BLOCKS_PER_TABLE {
                if let Some(l3_table) = L2Entry(mem.table(l2_table).entry(i2)).table() {
                    mem.free_table(l3_table);
                }
            }
            mem.free_table(l2_table);
        }
        mem.free_table(self.root);
        mem.invalidate_all();
        debug!("address space finalized: root={:?}", self.root);
    }

    // -- Validation

    fn check_range(&self, va: VirtAddr, size: usize) -> MapResult<()> {
        let start = va.as_u64();
        let last = start
            .checked_add(size as u64 - 1)
            .ok_or(MapError::OutOfRange)?;
        let in_range = if self.is_kernel {
            start >= KERNEL_SPACE_BASE
        } else {
            last < USER_SPACE_END
        };
        if in_range {
            Ok(())
        } else {
            Err(MapError::OutOfRange)
        }
    }

    fn check_request(&self, va: VirtAddr, num_pages: usize) -> MapResult<usize> {
        if !va.is_page_aligned() {
            return Err(MapError::NotAligned);
        }
        let size = num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or(MapError::OutOfRange)?;
        self.check_range(va, size)?;
        Ok(size)
    }

    fn check_template(template: PageTableEntry) -> MapResult<()> {
        if template.is_attribute_template() {
            Ok(())
        } else {
            Err(MapError::InvalidAttributes)
        }
    }

    fn all_mapped<M: TableMemory + ?Sized>(&self, mem: &M, va: u64, num_pages: usize) -> bool {
        (0..num_pages).all(|i| self.find_leaf(mem, va + (i * PAGE_SIZE) as u64).is_some())
    }

    // -- Walking

    fn find_leaf<M: TableMemory + ?Sized>(&self, mem: &M, va: u64) -> Option<Leaf> {
        let i1 = index(va, Level::L1);
        let l1 = L1Entry(mem.table(self.root).entry(i1));
        if l1.is_block() {
            return Some(Leaf { level: Level::L1, table: self.root, idx: i1, entry: l1.0 });
        }
        let l2_table = l1.table()?;
        let i2 = index(va, Level::L2);
        let l2 = L2Entry(mem.table(l2_table).entry(i2));
        if l2.is_block() {
            return Some(Leaf { level: Level::L2, table: l2_table, idx: i2, entry: l2.0 });
        }
        let l3_table = l2.table()?;
        let i3 = index(va, Level::L3);
        let l3 = mem.table(l3_table).entry(i3);
        l3.is_page()
            .then_some(Leaf { level: Level::L3, table: l3_table, idx: i3, entry: l3 })
    }

    /// Translate `va`.
    #[must_use]
    pub fn query<M: TableMemory + ?Sized>(&self, mem: &M, va: VirtAddr) -> Option<Mapping> {
        let leaf = self.find_leaf(mem, va.as_u64())?;
        let block_size = leaf.level.block_size();
        let offset = va.as_u64() & (block_size as u64 - 1);
        Some(Mapping {
            pa: leaf.level.block_address(leaf.entry).offset(offset),
            template: leaf.entry.entry_template(),
            block_size,
            contiguous: leaf.entry.is_contiguous(),
            entry: leaf.entry,
        })
    }

    fn update<M: TableMemory + ?Sized>(
        mem: &mut M,
        table: PhysAddr,
        idx: usize,
        f: impl FnOnce(&mut PageTableEntry),
    ) -> PageTableEntry {
        let entry = mem.table_mut(table).entry_mut(idx);
        f(entry);
        *entry
    }

    fn invalidate_range<M: TableMemory + ?Sized>(mem: &mut M, va: u64, size: usize) {
        let pages = size / PAGE_SIZE;
        if pages > TLB_RANGE_THRESHOLD {
            mem.invalidate_all();
        } else {
            for i in 0..pages {
                mem.invalidate_page(VirtAddr::new(va + (i * PAGE_SIZE) as u64));
            }
        }
    }

    // -- Mapping

    /// Map `num_pages` 4KB pages at `va` to `pa` with an attribute template.
    ///
    /// Tables are created on demand. On failure nothing stays mapped.
    pub fn map_pages<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        va: VirtAddr,
        pa: PhysAddr,
        num_pages: usize,
        template: PageTableEntry,
    ) -> MapResult<()> {
        if !pa.is_page_aligned() {
            return Err(MapError::NotAligned);
        }
        if num_pages == 0 {
            return Ok(());
        }
        let size = self.check_request(va, num_pages)?;
        match pa.as_u64().checked_add(size as u64) {
            Some(end) if end <= PHYS_ADDR_LIMIT => {}
            _ => return Err(MapError::OutOfRange),
        }
        Self::check_template(template)?;

        if (0..num_pages).any(|i| self.find_leaf(mem, va.as_u64() + (i * PAGE_SIZE) as u64).is_some()) {
            return Err(MapError::AlreadyMapped);
        }

        for i in 0..num_pages {
            let offset = (i * PAGE_SIZE) as u64;
            let sw = SoftwareReserved::encode(i == 0, i == 0, i == num_pages - 1);
            if let Err(e) = self.map_page(mem, va.as_u64() + offset, pa.offset(offset), template, sw) {
                if i > 0 {
                    self.remove_range(mem, va.as_u64(), i * PAGE_SIZE);
                }
                debug!("map {va:?} x{num_pages} failed at page {i}: {e}");
                return Err(e);
            }
        }

        trace!("mapped {va:?} -> {pa:?} x{num_pages}");
        Ok(())
    }

    fn map_page<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        va: u64,
        pa: PhysAddr,
        template: PageTableEntry,
        sw: u8,
    ) -> MapResult<()> {
        let i1 = index(va, Level::L1);
        let l2_table = match L1Entry(mem.table(self.root).entry(i1)).table() {
            Some(table) => table,
            None => {
                let table = mem.allocate_table().ok_or(MapError::OutOfResource)?;
                let entry = L1Entry::new_table(table, self.is_kernel, true, 0);
                mem.table_mut(self.root).set_entry(i1, entry.0);
                table
            }
        };

        let i2 = index(va, Level::L2);
        let l3_table = match L2Entry(mem.table(l2_table).entry(i2)).table() {
            Some(table) => table,
            None => {
                let Some(table) = mem.allocate_table() else {
                    self.reclaim(mem, va);
                    return Err(MapError::OutOfResource);
                };
                let entry = L2Entry::new_table(table, self.is_kernel, true, 0);
                mem.table_mut(l2_table).set_entry(i2, entry.0);
                Self::update(mem, self.root, i1, |e| e.open_table_references(1));
                table
            }
        };

        let i3 = index(va, Level::L3);
        let page = Level::L3.new_block(pa, template, sw, false);
        mem.table_mut(l3_table).set_entry(i3, page);
        Self::update(mem, l2_table, i2, |e| e.open_table_references(1));
        Ok(())
    }

    /// Free the tables on the path to `va` whose reference count is zero.
    fn reclaim<M: TableMemory + ?Sized>(&self, mem: &mut M, va: u64) {
        let i1 = index(va, Level::L1);
        let l1 = L1Entry(mem.table(self.root).entry(i1));
        let Some(l2_table) = l1.table() else {
            return;
        };

        let i2 = index(va, Level::L2);
        let l2 = L2Entry(mem.table(l2_table).entry(i2));
        if let Some(l3_table) = l2.table() {
            if l2.is_table_reference_count_zero() {
                mem.table_mut(l2_table).set_entry(i2, PageTableEntry::INVALID);
                cpu::dsb_sy();
                mem.free_table(l3_table);
                Self::update(mem, self.root, i1, |e| e.close_table_references(1));
            }
        }

        let l1 = L1Entry(mem.table(self.root).entry(i1));
        if l1.is_table_reference_count_zero() {
            mem.table_mut(self.root).set_entry(i1, PageTableEntry::INVALID);
            cpu::dsb_sy();
            mem.free_table(l2_table);
        }
    }

    // -- Unmapping

    /// Unmap `num_pages` pages at `va`, splitting blocks at the edges.
    pub fn unmap_pages<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        va: VirtAddr,
        num_pages: usize,
    ) -> MapResult<()> {
        if num_pages == 0 {
            return Ok(());
        }
        let size = self.check_request(va, num_pages)?;
        if !self.all_mapped(mem, va.as_u64(), num_pages) {
            return Err(MapError::NotMapped);
        }

        self.separate_edges(mem, va, size)?;
        self.remove_range(mem, va.as_u64(), size);
        trace!("unmapped {va:?} x{num_pages}");
        Ok(())
    }

    /// Split the leaves at both ends of `[va, va + size)` so that none
    /// straddles the range boundary.
    fn separate_edges<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        va: VirtAddr,
        size: usize,
    ) -> MapResult<()> {
        self.separate_pages(mem, va, min(alignment(va.as_u64()), size))?;
        if size > PAGE_SIZE {
            let end = va.as_u64() + size as u64;
            let last_page = VirtAddr::new(end - PAGE_SIZE as u64);
            if let Err(e) = self.separate_pages(mem, last_page, min(alignment(end), size)) {
                self.merge_pages(mem, va);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Clear every leaf in a range whose edges are already separated.
    fn remove_range<M: TableMemory + ?Sized>(&mut self, mem: &mut M, va: u64, size: usize) {
        let end = va + size as u64;
        let mut cur = va;
        while cur < end {
            let Some(leaf) = self.find_leaf(mem, cur) else {
                panic!("mapping at {cur:#x} vanished during unmap");
            };
            let count = if leaf.entry.is_contiguous() { GROUP } else { 1 };
            let first = leaf.idx & !(count - 1);
            debug_assert_eq!(first, leaf.idx, "contiguous group straddles unmap range");

            for i in 0..count {
                mem.table_mut(leaf.table).set_entry(first + i, PageTableEntry::INVALID);
            }

            match leaf.level {
                Level::L1 => {}
                Level::L2 => {
                    let i1 = index(cur, Level::L1);
                    let l1 = Self::update(mem, self.root, i1, |e| e.close_table_references(count));
                    if l1.is_table_reference_count_zero() {
                        mem.table_mut(self.root).set_entry(i1, PageTableEntry::INVALID);
                        cpu::dsb_sy();
                        mem.free_table(leaf.table);
                    }
                }
                Level::L3 => {
                    let i1 = index(cur, Level::L1);
                    let i2 = index(cur, Level::L2);
                    if let Some(l2_table) = L1Entry(mem.table(self.root).entry(i1)).table() {
                        Self::update(mem, l2_table, i2, |e| e.close_table_references(count));
                    }
                    self.reclaim(mem, cur);
                }
            }

            cur += (count * leaf.level.block_size()) as u64;
        }
        Self::invalidate_range(mem, va, size);
    }

    // -- Coalescing

    /// Coalesce the mapping around `va` as far as it will go.
    ///
    /// Returns whether anything changed.
    pub fn merge_pages<M: TableMemory + ?Sized>(&mut self, mem: &mut M, va: VirtAddr) -> bool {
        let va = va.as_u64();
        let mut merged = false;

        let i1 = index(va, Level::L1);
        let Some(l2_table) = L1Entry(mem.table(self.root).entry(i1)).table() else {
            return false;
        };

        let i2 = index(va, Level::L2);
        if let Some(l3_table) = L2Entry(mem.table(l2_table).entry(i2)).table() {
            let i3 = index(va, Level::L3);
            let l3 = mem.table(l3_table).entry(i3);
            if !l3.is_page() {
                return false;
            }
            if !l3.is_contiguous() {
                if !Self::make_contiguous(mem, l3_table, i3 & !(GROUP - 1), Level::L3) {
                    return false;
                }
                merged = true;
            }
            if !self.promote_table(mem, l2_table, i2, l3_table, Level::L3) {
                return merged;
            }
            merged = true;
        }

        let l2 = mem.table(l2_table).entry(i2);
        if !l2.is_block() {
            return merged;
        }
        if !l2.is_contiguous() {
            if !Self::make_contiguous(mem, l2_table, i2 & !(GROUP - 1), Level::L2) {
                return merged;
            }
            merged = true;
        }
        if self.promote_table(mem, self.root, i1, l2_table, Level::L2) {
            merged = true;
        }
        merged
    }

    /// Check that `count` leaves starting at `first` form one run and can be
    /// rebuilt from the first leaf's template.
    fn can_merge_run<M: TableMemory + ?Sized>(
        mem: &M,
        table: PhysAddr,
        first: usize,
        count: usize,
        level: Level,
        contiguous: bool,
    ) -> bool {
        let t = mem.table(table);
        let head = t.entry(first);
        if !level.is_leaf(head) || head.is_contiguous() != contiguous {
            return false;
        }
        let base = level.block_address(head);
        let run_size = (count * level.block_size()) as u64;
        if base.as_u64() % run_size != 0 {
            return false;
        }

        let template = head.entry_template_for_merge();
        let proto = level.new_block(PhysAddr::new(0), template, 0, contiguous).raw();
        let stride = if contiguous { GROUP } else { 1 };
        (0..count).all(|i| {
            let e = t.entry(first + i);
            let pa = base.as_u64() + (i * level.block_size()) as u64;
            if !e.is_for_merge(proto | pa) {
                return false;
            }
            if !level.is_compatible_with_attribute(e, template, e.software_reserved_bits(), contiguous) {
                return false;
            }
            // Boundary bits are only meaningful at run-member edges
            let member = i / stride;
            let members = count / stride;
            let at_member_head = i % stride == 0;
            let at_member_tail = i % stride == stride - 1;
            if member > 0 && at_member_head && e.is_head_merge_disabled() {
                return false;
            }
            if member < members - 1 && at_member_tail && e.is_tail_merge_disabled() {
                return false;
            }
            true
        })
    }

    /// Boundary bits for a run: the head's head flags, the tail's tail flag.
    fn merged_sw(head: PageTableEntry, tail: PageTableEntry) -> u8 {
        SoftwareReserved::encode(
            head.is_head_merge_disabled(),
            head.is_head_and_body_merge_disabled(),
            tail.is_tail_merge_disabled(),
        )
    }

    /// Turn 16 identical leaves into one contiguous group.
    fn make_contiguous<M: TableMemory + ?Sized>(
        mem: &mut M,
        table: PhysAddr,
        first: usize,
        level: Level,
    ) -> bool {
        if !Self::can_merge_run(mem, table, first, GROUP, level, false) {
            return false;
        }
        let head = mem.table(table).entry(first);
        let tail = mem.table(table).entry(first + GROUP - 1);
        let template = head.entry_template_for_merge();
        let base = level.block_address(head);
        let sw = Self::merged_sw(head, tail);
        for i in 0..GROUP {
            let pa = base.offset((i * level.block_size()) as u64);
            mem.table_mut(table)
                .set_entry(first + i, level.new_block(pa, template, sw, true));
        }
        trace!("contiguous {level:?} group at {base:?}");
        true
    }

    /// Replace a full table of contiguous groups by one block in the parent.
    fn promote_table<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        parent_table: PhysAddr,
        parent_idx: usize,
        child_table: PhysAddr,
        child_level: Level,
    ) -> bool {
        let Some(parent_level) = child_level.parent() else {
            return false;
        };

        // Groups that are not yet contiguous get a chance first
        for group in (0..BLOCKS_PER_TABLE).step_by(GROUP) {
            let head = mem.table(child_table).entry(group);
            if child_level.is_leaf(head) && !head.is_contiguous() {
                Self::make_contiguous(mem, child_table, group, child_level);
            }
        }
        if !Self::can_merge_run(mem, child_table, 0, BLOCKS_PER_TABLE, child_level, true) {
            return false;
        }

        let head = mem.table(child_table).entry(0);
        let tail = mem.table(child_table).entry(BLOCKS_PER_TABLE - 1);
        let base = child_level.block_address(head);
        let block = parent_level.new_block(
            base,
            head.entry_template_for_merge(),
            Self::merged_sw(head, tail),
            false,
        );

        let mut parent = mem.table(parent_table).entry(parent_idx);
        parent.close_table_references(BLOCKS_PER_TABLE);
        assert!(
            parent.is_table_reference_count_zero(),
            "promoted table still referenced"
        );

        cpu::dsb_sy();
        mem.table_mut(parent_table).set_entry(parent_idx, block);
        mem.free_table(child_table);
        mem.invalidate_all();
        trace!("promoted {child_level:?} table to {parent_level:?} block at {base:?}");
        true
    }

    // -- Separation

    /// Split the leaves covering `va` until the one mapping `va` is no
    /// larger than `block_size`.
    ///
    /// On failure, whatever was already split is merged back.
    pub fn separate_pages<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        va: VirtAddr,
        block_size: usize,
    ) -> MapResult<()> {
        match self.separate_pages_impl(mem, va.as_u64(), block_size) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.merge_pages(mem, va);
                Err(e)
            }
        }
    }

    fn separate_pages_impl<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        va: u64,
        block_size: usize,
    ) -> MapResult<()> {
        let i1 = index(va, Level::L1);
        let l1 = L1Entry(mem.table(self.root).entry(i1));
        if l1.is_block() && block_size < L1_BLOCK_SIZE {
            let l2_table = mem.allocate_table().ok_or(MapError::OutOfResource)?;
            let base = l1.block();
            for i in 0..BLOCKS_PER_TABLE {
                let pa = base.offset((i * L2_BLOCK_SIZE) as u64);
                let entry = L2Entry::new_block(pa, l1.entry_template_for_l2_block(i), 0, true);
                mem.table_mut(l2_table).set_entry(i, entry.0);
            }
            cpu::dsb_sy();
            let table = L1Entry::new_table(l2_table, self.is_kernel, true, BLOCKS_PER_TABLE);
            mem.table_mut(self.root).set_entry(i1, table.0);
            mem.invalidate_page(VirtAddr::new(va & !(L1_BLOCK_SIZE as u64 - 1)));
        }

        let Some(l2_table) = L1Entry(mem.table(self.root).entry(i1)).table() else {
            return Ok(());
        };

        let i2 = index(va, Level::L2);
        let l2 = L2Entry(mem.table(l2_table).entry(i2));
        if l2.is_block() && l2.is_contiguous() && block_size < L2_CONTIGUOUS_SIZE {
            Self::split_contiguous(mem, l2_table, i2 & !(GROUP - 1), Level::L2);
            Self::invalidate_range(mem, va & !(L2_CONTIGUOUS_SIZE as u64 - 1), L2_CONTIGUOUS_SIZE);
        }

        let l2 = L2Entry(mem.table(l2_table).entry(i2));
        if l2.is_block() && block_size < L2_BLOCK_SIZE {
            let l3_table = mem.allocate_table().ok_or(MapError::OutOfResource)?;
            let base = l2.block();
            for i in 0..BLOCKS_PER_TABLE {
                let pa = base.offset((i * PAGE_SIZE) as u64);
                let entry = Level::L3.new_block(pa, l2.entry_template_for_l3_block(i), 0, true);
                mem.table_mut(l3_table).set_entry(i, entry);
            }
            cpu::dsb_sy();
            let table = L2Entry::new_table(l3_table, self.is_kernel, true, BLOCKS_PER_TABLE);
            mem.table_mut(l2_table).set_entry(i2, table.0);
            mem.invalidate_page(VirtAddr::new(va & !(L2_BLOCK_SIZE as u64 - 1)));
        }

        let Some(l3_table) = L2Entry(mem.table(l2_table).entry(i2)).table() else {
            return Ok(());
        };

        let i3 = index(va, Level::L3);
        let l3 = mem.table(l3_table).entry(i3);
        if l3.is_page() && l3.is_contiguous() && block_size < L3_CONTIGUOUS_SIZE {
            Self::split_contiguous(mem, l3_table, i3 & !(GROUP - 1), Level::L3);
            Self::invalidate_range(mem, va & !(L3_CONTIGUOUS_SIZE as u64 - 1), L3_CONTIGUOUS_SIZE);
        }
        Ok(())
    }

    /// Clear the contiguous hint on a group, handing the boundary bits to
    /// its first and last members.
    fn split_contiguous<M: TableMemory + ?Sized>(mem: &mut M, table: PhysAddr, first: usize, level: Level) {
        for i in 0..GROUP {
            let e = mem.table(table).entry(first + i);
            let rebuilt = level.new_block(
                level.block_address(e),
                e.entry_template_for_separate_contiguous(i),
                0,
                false,
            );
            mem.table_mut(table).set_entry(first + i, rebuilt);
        }
    }

    // -- Permissions

    /// Rewrite the attributes of `num_pages` mapped pages at `va`.
    ///
    /// Blocks straddling the range are split first; afterwards both ends
    /// are merged again.
    pub fn change_permissions<M: TableMemory + ?Sized>(
        &mut self,
        mem: &mut M,
        va: VirtAddr,
        num_pages: usize,
        template: PageTableEntry,
    ) -> MapResult<()> {
        if num_pages == 0 {
            return Ok(());
        }
        let size = self.check_request(va, num_pages)?;
        Self::check_template(template)?;
        if !self.all_mapped(mem, va.as_u64(), num_pages) {
            return Err(MapError::NotMapped);
        }

        self.separate_edges(mem, va, size)?;

        let end = va.as_u64() + size as u64;
        let mut cur = va.as_u64();
        while cur < end {
            let Some(leaf) = self.find_leaf(mem, cur) else {
                panic!("mapping at {cur:#x} vanished during permission change");
            };
            let rebuilt = leaf.level.new_block(
                leaf.level.block_address(leaf.entry),
                template,
                leaf.entry.software_reserved_bits(),
                leaf.entry.is_contiguous(),
            );
            mem.table_mut(leaf.table).set_entry(leaf.idx, rebuilt);
            cur += leaf.level.block_size() as u64;
        }
        Self::invalidate_range(mem, va.as_u64(), size);

        self.merge_pages(mem, va);
        if size > PAGE_SIZE {
            self.merge_pages(mem, VirtAddr::new(end - PAGE_SIZE as u64));
        }
        trace!("changed permissions {va:?} x{num_pages}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{PageAttribute, Permission, Shareable};
    use crate::table::HeapTableMemory;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    const VA: u64 = 0x4000_0000;
    const PA: u64 = 0x8000_0000;

    fn template(perm: Permission) -> PageTableEntry {
        PageTableEntry::from_attributes(perm, PageAttribute::Normal, Shareable::InnerShareable, true, true)
    }

    fn setup() -> (HeapTableMemory, AddressSpace) {
        let mut mem = HeapTableMemory::new();
        let space = AddressSpace::new(&mut mem, false).expect("root table");
        (mem, space)
    }

    fn l1_entry(mem: &HeapTableMemory, space: &AddressSpace, va: u64) -> PageTableEntry {
        mem.table(space.root()).entry(index(va, Level::L1))
    }

    fn l2_entry(mem: &HeapTableMemory, space: &AddressSpace, va: u64) -> PageTableEntry {
        let l2 = L1Entry(l1_entry(mem, space, va)).table().expect("L2 table");
        mem.table(l2).entry(index(va, Level::L2))
    }

    fn assert_maps(mem: &HeapTableMemory, space: &AddressSpace, va: u64, pa: u64, pages: usize) {
        for i in 0..pages {
            let off = (i * PAGE_SIZE) as u64;
            let m = space.query(mem, VirtAddr::new(va + off)).expect("mapped");
            assert_eq!(m.pa, PhysAddr::new(pa + off), "page {i}");
        }
    }

    #[test]
    fn test_map_and_query() {
        let (mut mem, mut space) = setup();
        let t = template(Permission::UserRW);
        space
            .map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), 3, t)
            .expect("map");

        assert_maps(&mem, &space, VA, PA, 3);
        let m = space.query(&mem, VirtAddr::new(VA + 0x1234)).expect("mapped");
        assert_eq!(m.pa, PhysAddr::new(PA + 0x1234));
        assert_eq!(m.block_size, PAGE_SIZE);
        assert_eq!(m.template, t);
        assert!(!m.contiguous);
        assert!(space.query(&mem, VirtAddr::new(VA + 0x3000)).is_none());

        // One L2 entry in the L2 table, three pages in the L3 table
        assert_eq!(l1_entry(&mem, &space, VA).table_reference_count(), 1);
        assert_eq!(l2_entry(&mem, &space, VA).table_reference_count(), 3);
        assert_eq!(mem.live_tables(), 3);
    }

    #[test]
    fn test_map_rejects_bad_requests() {
        let (mut mem, mut space) = setup();
        let t = template(Permission::UserRW);
        let va = VirtAddr::new(VA);
        let pa = PhysAddr::new(PA);

        assert_eq!(space.map_pages(&mut mem, VirtAddr::new(VA + 1), pa, 1, t), Err(MapError::NotAligned));
        assert_eq!(space.map_pages(&mut mem, va, PhysAddr::new(PA + 8), 1, t), Err(MapError::NotAligned));
        assert_eq!(
            space.map_pages(&mut mem, VirtAddr::new(USER_SPACE_END - 0x1000), pa, 2, t),
            Err(MapError::OutOfRange)
        );
        assert_eq!(
            space.map_pages(&mut mem, va, pa, 1, PageTableEntry::from_raw(0x8000_0403)),
            Err(MapError::InvalidAttributes)
        );

        space.map_pages(&mut mem, va, pa, 4, t).expect("map");
        assert_eq!(
            space.map_pages(&mut mem, VirtAddr::new(VA + 0x3000), pa, 2, t),
            Err(MapError::AlreadyMapped)
        );
        // The rejected request left nothing behind
        assert!(space.query(&mem, VirtAddr::new(VA + 0x4000)).is_none());
    }

    #[test]
    fn test_kernel_space_range() {
        let mut mem = HeapTableMemory::new();
        let mut space = AddressSpace::new(&mut mem, true).expect("root");
        let t = template(Permission::KernelRW);
        assert_eq!(
            space.map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), 1, t),
            Err(MapError::OutOfRange)
        );
        let kva = KERNEL_SPACE_BASE + VA;
        space.map_pages(&mut mem, VirtAddr::new(kva), PhysAddr::new(PA), 1, t).expect("map");
        assert_maps(&mem, &space, kva, PA, 1);
        // Kernel tables carry APTable and PXNTable
        assert_eq!(l1_entry(&mem, &space, kva).raw() >> 59, 0b111);
    }

    #[test]
    fn test_unmap_reclaims_tables() {
        let (mut mem, mut space) = setup();
        let t = template(Permission::UserRW);
        space.map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), 4, t).expect("map");

        space.unmap_pages(&mut mem, VirtAddr::new(VA + 0x1000), 2).expect("unmap");
        assert!(space.query(&mem, VirtAddr::new(VA + 0x1000)).is_none());
        assert!(space.query(&mem, VirtAddr::new(VA + 0x2000)).is_none());
        assert_eq!(l2_entry(&mem, &space, VA).table_reference_count(), 2);

        assert_eq!(space.unmap_pages(&mut mem, VirtAddr::new(VA), 2), Err(MapError::NotMapped));

        space.unmap_pages(&mut mem, VirtAddr::new(VA), 1).expect("unmap");
        space.unmap_pages(&mut mem, VirtAddr::new(VA + 0x3000), 1).expect("unmap");
        assert_eq!(mem.live_tables(), 1);
        assert!(l1_entry(&mem, &space, VA).is_empty());
        assert!(mem.invalidations() > 0);
    }

    #[test]
    fn test_single_mapping_becomes_contiguous() {
        let (mut mem, mut space) = setup();
        let t = template(Permission::UserR);
        space.map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), 16, t).expect("map");

        assert!(space.merge_pages(&mut mem, VirtAddr::new(VA)));
        for i in 0..16u64 {
            let m = space.query(&mem, VirtAddr::new(VA + i * 0x1000)).expect("mapped");
            assert!(m.contiguous);
            assert_eq!(m.pa, PhysAddr::new(PA + i * 0x1000));
            // Every member carries the run's boundary bits
            assert!(m.entry.is_head_merge_disabled());
            assert!(m.entry.is_tail_merge_disabled());
        }
        // Nothing more to do
        assert!(!space.merge_pages(&mut mem, VirtAddr::new(VA)));
    }

    #[test]
    fn test_adjacent_mappings_do_not_merge() {
        let (mut mem, mut space) = setup();
        let t = template(Permission::UserR);
        space.map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), 8, t).expect("map");
        space
            .map_pages(&mut mem, VirtAddr::new(VA + 0x8000), PhysAddr::new(PA + 0x8000), 8, t)
            .expect("map");

        assert!(!space.merge_pages(&mut mem, VirtAddr::new(VA)));
        assert!(!space.query(&mem, VirtAddr::new(VA)).expect("mapped").contiguous);
    }

    #[test]
    fn test_mismatched_attributes_do_not_merge() {
        let (mut mem, mut space) = setup();
        space
            .map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), 16, template(Permission::UserR))
            .expect("map");
        space
            .change_permissions(&mut mem, VirtAddr::new(VA + 0x5000), 1, template(Permission::UserRW))
            .expect("change");
        assert!(!space.merge_pages(&mut mem, VirtAddr::new(VA)));
    }

    fn map_merged_2m(mem: &mut HeapTableMemory, space: &mut AddressSpace) {
        space
            .map_pages(mem, VirtAddr::new(VA), PhysAddr::new(PA), 512, template(Permission::UserRW))
            .expect("map");
        assert!(space.merge_pages(mem, VirtAddr::new(VA)));
    }

    #[test]
    fn test_merge_to_l2_block_frees_l3_table() {
        let (mut mem, mut space) = setup();
        map_merged_2m(&mut mem, &mut space);

        let m = space.query(&mem, VirtAddr::new(VA + 0x12_3456)).expect("mapped");
        assert_eq!(m.block_size, L2_BLOCK_SIZE);
        assert_eq!(m.pa, PhysAddr::new(PA + 0x12_3456));
        assert!(!m.contiguous);
        assert!(m.entry.is_head_merge_disabled());
        assert!(m.entry.is_tail_merge_disabled());
        // Root plus the L2 table; the L3 table is gone
        assert_eq!(mem.live_tables(), 2);
        assert_eq!(l1_entry(&mem, &space, VA).table_reference_count(), 1);
    }

    #[test]
    fn test_separate_then_merge_round_trips() {
        let (mut mem, mut space) = setup();
        map_merged_2m(&mut mem, &mut space);
        let before = l2_entry(&mem, &space, VA);

        space
            .separate_pages(&mut mem, VirtAddr::new(VA + 0x2_0000), PAGE_SIZE)
            .expect("separate");
        let m = space.query(&mem, VirtAddr::new(VA + 0x2_0000)).expect("mapped");
        assert_eq!(m.block_size, PAGE_SIZE);
        assert!(!m.contiguous);
        // Other groups stay contiguous
        assert!(space.query(&mem, VirtAddr::new(VA)).expect("mapped").contiguous);
        assert_eq!(l2_entry(&mem, &space, VA).table_reference_count(), 512);
        assert_maps(&mem, &space, VA, PA, 512);

        assert!(space.merge_pages(&mut mem, VirtAddr::new(VA + 0x2_0000)));
        assert_eq!(l2_entry(&mem, &space, VA), before);
        assert_eq!(mem.live_tables(), 2);
    }

    #[test]
    fn test_separate_failure_merges_back() {
        let (mut mem, mut space) = setup();
        map_merged_2m(&mut mem, &mut space);
        mem.set_limit(Some(mem.live_tables()));

        assert_eq!(
            space.separate_pages(&mut mem, VirtAddr::new(VA), PAGE_SIZE),
            Err(MapError::OutOfResource)
        );
        let m = space.query(&mem, VirtAddr::new(VA)).expect("mapped");
        assert_eq!(m.block_size, L2_BLOCK_SIZE);
    }

    #[test]
    fn test_map_failure_leaves_nothing() {
        let mut mem = HeapTableMemory::with_limit(3);
        let mut space = AddressSpace::new(&mut mem, false).expect("root");
        // Crosses into a second L3 table, which the limit refuses
        let va = VA + L2_BLOCK_SIZE as u64 - 0x2000;
        assert_eq!(
            space.map_pages(&mut mem, VirtAddr::new(va), PhysAddr::new(PA), 4, template(Permission::UserRW)),
            Err(MapError::OutOfResource)
        );
        assert!(space.query(&mem, VirtAddr::new(va)).is_none());
        assert_eq!(mem.live_tables(), 1);
    }

    #[test]
    fn test_unmap_inside_block() {
        let (mut mem, mut space) = setup();
        map_merged_2m(&mut mem, &mut space);

        space.unmap_pages(&mut mem, VirtAddr::new(VA + 0x4_1000), 3).expect("unmap");
        for off in [0x4_1000u64, 0x4_2000, 0x4_3000] {
            assert!(space.query(&mem, VirtAddr::new(VA + off)).is_none());
        }
        for off in [0u64, 0x4_0000, 0x4_4000, 0x1F_F000] {
            let m = space.query(&mem, VirtAddr::new(VA + off)).expect("mapped");
            assert_eq!(m.pa, PhysAddr::new(PA + off));
        }
        assert_eq!(l2_entry(&mem, &space, VA).table_reference_count(), 509);

        // Unmapping the rest reclaims every table
        space.unmap_pages(&mut mem, VirtAddr::new(VA), 0x41).expect("unmap head");
        space
            .unmap_pages(&mut mem, VirtAddr::new(VA + 0x4_4000), 512 - 0x44)
            .expect("unmap tail");
        assert_eq!(mem.live_tables(), 1);
    }

    #[test]
    fn test_change_permissions_inside_block() {
        let (mut mem, mut space) = setup();
        map_merged_2m(&mut mem, &mut space);

        let ro = template(Permission::UserR);
        space.change_permissions(&mut mem, VirtAddr::new(VA + 0x1_0000), 16, ro).expect("change");

        let changed = space.query(&mem, VirtAddr::new(VA + 0x1_0000)).expect("mapped");
        assert_eq!(changed.template.permission(), Some(Permission::UserR));
        // The changed group keeps its contiguous hint
        assert!(changed.contiguous);
        let untouched = space.query(&mem, VirtAddr::new(VA + 0x2_0000)).expect("mapped");
        assert_eq!(untouched.template.permission(), Some(Permission::UserRW));
        assert_maps(&mem, &space, VA, PA, 512);

        // Restoring the permission lets the block form again
        space
            .change_permissions(&mut mem, VirtAddr::new(VA + 0x1_0000), 16, template(Permission::UserRW))
            .expect("restore");
        assert_eq!(
            space.query(&mem, VirtAddr::new(VA)).expect("mapped").block_size,
            L2_BLOCK_SIZE
        );
    }

    #[test]
    fn test_merge_to_l1_block_and_back() {
        let (mut mem, mut space) = setup();
        let pages = L1_BLOCK_SIZE / PAGE_SIZE;
        space
            .map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), pages, template(Permission::UserRW))
            .expect("map");
        for i in 0..BLOCKS_PER_TABLE {
            space.merge_pages(&mut mem, VirtAddr::new(VA + (i * L2_BLOCK_SIZE) as u64));
        }

        let m = space.query(&mem, VirtAddr::new(VA + 0x1234_5678)).expect("mapped");
        assert_eq!(m.block_size, L1_BLOCK_SIZE);
        assert_eq!(m.pa, PhysAddr::new(PA + 0x1234_5678));
        assert_eq!(mem.live_tables(), 1);

        space
            .separate_pages(&mut mem, VirtAddr::new(VA + 0x1234_5000), PAGE_SIZE)
            .expect("separate");
        let m = space.query(&mem, VirtAddr::new(VA + 0x1234_5678)).expect("mapped");
        assert_eq!(m.block_size, PAGE_SIZE);
        let far = space.query(&mem, VirtAddr::new(VA + 0x3000_0000)).expect("mapped");
        assert_eq!(far.block_size, L2_BLOCK_SIZE);
        assert!(far.contiguous);

        space.unmap_pages(&mut mem, VirtAddr::new(VA), pages).expect("unmap");
        assert_eq!(mem.live_tables(), 1);
    }

    #[test]
    fn test_finalize_frees_everything() {
        let (mut mem, mut space) = setup();
        let t = template(Permission::UserRW);
        space.map_pages(&mut mem, VirtAddr::new(VA), PhysAddr::new(PA), 2, t).expect("map");
        space
            .map_pages(&mut mem, VirtAddr::new(3 * VA), PhysAddr::new(PA), 2, t)
            .expect("map");
        space.finalize(&mut mem);
        assert_eq!(mem.live_tables(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Map { page: usize, count: usize },
        Unmap { page: usize, count: usize },
        Merge { page: usize },
        Separate { page: usize },
        Protect { page: usize, count: usize },
    }

    /// Pages within one 4MB window, so runs can cross an L2 boundary
    const WINDOW_PAGES: usize = 1024;

    fn op_strategy() -> impl Strategy<Value = Op> {
        let page = 0..WINDOW_PAGES;
        prop_oneof![
            (page.clone(), 1..64usize).prop_map(|(page, count)| Op::Map { page, count }),
            (page.clone(), 1..64usize).prop_map(|(page, count)| Op::Unmap { page, count }),
            page.clone().prop_map(|page| Op::Merge { page }),
            page.clone().prop_map(|page| Op::Separate { page }),
            (page, 1..64usize).prop_map(|(page, count)| Op::Protect { page, count }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_matches_page_model(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let (mut mem, mut space) = setup();
            // page -> (pa, permission)
            let mut model: BTreeMap<usize, (u64, Permission)> = BTreeMap::new();
            let page_va = |p: usize| VirtAddr::new(VA + (p * PAGE_SIZE) as u64);

            for op in ops {
                match op {
                    Op::Map { page, count } => {
                        let count = count.min(WINDOW_PAGES - page);
                        let pa = PA + (page * PAGE_SIZE) as u64;
                        let free = (page..page + count).all(|p| !model.contains_key(&p));
                        let r = space.map_pages(&mut mem, page_va(page), PhysAddr::new(pa), count, template(Permission::UserRW));
                        prop_assert_eq!(r.is_ok(), free);
                        if free {
                            for p in page..page + count {
                                model.insert(p, (PA + (p * PAGE_SIZE) as u64, Permission::UserRW));
                            }
                        }
                    }
                    Op::Unmap { page, count } => {
                        let count = count.min(WINDOW_PAGES - page);
                        let mapped = (page..page + count).all(|p| model.contains_key(&p));
                        let r = space.unmap_pages(&mut mem, page_va(page), count);
                        prop_assert_eq!(r.is_ok(), mapped);
                        if mapped {
                            for p in page..page + count {
                                model.remove(&p);
                            }
                        }
                    }
                    Op::Merge { page } => {
                        space.merge_pages(&mut mem, page_va(page));
                    }
                    Op::Separate { page } => {
                        prop_assert!(space.separate_pages(&mut mem, page_va(page), PAGE_SIZE).is_ok());
                    }
                    Op::Protect { page, count } => {
                        let count = count.min(WINDOW_PAGES - page);
                        let mapped = (page..page + count).all(|p| model.contains_key(&p));
                        let r = space.change_permissions(&mut mem, page_va(page), count, template(Permission::UserR));
                        prop_assert_eq!(r.is_ok(), mapped);
                        if mapped {
                            for p in page..page + count {
                                if let Some(entry) = model.get_mut(&p) {
                                    entry.1 = Permission::UserR;
                                }
                            }
                        }
                    }
                }

                for p in 0..WINDOW_PAGES {
                    let got = space.query(&mem, page_va(p));
                    match model.get(&p) {
                        Some(&(pa, perm)) => {
                            let m = got.expect("model says mapped");
                            prop_assert_eq!(m.pa, PhysAddr::new(pa));
                            prop_assert_eq!(m.template.permission(), Some(perm));
                        }
                        None => prop_assert!(got.is_none()),
                    }
                }
            }

            let pages: Vec<usize> = model.keys().copied().collect();
            for p in pages {
                space.unmap_pages(&mut mem, page_va(p), 1).expect("unmap model page");
            }
            prop_assert_eq!(mem.live_tables(), 1);
        }
    }
}
