//! ARM64 translation table entries
//!
//! One 64-bit word per entry, three levels:
//! - L1: table, or 1GB block
//! - L2: table, or 2MB block
//! - L3: 4KB page only
//!
//! Descriptor format (4KB granule, as used here):
//! ```text
//! +------+-----+-----+----+------+-----+-----+---+------------------------+----+----+----+----+----+------+---+---+
//! | TAP  | TPXN| SWV | SW | UXN  | PXN | CT  | R | Output address [47:12] | nG | AF | SH | AP | NS | INDX | T | M |
//! +------+-----+-----+----+------+-----+-----+---+------------------------+----+----+----+----+----+------+---+---+
//!  61  60  59    58   57 55  54     53    52  51  47                    12  11   10  9  8 7  6  5   4    2  1   0
//! ```
//!
//! Bits 55-58 are reserved for software. The kernel uses them to remember
//! where a mapping starts and ends (so coalescing never merges across a
//! mapping boundary) and to tag block/page entries as valid. Table entries
//! reuse the ignored bits 2-11 as a count of live entries in the child table.
//!
//! Discrimination uses the software valid bit and the type bit together:
//!
//! | SWV | T | kind  |
//! |-----|---|-------|
//! |  0  | 0 | empty |
//! |  1  | 0 | block |
//! |  0  | 1 | table |
//! |  1  | 1 | page  |

use core::fmt;

use tock_registers::{
    interfaces::{ReadWriteable, Readable},
    register_bitfields,
    registers::InMemoryRegister,
};

use ember_common::memory::{
    BLOCKS_PER_CONTIGUOUS_BLOCK, BLOCKS_PER_TABLE, L1_BLOCK_SIZE, L2_BLOCK_SIZE,
    L2_CONTIGUOUS_SIZE, L3_BLOCK_SIZE, L3_CONTIGUOUS_SIZE,
};
use ember_common::PhysAddr;

register_bitfields![u64,
    /// Fields shared by every descriptor level
    pub DescriptorFields [
        /// Hardware valid bit
        MAPPED OFFSET(0) NUMBITS(1) [],

        /// 0 = block, 1 = table (L1/L2) or page (L3)
        TYPE OFFSET(1) NUMBITS(1) [
            Block = 0,
            TableOrPage = 1
        ],

        /// Memory attribute index into MAIR_EL1
        ATTR_INDEX OFFSET(2) NUMBITS(3) [
            DeviceNGnRnE = 0,
            DeviceNGnRE = 1,
            Normal = 2,
            NormalNotCacheable = 3
        ],

        /// Non-secure
        NS OFFSET(5) NUMBITS(1) [],

        /// Access permissions
        AP OFFSET(6) NUMBITS(2) [
            KernelReadWrite = 0b00,
            UserReadWrite = 0b01,
            KernelReadOnly = 0b10,
            UserReadOnly = 0b11
        ],

        /// Shareability
        SH OFFSET(8) NUMBITS(2) [
            NonShareable = 0b00,
            OuterShareable = 0b10,
            InnerShareable = 0b11
        ],

        /// Access flag
        AF OFFSET(10) NUMBITS(1) [],

        /// Not global (ASID-tagged)
        NG OFFSET(11) NUMBITS(1) [],

        /// Live-entry count of the child table (table entries only)
        REF_COUNT OFFSET(2) NUMBITS(10) [],

        /// Contiguous hint
        CONTIGUOUS OFFSET(52) NUMBITS(1) [],

        /// Privileged execute-never
        PXN OFFSET(53) NUMBITS(1) [],

        /// Unprivileged execute-never
        UXN OFFSET(54) NUMBITS(1) [],

        /// Software merge-boundary bits
        SW_RESERVED OFFSET(55) NUMBITS(3) [],

        /// Software valid marker for block/page entries
        SW_VALID OFFSET(58) NUMBITS(1) [],

        /// PXNTable (table entries only)
        TABLE_PXN OFFSET(59) NUMBITS(1) [],

        /// APTable (table entries only)
        TABLE_AP OFFSET(60) NUMBITS(2) []
    ]
];

// -- Raw bit masks

const MAPPED: u64 = 1 << 0;
const TYPE: u64 = 1 << 1;
const CONTIGUOUS: u64 = 1 << 52;
const PXN: u64 = 1 << 53;
const UXN: u64 = 1 << 54;
const SW_SHIFT: u64 = 55;

/// Software valid bit (reserved bit 3)
pub const SW_VALID: u64 = 1 << 58;

/// Mask separating empty / block / table / page
pub const TEST_TABLE_MASK: u64 = SW_VALID | TYPE;

/// Never merge this entry with the one before it
pub const DISABLE_MERGE_HEAD: u64 = (SoftwareReserved::DISABLE_MERGE_HEAD as u64) << SW_SHIFT;
/// Entry lies in the first contiguous group of a mapping
pub const DISABLE_MERGE_HEAD_AND_BODY: u64 =
    (SoftwareReserved::DISABLE_MERGE_HEAD_AND_BODY as u64) << SW_SHIFT;
/// Never merge this entry with the one after it
pub const DISABLE_MERGE_TAIL: u64 = (SoftwareReserved::DISABLE_MERGE_TAIL as u64) << SW_SHIFT;

const DISABLE_MERGE_ALL: u64 = DISABLE_MERGE_HEAD | DISABLE_MERGE_HEAD_AND_BODY | DISABLE_MERGE_TAIL;

/// Template bits kept when comparing candidates for a merge
pub const MERGE_BASE_MASK: u64 =
    0xFFFF_0000_0000_0FFF & !(CONTIGUOUS | TEST_TABLE_MASK | DISABLE_MERGE_ALL);

/// Template bits kept when splitting a contiguous group
const SEPARATE_CONTIGUOUS_BASE_MASK: u64 = 0xFFFF_0000_0000_0FFF & !(CONTIGUOUS | DISABLE_MERGE_ALL);

/// Template bits kept when splitting a block into a child table
const LEVEL_BASE_MASK: u64 = 0xFFF0_0000_0000_0FFF & !(CONTIGUOUS | TEST_TABLE_MASK | DISABLE_MERGE_ALL);

/// Output-address bits of a table entry
const TABLE_ADDRESS_MASK: u64 = select_mask(12, 36);

const _: () = assert!(BLOCKS_PER_TABLE == 512);
const _: () = assert!(BLOCKS_PER_CONTIGUOUS_BLOCK == 16);

#[inline]
const fn select_mask(offset: u32, count: u32) -> u64 {
    ((1u64 << count) - 1) << offset
}

/// Software-reserved bits 55-57, as a 3-bit value.
pub struct SoftwareReserved;

impl SoftwareReserved {
    pub const NONE: u8 = 0;
    pub const DISABLE_MERGE_HEAD: u8 = 1 << 0;
    pub const DISABLE_MERGE_HEAD_AND_BODY: u8 = 1 << 1;
    pub const DISABLE_MERGE_TAIL: u8 = 1 << 2;

    /// Pack the three merge-boundary flags.
    #[must_use]
    pub const fn encode(head: bool, head_and_body: bool, tail: bool) -> u8 {
        (if head { Self::DISABLE_MERGE_HEAD } else { 0 })
            | (if head_and_body { Self::DISABLE_MERGE_HEAD_AND_BODY } else { 0 })
            | (if tail { Self::DISABLE_MERGE_TAIL } else { 0 })
    }
}

/// Access permission template (PXN, UXN and AP bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Permission {
    KernelRWX = UXN,
    KernelRX = UXN | (2 << 6),
    KernelR = PXN | UXN | (2 << 6),
    KernelRW = PXN | UXN,
    UserRX = PXN | (3 << 6),
    UserR = PXN | UXN | (3 << 6),
    UserRW = PXN | UXN | (1 << 6),
}

impl Permission {
    /// Bits a permission occupies
    pub const MASK: u64 = PXN | UXN | (3 << 6);

    pub const ALL: [Self; 7] = [
        Self::KernelRWX,
        Self::KernelRX,
        Self::KernelR,
        Self::KernelRW,
        Self::UserRX,
        Self::UserR,
        Self::UserRW,
    ];

    /// Decode from raw entry bits; combinations the kernel never builds
    /// return `None`.
    #[must_use]
    pub const fn from_bits(raw: u64) -> Option<Self> {
        match raw & Self::MASK {
            x if x == Self::KernelRWX as u64 => Some(Self::KernelRWX),
            x if x == Self::KernelRX as u64 => Some(Self::KernelRX),
            x if x == Self::KernelR as u64 => Some(Self::KernelR),
            x if x == Self::KernelRW as u64 => Some(Self::KernelRW),
            x if x == Self::UserRX as u64 => Some(Self::UserRX),
            x if x == Self::UserR as u64 => Some(Self::UserR),
            x if x == Self::UserRW as u64 => Some(Self::UserRW),
            _ => None,
        }
    }
}

/// Memory attribute (MAIR index) template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum PageAttribute {
    DeviceNGnRnE = 0 << 2,
    DeviceNGnRE = 1 << 2,
    Normal = 2 << 2,
    NormalNotCacheable = 3 << 2,
}

impl PageAttribute {
    pub const ALL: [Self; 4] = [
        Self::DeviceNGnRnE,
        Self::DeviceNGnRE,
        Self::Normal,
        Self::NormalNotCacheable,
    ];

    #[must_use]
    pub const fn from_bits(raw: u64) -> Option<Self> {
        match (raw >> 2) & 0x7 {
            0 => Some(Self::DeviceNGnRnE),
            1 => Some(Self::DeviceNGnRE),
            2 => Some(Self::Normal),
            3 => Some(Self::NormalNotCacheable),
            _ => None,
        }
    }
}

/// Shareability template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Shareable {
    NonShareable = 0 << 8,
    OuterShareable = 2 << 8,
    InnerShareable = 3 << 8,
}

impl Shareable {
    pub const ALL: [Self; 3] = [Self::NonShareable, Self::OuterShareable, Self::InnerShareable];

    #[must_use]
    pub const fn from_bits(raw: u64) -> Option<Self> {
        match (raw >> 8) & 0x3 {
            0 => Some(Self::NonShareable),
            2 => Some(Self::OuterShareable),
            3 => Some(Self::InnerShareable),
            _ => None,
        }
    }
}

/// A translation table entry, level-agnostic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

const _: () = assert!(core::mem::size_of::<PageTableEntry>() == 8);

impl PageTableEntry {
    /// All-zero, unmapped entry
    pub const INVALID: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Build an attribute template for block/page entries.
    ///
    /// The template carries permission, memory type, shareability, AF and nG;
    /// level constructors add the address, type bits and merge metadata.
    #[must_use]
    pub const fn from_attributes(
        perm: Permission,
        attr: PageAttribute,
        share: Shareable,
        access_flag: bool,
        not_global: bool,
    ) -> Self {
        Self(
            perm as u64
                | attr as u64
                | share as u64
                | ((access_flag as u64) << 10)
                | ((not_global as u64) << 11)
                | MAPPED,
        )
    }

    /// Build a table entry pointing at `table` with an initial reference count.
    ///
    /// # Panics
    ///
    /// Panics if `table` is not a 4KB-aligned 48-bit address or
    /// `ref_count` exceeds `BLOCKS_PER_TABLE + 1`.
    #[must_use]
    pub const fn new_table(table: PhysAddr, is_kernel: bool, pxn: bool, ref_count: usize) -> Self {
        assert!(table.as_u64() & !TABLE_ADDRESS_MASK == 0, "misaligned table address");
        assert!(ref_count <= BLOCKS_PER_TABLE + 1, "table reference count out of range");
        Self(
            ((if is_kernel { 0x3u64 } else { 0 }) << 60)
                | ((pxn as u64) << 59)
                | table.as_u64()
                | ((ref_count as u64) << 2)
                | MAPPED
                | TYPE,
        )
    }

    /// Build a block (or, with `page`, an L3 page) from an attribute template.
    #[must_use]
    pub const fn new_block(pa: PhysAddr, attr: Self, sw_reserved: u8, contig: bool, page: bool) -> Self {
        assert!(sw_reserved < 8, "software reserved bits out of range");
        Self(
            attr.0
                | ((sw_reserved as u64) << SW_SHIFT)
                | ((contig as u64) << 52)
                | pa.as_u64()
                | SW_VALID
                | MAPPED
                | (if page { TYPE } else { 0 }),
        )
    }

    // -- Discrimination

    #[inline]
    #[must_use]
    pub const fn is_block(self) -> bool {
        self.0 & TEST_TABLE_MASK == SW_VALID
    }

    #[inline]
    #[must_use]
    pub const fn is_page(self) -> bool {
        self.0 & TEST_TABLE_MASK == TEST_TABLE_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_table(self) -> bool {
        self.0 & TEST_TABLE_MASK == TYPE
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 & TEST_TABLE_MASK == 0
    }

    /// Hardware valid bit
    #[inline]
    #[must_use]
    pub const fn is_mapped(self) -> bool {
        self.0 & MAPPED != 0
    }

    /// Software valid bit
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & SW_VALID != 0
    }

    // -- Field accessors

    fn reg(self) -> InMemoryRegister<u64, DescriptorFields::Register> {
        InMemoryRegister::new(self.0)
    }

    fn modify(&mut self, f: impl FnOnce(&InMemoryRegister<u64, DescriptorFields::Register>)) {
        let reg = self.reg();
        f(&reg);
        self.0 = reg.get();
    }

    #[must_use]
    pub fn permission(self) -> Option<Permission> {
        Permission::from_bits(self.0)
    }

    #[must_use]
    pub fn page_attribute(self) -> Option<PageAttribute> {
        PageAttribute::from_bits(self.0)
    }

    #[must_use]
    pub fn shareable(self) -> Option<Shareable> {
        Shareable::from_bits(self.0)
    }

    #[must_use]
    pub fn access_flag(self) -> bool {
        self.reg().is_set(DescriptorFields::AF)
    }

    #[must_use]
    pub fn is_global(self) -> bool {
        !self.reg().is_set(DescriptorFields::NG)
    }

    #[must_use]
    pub fn is_privileged_execute_never(self) -> bool {
        self.reg().is_set(DescriptorFields::PXN)
    }

    #[must_use]
    pub fn is_user_execute_never(self) -> bool {
        self.reg().is_set(DescriptorFields::UXN)
    }

    #[must_use]
    pub fn is_read_only(self) -> bool {
        self.reg().read(DescriptorFields::AP) & 0b10 != 0
    }

    #[must_use]
    pub fn is_user_accessible(self) -> bool {
        self.reg().read(DescriptorFields::AP) & 0b01 != 0
    }

    /// Executable at the privilege level that can access it.
    #[must_use]
    pub fn is_executable(self) -> bool {
        if self.is_user_accessible() {
            !self.is_user_execute_never()
        } else {
            !self.is_privileged_execute_never()
        }
    }

    /// Attribute template of a block/page: everything but the address,
    /// type bits, contiguous hint and merge-boundary bits.
    #[inline]
    #[must_use]
    pub const fn entry_template(self) -> Self {
        Self(self.0 & LEVEL_BASE_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn is_contiguous(self) -> bool {
        self.0 & CONTIGUOUS != 0
    }

    /// Set or clear the contiguous hint.
    pub fn set_contiguous(&mut self, contig: bool) {
        self.modify(|r| r.modify(DescriptorFields::CONTIGUOUS.val(contig as u64)));
    }

    #[must_use]
    pub fn software_reserved_bits(self) -> u8 {
        self.reg().read(DescriptorFields::SW_RESERVED) as u8
    }

    #[must_use]
    pub fn is_head_merge_disabled(self) -> bool {
        self.software_reserved_bits() & SoftwareReserved::DISABLE_MERGE_HEAD != 0
    }

    #[must_use]
    pub fn is_head_and_body_merge_disabled(self) -> bool {
        self.software_reserved_bits() & SoftwareReserved::DISABLE_MERGE_HEAD_AND_BODY != 0
    }

    #[must_use]
    pub fn is_tail_merge_disabled(self) -> bool {
        self.software_reserved_bits() & SoftwareReserved::DISABLE_MERGE_TAIL != 0
    }

    /// Whether this is a well-formed attribute template: a known
    /// permission, memory type and shareability, and no address, type or
    /// merge bits.
    #[must_use]
    pub fn is_attribute_template(self) -> bool {
        self.0 & !LEVEL_BASE_MASK == 0
            && self.is_mapped()
            && self.permission().is_some()
            && self.page_attribute().is_some()
            && self.shareable().is_some()
    }

    // -- Table reference counting

    /// Physical address of the child table.
    #[inline]
    #[must_use]
    pub const fn table_address(self) -> PhysAddr {
        PhysAddr::new(self.0 & TABLE_ADDRESS_MASK)
    }

    #[must_use]
    pub fn table_reference_count(self) -> usize {
        self.reg().read(DescriptorFields::REF_COUNT) as usize
    }

    fn set_table_reference_count(&mut self, count: usize) {
        self.modify(|r| r.modify(DescriptorFields::REF_COUNT.val(count as u64)));
    }

    /// Record `n` more live entries in the child table.
    ///
    /// # Panics
    ///
    /// Panics if the count would exceed `BLOCKS_PER_TABLE + 1`.
    pub fn open_table_references(&mut self, n: usize) {
        let count = self.table_reference_count();
        assert!(count + n <= BLOCKS_PER_TABLE + 1, "table reference count overflow");
        self.set_table_reference_count(count + n);
    }

    /// Record `n` fewer live entries in the child table.
    ///
    /// # Panics
    ///
    /// Panics if the count would drop below zero.
    pub fn close_table_references(&mut self, n: usize) {
        let count = self.table_reference_count();
        assert!(count >= n, "table reference count underflow");
        self.set_table_reference_count(count - n);
    }

    #[must_use]
    pub fn is_table_reference_count_zero(self) -> bool {
        self.table_reference_count() == 0
    }

    // -- Merge templates

    /// Attribute bits two entries must share to be merged.
    #[inline]
    #[must_use]
    pub const fn entry_template_for_merge(self) -> Self {
        Self(self.0 & MERGE_BASE_MASK)
    }

    /// Whether this entry equals `attr` once merge-boundary bits are ignored.
    #[inline]
    #[must_use]
    pub const fn is_for_merge(self, attr: u64) -> bool {
        self.0 & !DISABLE_MERGE_ALL == attr
    }

    /// Mask applied to the template of entry `idx` when a block is broken up
    /// into a full table of entries.
    #[must_use]
    pub const fn separate_mask(idx: usize) -> u64 {
        let base = MERGE_BASE_MASK;
        if idx == 0 {
            base | DISABLE_MERGE_HEAD | DISABLE_MERGE_HEAD_AND_BODY
        } else if idx < BLOCKS_PER_CONTIGUOUS_BLOCK {
            base | DISABLE_MERGE_HEAD_AND_BODY
        } else if idx < BLOCKS_PER_TABLE - 1 {
            base
        } else {
            base | DISABLE_MERGE_TAIL
        }
    }

    /// Mask applied to member `idx` when a contiguous group is split.
    #[must_use]
    pub const fn separate_contiguous_mask(idx: usize) -> u64 {
        let base = SEPARATE_CONTIGUOUS_BASE_MASK;
        if idx == 0 {
            base | DISABLE_MERGE_HEAD | DISABLE_MERGE_HEAD_AND_BODY
        } else if idx < BLOCKS_PER_CONTIGUOUS_BLOCK - 1 {
            base
        } else {
            base | DISABLE_MERGE_TAIL
        }
    }

    #[must_use]
    pub const fn entry_template_for_separate_contiguous(self, idx: usize) -> Self {
        Self(self.0 & Self::separate_contiguous_mask(idx))
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_table() {
            "table"
        } else if self.is_page() {
            "page"
        } else if self.is_block() {
            "block"
        } else {
            "empty"
        };
        write!(f, "PageTableEntry({kind}, {:#018x})", self.0)
    }
}

/// Mask for child `idx` when a block is split into a table of contiguous
/// groups. The first group keeps the head flags, the last group the tail.
const fn level_block_mask(idx: usize, contiguous_children: usize, tail_start: usize) -> u64 {
    if idx == 0 {
        LEVEL_BASE_MASK | DISABLE_MERGE_HEAD | DISABLE_MERGE_HEAD_AND_BODY
    } else if idx < contiguous_children {
        LEVEL_BASE_MASK | DISABLE_MERGE_HEAD_AND_BODY
    } else if idx < tail_start {
        LEVEL_BASE_MASK
    } else {
        LEVEL_BASE_MASK | DISABLE_MERGE_TAIL
    }
}

macro_rules! level_entry {
    ($(#[$meta:meta])* $name:ident, $shift:expr, $bits:expr, $page:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
        #[repr(transparent)]
        pub struct $name(pub PageTableEntry);

        impl $name {
            pub const INVALID: Self = Self(PageTableEntry::INVALID);

            /// Bit offset of the block address field
            pub const BLOCK_SHIFT: u32 = $shift;

            /// Width of the block address field
            pub const BLOCK_BITS: u32 = $bits;

            /// Bytes mapped by one block at this level
            pub const BLOCK_SIZE: usize = 1 << $shift;

            /// Build a block entry at this level.
            ///
            /// # Panics
            ///
            /// Panics if `pa` has bits outside this level's address field.
            #[must_use]
            pub const fn new_block(pa: PhysAddr, attr: PageTableEntry, sw_reserved: u8, contig: bool) -> Self {
                assert!(
                    pa.as_u64() & !select_mask($shift, $bits) == 0,
                    "block address out of range for level"
                );
                Self(PageTableEntry::new_block(pa, attr, sw_reserved, contig, $page))
            }

            /// Physical address mapped by this block.
            #[inline]
            #[must_use]
            pub const fn block(self) -> PhysAddr {
                PhysAddr::new(self.0.raw() & select_mask($shift, $bits))
            }

            /// Whether this entry maps memory at this level.
            #[inline]
            #[must_use]
            pub const fn is_leaf(self) -> bool {
                if $page {
                    self.0.is_page()
                } else {
                    self.0.is_block()
                }
            }

            /// Whether rebuilding this block from its own address with the
            /// given attributes reproduces it bit for bit.
            #[must_use]
            pub const fn is_compatible_with_attribute(
                self,
                attr: PageTableEntry,
                sw_reserved: u8,
                contig: bool,
            ) -> bool {
                PageTableEntry::new_block(self.block(), attr, sw_reserved, contig, $page).raw()
                    == self.0.raw()
            }
        }

        impl core::ops::Deref for $name {
            type Target = PageTableEntry;

            fn deref(&self) -> &PageTableEntry {
                &self.0
            }
        }

        impl core::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut PageTableEntry {
                &mut self.0
            }
        }

        impl From<PageTableEntry> for $name {
            fn from(entry: PageTableEntry) -> Self {
                Self(entry)
            }
        }

        impl From<$name> for PageTableEntry {
            fn from(entry: $name) -> Self {
                entry.0
            }
        }
    };
}

level_entry!(
    /// L1 entry: table, or 1GB block
    L1Entry, 30, 18, false
);
level_entry!(
    /// L2 entry: table, or 2MB block
    L2Entry, 21, 27, false
);
level_entry!(
    /// L3 entry: 4KB page
    L3Entry, 12, 36, true
);

impl L1Entry {
    /// Table entry pointing at an L2 table.
    #[must_use]
    pub const fn new_table(table: PhysAddr, is_kernel: bool, pxn: bool, ref_count: usize) -> Self {
        Self(PageTableEntry::new_table(table, is_kernel, pxn, ref_count))
    }

    /// Child L2 table, if this is a table entry.
    #[must_use]
    pub const fn table(self) -> Option<PhysAddr> {
        if self.0.is_table() {
            Some(self.0.table_address())
        } else {
            None
        }
    }

    /// Mask for L2 entry `idx` when this 1GB block is split into L2 blocks.
    #[must_use]
    pub const fn l2_block_mask(idx: usize) -> u64 {
        level_block_mask(
            idx,
            L2_CONTIGUOUS_SIZE / L2_BLOCK_SIZE,
            (L1_BLOCK_SIZE - L2_CONTIGUOUS_SIZE) / L2_BLOCK_SIZE,
        )
    }

    #[must_use]
    pub const fn entry_template_for_l2_block(self, idx: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.0.raw() & Self::l2_block_mask(idx))
    }
}

impl L2Entry {
    /// Table entry pointing at an L3 table.
    #[must_use]
    pub const fn new_table(table: PhysAddr, is_kernel: bool, pxn: bool, ref_count: usize) -> Self {
        Self(PageTableEntry::new_table(table, is_kernel, pxn, ref_count))
    }

    /// Child L3 table, if this is a table entry.
    #[must_use]
    pub const fn table(self) -> Option<PhysAddr> {
        if self.0.is_table() {
            Some(self.0.table_address())
        } else {
            None
        }
    }

    /// Mask for L3 entry `idx` when this 2MB block is split into pages.
    #[must_use]
    pub const fn l3_block_mask(idx: usize) -> u64 {
        level_block_mask(
            idx,
            L3_CONTIGUOUS_SIZE / L3_BLOCK_SIZE,
            (L2_BLOCK_SIZE - L3_CONTIGUOUS_SIZE) / L3_BLOCK_SIZE,
        )
    }

    #[must_use]
    pub const fn entry_template_for_l3_block(self, idx: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.0.raw() & Self::l3_block_mask(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn template(perm: Permission) -> PageTableEntry {
        PageTableEntry::from_attributes(
            perm,
            PageAttribute::Normal,
            Shareable::InnerShareable,
            true,
            true,
        )
    }

    #[test]
    fn test_table_entry_encoding() {
        let e = L1Entry::new_table(PhysAddr::new(0x8012_3000), true, true, 5);
        assert_eq!(e.raw(), (3 << 60) | (1 << 59) | 0x8012_3000 | (5 << 2) | 0x3);
        assert!(e.is_table());
        assert_eq!(e.table(), Some(PhysAddr::new(0x8012_3000)));
        assert_eq!(e.table_reference_count(), 5);

        let user = L2Entry::new_table(PhysAddr::new(0x1000), false, false, 0);
        assert_eq!(user.raw(), 0x1003);
    }

    #[test]
    fn test_block_entry_encoding() {
        let attr = template(Permission::UserRW);
        let e = L2Entry::new_block(PhysAddr::new(0x8020_0000), attr, SoftwareReserved::DISABLE_MERGE_TAIL, true);
        assert!(e.is_block());
        assert!(e.is_valid());
        assert!(!e.is_page());
        assert!(e.is_contiguous());
        assert!(e.is_tail_merge_disabled());
        assert!(!e.is_head_merge_disabled());
        assert_eq!(e.block(), PhysAddr::new(0x8020_0000));
        assert_eq!(e.permission(), Some(Permission::UserRW));
        assert!(e.is_user_accessible());
        assert!(!e.is_read_only());

        let mut plain = e;
        plain.set_contiguous(false);
        assert!(!plain.is_contiguous());
        assert!(plain.is_block());
        assert_eq!(plain.block(), e.block());
        assert!(!PageTableEntry::INVALID.is_valid());

        let page = L3Entry::new_block(PhysAddr::new(0x8000_5000), attr, 0, false);
        assert!(attr.is_attribute_template());
        assert!(!page.is_attribute_template());
        assert!(page.is_page());
        assert!(page.is_leaf());
        assert!(!page.is_executable());
        assert_eq!(page.entry_template(), attr);

        let code = L3Entry::new_block(PhysAddr::new(0x8000_6000), template(Permission::UserRX), 0, false);
        assert!(code.is_executable());
        assert!(code.is_read_only());
        assert_eq!(page.raw() & 0x3, 0x3);
    }

    #[test]
    #[should_panic(expected = "out of range for level")]
    fn test_misaligned_block_panics() {
        let _ = L2Entry::new_block(PhysAddr::new(0x8000_1000), template(Permission::KernelRW), 0, false);
    }

    #[test]
    fn test_reference_counting() {
        let mut e = L2Entry::new_table(PhysAddr::new(0x4000), false, false, 0);
        assert!(e.is_table_reference_count_zero());
        e.open_table_references(BLOCKS_PER_TABLE);
        assert_eq!(e.table_reference_count(), 512);
        e.open_table_references(1);
        e.close_table_references(513);
        assert!(e.is_table_reference_count_zero());
        // The table address and type bits are untouched
        assert_eq!(e.table(), Some(PhysAddr::new(0x4000)));
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_reference_count_overflow_panics() {
        let mut e = L2Entry::new_table(PhysAddr::new(0x4000), false, false, 512);
        e.open_table_references(2);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_reference_count_underflow_panics() {
        let mut e = L2Entry::new_table(PhysAddr::new(0x4000), false, false, 1);
        e.close_table_references(2);
    }

    #[test]
    fn test_compatible_with_attribute() {
        let attr = template(Permission::UserR);
        let e = L3Entry::new_block(PhysAddr::new(0x9000), attr, SoftwareReserved::DISABLE_MERGE_HEAD, false);
        assert!(e.is_compatible_with_attribute(attr, SoftwareReserved::DISABLE_MERGE_HEAD, false));
        assert!(!e.is_compatible_with_attribute(attr, 0, false));
        assert!(!e.is_compatible_with_attribute(attr, SoftwareReserved::DISABLE_MERGE_HEAD, true));
        assert!(!e.is_compatible_with_attribute(template(Permission::UserRW), SoftwareReserved::DISABLE_MERGE_HEAD, false));
    }

    #[test]
    fn test_separate_masks_head_and_tail_positions() {
        for idx in 0..BLOCKS_PER_TABLE {
            let mask = PageTableEntry::separate_mask(idx);
            assert_eq!(mask & DISABLE_MERGE_HEAD != 0, idx == 0, "head at {idx}");
            assert_eq!(mask & DISABLE_MERGE_TAIL != 0, idx == BLOCKS_PER_TABLE - 1, "tail at {idx}");
            assert_eq!(mask & DISABLE_MERGE_HEAD_AND_BODY != 0, idx < BLOCKS_PER_CONTIGUOUS_BLOCK);
            // Everything else is permissive: the template bits always survive
            assert_eq!(mask & MERGE_BASE_MASK, MERGE_BASE_MASK);
        }

        for idx in 0..BLOCKS_PER_CONTIGUOUS_BLOCK {
            let mask = PageTableEntry::separate_contiguous_mask(idx);
            assert_eq!(mask & DISABLE_MERGE_HEAD != 0, idx == 0);
            assert_eq!(mask & DISABLE_MERGE_TAIL != 0, idx == BLOCKS_PER_CONTIGUOUS_BLOCK - 1);
            assert_eq!(mask & CONTIGUOUS, 0);
        }
    }

    #[test]
    fn test_level_geometry() {
        assert_eq!(L1Entry::BLOCK_SIZE, L1_BLOCK_SIZE);
        assert_eq!(L2Entry::BLOCK_SIZE, L2_BLOCK_SIZE);
        assert_eq!(L3Entry::BLOCK_SIZE, L3_BLOCK_SIZE);
        assert_eq!(L3Entry::BLOCK_SHIFT + L3Entry::BLOCK_BITS, 48);
        assert_eq!(L2Entry::BLOCK_SHIFT + L2Entry::BLOCK_BITS, 48);
    }

    #[test]
    fn test_level_masks_mark_first_and_last_group() {
        for idx in 0..BLOCKS_PER_TABLE {
            for mask in [L1Entry::l2_block_mask(idx), L2Entry::l3_block_mask(idx)] {
                assert_eq!(mask & DISABLE_MERGE_HEAD != 0, idx == 0);
                assert_eq!(mask & DISABLE_MERGE_HEAD_AND_BODY != 0, idx < 16);
                assert_eq!(mask & DISABLE_MERGE_TAIL != 0, idx >= BLOCKS_PER_TABLE - 16);
                assert_eq!(mask & TEST_TABLE_MASK, 0);
            }
        }
    }

    #[test]
    fn test_split_template_carries_boundary_bits() {
        let attr = template(Permission::KernelRW);
        let sw = SoftwareReserved::encode(true, true, true);
        let l1 = L1Entry::new_block(PhysAddr::new(0x4000_0000), attr, sw, false);

        let first = L2Entry::new_block(PhysAddr::new(0x4000_0000), l1.entry_template_for_l2_block(0), 0, true);
        assert_eq!(first.software_reserved_bits(), SoftwareReserved::encode(true, true, false));
        let body = L2Entry::new_block(PhysAddr::new(0x4020_0000), l1.entry_template_for_l2_block(1), 0, true);
        assert_eq!(body.software_reserved_bits(), SoftwareReserved::DISABLE_MERGE_HEAD_AND_BODY);
        let last = L2Entry::new_block(PhysAddr::new(0x7FE0_0000), l1.entry_template_for_l2_block(511), 0, true);
        assert_eq!(last.software_reserved_bits(), SoftwareReserved::DISABLE_MERGE_TAIL);
        assert_eq!(last.permission(), Some(Permission::KernelRW));
    }

    fn perm_strategy() -> impl Strategy<Value = Permission> {
        prop::sample::select(Permission::ALL.to_vec())
    }

    fn attr_strategy() -> impl Strategy<Value = PageAttribute> {
        prop::sample::select(PageAttribute::ALL.to_vec())
    }

    fn share_strategy() -> impl Strategy<Value = Shareable> {
        prop::sample::select(Shareable::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_block_round_trip(
            perm in perm_strategy(),
            attr in attr_strategy(),
            share in share_strategy(),
            af in any::<bool>(),
            ng in any::<bool>(),
            sw in 0u8..8,
            contig in any::<bool>(),
            frame in 0u64..(1 << 36),
        ) {
            let template = PageTableEntry::from_attributes(perm, attr, share, af, ng);
            let pa = PhysAddr::new(frame << 12);

            let page = L3Entry::new_block(pa, template, sw, contig);
            prop_assert_eq!(page.block(), pa);
            prop_assert_eq!(page.permission(), Some(perm));
            prop_assert_eq!(page.page_attribute(), Some(attr));
            prop_assert_eq!(page.shareable(), Some(share));
            prop_assert_eq!(page.access_flag(), af);
            prop_assert_eq!(page.is_global(), !ng);
            prop_assert_eq!(page.software_reserved_bits(), sw);
            prop_assert_eq!(page.is_contiguous(), contig);
            prop_assert!(page.is_compatible_with_attribute(template, sw, contig));

            let l2_pa = PhysAddr::new((frame << 12) & !((1 << 21) - 1));
            let block = L2Entry::new_block(l2_pa, template, sw, contig);
            prop_assert_eq!(block.block(), l2_pa);
            prop_assert_eq!(block.permission(), Some(perm));

            let l1_pa = PhysAddr::new((frame << 12) & !((1 << 30) - 1));
            let huge = L1Entry::new_block(l1_pa, template, sw, contig);
            prop_assert_eq!(huge.block(), l1_pa);

            let table = L2Entry::new_table(pa, ng, af, (frame % 514) as usize);
            prop_assert_eq!(table.table(), Some(pa));
            prop_assert_eq!(table.table_reference_count(), (frame % 514) as usize);

            for e in [page.0, block.0, huge.0, table.0, PageTableEntry::INVALID] {
                let kinds = [e.is_block(), e.is_table(), e.is_page(), e.is_empty()];
                prop_assert_eq!(kinds.iter().filter(|&&k| k).count(), 1);
            }
        }
    }
}
