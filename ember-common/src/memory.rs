//! Memory Geometry and Physical Windows
//!
//! Page and block sizes for the 4KB-granule, three-level translation scheme
//! (L1 = 1GB blocks, L2 = 2MB blocks, L3 = 4KB pages), plus the static table
//! of named physical windows the kernel is allowed to map.

/// Page size (4KB granule)
pub const PAGE_SIZE: usize = 4096;

/// Page shift
pub const PAGE_SHIFT: u32 = 12;

/// L3 block (page) size
pub const L3_BLOCK_SIZE: usize = 1 << 12;

/// L2 block size (2MB)
pub const L2_BLOCK_SIZE: usize = 1 << 21;

/// L1 block size (1GB)
pub const L1_BLOCK_SIZE: usize = 1 << 30;

/// Number of entries that make up one contiguous-hint group
pub const BLOCKS_PER_CONTIGUOUS_BLOCK: usize = 0x10;

/// Number of entries in a translation table
pub const BLOCKS_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// Contiguous L3 group size (64KB)
pub const L3_CONTIGUOUS_SIZE: usize = BLOCKS_PER_CONTIGUOUS_BLOCK * L3_BLOCK_SIZE;

/// Contiguous L2 group size (32MB)
pub const L2_CONTIGUOUS_SIZE: usize = BLOCKS_PER_CONTIGUOUS_BLOCK * L2_BLOCK_SIZE;

/// Contiguous L1 group size (16GB)
pub const L1_CONTIGUOUS_SIZE: usize = BLOCKS_PER_CONTIGUOUS_BLOCK * L1_BLOCK_SIZE;

/// Width of the virtual address space covered by an L1 root table
pub const VA_BITS: u32 = 39;

const _: () = assert!(BLOCKS_PER_TABLE == 512);
const _: () = assert!(L1_BLOCK_SIZE == BLOCKS_PER_TABLE * L2_BLOCK_SIZE);
const _: () = assert!(L2_BLOCK_SIZE == BLOCKS_PER_TABLE * L3_BLOCK_SIZE);

/// Kind of physical window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WindowKind {
    /// Conventional DRAM
    Dram = 0,
    /// Device registers
    Mmio = 1,
    /// On-chip SRAM
    Iram = 2,
}

/// A named, fixed physical memory window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemoryWindow {
    pub name: &'static str,
    pub base: u64,
    pub size: u64,
    pub kind: WindowKind,
    /// Whether user processes may map this window
    pub user_mappable: bool,
}

impl MemoryWindow {
    /// Create a new window.
    #[must_use]
    pub const fn new(
        name: &'static str,
        base: u64,
        size: u64,
        kind: WindowKind,
        user_mappable: bool,
    ) -> Self {
        Self { name, base, size, kind, user_mappable }
    }

    /// Exclusive end address.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Check whether `[addr, addr + size)` lies entirely inside this window.
    #[must_use]
    pub const fn contains_range(&self, addr: u64, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        match addr.checked_add(size) {
            Some(end) => addr >= self.base && end <= self.end(),
            None => false,
        }
    }
}

/// Physical memory windows of the target SoC.
pub static MEMORY_WINDOWS: &[MemoryWindow] = &[
    MemoryWindow::new("iram", 0x4000_0000, 0x4_0000, WindowKind::Iram, false),
    MemoryWindow::new("gic-distributor", 0x5004_1000, 0x1000, WindowKind::Mmio, false),
    MemoryWindow::new("gic-cpu-interface", 0x5004_2000, 0x1000, WindowKind::Mmio, false),
    MemoryWindow::new("clk-rst", 0x6000_6000, 0x1000, WindowKind::Mmio, false),
    MemoryWindow::new("uart", 0x7000_6000, 0x40, WindowKind::Mmio, false),
    MemoryWindow::new("pmc", 0x7000_E400, 0xC00, WindowKind::Mmio, false),
    MemoryWindow::new("memory-controller", 0x7001_9000, 0x1000, WindowKind::Mmio, false),
    MemoryWindow::new("dram", 0x8000_0000, 0x1_0000_0000, WindowKind::Dram, true),
];

/// Find the window that fully contains `[addr, addr + size)`.
#[must_use]
pub fn find_window(addr: u64, size: u64) -> Option<&'static MemoryWindow> {
    MEMORY_WINDOWS.iter().find(|w| w.contains_range(addr, size))
}
