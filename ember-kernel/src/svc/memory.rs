//! Memory SVCs
//!
//! Permission changes, aliasing and queries on the caller's own address
//! space. Addresses and sizes are checked before the lock is taken; the
//! page tables are locked after the scheduler lock.

use alloc::vec::Vec;

use ember_common::memory::{L2_BLOCK_SIZE, PAGE_SIZE};
use ember_common::{PhysAddr, VirtAddr};
use ember_paging::address_space::USER_SPACE_END;
use ember_paging::{AddressSpace, MapError, PageAttribute, PageTableEntry, Permission, Shareable, TableMemory};
use ember_syscall::types::{MemoryInfo, MemoryPermission, MemoryState};
use ember_syscall::{SvcError, SvcResult};
use log::debug;

use super::{caller, SvcRegisters};
use crate::kernel::Kernel;
use crate::object::process::AliasRegion;
use crate::sched::InterProcessorInterrupt;

const PAGE: u64 = PAGE_SIZE as u64;

/// Translate a page-table failure into the code user space sees.
pub fn map_error(err: MapError) -> SvcError {
    match err {
        MapError::NotAligned => SvcError::InvalidAddress,
        MapError::AlreadyMapped | MapError::OutOfRange => SvcError::InvalidMemoryRegion,
        MapError::NotMapped => SvcError::InvalidCurrentMemory,
        MapError::OutOfResource => SvcError::OutOfResource,
        MapError::InvalidAttributes => SvcError::InvalidNewMemoryPermission,
    }
}

fn check_alignment(addrs: &[u64], size: u64) -> SvcResult<()> {
    if addrs.iter().any(|a| a % PAGE != 0) {
        return Err(SvcError::InvalidAddress);
    }
    if size == 0 || size % PAGE != 0 {
        return Err(SvcError::InvalidSize);
    }
    Ok(())
}

fn in_user_space(addr: u64, size: u64) -> bool {
    addr.checked_add(size).is_some_and(|end| end <= USER_SPACE_END)
}

fn user_permission(perm: Permission) -> MemoryPermission {
    match perm {
        Permission::UserR => MemoryPermission::READ,
        Permission::UserRW => MemoryPermission::READ_WRITE,
        Permission::UserRX => MemoryPermission::READ_EXECUTE,
        _ => MemoryPermission::NONE,
    }
}

fn page_permission(perm: MemoryPermission) -> Option<Permission> {
    match perm {
        MemoryPermission::READ => Some(Permission::UserR),
        MemoryPermission::READ_WRITE => Some(Permission::UserRW),
        MemoryPermission::READ_EXECUTE => Some(Permission::UserRX),
        _ => None,
    }
}

fn user_template(perm: Permission, attr: PageAttribute) -> PageTableEntry {
    PageTableEntry::from_attributes(perm, attr, Shareable::InnerShareable, true, true)
}

/// Start of the leaf after the one containing `va`.
fn next_leaf(va: u64, block_size: usize) -> u64 {
    (va & !(block_size as u64 - 1)) + block_size as u64
}

/// Memory attribute shared by every page of `[addr, addr + size)`.
///
/// `None` if a page is unmapped or not user accessible, or the attributes
/// differ.
fn uniform_user_attribute(space: &AddressSpace, mem: &dyn TableMemory, addr: u64, size: u64) -> Option<PageAttribute> {
    let end = addr + size;
    let mut va = addr;
    let mut attr = None;
    while va < end {
        let m = space.query(mem, VirtAddr::new(va))?;
        if m.template.permission().map_or(MemoryPermission::NONE, user_permission) == MemoryPermission::NONE {
            return None;
        }
        let a = m.template.page_attribute()?;
        if attr.is_some_and(|prev| prev != a) {
            return None;
        }
        attr = Some(a);
        va = next_leaf(va, m.block_size);
    }
    attr
}

/// `SetMemoryPermission`: change the permission of mapped user memory.
///
/// # ABI
///
/// - x0: address (page aligned)
/// - x1: size (page aligned, non-zero)
/// - w2: new permission: R, RW or RX
///
/// Memory taking part in a `MapMemory` alias is locked and rejected with
/// `InvalidCurrentMemory`.
pub fn set_memory_permission<I: InterProcessorInterrupt>(
    kernel: &Kernel<I>,
    core: usize,
    regs: &SvcRegisters,
) -> SvcResult<()> {
    let (addr, size) = (regs.x[0], regs.x[1]);
    check_alignment(&[addr], size)?;
    if !in_user_space(addr, size) {
        return Err(SvcError::InvalidCurrentMemory);
    }
    let perm = MemoryPermission::from_raw(regs.w(2))
        .filter(|p| p.is_user_settable())
        .and_then(page_permission)
        .ok_or(SvcError::InvalidNewMemoryPermission)?;

    let guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let process = guard.objects.process(p);
    if process.aliases.iter().any(|a| a.touches(addr, size)) {
        return Err(SvcError::InvalidCurrentMemory);
    }
    let mut space = process.address_space().ok_or(SvcError::InvalidState)?;
    let pages = (size / PAGE) as usize;

    guard.with_page_tables(|mem| {
        let attr = uniform_user_attribute(&space, mem, addr, size).ok_or(SvcError::InvalidCurrentMemory)?;
        space
            .change_permissions(mem, VirtAddr::new(addr), pages, user_template(perm, attr))
            .map_err(map_error)
    })
}

/// A physically contiguous piece of the `MapMemory` source.
struct SourceRun {
    offset: u64,
    pa: PhysAddr,
    size: u64,
    attr: PageAttribute,
}

/// Split `[src, src + size)` into physically contiguous runs, requiring
/// every page to be mapped read-write.
fn collect_source(space: &AddressSpace, mem: &dyn TableMemory, src: u64, size: u64) -> SvcResult<Vec<SourceRun>> {
    let end = src + size;
    let mut runs: Vec<SourceRun> = Vec::new();
    let mut va = src;
    while va < end {
        let m = space.query(mem, VirtAddr::new(va)).ok_or(SvcError::InvalidCurrentMemory)?;
        if m.template.permission() != Some(Permission::UserRW) {
            return Err(SvcError::InvalidCurrentMemory);
        }
        let attr = m.template.page_attribute().ok_or(SvcError::InvalidCurrentMemory)?;
        let len = next_leaf(va, m.block_size).min(end) - va;

        match runs.last_mut() {
            Some(last) if last.attr == attr && last.pa.as_u64() + last.size == m.pa.as_u64() => last.size += len,
            _ => runs.push(SourceRun { offset: va - src, pa: m.pa, size: len, attr }),
        }
        va += len;
    }
    Ok(runs)
}

/// `MapMemory`: alias read-write memory at a second address.
///
/// # ABI
///
/// - x0: destination address, must be unmapped
/// - x1: source address, must be mapped read-write
/// - x2: size
///
/// The source stays mapped but is locked until `UnmapMemory`.
pub fn map_memory<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &SvcRegisters) -> SvcResult<()> {
    let (dst, src, size) = (regs.x[0], regs.x[1], regs.x[2]);
    check_alignment(&[dst, src], size)?;
    if !in_user_space(src, size) {
        return Err(SvcError::InvalidCurrentMemory);
    }
    if !in_user_space(dst, size) || (dst < src + size && src < dst + size) {
        return Err(SvcError::InvalidMemoryRegion);
    }

    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let process = guard.objects.process(p);
    if process.aliases.iter().any(|a| a.touches(src, size)) {
        return Err(SvcError::InvalidCurrentMemory);
    }
    if process.aliases.iter().any(|a| a.touches(dst, size)) {
        return Err(SvcError::InvalidMemoryRegion);
    }
    let mut space = process.address_space().ok_or(SvcError::InvalidState)?;

    guard.with_page_tables(|mem| {
        let runs = collect_source(&space, mem, src, size)?;
        for run in &runs {
            let template = user_template(Permission::UserRW, run.attr);
            let mapped = space.map_pages(
                mem,
                VirtAddr::new(dst + run.offset),
                run.pa,
                (run.size / PAGE) as usize,
                template,
            );
            if let Err(e) = mapped {
                if run.offset > 0 {
                    // Runs before this one were mapped by us
                    let _ = space.unmap_pages(mem, VirtAddr::new(dst), (run.offset / PAGE) as usize);
                }
                return Err(map_error(e));
            }
        }
        Ok(())
    })?;

    debug!("alias {dst:#x} -> {src:#x} ({size:#x} bytes)");
    guard.objects.process_mut(p).aliases.push(AliasRegion { dst, src, size });
    Ok(())
}

/// `UnmapMemory`: remove an alias made by `MapMemory`.
///
/// # ABI
///
/// - x0: destination address
/// - x1: source address
/// - x2: size
///
/// The triple must match the original `MapMemory` call exactly.
pub fn unmap_memory<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &SvcRegisters) -> SvcResult<()> {
    let (dst, src, size) = (regs.x[0], regs.x[1], regs.x[2]);
    check_alignment(&[dst, src], size)?;
    if !in_user_space(src, size) {
        return Err(SvcError::InvalidCurrentMemory);
    }
    if !in_user_space(dst, size) {
        return Err(SvcError::InvalidMemoryRegion);
    }

    let mut guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let process = guard.objects.process(p);
    let region = AliasRegion { dst, src, size };
    let index = process
        .aliases
        .iter()
        .position(|a| *a == region)
        .ok_or(SvcError::InvalidMemoryRegion)?;
    let mut space = process.address_space().ok_or(SvcError::InvalidState)?;

    guard
        .with_page_tables(|mem| space.unmap_pages(mem, VirtAddr::new(dst), (size / PAGE) as usize))
        .map_err(map_error)?;
    guard.objects.process_mut(p).aliases.swap_remove(index);
    Ok(())
}

/// Describe the region around `addr`.
///
/// Neighbouring pages with the same permission and state are reported as
/// one region, bounded by the enclosing 2MB block. A leaf larger than that
/// is reported whole.
fn query_info(space: &AddressSpace, mem: &dyn TableMemory, aliases: &[AliasRegion], addr: u64) -> MemoryInfo {
    let classify = |va: u64| match space.query(mem, VirtAddr::new(va)) {
        None => (MemoryPermission::NONE, MemoryState::Free, None),
        Some(m) => {
            let perm = m.template.permission().map_or(MemoryPermission::NONE, user_permission);
            let state = if aliases.iter().any(|a| (a.dst..a.dst + a.size).contains(&va)) {
                MemoryState::Alias
            } else {
                MemoryState::Normal
            };
            (perm, state, Some(m.block_size))
        }
    };

    let page = addr & !(PAGE - 1);
    let (permission, state, leaf) = classify(page);
    if let Some(block_size) = leaf.filter(|&bs| bs > L2_BLOCK_SIZE) {
        let base = page & !(block_size as u64 - 1);
        return MemoryInfo { base, size: block_size as u64, permission, state };
    }

    let block = L2_BLOCK_SIZE as u64;
    let lo = page & !(block - 1);
    let hi = lo + block;
    let same = |va: u64| {
        let (p, s, _) = classify(va);
        p == permission && s == state
    };

    let mut base = page;
    while base > lo && same(base - PAGE) {
        base -= PAGE;
    }
    let mut end = page + PAGE;
    while end < hi && same(end) {
        end += PAGE;
    }
    MemoryInfo { base, size: end - base, permission, state }
}

/// `QueryMemory`: describe the region containing an address.
///
/// # ABI
///
/// - x2: address
///
/// # Returns
///
/// x1 base, x2 size, w3 permission, w4 memory state.
pub fn query_memory<I: InterProcessorInterrupt>(kernel: &Kernel<I>, core: usize, regs: &mut SvcRegisters) -> SvcResult<()> {
    let addr = regs.x[2];
    if addr >= USER_SPACE_END {
        return Err(SvcError::InvalidCurrentMemory);
    }

    let guard = kernel.lock(core);
    let (p, _) = caller(&guard, core)?;
    let process = guard.objects.process(p);
    let space = process.address_space().ok_or(SvcError::InvalidState)?;
    let info = guard.with_page_tables(|mem| query_info(&space, mem, &process.aliases, addr));

    regs.x[1] = info.base;
    regs.x[2] = info.size;
    regs.x[3] = u64::from(info.permission.raw());
    regs.x[4] = info.state as u64;
    Ok(())
}
