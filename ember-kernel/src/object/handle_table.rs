//! Per-process handle table
//!
//! A fixed array of entries threaded into a free list. Each allocation takes
//! the next linear id (1..=0x7FFF, wrapping), which goes into the handle
//! next to the entry index so a stale handle never resolves to the slot's
//! new occupant.

use alloc::boxed::Box;
use alloc::vec::Vec;

use ember_syscall::{Handle, SvcError, SvcResult};

/// Largest table a process may ask for.
pub const MAX_HANDLE_TABLE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy)]
enum Entry<T> {
    Free { next: Option<u16> },
    /// Allocated by [`HandleTable::reserve`], not yet filled in
    Reserved { linear_id: u16 },
    Used { linear_id: u16, object: T },
}

/// Maps handles to objects of type `T`.
#[derive(Debug)]
pub struct HandleTable<T: Copy> {
    entries: Box<[Entry<T>]>,
    free_head: Option<u16>,
    next_linear_id: u16,
    count: usize,
    peak_count: usize,
}

impl<T: Copy> HandleTable<T> {
    /// A table with `size` entries; 0 means the maximum.
    pub fn new(size: usize) -> SvcResult<Self> {
        if size > MAX_HANDLE_TABLE_SIZE {
            return Err(SvcError::InvalidSize);
        }
        let size = if size == 0 { MAX_HANDLE_TABLE_SIZE } else { size };

        let entries: Vec<Entry<T>> = (0..size)
            .map(|i| Entry::Free {
                next: if i + 1 < size { Some(i as u16 + 1) } else { None },
            })
            .collect();

        Ok(Self {
            entries: entries.into_boxed_slice(),
            free_head: Some(0),
            next_linear_id: Handle::MIN_LINEAR_ID,
            count: 0,
            peak_count: 0,
        })
    }

    #[must_use]
    pub fn table_size(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Highest number of entries ever in use at once.
    #[must_use]
    pub fn peak_count(&self) -> usize {
        self.peak_count
    }

    fn allocate_linear_id(&mut self) -> u16 {
        let id = self.next_linear_id;
        self.next_linear_id = if id >= Handle::MAX_LINEAR_ID {
            Handle::MIN_LINEAR_ID
        } else {
            id + 1
        };
        id
    }

    fn allocate_entry(&mut self) -> SvcResult<u16> {
        let index = self.free_head.ok_or(SvcError::OutOfHandles)?;
        let Entry::Free { next } = self.entries[index as usize] else {
            panic!("handle free list points at a live entry {index}");
        };
        self.free_head = next;
        self.count += 1;
        self.peak_count = self.peak_count.max(self.count);
        Ok(index)
    }

    fn free_entry(&mut self, index: u16) {
        debug_assert!(self.count > 0);
        self.entries[index as usize] = Entry::Free { next: self.free_head };
        self.free_head = Some(index);
        self.count -= 1;
    }

    /// Index of the entry `handle` names, if its fields are well formed and
    /// its linear id matches a non-free entry.
    fn find(&self, handle: Handle) -> Option<usize> {
        if handle.is_invalid() || handle.reserved() != 0 || handle.linear_id() == 0 {
            return None;
        }
        let index = handle.index() as usize;
        let linear_id = match self.entries.get(index)? {
            Entry::Free { .. } => return None,
            Entry::Reserved { linear_id } | Entry::Used { linear_id, .. } => *linear_id,
        };
        (linear_id == handle.linear_id()).then_some(index)
    }

    /// Store `object` and return its handle.
    pub fn add(&mut self, object: T) -> SvcResult<Handle> {
        let index = self.allocate_entry()?;
        let linear_id = self.allocate_linear_id();
        self.entries[index as usize] = Entry::Used { linear_id, object };
        Ok(Handle::new(index, linear_id))
    }

    /// Allocate a handle that [`register`](Self::register) fills in later.
    pub fn reserve(&mut self) -> SvcResult<Handle> {
        let index = self.allocate_entry()?;
        let linear_id = self.allocate_linear_id();
        self.entries[index as usize] = Entry::Reserved { linear_id };
        Ok(Handle::new(index, linear_id))
    }

    /// Fill in a reserved handle.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is not currently reserved.
    pub fn register(&mut self, handle: Handle, object: T) {
        let index = self.find(handle).unwrap_or_else(|| panic!("register of unknown {handle:?}"));
        let Entry::Reserved { linear_id } = self.entries[index] else {
            panic!("register of non-reserved {handle:?}");
        };
        self.entries[index] = Entry::Used { linear_id, object };
    }

    /// Release a reserved handle that was never registered.
    pub fn unreserve(&mut self, handle: Handle) {
        if let Some(index) = self.find(handle) {
            if matches!(self.entries[index], Entry::Reserved { .. }) {
                self.free_entry(index as u16);
            }
        }
    }

    /// Remove `handle`, returning the object it held.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let index = self.find(handle)?;
        let Entry::Used { object, .. } = self.entries[index] else {
            return None;
        };
        self.free_entry(index as u16);
        Some(object)
    }

    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<T> {
        match self.entries[self.find(handle)?] {
            Entry::Used { object, .. } => Some(object),
            _ => None,
        }
    }

    /// Empty the table, returning every object it held.
    pub fn drain(&mut self) -> Vec<T> {
        let mut objects = Vec::with_capacity(self.count);
        for index in 0..self.entries.len() {
            match self.entries[index] {
                Entry::Used { object, .. } => {
                    objects.push(object);
                    self.free_entry(index as u16);
                }
                Entry::Reserved { .. } => self.free_entry(index as u16),
                Entry::Free { .. } => {}
            }
        }
        objects
    }
}
