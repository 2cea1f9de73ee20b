//! Object registries
//!
//! The [`ObjectStore`] owns the thread and process arenas, the id-ordered
//! registries used to look objects up by id, and the reference counts that
//! decide when an object is finalized.

use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;

use ember_intrusive::{Arena, RbLink, RbTree, TreeAdapter};
use ember_paging::AddressSpace;
use ember_syscall::{Handle, SvcError, SvcResult};
use log::{debug, trace};

use super::process::{Process, ProcessParams};
use super::thread::{Thread, ThreadParams};
use super::{KernelObject, ObjectRef, ProcessRef, ThreadRef};

// -- Id registries

#[derive(Debug, Default)]
pub struct ThreadIdAdapter;

impl TreeAdapter for ThreadIdAdapter {
    type Value = Thread;
    type Key = u64;

    fn link<'a>(&self, value: &'a Thread) -> &'a RbLink {
        &value.id_link
    }

    fn link_mut<'a>(&self, value: &'a mut Thread) -> &'a mut RbLink {
        &mut value.id_link
    }

    fn compare(&self, a: &Thread, b: &Thread) -> Ordering {
        a.id.cmp(&b.id)
    }

    fn compare_key(&self, key: &u64, value: &Thread) -> Ordering {
        key.cmp(&value.id)
    }
}

#[derive(Debug, Default)]
pub struct ProcessIdAdapter;

impl TreeAdapter for ProcessIdAdapter {
    type Value = Process;
    type Key = u64;

    fn link<'a>(&self, value: &'a Process) -> &'a RbLink {
        &value.id_link
    }

    fn link_mut<'a>(&self, value: &'a mut Process) -> &'a mut RbLink {
        &mut value.id_link
    }

    fn compare(&self, a: &Process, b: &Process) -> Ordering {
        a.id.cmp(&b.id)
    }

    fn compare_key(&self, key: &u64, value: &Process) -> Ordering {
        key.cmp(&value.id)
    }
}

/// Arenas, registries and reference counts of all kernel objects.
pub struct ObjectStore {
    pub(crate) threads: Arena<Thread>,
    pub(crate) processes: Arena<Process>,
    thread_ids: RbTree<ThreadIdAdapter>,
    process_ids: RbTree<ProcessIdAdapter>,
    next_id: u64,
    /// Address spaces of finalized processes, torn down once the page-table
    /// lock can be taken
    pub(crate) dead_address_spaces: Vec<AddressSpace>,
}

impl ObjectStore {
    #[must_use]
    pub fn new(max_threads: usize, max_processes: usize) -> Self {
        Self {
            threads: Arena::with_capacity(max_threads),
            processes: Arena::with_capacity(max_processes),
            thread_ids: RbTree::new(ThreadIdAdapter),
            process_ids: RbTree::new(ProcessIdAdapter),
            next_id: 1,
            dead_address_spaces: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // -- Accessors

    /// # Panics
    ///
    /// Panics if `t` is stale.
    #[must_use]
    pub fn thread(&self, t: ThreadRef) -> &Thread {
        &self.threads[t.0]
    }

    pub fn thread_mut(&mut self, t: ThreadRef) -> &mut Thread {
        &mut self.threads[t.0]
    }

    /// # Panics
    ///
    /// Panics if `p` is stale.
    #[must_use]
    pub fn process(&self, p: ProcessRef) -> &Process {
        &self.processes[p.0]
    }

    pub fn process_mut(&mut self, p: ProcessRef) -> &mut Process {
        &mut self.processes[p.0]
    }

    #[must_use]
    pub fn contains_thread(&self, t: ThreadRef) -> bool {
        self.threads.contains(t.0)
    }

    #[must_use]
    pub fn contains_process(&self, p: ProcessRef) -> bool {
        self.processes.contains(p.0)
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    // -- Creation

    /// Create a process holding one reference, owned by the caller.
    pub fn create_process(
        &mut self,
        params: &ProcessParams,
        handle_table_size: usize,
        address_space: Option<AddressSpace>,
    ) -> SvcResult<ProcessRef> {
        let id = self.next_id;
        let process = Process::new(id, params, handle_table_size, address_space)?;
        let node = self.processes.insert(process).map_err(|_| SvcError::OutOfResource)?;
        self.allocate_id();

        if self.process_ids.insert(&mut self.processes, node).is_err() {
            panic!("duplicate process id {id}");
        }
        debug!("process {id} created");
        Ok(ProcessRef(node))
    }

    /// Create a thread in `owner`, holding one reference owned by the caller.
    pub fn create_thread(&mut self, owner: ProcessRef, params: &ThreadParams) -> SvcResult<ThreadRef> {
        let id = self.next_id;
        let node = self
            .threads
            .insert(Thread::new(id, owner, params))
            .map_err(|_| SvcError::OutOfResource)?;
        self.allocate_id();

        if self.thread_ids.insert(&mut self.threads, node).is_err() {
            panic!("duplicate thread id {id}");
        }
        self.processes[owner.0].threads.push_back(&mut self.threads, node);
        self.open(ObjectRef::Process(owner));

        debug!("thread {id} created in process {}", self.processes[owner.0].id);
        Ok(ThreadRef(node))
    }

    // -- Lookup

    #[must_use]
    pub fn get_process_from_id(&self, pid: u64) -> Option<ProcessRef> {
        self.process_ids.find_key(&self.processes, &pid).map(ProcessRef)
    }

    #[must_use]
    pub fn get_thread_from_id(&self, tid: u64) -> Option<ThreadRef> {
        self.thread_ids.find_key(&self.threads, &tid).map(ThreadRef)
    }

    /// Resolve `handle` in `process` to an object of type `T`.
    ///
    /// The current-thread and current-process pseudo-handles resolve
    /// without touching the table.
    #[must_use]
    pub fn get_object_from_handle<T: KernelObject>(
        &self,
        process: ProcessRef,
        current_thread: Option<ThreadRef>,
        handle: Handle,
    ) -> Option<T::Ref> {
        let obj = match handle {
            Handle::CURRENT_THREAD => ObjectRef::Thread(current_thread?),
            Handle::CURRENT_PROCESS => ObjectRef::Process(process),
            _ => self.processes.get(process.0)?.handle_table.get(handle)?,
        };
        let typed = T::downcast(obj);
        if typed.is_none() {
            trace!(
                "handle {:#x}: wanted {}, found {}",
                handle.raw(),
                T::TYPE.name(),
                obj.object_type().name()
            );
        }
        typed
    }

    /// Process ids in ascending order.
    pub fn process_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.process_ids.iter(&self.processes).map(|n| self.processes[n].id)
    }

    /// Ids of every thread, ascending.
    pub fn all_thread_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.thread_ids.iter(&self.threads).map(|n| self.threads[n].id)
    }

    /// Ids of the threads of `process`, in creation order.
    pub fn thread_ids(&self, process: ProcessRef) -> impl Iterator<Item = u64> + '_ {
        self.processes[process.0]
            .threads
            .iter(&self.threads)
            .map(|n| self.threads[n].id)
    }

    /// Threads of `process`, in creation order.
    #[must_use]
    pub fn threads_of(&self, process: ProcessRef) -> Vec<ThreadRef> {
        self.processes[process.0]
            .threads
            .iter(&self.threads)
            .map(ThreadRef)
            .collect()
    }

    // -- Handles

    /// Put `obj` into `process`'s handle table, opening a reference.
    pub fn add(&mut self, process: ProcessRef, obj: impl Into<ObjectRef>) -> SvcResult<Handle> {
        let obj = obj.into();
        let handle = self.processes[process.0].handle_table.add(obj)?;
        self.open(obj);
        Ok(handle)
    }

    /// Remove `handle` from `process`'s table and drop its reference.
    pub fn close_handle(&mut self, process: ProcessRef, handle: Handle) -> SvcResult<()> {
        let obj = self.processes[process.0]
            .handle_table
            .remove(handle)
            .ok_or(SvcError::InvalidHandle)?;
        trace!("close {} handle {:#x}", obj.object_type().name(), handle.raw());
        self.close(obj);
        Ok(())
    }

    // -- Reference counting

    fn ref_count_mut(&mut self, obj: ObjectRef) -> &mut u32 {
        match obj {
            ObjectRef::Thread(t) => &mut self.threads[t.0].ref_count,
            ObjectRef::Process(p) => &mut self.processes[p.0].ref_count,
        }
    }

    #[must_use]
    pub fn ref_count(&self, obj: ObjectRef) -> u32 {
        match obj {
            ObjectRef::Thread(t) => self.threads[t.0].ref_count,
            ObjectRef::Process(p) => self.processes[p.0].ref_count,
        }
    }

    pub fn open(&mut self, obj: ObjectRef) {
        let count = self.ref_count_mut(obj);
        assert!(*count > 0, "open of dead object {obj:?}");
        assert!(*count < u32::MAX, "reference count overflow on {obj:?}");
        *count += 1;
    }

    /// Drop one reference, finalizing whatever reaches zero.
    pub fn close(&mut self, obj: ObjectRef) {
        let mut pending = vec![obj];
        while let Some(obj) = pending.pop() {
            let count = self.ref_count_mut(obj);
            assert!(*count > 0, "close of {obj:?} without a reference");
            *count -= 1;
            if *count == 0 {
                match obj {
                    ObjectRef::Thread(t) => self.finalize_thread(t, &mut pending),
                    ObjectRef::Process(p) => self.finalize_process(p, &mut pending),
                }
            }
        }
    }

    fn finalize_thread(&mut self, t: ThreadRef, pending: &mut Vec<ObjectRef>) {
        let thread = &self.threads[t.0];
        assert!(
            !thread.queue_links.iter().any(|l| l.is_linked()) && !thread.sleep_link.is_linked(),
            "finalizing thread {} while it is scheduled",
            thread.id
        );
        let (id, owner) = (thread.id, thread.owner);

        self.thread_ids.erase(&mut self.threads, t.0);
        self.processes[owner.0].threads.erase(&mut self.threads, t.0);
        self.threads.remove(t.0);
        debug!("thread {id} destroyed");

        pending.push(ObjectRef::Process(owner));
    }

    fn finalize_process(&mut self, p: ProcessRef, pending: &mut Vec<ObjectRef>) {
        let process = &mut self.processes[p.0];
        assert!(process.threads.is_empty(), "finalizing process {} with live threads", process.id);
        let id = process.id;

        pending.extend(process.handle_table.drain());
        if let Some(space) = process.address_space.take() {
            self.dead_address_spaces.push(space);
        }

        self.process_ids.erase(&mut self.processes, p.0);
        self.processes.remove(p.0);
        debug!("process {id} destroyed");
    }
}
