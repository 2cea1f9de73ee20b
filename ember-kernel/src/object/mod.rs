//! Kernel Objects
//!
//! Threads and processes live in arenas owned by the [`ObjectStore`].
//! Everything else names them through the typed references below, which are
//! plain arena ids: cheap to copy, and stale once the object is gone.
//!
//! # Reference Counting
//!
//! Every object carries a count of the references that keep it alive:
//! handle table entries, the owner link from each thread to its process,
//! and the "running" reference a started thread or process holds until it
//! terminates. When the count drops to zero the object is finalized and its
//! arena slot freed.

use core::fmt;

use ember_intrusive::NodeId;

pub mod handle_table;
pub mod process;
pub mod store;
pub mod thread;

pub use handle_table::{HandleTable, MAX_HANDLE_TABLE_SIZE};
pub use process::{Process, ProcessParams};
pub use store::ObjectStore;
pub use thread::{SuspendType, Thread, ThreadParams, ThreadState};

/// Reference to a [`Thread`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef(pub(crate) NodeId);

/// Reference to a [`Process`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessRef(pub(crate) NodeId);

impl ThreadRef {
    #[inline]
    #[must_use]
    pub const fn node(self) -> NodeId {
        self.0
    }
}

impl ProcessRef {
    #[inline]
    #[must_use]
    pub const fn node(self) -> NodeId {
        self.0
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({}v{})", self.0.index(), self.0.generation())
    }
}

impl fmt::Debug for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({}v{})", self.0.index(), self.0.generation())
    }
}

/// Object types a handle can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Thread,
    Process,
}

impl ObjectType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Process => "process",
        }
    }
}

/// Any kernel object; what a handle table stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectRef {
    Thread(ThreadRef),
    Process(ProcessRef),
}

impl ObjectRef {
    #[must_use]
    pub const fn object_type(self) -> ObjectType {
        match self {
            Self::Thread(_) => ObjectType::Thread,
            Self::Process(_) => ObjectType::Process,
        }
    }
}

impl From<ThreadRef> for ObjectRef {
    fn from(thread: ThreadRef) -> Self {
        Self::Thread(thread)
    }
}

impl From<ProcessRef> for ObjectRef {
    fn from(process: ProcessRef) -> Self {
        Self::Process(process)
    }
}

/// Typed access to objects behind handles.
pub trait KernelObject {
    type Ref: Copy + Into<ObjectRef>;

    const TYPE: ObjectType;

    /// `Some` if `obj` is of this type.
    fn downcast(obj: ObjectRef) -> Option<Self::Ref>;
}

impl KernelObject for Thread {
    type Ref = ThreadRef;

    const TYPE: ObjectType = ObjectType::Thread;

    fn downcast(obj: ObjectRef) -> Option<ThreadRef> {
        match obj {
            ObjectRef::Thread(t) => Some(t),
            ObjectRef::Process(_) => None,
        }
    }
}

impl KernelObject for Process {
    type Ref = ProcessRef;

    const TYPE: ObjectType = ObjectType::Process;

    fn downcast(obj: ObjectRef) -> Option<ProcessRef> {
        match obj {
            ObjectRef::Process(p) => Some(p),
            ObjectRef::Thread(_) => None,
        }
    }
}
