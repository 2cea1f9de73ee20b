//! # ember-intrusive
//!
//! Intrusive containers for kernel object tables.
//!
//! Kernel objects carry their own link fields ([`ListLink`], [`RbLink`]) and
//! live in a fixed-capacity [`Arena`]. Containers never allocate: inserting
//! or removing an object only rewires the links stored inside it. An object
//! may be a member of several containers at once by embedding one link per
//! membership and selecting it through an adapter.
//!
//! - [`arena`]: Generation-checked slab handing out [`NodeId`]s
//! - [`list`]: Doubly-linked list with O(1) splice
//! - [`rbtree`]: Red-black tree ordered by an adapter-supplied comparator
//!
//! # Concurrency
//!
//! Nothing here is thread-safe. The kernel keeps every container behind its
//! global scheduler lock.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arena;
pub mod list;
pub mod rbtree;

pub use arena::{Arena, NodeId};
pub use list::{List, ListAdapter, ListLink};
pub use rbtree::{Color, RbLink, RbTree, RbViolation, TreeAdapter};
