//! Core data structures for the tessera execution engine.
//!
//! This crate is deliberately free of threads and I/O. It provides the
//! building blocks that a partition worker mutates single-threadedly:
//!
//! * [`Key`] — a variable-width primary-key fingerprint used as the
//!   lock granularity and the routing granularity.
//! * [`LogicalLock`] — per-key lock state (mode, owners, waiter FIFO),
//!   distinct from any storage-engine row or page lock.
//! * [`KeyLockMap`] — the key → lock map owned by exactly one partition.
//! * [`RangeMap`] — the sorted boundary map routing keys to partitions.

use std::fmt;

mod key;
mod lock;
mod lock_map;
mod ranges;

pub use key::{Key, KeyError, KeyField, MAX_KEY_WIDTH};
pub use lock::{Acquire, LockError, LockMode, LogicalLock};
pub use lock_map::KeyLockMap;
pub use ranges::{PartitionId, RangeAssignment, RangeError, RangeMap};

/// Transaction identifier handed out by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}
