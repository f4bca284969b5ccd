//! The key → logical-lock map of one partition.
//!
//! Exactly one partition owns a map, and only that partition's worker
//! thread mutates it, so there is no interior locking. Entries are
//! created lazily on first acquire and stay in the map for locality;
//! the map only shrinks wholesale, when the partition resets it.

use rustc_hash::FxHashMap;

use crate::key::Key;
use crate::lock::{Acquire, LockError, LockMode, LogicalLock};
use crate::Tid;

/// Map from key fingerprint to logical lock.
#[derive(Debug)]
pub struct KeyLockMap<T> {
	locks: FxHashMap<Key, LogicalLock<T>>,
}

impl<T> Default for KeyLockMap<T> {
	fn default() -> Self {
		Self {
			locks: FxHashMap::default(),
		}
	}
}

impl<T> KeyLockMap<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Acquires `key` in `mode` for `tid`, creating the lock if the key
	/// was never touched.
	pub fn acquire(&mut self, key: &Key, tid: Tid, mode: LockMode, ticket: T) -> Result<Acquire, LockError> {
		self.locks.entry(key.clone()).or_default().acquire(tid, mode, ticket)
	}

	/// Releases `tid`'s hold on `key`, appending promoted tickets.
	///
	/// # Panics
	///
	/// Panics if the key was never locked or `tid` does not own it;
	/// both are programming errors in the caller.
	pub fn release(&mut self, key: &Key, tid: Tid, promoted: &mut Vec<T>) -> usize {
		let lock = self
			.locks
			.get_mut(key)
			.unwrap_or_else(|| panic!("transaction {tid} released untouched key {key}"));
		lock.release(tid, promoted)
	}

	/// Removes `tid` from `key`'s waiter FIFO, if both exist. Waiters
	/// promoted by the removal are appended to `promoted`.
	pub fn remove_waiter(&mut self, key: &Key, tid: Tid, promoted: &mut Vec<T>) -> Option<T> {
		self.locks.get_mut(key)?.remove_waiter(tid, promoted)
	}

	/// Number of distinct keys ever locked since the last reset.
	pub fn keys_touched(&self) -> usize {
		self.locks.len()
	}

	/// True when every lock is free of owners and waiters.
	pub fn is_clean(&self) -> bool {
		self.locks.values().all(LogicalLock::is_clean)
	}

	/// Collects the transactions and waiter tickets of every dirty lock
	/// and resets those locks. Returns the number of dirty locks found.
	///
	/// Called at the new-run barrier: a dirty lock at that point means
	/// the collected transactions must be aborted before work resumes.
	pub fn collect_dirty(&mut self, tids: &mut Vec<Tid>, tickets: &mut Vec<T>) -> usize {
		let mut dirty = 0;
		for lock in self.locks.values_mut() {
			if !lock.is_clean() {
				dirty += 1;
				lock.abort_and_collect(tids, tickets);
			}
		}
		dirty
	}

	/// Drops every entry, collecting the transactions that held or
	/// awaited any lock along with the abandoned waiter tickets.
	pub fn reset(&mut self) -> (Vec<Tid>, Vec<T>) {
		let mut tids = Vec::new();
		let mut tickets = Vec::new();
		for lock in self.locks.values_mut() {
			lock.abort_and_collect(&mut tids, &mut tickets);
		}
		self.locks.clear();
		(tids, tickets)
	}
}
