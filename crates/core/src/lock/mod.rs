//! Logical locks on key fingerprints.
//!
//! A logical lock is an in-memory lock applied to a primary-key
//! fingerprint by the partition that owns the key's range. It replaces
//! the storage engine's row locks for partition-routed work: because a
//! single worker thread mutates all the locks of a partition, no latch
//! protects the lock itself.
//!
//! The lock keeps a vector of owners and a FIFO of waiters. Waiters are
//! admitted strictly in arrival order: a shared request that is
//! compatible with the current owners still queues behind an earlier
//! exclusive waiter, otherwise writers starve and the first-in-first-out
//! execution guarantee between conflicting transactions breaks.

use std::collections::VecDeque;

use smallvec::SmallVec;
use thiserror::Error;

use crate::Tid;

#[cfg(test)]
mod tests;

/// Lock mode of a request, an owner, or a whole lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
	/// No lock. Compatible with everything.
	#[default]
	NoLock,
	/// Shared access. Compatible with other shared holders.
	Shared,
	/// Exclusive access. Compatible with nothing.
	Exclusive,
}

impl LockMode {
	/// Compatibility under the mode matrix.
	pub fn compatible_with(self, other: LockMode) -> bool {
		match (self, other) {
			(LockMode::NoLock, _) | (_, LockMode::NoLock) => true,
			(LockMode::Shared, LockMode::Shared) => true,
			_ => false,
		}
	}
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
	/// The requester is now (or already was) an owner.
	Granted,
	/// The requester was appended to the waiter FIFO.
	Enqueued,
}

/// Errors surfaced by lock operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
	/// An owner requested a stronger mode while co-owners exist.
	///
	/// The upgrade path for non-sole owners has no defined semantics;
	/// callers must treat this as a precondition violation. The lock
	/// state is left untouched.
	#[error("transaction {tid} requested an incompatible upgrade while co-owners hold the lock")]
	IncompatibleUpgrade { tid: Tid },
}

#[derive(Debug, Clone, Copy)]
struct Owner {
	tid: Tid,
	mode: LockMode,
}

#[derive(Debug)]
struct Waiter<T> {
	tid: Tid,
	mode: LockMode,
	ticket: T,
}

/// Per-key lock state: mode, owner vector, waiter FIFO.
///
/// Generic over the waiter ticket `T`, the payload a caller gets back
/// when a waiter is promoted (the runtime threads its action handle
/// through here).
#[derive(Debug)]
pub struct LogicalLock<T> {
	mode: LockMode,
	owners: SmallVec<[Owner; 2]>,
	waiters: VecDeque<Waiter<T>>,
}

impl<T> Default for LogicalLock<T> {
	fn default() -> Self {
		Self {
			mode: LockMode::NoLock,
			owners: SmallVec::new(),
			waiters: VecDeque::new(),
		}
	}
}

impl<T> LogicalLock<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mode(&self) -> LockMode {
		self.mode
	}

	pub fn has_owners(&self) -> bool {
		!self.owners.is_empty()
	}

	pub fn has_waiters(&self) -> bool {
		!self.waiters.is_empty()
	}

	pub fn owner_count(&self) -> usize {
		self.owners.len()
	}

	pub fn waiter_count(&self) -> usize {
		self.waiters.len()
	}

	pub fn is_owner(&self, tid: Tid) -> bool {
		self.owners.iter().any(|o| o.tid == tid)
	}

	/// True when the lock has no owners, no waiters, and no mode.
	pub fn is_clean(&self) -> bool {
		self.owners.is_empty() && self.waiters.is_empty() && self.mode == LockMode::NoLock
	}

	/// Acquires the lock on behalf of `tid`, or enqueues the ticket.
	///
	/// Re-acquiring at an equal or weaker mode is an idempotent no-op.
	/// A sole owner may upgrade in place. An incompatible request, or a
	/// request incompatible with any already-queued waiter, joins the
	/// tail of the waiter FIFO.
	pub fn acquire(&mut self, tid: Tid, mode: LockMode, ticket: T) -> Result<Acquire, LockError> {
		if self.is_owner(tid) {
			if mode <= self.mode {
				return Ok(Acquire::Granted);
			}
			if self.owners.len() == 1 {
				self.owners[0].mode = mode;
				self.mode = mode;
				return Ok(Acquire::Granted);
			}
			return Err(LockError::IncompatibleUpgrade { tid });
		}

		// Incompatible with the current holders: wait.
		if !self.mode.compatible_with(mode) {
			debug_assert!(!self.owners.is_empty());
			self.waiters.push_back(Waiter { tid, mode, ticket });
			return Ok(Acquire::Enqueued);
		}

		// Compatible with the holders, but queue-jumping a conflicting
		// waiter would break FIFO ordering and starve writers. Scan from
		// the head: every waiter compatible with the holders has already
		// been promoted, so any conflict forces us to the tail.
		if self.waiters.iter().any(|w| !w.mode.compatible_with(mode)) {
			self.waiters.push_back(Waiter { tid, mode, ticket });
			return Ok(Acquire::Enqueued);
		}

		self.owners.push(Owner { tid, mode });
		if mode > self.mode {
			self.mode = mode;
		}
		Ok(Acquire::Granted)
	}

	/// Releases `tid`'s hold and promotes newly-compatible waiters.
	///
	/// Promoted tickets are appended to `promoted` in FIFO order; the
	/// count of promotions is returned.
	///
	/// # Panics
	///
	/// Panics if `tid` is not an owner: releasing a lock that was never
	/// granted is a programming error.
	pub fn release(&mut self, tid: Tid, promoted: &mut Vec<T>) -> usize {
		let slot = self
			.owners
			.iter()
			.position(|o| o.tid == tid)
			.unwrap_or_else(|| panic!("transaction {tid} released a lock it does not own"));
		self.owners.remove(slot);

		if !self.recompute_mode() {
			return 0;
		}

		let mut count = 0;
		while self.head_can_acquire() {
			let Some(head) = self.waiters.pop_front() else {
				break;
			};
			self.owners.push(Owner {
				tid: head.tid,
				mode: head.mode,
			});
			promoted.push(head.ticket);
			count += 1;
			self.recompute_mode();
		}
		count
	}

	/// Removes `tid` from the waiter FIFO, returning its ticket.
	///
	/// Removing the head can expose a run of now-compatible waiters;
	/// those are promoted into owners and appended to `promoted`.
	pub fn remove_waiter(&mut self, tid: Tid, promoted: &mut Vec<T>) -> Option<T> {
		let pos = self.waiters.iter().position(|w| w.tid == tid)?;
		let removed = self.waiters.remove(pos)?;
		while self.head_can_acquire() {
			let Some(head) = self.waiters.pop_front() else {
				break;
			};
			self.owners.push(Owner {
				tid: head.tid,
				mode: head.mode,
			});
			promoted.push(head.ticket);
			self.recompute_mode();
		}
		Some(removed.ticket)
	}

	/// Drains owners and waiters and resets the mode.
	///
	/// Used when a partition abandons its lock table: every collected
	/// transaction must be aborted by the caller, and every waiter
	/// ticket belongs to an action that will never be promoted.
	pub fn abort_and_collect(&mut self, tids: &mut Vec<Tid>, tickets: &mut Vec<T>) {
		tids.extend(self.owners.drain(..).map(|o| o.tid));
		for waiter in self.waiters.drain(..) {
			tids.push(waiter.tid);
			tickets.push(waiter.ticket);
		}
		self.mode = LockMode::NoLock;
	}

	fn head_can_acquire(&self) -> bool {
		match self.waiters.front() {
			Some(head) => self.mode.compatible_with(head.mode),
			None => false,
		}
	}

	/// Recomputes the lock mode from the remaining owners.
	///
	/// Returns true when the mode changed.
	fn recompute_mode(&mut self) -> bool {
		let new_mode = self
			.owners
			.iter()
			.map(|o| o.mode)
			.max()
			.unwrap_or(LockMode::NoLock);
		debug_assert!(
			self.owners
				.iter()
				.all(|a| self.owners.iter().all(|b| a.tid == b.tid || a.mode.compatible_with(b.mode))),
			"owners hold incompatible modes"
		);
		let changed = self.mode != new_mode;
		self.mode = new_mode;
		changed
	}
}
