//! The partition lock manager: action-level operations over the
//! key → lock map.
//!
//! `acquire_all` keeps attempting the remaining requests after one of
//! them enqueues; a single contended key must not block the rest of the
//! action's lock set from being claimed, or a released waiter could
//! find its remaining keys stolen by later arrivals.

use std::sync::Arc;

use tessera_core::{Acquire, Key, KeyLockMap, Tid};

use crate::action::Action;
use crate::error::ExecError;

/// Lock manager of one partition. Single-threaded by construction:
/// only the partition's worker calls into it.
#[derive(Debug, Default)]
pub(crate) struct PartitionLocks {
	map: KeyLockMap<Arc<Action>>,
}

impl PartitionLocks {
	pub fn new() -> Self {
		Self::default()
	}

	/// Acquires every key lock the action requests.
	///
	/// Returns `Ok(true)` when all were granted; `Ok(false)` leaves the
	/// action parked in one or more waiter FIFOs, to be handed back
	/// once promotions bring its missing-key count to zero.
	pub fn acquire_all(&mut self, action: &Arc<Action>) -> Result<bool, ExecError> {
		let tid = action.tid();
		let map = &mut self.map;
		let mut granted = 0usize;
		action.with_state(|state| {
			debug_assert!(state.keys_set, "acquire before the key hook ran");
			for request in state.requests.iter_mut() {
				if request.granted {
					continue;
				}
				match map.acquire(&request.key, tid, request.mode, Arc::clone(action))? {
					Acquire::Granted => {
						request.granted = true;
						granted += 1;
					}
					Acquire::Enqueued => {
						tracing::trace!(%tid, key = %request.key, "locks.enqueued");
					}
				}
			}
			Ok::<(), ExecError>(())
		})?;
		Ok(action.got_keys(granted))
	}

	/// Releases every granted key of the action, collecting promoted
	/// actions that became fully granted into `ready`.
	pub fn release_all(&mut self, action: &Arc<Action>, ready: &mut Vec<Arc<Action>>) {
		let tid = action.tid();
		let map = &mut self.map;
		action.with_state(|state| {
			for request in state.requests.iter_mut() {
				if !request.granted {
					continue;
				}
				let mut promoted = Vec::new();
				map.release(&request.key, tid, &mut promoted);
				request.granted = false;
				credit_promotions(&request.key, promoted, ready);
			}
		});
	}

	/// Backs a failed action fully out of the lock table: granted keys
	/// are released, pending requests are pulled from their waiter
	/// FIFOs. Promotions exposed by either step land in `ready`.
	pub fn abandon(&mut self, action: &Arc<Action>, ready: &mut Vec<Arc<Action>>) {
		let tid = action.tid();
		let map = &mut self.map;
		action.with_state(|state| {
			for request in state.requests.iter_mut() {
				let mut promoted = Vec::new();
				if request.granted {
					map.release(&request.key, tid, &mut promoted);
					request.granted = false;
				} else if map.remove_waiter(&request.key, tid, &mut promoted).is_none() {
					continue;
				}
				credit_promotions(&request.key, promoted, ready);
			}
		});
	}

	/// Collects and resets dirty locks at the new-run barrier.
	pub fn clean_all(&mut self, tids: &mut Vec<Tid>, tickets: &mut Vec<Arc<Action>>) -> usize {
		self.map.collect_dirty(tids, tickets)
	}

	/// Drops the whole map, returning the transactions and abandoned
	/// waiter tickets it still referenced.
	pub fn reset(&mut self) -> (Vec<Tid>, Vec<Arc<Action>>) {
		self.map.reset()
	}

	pub fn keys_touched(&self) -> usize {
		self.map.keys_touched()
	}

	pub fn is_clean(&self) -> bool {
		self.map.is_clean()
	}
}

/// Credits each promoted waiter with ownership of `key`; actions whose
/// missing-key count reached zero are appended to `ready`.
fn credit_promotions(key: &Key, promoted: Vec<Arc<Action>>, ready: &mut Vec<Arc<Action>>) {
	for waiter in promoted {
		let ready_now = waiter.with_state(|state| {
			if let Some(theirs) = state.requests.iter_mut().find(|r| r.key == *key && !r.granted) {
				theirs.granted = true;
			}
			state.keys_needed = state.keys_needed.saturating_sub(1);
			state.keys_needed == 0
		});
		if ready_now {
			tracing::trace!(key = %key, ready = %waiter.tid(), "locks.ready");
			ready.push(waiter);
		}
	}
}

#[cfg(test)]
mod tests {
	use tessera_core::Tid;

	use super::*;
	use crate::action::{ActionBody, KeySet};
	use crate::rvp::Rendezvous;
	use crate::storage::{StorageEngine, TxHandle};

	struct FixedKeys(KeySet);

	impl ActionBody for FixedKeys {
		fn keys(&mut self) -> KeySet {
			self.0.clone()
		}

		fn execute(&mut self, _engine: &dyn StorageEngine, _tx: &TxHandle) -> Result<(), crate::error::ExecError> {
			Ok(())
		}
	}

	fn action(tid: u64, keys: KeySet, read_only: bool) -> Arc<Action> {
		let rvp = Rendezvous::new(TxHandle { tid: Tid(tid) }, 1, 1);
		let action = Action::new(&rvp, FixedKeys(keys), read_only);
		action.update_keys();
		action
	}

	#[test]
	fn test_remaining_keys_are_attempted_after_a_conflict() {
		let mut locks = PartitionLocks::new();

		let holder = action(1, KeySet::Point(Key::single(1)), false);
		assert!(locks.acquire_all(&holder).unwrap());

		// Key 1 conflicts, key 2 is free; the free key must still be
		// claimed so no later arrival can steal it.
		let both = action(2, KeySet::Range(vec![Key::single(1), Key::single(2)]), false);
		assert!(!locks.acquire_all(&both).unwrap());
		both.with_state(|state| {
			assert_eq!(state.keys_needed, 1);
			assert!(state.requests.iter().any(|r| r.key == Key::single(2) && r.granted));
		});

		let latecomer = action(3, KeySet::Point(Key::single(2)), false);
		assert!(!locks.acquire_all(&latecomer).unwrap());

		// Releasing the holder makes the two-key action fully granted.
		let mut ready = Vec::new();
		locks.release_all(&holder, &mut ready);
		assert_eq!(ready.len(), 1);
		assert!(Arc::ptr_eq(&ready[0], &both));
		assert!(both.is_ready());
	}

	#[test]
	fn test_shared_readers_coexist_on_one_key() {
		let mut locks = PartitionLocks::new();
		let a = action(1, KeySet::Point(Key::single(5)), true);
		let b = action(2, KeySet::Point(Key::single(5)), true);
		assert!(locks.acquire_all(&a).unwrap());
		assert!(locks.acquire_all(&b).unwrap());

		let mut ready = Vec::new();
		locks.release_all(&a, &mut ready);
		locks.release_all(&b, &mut ready);
		assert!(ready.is_empty());
		assert!(locks.is_clean());
	}

	#[test]
	fn test_abandon_backs_a_waiter_out() {
		let mut locks = PartitionLocks::new();
		let holder = action(1, KeySet::Point(Key::single(9)), false);
		assert!(locks.acquire_all(&holder).unwrap());

		let waiter = action(2, KeySet::Point(Key::single(9)), false);
		assert!(!locks.acquire_all(&waiter).unwrap());

		let mut ready = Vec::new();
		locks.abandon(&waiter, &mut ready);
		assert!(ready.is_empty());

		// The holder's release now promotes nobody.
		locks.release_all(&holder, &mut ready);
		assert!(ready.is_empty());
		assert!(locks.is_clean());
	}

	#[test]
	fn test_reset_reports_waiter_tickets() {
		let mut locks = PartitionLocks::new();
		let holder = action(1, KeySet::Point(Key::single(3)), false);
		assert!(locks.acquire_all(&holder).unwrap());
		let waiter = action(2, KeySet::Point(Key::single(3)), false);
		assert!(!locks.acquire_all(&waiter).unwrap());

		let (tids, tickets) = locks.reset();
		assert_eq!(tids, vec![Tid(1), Tid(2)]);
		assert_eq!(tickets.len(), 1);
		assert!(Arc::ptr_eq(&tickets[0], &waiter));
		assert_eq!(locks.keys_touched(), 0);
	}
}
