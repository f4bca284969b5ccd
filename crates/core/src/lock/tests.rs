use std::collections::VecDeque;

use proptest::prelude::*;

use super::*;

fn shared(lock: &mut LogicalLock<u64>, tid: u64) -> Acquire {
	lock.acquire(Tid(tid), LockMode::Shared, tid).unwrap()
}

fn exclusive(lock: &mut LogicalLock<u64>, tid: u64) -> Acquire {
	lock.acquire(Tid(tid), LockMode::Exclusive, tid).unwrap()
}

#[test]
fn test_shared_holders_coexist() {
	let mut lock = LogicalLock::new();
	assert_eq!(shared(&mut lock, 1), Acquire::Granted);
	assert_eq!(shared(&mut lock, 2), Acquire::Granted);
	assert_eq!(lock.owner_count(), 2);
	assert_eq!(lock.mode(), LockMode::Shared);

	let mut promoted = Vec::new();
	lock.release(Tid(1), &mut promoted);
	assert!(promoted.is_empty());
	assert!(lock.is_owner(Tid(2)));

	lock.release(Tid(2), &mut promoted);
	assert!(lock.is_clean());
}

#[test]
fn test_writer_blocks_reader() {
	let mut lock = LogicalLock::new();
	assert_eq!(exclusive(&mut lock, 1), Acquire::Granted);
	assert_eq!(shared(&mut lock, 2), Acquire::Enqueued);
	assert_eq!(lock.waiter_count(), 1);

	let mut promoted = Vec::new();
	assert_eq!(lock.release(Tid(1), &mut promoted), 1);
	assert_eq!(promoted, vec![2]);
	assert_eq!(lock.mode(), LockMode::Shared);
	assert!(lock.is_owner(Tid(2)));
	assert_eq!(lock.owner_count(), 1);
}

#[test]
fn test_fifo_shared_queues_behind_pending_writer() {
	let mut lock = LogicalLock::new();
	assert_eq!(shared(&mut lock, 1), Acquire::Granted);
	assert_eq!(exclusive(&mut lock, 2), Acquire::Enqueued);

	// Tx3 is compatible with the shared holder but must not overtake
	// the pending writer.
	assert_eq!(shared(&mut lock, 3), Acquire::Enqueued);
	assert_eq!(lock.waiter_count(), 2);

	let mut promoted = Vec::new();
	assert_eq!(lock.release(Tid(1), &mut promoted), 1);
	assert_eq!(promoted, vec![2]);
	assert_eq!(lock.mode(), LockMode::Exclusive);

	promoted.clear();
	assert_eq!(lock.release(Tid(2), &mut promoted), 1);
	assert_eq!(promoted, vec![3]);
	assert_eq!(lock.mode(), LockMode::Shared);
}

#[test]
fn test_reacquire_is_idempotent() {
	let mut lock = LogicalLock::new();
	assert_eq!(shared(&mut lock, 1), Acquire::Granted);
	assert_eq!(shared(&mut lock, 1), Acquire::Granted);
	assert_eq!(lock.owner_count(), 1);

	// Weaker-than-held is also a no-op.
	let mut other = LogicalLock::new();
	assert_eq!(exclusive(&mut other, 1), Acquire::Granted);
	assert_eq!(shared(&mut other, 1), Acquire::Granted);
	assert_eq!(other.mode(), LockMode::Exclusive);
}

#[test]
fn test_sole_owner_upgrades_in_place() {
	let mut lock = LogicalLock::new();
	assert_eq!(shared(&mut lock, 1), Acquire::Granted);
	assert_eq!(exclusive(&mut lock, 1), Acquire::Granted);
	assert_eq!(lock.mode(), LockMode::Exclusive);
	assert_eq!(lock.owner_count(), 1);
}

#[test]
fn test_upgrade_with_co_owners_is_rejected() {
	let mut lock = LogicalLock::new();
	assert_eq!(shared(&mut lock, 1), Acquire::Granted);
	assert_eq!(shared(&mut lock, 2), Acquire::Granted);

	let err = lock.acquire(Tid(1), LockMode::Exclusive, 1).unwrap_err();
	assert_eq!(err, LockError::IncompatibleUpgrade { tid: Tid(1) });

	// The failed upgrade left the lock untouched.
	assert_eq!(lock.owner_count(), 2);
	assert_eq!(lock.mode(), LockMode::Shared);
	assert_eq!(lock.waiter_count(), 0);
}

#[test]
fn test_batched_shared_promotion() {
	let mut lock = LogicalLock::new();
	assert_eq!(exclusive(&mut lock, 1), Acquire::Granted);
	assert_eq!(shared(&mut lock, 2), Acquire::Enqueued);
	assert_eq!(shared(&mut lock, 3), Acquire::Enqueued);
	assert_eq!(exclusive(&mut lock, 4), Acquire::Enqueued);

	// Releasing the writer admits the whole run of shared waiters but
	// stops at the next writer.
	let mut promoted = Vec::new();
	assert_eq!(lock.release(Tid(1), &mut promoted), 2);
	assert_eq!(promoted, vec![2, 3]);
	assert_eq!(lock.mode(), LockMode::Shared);
	assert_eq!(lock.waiter_count(), 1);
}

#[test]
fn test_abort_and_collect_drains_everything() {
	let mut lock = LogicalLock::new();
	assert_eq!(exclusive(&mut lock, 1), Acquire::Granted);
	assert_eq!(shared(&mut lock, 2), Acquire::Enqueued);
	assert_eq!(shared(&mut lock, 3), Acquire::Enqueued);

	let mut tids = Vec::new();
	let mut tickets = Vec::new();
	lock.abort_and_collect(&mut tids, &mut tickets);
	assert_eq!(tids, vec![Tid(1), Tid(2), Tid(3)]);
	assert_eq!(tickets, vec![2, 3]);
	assert!(lock.is_clean());
}

#[test]
fn test_remove_waiter_promotes_new_head() {
	let mut lock = LogicalLock::new();
	assert_eq!(shared(&mut lock, 1), Acquire::Granted);
	assert_eq!(exclusive(&mut lock, 2), Acquire::Enqueued);
	assert_eq!(shared(&mut lock, 3), Acquire::Enqueued);

	// Pulling the pending writer out exposes the compatible reader.
	let mut promoted = Vec::new();
	assert_eq!(lock.remove_waiter(Tid(2), &mut promoted), Some(2));
	assert_eq!(promoted, vec![3]);
	assert_eq!(lock.owner_count(), 2);
	assert_eq!(lock.mode(), LockMode::Shared);

	assert_eq!(lock.remove_waiter(Tid(9), &mut promoted), None);
}

#[test]
#[should_panic(expected = "released a lock it does not own")]
fn test_release_by_non_owner_panics() {
	let mut lock: LogicalLock<u64> = LogicalLock::new();
	lock.acquire(Tid(1), LockMode::Shared, 1).unwrap();
	lock.release(Tid(2), &mut Vec::new());
}

#[derive(Debug, Clone)]
enum Op {
	Acquire { tid: u64, exclusive: bool },
	Release { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0u64..12, any::<bool>()).prop_map(|(tid, exclusive)| Op::Acquire { tid, exclusive }),
		(0usize..8).prop_map(|pick| Op::Release { pick }),
	]
}

proptest! {
	/// Random schedules never violate the lock laws: owners stay
	/// pairwise compatible, the mode tracks the strongest owner, an
	/// empty lock is fully clean, and promotion follows arrival order.
	#[test]
	fn test_lock_laws_hold_under_random_schedules(ops in proptest::collection::vec(op_strategy(), 1..120)) {
		let mut lock: LogicalLock<u64> = LogicalLock::new();
		let mut owners: Vec<(u64, LockMode)> = Vec::new();
		let mut waiters: VecDeque<(u64, LockMode)> = VecDeque::new();

		for op in ops {
			match op {
				Op::Acquire { tid, exclusive } => {
					// Re-requests by known transactions are exercised by
					// the unit tests; here every request is fresh.
					if owners.iter().any(|(t, _)| *t == tid) || waiters.iter().any(|(t, _)| *t == tid) {
						continue;
					}
					let mode = if exclusive { LockMode::Exclusive } else { LockMode::Shared };
					match lock.acquire(Tid(tid), mode, tid).unwrap() {
						Acquire::Granted => owners.push((tid, mode)),
						Acquire::Enqueued => waiters.push_back((tid, mode)),
					}
				}
				Op::Release { pick } => {
					if owners.is_empty() {
						continue;
					}
					let (tid, _) = owners.remove(pick % owners.len());
					let mut promoted = Vec::new();
					lock.release(Tid(tid), &mut promoted);

					// Promotions come off the head of the FIFO, in order.
					for ticket in promoted {
						let (wtid, wmode) = waiters.pop_front().expect("promotion without waiter");
						prop_assert_eq!(ticket, wtid);
						owners.push((wtid, wmode));
					}
				}
			}

			// Owners are pairwise compatible.
			for (i, (_, a)) in owners.iter().enumerate() {
				for (_, b) in owners.iter().skip(i + 1) {
					prop_assert!(a.compatible_with(*b));
				}
			}

			// The mode is the strongest owner mode; empty means clean.
			let expected = owners.iter().map(|(_, m)| *m).max().unwrap_or(LockMode::NoLock);
			prop_assert_eq!(lock.mode(), expected);
			prop_assert_eq!(lock.owner_count(), owners.len());
			prop_assert_eq!(lock.waiter_count(), waiters.len());
			if owners.is_empty() {
				prop_assert!(waiters.is_empty());
				prop_assert!(lock.is_clean());
			}

			// At quiescence the head waiter conflicts with the mode.
			if let Some((_, head)) = waiters.front() {
				prop_assert!(!lock.mode().compatible_with(*head));
			}
		}
	}
}
