//! Actions: the partition-local fragments of a transaction.
//!
//! An action carries a back-pointer to its coordinating rendezvous, a
//! hook that fills in the keys it must lock, and the body it runs
//! against the storage engine once every key lock is granted. Point
//! accesses name a single key; range accesses name the concrete key
//! list their hook computed.
//!
//! After the client enqueues an action into a partition, only that
//! partition's worker thread touches the mutable state, so the inner
//! mutexes are uncontended by construction.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tessera_core::{Key, LockMode, Tid};

use crate::error::ExecError;
use crate::partition::{KeyRange, PartitionInner};
use crate::rvp::Rendezvous;
use crate::storage::{StorageEngine, TxHandle};

/// The key set an action's hook computes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySet {
	/// Single-key access.
	Point(Key),
	/// A concrete list of keys spanning a range of the partition.
	Range(Vec<Key>),
}

/// The per-action hook pair: key computation and the execution body.
///
/// `keys` runs on the partition worker right before lock acquisition;
/// `execute` runs once every requested lock is granted, with the
/// calling thread attached to the transaction. Returning
/// [`ExecError::MidwayAbort`] aborts the whole transaction without
/// counting as a worker problem.
pub trait ActionBody: Send {
	fn keys(&mut self) -> KeySet;

	fn execute(&mut self, engine: &dyn StorageEngine, tx: &TxHandle) -> Result<(), ExecError>;
}

/// One lock request of an action.
#[derive(Debug, Clone)]
pub(crate) struct LockRequest {
	pub key: Key,
	pub mode: LockMode,
	/// Set once the partition's lock table granted this key.
	pub granted: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ActionState {
	pub requests: SmallVec<[LockRequest; 1]>,
	pub keys_set: bool,
	/// Keys still missing before the action may run.
	pub keys_needed: usize,
	/// Range of the owning partition, captured at enqueue time so a
	/// later split does not invalidate in-flight work.
	pub enqueued_range: Option<KeyRange>,
	pub enqueued_at: Option<Instant>,
}

/// A transaction fragment bound to one partition.
pub struct Action {
	rvp: Arc<Rendezvous>,
	tx: TxHandle,
	read_only: bool,
	/// Secondary actions access records directly through a RID list
	/// once their locks are held.
	secondary: bool,
	partition: OnceLock<Arc<PartitionInner>>,
	state: Mutex<ActionState>,
	body: Mutex<Box<dyn ActionBody>>,
}

impl std::fmt::Debug for Action {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Action")
			.field("tid", &self.tx.tid)
			.field("read_only", &self.read_only)
			.field("secondary", &self.secondary)
			.finish_non_exhaustive()
	}
}

impl Action {
	/// Creates an action reporting to `rvp`. A read-only action
	/// requests shared key locks instead of exclusive ones.
	pub fn new(rvp: &Arc<Rendezvous>, body: impl ActionBody + 'static, read_only: bool) -> Arc<Self> {
		Self::build(rvp, Box::new(body), read_only, false)
	}

	/// Creates a secondary action: one that walks a RID list directly
	/// once its locks are held.
	pub fn secondary(rvp: &Arc<Rendezvous>, body: impl ActionBody + 'static, read_only: bool) -> Arc<Self> {
		Self::build(rvp, Box::new(body), read_only, true)
	}

	fn build(rvp: &Arc<Rendezvous>, body: Box<dyn ActionBody>, read_only: bool, secondary: bool) -> Arc<Self> {
		Arc::new(Self {
			rvp: Arc::clone(rvp),
			tx: rvp.tx(),
			read_only,
			secondary,
			partition: OnceLock::new(),
			state: Mutex::new(ActionState::default()),
			body: Mutex::new(body),
		})
	}

	pub fn tid(&self) -> Tid {
		self.tx.tid
	}

	pub fn tx(&self) -> TxHandle {
		self.tx
	}

	pub fn rvp(&self) -> &Arc<Rendezvous> {
		&self.rvp
	}

	pub fn is_read_only(&self) -> bool {
		self.read_only
	}

	pub fn is_secondary(&self) -> bool {
		self.secondary
	}

	/// True once every requested key lock is granted.
	pub fn is_ready(&self) -> bool {
		self.state.lock().keys_needed == 0
	}

	/// Binds the action to its partition. Called by the partition on
	/// enqueue; rebinding to a different partition is a routing bug.
	pub(crate) fn bind_partition(&self, part: &Arc<PartitionInner>, range: KeyRange) -> Result<(), ExecError> {
		if let Some(existing) = self.partition.get() {
			if !Arc::ptr_eq(existing, part) {
				return Err(ExecError::BadPartition {
					partition: part.id(),
					key: Key::new(),
				});
			}
			return Ok(());
		}
		let _ = self.partition.set(Arc::clone(part));
		let mut state = self.state.lock();
		state.enqueued_range = Some(range);
		state.enqueued_at = Some(Instant::now());
		Ok(())
	}

	/// Runs the key hook once, deriving the lock-request list.
	///
	/// Duplicate keys collapse into a single request at the strongest
	/// mode so release never double-frees a key.
	pub(crate) fn update_keys(&self) {
		let mut state = self.state.lock();
		if state.keys_set {
			return;
		}
		let keyset = self.body.lock().keys();
		let mode = if self.read_only { LockMode::Shared } else { LockMode::Exclusive };
		let mut keys = match keyset {
			KeySet::Point(key) => vec![key],
			KeySet::Range(keys) => keys,
		};
		debug_assert!(!keys.is_empty(), "an action must request at least one key");
		keys.sort();
		keys.dedup();
		state.requests = keys
			.into_iter()
			.map(|key| LockRequest {
				key,
				mode,
				granted: false,
			})
			.collect();
		state.keys_needed = state.requests.len();
		state.keys_set = true;
	}

	/// Returns the first requested key outside the range the action was
	/// enqueued under, if any.
	pub(crate) fn key_outside_enqueued_range(&self) -> Option<Key> {
		let state = self.state.lock();
		let range = state.enqueued_range.as_ref()?;
		state
			.requests
			.iter()
			.map(|r| &r.key)
			.find(|key| !range.contains(key))
			.cloned()
	}

	pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ActionState) -> R) -> R {
		f(&mut self.state.lock())
	}

	/// Credits `granted` newly-acquired keys.
	pub(crate) fn got_keys(&self, granted: usize) -> bool {
		let mut state = self.state.lock();
		debug_assert!(state.keys_needed >= granted);
		state.keys_needed = state.keys_needed.saturating_sub(granted);
		state.keys_needed == 0
	}

	/// Time spent between enqueue and now, for queue-wait accounting.
	pub(crate) fn queue_wait(&self) -> Option<std::time::Duration> {
		self.state.lock().enqueued_at.map(|at| at.elapsed())
	}

	/// Runs the body against the storage engine.
	pub(crate) fn execute(&self, engine: &dyn StorageEngine) -> Result<(), ExecError> {
		self.body.lock().execute(engine, &self.tx)
	}

	/// Pushes this action into its partition's commit queue so the
	/// partition releases the action's locks.
	pub(crate) fn notify_own_partition(self: Arc<Self>) {
		let Some(part) = self.partition.get().cloned() else {
			// Never enqueued anywhere; nothing holds locks for it.
			return;
		};
		part.enqueue_commit(self, true);
	}
}
