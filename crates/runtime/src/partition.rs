//! Data partitions.
//!
//! A partition couples a contiguous key range of one table with a lock
//! table, two SRMW queues (new input and committed actions), and a
//! primary worker thread that is the sole consumer of both queues.
//! Standby workers, when configured, are parked spares administrators
//! can activate; they never touch the queues while the primary runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tessera_core::{Key, PartitionId, Tid};

use crate::action::Action;
use crate::config::RuntimeConfig;
use crate::env::EnvStats;
use crate::error::ExecError;
use crate::locks::PartitionLocks;
use crate::queue::SrmwQueue;
use crate::rvp::{Rendezvous, RvpContext};
use crate::storage::{StorageEngine, TxHandle};
use crate::worker::{self, WorkState, WorkerControl, WorkerGate, WorkerStats, WorkerStatsSnapshot};

/// How many worker threads are currently active for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActiveThreads {
	Undefined = 0,
	/// Only the primary owner is active.
	Single = 1,
	/// One or more standby threads are active as well.
	Multiple = 2,
}

/// The half-open key range `[low, high)` a partition is responsible
/// for; `high` of `None` runs to the maximum-key sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
	pub low: Key,
	pub high: Option<Key>,
}

impl KeyRange {
	pub fn contains(&self, key: &Key) -> bool {
		if key < &self.low {
			return false;
		}
		match &self.high {
			Some(high) => key < high,
			None => true,
		}
	}
}

/// A parked standby worker.
struct Standby {
	gate: Arc<WorkerGate>,
	handle: JoinHandle<()>,
}

/// Shared core of a partition, reachable from the worker thread, the
/// queues, and the actions routed here.
pub(crate) struct PartitionInner {
	id: AtomicU32,
	table: String,
	range: Mutex<KeyRange>,
	gate: Arc<WorkerGate>,
	input: SrmwQueue<Arc<Action>>,
	commit: SrmwQueue<Arc<Action>>,
	locks: Mutex<PartitionLocks>,
	engine: Arc<dyn StorageEngine>,
	flusher: Option<Arc<SrmwQueue<Arc<Rendezvous>>>>,
	env_stats: Arc<EnvStats>,
	stats: WorkerStats,
	min_keys_for_lockmap_reset: usize,
	/// Processor-binding hint; advisory, recorded for operators.
	cpu_hint: Option<usize>,
	active_state: AtomicU8,
	active_count: AtomicUsize,
}

impl PartitionInner {
	pub fn id(&self) -> PartitionId {
		PartitionId(self.id.load(Ordering::Acquire))
	}

	pub fn set_id(&self, id: PartitionId) {
		self.id.store(id.0, Ordering::Release);
	}

	pub fn table(&self) -> &str {
		&self.table
	}

	pub fn range(&self) -> KeyRange {
		self.range.lock().clone()
	}

	pub fn set_range(&self, range: KeyRange) {
		*self.range.lock() = range;
	}

	pub fn gate(&self) -> &Arc<WorkerGate> {
		&self.gate
	}

	pub fn input_queue(&self) -> &SrmwQueue<Arc<Action>> {
		&self.input
	}

	pub fn commit_queue(&self) -> &SrmwQueue<Arc<Action>> {
		&self.commit
	}

	pub fn locks(&self) -> &Mutex<PartitionLocks> {
		&self.locks
	}

	pub fn engine(&self) -> &dyn StorageEngine {
		self.engine.as_ref()
	}

	pub fn stats(&self) -> &WorkerStats {
		&self.stats
	}

	pub fn rvp_context(&self) -> RvpContext<'_> {
		RvpContext {
			engine: self.engine.as_ref(),
			flusher: self.flusher.as_ref(),
			stats: &self.env_stats,
		}
	}

	pub fn enqueue_commit(self: Arc<Self>, action: Arc<Action>, wake: bool) {
		tracing::trace!(partition = %self.id(), tid = %action.tid(), "partition.enqueue_commit");
		self.commit.push(action, wake);
	}

	fn inc_active(&self) -> ActiveThreads {
		let count = self.active_count.fetch_add(1, Ordering::AcqRel) + 1;
		let state = if count > 1 { ActiveThreads::Multiple } else { ActiveThreads::Single };
		self.active_state.store(state as u8, Ordering::Release);
		state
	}

	fn clear_active(&self) {
		self.active_count.store(0, Ordering::Release);
		self.active_state.store(ActiveThreads::Undefined as u8, Ordering::Release);
	}
}

/// A live partition: the shared core plus its worker threads.
pub struct Partition {
	inner: Arc<PartitionInner>,
	primary: Mutex<Option<JoinHandle<()>>>,
	standbys: Mutex<Vec<Standby>>,
	config: RuntimeConfig,
}

impl Partition {
	pub(crate) fn new(
		id: PartitionId,
		table: &str,
		range: KeyRange,
		engine: Arc<dyn StorageEngine>,
		flusher: Option<Arc<SrmwQueue<Arc<Rendezvous>>>>,
		env_stats: Arc<EnvStats>,
		config: &RuntimeConfig,
		cpu_hint: Option<usize>,
	) -> Arc<Self> {
		let gate = WorkerGate::new();
		let inner = Arc::new(PartitionInner {
			id: AtomicU32::new(id.0),
			table: table.to_owned(),
			range: Mutex::new(range),
			gate: Arc::clone(&gate),
			input: SrmwQueue::new(
				Arc::clone(&gate),
				WorkState::InputQueue,
				config.worker_spin_loops,
				config.input_queue_wake_threshold,
			),
			commit: SrmwQueue::new(
				Arc::clone(&gate),
				WorkState::CommitQueue,
				config.worker_spin_loops,
				config.commit_queue_wake_threshold,
			),
			locks: Mutex::new(PartitionLocks::new()),
			engine,
			flusher,
			env_stats,
			stats: WorkerStats::default(),
			min_keys_for_lockmap_reset: config.min_keys_for_lockmap_reset,
			cpu_hint: config.cpu_binding.then_some(cpu_hint).flatten(),
			active_state: AtomicU8::new(ActiveThreads::Undefined as u8),
			active_count: AtomicUsize::new(0),
		});
		Arc::new(Self {
			inner,
			primary: Mutex::new(None),
			standbys: Mutex::new(Vec::new()),
			config: config.clone(),
		})
	}

	pub fn id(&self) -> PartitionId {
		self.inner.id()
	}

	pub fn table(&self) -> &str {
		self.inner.table()
	}

	pub fn range(&self) -> KeyRange {
		self.inner.range()
	}

	pub(crate) fn inner(&self) -> &Arc<PartitionInner> {
		&self.inner
	}

	/// Spawns the primary worker and the configured standby pool, then
	/// activates the primary.
	pub fn start(&self) {
		let mut primary = self.primary.lock();
		if primary.is_some() {
			return;
		}
		self.inner.gate.reset();
		let part = Arc::clone(&self.inner);
		let name = format!("{}-P{}", self.inner.table(), self.inner.id());
		let handle = thread::Builder::new()
			.name(name)
			.spawn(move || worker::worker_main(part))
			.unwrap_or_else(|err| panic!("failed to spawn partition worker: {err}"));
		*primary = Some(handle);

		let mut standbys = self.standbys.lock();
		for n in 0..self.config.workers_per_partition {
			let gate = WorkerGate::new();
			let part = Arc::clone(&self.inner);
			let standby_gate = Arc::clone(&gate);
			let name = format!("{}-P{}-S{}", self.inner.table(), self.inner.id(), n);
			let handle = thread::Builder::new()
				.name(name)
				.spawn(move || standby_main(part, standby_gate))
				.unwrap_or_else(|err| panic!("failed to spawn standby worker: {err}"));
			standbys.push(Standby { gate, handle });
		}

		self.inner.inc_active();
		self.inner.gate.start();
		tracing::info!(
			partition = %self.inner.id(),
			table = self.inner.table(),
			standbys = self.config.workers_per_partition,
			cpu_hint = ?self.inner.cpu_hint,
			"partition.start"
		);
	}

	/// Enqueues a new action for execution. `wake` forces the worker
	/// awake instead of batching up to the configured threshold.
	pub fn enqueue(&self, action: Arc<Action>, wake: bool) -> Result<(), ExecError> {
		action.bind_partition(&self.inner, self.inner.range())?;
		tracing::trace!(partition = %self.inner.id(), tid = %action.tid(), "partition.enqueue");
		self.inner.input.push(action, wake);
		Ok(())
	}

	/// Enqueues a committed action so the worker releases its locks.
	pub fn enqueue_commit(&self, action: Arc<Action>, wake: bool) {
		Arc::clone(&self.inner).enqueue_commit(action, wake);
	}

	/// Cooperative pause; the worker parks after finishing the current
	/// iteration.
	pub fn pause(&self) {
		self.inner.gate.pause();
	}

	/// Resumes a paused partition.
	pub fn resume(&self) {
		self.inner.gate.start();
	}

	/// Stops the partition: the worker drains and aborts everything
	/// still queued, standbys are released, and the lock table ends up
	/// empty.
	pub fn stop(&self) {
		self.inner.gate.stop();
		if let Some(handle) = self.primary.lock().take() {
			if handle.join().is_err() {
				tracing::error!(partition = %self.inner.id(), "partition.worker_panicked");
			}
		}
		for standby in self.standbys.lock().drain(..) {
			standby.gate.stop();
			if standby.handle.join().is_err() {
				tracing::error!(partition = %self.inner.id(), "partition.standby_panicked");
			}
		}
		self.inner.clear_active();
		tracing::info!(partition = %self.inner.id(), table = self.inner.table(), "partition.stop");
	}

	/// Prepares the partition for a new run: waits for the worker to go
	/// idle, drains both queues with recovery passes, aborts whatever
	/// the lock table still holds, and resets the lock map once it
	/// crossed the configured size threshold.
	pub(crate) fn prepare_new_run(&self) -> Result<(), ExecError> {
		let part = &self.inner;
		while self.primary.lock().is_some()
			&& part.gate.control() == WorkerControl::Active
			&& !part.gate.is_sleeping()
		{
			tracing::debug!(partition = %part.id(), "partition.await_sleep");
			thread::sleep(Duration::from_millis(1));
		}

		while !part.commit.is_really_empty() || !part.input.is_really_empty() {
			recovery_pass(part);
		}

		let mut tids = Vec::new();
		let mut tickets = Vec::new();
		let dirty = part.locks.lock().clean_all(&mut tids, &mut tickets);
		if dirty > 0 {
			tracing::warn!(
				partition = %part.id(),
				%dirty,
				transactions = tids.len(),
				"partition.lockmap_dirty"
			);
			drop(tickets);
			let mut aborted: Vec<Tid> = Vec::new();
			for tid in tids {
				if aborted.contains(&tid) {
					continue;
				}
				let _ = part.engine.abort(&TxHandle { tid });
				aborted.push(tid);
			}
		}

		let touched = part.locks.lock().keys_touched();
		if touched >= part.min_keys_for_lockmap_reset {
			tracing::debug!(partition = %part.id(), touched, "partition.lockmap_reset");
			let _ = part.locks.lock().reset();
		}
		Ok(())
	}

	pub fn stats(&self) -> WorkerStatsSnapshot {
		let mut snapshot = self.inner.stats.snapshot();
		(snapshot.condvar_sleeps, snapshot.failed_sleeps) = self.inner.gate.sleep_counts();
		snapshot
	}

	pub fn keys_touched(&self) -> usize {
		self.inner.locks.lock().keys_touched()
	}

	/// True when no logical lock of this partition has owners or
	/// waiters.
	pub fn locks_clean(&self) -> bool {
		self.inner.locks.lock().is_clean()
	}

	pub fn active_threads(&self) -> ActiveThreads {
		match self.inner.active_state.load(Ordering::Acquire) {
			1 => ActiveThreads::Single,
			2 => ActiveThreads::Multiple,
			_ => ActiveThreads::Undefined,
		}
	}

	/// True when the primary worker is parked on its condition variable.
	pub fn is_idle(&self) -> bool {
		self.inner.gate.is_sleeping()
	}
}

/// One drain iteration executed on the caller's thread while the
/// primary worker sleeps. Mirrors the worker's active loop without the
/// blocking dequeue.
fn recovery_pass(part: &Arc<PartitionInner>) {
	while let Some(action) = part.commit.try_pop() {
		let mut ready = Vec::new();
		part.locks.lock().release_all(&action, &mut ready);
		drop(action);
		for promoted in ready {
			worker::serve_action(part, promoted);
		}
	}

	while let Some(action) = part.input.try_pop() {
		action.update_keys();
		let admitted = part.locks.lock().acquire_all(&action);
		match admitted {
			Ok(true) => worker::serve_action(part, action),
			Ok(false) => {}
			Err(err) => {
				tracing::warn!(partition = %part.id(), tid = %action.tid(), %err, "partition.recovery_admit_failed");
				let mut ready = Vec::new();
				part.locks.lock().abandon(&action, &mut ready);
				if action.rvp().post(true) {
					let ctx = part.rvp_context();
					if let Err(err) = action.rvp().run(&ctx) {
						tracing::warn!(tid = %action.tid(), %err, "partition.recovery_rvp_failed");
					}
				}
				for promoted in ready {
					worker::serve_action(part, promoted);
				}
			}
		}
	}
}

/// Standby workers park until an administrator activates them or the
/// partition stops.
fn standby_main(part: Arc<PartitionInner>, gate: Arc<WorkerGate>) {
	tracing::debug!(partition = %part.id(), "standby.park");
	loop {
		match gate.control() {
			WorkerControl::Paused => gate.wait_while_paused(),
			WorkerControl::Active | WorkerControl::Recovery => {
				// Promotion of a standby to primary is an administrative
				// operation; until then an activated standby only
				// contributes to the active-thread accounting.
				part.inc_active();
				gate.pause();
			}
			WorkerControl::Stopped => {
				tracing::debug!(partition = %part.id(), "standby.exit");
				return;
			}
		}
	}
}
