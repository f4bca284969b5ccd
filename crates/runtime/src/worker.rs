//! Worker control and the partition execution loop.
//!
//! Every worker owns a [`WorkerGate`]: a pair of small state machines.
//! The *control* state (`Paused`/`Active`/`Stopped`/`Recovery`) is the
//! administrative lifecycle. The *working* state records what the
//! worker is doing right now and doubles as the wake-up channel: an
//! enqueuing thread upgrades the working state (`Sleep` → `InputQueue`,
//! say) before signaling, so a wake-up can never be lost between the
//! worker's last queue check and its decision to sleep. Only the
//! sleeper itself moves the state out of `Sleep` back to `Loop`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tessera_core::Tid;

use crate::action::Action;
use crate::error::ExecError;
use crate::partition::PartitionInner;
use crate::storage::TxHandle;

/// Administrative lifecycle of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerControl {
	Paused = 0,
	Active = 1,
	Stopped = 2,
	Recovery = 3,
}

impl WorkerControl {
	fn from_u8(v: u8) -> Self {
		match v {
			0 => Self::Paused,
			1 => Self::Active,
			2 => Self::Stopped,
			_ => Self::Recovery,
		}
	}
}

/// What a worker is doing right now.
///
/// External threads only ever *upgrade* this state (to signal work on a
/// queue); the worker itself sets `Loop` at the top of each iteration
/// and `Sleep` when both queues are dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
	Undefined = 0,
	Loop = 1,
	Sleep = 2,
	CommitQueue = 3,
	InputQueue = 4,
	Finished = 5,
}

impl WorkState {
	fn from_u8(v: u8) -> Self {
		match v {
			1 => Self::Loop,
			2 => Self::Sleep,
			3 => Self::CommitQueue,
			4 => Self::InputQueue,
			5 => Self::Finished,
			_ => Self::Undefined,
		}
	}
}

/// Shared control block of one worker thread.
#[derive(Debug)]
pub struct WorkerGate {
	control: AtomicU8,
	ws: AtomicU8,
	sleep_lock: Mutex<()>,
	wake_cond: Condvar,
	sleeps: AtomicU64,
	failed_sleeps: AtomicU64,
}

impl Default for WorkerGate {
	fn default() -> Self {
		Self {
			control: AtomicU8::new(WorkerControl::Paused as u8),
			ws: AtomicU8::new(WorkState::Undefined as u8),
			sleep_lock: Mutex::new(()),
			wake_cond: Condvar::new(),
			sleeps: AtomicU64::new(0),
			failed_sleeps: AtomicU64::new(0),
		}
	}
}

impl WorkerGate {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn control(&self) -> WorkerControl {
		WorkerControl::from_u8(self.control.load(Ordering::SeqCst))
	}

	/// Requests a control transition, honoring the transition matrix:
	/// `Paused` ↔ `Active`, anything → `Stopped`, and `Recovery` may be
	/// entered and left from any state.
	pub fn set_control(&self, next: WorkerControl) -> bool {
		let cur = self.control();
		let allowed = matches!(
			(cur, next),
			(WorkerControl::Paused, WorkerControl::Active | WorkerControl::Stopped)
				| (WorkerControl::Active, WorkerControl::Paused | WorkerControl::Stopped)
				| (WorkerControl::Stopped, WorkerControl::Stopped)
				| (WorkerControl::Recovery, _)
				| (_, WorkerControl::Recovery)
		);
		if allowed {
			self.control.store(next as u8, Ordering::SeqCst);
		} else {
			tracing::debug!(from = ?cur, to = ?next, "worker.control.rejected");
		}
		allowed
	}

	pub fn work_state(&self) -> WorkState {
		WorkState::from_u8(self.ws.load(Ordering::SeqCst))
	}

	/// Sets the working state, waking the worker if it was asleep.
	///
	/// A pending `CommitQueue` signal outranks everything except the
	/// worker's own return to `Loop`: commits release locks and must
	/// not be overwritten by an input signal.
	pub fn set_work_state(&self, new_ws: WorkState) -> WorkState {
		let mut old = self.work_state();
		while old != new_ws {
			if old == WorkState::CommitQueue && new_ws != WorkState::Loop {
				return old;
			}
			match self
				.ws
				.compare_exchange(old as u8, new_ws as u8, Ordering::SeqCst, Ordering::SeqCst)
			{
				Ok(_) => {
					if old == WorkState::Sleep && new_ws != WorkState::Sleep {
						self.wake();
					}
					return old;
				}
				Err(cur) => old = WorkState::from_u8(cur),
			}
		}
		old
	}

	/// True while the working state matches the caller's queue or the
	/// worker is in its neutral loop state.
	pub fn can_continue(&self, my_ws: WorkState) -> bool {
		let ws = self.work_state();
		ws == my_ws || ws == WorkState::Loop
	}

	pub fn is_sleeping(&self) -> bool {
		self.work_state() == WorkState::Sleep
	}

	/// Tries to transition `Loop` → `Sleep` and block until woken.
	///
	/// Returns false without sleeping when the working state already
	/// moved on (a queue was signaled during this loop iteration).
	pub fn sleep(&self) -> bool {
		self.sleep_inner(None)
	}

	/// Like [`WorkerGate::sleep`] but bounded by `timeout`.
	pub fn sleep_for(&self, timeout: Duration) -> bool {
		self.sleep_inner(Some(timeout))
	}

	fn sleep_inner(&self, timeout: Option<Duration>) -> bool {
		let mut guard = self.sleep_lock.lock();
		if self
			.ws
			.compare_exchange(
				WorkState::Loop as u8,
				WorkState::Sleep as u8,
				Ordering::SeqCst,
				Ordering::SeqCst,
			)
			.is_err()
		{
			// A queue was signaled between our last check and now.
			self.failed_sleeps.fetch_add(1, Ordering::Relaxed);
			return false;
		}
		self.sleeps.fetch_add(1, Ordering::Relaxed);
		while self.work_state() == WorkState::Sleep && self.control() == WorkerControl::Active {
			match timeout {
				Some(t) => {
					if self.wake_cond.wait_for(&mut guard, t).timed_out() {
						break;
					}
				}
				None => self.wake_cond.wait(&mut guard),
			}
		}
		// Only the sleeper leaves Sleep for Loop; external signalers
		// have already upgraded the state past Sleep when they woke us.
		let _ = self.ws.compare_exchange(
			WorkState::Sleep as u8,
			WorkState::Loop as u8,
			Ordering::SeqCst,
			Ordering::SeqCst,
		);
		true
	}

	pub fn wake(&self) {
		let _guard = self.sleep_lock.lock();
		self.wake_cond.notify_all();
	}

	pub fn stop(&self) {
		self.set_control(WorkerControl::Stopped);
		self.wake();
	}

	pub fn start(&self) {
		self.set_control(WorkerControl::Active);
		self.wake();
	}

	pub fn pause(&self) {
		self.set_control(WorkerControl::Paused);
		self.wake();
	}

	pub(crate) fn wait_while_paused(&self) {
		let mut guard = self.sleep_lock.lock();
		while self.control() == WorkerControl::Paused {
			self.wake_cond.wait(&mut guard);
		}
	}

	/// Resets the gate for a fresh worker thread.
	pub(crate) fn reset(&self) {
		self.control.store(WorkerControl::Paused as u8, Ordering::SeqCst);
		self.ws.store(WorkState::Undefined as u8, Ordering::SeqCst);
	}

	/// (successful sleeps, sleeps skipped because work arrived).
	pub fn sleep_counts(&self) -> (u64, u64) {
		(
			self.sleeps.load(Ordering::Relaxed),
			self.failed_sleeps.load(Ordering::Relaxed),
		)
	}
}

/// Per-worker counters, written by the owning worker and read by
/// whoever aggregates statistics.
#[derive(Debug, Default)]
pub struct WorkerStats {
	processed: AtomicU64,
	problems: AtomicU64,
	served_input: AtomicU64,
	served_waiting: AtomicU64,
	early_aborts: AtomicU64,
	midway_aborts: AtomicU64,
}

macro_rules! bump {
	($($name:ident => $field:ident),* $(,)?) => {
		$(pub(crate) fn $name(&self) {
			self.$field.fetch_add(1, Ordering::Relaxed);
		})*
	};
}

impl WorkerStats {
	bump! {
		bump_processed => processed,
		bump_problems => problems,
		bump_served_input => served_input,
		bump_served_waiting => served_waiting,
		bump_early_aborts => early_aborts,
		bump_midway_aborts => midway_aborts,
	}

	pub fn snapshot(&self) -> WorkerStatsSnapshot {
		WorkerStatsSnapshot {
			processed: self.processed.load(Ordering::Relaxed),
			problems: self.problems.load(Ordering::Relaxed),
			served_input: self.served_input.load(Ordering::Relaxed),
			served_waiting: self.served_waiting.load(Ordering::Relaxed),
			condvar_sleeps: 0,
			failed_sleeps: 0,
			early_aborts: self.early_aborts.load(Ordering::Relaxed),
			midway_aborts: self.midway_aborts.load(Ordering::Relaxed),
		}
	}
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
	pub processed: u64,
	pub problems: u64,
	pub served_input: u64,
	pub served_waiting: u64,
	pub condvar_sleeps: u64,
	pub failed_sleeps: u64,
	pub early_aborts: u64,
	pub midway_aborts: u64,
}

impl WorkerStatsSnapshot {
	pub fn merge(&mut self, other: &WorkerStatsSnapshot) {
		self.processed += other.processed;
		self.problems += other.problems;
		self.served_input += other.served_input;
		self.served_waiting += other.served_waiting;
		self.condvar_sleeps += other.condvar_sleeps;
		self.failed_sleeps += other.failed_sleeps;
		self.early_aborts += other.early_aborts;
		self.midway_aborts += other.midway_aborts;
	}
}

/// Entry point of a partition's primary worker thread.
///
/// A plain state machine over the control word: `Paused` parks,
/// `Active` and `Recovery` run the serving loop, `Stopped` aborts
/// whatever is still enqueued and exits.
pub(crate) fn worker_main(part: Arc<PartitionInner>) {
	let gate = Arc::clone(part.gate());
	tracing::info!(partition = %part.id(), table = part.table(), "worker.start");
	loop {
		match gate.control() {
			WorkerControl::Paused => gate.wait_while_paused(),
			WorkerControl::Active | WorkerControl::Recovery => active_loop(&part),
			WorkerControl::Stopped => {
				abort_enqueued(&part);
				gate.set_work_state(WorkState::Finished);
				tracing::info!(partition = %part.id(), table = part.table(), "worker.stop");
				return;
			}
		}
	}
}

/// The serving loop: committed actions first, then new input.
///
/// Releasing a committed action's locks can promote waiters; every
/// promoted action that became fully granted is executed before the
/// worker returns to the input queue.
fn active_loop(part: &Arc<PartitionInner>) {
	let gate = part.gate();
	loop {
		let control = gate.control();
		let recovery = control == WorkerControl::Recovery;
		if control != WorkerControl::Active && !recovery {
			return;
		}
		gate.set_work_state(WorkState::Loop);

		while let Some(action) = part.commit_queue().try_pop() {
			let tid = action.tid();
			let mut ready = Vec::new();
			part.locks().lock().release_all(&action, &mut ready);
			tracing::trace!(partition = %part.id(), %tid, ready = ready.len(), "worker.committed");
			drop(action);
			for promoted in ready {
				part.stats().bump_served_waiting();
				serve_action(part, promoted);
			}
		}

		if recovery && part.input_queue().is_empty() {
			return;
		}

		let Some(action) = part.input_queue().pop_wait() else {
			continue;
		};
		tracing::trace!(partition = %part.id(), tid = %action.tid(), "worker.input");
		match admit_action(part, &action) {
			Ok(true) => {
				part.stats().bump_served_input();
				serve_action(part, action);
			}
			Ok(false) => {
				// Parked inside the lock table's waiter lists; a later
				// release will hand it back as ready.
			}
			Err(err) => {
				tracing::warn!(partition = %part.id(), tid = %action.tid(), %err, "worker.admit_failed");
				part.stats().bump_problems();
				let mut ready = Vec::new();
				part.locks().lock().abandon(&action, &mut ready);
				fail_action(part, &action);
				for promoted in ready {
					part.stats().bump_served_waiting();
					serve_action(part, promoted);
				}
			}
		}
	}
}

/// Fills in the action's keys, verifies routing, and acquires locks.
///
/// Returns `Ok(true)` when every key lock was granted.
fn admit_action(part: &Arc<PartitionInner>, action: &Arc<Action>) -> Result<bool, ExecError> {
	action.update_keys();
	if let Some(key) = action.key_outside_enqueued_range() {
		return Err(ExecError::BadPartition {
			partition: part.id(),
			key,
		});
	}
	part.locks().lock().acquire_all(action)
}

/// Executes a fully-granted action and posts to its rendezvous.
pub(crate) fn serve_action(part: &Arc<PartitionInner>, action: Arc<Action>) {
	debug_assert!(action.is_ready(), "served an action with missing keys");
	let rvp = Arc::clone(action.rvp());
	let tid = action.tid();
	let mut is_error = false;

	if let Some(waited) = action.queue_wait() {
		tracing::trace!(%tid, ?waited, "worker.queue_wait");
	}

	if rvp.is_aborted() {
		part.stats().bump_early_aborts();
		tracing::trace!(%tid, "worker.early_abort");
	} else {
		let tx = TxHandle { tid };
		part.engine().attach(&tx);
		match action.execute(part.engine()) {
			Ok(()) => {}
			Err(ExecError::MidwayAbort(_)) => {
				part.stats().bump_midway_aborts();
				is_error = true;
				tracing::trace!(%tid, "worker.midway_abort");
			}
			Err(err) => {
				part.stats().bump_problems();
				is_error = true;
				tracing::warn!(%tid, %err, "worker.action_failed");
			}
		}
		part.engine().detach(&tx);
	}

	if rvp.post(is_error) {
		let ctx = part.rvp_context();
		if let Err(err) = rvp.run(&ctx) {
			tracing::warn!(%tid, %err, "worker.rvp_failed");
		}
	}
	part.stats().bump_processed();
}

/// Marks the action's transaction failed and finalizes the rendezvous
/// if this was the last outstanding post.
fn fail_action(part: &Arc<PartitionInner>, action: &Arc<Action>) {
	let rvp = action.rvp();
	if rvp.post(true) {
		let ctx = part.rvp_context();
		if let Err(err) = rvp.run(&ctx) {
			tracing::warn!(tid = %action.tid(), %err, "worker.rvp_failed");
		}
	}
	part.stats().bump_processed();
}

/// Pre-stop sweep: abort everything still enqueued or parked.
fn abort_enqueued(part: &Arc<PartitionInner>) {
	let mut failed = 0usize;

	for action in part.commit_queue().drain_all() {
		let mut ready = Vec::new();
		part.locks().lock().release_all(&action, &mut ready);
		for pending in ready {
			pending.rvp().mark_abort();
			fail_action(part, &pending);
			failed += 1;
		}
	}

	for action in part.input_queue().drain_all() {
		action.rvp().mark_abort();
		fail_action(part, &action);
		failed += 1;
	}

	// Waiters parked in the lock table never got to execute; fail their
	// posts so their clients observe the abort, then abort the
	// transactions the engine still knows about.
	let (tids, tickets) = part.locks().lock().reset();
	let mut seen = Vec::new();
	for ticket in tickets {
		if seen.iter().any(|s| Arc::ptr_eq(s, &ticket)) {
			continue;
		}
		ticket.rvp().mark_abort();
		fail_action(part, &ticket);
		failed += 1;
		seen.push(ticket);
	}
	let mut aborted_tids: Vec<Tid> = Vec::new();
	for tid in tids {
		if aborted_tids.contains(&tid) {
			continue;
		}
		let _ = part.engine().abort(&TxHandle { tid });
		aborted_tids.push(tid);
	}

	if failed > 0 {
		tracing::info!(partition = %part.id(), failed, "worker.aborted_enqueued");
	}
}
