//! Rendezvous points: the per-transaction completion barrier.
//!
//! Every distributed transaction is decomposed into actions, one per
//! touched partition, all reporting to a single [`Rendezvous`]. Each
//! action posts exactly once; the last poster runs the terminal body,
//! which either aborts, or commits lazily and hands the transaction to
//! the group-commit pipeline. The client observes the outcome through
//! a [`CommitNotice`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tessera_core::Tid;

use crate::action::Action;
use crate::env::EnvStats;
use crate::error::ExecError;
use crate::queue::SrmwQueue;
use crate::storage::{Lsn, StorageEngine, StorageError, TxHandle};

/// Final outcome of a transaction, as delivered to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxOutcome {
	Committed,
	Aborted,
}

/// Completion handle the client blocks on.
///
/// Fires exactly once, with either outcome; a client that gives up
/// waiting observes no intermediate state.
#[derive(Debug, Default)]
pub struct CommitNotice {
	state: Mutex<Option<TrxOutcome>>,
	signal: Condvar,
}

impl CommitNotice {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Records the outcome and wakes every waiter. The first outcome
	/// wins; later calls are ignored.
	pub(crate) fn complete(&self, outcome: TrxOutcome) {
		let mut state = self.state.lock();
		if state.is_none() {
			*state = Some(outcome);
			self.signal.notify_all();
		}
	}

	/// Blocks until the transaction completes.
	pub fn wait(&self) -> TrxOutcome {
		let mut state = self.state.lock();
		loop {
			if let Some(outcome) = *state {
				return outcome;
			}
			self.signal.wait(&mut state);
		}
	}

	/// Blocks up to `timeout`; `None` means still undecided.
	pub fn wait_for(&self, timeout: Duration) -> Option<TrxOutcome> {
		let deadline = Instant::now() + timeout;
		let mut state = self.state.lock();
		while state.is_none() {
			if self.signal.wait_until(&mut state, deadline).timed_out() {
				break;
			}
		}
		*state
	}

	pub fn peek(&self) -> Option<TrxOutcome> {
		*self.state.lock()
	}
}

/// Everything the terminal rendezvous body needs from its surroundings.
pub(crate) struct RvpContext<'a> {
	pub engine: &'a dyn StorageEngine,
	pub flusher: Option<&'a Arc<SrmwQueue<Arc<Rendezvous>>>>,
	pub stats: &'a EnvStats,
}

/// The rendezvous point joining all sibling actions of one transaction.
#[derive(Debug)]
pub struct Rendezvous {
	tx: TxHandle,
	/// Posts outstanding before the terminal body may run.
	remaining: AtomicUsize,
	/// Decision flag; set once, never cleared.
	aborted: AtomicBool,
	/// Participating actions, released to their partitions' commit
	/// queues when the transaction completes.
	actions: Mutex<Vec<Arc<Action>>>,
	/// Last log sequence number, captured at lazy-commit time.
	last_lsn: Mutex<Lsn>,
	notice: Arc<CommitNotice>,
}

impl Rendezvous {
	/// Creates a rendezvous expecting `intra_trx_count` posts, with
	/// room reserved for `total_actions` participating actions.
	pub fn new(tx: TxHandle, intra_trx_count: usize, total_actions: usize) -> Arc<Self> {
		debug_assert!(total_actions >= intra_trx_count);
		Arc::new(Self {
			tx,
			remaining: AtomicUsize::new(intra_trx_count),
			aborted: AtomicBool::new(false),
			actions: Mutex::new(Vec::with_capacity(total_actions)),
			last_lsn: Mutex::new(Lsn::ZERO),
			notice: CommitNotice::new(),
		})
	}

	pub fn tid(&self) -> Tid {
		self.tx.tid
	}

	pub fn tx(&self) -> TxHandle {
		self.tx
	}

	pub fn notice(&self) -> Arc<CommitNotice> {
		Arc::clone(&self.notice)
	}

	pub fn remaining(&self) -> usize {
		self.remaining.load(Ordering::Acquire)
	}

	pub fn last_lsn(&self) -> Lsn {
		*self.last_lsn.lock()
	}

	pub(crate) fn set_last_lsn(&self, lsn: Lsn) {
		*self.last_lsn.lock() = lsn;
	}

	/// Registers a participating action.
	pub fn add_action(&self, action: &Arc<Action>) {
		debug_assert!(
			std::ptr::eq(Arc::as_ptr(action.rvp()), self),
			"action registered with a foreign rendezvous"
		);
		self.actions.lock().push(Arc::clone(action));
	}

	/// Decides abort. Sticky: once aborted, always aborted.
	pub fn mark_abort(&self) {
		self.aborted.store(true, Ordering::Release);
	}

	pub fn is_aborted(&self) -> bool {
		self.aborted.load(Ordering::Acquire)
	}

	/// Counts down one post. Returns true for the last caller, who must
	/// then run the terminal body exactly once.
	pub fn post(&self, is_error: bool) -> bool {
		if is_error {
			self.mark_abort();
		}
		let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prev > 0, "rendezvous posted more times than expected");
		prev == 1
	}

	/// The terminal body. Aborts, or commits and stages the transaction
	/// for group commit; without a flusher the commit is synchronous
	/// and the notifications happen inline.
	pub(crate) fn run(self: &Arc<Self>, ctx: &RvpContext<'_>) -> Result<(), ExecError> {
		let tid = self.tid();
		ctx.engine.attach(&self.tx);

		if self.is_aborted() {
			let result = ctx.engine.abort(&self.tx);
			match &result {
				Ok(()) => tracing::trace!(%tid, "rvp.aborted"),
				Err(err) => tracing::warn!(%tid, %err, "rvp.abort_failed"),
			}
			ctx.stats.bump_aborted();
			self.notify_partitions();
			self.notify_client(TrxOutcome::Aborted);
			return result.map_err(ExecError::from);
		}

		match ctx.flusher {
			Some(to_flush) => match ctx.engine.commit(&self.tx, true) {
				Ok(lsn) => {
					self.set_last_lsn(lsn);
					tracing::trace!(%tid, %lsn, "rvp.lazy_commit");
					to_flush.push(Arc::clone(self), true);
					Ok(())
				}
				Err(err) => self.fail_commit(ctx, err),
			},
			None => match ctx.engine.commit(&self.tx, false) {
				Ok(_) => {
					ctx.stats.bump_committed();
					tracing::trace!(%tid, "rvp.committed");
					self.notify_partitions();
					self.notify_client(TrxOutcome::Committed);
					Ok(())
				}
				Err(err) => self.fail_commit(ctx, err),
			},
		}
	}

	fn fail_commit(&self, ctx: &RvpContext<'_>, err: StorageError) -> Result<(), ExecError> {
		tracing::warn!(tid = %self.tid(), %err, "rvp.commit_failed");
		ctx.stats.bump_aborted();
		if let Err(abort_err) = ctx.engine.abort(&self.tx) {
			tracing::warn!(tid = %self.tid(), %abort_err, "rvp.abort_failed");
		}
		self.notify_partitions();
		self.notify_client(TrxOutcome::Aborted);
		Err(err.into())
	}

	/// Hands every participating action back to its partition's commit
	/// queue so the partition can release the action's locks.
	pub(crate) fn notify_partitions(&self) -> usize {
		let actions = std::mem::take(&mut *self.actions.lock());
		let count = actions.len();
		for action in actions {
			action.notify_own_partition();
		}
		count
	}

	/// Signals the client's completion handle.
	pub(crate) fn notify_client(&self, outcome: TrxOutcome) {
		self.notice.complete(outcome);
	}

	/// Drops the participating actions without notifying partitions.
	/// Shutdown-only: the partitions may already be gone.
	pub(crate) fn discard_actions(&self) {
		self.actions.lock().clear();
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use super::*;

	fn handle(tid: u64) -> TxHandle {
		TxHandle { tid: Tid(tid) }
	}

	#[test]
	fn test_last_post_wins_exactly_once() {
		let rvp = Rendezvous::new(handle(1), 3, 3);
		assert!(!rvp.post(false));
		assert!(!rvp.post(false));
		assert!(rvp.post(false));
		assert_eq!(rvp.remaining(), 0);
		assert!(!rvp.is_aborted());
	}

	#[test]
	fn test_error_post_decides_abort() {
		let rvp = Rendezvous::new(handle(2), 2, 2);
		assert!(!rvp.post(true));
		assert!(rvp.is_aborted());
		assert!(rvp.post(false));
		// The decision is sticky.
		assert!(rvp.is_aborted());
	}

	#[test]
	fn test_notice_delivers_to_concurrent_waiters() {
		let notice = CommitNotice::new();
		let waiters: Vec<_> = (0..3)
			.map(|_| {
				let notice = Arc::clone(&notice);
				thread::spawn(move || notice.wait())
			})
			.collect();

		notice.complete(TrxOutcome::Committed);
		// A second completion is ignored.
		notice.complete(TrxOutcome::Aborted);

		for waiter in waiters {
			assert_eq!(waiter.join().unwrap(), TrxOutcome::Committed);
		}
		assert_eq!(notice.peek(), Some(TrxOutcome::Committed));
	}

	#[test]
	fn test_notice_wait_for_times_out_undecided() {
		let notice = CommitNotice::new();
		assert_eq!(notice.wait_for(Duration::from_millis(10)), None);
	}
}
