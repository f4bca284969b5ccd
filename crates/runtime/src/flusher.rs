//! Staged group commit: the flusher and notifier threads.
//!
//! Workers that execute a terminal rendezvous commit lazily and hand
//! the transaction here instead of blocking on the log flush. The
//! flusher watches the to-flush queue and the engine's durable LSN,
//! batching flush decisions: a group-size threshold, a log-bytes
//! threshold, or a wall-clock interval forces a sync; otherwise a lazy
//! sync is issued and the flusher naps one interval. Transactions whose
//! last LSN the durable LSN has passed move on to the notifier, which
//! feeds the partitions' commit queues and signals the clients — in
//! queue order, which matches lock-release order per partition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::env::EnvStats;
use crate::queue::SrmwQueue;
use crate::rvp::{Rendezvous, TrxOutcome};
use crate::storage::{Lsn, StorageEngine};
use crate::worker::{WorkState, WorkerControl, WorkerGate};

/// The flusher's to-flush channel, shared with every partition.
pub(crate) type RvpQueue = SrmwQueue<Arc<Rendezvous>>;

/// Counters kept by the flusher thread.
#[derive(Debug, Default)]
pub struct FlusherStats {
	served: AtomicU64,
	flushes: AtomicU64,
	log_bytes: AtomicU64,
	already_flushed: AtomicU64,
	grouped: AtomicU64,
	trig_by_xcts: AtomicU64,
	trig_by_size: AtomicU64,
	trig_by_timeout: AtomicU64,
}

impl FlusherStats {
	pub fn snapshot(&self) -> FlusherStatsSnapshot {
		FlusherStatsSnapshot {
			served: self.served.load(Ordering::Relaxed),
			flushes: self.flushes.load(Ordering::Relaxed),
			log_bytes: self.log_bytes.load(Ordering::Relaxed),
			already_flushed: self.already_flushed.load(Ordering::Relaxed),
			grouped: self.grouped.load(Ordering::Relaxed),
			trig_by_xcts: self.trig_by_xcts.load(Ordering::Relaxed),
			trig_by_size: self.trig_by_size.load(Ordering::Relaxed),
			trig_by_timeout: self.trig_by_timeout.load(Ordering::Relaxed),
		}
	}
}

/// Point-in-time copy of the flusher counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlusherStatsSnapshot {
	/// Transactions that passed through the to-flush queue.
	pub served: u64,
	/// Forced log syncs.
	pub flushes: u64,
	/// Estimated bytes covered by forced syncs.
	pub log_bytes: u64,
	/// Transactions already durable on arrival.
	pub already_flushed: u64,
	/// Transactions that waited for a group flush.
	pub grouped: u64,
	pub trig_by_xcts: u64,
	pub trig_by_size: u64,
	pub trig_by_timeout: u64,
}

/// Rough byte distance between two LSNs, given the log-partition
/// extent size.
fn log_diff(head: Lsn, tail: Lsn, partition_size: u64) -> i64 {
	if head.file == tail.file {
		return head.offset as i64 - tail.offset as i64;
	}
	debug_assert!(head.file > tail.file);
	let files = (head.file - tail.file) as i64;
	files * partition_size as i64 + head.offset as i64 - tail.offset as i64
}

/// The running group-commit pair. Dropped via [`GroupCommit::stop`],
/// which drains both stages deterministically before the partitions
/// are allowed to stop.
pub(crate) struct GroupCommit {
	flusher_gate: Arc<WorkerGate>,
	notifier_gate: Arc<WorkerGate>,
	flusher: Option<JoinHandle<()>>,
	notifier: Option<JoinHandle<()>>,
	stats: Arc<FlusherStats>,
}

impl GroupCommit {
	/// Spawns the flusher and notifier threads around the shared
	/// to-flush channel.
	pub fn spawn(
		engine: Arc<dyn StorageEngine>,
		config: &RuntimeConfig,
		to_flush: Arc<RvpQueue>,
		env_stats: Arc<EnvStats>,
	) -> Self {
		let stats = Arc::new(FlusherStats::default());

		// Gates go active before their threads exist: the loops bail
		// out on any non-active control word.
		let notifier_gate = WorkerGate::new();
		let to_notify = Arc::new(SrmwQueue::new(
			Arc::clone(&notifier_gate),
			WorkState::CommitQueue,
			0,
			0,
		));
		notifier_gate.start();
		let notifier = {
			let queue = Arc::clone(&to_notify);
			let env_stats = Arc::clone(&env_stats);
			let gate = Arc::clone(&notifier_gate);
			std::thread::Builder::new()
				.name("notifier".into())
				.spawn(move || notifier_main(queue, env_stats, gate))
				.unwrap_or_else(|err| panic!("failed to spawn notifier: {err}"))
		};

		let flusher_gate = Arc::clone(to_flush.gate());
		flusher_gate.reset();
		flusher_gate.start();
		let flusher = {
			let engine = Arc::clone(&engine);
			let config = config.clone();
			let stats = Arc::clone(&stats);
			let gate = Arc::clone(&flusher_gate);
			std::thread::Builder::new()
				.name("flusher".into())
				.spawn(move || flusher_main(engine, config, stats, to_flush, to_notify, gate))
				.unwrap_or_else(|err| panic!("failed to spawn flusher: {err}"))
		};
		tracing::info!("flusher.start");

		Self {
			flusher_gate,
			notifier_gate,
			flusher: Some(flusher),
			notifier: Some(notifier),
			stats,
		}
	}

	pub fn stats(&self) -> FlusherStatsSnapshot {
		self.stats.snapshot()
	}

	/// Stops the pipeline: the flusher first, draining its queues and
	/// notifying their clients directly, then the notifier. Neither
	/// touches a partition after this returns.
	pub fn stop(mut self) {
		self.flusher_gate.stop();
		if let Some(handle) = self.flusher.take() {
			if handle.join().is_err() {
				tracing::error!("flusher.panicked");
			}
		}
		self.notifier_gate.stop();
		if let Some(handle) = self.notifier.take() {
			if handle.join().is_err() {
				tracing::error!("notifier.panicked");
			}
		}
		tracing::info!("flusher.stop");
	}
}

fn flusher_main(
	engine: Arc<dyn StorageEngine>,
	config: RuntimeConfig,
	stats: Arc<FlusherStats>,
	to_flush: Arc<RvpQueue>,
	to_notify: Arc<RvpQueue>,
	gate: Arc<WorkerGate>,
) {
	let partition_size = config.log_partition_size();
	// The flushing stage is flusher-private; it reuses the flusher's
	// own gate but is only ever drained non-blockingly.
	let flushing = SrmwQueue::new(Arc::clone(&gate), WorkState::CommitQueue, 0, 0);

	let mut waiting = 0usize;
	let mut sleep_next = false;
	let mut deadline = Instant::now() + config.max_flush_interval;

	while gate.control() == WorkerControl::Active {
		gate.set_work_state(WorkState::Loop);

		let durable = engine.durable_lsn();
		let mut max_lsn = durable;
		check_waiting(
			&config,
			&stats,
			&to_flush,
			&flushing,
			&to_notify,
			durable,
			&mut max_lsn,
			&mut waiting,
			&mut sleep_next,
		);
		if gate.control() != WorkerControl::Active {
			break;
		}

		let mut should_flush = false;
		let mut log_waiting = 0i64;
		if waiting >= config.max_group_xcts {
			should_flush = true;
			stats.trig_by_xcts.fetch_add(1, Ordering::Relaxed);
		} else {
			log_waiting = log_diff(max_lsn, durable, partition_size);
			if log_waiting >= config.max_log_bytes as i64 {
				should_flush = true;
				stats.trig_by_size.fetch_add(1, Ordering::Relaxed);
			} else if Instant::now() >= deadline {
				if waiting > 0 {
					should_flush = true;
					stats.trig_by_timeout.fetch_add(1, Ordering::Relaxed);
				}
				deadline = Instant::now() + config.max_flush_interval;
			} else {
				// Not enough to force a group flush yet: issue a lazy
				// sync for whatever is pending and nap one interval.
				if waiting > 0 {
					if let Err(err) = engine.sync_log() {
						tracing::warn!(%err, "flusher.lazy_sync_failed");
					}
				}
				sleep_next = true;
			}
		}

		if gate.control() != WorkerControl::Active {
			break;
		}

		if should_flush {
			stats.flushes.fetch_add(1, Ordering::Relaxed);
			stats.grouped.fetch_add(waiting as u64, Ordering::Relaxed);
			stats.log_bytes.fetch_add(log_waiting.max(0) as u64, Ordering::Relaxed);
			tracing::trace!(waiting, log_waiting, "flusher.sync");
			if let Err(err) = engine.sync_log() {
				tracing::warn!(%err, "flusher.sync_failed");
			}
			waiting = 0;
			deadline = Instant::now() + config.max_flush_interval;
		}

		// Everyone on the flushing stage whose LSN the durable horizon
		// passed can go to the notifier.
		let durable = engine.durable_lsn();
		move_from_flushing(&flushing, &to_notify, durable);
	}

	// Shutdown drain: one last sync, then deliver outcomes directly;
	// the partitions may already be gone. A client may only hear
	// `Committed` once the durable horizon has passed the transaction's
	// last LSN, so whatever the log still refuses to cover is reported
	// aborted instead.
	let staged: Vec<_> = flushing.drain_all().into_iter().chain(to_flush.drain_all()).collect();
	if !staged.is_empty() {
		if let Err(err) = engine.sync_log() {
			tracing::warn!(%err, "flusher.final_sync_failed");
		}
	}
	let durable = engine.durable_lsn();
	let mut committed = 0usize;
	let mut aborted = 0usize;
	for rvp in staged {
		rvp.discard_actions();
		if rvp.last_lsn() < durable {
			rvp.notify_client(TrxOutcome::Committed);
			committed += 1;
		} else {
			tracing::warn!(tid = %rvp.tid(), last = %rvp.last_lsn(), %durable, "flusher.not_durable_at_stop");
			rvp.mark_abort();
			rvp.notify_client(TrxOutcome::Aborted);
			aborted += 1;
		}
	}
	if committed > 0 || aborted > 0 {
		tracing::info!(committed, aborted, "flusher.drained_at_stop");
	}
	gate.set_work_state(WorkState::Finished);
}

/// Drains the to-flush queue: already-durable transactions go straight
/// to the notifier, the rest join the flushing stage.
#[allow(clippy::too_many_arguments)]
fn check_waiting(
	config: &RuntimeConfig,
	stats: &FlusherStats,
	to_flush: &RvpQueue,
	flushing: &RvpQueue,
	to_notify: &RvpQueue,
	durable: Lsn,
	max_lsn: &mut Lsn,
	waiting: &mut usize,
	sleep_next: &mut bool,
) {
	loop {
		let has_input = !to_flush.is_empty();
		if !has_input && !*sleep_next {
			break;
		}
		let popped = if has_input {
			to_flush.try_pop()
		} else {
			to_flush.pop_wait_for(config.max_flush_interval)
		};
		*sleep_next = false;
		let Some(rvp) = popped else {
			break;
		};
		stats.served.fetch_add(1, Ordering::Relaxed);

		let last = rvp.last_lsn();
		if durable > last {
			tracing::trace!(tid = %rvp.tid(), %last, %durable, "flusher.already_durable");
			stats.already_flushed.fetch_add(1, Ordering::Relaxed);
			to_notify.push(rvp, true);
		} else {
			*max_lsn = (*max_lsn).max(last);
			flushing.push(rvp, false);
			*waiting += 1;
		}
	}
}

/// Moves every durable transaction from the flushing stage to the
/// notifier, preserving arrival order for the rest.
fn move_from_flushing(flushing: &RvpQueue, to_notify: &RvpQueue, durable: Lsn) {
	for rvp in flushing.drain_all() {
		if rvp.last_lsn() < durable {
			to_notify.push(rvp, true);
		} else {
			flushing.push(rvp, false);
		}
	}
}

/// The notifier loop: per durable transaction, bump the committed
/// count, feed every participating partition's commit queue, and
/// signal the client.
fn notifier_main(to_notify: Arc<RvpQueue>, env_stats: Arc<EnvStats>, gate: Arc<WorkerGate>) {
	while gate.control() == WorkerControl::Active {
		gate.set_work_state(WorkState::Loop);
		let Some(rvp) = to_notify.pop_wait() else {
			continue;
		};
		tracing::trace!(tid = %rvp.tid(), "notifier.deliver");
		env_stats.bump_committed();
		rvp.notify_partitions();
		rvp.notify_client(TrxOutcome::Committed);
	}

	// Shutdown drain: clients still get their outcome, partitions are
	// left alone.
	let mut after_stop = 0usize;
	for rvp in to_notify.drain_all() {
		env_stats.bump_committed();
		rvp.discard_actions();
		rvp.notify_client(TrxOutcome::Committed);
		after_stop += 1;
	}
	if after_stop > 0 {
		tracing::info!(after_stop, "notifier.drained_at_stop");
	}
	gate.set_work_state(WorkState::Finished);
}
