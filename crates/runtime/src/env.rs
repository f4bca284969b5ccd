//! The environment façade: lifecycle and routing entry points.
//!
//! An [`Environment`] owns the partitioned tables and the group-commit
//! pair. Startup brings the flusher and notifier up before any
//! partition so no lazy commit can be staged into a void; shutdown is
//! the exact reverse: the flusher drains and stops first, and only
//! then do the partitions stop. The new-run barrier re-synchronizes
//! every table's partitioning with the storage engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;
use tessera_core::Key;

use crate::config::RuntimeConfig;
use crate::error::ExecError;
use crate::flusher::{FlusherStatsSnapshot, GroupCommit, RvpQueue};
use crate::partition::Partition;
use crate::queue::SrmwQueue;
use crate::routing::{PartitionedTable, TableSpec};
use crate::storage::StorageEngine;
use crate::worker::{WorkState, WorkerGate, WorkerStatsSnapshot};

/// Environment-wide transaction counters.
#[derive(Debug, Default)]
pub struct EnvStats {
	committed: AtomicU64,
	aborted: AtomicU64,
}

impl EnvStats {
	pub(crate) fn bump_committed(&self) {
		self.committed.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn bump_aborted(&self) {
		self.aborted.fetch_add(1, Ordering::Relaxed);
	}

	pub fn committed(&self) -> u64 {
		self.committed.load(Ordering::Relaxed)
	}

	pub fn aborted(&self) -> u64 {
		self.aborted.load(Ordering::Relaxed)
	}
}

/// Aggregated statistics for one snapshot call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvSnapshot {
	pub committed: u64,
	pub aborted: u64,
	pub workers: WorkerStatsSnapshot,
	pub flusher: Option<FlusherStatsSnapshot>,
}

/// Container for all partitioned tables of one database.
pub struct Environment {
	engine: Arc<dyn StorageEngine>,
	config: RuntimeConfig,
	tables: Vec<Arc<PartitionedTable>>,
	stats: Arc<EnvStats>,
	/// The shared to-flush channel; present whenever the flusher is
	/// enabled, even before start, so partitions can capture it.
	to_flush: Option<Arc<RvpQueue>>,
	group_commit: Mutex<Option<GroupCommit>>,
	running: AtomicBool,
}

impl Environment {
	/// Builds the environment: the group-commit channel (if enabled)
	/// and one partitioned table per spec. Nothing runs until
	/// [`Environment::start`].
	pub fn new(engine: Arc<dyn StorageEngine>, config: RuntimeConfig, specs: &[TableSpec]) -> Self {
		let stats = Arc::new(EnvStats::default());
		let to_flush = config.enable_flusher.then(|| {
			let gate = WorkerGate::new();
			Arc::new(SrmwQueue::new(gate, WorkState::CommitQueue, 2_000, 0))
		});

		let tables = specs
			.iter()
			.map(|spec| {
				PartitionedTable::new(
					spec,
					Arc::clone(&engine),
					to_flush.clone(),
					Arc::clone(&stats),
					&config,
				)
			})
			.collect();

		Self {
			engine,
			config,
			tables,
			stats,
			to_flush,
			group_commit: Mutex::new(None),
			running: AtomicBool::new(false),
		}
	}

	pub fn engine(&self) -> &Arc<dyn StorageEngine> {
		&self.engine
	}

	pub fn config(&self) -> &RuntimeConfig {
		&self.config
	}

	pub fn stats(&self) -> &Arc<EnvStats> {
		&self.stats
	}

	/// Starts the group-commit pipeline, then every partition.
	pub fn start(&self) -> Result<(), ExecError> {
		if self.running.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		tracing::info!(tables = self.tables.len(), "env.start");

		if let Some(to_flush) = &self.to_flush {
			let mut group_commit = self.group_commit.lock();
			if group_commit.is_none() {
				*group_commit = Some(GroupCommit::spawn(
					Arc::clone(&self.engine),
					&self.config,
					Arc::clone(to_flush),
					Arc::clone(&self.stats),
				));
			}
		}

		for table in &self.tables {
			table.start();
		}
		Ok(())
	}

	/// Deterministic shutdown: flusher and notifier first (draining
	/// their queues and signaling clients), partitions second.
	pub fn stop(&self) {
		if !self.running.swap(false, Ordering::AcqRel) {
			return;
		}
		tracing::info!("env.stop");

		if let Some(group_commit) = self.group_commit.lock().take() {
			group_commit.stop();
		}
		for table in &self.tables {
			table.stop();
		}
	}

	/// The new-run barrier: every table re-reads the engine's range map
	/// and prepares its partitions, on a short-lived helper thread per
	/// table.
	pub fn new_run(&self) -> Result<(), ExecError> {
		tracing::info!("env.new_run");
		thread::scope(|scope| {
			let handles: Vec<_> = self
				.tables
				.iter()
				.map(|table| scope.spawn(move || table.prepare_new_run()))
				.collect();
			for handle in handles {
				match handle.join() {
					Ok(result) => result?,
					Err(panic) => std::panic::resume_unwind(panic),
				}
			}
			Ok(())
		})
	}

	pub fn table(&self, name: &str) -> Result<&Arc<PartitionedTable>, ExecError> {
		self.tables
			.iter()
			.find(|t| t.name() == name)
			.ok_or_else(|| ExecError::UnknownTable(name.to_owned()))
	}

	/// Resolves the partition responsible for `key` in `table`.
	pub fn partition_for(&self, table: &str, key: &Key) -> Result<Arc<Partition>, ExecError> {
		self.table(table)?.partition_for(key)
	}

	/// Aggregates the environment's counters into one snapshot.
	pub fn statistics(&self) -> EnvSnapshot {
		let mut workers = WorkerStatsSnapshot::default();
		for table in &self.tables {
			for partition in table.partitions() {
				workers.merge(&partition.stats());
			}
		}
		EnvSnapshot {
			committed: self.stats.committed(),
			aborted: self.stats.aborted(),
			workers,
			flusher: self.group_commit.lock().as_ref().map(GroupCommit::stats),
		}
	}
}

impl Drop for Environment {
	fn drop(&mut self) {
		self.stop();
	}
}
