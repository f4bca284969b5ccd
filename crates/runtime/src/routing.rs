//! Per-table routing: live partitions behind a range map.
//!
//! Clients resolve keys to partitions concurrently through a read
//! lock; boundary mutation (split, delete, repartition) happens only
//! during administrative windows while the workers are quiescent.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tessera_core::{Key, PartitionId, RangeMap};

use crate::config::RuntimeConfig;
use crate::env::EnvStats;
use crate::error::ExecError;
use crate::partition::{KeyRange, Partition};
use crate::queue::SrmwQueue;
use crate::rvp::Rendezvous;
use crate::storage::StorageEngine;

/// Construction parameters of one partitioned table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
	pub name: String,
	/// Lower bound of the primary-key space (single-field keys).
	pub min_key: i64,
	/// Upper bound used to pre-split the space evenly.
	pub max_key: i64,
	pub partitions: usize,
}

impl TableSpec {
	pub fn new(name: impl Into<String>, min_key: i64, max_key: i64, partitions: usize) -> Self {
		Self {
			name: name.into(),
			min_key,
			max_key,
			partitions,
		}
	}
}

/// A table represented as a set of range partitions.
pub struct PartitionedTable {
	name: String,
	engine: Arc<dyn StorageEngine>,
	flusher: Option<Arc<SrmwQueue<Arc<Rendezvous>>>>,
	env_stats: Arc<EnvStats>,
	config: RuntimeConfig,
	ranges: RwLock<RangeMap>,
	partitions: RwLock<FxHashMap<PartitionId, Arc<Partition>>>,
	next_cpu: AtomicUsize,
}

impl PartitionedTable {
	pub(crate) fn new(
		spec: &TableSpec,
		engine: Arc<dyn StorageEngine>,
		flusher: Option<Arc<SrmwQueue<Arc<Rendezvous>>>>,
		env_stats: Arc<EnvStats>,
		config: &RuntimeConfig,
	) -> Arc<Self> {
		let table = Arc::new(Self {
			name: spec.name.clone(),
			engine,
			flusher,
			env_stats,
			config: config.clone(),
			ranges: RwLock::new(RangeMap::even(spec.min_key, spec.max_key, spec.partitions)),
			partitions: RwLock::new(FxHashMap::default()),
			next_cpu: AtomicUsize::new(0),
		});
		table.populate_partitions();
		table
	}

	fn populate_partitions(&self) {
		let ranges = self.ranges.read();
		let mut partitions = self.partitions.write();
		for assignment in ranges.iter() {
			let range = KeyRange {
				low: assignment.low.clone(),
				high: assignment.high.cloned(),
			};
			let partition = self.build_partition(assignment.partition, range);
			partitions.insert(assignment.partition, partition);
		}
	}

	fn build_partition(&self, id: PartitionId, range: KeyRange) -> Arc<Partition> {
		let cpu = self.next_cpu.fetch_add(1, Ordering::Relaxed);
		Partition::new(
			id,
			&self.name,
			range,
			Arc::clone(&self.engine),
			self.flusher.clone(),
			Arc::clone(&self.env_stats),
			&self.config,
			Some(cpu),
		)
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Number of live partitions.
	pub fn partition_count(&self) -> usize {
		self.partitions.read().len()
	}

	/// Resolves a key to its live partition.
	pub fn partition_for(&self, key: &Key) -> Result<Arc<Partition>, ExecError> {
		let id = self.ranges.read().partition_for(key)?;
		let partitions = self.partitions.read();
		partitions
			.get(&id)
			.cloned()
			.ok_or(ExecError::Routing(tessera_core::RangeError::UnknownPartition(id)))
	}

	/// Live partitions in range order.
	pub fn partitions(&self) -> Vec<Arc<Partition>> {
		let ranges = self.ranges.read();
		let partitions = self.partitions.read();
		ranges
			.partition_ids()
			.filter_map(|id| partitions.get(&id).cloned())
			.collect()
	}

	pub(crate) fn start(&self) {
		for partition in self.partitions() {
			partition.start();
		}
	}

	pub(crate) fn stop(&self) {
		for partition in self.partitions() {
			partition.stop();
		}
	}

	/// Splits the range containing `at`; the new partition inherits the
	/// upper portion and starts immediately. The parent keeps executing
	/// whatever was already routed to it.
	pub fn split(&self, at: Key) -> Result<PartitionId, ExecError> {
		let mut ranges = self.ranges.write();
		let parent_id = ranges.partition_for(&at)?;
		let new_id = ranges.split(at.clone())?;

		let mut partitions = self.partitions.write();
		if let Some(parent) = partitions.get(&parent_id).cloned() {
			let mut parent_range = parent.range();
			let new_range = KeyRange {
				low: at,
				high: parent_range.high.take(),
			};
			parent_range.high = Some(new_range.low.clone());
			parent.inner().set_range(parent_range);

			let partition = self.build_partition(new_id, new_range);
			partition.start();
			partitions.insert(new_id, partition);
		}
		tracing::info!(table = %self.name, parent = %parent_id, new = %new_id, "routing.split");
		Ok(new_id)
	}

	/// Deletes a partition, merging its range into the left neighbor.
	/// The partition is stopped before the boundary is removed.
	pub fn delete_partition(&self, id: PartitionId) -> Result<(), ExecError> {
		let removed = {
			let partitions = self.partitions.read();
			partitions
				.get(&id)
				.cloned()
				.ok_or(ExecError::Routing(tessera_core::RangeError::UnknownPartition(id)))?
		};
		removed.stop();

		let mut ranges = self.ranges.write();
		ranges.delete(id)?;
		self.partitions.write().remove(&id);

		// Widen the ranges of the survivors to match the new map.
		let partitions = self.partitions.read();
		for assignment in ranges.iter() {
			if let Some(partition) = partitions.get(&assignment.partition) {
				partition.inner().set_range(KeyRange {
					low: assignment.low.clone(),
					high: assignment.high.cloned(),
				});
			}
		}
		tracing::info!(table = %self.name, partition = %id, "routing.delete_partition");
		Ok(())
	}

	/// The new-run barrier for this table: re-synchronize partitioning
	/// with the storage engine, then prepare every partition.
	pub(crate) fn prepare_new_run(&self) -> Result<(), ExecError> {
		self.repartition()?;
		for partition in self.partitions() {
			partition.prepare_new_run()?;
		}
		Ok(())
	}

	/// Reads the engine's authoritative range map and reconciles the
	/// live partitions with it: unchanged slots are rebound, surplus
	/// partitions are stopped, missing ones are created.
	pub(crate) fn repartition(&self) -> Result<(), ExecError> {
		let mut boundaries = self
			.engine
			.range_map(&self.name)
			.map_err(ExecError::RepartitionFailure)?;
		boundaries.sort();
		boundaries.dedup();

		let mut ranges = self.ranges.write();
		let current: Vec<Key> = ranges.boundaries().cloned().collect();
		if boundaries == current {
			tracing::debug!(table = %self.name, "routing.repartition_unchanged");
			return Ok(());
		}

		let mut partitions = self.partitions.write();
		let old_order: Vec<Arc<Partition>> = ranges
			.partition_ids()
			.filter_map(|id| partitions.remove(&id))
			.collect();
		partitions.clear();

		ranges.rebuild(boundaries)?;

		let mut rebound = 0usize;
		let mut created = 0usize;
		for (slot, assignment) in ranges.iter().enumerate() {
			let range = KeyRange {
				low: assignment.low.clone(),
				high: assignment.high.cloned(),
			};
			match old_order.get(slot) {
				Some(existing) => {
					existing.inner().set_id(assignment.partition);
					existing.inner().set_range(range);
					partitions.insert(assignment.partition, Arc::clone(existing));
					rebound += 1;
				}
				None => {
					let partition = self.build_partition(assignment.partition, range);
					partition.start();
					partitions.insert(assignment.partition, partition);
					created += 1;
				}
			}
		}

		let mut stopped = 0usize;
		for surplus in old_order.iter().skip(ranges.len()) {
			surplus.stop();
			stopped += 1;
		}

		tracing::info!(
			table = %self.name,
			rebound,
			created,
			stopped,
			"routing.repartitioned"
		);
		Ok(())
	}
}
