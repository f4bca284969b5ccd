//! Runtime configuration.

use std::time::Duration;

/// Tuning knobs for partitions, workers, and the group-commit pipeline.
///
/// Every field has a workable default; construct with struct-update
/// syntax for overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
	/// Standby workers parked per partition, beyond the primary.
	pub workers_per_partition: usize,
	/// Bind workers to the partition's processor hint.
	pub cpu_binding: bool,
	/// Input-queue enqueues tolerated before a forced wake.
	pub input_queue_wake_threshold: usize,
	/// Commit-queue enqueues tolerated before a forced wake.
	pub commit_queue_wake_threshold: usize,
	/// Spin iterations before a worker sleeps on its condition variable.
	pub worker_spin_loops: usize,
	/// Stage commits through the flusher/notifier pair.
	pub enable_flusher: bool,
	/// Flush when this many transactions are in the unflushed group.
	pub max_group_xcts: usize,
	/// Flush when this many log bytes are estimated unflushed.
	pub max_log_bytes: u64,
	/// Flush when this much time passed since the last flush.
	pub max_flush_interval: Duration,
	/// Reset a partition's lock map at the new-run barrier only once it
	/// holds at least this many keys.
	pub min_keys_for_lockmap_reset: usize,
	/// Engine log-buffer size, used to estimate log-partition extents.
	pub log_buffer_size: u64,
	/// Engine log-segment size, used to estimate log-partition extents.
	pub log_segment_size: u64,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		Self {
			workers_per_partition: 0,
			cpu_binding: false,
			input_queue_wake_threshold: 16,
			commit_queue_wake_threshold: 16,
			worker_spin_loops: 200,
			enable_flusher: true,
			max_group_xcts: 64,
			max_log_bytes: 512 * 1024,
			max_flush_interval: Duration::from_millis(5),
			min_keys_for_lockmap_reset: 4_000,
			log_buffer_size: 8 * 1024 * 1024,
			log_segment_size: 128 * 8_192,
		}
	}
}

impl RuntimeConfig {
	/// Size of one log-partition extent: an eighth of the log buffer,
	/// rounded up to a whole segment. Feeds the flusher's log-byte
	/// distance estimate.
	pub fn log_partition_size(&self) -> u64 {
		let eighth = self.log_buffer_size / 8;
		eighth.div_ceil(self.log_segment_size) * self.log_segment_size
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_log_partition_size_rounds_up_to_a_segment() {
		let config = RuntimeConfig {
			log_buffer_size: 10 * 1024 * 1024,
			log_segment_size: 1024 * 1024,
			..RuntimeConfig::default()
		};
		// 10 MiB / 8 = 1.25 MiB, rounded up to two whole segments.
		assert_eq!(config.log_partition_size(), 2 * 1024 * 1024);
	}
}
