//! Key-range routing.
//!
//! A [`RangeMap`] is a sorted vector of `(boundary, partition)` pairs
//! covering the whole key space of one table with non-overlapping
//! `[lo, hi)` ranges. The first boundary is the table's minimum key;
//! the last range is bounded above only by the table's maximum-key
//! sentinel. Lookups are binary searches over the boundaries.
//!
//! Reads may be concurrent; mutation (split, delete, rebuild) happens
//! only while partitions are quiescent, so the map itself carries no
//! lock.

use std::fmt;

use thiserror::Error;

use crate::key::Key;

/// Identifier of a live partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "P{}", self.0)
	}
}

/// Errors from routing lookups and boundary maintenance.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
	#[error("key {0} sorts below the minimum boundary of the table")]
	BelowMinimum(Key),

	#[error("partition {0} is not present in the range map")]
	UnknownPartition(PartitionId),

	#[error("a boundary already exists at key {0}")]
	BoundaryExists(Key),
}

/// One entry of the routing map: the range `[low, high)` owned by a
/// partition. `high` is `None` for the last range, which runs to the
/// maximum-key sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAssignment<'a> {
	pub low: &'a Key,
	pub high: Option<&'a Key>,
	pub partition: PartitionId,
}

/// Total, non-overlapping mapping of a table's key space to partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeMap {
	/// Sorted by boundary key; entry `i` owns `[bounds[i].0, bounds[i+1].0)`.
	bounds: Vec<(Key, PartitionId)>,
	next_id: u32,
}

impl RangeMap {
	/// Builds a map with a single partition owning the whole space
	/// above `min`.
	pub fn whole(min: Key) -> Self {
		Self {
			bounds: vec![(min, PartitionId(0))],
			next_id: 1,
		}
	}

	/// Builds a map that splits `[min, max)` evenly over `parts`
	/// single-field boundaries.
	pub fn even(min: i64, max: i64, parts: usize) -> Self {
		assert!(parts > 0, "a table needs at least one partition");
		assert!(max > min);
		let span = ((max - min) as u64).div_ceil(parts as u64) as i64;
		let bounds = (0..parts)
			.map(|i| (Key::single(min + span * i as i64), PartitionId(i as u32)))
			.collect();
		Self {
			bounds,
			next_id: parts as u32,
		}
	}

	pub fn len(&self) -> usize {
		self.bounds.len()
	}

	pub fn is_empty(&self) -> bool {
		self.bounds.is_empty()
	}

	/// Returns the partition whose range contains `key`.
	pub fn partition_for(&self, key: &Key) -> Result<PartitionId, RangeError> {
		let idx = self.bounds.partition_point(|(bound, _)| bound <= key);
		if idx == 0 {
			return Err(RangeError::BelowMinimum(key.clone()));
		}
		Ok(self.bounds[idx - 1].1)
	}

	/// Ordered iterator over every range assignment.
	pub fn iter(&self) -> impl Iterator<Item = RangeAssignment<'_>> {
		self.bounds.iter().enumerate().map(|(i, (low, partition))| RangeAssignment {
			low,
			high: self.bounds.get(i + 1).map(|(hi, _)| hi),
			partition: *partition,
		})
	}

	/// Ordered partition identifiers.
	pub fn partition_ids(&self) -> impl Iterator<Item = PartitionId> + '_ {
		self.bounds.iter().map(|(_, pid)| *pid)
	}

	pub fn contains(&self, partition: PartitionId) -> bool {
		self.bounds.iter().any(|(_, pid)| *pid == partition)
	}

	/// Range owned by `partition`, if it is live.
	pub fn range_of(&self, partition: PartitionId) -> Option<RangeAssignment<'_>> {
		self.iter().find(|a| a.partition == partition)
	}

	/// Splits the range containing `at` in two; the new partition
	/// inherits the upper portion `[at, old_high)`.
	pub fn split(&mut self, at: Key) -> Result<PartitionId, RangeError> {
		let idx = self.bounds.partition_point(|(bound, _)| bound <= &at);
		if idx == 0 {
			return Err(RangeError::BelowMinimum(at));
		}
		if self.bounds[idx - 1].0 == at {
			return Err(RangeError::BoundaryExists(at));
		}
		let id = PartitionId(self.next_id);
		self.next_id += 1;
		self.bounds.insert(idx, (at, id));
		Ok(id)
	}

	/// Removes `partition`, merging its range into the left neighbor.
	///
	/// Deleting the left-most partition merges right instead: the
	/// second range is widened downward so the map stays a total cover.
	pub fn delete(&mut self, partition: PartitionId) -> Result<(), RangeError> {
		if self.bounds.len() == 1 {
			// The last partition can never be merged away.
			return Err(RangeError::UnknownPartition(partition));
		}
		let idx = self
			.bounds
			.iter()
			.position(|(_, pid)| *pid == partition)
			.ok_or(RangeError::UnknownPartition(partition))?;
		if idx == 0 {
			let (min, _) = self.bounds.remove(0);
			self.bounds[0].0 = min;
		} else {
			self.bounds.remove(idx);
		}
		Ok(())
	}

	/// Replaces the whole boundary set, reassigning partition ids in
	/// boundary order starting at zero. Used when re-synchronizing with
	/// the storage engine's authoritative map.
	pub fn rebuild(&mut self, mut boundaries: Vec<Key>) -> Result<(), RangeError> {
		assert!(!boundaries.is_empty(), "a table needs at least one boundary");
		boundaries.sort();
		boundaries.dedup();
		self.bounds = boundaries
			.into_iter()
			.enumerate()
			.map(|(i, key)| (key, PartitionId(i as u32)))
			.collect();
		self.next_id = self.bounds.len() as u32;
		Ok(())
	}

	/// Boundary keys, in order.
	pub fn boundaries(&self) -> impl Iterator<Item = &Key> {
		self.bounds.iter().map(|(key, _)| key)
	}
}
