//! Execution error taxonomy.

use tessera_core::{Key, LockError, PartitionId, Tid};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised while routing, locking, and executing actions.
///
/// None of these terminate a partition worker: the worker categorizes
/// the error, updates its statistics, makes sure the transaction is
/// detached, and moves on. Fatal errors are restricted to failures in
/// starting or stopping the storage engine itself.
#[derive(Debug, Error)]
pub enum ExecError {
	/// An action's key falls outside its partition's range. Routing is
	/// the client's job, so this is a programming error.
	#[error("key {key} does not belong to partition {partition}")]
	BadPartition { partition: PartitionId, key: Key },

	/// A lock upgrade was rejected.
	#[error(transparent)]
	IncompatibleLocks(#[from] LockError),

	/// The action body aborted after the worker attached to the
	/// transaction.
	#[error("transaction {0} aborted midway through an action")]
	MidwayAbort(Tid),

	/// The coordinating rendezvous was already decided abort when the
	/// action came up for dispatch.
	#[error("transaction {0} was already aborted at dispatch")]
	EarlyAbort(Tid),

	/// Dirty locks were found at the new-run barrier; the collected
	/// transactions must be aborted before work resumes.
	#[error("{0} dirty locks found at the new-run barrier")]
	LockMapDirty(usize),

	/// The storage engine refused to produce a range map.
	#[error("repartition failed")]
	RepartitionFailure(#[source] StorageError),

	/// The named table is not managed by this environment.
	#[error("unknown table {0}")]
	UnknownTable(String),

	/// A routing lookup failed.
	#[error(transparent)]
	Routing(#[from] tessera_core::RangeError),

	#[error(transparent)]
	Storage(#[from] StorageError),
}
