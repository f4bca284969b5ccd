//! The storage-engine collaborator interface.
//!
//! The execution core never touches pages, records, or the log buffer
//! directly. It drives the engine through this trait: transactions are
//! begun and bound to threads here, commits may be lazy (returning the
//! transaction's last log sequence number without waiting for
//! durability, which is what makes group commit possible), and the
//! routing layer reads the engine's authoritative range map when
//! re-synchronizing partitions.

use std::fmt;

use tessera_core::{Key, Tid};
use thiserror::Error;

/// A log sequence number: log file number plus byte offset within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
	pub file: u32,
	pub offset: u64,
}

impl Lsn {
	pub const ZERO: Lsn = Lsn { file: 0, offset: 0 };

	pub fn new(file: u32, offset: u64) -> Self {
		Self { file, offset }
	}
}

impl fmt::Display for Lsn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.file, self.offset)
	}
}

/// Handle to an open transaction.
///
/// The engine keys all per-transaction state by [`Tid`]; the handle is
/// freely copyable and threads attach and detach themselves around the
/// storage calls they make on the transaction's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxHandle {
	pub tid: Tid,
}

/// Failures reported by the storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("begin failed: {0}")]
	Begin(String),

	#[error("commit of {tid} failed: {reason}")]
	Commit { tid: Tid, reason: String },

	#[error("abort of {tid} failed: {reason}")]
	Abort { tid: Tid, reason: String },

	#[error("log sync failed: {0}")]
	Sync(String),

	#[error("no range map for table {0}")]
	NoRangeMap(String),
}

/// Everything the execution core asks of the storage engine.
///
/// `commit` with `lazy` set must return the transaction's last LSN
/// without waiting for the log flush; committing or aborting ends the
/// calling thread's attachment to the transaction.
pub trait StorageEngine: Send + Sync + 'static {
	/// Opens a transaction and assigns it a fresh identifier.
	fn begin(&self) -> Result<TxHandle, StorageError>;

	/// Binds the calling thread to the transaction.
	fn attach(&self, tx: &TxHandle);

	/// Unbinds the calling thread from the transaction.
	fn detach(&self, tx: &TxHandle);

	/// Commits; in lazy mode returns the last LSN without waiting for
	/// durability.
	fn commit(&self, tx: &TxHandle, lazy: bool) -> Result<Lsn, StorageError>;

	fn abort(&self, tx: &TxHandle) -> Result<(), StorageError>;

	/// Largest LSN the engine guarantees crash-recoverable.
	fn durable_lsn(&self) -> Lsn;

	/// Flushes the log up to the current end; blocks until durable.
	fn sync_log(&self) -> Result<(), StorageError>;

	/// Authoritative partitioning boundaries for `table`.
	fn range_map(&self, table: &str) -> Result<Vec<Key>, StorageError>;
}
