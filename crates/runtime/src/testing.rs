//! In-memory storage engine for tests and examples.
//!
//! [`MockEngine`] hands out monotonically increasing tids and LSNs,
//! tracks the durable horizon, and counts every call so tests can
//! assert on flush coalescing and abort behavior. A lazy commit issues
//! an LSN without advancing the durable horizon; `sync_log` catches the
//! horizon up to everything issued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tessera_core::{Key, Tid};

use crate::storage::{Lsn, StorageEngine, StorageError, TxHandle};

/// Bytes of log attributed to each commit record.
const RECORD_SIZE: u64 = 100;

/// A scriptable in-memory storage engine.
#[derive(Debug, Default)]
pub struct MockEngine {
	next_tid: AtomicU64,
	/// Next log offset to hand out.
	log_tail: AtomicU64,
	durable: Mutex<Lsn>,
	range_maps: Mutex<FxHashMap<String, Vec<Key>>>,
	fail_next_commit: AtomicBool,
	fail_syncs: AtomicBool,
	begins: AtomicU64,
	commits: AtomicU64,
	lazy_commits: AtomicU64,
	aborts: AtomicU64,
	syncs: AtomicU64,
	attaches: AtomicU64,
	detaches: AtomicU64,
}

impl MockEngine {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Registers the authoritative boundaries returned for `table`.
	pub fn set_range_map(&self, table: &str, boundaries: Vec<Key>) {
		self.range_maps.lock().insert(table.to_owned(), boundaries);
	}

	/// Makes the next commit call fail once.
	pub fn fail_next_commit(&self) {
		self.fail_next_commit.store(true, Ordering::SeqCst);
	}

	/// Makes every `sync_log` call fail until cleared; the durable
	/// horizon stops advancing.
	pub fn set_sync_failure(&self, fail: bool) {
		self.fail_syncs.store(fail, Ordering::SeqCst);
	}

	pub fn sync_count(&self) -> u64 {
		self.syncs.load(Ordering::SeqCst)
	}

	pub fn commit_count(&self) -> u64 {
		self.commits.load(Ordering::SeqCst)
	}

	pub fn lazy_commit_count(&self) -> u64 {
		self.lazy_commits.load(Ordering::SeqCst)
	}

	pub fn abort_count(&self) -> u64 {
		self.aborts.load(Ordering::SeqCst)
	}

	pub fn begin_count(&self) -> u64 {
		self.begins.load(Ordering::SeqCst)
	}

	/// Attach/detach calls seen so far; balanced when everything that
	/// bound itself to a transaction unbound again.
	pub fn attach_balance(&self) -> (u64, u64) {
		(self.attaches.load(Ordering::SeqCst), self.detaches.load(Ordering::SeqCst))
	}
}

impl StorageEngine for MockEngine {
	fn begin(&self) -> Result<TxHandle, StorageError> {
		self.begins.fetch_add(1, Ordering::SeqCst);
		let tid = Tid(self.next_tid.fetch_add(1, Ordering::SeqCst) + 1);
		Ok(TxHandle { tid })
	}

	fn attach(&self, _tx: &TxHandle) {
		self.attaches.fetch_add(1, Ordering::SeqCst);
	}

	fn detach(&self, _tx: &TxHandle) {
		self.detaches.fetch_add(1, Ordering::SeqCst);
	}

	fn commit(&self, tx: &TxHandle, lazy: bool) -> Result<Lsn, StorageError> {
		if self.fail_next_commit.swap(false, Ordering::SeqCst) {
			return Err(StorageError::Commit {
				tid: tx.tid,
				reason: "forced failure".into(),
			});
		}
		let start = self.log_tail.fetch_add(RECORD_SIZE, Ordering::SeqCst);
		let lsn = Lsn::new(0, start);
		self.commits.fetch_add(1, Ordering::SeqCst);
		if lazy {
			self.lazy_commits.fetch_add(1, Ordering::SeqCst);
		} else {
			let mut durable = self.durable.lock();
			*durable = (*durable).max(Lsn::new(0, start + RECORD_SIZE));
		}
		Ok(lsn)
	}

	fn abort(&self, _tx: &TxHandle) -> Result<(), StorageError> {
		self.aborts.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	fn durable_lsn(&self) -> Lsn {
		*self.durable.lock()
	}

	fn sync_log(&self) -> Result<(), StorageError> {
		self.syncs.fetch_add(1, Ordering::SeqCst);
		if self.fail_syncs.load(Ordering::SeqCst) {
			return Err(StorageError::Sync("forced sync failure".into()));
		}
		let horizon = Lsn::new(0, self.log_tail.load(Ordering::SeqCst));
		let mut durable = self.durable.lock();
		*durable = (*durable).max(horizon);
		Ok(())
	}

	fn range_map(&self, table: &str) -> Result<Vec<Key>, StorageError> {
		self.range_maps
			.lock()
			.get(table)
			.cloned()
			.ok_or_else(|| StorageError::NoRangeMap(table.to_owned()))
	}
}
