#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_runtime::{ActionBody, ExecError, Key, KeySet, RuntimeConfig, StorageEngine, TxHandle};

/// Configuration tuned for fast tests: workers sleep quickly and the
/// flusher wakes often.
pub fn quick_config() -> RuntimeConfig {
	RuntimeConfig {
		worker_spin_loops: 10,
		max_flush_interval: Duration::from_millis(2),
		..RuntimeConfig::default()
	}
}

/// Spins until `cond` holds, panicking after `timeout`.
pub fn wait_until(timeout: Duration, what: &str, cond: impl Fn() -> bool) {
	let deadline = Instant::now() + timeout;
	while !cond() {
		assert!(Instant::now() < deadline, "timed out waiting for {what}");
		std::thread::sleep(Duration::from_millis(1));
	}
}

/// A scriptable action body: records execution, optionally bumps a
/// shared counter, appends its tid to a shared log, or fails midway.
pub struct TestBody {
	keys: KeySet,
	counter: Option<Arc<AtomicU64>>,
	log: Option<Arc<Mutex<Vec<u64>>>>,
	fail: bool,
	executed: Arc<AtomicBool>,
}

impl TestBody {
	pub fn point(key: Key) -> Self {
		Self {
			keys: KeySet::Point(key),
			counter: None,
			log: None,
			fail: false,
			executed: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn range(keys: Vec<Key>) -> Self {
		Self {
			keys: KeySet::Range(keys),
			..Self::point(Key::new())
		}
	}

	pub fn counting(mut self, counter: &Arc<AtomicU64>) -> Self {
		self.counter = Some(Arc::clone(counter));
		self
	}

	pub fn logging(mut self, log: &Arc<Mutex<Vec<u64>>>) -> Self {
		self.log = Some(Arc::clone(log));
		self
	}

	pub fn failing(mut self) -> Self {
		self.fail = true;
		self
	}

	/// Handle that observes whether the body ever ran.
	pub fn executed_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.executed)
	}
}

impl ActionBody for TestBody {
	fn keys(&mut self) -> KeySet {
		self.keys.clone()
	}

	fn execute(&mut self, _engine: &dyn StorageEngine, tx: &TxHandle) -> Result<(), ExecError> {
		self.executed.store(true, Ordering::SeqCst);
		if let Some(counter) = &self.counter {
			counter.fetch_add(1, Ordering::SeqCst);
		}
		if let Some(log) = &self.log {
			log.lock().push(tx.tid.0);
		}
		if self.fail {
			return Err(ExecError::MidwayAbort(tx.tid));
		}
		Ok(())
	}
}
