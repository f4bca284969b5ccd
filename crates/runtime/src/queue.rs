//! Single-reader/multi-writer queues.
//!
//! The queue between enqueuing threads and a partition worker is a
//! double-buffered pair of vectors: writers append to one side under a
//! short lock, the single reader swaps the buffers in O(1) and then
//! consumes its side without contention. Pushes upgrade the owning
//! worker's working state before any signal, so the worker can never
//! decide to sleep after missing a wake-up; batches below the wake
//! threshold ride along with whatever wakes the worker next.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::worker::{WorkState, WorkerControl, WorkerGate};

/// A double-buffered SRMW queue bound to one worker gate.
#[derive(Debug)]
pub(crate) struct SrmwQueue<T> {
	/// Writer side; multiple producers append under the lock.
	writers: Mutex<Vec<T>>,
	/// Reader side; only the owning worker touches it.
	readers: Mutex<VecDeque<T>>,
	/// False as soon as a writer pushed, true once the reader swapped.
	empty: AtomicBool,
	gate: Arc<WorkerGate>,
	/// Working state this queue signals on push.
	role: WorkState,
	/// Spin iterations before the reader beds down on the condvar.
	spin_loops: usize,
	/// Pushes tolerated before an unconditional wake.
	wake_threshold: usize,
}

impl<T> SrmwQueue<T> {
	pub fn new(gate: Arc<WorkerGate>, role: WorkState, spin_loops: usize, wake_threshold: usize) -> Self {
		Self {
			writers: Mutex::new(Vec::new()),
			readers: Mutex::new(VecDeque::new()),
			empty: AtomicBool::new(true),
			gate,
			role,
			spin_loops,
			wake_threshold,
		}
	}

	pub fn gate(&self) -> &Arc<WorkerGate> {
		&self.gate
	}

	/// Appends an item. `wake` forces a worker signal; otherwise the
	/// signal is deferred until the writer side crosses the wake
	/// threshold (a threshold of zero always signals).
	pub fn push(&self, item: T, wake: bool) {
		let pending = {
			let mut writers = self.writers.lock();
			writers.push(item);
			self.empty.store(false, Ordering::SeqCst);
			writers.len()
		};
		if wake || pending >= self.wake_threshold {
			self.gate.set_work_state(self.role);
		}
	}

	/// Reader-side emptiness check, cheap and slightly stale.
	pub fn is_empty(&self) -> bool {
		self.readers.lock().is_empty() && self.empty.load(Ordering::SeqCst)
	}

	/// The expensive check: locks both sides.
	pub fn is_really_empty(&self) -> bool {
		let readers = self.readers.lock();
		let writers = self.writers.lock();
		readers.is_empty() && writers.is_empty()
	}

	/// Pops without blocking. Only the owning worker may call this.
	pub fn try_pop(&self) -> Option<T> {
		if let Some(item) = self.readers.lock().pop_front() {
			return Some(item);
		}
		if !self.swap_in() {
			return None;
		}
		self.readers.lock().pop_front()
	}

	/// Pops, spinning then sleeping on the gate until input arrives.
	///
	/// Returns `None` when the worker was told to stop, or was signaled
	/// toward a different queue; the caller re-enters its loop and
	/// re-reads the control state.
	pub fn pop_wait(&self) -> Option<T> {
		self.pop_gated(None)
	}

	/// Like [`SrmwQueue::pop_wait`], with the sleep bounded by `timeout`.
	/// Returns `None` on timeout.
	pub fn pop_wait_for(&self, timeout: Duration) -> Option<T> {
		self.pop_gated(Some(timeout))
	}

	fn pop_gated(&self, timeout: Option<Duration>) -> Option<T> {
		if let Some(item) = self.readers.lock().pop_front() {
			return Some(item);
		}

		let mut spins = 0usize;
		while self.empty.load(Ordering::SeqCst) {
			let control = self.gate.control();
			if control != WorkerControl::Active && control != WorkerControl::Recovery {
				self.gate.set_work_state(WorkState::Finished);
				return None;
			}
			if !self.gate.can_continue(self.role) {
				return None;
			}
			spins += 1;
			if spins > self.spin_loops {
				spins = 0;
				match timeout {
					Some(t) => {
						if self.gate.sleep_for(t) && self.empty.load(Ordering::SeqCst) {
							// Timed out with nothing pushed; hand
							// control back to the caller's loop.
							return None;
						}
					}
					None => {
						self.gate.sleep();
					}
				}
			} else {
				std::hint::spin_loop();
			}
		}

		self.swap_in();
		self.readers.lock().pop_front()
	}

	/// Moves the writer batch to the reader side. Returns false when
	/// there was nothing to move.
	fn swap_in(&self) -> bool {
		let batch = {
			let mut writers = self.writers.lock();
			if writers.is_empty() {
				return false;
			}
			self.empty.store(true, Ordering::SeqCst);
			std::mem::take(&mut *writers)
		};
		self.readers.lock().extend(batch);
		true
	}

	/// Empties both sides, returning everything in FIFO order. Used by
	/// shutdown and new-run drains while producers are quiesced.
	pub fn drain_all(&self) -> Vec<T> {
		let mut readers = self.readers.lock();
		let mut writers = self.writers.lock();
		self.empty.store(true, Ordering::SeqCst);
		let mut out: Vec<T> = readers.drain(..).collect();
		out.append(&mut writers);
		out
	}
}

#[cfg(test)]
mod tests {
	use std::thread;

	use pretty_assertions::assert_eq;

	use super::*;

	fn active_gate() -> Arc<WorkerGate> {
		let gate = WorkerGate::new();
		gate.set_control(WorkerControl::Active);
		gate.set_work_state(WorkState::Loop);
		gate
	}

	#[test]
	fn test_push_pop_preserves_fifo_order() {
		let queue = SrmwQueue::new(active_gate(), WorkState::InputQueue, 0, 0);
		queue.push(1, false);
		queue.push(2, false);
		queue.push(3, true);

		assert_eq!(queue.try_pop(), Some(1));
		queue.push(4, true);
		assert_eq!(queue.try_pop(), Some(2));
		assert_eq!(queue.try_pop(), Some(3));
		assert_eq!(queue.try_pop(), Some(4));
		assert_eq!(queue.try_pop(), None);
		assert!(queue.is_really_empty());
	}

	#[test]
	fn test_threshold_defers_wake() {
		let gate = active_gate();
		let queue = SrmwQueue::new(Arc::clone(&gate), WorkState::InputQueue, 0, 3);

		queue.push(1, false);
		queue.push(2, false);
		assert_eq!(gate.work_state(), WorkState::Loop);

		// Crossing the threshold signals unconditionally.
		queue.push(3, false);
		assert_eq!(gate.work_state(), WorkState::InputQueue);
	}

	#[test]
	fn test_pop_wait_blocks_until_push() {
		let gate = active_gate();
		let queue = Arc::new(SrmwQueue::new(Arc::clone(&gate), WorkState::InputQueue, 4, 0));

		let reader = {
			let queue = Arc::clone(&queue);
			thread::spawn(move || queue.pop_wait())
		};
		while !gate.is_sleeping() {
			thread::yield_now();
		}

		queue.push(7u32, true);
		assert_eq!(reader.join().unwrap(), Some(7));
	}

	#[test]
	fn test_pop_wait_returns_none_on_stop() {
		let gate = active_gate();
		let queue: Arc<SrmwQueue<u32>> = Arc::new(SrmwQueue::new(Arc::clone(&gate), WorkState::InputQueue, 4, 0));

		let reader = {
			let queue = Arc::clone(&queue);
			thread::spawn(move || queue.pop_wait())
		};
		while !gate.is_sleeping() {
			thread::yield_now();
		}

		gate.stop();
		assert_eq!(reader.join().unwrap(), None);
		assert_eq!(gate.work_state(), WorkState::Finished);
	}

	#[test]
	fn test_pop_wait_yields_to_other_queue_signal() {
		let gate = active_gate();
		let queue: SrmwQueue<u32> = SrmwQueue::new(Arc::clone(&gate), WorkState::InputQueue, 1_000_000, 0);

		// A commit-queue signal arrives while we spin on input.
		gate.set_work_state(WorkState::CommitQueue);
		assert_eq!(queue.pop_wait(), None);
	}

	#[test]
	fn test_drain_all_collects_both_sides() {
		let queue = SrmwQueue::new(active_gate(), WorkState::InputQueue, 0, 0);
		queue.push(1, false);
		queue.push(2, false);
		assert_eq!(queue.try_pop(), Some(1));
		queue.push(3, false);

		assert_eq!(queue.drain_all(), vec![2, 3]);
		assert!(queue.is_really_empty());
	}
}
