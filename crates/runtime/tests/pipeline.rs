//! End-to-end transaction flow through the environment.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::{quick_config, wait_until, TestBody};
use parking_lot::Mutex;
use tessera_runtime::StorageEngine;
use tessera_runtime::testing::MockEngine;
use tessera_runtime::{Action, Environment, Key, Rendezvous, RuntimeConfig, TableSpec, TrxOutcome};

const WAIT: Duration = Duration::from_secs(5);

fn three_part_env(engine: &Arc<MockEngine>) -> Environment {
	Environment::new(
		engine.clone(),
		quick_config(),
		&[TableSpec::new("accounts", 0, 30, 3)],
	)
}

#[test]
fn test_transaction_commits_across_three_partitions() {
	let engine = MockEngine::new();
	let env = three_part_env(&engine);
	env.start().unwrap();

	let tx = env.engine().begin().unwrap();
	let rvp = Rendezvous::new(tx, 3, 3);
	let notice = rvp.notice();
	let counter = Arc::new(AtomicU64::new(0));

	for k in [1i64, 11, 21] {
		let body = TestBody::point(Key::single(k)).counting(&counter);
		let action = Action::new(&rvp, body, false);
		rvp.add_action(&action);
		let partition = env.partition_for("accounts", &Key::single(k)).unwrap();
		partition.enqueue(action, true).unwrap();
	}

	assert_eq!(notice.wait_for(WAIT), Some(TrxOutcome::Committed));
	assert_eq!(counter.load(Ordering::SeqCst), 3);

	// The client heard about the commit only after the transaction's
	// last log record became durable.
	assert!(engine.durable_lsn() >= rvp.last_lsn());

	// The notifier hands the actions back to their partitions, which
	// release every logical lock.
	let partitions: Vec<_> = env.table("accounts").unwrap().partitions();
	wait_until(WAIT, "all locks released", || {
		partitions.iter().all(|p| p.locks_clean())
	});

	let stats = env.statistics();
	assert_eq!(stats.committed, 1);
	assert_eq!(stats.aborted, 0);
	assert_eq!(stats.workers.processed, 3);

	env.stop();
}

#[test]
fn test_conflicting_transactions_execute_in_arrival_order() {
	let engine = MockEngine::new();
	let env = Environment::new(
		engine.clone(),
		quick_config(),
		&[TableSpec::new("accounts", 0, 10, 1)],
	);
	env.start().unwrap();

	let log = Arc::new(Mutex::new(Vec::new()));
	let hot = Key::single(5);
	let mut notices = Vec::new();
	let mut tids = Vec::new();

	for _ in 0..3 {
		let tx = env.engine().begin().unwrap();
		tids.push(tx.tid.0);
		let rvp = Rendezvous::new(tx, 1, 1);
		notices.push(rvp.notice());
		let action = Action::new(&rvp, TestBody::point(hot.clone()).logging(&log), false);
		rvp.add_action(&action);
		let partition = env.partition_for("accounts", &hot).unwrap();
		partition.enqueue(action, true).unwrap();
	}

	for notice in &notices {
		assert_eq!(notice.wait_for(WAIT), Some(TrxOutcome::Committed));
	}

	// The exclusive lock on the hot key serializes the three
	// transactions in FIFO order.
	assert_eq!(*log.lock(), tids);
	env.stop();
}

#[test]
fn test_aborted_rendezvous_early_aborts_late_action() {
	let engine = MockEngine::new();
	let env = three_part_env(&engine);
	env.start().unwrap();

	let tx = env.engine().begin().unwrap();
	let rvp = Rendezvous::new(tx, 3, 3);
	let notice = rvp.notice();

	for k in [1i64, 11] {
		let action = Action::new(&rvp, TestBody::point(Key::single(k)).failing(), false);
		rvp.add_action(&action);
		env.partition_for("accounts", &Key::single(k))
			.unwrap()
			.enqueue(action, true)
			.unwrap();
	}
	wait_until(WAIT, "abort decision", || rvp.is_aborted());

	// The third action arrives after the decision; its body must not
	// run and the worker must not attach to the transaction for it.
	let body = TestBody::point(Key::single(21));
	let executed = body.executed_flag();
	let action = Action::new(&rvp, body, false);
	rvp.add_action(&action);
	env.partition_for("accounts", &Key::single(21))
		.unwrap()
		.enqueue(action, true)
		.unwrap();

	assert_eq!(notice.wait_for(WAIT), Some(TrxOutcome::Aborted));
	assert!(!executed.load(Ordering::SeqCst));
	assert!(engine.abort_count() >= 1);

	let stats = env.statistics();
	assert_eq!(stats.aborted, 1);
	assert_eq!(stats.committed, 0);
	// The second failing action may itself be early-aborted if the
	// first decision lands before it is dispatched.
	assert!(stats.workers.midway_aborts >= 1);
	assert_eq!(stats.workers.midway_aborts + stats.workers.early_aborts, 3);

	env.stop();
}

#[test]
fn test_commit_is_synchronous_without_flusher() {
	let engine = MockEngine::new();
	let config = RuntimeConfig {
		enable_flusher: false,
		..quick_config()
	};
	let env = Environment::new(engine.clone(), config, &[TableSpec::new("accounts", 0, 10, 1)]);
	env.start().unwrap();

	let tx = env.engine().begin().unwrap();
	let rvp = Rendezvous::new(tx, 1, 1);
	let notice = rvp.notice();
	let action = Action::new(&rvp, TestBody::point(Key::single(3)), false);
	rvp.add_action(&action);
	env.partition_for("accounts", &Key::single(3))
		.unwrap()
		.enqueue(action, true)
		.unwrap();

	assert_eq!(notice.wait_for(WAIT), Some(TrxOutcome::Committed));
	assert_eq!(engine.commit_count(), 1);
	assert_eq!(engine.lazy_commit_count(), 0);
	assert_eq!(engine.sync_count(), 0);

	env.stop();
}

#[test]
fn test_stop_aborts_pending_actions() {
	let engine = MockEngine::new();
	let env = Environment::new(
		engine.clone(),
		quick_config(),
		&[TableSpec::new("accounts", 0, 10, 1)],
	);
	env.start().unwrap();

	// Park the worker so the action is still queued at shutdown.
	let partition = env.partition_for("accounts", &Key::single(2)).unwrap();
	partition.pause();

	let tx = env.engine().begin().unwrap();
	let rvp = Rendezvous::new(tx, 1, 1);
	let notice = rvp.notice();
	let body = TestBody::point(Key::single(2));
	let executed = body.executed_flag();
	let action = Action::new(&rvp, body, false);
	rvp.add_action(&action);
	partition.enqueue(action, true).unwrap();

	env.stop();

	assert_eq!(notice.peek(), Some(TrxOutcome::Aborted));
	assert!(!executed.load(Ordering::SeqCst));
	assert!(engine.abort_count() >= 1);
}

#[test]
fn test_misrouted_action_aborts_with_bad_partition() {
	let engine = MockEngine::new();
	let env = three_part_env(&engine);
	env.start().unwrap();

	let tx = env.engine().begin().unwrap();
	let rvp = Rendezvous::new(tx, 1, 1);
	let notice = rvp.notice();

	// The body claims a key owned by a different partition than the
	// one the action was enqueued into.
	let body = TestBody::point(Key::single(25));
	let executed = body.executed_flag();
	let action = Action::new(&rvp, body, false);
	rvp.add_action(&action);
	env.partition_for("accounts", &Key::single(1))
		.unwrap()
		.enqueue(action, true)
		.unwrap();

	assert_eq!(notice.wait_for(WAIT), Some(TrxOutcome::Aborted));
	assert!(!executed.load(Ordering::SeqCst));

	let stats = env.statistics();
	assert!(stats.workers.problems >= 1);
	env.stop();
}
