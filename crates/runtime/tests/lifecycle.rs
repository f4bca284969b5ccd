//! Partition lifecycle: splits, deletions, and the new-run barrier.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{quick_config, TestBody};
use tessera_runtime::testing::MockEngine;
use tessera_runtime::{Action, Environment, ExecError, Key, Rendezvous, TableSpec, TrxOutcome};

const WAIT: Duration = Duration::from_secs(5);

fn commit_one(env: &Environment, table: &str, key: i64) {
	let tx = env.engine().begin().unwrap();
	let rvp = Rendezvous::new(tx, 1, 1);
	let notice = rvp.notice();
	let action = Action::new(&rvp, TestBody::point(Key::single(key)), false);
	rvp.add_action(&action);
	env.partition_for(table, &Key::single(key))
		.unwrap()
		.enqueue(action, true)
		.unwrap();
	assert_eq!(notice.wait_for(WAIT), Some(TrxOutcome::Committed));
}

#[test]
fn test_split_routes_upper_portion_to_new_partition() {
	let engine = MockEngine::new();
	let env = Environment::new(engine, quick_config(), &[TableSpec::new("orders", 0, 20, 2)]);
	env.start().unwrap();

	let table = env.table("orders").unwrap();
	let parent = table.partition_for(&Key::single(15)).unwrap().id();
	let new_id = table.split(Key::single(15)).unwrap();

	assert_eq!(table.partition_count(), 3);
	assert_eq!(table.partition_for(&Key::single(15)).unwrap().id(), new_id);
	assert_eq!(table.partition_for(&Key::single(14)).unwrap().id(), parent);

	// The new partition serves work immediately.
	commit_one(&env, "orders", 17);

	table.delete_partition(new_id).unwrap();
	assert_eq!(table.partition_count(), 2);
	// The range merged back into the left neighbor.
	assert_eq!(table.partition_for(&Key::single(15)).unwrap().id(), parent);
	commit_one(&env, "orders", 15);

	env.stop();
}

#[test]
fn test_new_run_adopts_engine_range_map() {
	let engine = MockEngine::new();
	engine.set_range_map(
		"orders",
		vec![
			Key::single(0),
			Key::single(25),
			Key::single(50),
			Key::single(75),
		],
	);
	let env = Environment::new(engine.clone(), quick_config(), &[TableSpec::new("orders", 0, 100, 2)]);
	env.start().unwrap();
	commit_one(&env, "orders", 60);

	env.new_run().unwrap();

	let table = env.table("orders").unwrap();
	assert_eq!(table.partition_count(), 4);
	// The whole space stays routable and the rebuilt partitions serve.
	for key in [0i64, 30, 60, 99] {
		assert!(table.partition_for(&Key::single(key)).is_ok());
	}
	commit_one(&env, "orders", 80);

	env.stop();
}

#[test]
fn test_new_run_shrinks_partition_set() {
	let engine = MockEngine::new();
	engine.set_range_map("orders", vec![Key::single(0)]);
	let env = Environment::new(engine, quick_config(), &[TableSpec::new("orders", 0, 100, 4)]);
	env.start().unwrap();

	env.new_run().unwrap();

	let table = env.table("orders").unwrap();
	assert_eq!(table.partition_count(), 1);
	commit_one(&env, "orders", 42);

	env.stop();
}

#[test]
fn test_new_run_fails_without_engine_range_map() {
	let engine = MockEngine::new();
	let env = Environment::new(engine, quick_config(), &[TableSpec::new("orders", 0, 10, 1)]);
	env.start().unwrap();

	let err = env.new_run().unwrap_err();
	assert!(matches!(err, ExecError::RepartitionFailure(_)));

	env.stop();
}

#[test]
fn test_new_run_with_unchanged_map_keeps_partitions() {
	let engine = MockEngine::new();
	// The authoritative map matches the initial even split exactly.
	engine.set_range_map("orders", vec![Key::single(0), Key::single(50)]);
	let env = Environment::new(engine, quick_config(), &[TableSpec::new("orders", 0, 100, 2)]);
	env.start().unwrap();

	let table = env.table("orders").unwrap();
	let before: Vec<_> = table.partitions().iter().map(|p| p.id()).collect();
	env.new_run().unwrap();
	let after: Vec<_> = table.partitions().iter().map(|p| p.id()).collect();
	assert_eq!(before, after);
	commit_one(&env, "orders", 75);

	env.stop();
}
