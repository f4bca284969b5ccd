//! Partitioned transaction execution over logical locks.
//!
//! The runtime decomposes each transaction into [`Action`]s, one per
//! touched partition, joined by a [`Rendezvous`] barrier. Partitions
//! own their key range, their lock table, and one primary worker
//! thread; conflicting work serializes on per-key logical locks inside
//! the partition instead of a centralized lock manager. Committed
//! transactions flow through the staged group-commit pipeline, which
//! batches log flushes and notifies clients once their last log record
//! is durable.
//!
//! # Typical flow
//!
//! 1. Begin a transaction on the [`StorageEngine`] and create a
//!    [`Rendezvous`] expecting one post per action.
//! 2. Create the actions, register each with the rendezvous, and
//!    enqueue each into the partition [`Environment::partition_for`]
//!    resolves.
//! 3. Wait on the rendezvous [`CommitNotice`]; it fires exactly once
//!    with [`TrxOutcome::Committed`] or [`TrxOutcome::Aborted`], the
//!    former only after the transaction's log is durable.

mod action;
mod config;
mod env;
mod error;
mod flusher;
mod locks;
mod partition;
mod queue;
mod routing;
mod rvp;
mod storage;
pub mod testing;
mod worker;

pub use action::{Action, ActionBody, KeySet};
pub use config::RuntimeConfig;
pub use env::{EnvSnapshot, EnvStats, Environment};
pub use error::ExecError;
pub use flusher::{FlusherStats, FlusherStatsSnapshot};
pub use partition::{ActiveThreads, KeyRange, Partition};
pub use routing::{PartitionedTable, TableSpec};
pub use rvp::{CommitNotice, Rendezvous, TrxOutcome};
pub use storage::{Lsn, StorageEngine, StorageError, TxHandle};
pub use worker::{WorkState, WorkerControl, WorkerStats, WorkerStatsSnapshot};

pub use tessera_core::{Key, KeyError, KeyField, LockMode, PartitionId, Tid, MAX_KEY_WIDTH};
