//! Shared state store and domain model for the drover runtime.
//!
//! Every drover process (the coordinator and each agent) coordinates
//! exclusively through this crate: the task DAG, per-task states, lease
//! locks, the agent registry, memory snapshots, goal-wide backoff
//! deadlines, and the instruction version ledger all live in one SQLite
//! database opened via [`pool::open_pool`].

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
