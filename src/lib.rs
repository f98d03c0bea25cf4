//! Concurrent load generator for stress-testing a backend data store.
//!
//! An [`orchestrator::Orchestrator`] spawns N workers that hammer the store
//! with randomized queries from a fixed shape catalog until the run's
//! duration expires, then joins them under a bounded timeout and reduces
//! their counters into a [`report::RunResult`].

pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod output;
pub mod query;
pub mod report;
pub mod signal;
pub mod store;
pub mod worker;
