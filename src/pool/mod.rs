//! Worker pool: bounded execution of graph runs.
//!
//! Core components:
//! - `job`: Job record and state machine (Queued → Running → Completed/Failed)
//! - `queue`: Bounded FIFO of job ids waiting for a worker
//! - `worker`: Compute worker actor plus its crash supervisor
//! - `manager`: WorkerPool: submit, dispatch, completion, stats, terminate
//! - `reaper`: Periodic TTL sweep

pub mod job;
pub mod manager;
pub mod queue;
pub mod reaper;
pub mod worker;

pub use job::{FailureReason, Job, JobFailure, JobId, JobStatus};
pub use manager::{PoolStats, WorkerPool};
pub use queue::DispatchQueue;
pub use worker::{WorkerId, WorkerState};
