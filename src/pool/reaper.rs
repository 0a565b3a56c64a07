//! TTL reaper: fails jobs that outlive their deadline.
//!
//! A queued job past its deadline is dropped from the queue. A running one
//! means the hosting worker is presumed hung; the worker is aborted and
//! replaced so a stuck graph cannot hold pool capacity forever.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::job::{FailureReason, JobStatus};
use super::manager::{PoolInner, WorkerPool};

impl WorkerPool {
    /// Run one sweep now. Returns the number of jobs that timed out.
    pub async fn reap_expired(&self) -> usize {
        self.inner().reap_expired().await
    }
}

impl PoolInner {
    pub(super) async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let expired: Vec<_> = state
            .jobs
            .values()
            .filter(|job| job.is_expired_at(now))
            .map(|job| (job.id, job.status))
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let message = format!("exceeded job TTL of {}s", self.config.job_ttl.as_secs_f64());
        let mut hung_workers = Vec::new();

        for (job_id, status) in &expired {
            match status {
                JobStatus::Queued => {
                    state.queue.remove(job_id);
                }
                _ => {
                    if let Some(worker) = state
                        .workers
                        .values()
                        .find(|w| w.current_job == Some(*job_id))
                    {
                        hung_workers.push(worker.id);
                    }
                }
            }

            if let Some(job) = state.jobs.get_mut(job_id) {
                let _ = job.fail(FailureReason::Timeout, message.clone());
            }
            warn!(job_id = %job_id, was = %status, "Job timed out");
        }

        for worker_id in hung_workers {
            if let Some(worker) = state.workers.remove(&worker_id) {
                warn!(worker_id, "Recycling hung worker");
                worker.kill();
            }
            self.respawn(&mut state);
        }

        drop(state);
        self.changed.notify_waiters();

        info!(count = expired.len(), "Expired jobs");
        expired.len()
    }
}

/// Spawn the periodic sweep. Stops once the pool is gone.
pub(super) fn spawn_reaper(pool: Weak<PoolInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = pool.upgrade() else {
                break;
            };
            inner.reap_expired().await;
        }
    })
}
