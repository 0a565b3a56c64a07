//! Pool manager: admission, dispatch, completion handling, statistics and
//! shutdown.
//!
//! All bookkeeping (job table, dispatch queue, worker table) lives in one
//! [`PoolState`] behind a single mutex. Workers never touch it; their reports
//! arrive on an event channel drained by one event-loop task, which applies
//! each event under the same lock as `submit`, the reaper and `terminate`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::job::{FailureReason, Job, JobId, JobStatus, saturating_deadline};
use super::queue::DispatchQueue;
use super::reaper::spawn_reaper;
use super::worker::{WorkerEvent, WorkerHandle, WorkerId, WorkerState};
use crate::config::PoolConfig;
use crate::engine::{EngineFactory, GraphInput, GraphOutput, GraphStatus, Message};
use crate::error::{EngineError, JobError, PoolError};

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub workers: usize,
    pub available_workers: usize,
    /// Whether `submit` was accepting work when the snapshot was taken.
    #[serde(skip)]
    pub accepting: bool,
}

pub(super) struct PoolState {
    pub(super) jobs: HashMap<JobId, Job>,
    pub(super) queue: DispatchQueue,
    pub(super) workers: BTreeMap<WorkerId, WorkerHandle>,
    next_worker_id: WorkerId,
    pub(super) accepting: bool,
}

pub(super) struct PoolInner {
    pub(super) config: PoolConfig,
    factory: Arc<dyn EngineFactory>,
    pub(super) state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    /// Woken after every applied worker event or sweep.
    pub(super) changed: Notify,
    reaper: JoinHandle<()>,
}

/// Bounded pool of compute workers with a FIFO dispatch queue.
///
/// Cheap to clone; all clones share one pool. Background tasks only hold weak
/// references, so dropping the last handle stops the workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Build the pool, loading one engine per worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, factory: Arc<dyn EngineFactory>) -> Result<Self, PoolError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut workers = BTreeMap::new();
        for id in 0..config.max_workers as WorkerId {
            let engine = factory.load().map_err(|e| PoolError::EngineLoad {
                reason: e.to_string(),
            })?;
            workers.insert(id, WorkerHandle::spawn(id, engine, events_tx.clone()));
        }

        info!(
            workers = config.max_workers,
            max_queue = config.max_queue_size,
            job_ttl_secs = config.job_ttl.as_secs(),
            "Worker pool started"
        );

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| PoolInner {
            state: Mutex::new(PoolState {
                jobs: HashMap::new(),
                queue: DispatchQueue::new(config.max_queue_size),
                workers,
                next_worker_id: config.max_workers as WorkerId,
                accepting: true,
            }),
            reaper: spawn_reaper(weak.clone(), config.cleanup_interval),
            config,
            factory,
            events: events_tx,
            changed: Notify::new(),
        });

        tokio::spawn(event_loop(Arc::downgrade(&inner), events_rx));

        Ok(Self { inner })
    }

    pub(super) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    /// The configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Submit a job.
    ///
    /// Dispatches straight to an idle worker when there is one, otherwise
    /// queues. Never waits for the job to run. Fails with
    /// [`PoolError::QueueFull`] when no worker is idle and the queue is at
    /// capacity, and with [`PoolError::ShuttingDown`] after `terminate`.
    pub async fn submit(&self, messages: Vec<Message>) -> Result<Job, PoolError> {
        self.submit_with_position(messages).await.map(|(job, _)| job)
    }

    /// Like [`WorkerPool::submit`], also returning the queue position the
    /// job was given (`None` when it went straight to a worker). Both come
    /// from the same lock, so they always agree.
    pub async fn submit_with_position(
        &self,
        messages: Vec<Message>,
    ) -> Result<(Job, Option<usize>), PoolError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if !state.accepting {
            return Err(PoolError::ShuttingDown);
        }

        let idle = state.workers.values().find(|w| w.is_idle()).map(|w| w.id);
        if idle.is_none() && state.queue.is_full() {
            warn!(
                queued = state.queue.len(),
                capacity = state.queue.capacity(),
                "Rejecting job: dispatch queue full"
            );
            return Err(PoolError::QueueFull {
                capacity: state.queue.capacity(),
            });
        }

        let job = Job::new(messages, inner.config.job_ttl);
        let job_id = job.id;
        state.jobs.insert(job_id, job);

        let position = match idle {
            Some(worker_id) => {
                inner.start_on(&mut state, worker_id, job_id);
                None
            }
            None => {
                state.queue.push(job_id);
                let position = state.queue.len() - 1;
                info!(job_id = %job_id, position, "Job queued");
                Some(position)
            }
        };

        Ok((state.jobs[&job_id].clone(), position))
    }

    /// Snapshot of a job record.
    pub async fn get_job(&self, id: JobId) -> Result<Job, JobError> {
        self.inner
            .state
            .lock()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound { id })
    }

    /// Job snapshot together with its queue position, from one lock.
    pub async fn get_job_with_position(
        &self,
        id: JobId,
    ) -> Result<(Job, Option<usize>), JobError> {
        let state = self.inner.state.lock().await;
        let job = state.jobs.get(&id).cloned().ok_or(JobError::NotFound { id })?;
        Ok((job, state.queue.position(&id)))
    }

    /// Zero-based position in the dispatch queue, or `None` when the job is
    /// not waiting (running, finished or unknown).
    pub async fn queue_position(&self, id: JobId) -> Option<usize> {
        self.inner.state.lock().await.queue.position(&id)
    }

    /// Counts by status plus worker availability and the accepting flag,
    /// taken under the pool lock.
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;

        let mut stats = PoolStats {
            workers: self.inner.config.max_workers,
            available_workers: state.workers.values().filter(|w| w.is_idle()).count(),
            accepting: state.accepting,
            ..PoolStats::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats.total = state.jobs.len();
        stats
    }

    /// Whether `submit` is still accepting work.
    pub async fn is_accepting(&self) -> bool {
        self.inner.state.lock().await.accepting
    }

    /// Stop the pool.
    ///
    /// Queued jobs fail with `pool_shutdown`, workers finish their current
    /// job within the configured grace period, anything still running after
    /// that is abandoned as `pool_shutdown`, and every worker is torn down.
    /// Calling it again is a no-op.
    pub async fn terminate(&self) {
        let inner = &self.inner;

        {
            let mut state = inner.state.lock().await;
            if !state.accepting {
                return;
            }
            state.accepting = false;

            let pending = state.queue.drain();
            for job_id in &pending {
                if let Some(job) = state.jobs.get_mut(job_id) {
                    let _ = job.fail(FailureReason::PoolShutdown, "pool terminated before dispatch");
                }
            }
            for worker in state.workers.values_mut() {
                worker.stop();
            }

            info!(
                drained = pending.len(),
                workers = state.workers.len(),
                "Pool shutting down"
            );
        }

        inner.reaper.abort();

        let deadline = saturating_deadline(Instant::now(), inner.config.shutdown_grace);
        loop {
            let changed = inner.changed.notified();
            if inner.in_flight().await == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                warn!(
                    grace_secs = inner.config.shutdown_grace.as_secs(),
                    "Shutdown grace period elapsed with jobs still running"
                );
                break;
            }
        }

        let mut state = inner.state.lock().await;
        let workers = std::mem::take(&mut state.workers);
        for (worker_id, worker) in workers {
            if let Some(job_id) = worker.current_job {
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    let _ = job.fail(
                        FailureReason::PoolShutdown,
                        "abandoned after shutdown grace period",
                    );
                }
                warn!(worker_id, job_id = %job_id, "Abandoned running job");
            }
            worker.kill();
        }

        info!("Pool terminated");
    }
}

impl PoolInner {
    /// Start a queued job on an idle worker.
    fn start_on(&self, state: &mut PoolState, worker_id: WorkerId, job_id: JobId) {
        let (Some(job), Some(worker)) = (state.jobs.get_mut(&job_id), state.workers.get_mut(&worker_id))
        else {
            return;
        };
        if let Err(e) = job.start() {
            warn!(job_id = %job_id, error = %e, "Cannot start job");
            return;
        }

        worker.assign(
            job_id,
            GraphInput {
                messages: job.messages.clone(),
            },
        );
        info!(job_id = %job_id, worker_id, "Job dispatched");
    }

    /// Hand the queue head to `worker_id` if it is idle.
    pub(super) fn dispatch_next(&self, state: &mut PoolState, worker_id: WorkerId) {
        if !state.accepting {
            return;
        }
        if !state.workers.get(&worker_id).is_some_and(|w| w.is_idle()) {
            return;
        }
        if let Some(job_id) = state.queue.pop() {
            self.start_on(state, worker_id, job_id);
        }
    }

    /// Replace a lost worker while the pool is below capacity.
    pub(super) fn respawn(&self, state: &mut PoolState) {
        if !state.accepting || state.workers.len() >= self.config.max_workers {
            return;
        }

        match self.factory.load() {
            Ok(engine) => {
                let worker_id = state.next_worker_id;
                state.next_worker_id += 1;
                state.workers.insert(
                    worker_id,
                    WorkerHandle::spawn(worker_id, engine, self.events.clone()),
                );
                info!(worker_id, "Replacement worker spawned");
                self.dispatch_next(state, worker_id);
            }
            Err(e) => {
                error!(
                    error = %e,
                    workers = state.workers.len(),
                    "Failed to load engine for replacement worker; pool running below capacity"
                );
            }
        }
    }

    async fn in_flight(&self) -> usize {
        self.state
            .lock()
            .await
            .workers
            .values()
            .filter(|w| w.current_job.is_some())
            .count()
    }

    async fn apply(&self, event: WorkerEvent) {
        let mut state = self.state.lock().await;
        match event {
            WorkerEvent::Finished {
                worker_id,
                job_id,
                outcome,
            } => self.on_worker_completion(&mut state, worker_id, job_id, outcome),
            WorkerEvent::Exited { worker_id, fault } => {
                self.on_worker_exit(&mut state, worker_id, fault)
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }

    fn on_worker_completion(
        &self,
        state: &mut PoolState,
        worker_id: WorkerId,
        job_id: JobId,
        outcome: Result<GraphOutput, EngineError>,
    ) {
        let Some(worker) = state.workers.get_mut(&worker_id) else {
            debug!(worker_id, job_id = %job_id, "Ignoring report from retired worker");
            return;
        };
        if worker.current_job != Some(job_id) {
            debug!(worker_id, job_id = %job_id, "Ignoring report for job the worker no longer hosts");
            return;
        }
        worker.release();

        if let Some(job) = state.jobs.get_mut(&job_id) {
            let recorded = match outcome {
                Ok(output) if output.status == GraphStatus::Finished => job.complete(output.state),
                Ok(output) => job.fail(
                    FailureReason::EngineError,
                    format!("graph ended with status {}", output.status),
                ),
                Err(e) => job.fail(FailureReason::EngineError, e.to_string()),
            };
            match recorded {
                Ok(()) => info!(
                    job_id = %job_id,
                    worker_id,
                    status = %job.status,
                    elapsed_ms = job.elapsed().unwrap_or_default().as_millis() as u64,
                    "Job finished"
                ),
                Err(e) => debug!(job_id = %job_id, error = %e, "Dropping outcome for settled job"),
            }
        }

        self.dispatch_next(state, worker_id);
    }

    fn on_worker_exit(&self, state: &mut PoolState, worker_id: WorkerId, fault: Option<String>) {
        let Some(worker) = state.workers.remove(&worker_id) else {
            debug!(worker_id, "Retired worker exited");
            return;
        };

        if let Some(job_id) = worker.current_job {
            let message = fault
                .clone()
                .unwrap_or_else(|| "worker exited unexpectedly".to_string());
            if let Some(job) = state.jobs.get_mut(&job_id) {
                if job.fail(FailureReason::WorkerCrash, message).is_ok() {
                    warn!(job_id = %job_id, worker_id, "Job failed: worker crashed");
                }
            }
        }

        if worker.state == WorkerState::Terminating {
            debug!(worker_id, "Worker stopped");
            return;
        }

        warn!(worker_id, fault = ?fault, "Worker died, spawning replacement");
        self.respawn(state);
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // Closing a mailbox only reaches idle workers; a worker stuck in its
        // engine has to be aborted.
        self.reaper.abort();
        let workers = std::mem::take(&mut self.state.get_mut().workers);
        if !workers.is_empty() {
            debug!(workers = workers.len(), "Pool dropped, aborting workers");
        }
        for worker in workers.into_values() {
            worker.kill();
        }
    }
}

async fn event_loop(pool: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.apply(event).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::engine::{EchoEngine, GraphEngine};

    /// Engine that blocks every run until the test releases a permit.
    struct GatedEngine {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl GraphEngine for GatedEngine {
        async fn execute(&self, input: GraphInput) -> Result<GraphOutput, EngineError> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| EngineError::Unavailable(e.to_string()))?;
            permit.forget();
            Ok(GraphOutput::finished(serde_json::json!({
                "echo": input.messages[0].content
            })))
        }
    }

    /// Sets its flag when the run holding it is torn down.
    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Engine that never returns, signalling when a run starts.
    struct StuckEngine {
        started: Arc<Notify>,
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl GraphEngine for StuckEngine {
        async fn execute(&self, _input: GraphInput) -> Result<GraphOutput, EngineError> {
            let _guard = SetOnDrop(Arc::clone(&self.cancelled));
            self.started.notify_one();
            std::future::pending().await
        }
    }

    /// Engine that panics on inputs containing "crash" and echoes otherwise.
    struct CrashyEngine;

    #[async_trait]
    impl GraphEngine for CrashyEngine {
        async fn execute(&self, input: GraphInput) -> Result<GraphOutput, EngineError> {
            if input.messages.iter().any(|m| m.content == "crash") {
                panic!("engine state corrupted");
            }
            EchoEngine.execute(input).await
        }
    }

    /// Engine that reports a non-finished status or raises.
    struct FailingEngine;

    #[async_trait]
    impl GraphEngine for FailingEngine {
        async fn execute(&self, input: GraphInput) -> Result<GraphOutput, EngineError> {
            match input.messages[0].content.as_str() {
                "interrupt" => Ok(GraphOutput {
                    state: serde_json::Value::Null,
                    status: GraphStatus::Other("INTERRUPTED".to_string()),
                }),
                _ => Err(EngineError::Failed("tool call failed".to_string())),
            }
        }
    }

    fn config(max_workers: usize, max_queue_size: usize) -> PoolConfig {
        PoolConfig {
            max_workers,
            max_queue_size,
            job_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_millis(200),
        }
    }

    fn gated_pool(max_workers: usize, max_queue_size: usize) -> (WorkerPool, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let factory_gate = Arc::clone(&gate);
        let factory = Arc::new(move || {
            Ok::<_, EngineError>(Arc::new(GatedEngine {
                gate: Arc::clone(&factory_gate),
            }) as Arc<dyn GraphEngine>)
        });
        let pool = WorkerPool::new(config(max_workers, max_queue_size), factory).unwrap();
        (pool, gate)
    }

    fn pool_with<E>(max_workers: usize, engine: fn() -> E) -> WorkerPool
    where
        E: GraphEngine + 'static,
    {
        let factory = Arc::new(move || Ok::<_, EngineError>(Arc::new(engine()) as Arc<dyn GraphEngine>));
        WorkerPool::new(config(max_workers, 10), factory).unwrap()
    }

    fn msg(content: &str) -> Vec<Message> {
        vec![Message::user(content)]
    }

    async fn wait_for_status(pool: &WorkerPool, id: JobId, status: JobStatus) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job = pool.get_job(id).await.unwrap();
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {status}"))
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let result = WorkerPool::new(config(0, 1), crate::engine::echo_factory());
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn engine_load_failure_is_reported() {
        let factory = Arc::new(|| {
            Err::<Arc<dyn GraphEngine>, _>(EngineError::Unavailable("missing module".to_string()))
        });
        let result = WorkerPool::new(config(2, 1), factory);
        assert!(matches!(result, Err(PoolError::EngineLoad { .. })));
    }

    #[tokio::test]
    async fn engine_loaded_once_per_worker() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let factory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, EngineError>(Arc::new(EchoEngine) as Arc<dyn GraphEngine>)
        });
        let pool = WorkerPool::new(config(3, 5), factory).unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(pool.submit(msg(&format!("job {i}"))).await.unwrap().id);
        }
        for id in ids {
            wait_for_status(&pool, id, JobStatus::Completed).await;
        }

        assert_eq!(loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn saturating_workers_then_queueing() {
        let (pool, _gate) = gated_pool(3, 2);

        for expected_available in [2, 1, 0] {
            let job = pool.submit(msg("work")).await.unwrap();
            assert_eq!(job.status, JobStatus::Running);
            assert!(job.started_at.is_some());
            assert_eq!(pool.stats().await.available_workers, expected_available);
        }

        let queued = pool.submit(msg("extra")).await.unwrap();
        assert_eq!(queued.status, JobStatus::Queued);
        assert_eq!(pool.queue_position(queued.id).await, Some(0));
    }

    #[tokio::test]
    async fn queue_full_rejects_without_recording() {
        let (pool, _gate) = gated_pool(1, 1);
        pool.submit(msg("running")).await.unwrap();
        pool.submit(msg("queued")).await.unwrap();

        let err = pool.submit(msg("rejected")).await.unwrap_err();
        assert!(matches!(err, PoolError::QueueFull { capacity: 1 }));

        let stats = pool.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn worked_scenario() {
        let (pool, gate) = gated_pool(2, 1);

        let a = pool.submit(msg("A")).await.unwrap();
        let b = pool.submit(msg("B")).await.unwrap();
        let c = pool.submit(msg("C")).await.unwrap();
        let d = pool.submit(msg("D")).await;

        assert_eq!(a.status, JobStatus::Running);
        assert_eq!(b.status, JobStatus::Running);
        assert_eq!(c.status, JobStatus::Queued);
        assert_eq!(pool.queue_position(c.id).await, Some(0));
        assert!(matches!(d, Err(PoolError::QueueFull { .. })));

        gate.add_permits(1);
        let first_done = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                for id in [a.id, b.id] {
                    if pool.get_job(id).await.unwrap().status == JobStatus::Completed {
                        return id;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let c_now = wait_for_status(&pool, c.id, JobStatus::Running).await;
        assert!(c_now.started_at.is_some());
        assert_eq!(pool.queue_position(c.id).await, None);
        assert_eq!(
            pool.get_job(first_done).await.unwrap().result.unwrap()["echo"],
            if first_done == a.id { "A" } else { "B" }
        );

        let e = pool.submit(msg("E")).await.unwrap();
        assert_eq!(e.status, JobStatus::Queued);
        assert_eq!(pool.queue_position(e.id).await, Some(0));
    }

    #[tokio::test]
    async fn queue_is_served_fifo() {
        let (pool, gate) = gated_pool(1, 3);
        let running = pool.submit(msg("first")).await.unwrap();
        let second = pool.submit(msg("second")).await.unwrap();
        let third = pool.submit(msg("third")).await.unwrap();
        assert_eq!(pool.queue_position(third.id).await, Some(1));

        gate.add_permits(1);
        wait_for_status(&pool, running.id, JobStatus::Completed).await;
        wait_for_status(&pool, second.id, JobStatus::Running).await;
        assert_eq!(pool.get_job(third.id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(pool.queue_position(third.id).await, Some(0));

        gate.add_permits(2);
        let second_done = wait_for_status(&pool, second.id, JobStatus::Completed).await;
        let third_done = wait_for_status(&pool, third.id, JobStatus::Completed).await;
        assert!(second_done.started_at <= third_done.started_at);
    }

    #[tokio::test]
    async fn engine_errors_fail_the_job() {
        let pool = pool_with(1, || FailingEngine);

        let raised = pool.submit(msg("boom")).await.unwrap();
        let raised = wait_for_status(&pool, raised.id, JobStatus::Failed).await;
        let error = raised.error.unwrap();
        assert_eq!(error.reason, FailureReason::EngineError);
        assert!(error.message.contains("tool call failed"));
        assert!(raised.result.is_none());

        let interrupted = pool.submit(msg("interrupt")).await.unwrap();
        let interrupted = wait_for_status(&pool, interrupted.id, JobStatus::Failed).await;
        assert!(interrupted.error.unwrap().message.contains("INTERRUPTED"));

        assert_eq!(pool.stats().await.available_workers, 1);
    }

    #[tokio::test]
    async fn worker_crash_is_contained_and_replaced() {
        let pool = pool_with(2, || CrashyEngine);

        let crashed = pool.submit(msg("crash")).await.unwrap();
        let crashed = wait_for_status(&pool, crashed.id, JobStatus::Failed).await;
        let error = crashed.error.unwrap();
        assert_eq!(error.reason, FailureReason::WorkerCrash);
        assert!(error.message.contains("engine state corrupted"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.stats().await.available_workers < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool never recovered full capacity");

        let ok = pool.submit(msg("fine")).await.unwrap();
        wait_for_status(&pool, ok.id, JobStatus::Completed).await;
    }

    #[tokio::test]
    async fn crash_replacement_picks_up_queue() {
        let pool = pool_with(1, || CrashyEngine);
        let crashed = pool.submit(msg("crash")).await.unwrap();
        let waiting = pool.submit(msg("next")).await.unwrap();
        assert_eq!(waiting.status, JobStatus::Queued);

        wait_for_status(&pool, crashed.id, JobStatus::Failed).await;
        wait_for_status(&pool, waiting.id, JobStatus::Completed).await;
    }

    #[tokio::test]
    async fn stats_total_matches_counts() {
        let (pool, gate) = gated_pool(2, 4);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(pool.submit(msg(&format!("{i}"))).await.unwrap().id);
        }

        let check = |s: PoolStats| {
            assert_eq!(s.total, s.queued + s.running + s.completed + s.failed);
            assert_eq!(s.workers, 2);
        };

        let stats = pool.stats().await;
        check(stats);
        assert_eq!((stats.running, stats.queued), (2, 3));

        gate.add_permits(5);
        for id in ids {
            wait_for_status(&pool, id, JobStatus::Completed).await;
        }
        let stats = pool.stats().await;
        check(stats);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.available_workers, 2);
    }

    #[tokio::test]
    async fn get_job_unknown_id() {
        let (pool, _gate) = gated_pool(1, 1);
        let id = uuid::Uuid::new_v4();
        assert!(matches!(pool.get_job(id).await, Err(JobError::NotFound { .. })));
        assert_eq!(pool.queue_position(id).await, None);
    }

    #[tokio::test]
    async fn terminate_drains_and_settles_everything() {
        let (pool, _gate) = gated_pool(2, 3);
        let mut submitted = Vec::new();
        for i in 0..5 {
            submitted.push(pool.submit(msg(&format!("{i}"))).await.unwrap().id);
        }

        pool.terminate().await;

        let stats = pool.stats().await;
        assert_eq!(stats.available_workers, 0);
        assert_eq!(stats.failed, 5);
        for id in submitted {
            let job = pool.get_job(id).await.unwrap();
            assert!(job.status.is_terminal());
            assert_eq!(job.error.unwrap().reason, FailureReason::PoolShutdown);
        }

        assert!(matches!(
            pool.submit(msg("late")).await,
            Err(PoolError::ShuttingDown)
        ));
        assert!(!pool.is_accepting().await);

        // Second call is a no-op.
        pool.terminate().await;
        assert_eq!(pool.stats().await.failed, 5);
    }

    #[tokio::test]
    async fn terminate_lets_in_flight_jobs_finish() {
        let (pool, gate) = gated_pool(1, 2);
        let running = pool.submit(msg("almost done")).await.unwrap();
        let queued = pool.submit(msg("never runs")).await.unwrap();

        let releaser = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                gate.add_permits(1);
            }
        });

        pool.terminate().await;
        releaser.await.unwrap();

        assert_eq!(
            pool.get_job(running.id).await.unwrap().status,
            JobStatus::Completed
        );
        let queued = pool.get_job(queued.id).await.unwrap();
        assert_eq!(queued.error.unwrap().reason, FailureReason::PoolShutdown);
        assert_eq!(pool.stats().await.available_workers, 0);
    }

    #[tokio::test]
    async fn huge_durations_from_env_do_not_overflow() {
        let huge = u64::MAX.to_string();
        let server = crate::config::ServerConfig::from_lookup(|key| match key {
            "JOB_TTL_SECS" | "SHUTDOWN_GRACE_SECS" => Some(huge.clone()),
            _ => None,
        })
        .unwrap();
        let pool = WorkerPool::new(server.pool, crate::engine::echo_factory()).unwrap();

        let job = pool.submit(msg("hi")).await.unwrap();
        assert_eq!(job.deadline, chrono::DateTime::<chrono::Utc>::MAX_UTC);
        wait_for_status(&pool, job.id, JobStatus::Completed).await;
        assert_eq!(pool.reap_expired().await, 0);

        pool.terminate().await;
        assert!(!pool.is_accepting().await);
    }

    #[tokio::test]
    async fn submit_reports_position_under_same_lock() {
        let (pool, _gate) = gated_pool(1, 3);

        let (running, position) = pool.submit_with_position(msg("a")).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(position, None);

        for expected in [0, 1] {
            let (queued, position) = pool.submit_with_position(msg("b")).await.unwrap();
            assert_eq!(queued.status, JobStatus::Queued);
            assert_eq!(position, Some(expected));

            let (snapshot, current) = pool.get_job_with_position(queued.id).await.unwrap();
            assert_eq!(snapshot.status, JobStatus::Queued);
            assert_eq!(current, position);
        }
        assert_eq!(pool.get_job_with_position(running.id).await.unwrap().1, None);
    }

    #[tokio::test]
    async fn stats_carry_accepting_flag() {
        let (pool, _gate) = gated_pool(1, 1);
        assert!(pool.stats().await.accepting);

        pool.terminate().await;
        let stats = pool.stats().await;
        assert!(!stats.accepting);
        assert_eq!(stats.available_workers, 0);
    }

    #[tokio::test]
    async fn dropping_pool_aborts_hung_workers() {
        let started = Arc::new(Notify::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let factory = {
            let started = Arc::clone(&started);
            let cancelled = Arc::clone(&cancelled);
            Arc::new(move || {
                Ok::<_, EngineError>(Arc::new(StuckEngine {
                    started: Arc::clone(&started),
                    cancelled: Arc::clone(&cancelled),
                }) as Arc<dyn GraphEngine>)
            })
        };
        let pool = WorkerPool::new(config(1, 1), factory).unwrap();
        pool.submit(msg("forever")).await.unwrap();
        started.notified().await;

        drop(pool);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !cancelled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("hung worker survived the pool");
    }
}
