//! Compute worker: an actor owning one graph engine.
//!
//! Each worker is a tokio task with its own mailbox. It never sees the pool's
//! job table; it gets a job id plus input, and reports back on the shared
//! event channel. A supervisor task watches the worker's join handle so a
//! panic inside the engine surfaces as [`WorkerEvent::Exited`] instead of a
//! report that never arrives.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use super::job::JobId;
use crate::engine::{GraphEngine, GraphInput, GraphOutput};
use crate::error::EngineError;

/// Worker identifier. Replacements get a fresh id.
pub type WorkerId = u64;

/// Mailbox depth: one run plus a trailing stop is all a worker ever holds.
const MAILBOX_CAPACITY: usize = 2;

/// State of a worker as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Terminating,
}

/// Messages sent from the pool to a worker.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Run { job_id: JobId, input: GraphInput },
    Stop,
}

/// Messages sent from workers (and their supervisors) to the pool.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Finished {
        worker_id: WorkerId,
        job_id: JobId,
        outcome: Result<GraphOutput, EngineError>,
    },
    Exited {
        worker_id: WorkerId,
        fault: Option<String>,
    },
}

struct ComputeWorker {
    id: WorkerId,
    engine: Arc<dyn GraphEngine>,
    mailbox: mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl ComputeWorker {
    async fn run(mut self) {
        debug!(worker_id = self.id, "Worker started");

        while let Some(command) = self.mailbox.recv().await {
            match command {
                WorkerCommand::Run { job_id, input } => {
                    let start = std::time::Instant::now();
                    let outcome = self.engine.execute(input).await;
                    debug!(
                        worker_id = self.id,
                        job_id = %job_id,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        ok = outcome.is_ok(),
                        "Graph run finished"
                    );

                    let event = WorkerEvent::Finished {
                        worker_id: self.id,
                        job_id,
                        outcome,
                    };
                    if self.events.send(event).is_err() {
                        break;
                    }
                }
                WorkerCommand::Stop => {
                    debug!(worker_id = self.id, "Worker received stop signal");
                    break;
                }
            }
        }
    }
}

/// Pool-side handle to a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_job: Option<JobId>,
    mailbox: mpsc::Sender<WorkerCommand>,
    abort: AbortHandle,
}

impl WorkerHandle {
    /// Spawn a worker task around an already-loaded engine.
    pub fn spawn(
        id: WorkerId,
        engine: Arc<dyn GraphEngine>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let worker = ComputeWorker {
            id,
            engine,
            mailbox: rx,
            events: events.clone(),
        };

        let task = tokio::spawn(worker.run());
        let abort = task.abort_handle();
        tokio::spawn(supervise(id, task, events));

        Self {
            id,
            state: WorkerState::Idle,
            current_job: None,
            mailbox: tx,
            abort,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Mark busy and hand over a job.
    ///
    /// A failed send means the worker task is gone; its supervisor will
    /// report the exit and the job is failed from there.
    pub fn assign(&mut self, job_id: JobId, input: GraphInput) {
        self.state = WorkerState::Busy;
        self.current_job = Some(job_id);
        if let Err(e) = self.mailbox.try_send(WorkerCommand::Run { job_id, input }) {
            warn!(worker_id = self.id, job_id = %job_id, error = %e, "Dispatch to worker failed");
        }
    }

    /// Clear the current job; a busy worker becomes idle again.
    pub fn release(&mut self) -> Option<JobId> {
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Idle;
        }
        self.current_job.take()
    }

    /// Ask the worker to exit once its current job (if any) is done.
    pub fn stop(&mut self) {
        self.state = WorkerState::Terminating;
        let _ = self.mailbox.try_send(WorkerCommand::Stop);
    }

    /// Abort the worker task immediately.
    pub fn kill(self) {
        self.abort.abort();
    }
}

async fn supervise(
    worker_id: WorkerId,
    task: JoinHandle<()>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let fault = match task.await {
        Ok(()) => None,
        Err(e) if e.is_panic() => Some(format!("worker panicked: {}", panic_message(e.into_panic()))),
        Err(_) => Some("worker task was aborted".to_string()),
    };
    let _ = events.send(WorkerEvent::Exited { worker_id, fault });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
