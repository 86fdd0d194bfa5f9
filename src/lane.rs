//! Compile Lane - Single-Lane Request Serializer
//!
//! A single task owns the [`CompilationPipeline`] and drains an unbounded
//! queue in arrival order. A job starts only after the previous one,
//! including any engine rebuild it triggered, has finished. A failed or
//! panicking job yields its own failure outcome and the lane moves on.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::pipeline::{CompilationPipeline, CompileJob, CompileOutcome};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaneError {
    #[error("compile lane has shut down")]
    Closed,
}

enum LaneCommand {
    Compile {
        job: CompileJob,
        reply: oneshot::Sender<CompileOutcome>,
    },
    Reset {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the lane. The lane stops once every handle is dropped
/// and the queue is drained.
#[derive(Clone)]
pub struct CompileLane {
    tx: mpsc::UnboundedSender<LaneCommand>,
}

impl CompileLane {
    /// Spawn the lane task on the current tokio runtime.
    pub fn spawn(pipeline: CompilationPipeline) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(pipeline, rx));
        (Self { tx }, task)
    }

    /// Queue a job. Its position is fixed when this is called, not when the
    /// returned future is first polled.
    pub fn enqueue(
        &self,
        job: CompileJob,
    ) -> impl Future<Output = Result<CompileOutcome, LaneError>> + Send + 'static {
        let (reply, outcome) = oneshot::channel();
        let queued = self
            .tx
            .send(LaneCommand::Compile { job, reply })
            .map_err(|_| LaneError::Closed);
        async move {
            queued?;
            outcome.await.map_err(|_| LaneError::Closed)
        }
    }

    /// Queue a manual engine reset behind every job already queued.
    pub fn reset(&self) -> impl Future<Output = Result<(), LaneError>> + Send + 'static {
        let (done, finished) = oneshot::channel();
        let queued = self
            .tx
            .send(LaneCommand::Reset { done })
            .map_err(|_| LaneError::Closed);
        async move {
            queued?;
            finished.await.map_err(|_| LaneError::Closed)
        }
    }
}

async fn drive(mut pipeline: CompilationPipeline, mut rx: mpsc::UnboundedReceiver<LaneCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            LaneCommand::Compile { job, reply } => {
                let outcome = match AssertUnwindSafe(pipeline.run(&job)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(job_id = %job.id, panic = %message, "job panicked; resetting engine");
                        // Lifecycle state may be half-updated.
                        pipeline.reset();
                        CompileOutcome::Failed {
                            message,
                            diagnostics: vec![],
                        }
                    }
                };
                if reply.send(outcome).is_err() {
                    debug!(job_id = %job.id, "caller dropped before the outcome was ready");
                }
            }
            LaneCommand::Reset { done } => {
                pipeline.reset();
                let _ = done.send(());
            }
        }
    }
    debug!("compile lane drained");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("compilation panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("compilation panicked: {message}")
    } else {
        "compilation panicked".to_string()
    }
}
