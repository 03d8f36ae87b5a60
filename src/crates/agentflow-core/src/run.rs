//! Public run interface: start, observe, resume, cancel, checkpoint
//!
//! [`start_run`] spawns the scheduler on a tokio task and hands back a
//! [`RunHandle`]. The handle is the only surface hosting layers need:
//! poll lifecycle events, resume a suspended run with an external-input
//! response, cancel cooperatively, or force a checkpoint.
//! [`restore_run`] rebuilds a run from a stored checkpoint and returns an
//! equivalent handle.
//!
//! # Example
//!
//! ```rust,ignore
//! use agentflow_core::{run::start_run, scheduler::RunOptions, envelope::TypedPayload};
//! use serde_json::json;
//!
//! let mut handle = start_run(workflow, TypedPayload::new("i64", json!(5)), RunOptions::default())?;
//! while let Some(event) = handle.poll_event().await {
//!     match event {
//!         RunEvent::Completed(output) => println!("done: {output:?}"),
//!         RunEvent::ExternalInputRequested(req) => { /* surface to a human */ }
//!         _ => {}
//!     }
//! }
//! ```

use crate::envelope::TypedPayload;
use crate::error::{Result, WorkflowError};
use crate::events::{DiagnosticEvent, RunEvent};
use crate::external::ExternalInputResponse;
use crate::scheduler::{RunOptions, RunStatus, Scheduler};
use crate::workflow::Workflow;
use agentflow_checkpoint::CheckpointStore;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

enum RunCommand {
    Resume(ExternalInputResponse),
    Cancel,
    CheckpointNow,
}

/// Stream view over a run's lifecycle events
pub type EventStream = UnboundedReceiverStream<RunEvent>;

/// Handle to a live (or restored) run
pub struct RunHandle {
    run_id: String,
    events: EventStream,
    commands: mpsc::UnboundedSender<RunCommand>,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RunHandle {
    /// Id of the run
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next lifecycle event; `None` once the run task has finished and the
    /// event queue is drained
    pub async fn poll_event(&mut self) -> Option<RunEvent> {
        self.events.next().await
    }

    /// Consume the handle, keeping only the event stream
    ///
    /// For observers that never control the run. Dropping the command side
    /// abandons a suspended run: with nobody left to call
    /// [`resume_with`](Self::resume_with), an `AwaitingInput` run never
    /// advances.
    pub fn into_event_stream(self) -> EventStream {
        self.events
    }

    /// Supply the response to an outstanding external-input request
    ///
    /// Required when the run is in `AwaitingInput`. A mismatched response
    /// is rejected with a diagnostic event and the run stays suspended.
    pub fn resume_with(&self, response: ExternalInputResponse) -> Result<()> {
        self.commands
            .send(RunCommand::Resume(response))
            .map_err(|_| WorkflowError::Custom("run has already terminated".to_string()))
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        let _ = self.commands.send(RunCommand::Cancel);
    }

    /// Force a checkpoint at the next super-step boundary
    pub fn checkpoint_now(&self) -> Result<()> {
        self.commands
            .send(RunCommand::CheckpointNow)
            .map_err(|_| WorkflowError::Custom("run has already terminated".to_string()))
    }

    /// Drive the run to a terminal event and return the final output
    ///
    /// Convenience for runs without suspension points; a run that enters
    /// `AwaitingInput` will park here until another holder resumes it.
    pub async fn run_to_completion(&mut self) -> Result<Option<TypedPayload>> {
        while let Some(event) = self.poll_event().await {
            match event {
                RunEvent::Completed(output) => return Ok(output),
                RunEvent::Failed(failure) => {
                    return Err(WorkflowError::Custom(failure.chain.join(" <- ")))
                }
                RunEvent::Cancelled => return Err(WorkflowError::Cancelled),
                _ => {}
            }
        }
        Err(WorkflowError::Custom(
            "run ended without a terminal event".to_string(),
        ))
    }

    /// Wait for the scheduler task to finish
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Start a run of a workflow with an initial payload
pub fn start_run(
    workflow: Workflow,
    initial_payload: TypedPayload,
    options: RunOptions,
) -> Result<RunHandle> {
    let workflow = Arc::new(workflow);
    let run_id = Uuid::new_v4().to_string();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let cancelled = Arc::new(AtomicBool::new(false));

    let mut scheduler = Scheduler::new(
        workflow,
        run_id.clone(),
        options,
        event_tx,
        cancelled.clone(),
    );
    scheduler.inject_input(initial_payload)?;

    let task = tokio::spawn(run_loop(scheduler, command_rx));
    Ok(RunHandle {
        run_id,
        events: UnboundedReceiverStream::new(event_rx),
        commands: command_tx,
        cancelled,
        task,
    })
}

/// Restore a run from a checkpoint and resume scheduling
///
/// Retrieves the checkpoint, rebuilds executor instances through their
/// factories (invoking `on_restore` with each state blob) and rehydrates
/// scopes, inboxes, fan-in buffers and pending requests. Fails without
/// applying anything when the checkpoint cannot be loaded.
pub async fn restore_run(
    workflow: Workflow,
    store: Arc<dyn CheckpointStore>,
    run_id: &str,
    checkpoint_id: &str,
    options: RunOptions,
) -> Result<RunHandle> {
    let checkpoint = store.retrieve(run_id, checkpoint_id).await?;
    let workflow = Arc::new(workflow);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let cancelled = Arc::new(AtomicBool::new(false));

    let options = options.with_checkpoint_store(store);
    let scheduler = Scheduler::from_checkpoint(
        workflow,
        options,
        event_tx,
        cancelled.clone(),
        checkpoint,
    )?;

    let run_id = run_id.to_string();
    let task = tokio::spawn(run_loop(scheduler, command_rx));
    Ok(RunHandle {
        run_id,
        events: UnboundedReceiverStream::new(event_rx),
        commands: command_tx,
        cancelled,
        task,
    })
}

async fn run_loop(mut scheduler: Scheduler, mut commands: mpsc::UnboundedReceiver<RunCommand>) {
    scheduler.emit_started();
    loop {
        match scheduler.status() {
            RunStatus::Running => {
                // Drain control commands without blocking the step cadence.
                while let Ok(command) = commands.try_recv() {
                    handle_command(&mut scheduler, command).await;
                }
                if scheduler.status() != RunStatus::Running {
                    continue;
                }
                if scheduler.is_cancelled() {
                    scheduler.mark_cancelled();
                    continue;
                }
                scheduler.superstep().await;
            }
            RunStatus::AwaitingInput => match commands.recv().await {
                Some(command) => handle_command(&mut scheduler, command).await,
                None => break,
            },
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => break,
        }
    }
}

async fn handle_command(scheduler: &mut Scheduler, command: RunCommand) {
    match command {
        RunCommand::Resume(response) => {
            if let Err(error) = scheduler.resume_with(response) {
                scheduler_reject(scheduler, error);
            }
        }
        RunCommand::Cancel => scheduler.mark_cancelled(),
        RunCommand::CheckpointNow => {
            if let Err(error) = scheduler.write_checkpoint().await {
                scheduler_diagnostic(
                    scheduler,
                    DiagnosticEvent::CheckpointWriteFailed {
                        error: error.to_string(),
                    },
                );
            }
        }
    }
}

fn scheduler_reject(scheduler: &Scheduler, error: WorkflowError) {
    scheduler_diagnostic(
        scheduler,
        DiagnosticEvent::ResponseRejected {
            reason: error.to_string(),
        },
    );
}

fn scheduler_diagnostic(scheduler: &Scheduler, event: DiagnosticEvent) {
    scheduler.emit_diagnostic(event);
}
