//! Run lifecycle and diagnostic events
//!
//! Everything a caller can observe about a run arrives as a [`RunEvent`]
//! on the handle's event channel: lifecycle transitions, emitted outputs,
//! suspension requests, checkpoint ids and the terminal outcome, plus
//! [`DiagnosticEvent`]s for recoverable conditions (dropped deliveries,
//! scope conflicts, rejected responses, failed checkpoint writes) that
//! never abort the run by themselves.

use crate::edges::DeliveryObservation;
use crate::envelope::TypedPayload;
use crate::error::WorkflowError;
use crate::external::ExternalInputRequest;
use crate::scopes::ScopeConflict;
use agentflow_checkpoint::CheckpointId;
use serde::Serialize;
use serde_json::Value;

/// Terminal failure description with the structured cause chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    /// Workflow that failed
    pub workflow: String,
    /// Executor the failure is attributed to, when known
    pub executor: Option<String>,
    /// Cause chain, outermost first
    pub chain: Vec<String>,
}

impl RunFailure {
    /// Build a failure record from an error's cause chain
    pub fn from_error(
        workflow: impl Into<String>,
        executor: Option<String>,
        error: &WorkflowError,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            executor,
            chain: error.cause_chain(),
        }
    }
}

/// Events yielded by [`RunHandle::poll_event`](crate::run::RunHandle::poll_event)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunEvent {
    /// The run was accepted and the first super-step is about to execute
    Started,

    /// A super-step committed; carries the completed step number
    SuperStep(u64),

    /// An output-surface payload was emitted
    Emitted(TypedPayload),

    /// The run suspended waiting for external input
    ExternalInputRequested(ExternalInputRequest),

    /// A checkpoint was written
    Checkpointed(CheckpointId),

    /// The run completed; carries the most recent emitted output
    Completed(Option<TypedPayload>),

    /// The run failed
    Failed(RunFailure),

    /// The run was cancelled
    Cancelled,

    /// A recoverable condition was recorded
    Diagnostic(DiagnosticEvent),
}

/// Recoverable conditions surfaced alongside lifecycle events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DiagnosticEvent {
    /// An edge delivery did not complete normally
    Delivery(DeliveryObservation),

    /// One scope key was written by more than one handler in a step
    ScopeConflict(ScopeConflict),

    /// A fan-in cohort exceeded its timeout and was evicted
    CohortEvicted { edge_id: String, delivery_id: String },

    /// A cadence or requested checkpoint write failed; the run continues
    CheckpointWriteFailed { error: String },

    /// A resume response did not match the outstanding request
    ResponseRejected { reason: String },

    /// An observer event published by a handler via `emit_event`
    ExecutorEvent { executor_id: String, event: Value },

    /// An envelope was dropped by the inbox overflow policy
    InboxOverflow { executor_id: String },
}
