//! Super-step scheduler: the engine's execution loop
//!
//! Execution proceeds in super-steps. Each super-step drains the set of
//! envelopes queued across all executors (the *frontier*), invokes the
//! matching handlers - in parallel across executors when configured, but
//! never concurrently on one executor instance - and then commits: queued
//! scope writes apply atomically, saved executor state merges into the run
//! state, and emitted messages route through the edge runners into the
//! next frontier. Messages produced during a super-step are therefore
//! never visible to handlers within it.
//!
//! After the commit the scheduler decides what happens next: quiescence
//! with no pending external-input request completes the run; a pending
//! request suspends it in `AwaitingInput`; otherwise the next super-step
//! begins. Determinism follows from the commit ordering (executor
//! registration order, then emission order within a handler) and from
//! reads always observing the pre-step scope snapshot.
//!
//! Checkpoints are written at super-step boundaries through the pluggable
//! store, on a configurable cadence or on demand; restore rebuilds
//! executor instances from their factories and rehydrates scopes,
//! inboxes, fan-in buffers and pending requests with nothing applied on
//! failure.

use crate::edges::{DeliveryObservation, DeliveryStatus, EdgeRouter};
use crate::envelope::{
    tags, DeliveryId, Envelope, ExecutorId, TypedPayload, INPUT_SOURCE,
};
use crate::error::{Result, WorkflowError};
use crate::events::{DiagnosticEvent, RunEvent, RunFailure};
use crate::executor::{EmittedMessage, Executor, ExecutorContext, HandlerEffects};
use crate::external::{match_response, ExternalInputRequest, ExternalInputResponse};
use crate::messages::ChatMessage;
use crate::scopes::{ScopeState, ScopeWrite};
use crate::workflow::Workflow;
use agentflow_checkpoint::{CheckpointId, CheckpointStore, RunCheckpoint};
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Super-steps are executing
    Running,
    /// Suspended on an external-input request
    AwaitingInput,
    /// Quiesced with no pending request
    Completed,
    /// Terminated by a non-recoverable error
    Failed,
    /// Terminated by cancellation
    Cancelled,
}

/// Per-executor reaction to a handler error
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorPolicy {
    /// Fail the run (default)
    FailRun,
    /// Record the failure and drop the envelope
    SkipMessage,
    /// Re-inject the envelope into the next frontier with backoff
    RetryWithBackoff {
        max_attempts: u32,
        base_delay: Duration,
    },
}

/// What to do when a bounded inbox is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Hold the envelope back until the inbox has room
    Block,
    /// Evict the oldest queued envelope
    DropOldest,
}

/// Optional per-executor inbox bound
#[derive(Debug, Clone, Copy)]
pub struct InboxBound {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

/// When the scheduler writes checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Only on explicit `checkpoint_now`
    Manual,
    /// After every super-step
    EveryStep,
    /// After every N super-steps
    EveryN(u64),
    /// Only when the run suspends for external input
    OnSuspend,
}

/// Options controlling one run
#[derive(Clone)]
pub struct RunOptions {
    /// Invoke handlers concurrently across executors within a super-step
    pub parallel: bool,
    /// Bound on super-steps before the run fails
    pub max_supersteps: u64,
    /// Checkpoint cadence
    pub checkpoint_policy: CheckpointPolicy,
    /// Error policy applied when no per-executor override exists
    pub default_error_policy: ErrorPolicy,
    /// Per-executor error policy overrides
    pub error_policies: HashMap<ExecutorId, ErrorPolicy>,
    /// Fan-in cohort timeout in super-steps
    pub fan_in_timeout_steps: Option<u64>,
    /// Optional inbox bound applied to every executor
    pub inbox_bound: Option<InboxBound>,
    /// Store checkpoints are written through
    pub checkpoint_store: Option<Arc<dyn CheckpointStore>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            max_supersteps: 256,
            checkpoint_policy: CheckpointPolicy::OnSuspend,
            default_error_policy: ErrorPolicy::FailRun,
            error_policies: HashMap::new(),
            fan_in_timeout_steps: None,
            inbox_bound: None,
            checkpoint_store: None,
        }
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("parallel", &self.parallel)
            .field("max_supersteps", &self.max_supersteps)
            .field("checkpoint_policy", &self.checkpoint_policy)
            .field("default_error_policy", &self.default_error_policy)
            .field("fan_in_timeout_steps", &self.fan_in_timeout_steps)
            .field(
                "checkpoint_store",
                &self.checkpoint_store.as_ref().map(|_| "<store>"),
            )
            .finish()
    }
}

impl RunOptions {
    /// Run handlers one executor at a time, in registration order
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Set the super-step bound
    pub fn with_max_supersteps(mut self, max: u64) -> Self {
        self.max_supersteps = max;
        self
    }

    /// Set the checkpoint cadence
    pub fn with_checkpoint_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint_policy = policy;
        self
    }

    /// Set the default error policy
    pub fn with_default_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.default_error_policy = policy;
        self
    }

    /// Override the error policy for one executor
    pub fn with_error_policy(mut self, executor: impl Into<ExecutorId>, policy: ErrorPolicy) -> Self {
        self.error_policies.insert(executor.into(), policy);
        self
    }

    /// Set the fan-in cohort timeout, in super-steps
    pub fn with_fan_in_timeout(mut self, steps: u64) -> Self {
        self.fan_in_timeout_steps = Some(steps);
        self
    }

    /// Bound every inbox
    pub fn with_inbox_bound(mut self, bound: InboxBound) -> Self {
        self.inbox_bound = Some(bound);
        self
    }

    /// Attach the checkpoint store
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }
}

enum EnvelopeOutcome {
    Handled(Envelope, HandlerEffects),
    Failed(Envelope, WorkflowError),
    NoHandler(Envelope),
}

type TargetResult = (ExecutorId, Box<dyn Executor>, Vec<EnvelopeOutcome>);

/// The run loop state machine; driven by [`crate::run`]
pub(crate) struct Scheduler {
    workflow: Arc<Workflow>,
    options: RunOptions,
    events: mpsc::UnboundedSender<RunEvent>,
    cancelled: Arc<AtomicBool>,
    run_id: String,
    step: u64,
    inboxes: HashMap<ExecutorId, VecDeque<Envelope>>,
    spill: VecDeque<Envelope>,
    scopes: ScopeState,
    instances: HashMap<ExecutorId, Box<dyn Executor>>,
    executor_states: HashMap<ExecutorId, Value>,
    router: EdgeRouter,
    pending_requests: Vec<ExternalInputRequest>,
    last_output: Option<TypedPayload>,
    status: RunStatus,
    last_checkpoint_id: Option<CheckpointId>,
    retry_delay: Option<Duration>,
    failure: Option<RunFailure>,
}

impl Scheduler {
    pub(crate) fn new(
        workflow: Arc<Workflow>,
        run_id: String,
        options: RunOptions,
        events: mpsc::UnboundedSender<RunEvent>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let mut scopes = ScopeState::new();
        for (scope, key, kind) in workflow.scope_declarations() {
            scopes.declare(*scope, key.clone(), *kind);
        }
        for (scope, key, value) in workflow.scope_defaults() {
            scopes.commit(vec![(
                INPUT_SOURCE.to_string(),
                ScopeWrite::set(*scope, key.clone(), value.clone()),
            )]);
        }
        scopes.set_system("run_id", json!(run_id));
        scopes.set_system("workflow_id", json!(workflow.id));
        scopes.set_system("workflow_name", json!(workflow.name));
        scopes.set_system("started_at", json!(chrono::Utc::now().to_rfc3339()));

        let router = EdgeRouter::new(options.fan_in_timeout_steps);
        Self {
            workflow,
            options,
            events,
            cancelled,
            run_id,
            step: 0,
            inboxes: HashMap::new(),
            spill: VecDeque::new(),
            scopes,
            instances: HashMap::new(),
            executor_states: HashMap::new(),
            router,
            pending_requests: Vec::new(),
            last_output: None,
            status: RunStatus::Running,
            last_checkpoint_id: None,
            retry_delay: None,
            failure: None,
        }
    }

    /// Rebuild a scheduler from a checkpoint; applies nothing on failure
    pub(crate) fn from_checkpoint(
        workflow: Arc<Workflow>,
        options: RunOptions,
        events: mpsc::UnboundedSender<RunEvent>,
        cancelled: Arc<AtomicBool>,
        checkpoint: RunCheckpoint,
    ) -> Result<Self> {
        let mut scheduler = Self::new(
            workflow.clone(),
            checkpoint.run_id.clone(),
            options,
            events,
            cancelled,
        );
        scheduler.step = checkpoint.step;
        scheduler.scopes.restore(&checkpoint.scopes);

        for (executor_id, blob) in &checkpoint.executor_states {
            let binding = workflow.binding(executor_id).ok_or_else(|| {
                WorkflowError::Custom(format!(
                    "checkpoint references unknown executor '{}'",
                    executor_id
                ))
            })?;
            let mut instance = (binding.factory)();
            instance.on_restore(blob.clone())?;
            scheduler.instances.insert(executor_id.clone(), instance);
        }
        scheduler.executor_states = checkpoint.executor_states.clone();

        for (executor_id, envelopes) in &checkpoint.inboxes {
            if workflow.binding(executor_id).is_none() {
                return Err(WorkflowError::Custom(format!(
                    "checkpoint inbox references unknown executor '{}'",
                    executor_id
                )));
            }
            let mut queue = VecDeque::new();
            for value in envelopes {
                queue.push_back(serde_json::from_value::<Envelope>(value.clone())?);
            }
            scheduler.inboxes.insert(executor_id.clone(), queue);
        }

        scheduler.router.restore(&checkpoint.edge_buffers);
        for value in &checkpoint.pending_requests {
            scheduler
                .pending_requests
                .push(serde_json::from_value(value.clone())?);
        }
        scheduler.last_output = checkpoint
            .last_output
            .as_ref()
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?;
        scheduler.last_checkpoint_id = Some(checkpoint.id.clone());
        scheduler.status = if scheduler.pending_requests.is_empty() {
            RunStatus::Running
        } else {
            RunStatus::AwaitingInput
        };
        Ok(scheduler)
    }

    pub(crate) fn status(&self) -> RunStatus {
        self.status
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn emit_started(&self) {
        self.send(RunEvent::Started);
    }

    fn send(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    fn diagnostic(&self, event: DiagnosticEvent) {
        self.send(RunEvent::Diagnostic(event));
    }

    pub(crate) fn emit_diagnostic(&self, event: DiagnosticEvent) {
        self.diagnostic(event);
    }

    /// Queue the initial external input into the start executor
    pub(crate) fn inject_input(&mut self, payload: TypedPayload) -> Result<()> {
        let start = self.workflow.start_executor_id.clone();
        let binding = self
            .workflow
            .binding(&start)
            .expect("validated at build time");
        if !binding.accepts(&payload.type_tag) {
            return Err(WorkflowError::Routing {
                emitter: INPUT_SOURCE.to_string(),
                type_tag: payload.type_tag,
            });
        }

        // Workflow inputs: an object-shaped payload seeds topic variables.
        if self.workflow.seeds_topic_from_input() {
            if let Value::Object(fields) = &payload.value {
                let writes = fields
                    .iter()
                    .map(|(key, value)| {
                        (
                            INPUT_SOURCE.to_string(),
                            ScopeWrite::set(crate::scopes::ScopeKind::Topic, key, value.clone()),
                        )
                    })
                    .collect();
                self.scopes.commit(writes);
            }
        }

        // Runtime fact: the triggering user message, for UserMessage().
        let user_message = match payload.type_tag.as_str() {
            tags::CHAT_MESSAGE => ChatMessage::from_tagged_value(&payload.value)
                .map(|m| json!(m.text())),
            _ => payload.value.as_str().map(|s| json!(s)),
        };
        if let Some(value) = user_message {
            self.scopes.set_system("user_message", value);
        }

        let envelope = Envelope::new(INPUT_SOURCE, payload).with_target(start);
        self.deposit(envelope);
        Ok(())
    }

    /// Validate and apply a resume response; rejects without advancing state
    pub(crate) fn resume_with(&mut self, response: ExternalInputResponse) -> Result<()> {
        if self.status != RunStatus::AwaitingInput {
            return Err(WorkflowError::ExternalInput(
                "run is not awaiting input".to_string(),
            ));
        }
        let index = match_response(&self.pending_requests, &response)
            .map_err(WorkflowError::ExternalInput)?;
        let request = self.pending_requests.remove(index);

        let envelope = Envelope::new(
            INPUT_SOURCE,
            TypedPayload::new(
                tags::EXTERNAL_RESPONSE,
                serde_json::to_value(&response.message)?,
            ),
        )
        .with_target(request.executor_id.clone())
        .with_delivery(request.delivery_id.clone());
        self.deposit(envelope);
        self.status = RunStatus::Running;
        Ok(())
    }

    pub(crate) fn mark_cancelled(&mut self) {
        if matches!(self.status, RunStatus::Running | RunStatus::AwaitingInput) {
            self.status = RunStatus::Cancelled;
            self.send(RunEvent::Cancelled);
        }
    }

    fn deposit(&mut self, envelope: Envelope) {
        let target = envelope
            .target_id
            .clone()
            .expect("routed envelopes always carry a target");
        let mut dropped_oldest = false;
        let queue = self.inboxes.entry(target.clone()).or_default();
        if let Some(bound) = self.options.inbox_bound {
            if queue.len() >= bound.capacity {
                match bound.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        dropped_oldest = true;
                    }
                    OverflowPolicy::Block => {
                        self.spill.push_back(envelope);
                        return;
                    }
                }
            }
        }
        queue.push_back(envelope);
        if dropped_oldest {
            self.diagnostic(DiagnosticEvent::InboxOverflow {
                executor_id: target,
            });
        }
    }

    fn drain_spill(&mut self) {
        let spilled: Vec<Envelope> = self.spill.drain(..).collect();
        for envelope in spilled {
            self.deposit(envelope);
        }
    }

    fn fail_run(&mut self, executor: &str, error: WorkflowError) {
        let wrapped = WorkflowError::run_failed(self.workflow.id.clone(), executor, error);
        let failure = RunFailure::from_error(
            self.workflow.id.clone(),
            Some(executor.to_string()),
            &wrapped,
        );
        tracing::error!(
            run_id = %self.run_id,
            workflow_id = %self.workflow.id,
            executor_id = %executor,
            error_type = "handler",
            "run failed"
        );
        self.failure = Some(failure.clone());
        self.status = RunStatus::Failed;
        self.send(RunEvent::Failed(failure));
    }

    fn error_policy(&self, executor: &str) -> ErrorPolicy {
        self.options
            .error_policies
            .get(executor)
            .cloned()
            .unwrap_or_else(|| self.options.default_error_policy.clone())
    }

    fn observe(&self, observation: &DeliveryObservation) {
        tracing::debug!(
            run_id = %self.run_id,
            workflow_id = %self.workflow.id,
            executor_id = %observation.source,
            edge_group_id = observation.edge_id.as_deref().unwrap_or(""),
            delivery_status = observation.status.as_str(),
            type_tag = %observation.type_tag,
            "edge delivery"
        );
        if !matches!(
            observation.status,
            DeliveryStatus::Delivered | DeliveryStatus::Buffered
        ) {
            self.diagnostic(DiagnosticEvent::Delivery(observation.clone()));
        }
    }

    /// Execute one super-step: drain, invoke, commit, then decide
    pub(crate) async fn superstep(&mut self) {
        if self.status != RunStatus::Running {
            return;
        }
        if self.step >= self.options.max_supersteps {
            let max = self.options.max_supersteps;
            self.fail_run("<scheduler>", WorkflowError::MaxSuperSteps(max));
            return;
        }
        if let Some(delay) = self.retry_delay.take() {
            tokio::time::sleep(delay).await;
        }

        // Inbox drain phase: the frontier is everything queued right now,
        // grouped per target in registration order.
        self.drain_spill();
        let mut frontier: Vec<(ExecutorId, Vec<Envelope>)> = Vec::new();
        let order: Vec<ExecutorId> = self.workflow.executor_order().to_vec();
        for executor_id in &order {
            if let Some(queue) = self.inboxes.get_mut(executor_id) {
                if !queue.is_empty() {
                    frontier.push((executor_id.clone(), queue.drain(..).collect()));
                }
            }
        }

        // Handler invocation phase.
        let results = self.invoke_frontier(frontier).await;

        // Commit phase.
        self.commit(results);
        if self.status == RunStatus::Failed {
            return;
        }

        self.step += 1;
        tracing::info!(
            run_id = %self.run_id,
            workflow_id = %self.workflow.id,
            step = self.step,
            "super-step committed"
        );
        self.send(RunEvent::SuperStep(self.step));

        match self.options.checkpoint_policy {
            CheckpointPolicy::EveryStep => self.cadence_checkpoint().await,
            CheckpointPolicy::EveryN(n) if n > 0 && self.step % n == 0 => {
                self.cadence_checkpoint().await
            }
            _ => {}
        }

        // Termination check.
        let has_messages =
            self.inboxes.values().any(|q| !q.is_empty()) || !self.spill.is_empty();
        if !self.pending_requests.is_empty() {
            self.status = RunStatus::AwaitingInput;
            if self.options.checkpoint_policy == CheckpointPolicy::OnSuspend {
                self.cadence_checkpoint().await;
            }
        } else if !has_messages {
            self.status = RunStatus::Completed;
            self.send(RunEvent::Completed(self.last_output.clone()));
        }
    }

    async fn invoke_frontier(
        &mut self,
        frontier: Vec<(ExecutorId, Vec<Envelope>)>,
    ) -> Vec<TargetResult> {
        let snapshot = Arc::new(self.scopes.clone());
        let mut futures: Vec<Pin<Box<dyn Future<Output = TargetResult> + Send>>> = Vec::new();

        for (executor_id, envelopes) in frontier {
            let binding = self
                .workflow
                .binding(&executor_id)
                .expect("frontier targets are registered")
                .clone();
            let mut instance = match self.instances.remove(&executor_id) {
                Some(instance) => instance,
                None => (binding.factory)(),
            };
            let snapshot = snapshot.clone();
            let cancelled = self.cancelled.clone();
            let run_id = self.run_id.clone();
            let workflow_id = self.workflow.id.clone();

            futures.push(Box::pin(async move {
                let mut outcomes = Vec::with_capacity(envelopes.len());
                // Per-executor invocations are serialized; only distinct
                // executors overlap in parallel mode.
                for envelope in envelopes {
                    if binding.resolve_input(&envelope.payload.type_tag).is_none() {
                        outcomes.push(EnvelopeOutcome::NoHandler(envelope));
                        continue;
                    }
                    let mut ctx = ExecutorContext::new(
                        run_id.clone(),
                        workflow_id.clone(),
                        executor_id.clone(),
                        envelope.trace_span.clone(),
                        envelope.delivery_id.clone(),
                        snapshot.clone(),
                        cancelled.clone(),
                    );
                    match instance.handle(envelope.payload.clone(), &mut ctx).await {
                        Ok(()) => {
                            outcomes.push(EnvelopeOutcome::Handled(envelope, ctx.into_effects()))
                        }
                        Err(error) => outcomes.push(EnvelopeOutcome::Failed(envelope, error)),
                    }
                }
                (executor_id, instance, outcomes)
            }));
        }

        if self.options.parallel {
            join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(futures.len());
            for future in futures {
                results.push(future.await);
            }
            results
        }
    }

    fn commit(&mut self, results: Vec<TargetResult>) {
        let mut scope_writes: Vec<(ExecutorId, ScopeWrite)> = Vec::new();
        let mut emissions: Vec<(ExecutorId, DeliveryId, String, EmittedMessage)> = Vec::new();
        let mut retry_deposits: Vec<Envelope> = Vec::new();
        let mut new_requests: Vec<ExternalInputRequest> = Vec::new();

        for (executor_id, instance, outcomes) in results {
            self.instances.insert(executor_id.clone(), instance);
            for outcome in outcomes {
                match outcome {
                    EnvelopeOutcome::NoHandler(envelope) => {
                        self.observe(&DeliveryObservation {
                            edge_id: None,
                            source: envelope.source_id.clone(),
                            target: Some(executor_id.clone()),
                            type_tag: envelope.payload.type_tag.clone(),
                            status: DeliveryStatus::DroppedTypeMismatch,
                        });
                    }
                    EnvelopeOutcome::Failed(envelope, error) => {
                        self.observe(&DeliveryObservation {
                            edge_id: None,
                            source: envelope.source_id.clone(),
                            target: Some(executor_id.clone()),
                            type_tag: envelope.payload.type_tag.clone(),
                            status: DeliveryStatus::Exception,
                        });
                        match self.error_policy(&executor_id) {
                            ErrorPolicy::FailRun => {
                                self.fail_run(&executor_id, error);
                                return;
                            }
                            ErrorPolicy::SkipMessage => {
                                tracing::warn!(
                                    run_id = %self.run_id,
                                    executor_id = %executor_id,
                                    error_type = "handler",
                                    "handler failed; skipping message: {error}"
                                );
                            }
                            ErrorPolicy::RetryWithBackoff {
                                max_attempts,
                                base_delay,
                            } => {
                                if envelope.attempt < max_attempts {
                                    let mut retry = envelope;
                                    let exponent = retry.attempt.min(16);
                                    retry.attempt += 1;
                                    let delay = base_delay * 2u32.pow(exponent);
                                    self.retry_delay = Some(
                                        self.retry_delay
                                            .map(|d| d.max(delay))
                                            .unwrap_or(delay),
                                    );
                                    retry_deposits.push(retry);
                                } else {
                                    self.fail_run(&executor_id, error);
                                    return;
                                }
                            }
                        }
                    }
                    EnvelopeOutcome::Handled(envelope, effects) => {
                        for write in effects.scope_writes {
                            scope_writes.push((executor_id.clone(), write));
                        }
                        if let Some(blob) = effects.state_blob {
                            self.executor_states.insert(executor_id.clone(), blob);
                        }
                        for request in effects.external_requests {
                            new_requests.push(request);
                        }
                        for event in effects.events {
                            self.diagnostic(DiagnosticEvent::ExecutorEvent {
                                executor_id: executor_id.clone(),
                                event,
                            });
                        }
                        for message in effects.emitted {
                            emissions.push((
                                executor_id.clone(),
                                envelope.delivery_id.clone(),
                                envelope.trace_span.clone(),
                                message,
                            ));
                        }
                    }
                }
            }
        }

        // Scope writes commit atomically, in deterministic order (results
        // arrive in registration order, writes in emission order).
        let conflicts = self.scopes.commit(scope_writes);
        for conflict in conflicts {
            tracing::warn!(
                run_id = %self.run_id,
                scope = conflict.scope.as_str(),
                key = %conflict.key,
                "conflicting scope writes; last write wins"
            );
            self.diagnostic(DiagnosticEvent::ScopeConflict(conflict));
        }

        // Route emissions through edge runners into the next frontier.
        for (source, delivery_id, trace_span, message) in emissions {
            let outcome = self.router.route(
                &self.workflow,
                &source,
                message,
                &delivery_id,
                &trace_span,
                self.step,
            );
            for observation in &outcome.observations {
                self.observe(observation);
            }
            for envelope in outcome.deliveries {
                self.deposit(envelope);
            }
            if let Some(payload) = outcome.output {
                self.last_output = Some(payload.clone());
                self.send(RunEvent::Emitted(payload));
            }
        }

        for envelope in retry_deposits {
            self.deposit(envelope);
        }

        for (edge_id, delivery_id) in self.router.evict_expired(self.step) {
            self.diagnostic(DiagnosticEvent::CohortEvicted {
                edge_id,
                delivery_id,
            });
        }

        for request in new_requests {
            self.pending_requests.push(request.clone());
            self.send(RunEvent::ExternalInputRequested(request));
        }
    }

    async fn cadence_checkpoint(&mut self) {
        if self.options.checkpoint_store.is_none() {
            return;
        }
        if let Err(error) = self.write_checkpoint().await {
            tracing::warn!(
                run_id = %self.run_id,
                error_type = "checkpoint",
                "checkpoint write failed: {error}"
            );
            self.diagnostic(DiagnosticEvent::CheckpointWriteFailed {
                error: error.to_string(),
            });
        }
    }

    /// Capture and persist a checkpoint at the current boundary
    pub(crate) async fn write_checkpoint(&mut self) -> Result<CheckpointId> {
        let store = self
            .options
            .checkpoint_store
            .clone()
            .ok_or_else(|| WorkflowError::Custom("no checkpoint store configured".to_string()))?;

        let mut checkpoint = RunCheckpoint::new(self.run_id.clone()).with_step(self.step);
        if let Some(parent) = &self.last_checkpoint_id {
            checkpoint = checkpoint.with_parent(parent.clone());
        }
        checkpoint.scopes = self.scopes.snapshot();

        let mut states = self.executor_states.clone();
        for (executor_id, instance) in &self.instances {
            if let Some(blob) = instance.snapshot_state() {
                states.insert(executor_id.clone(), blob);
            }
        }
        checkpoint.executor_states = states;

        let mut inboxes: HashMap<String, Vec<Value>> = HashMap::new();
        for (executor_id, queue) in &self.inboxes {
            if queue.is_empty() {
                continue;
            }
            let mut envelopes = Vec::with_capacity(queue.len());
            for envelope in queue {
                envelopes.push(serde_json::to_value(envelope)?);
            }
            inboxes.insert(executor_id.clone(), envelopes);
        }
        for envelope in &self.spill {
            let target = envelope.target_id.clone().unwrap_or_default();
            inboxes
                .entry(target)
                .or_default()
                .push(serde_json::to_value(envelope)?);
        }
        checkpoint.inboxes = inboxes;

        checkpoint.edge_buffers = self.router.snapshot();
        checkpoint.pending_requests = self
            .pending_requests
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;
        checkpoint.last_output = self
            .last_output
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let id = store.create_checkpoint(&checkpoint).await?;
        tracing::info!(
            run_id = %self.run_id,
            workflow_id = %self.workflow.id,
            checkpoint_id = %id,
            step = self.step,
            "checkpoint written"
        );
        self.last_checkpoint_id = Some(id.clone());
        self.send(RunEvent::Checkpointed(id.clone()));
        Ok(id)
    }
}
