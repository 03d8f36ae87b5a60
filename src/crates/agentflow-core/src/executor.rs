//! Executor trait and the handler context
//!
//! An executor is a named unit with typed message handlers - the node type
//! of the workflow graph. Handlers receive the payload and an
//! [`ExecutorContext`]; everything a handler can do to the run (emit
//! messages, write scopes, request external input, save state) goes
//! through the context and is **buffered** until the super-step commit
//! phase. Reads come from the pre-step scope snapshot, so a handler never
//! observes writes queued in the same super-step.
//!
//! There is no reflection anywhere: dispatch is the type-tag table the
//! binding declares at registration
//! ([`ExecutorBinding::resolve_input`](crate::workflow::ExecutorBinding::resolve_input)),
//! and the context is an explicit value threaded into every invocation -
//! no ambient run state.
//!
//! # Implementing an executor
//!
//! ```rust
//! use agentflow_core::executor::{Executor, ExecutorContext};
//! use agentflow_core::envelope::TypedPayload;
//! use async_trait::async_trait;
//! use serde_json::json;
//!
//! struct Doubler;
//!
//! #[async_trait]
//! impl Executor for Doubler {
//!     fn kind(&self) -> &str {
//!         "doubler"
//!     }
//!
//!     async fn handle(
//!         &mut self,
//!         payload: TypedPayload,
//!         ctx: &mut ExecutorContext,
//!     ) -> agentflow_core::Result<()> {
//!         let n = payload.value.as_i64().unwrap_or(0);
//!         ctx.emit(TypedPayload::new("i64", json!(n * 2)));
//!         Ok(())
//!     }
//! }
//! ```

use crate::envelope::{DeliveryId, ExecutorId, TypedPayload};
use crate::error::Result;
use crate::external::ExternalInputRequest;
use crate::messages::ChatMessage;
use crate::scopes::{ScopeKind, ScopeState, ScopeWrite};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A unit with typed message handlers; the node type of the graph
#[async_trait]
pub trait Executor: Send {
    /// Executor type tag; identity is `(kind, instance id)`
    fn kind(&self) -> &str;

    /// Handle one payload
    ///
    /// The scheduler resolves the payload type against the binding's
    /// declared inputs before calling; a payload with no matching declared
    /// type never reaches the handler.
    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()>;

    /// Opaque state captured into checkpoints
    ///
    /// Overrides [`ExecutorContext::save_executor_state`] blobs when both
    /// are present at capture time.
    fn snapshot_state(&self) -> Option<Value> {
        None
    }

    /// Lifecycle hook invoked on restore with the checkpointed state blob
    fn on_restore(&mut self, _blob: Value) -> Result<()> {
        Ok(())
    }
}

/// A message queued for routing during the commit phase
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedMessage {
    /// Explicit target for `emit_to`; `None` routes through edge groups
    pub target: Option<ExecutorId>,
    /// The payload
    pub payload: TypedPayload,
}

/// Everything a handler invocation produced, applied at commit
#[derive(Debug, Default)]
pub struct HandlerEffects {
    /// Messages in emission order
    pub emitted: Vec<EmittedMessage>,
    /// Queued scope writes in emission order
    pub scope_writes: Vec<ScopeWrite>,
    /// Per-executor state blob saved via the context
    pub state_blob: Option<Value>,
    /// External-input requests raised by the handler
    pub external_requests: Vec<ExternalInputRequest>,
    /// Observer events (not state-bearing)
    pub events: Vec<Value>,
}

/// The contract a handler depends on, threaded into every invocation
pub struct ExecutorContext {
    run_id: String,
    workflow_id: String,
    executor_id: ExecutorId,
    trace_id: String,
    delivery_id: DeliveryId,
    scopes: Arc<ScopeState>,
    cancelled: Arc<AtomicBool>,
    span: tracing::Span,
    pub(crate) effects: HandlerEffects,
}

impl ExecutorContext {
    pub(crate) fn new(
        run_id: impl Into<String>,
        workflow_id: impl Into<String>,
        executor_id: impl Into<ExecutorId>,
        trace_id: impl Into<String>,
        delivery_id: impl Into<DeliveryId>,
        scopes: Arc<ScopeState>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        let run_id = run_id.into();
        let executor_id = executor_id.into();
        let span = tracing::info_span!(
            "handler",
            run_id = %run_id,
            executor_id = %executor_id
        );
        Self {
            run_id,
            workflow_id: workflow_id.into(),
            executor_id,
            trace_id: trace_id.into(),
            delivery_id: delivery_id.into(),
            scopes,
            cancelled,
            span,
            effects: HandlerEffects::default(),
        }
    }

    /// Publish a message on the executor's outgoing edges
    ///
    /// Routing (fan-out, conditions, switches) happens at commit; the
    /// emitted envelope inherits the current delivery cohort.
    pub fn emit(&mut self, payload: TypedPayload) {
        self.effects.emitted.push(EmittedMessage {
            target: None,
            payload,
        });
    }

    /// Send directly to a named executor, bypassing edge routing
    pub fn emit_to(&mut self, target: impl Into<ExecutorId>, payload: TypedPayload) {
        self.effects.emitted.push(EmittedMessage {
            target: Some(target.into()),
            payload,
        });
    }

    /// Read a scope value from the pre-step snapshot
    pub fn read_scope(&self, scope: ScopeKind, key: &str) -> Option<Value> {
        self.scopes.read(scope, key).cloned()
    }

    /// Queue a scope write; applied atomically at the super-step boundary
    ///
    /// Rejects writes to the read-only system scope and values whose kind
    /// contradicts the key's declaration; either failure fails the handler.
    pub fn queue_scope_write(
        &mut self,
        scope: ScopeKind,
        key: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        let write = ScopeWrite::set(scope, key, value);
        self.scopes.validate_write(&write)?;
        self.effects.scope_writes.push(write);
        Ok(())
    }

    /// Queue removal of a single key
    pub fn queue_scope_remove(&mut self, scope: ScopeKind, key: impl Into<String>) -> Result<()> {
        let write = ScopeWrite::remove(scope, key);
        self.scopes.validate_write(&write)?;
        self.effects.scope_writes.push(write);
        Ok(())
    }

    /// Queue removal of every key in a scope
    pub fn queue_scope_clear(&mut self, scope: ScopeKind) -> Result<()> {
        let write = ScopeWrite::clear(scope);
        self.scopes.validate_write(&write)?;
        self.effects.scope_writes.push(write);
        Ok(())
    }

    /// Publish a suspension request; the scheduler pauses the run and
    /// surfaces the request to callers. Returns the request id.
    pub fn request_external(&mut self, message: ChatMessage) -> String {
        let request =
            ExternalInputRequest::new(self.executor_id.clone(), self.delivery_id.clone(), message);
        let request_id = request.request_id.clone();
        self.effects.external_requests.push(request);
        request_id
    }

    /// Emit a diagnostic/observer event (not state-bearing)
    pub fn emit_event(&mut self, event: Value) {
        self.effects.events.push(event);
    }

    /// Save opaque per-executor state into checkpoints; returned to
    /// [`Executor::on_restore`] after a restart
    pub fn save_executor_state(&mut self, blob: Value) {
        self.effects.state_blob = Some(blob);
    }

    /// Id of the run being executed
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Id of the workflow the run executes
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Id of the executor being invoked
    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// Trace correlation id of the envelope being handled
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Delivery cohort of the envelope being handled
    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    /// Cooperative cancellation check for long-running handlers
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Structured logging span scoped to this invocation
    pub fn logger(&self) -> &tracing::Span {
        &self.span
    }

    /// Consume the context, yielding the buffered effects
    pub(crate) fn into_effects(self) -> HandlerEffects {
        self.effects
    }
}

impl crate::expr::ScopeReader for ExecutorContext {
    fn read(&self, scope: ScopeKind, key: &str) -> Option<Value> {
        self.read_scope(scope, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutorContext {
        let mut scopes = ScopeState::new();
        scopes.set_system("run_id", json!("run-1"));
        ExecutorContext::new(
            "run-1",
            "wf-1",
            "exec-1",
            "trace-1",
            "delivery-1",
            Arc::new(scopes),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_emit_buffers_in_order() {
        let mut ctx = context();
        ctx.emit(TypedPayload::new("a", json!(1)));
        ctx.emit_to("other", TypedPayload::new("b", json!(2)));

        assert_eq!(ctx.effects.emitted.len(), 2);
        assert_eq!(ctx.effects.emitted[0].target, None);
        assert_eq!(ctx.effects.emitted[1].target.as_deref(), Some("other"));
    }

    #[test]
    fn test_reads_see_snapshot_not_queued_writes() {
        let mut ctx = context();
        ctx.queue_scope_write(ScopeKind::Topic, "x", json!(1)).unwrap();
        assert_eq!(ctx.read_scope(ScopeKind::Topic, "x"), None);
    }

    #[test]
    fn test_system_writes_fail() {
        let mut ctx = context();
        assert!(ctx
            .queue_scope_write(ScopeKind::System, "run_id", json!("evil"))
            .is_err());
    }

    #[test]
    fn test_request_external_captures_identity() {
        let mut ctx = context();
        let id = ctx.request_external(ChatMessage::approval_request(
            "call-1",
            "tool",
            json!({}),
        ));
        let request = &ctx.effects.external_requests[0];
        assert_eq!(request.request_id, id);
        assert_eq!(request.executor_id, "exec-1");
        assert_eq!(request.delivery_id, "delivery-1");
    }
}
