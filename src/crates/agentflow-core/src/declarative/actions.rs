//! Executors the declarative actions compile to
//!
//! One executor type per action kind. Sequential flow travels as a
//! `flow.token` payload; branching executors (`condition`, `switch`,
//! `loop_each`) stamp the token with a `branch` field that the compiled
//! switch edge group routes on. Loop break/continue are plain control
//! payloads carried on an edge from the break/continue executor back to
//! its enclosing loop.
//!
//! Each executor only emits a token when the compiler wired a successor
//! for that path; a path that reaches the end of the document simply
//! quiesces.

use super::compile::{CompiledTableOp, VariablePath};
use crate::agent::AgentExecutor;
use crate::envelope::{tags, TypedPayload};
use crate::error::{Result, WorkflowError};
use crate::executor::{Executor, ExecutorContext};
use crate::expr::{is_truthy, to_display_string, CompiledValue};
use crate::messages::{
    messages_from_tagged_value, messages_to_tagged_value, ChatMessage, TableRecord,
};
use crate::scopes::{ScopeKind, ValueKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub(crate) fn flow_token() -> TypedPayload {
    TypedPayload::new(tags::FLOW_TOKEN, json!({}))
}

pub(crate) fn branch_token(branch: &str) -> TypedPayload {
    TypedPayload::new(tags::FLOW_TOKEN, json!({ "branch": branch }))
}

fn eval(value: &CompiledValue, ctx: &ExecutorContext) -> Result<Value> {
    value.evaluate(ctx).map_err(|e| WorkflowError::Expression {
        expression: value.source(),
        error: e.to_string(),
    })
}

/// Read a (possibly nested) variable from the pre-step snapshot
pub(crate) fn read_variable(ctx: &ExecutorContext, path: &VariablePath) -> Value {
    let mut value = ctx
        .read_scope(path.scope, &path.segments[0])
        .unwrap_or(Value::Null);
    for segment in &path.segments[1..] {
        value = value.get(segment).cloned().unwrap_or(Value::Null);
    }
    value
}

/// Queue a (possibly nested) variable write
///
/// Nested paths read-modify-write the top-level key against the pre-step
/// snapshot; the merged value commits at the boundary.
pub(crate) fn write_variable(
    ctx: &mut ExecutorContext,
    path: &VariablePath,
    value: Value,
) -> Result<()> {
    if path.segments.len() == 1 {
        return ctx.queue_scope_write(path.scope, &path.segments[0], value);
    }
    let mut root = ctx
        .read_scope(path.scope, &path.segments[0])
        .unwrap_or_else(|| json!({}));
    set_path(&mut root, &path.segments[1..], value);
    ctx.queue_scope_write(path.scope, &path.segments[0], root)
}

fn remove_variable(ctx: &mut ExecutorContext, path: &VariablePath) -> Result<()> {
    if path.segments.len() == 1 {
        ctx.queue_scope_remove(path.scope, &path.segments[0])
    } else {
        write_variable(ctx, path, Value::Null)
    }
}

fn set_path(root: &mut Value, segments: &[String], value: Value) {
    if segments.is_empty() {
        *root = value;
        return;
    }
    if !root.is_object() {
        *root = json!({});
    }
    let map = root.as_object_mut().expect("coerced to object above");
    if segments.len() == 1 {
        map.insert(segments[0].clone(), value);
        return;
    }
    let child = map.entry(segments[0].clone()).or_insert_with(|| json!({}));
    set_path(child, &segments[1..], value);
}

/// `send_activity`: surface a message to the conversation
pub(crate) struct SendActivityExecutor {
    pub message: CompiledValue,
    pub emits: bool,
}

#[async_trait]
impl Executor for SendActivityExecutor {
    fn kind(&self) -> &str {
        "send_activity"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let text = to_display_string(&eval(&self.message, ctx)?);
        let message = ChatMessage::assistant(text.clone());

        let mut history = messages_from_tagged_value(
            ctx.read_scope(ScopeKind::Conversation, crate::agent::CONVERSATION_HISTORY_KEY)
                .as_ref(),
        );
        history.push(message);
        ctx.queue_scope_write(
            ScopeKind::Conversation,
            crate::agent::CONVERSATION_HISTORY_KEY,
            messages_to_tagged_value(&history),
        )?;
        ctx.emit_event(json!({ "activity": text }));
        if self.emits {
            ctx.emit(flow_token());
        }
        Ok(())
    }
}

/// `set_variable`
pub(crate) struct SetVariableExecutor {
    pub target: VariablePath,
    pub value: CompiledValue,
    pub emits: bool,
}

#[async_trait]
impl Executor for SetVariableExecutor {
    fn kind(&self) -> &str {
        "set_variable"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let value = eval(&self.value, ctx)?;
        write_variable(ctx, &self.target, value)?;
        if self.emits {
            ctx.emit(flow_token());
        }
        Ok(())
    }
}

/// `parse_value`: evaluate, coerce to a declared kind, then assign
pub(crate) struct ParseValueExecutor {
    pub target: VariablePath,
    pub value: CompiledValue,
    pub value_kind: ValueKind,
    pub emits: bool,
}

#[async_trait]
impl Executor for ParseValueExecutor {
    fn kind(&self) -> &str {
        "parse_value"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let raw = eval(&self.value, ctx)?;
        let coerced = coerce(&raw, self.value_kind).map_err(|error| {
            WorkflowError::state(
                self.target.scope.as_str(),
                self.target.segments.join("."),
                error,
            )
        })?;
        write_variable(ctx, &self.target, coerced)?;
        if self.emits {
            ctx.emit(flow_token());
        }
        Ok(())
    }
}

fn coerce(value: &Value, kind: ValueKind) -> std::result::Result<Value, String> {
    let fail = |value: &Value| {
        Err(format!(
            "cannot interpret '{}' as {:?}",
            to_display_string(value),
            kind
        ))
    };
    match kind {
        ValueKind::Null => Ok(Value::Null),
        ValueKind::String => Ok(json!(to_display_string(value))),
        ValueKind::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(n) if n.fract() == 0.0 => Ok(json!(n as i64)),
                Ok(n) => Ok(json!(n)),
                Err(_) => fail(value),
            },
            _ => fail(value),
        },
        ValueKind::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" => Ok(json!(true)),
                "false" | "no" => Ok(json!(false)),
                _ => fail(value),
            },
            _ => fail(value),
        },
        ValueKind::List => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => fail(value),
        },
        ValueKind::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => fail(value),
        },
        ValueKind::Message | ValueKind::MessageList | ValueKind::Table => {
            if ValueKind::of(value) == kind {
                Ok(value.clone())
            } else {
                fail(value)
            }
        }
    }
}

/// `condition`: evaluate and stamp the token with the taken branch
pub(crate) struct ConditionExecutor {
    pub condition: CompiledValue,
    pub emit_then: bool,
    pub emit_else: bool,
}

#[async_trait]
impl Executor for ConditionExecutor {
    fn kind(&self) -> &str {
        "condition"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let taken = is_truthy(&eval(&self.condition, ctx)?);
        match (taken, self.emit_then, self.emit_else) {
            (true, true, _) => ctx.emit(branch_token("then")),
            (false, _, true) => ctx.emit(branch_token("else")),
            _ => {}
        }
        Ok(())
    }
}

/// `switch`: first truthy case wins, optional default
pub(crate) struct SwitchExecutor {
    pub cases: Vec<CompiledValue>,
    pub emit_case: Vec<bool>,
    pub emit_default: bool,
}

#[async_trait]
impl Executor for SwitchExecutor {
    fn kind(&self) -> &str {
        "switch"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        for (index, case) in self.cases.iter().enumerate() {
            if is_truthy(&eval(case, ctx)?) {
                if self.emit_case[index] {
                    ctx.emit(branch_token(&format!("case-{}", index)));
                }
                return Ok(());
            }
        }
        if self.emit_default {
            ctx.emit(branch_token("default"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopState {
    items: Vec<Value>,
    index: usize,
}

/// `loop_each`: stateful iteration with a loop-back edge from the body
///
/// The same executor receives the entry token and each body-completed
/// token; active iteration state is what tells them apart, and it is part
/// of the checkpointed executor state.
pub(crate) struct LoopEachExecutor {
    pub items: CompiledValue,
    pub item: VariablePath,
    pub emit_iterate: bool,
    pub emit_exit: bool,
    state: Option<LoopState>,
}

impl LoopEachExecutor {
    pub(crate) fn new(items: CompiledValue, item: VariablePath, emit_iterate: bool, emit_exit: bool) -> Self {
        Self {
            items,
            item,
            emit_iterate,
            emit_exit,
            state: None,
        }
    }

    fn exit(&mut self, ctx: &mut ExecutorContext) -> Result<()> {
        self.state = None;
        remove_variable(ctx, &self.item)?;
        if self.emit_exit {
            ctx.emit(branch_token("exit"));
        }
        Ok(())
    }

    fn advance(&mut self, ctx: &mut ExecutorContext) -> Result<()> {
        let Some(mut state) = self.state.take() else {
            return self.exit(ctx);
        };
        state.index += 1;
        if state.index < state.items.len() {
            write_variable(ctx, &self.item, state.items[state.index].clone())?;
            self.state = Some(state);
            if self.emit_iterate {
                ctx.emit(branch_token("iterate"));
            }
            Ok(())
        } else {
            self.exit(ctx)
        }
    }
}

#[async_trait]
impl Executor for LoopEachExecutor {
    fn kind(&self) -> &str {
        "loop_each"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        match payload.type_tag.as_str() {
            tags::CONTROL_BREAK => self.exit(ctx),
            tags::CONTROL_CONTINUE => self.advance(ctx),
            _ => {
                if self.state.is_some() {
                    // Body completed one iteration.
                    return self.advance(ctx);
                }
                // Entry: evaluate the item list and start iterating.
                let value = eval(&self.items, ctx)?;
                let items = match value {
                    Value::Array(items) => items,
                    Value::Null => Vec::new(),
                    other => {
                        return Err(WorkflowError::Expression {
                            expression: self.items.source(),
                            error: format!("loop items must be a list, got '{}'", other),
                        })
                    }
                };
                if items.is_empty() || !self.emit_iterate {
                    return self.exit(ctx);
                }
                write_variable(ctx, &self.item, items[0].clone())?;
                self.state = Some(LoopState { items, index: 0 });
                ctx.emit(branch_token("iterate"));
                Ok(())
            }
        }
    }

    fn snapshot_state(&self) -> Option<Value> {
        Some(json!({ "state": self.state }))
    }

    fn on_restore(&mut self, blob: Value) -> Result<()> {
        self.state = blob
            .get("state")
            .filter(|v| !v.is_null())
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?;
        Ok(())
    }
}

/// `break_loop`: emit the break control payload toward the enclosing loop
pub(crate) struct BreakLoopExecutor;

#[async_trait]
impl Executor for BreakLoopExecutor {
    fn kind(&self) -> &str {
        "break_loop"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        ctx.emit(TypedPayload::new(tags::CONTROL_BREAK, json!({})));
        Ok(())
    }
}

/// `continue_loop`
pub(crate) struct ContinueLoopExecutor;

#[async_trait]
impl Executor for ContinueLoopExecutor {
    fn kind(&self) -> &str {
        "continue_loop"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        ctx.emit(TypedPayload::new(tags::CONTROL_CONTINUE, json!({})));
        Ok(())
    }
}

/// `goto`: pass the token along its single edge to the jump target
pub(crate) struct GotoExecutor;

#[async_trait]
impl Executor for GotoExecutor {
    fn kind(&self) -> &str {
        "goto"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        ctx.emit(flow_token());
        Ok(())
    }
}

/// `invoke_agent`: run the wrapped agent adapter, capture its reply into a
/// variable and continue the flow
///
/// Delegates conversation handling (provider calls, history writes,
/// approval suspension) to the embedded [`AgentExecutor`] and rewrites its
/// emitted reply into the sequential-flow shape.
pub(crate) struct InvokeAgentExecutor {
    inner: AgentExecutor,
    pub input: Option<CompiledValue>,
    pub output: Option<VariablePath>,
    pub emits: bool,
}

impl InvokeAgentExecutor {
    pub(crate) fn new(
        inner: AgentExecutor,
        input: Option<CompiledValue>,
        output: Option<VariablePath>,
        emits: bool,
    ) -> Self {
        Self {
            inner,
            input,
            output,
            emits,
        }
    }
}

#[async_trait]
impl Executor for InvokeAgentExecutor {
    fn kind(&self) -> &str {
        "invoke_agent"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let inner_payload = match payload.type_tag.as_str() {
            tags::EXTERNAL_RESPONSE | tags::CHAT_MESSAGE => payload,
            _ => {
                let text = match &self.input {
                    Some(input) => to_display_string(&eval(input, ctx)?),
                    None => to_display_string(
                        &ctx.read_scope(ScopeKind::System, "user_message")
                            .unwrap_or(Value::Null),
                    ),
                };
                TypedPayload::of(tags::CHAT_MESSAGE, &ChatMessage::user(text))?
            }
        };

        self.inner.handle(inner_payload, ctx).await?;

        // The adapter emits the assistant reply as a chat message; rewrite
        // it into the variable assignment plus the flow token. When the
        // adapter suspended instead, there is nothing to rewrite.
        let reply_position = ctx
            .effects
            .emitted
            .iter()
            .position(|m| m.payload.type_tag == tags::CHAT_MESSAGE);
        if let Some(position) = reply_position {
            let reply = ctx.effects.emitted.remove(position);
            if let Some(output) = &self.output {
                let text = ChatMessage::from_tagged_value(&reply.payload.value)
                    .map(|m| m.text())
                    .unwrap_or_default();
                write_variable(ctx, output, json!(text))?;
            }
            if self.emits {
                ctx.emit(flow_token());
            }
        }
        Ok(())
    }

    fn snapshot_state(&self) -> Option<Value> {
        self.inner.snapshot_state()
    }

    fn on_restore(&mut self, blob: Value) -> Result<()> {
        self.inner.on_restore(blob)
    }
}

/// `end_conversation`: publish the final value and quiesce
pub(crate) struct EndConversationExecutor {
    pub value: Option<CompiledValue>,
}

#[async_trait]
impl Executor for EndConversationExecutor {
    fn kind(&self) -> &str {
        "end_conversation"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let value = match &self.value {
            Some(value) => eval(value, ctx)?,
            None => Value::Null,
        };
        ctx.emit(TypedPayload::new(tags::CONTROL_END_CONVERSATION, value));
        Ok(())
    }
}

/// `clear_all_variables`: wipe the topic scope
pub(crate) struct ClearAllVariablesExecutor {
    pub emits: bool,
}

#[async_trait]
impl Executor for ClearAllVariablesExecutor {
    fn kind(&self) -> &str {
        "clear_all_variables"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        ctx.queue_scope_clear(ScopeKind::Topic)?;
        if self.emits {
            ctx.emit(flow_token());
        }
        Ok(())
    }
}

/// `edit_table`: mutate a table variable
pub(crate) struct EditTableExecutor {
    pub target: VariablePath,
    pub op: CompiledTableOp,
    pub emits: bool,
}

#[async_trait]
impl Executor for EditTableExecutor {
    fn kind(&self) -> &str {
        "edit_table"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let current = read_variable(ctx, &self.target);
        let mut table = TableRecord::from_tagged_value(&current).unwrap_or_default();

        match &self.op {
            CompiledTableOp::AddRow(value) => {
                let row = match eval(value, ctx)? {
                    Value::Array(cells) => cells,
                    other => vec![other],
                };
                table.add_row(row);
            }
            CompiledTableOp::RemoveRow(index) => {
                let index = eval(index, ctx)?.as_u64().ok_or_else(|| {
                    WorkflowError::state(
                        self.target.scope.as_str(),
                        self.target.segments.join("."),
                        "row index must be a non-negative number",
                    )
                })?;
                table.remove_row(index as usize);
            }
            CompiledTableOp::Clear => table.clear(),
        }

        write_variable(ctx, &self.target, table.to_tagged_value())?;
        if self.emits {
            ctx.emit(flow_token());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scopes::ScopeState;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn context_with(scopes: ScopeState) -> ExecutorContext {
        ExecutorContext::new(
            "run-1",
            "wf-1",
            "action-1",
            "trace-1",
            "delivery-1",
            Arc::new(scopes),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn topic(key: &str, value: Value) -> ScopeState {
        let mut scopes = ScopeState::new();
        scopes.commit(vec![(
            "seed".to_string(),
            crate::scopes::ScopeWrite::set(ScopeKind::Topic, key, value),
        )]);
        scopes
    }

    fn path(raw: &str) -> VariablePath {
        VariablePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_set_variable_queues_write_and_token() {
        let mut executor = SetVariableExecutor {
            target: path("topic.count"),
            value: CompiledValue::compile(&json!("=1 + 1")).unwrap(),
            emits: true,
        };
        let mut ctx = context_with(ScopeState::new());
        executor.handle(flow_token(), &mut ctx).await.unwrap();

        assert_eq!(ctx.effects.scope_writes.len(), 1);
        assert_eq!(ctx.effects.emitted.len(), 1);
        assert_eq!(ctx.effects.emitted[0].payload.type_tag, tags::FLOW_TOKEN);
    }

    #[tokio::test]
    async fn test_condition_emits_taken_branch() {
        let mut executor = ConditionExecutor {
            condition: CompiledValue::compile(&json!("=topic.acc > 3")).unwrap(),
            emit_then: true,
            emit_else: true,
        };
        let mut ctx = context_with(topic("acc", json!(6)));
        executor.handle(flow_token(), &mut ctx).await.unwrap();
        assert_eq!(
            ctx.effects.emitted[0].payload.value,
            json!({"branch": "then"})
        );
    }

    #[tokio::test]
    async fn test_loop_each_iterates_and_exits() {
        let mut executor = LoopEachExecutor::new(
            CompiledValue::compile(&json!("=topic.items")).unwrap(),
            path("topic.item"),
            true,
            true,
        );
        let scopes = topic("items", json!([10, 20]));

        // Entry: first item bound, iterate emitted.
        let mut ctx = context_with(scopes.clone());
        executor.handle(flow_token(), &mut ctx).await.unwrap();
        assert_eq!(
            ctx.effects.emitted[0].payload.value,
            json!({"branch": "iterate"})
        );

        // Body completed: advance to second item.
        let mut ctx = context_with(scopes.clone());
        executor.handle(flow_token(), &mut ctx).await.unwrap();
        assert_eq!(
            ctx.effects.emitted[0].payload.value,
            json!({"branch": "iterate"})
        );

        // Body completed again: exhausted, exit.
        let mut ctx = context_with(scopes);
        executor.handle(flow_token(), &mut ctx).await.unwrap();
        assert_eq!(
            ctx.effects.emitted[0].payload.value,
            json!({"branch": "exit"})
        );
    }

    #[tokio::test]
    async fn test_loop_each_break_exits() {
        let mut executor = LoopEachExecutor::new(
            CompiledValue::compile(&json!("=topic.items")).unwrap(),
            path("topic.item"),
            true,
            true,
        );
        let scopes = topic("items", json!([1, 2, 3]));
        let mut ctx = context_with(scopes.clone());
        executor.handle(flow_token(), &mut ctx).await.unwrap();

        let mut ctx = context_with(scopes);
        executor
            .handle(TypedPayload::new(tags::CONTROL_BREAK, json!({})), &mut ctx)
            .await
            .unwrap();
        assert_eq!(
            ctx.effects.emitted[0].payload.value,
            json!({"branch": "exit"})
        );
    }

    #[tokio::test]
    async fn test_loop_state_round_trips() {
        let mut executor = LoopEachExecutor::new(
            CompiledValue::compile(&json!("=topic.items")).unwrap(),
            path("topic.item"),
            true,
            true,
        );
        let mut ctx = context_with(topic("items", json!([1, 2, 3])));
        executor.handle(flow_token(), &mut ctx).await.unwrap();

        let blob = executor.snapshot_state().unwrap();
        let mut restored = LoopEachExecutor::new(
            CompiledValue::compile(&json!("=topic.items")).unwrap(),
            path("topic.item"),
            true,
            true,
        );
        restored.on_restore(blob).unwrap();
        assert!(restored.state.is_some());
        assert_eq!(restored.state.as_ref().unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_edit_table_add_and_clear() {
        let mut executor = EditTableExecutor {
            target: path("topic.orders"),
            op: CompiledTableOp::AddRow(CompiledValue::compile(&json!("=topic.row")).unwrap()),
            emits: false,
        };
        let mut ctx = context_with(topic("row", json!(["widget", 2])));
        executor.handle(flow_token(), &mut ctx).await.unwrap();

        let written = match &ctx.effects.scope_writes[0].op {
            crate::scopes::WriteOp::Set { value, .. } => value.clone(),
            other => panic!("unexpected write {:?}", other),
        };
        let table = TableRecord::from_tagged_value(&written).unwrap();
        assert_eq!(table.rows, vec![vec![json!("widget"), json!(2)]]);
    }

    #[tokio::test]
    async fn test_parse_value_coercion_failure_is_state_error() {
        let mut executor = ParseValueExecutor {
            target: path("topic.count"),
            value: CompiledValue::compile(&json!("not a number")).unwrap(),
            value_kind: ValueKind::Number,
            emits: false,
        };
        let mut ctx = context_with(ScopeState::new());
        let err = executor.handle(flow_token(), &mut ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::State { .. }));
    }
}
