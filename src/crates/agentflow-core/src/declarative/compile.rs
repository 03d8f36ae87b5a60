//! Declarative compilation: YAML document → IR → workflow graph
//!
//! Compilation runs in two separately testable stages. Stage one lowers
//! the parsed [`WorkflowDoc`] into a data-only [`CompiledAction`] tree:
//! expressions are parsed, variable paths resolved, ids checked for
//! uniqueness and break/continue for loop context. Stage two linearises
//! the tree into executors and edges: sequential flow becomes direct
//! edges over a flow token, branches become switch edge groups keyed on
//! the token's `branch` field, loops get a loop-back edge from their body
//! tail, and break/continue get a control edge to the enclosing loop.
//!
//! Every diagnostic carries the offending action id; parser errors carry
//! the source position serde_yaml reports.

use super::actions::{
    BreakLoopExecutor, ClearAllVariablesExecutor, ConditionExecutor, ContinueLoopExecutor,
    EditTableExecutor, EndConversationExecutor, GotoExecutor, InvokeAgentExecutor,
    LoopEachExecutor, ParseValueExecutor, SendActivityExecutor, SetVariableExecutor,
    SwitchExecutor,
};
use super::schema::{ActionDef, TableOpDef, WorkflowDoc};
use crate::agent::{AgentExecutor, AgentProvider};
use crate::builder::WorkflowBuilder;
use crate::envelope::{tags, ExecutorId, TypedPayload};
use crate::error::{CompileError, Result};
use crate::executor::Executor;
use crate::expr::CompiledValue;
use crate::scopes::{ScopeKind, ValueKind};
use crate::workflow::{Predicate, Workflow};
use crate::workflow::ExecutorBinding;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// A variable reference: scope plus dotted path segments
///
/// Paths without an explicit scope prefix default to the topic scope.
#[derive(Debug, Clone, PartialEq)]
pub struct VariablePath {
    pub scope: ScopeKind,
    pub segments: Vec<String>,
}

impl VariablePath {
    /// Parse `"topic.user.name"` / `"acc"` style references
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let parts: Vec<&str> = raw.split('.').filter(|p| !p.is_empty()).collect();
        if parts.is_empty() {
            return Err("empty variable path".to_string());
        }
        match ScopeKind::parse(parts[0]) {
            Some(scope) => {
                if parts.len() < 2 {
                    return Err(format!(
                        "variable path '{}' needs a key after the scope name",
                        raw
                    ));
                }
                Ok(Self {
                    scope,
                    segments: parts[1..].iter().map(|s| s.to_string()).collect(),
                })
            }
            None => Ok(Self {
                scope: ScopeKind::Topic,
                segments: parts.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }
}

/// Compiled table mutation
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledTableOp {
    AddRow(CompiledValue),
    RemoveRow(CompiledValue),
    Clear,
}

/// Data-only intermediate representation of one action
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledAction {
    SendActivity {
        id: String,
        message: CompiledValue,
    },
    SetVariable {
        id: String,
        target: VariablePath,
        value: CompiledValue,
    },
    ParseValue {
        id: String,
        target: VariablePath,
        value: CompiledValue,
        value_kind: ValueKind,
    },
    Condition {
        id: String,
        condition: CompiledValue,
        then: Vec<CompiledAction>,
        otherwise: Vec<CompiledAction>,
    },
    Switch {
        id: String,
        cases: Vec<(CompiledValue, Vec<CompiledAction>)>,
        default: Vec<CompiledAction>,
    },
    LoopEach {
        id: String,
        items: CompiledValue,
        item: VariablePath,
        body: Vec<CompiledAction>,
    },
    BreakLoop {
        id: String,
    },
    ContinueLoop {
        id: String,
    },
    Goto {
        id: String,
        target: String,
    },
    InvokeAgent {
        id: String,
        agent: String,
        input: Option<CompiledValue>,
        output: Option<VariablePath>,
    },
    EndConversation {
        id: String,
        value: Option<CompiledValue>,
    },
    ClearAllVariables {
        id: String,
    },
    EditTable {
        id: String,
        target: VariablePath,
        op: CompiledTableOp,
    },
}

impl CompiledAction {
    /// Stable action id
    pub fn id(&self) -> &str {
        match self {
            CompiledAction::SendActivity { id, .. }
            | CompiledAction::SetVariable { id, .. }
            | CompiledAction::ParseValue { id, .. }
            | CompiledAction::Condition { id, .. }
            | CompiledAction::Switch { id, .. }
            | CompiledAction::LoopEach { id, .. }
            | CompiledAction::BreakLoop { id }
            | CompiledAction::ContinueLoop { id }
            | CompiledAction::Goto { id, .. }
            | CompiledAction::InvokeAgent { id, .. }
            | CompiledAction::EndConversation { id, .. }
            | CompiledAction::ClearAllVariables { id }
            | CompiledAction::EditTable { id, .. } => id,
        }
    }
}

/// Stage one: lower the document's action tree into IR
pub fn compile_document(doc: &WorkflowDoc) -> std::result::Result<Vec<CompiledAction>, CompileError> {
    let mut ids = HashSet::new();
    let ir = compile_block(&doc.actions, &mut ids, false)?;
    if ir.is_empty() {
        return Err(CompileError::document("workflow has no actions"));
    }
    validate_goto_targets(&ir, &ids)?;
    if let Some(start) = &doc.start {
        if !ids.contains(start) {
            return Err(CompileError::document(format!(
                "start action '{}' does not exist",
                start
            )));
        }
    }
    Ok(ir)
}

fn compile_block(
    actions: &[ActionDef],
    ids: &mut HashSet<String>,
    in_loop: bool,
) -> std::result::Result<Vec<CompiledAction>, CompileError> {
    actions
        .iter()
        .map(|action| compile_action(action, ids, in_loop))
        .collect()
}

fn compile_action(
    action: &ActionDef,
    ids: &mut HashSet<String>,
    in_loop: bool,
) -> std::result::Result<CompiledAction, CompileError> {
    let id = action.id().to_string();
    if !ids.insert(id.clone()) {
        return Err(CompileError::for_action(&id, "duplicate action id"));
    }
    let field_id = id.clone();
    let field = move |raw: &Value| {
        CompiledValue::compile(raw)
            .map_err(|e| CompileError::for_action(&field_id, e.to_string()))
    };
    let variable_id = id.clone();
    let variable = move |raw: &str| {
        VariablePath::parse(raw).map_err(|message| CompileError::for_action(&variable_id, message))
    };

    Ok(match action {
        ActionDef::SendActivity { message, .. } => CompiledAction::SendActivity {
            id,
            message: field(message)?,
        },
        ActionDef::SetVariable {
            variable: var,
            value,
            ..
        } => CompiledAction::SetVariable {
            id: id.clone(),
            target: variable(var)?,
            value: field(value)?,
        },
        ActionDef::ParseValue {
            variable: var,
            value,
            value_type,
            ..
        } => {
            let value_kind = ValueKind::parse(value_type).ok_or_else(|| {
                CompileError::for_action(&id, format!("unknown value type '{}'", value_type))
            })?;
            CompiledAction::ParseValue {
                id: id.clone(),
                target: variable(var)?,
                value: field(value)?,
                value_kind,
            }
        }
        ActionDef::Condition {
            condition,
            then,
            r#else,
            ..
        } => CompiledAction::Condition {
            id: id.clone(),
            condition: field(condition)?,
            then: compile_block(then, ids, in_loop)?,
            otherwise: compile_block(r#else, ids, in_loop)?,
        },
        ActionDef::Switch { cases, default, .. } => CompiledAction::Switch {
            id: id.clone(),
            cases: cases
                .iter()
                .map(|case| {
                    Ok((
                        field(&case.condition)?,
                        compile_block(&case.actions, ids, in_loop)?,
                    ))
                })
                .collect::<std::result::Result<_, CompileError>>()?,
            default: compile_block(default, ids, in_loop)?,
        },
        ActionDef::LoopEach {
            items,
            item_variable,
            body,
            ..
        } => CompiledAction::LoopEach {
            id: id.clone(),
            items: field(items)?,
            item: variable(item_variable)?,
            body: compile_block(body, ids, true)?,
        },
        ActionDef::BreakLoop { .. } => {
            if !in_loop {
                return Err(CompileError::for_action(&id, "break_loop outside a loop"));
            }
            CompiledAction::BreakLoop { id }
        }
        ActionDef::ContinueLoop { .. } => {
            if !in_loop {
                return Err(CompileError::for_action(
                    &id,
                    "continue_loop outside a loop",
                ));
            }
            CompiledAction::ContinueLoop { id }
        }
        ActionDef::Goto { target, .. } => CompiledAction::Goto {
            id,
            target: target.clone(),
        },
        ActionDef::InvokeAgent {
            agent,
            input,
            output_variable,
            ..
        } => CompiledAction::InvokeAgent {
            id: id.clone(),
            agent: agent.clone(),
            input: input.as_ref().map(&field).transpose()?,
            output: output_variable
                .as_deref()
                .map(&variable)
                .transpose()?,
        },
        ActionDef::EndConversation { value, .. } => CompiledAction::EndConversation {
            id: id.clone(),
            value: value.as_ref().map(&field).transpose()?,
        },
        ActionDef::ClearAllVariables { .. } => CompiledAction::ClearAllVariables { id },
        ActionDef::EditTable {
            variable: var,
            operation,
            ..
        } => CompiledAction::EditTable {
            id: id.clone(),
            target: variable(var)?,
            op: match operation {
                TableOpDef::AddRow { value } => CompiledTableOp::AddRow(field(value)?),
                TableOpDef::RemoveRow { index } => CompiledTableOp::RemoveRow(field(index)?),
                TableOpDef::Clear => CompiledTableOp::Clear,
            },
        },
    })
}

fn validate_goto_targets(
    actions: &[CompiledAction],
    ids: &HashSet<String>,
) -> std::result::Result<(), CompileError> {
    for action in actions {
        match action {
            CompiledAction::Goto { id, target } => {
                if !ids.contains(target) {
                    return Err(CompileError::for_action(
                        id,
                        format!("goto target '{}' does not exist", target),
                    ));
                }
            }
            CompiledAction::Condition {
                then, otherwise, ..
            } => {
                validate_goto_targets(then, ids)?;
                validate_goto_targets(otherwise, ids)?;
            }
            CompiledAction::Switch { cases, default, .. } => {
                for (_, actions) in cases {
                    validate_goto_targets(actions, ids)?;
                }
                validate_goto_targets(default, ids)?;
            }
            CompiledAction::LoopEach { body, .. } => validate_goto_targets(body, ids)?,
            _ => {}
        }
    }
    Ok(())
}

/// Break/continue presence at one loop's own nesting level
fn scan_controls(actions: &[CompiledAction]) -> (bool, bool) {
    let mut has_break = false;
    let mut has_continue = false;
    for action in actions {
        match action {
            CompiledAction::BreakLoop { .. } => has_break = true,
            CompiledAction::ContinueLoop { .. } => has_continue = true,
            CompiledAction::Condition {
                then, otherwise, ..
            } => {
                let (b1, c1) = scan_controls(then);
                let (b2, c2) = scan_controls(otherwise);
                has_break |= b1 | b2;
                has_continue |= c1 | c2;
            }
            CompiledAction::Switch { cases, default, .. } => {
                for (_, actions) in cases {
                    let (b, c) = scan_controls(actions);
                    has_break |= b;
                    has_continue |= c;
                }
                let (b, c) = scan_controls(default);
                has_break |= b;
                has_continue |= c;
            }
            // An inner loop captures its own break/continue.
            CompiledAction::LoopEach { .. } => {}
            _ => {}
        }
    }
    (has_break, has_continue)
}

fn document_order(actions: &[CompiledAction], out: &mut Vec<String>) {
    for action in actions {
        out.push(action.id().to_string());
        match action {
            CompiledAction::Condition {
                then, otherwise, ..
            } => {
                document_order(then, out);
                document_order(otherwise, out);
            }
            CompiledAction::Switch { cases, default, .. } => {
                for (_, actions) in cases {
                    document_order(actions, out);
                }
                document_order(default, out);
            }
            CompiledAction::LoopEach { body, .. } => document_order(body, out),
            _ => {}
        }
    }
}

enum EdgeSpec {
    Direct {
        from: ExecutorId,
        to: ExecutorId,
    },
    Switch {
        from: ExecutorId,
        cases: Vec<(String, ExecutorId)>,
    },
}

#[derive(Default)]
struct GraphOut {
    bindings: Vec<ExecutorBinding>,
    edges: Vec<EdgeSpec>,
}

fn branch_predicate(branch: String) -> Predicate {
    Arc::new(move |payload: &TypedPayload| {
        payload.value.get("branch").and_then(Value::as_str) == Some(branch.as_str())
    })
}

/// Compiles declarative workflow documents into executable workflows
#[derive(Default)]
pub struct DeclarativeCompiler {
    provider: Option<Arc<dyn AgentProvider>>,
}

impl DeclarativeCompiler {
    /// Compiler without agent support; `invoke_agent` actions will be
    /// rejected at compile time
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply the agent provider `invoke_agent` actions are bound to
    pub fn with_agent_provider(mut self, provider: Arc<dyn AgentProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Compile a YAML document string
    pub fn compile_str(&self, yaml: &str) -> Result<Workflow> {
        let doc: WorkflowDoc =
            serde_yaml::from_str(yaml).map_err(|e| CompileError::from_yaml(&e))?;
        self.compile(&doc)
    }

    /// Compile a parsed document
    pub fn compile(&self, doc: &WorkflowDoc) -> Result<Workflow> {
        let ir = compile_document(doc)?;

        let mut out = GraphOut::default();
        self.wire_block(&ir, None, &mut Vec::new(), &mut out)?;

        // Registration order follows document order, which keeps the
        // deterministic commit order aligned with the source.
        let mut order = Vec::new();
        document_order(&ir, &mut order);
        out.bindings.sort_by_key(|binding| {
            order
                .iter()
                .position(|id| id == &binding.id)
                .unwrap_or(usize::MAX)
        });

        let start = doc
            .start
            .clone()
            .unwrap_or_else(|| ir[0].id().to_string());
        let mut builder = WorkflowBuilder::new(&doc.id)
            .with_name(doc.name.clone().unwrap_or_else(|| doc.id.clone()))
            .with_start(start)
            .seed_topic_from_input();

        for (name, decl) in &doc.inputs {
            if let Some(kind_name) = decl.kind() {
                let kind = ValueKind::parse(kind_name).ok_or_else(|| {
                    CompileError::document(format!(
                        "unknown type '{}' for input '{}'",
                        kind_name, name
                    ))
                })?;
                builder = builder.declare_scope_key(ScopeKind::Topic, name.clone(), kind);
            }
            if let Some(default) = decl.default_value() {
                builder =
                    builder.default_scope_value(ScopeKind::Topic, name.clone(), default.clone());
            }
        }

        for binding in out.bindings {
            builder = builder.add_executor(binding);
        }
        for edge in out.edges {
            builder = match edge {
                EdgeSpec::Direct { from, to } => builder.add_edge(from, to),
                EdgeSpec::Switch { from, cases } => {
                    let cases = cases
                        .into_iter()
                        .map(|(branch, target)| (branch_predicate(branch), target))
                        .collect();
                    builder.add_switch(from, cases, None)
                }
            };
        }
        builder.build()
    }

    /// Wire a block, returning its head (or the fallthrough continuation)
    fn wire_block(
        &self,
        actions: &[CompiledAction],
        next: Option<ExecutorId>,
        loop_stack: &mut Vec<ExecutorId>,
        out: &mut GraphOut,
    ) -> std::result::Result<Option<ExecutorId>, CompileError> {
        let mut current = next;
        for action in actions.iter().rev() {
            current = Some(self.wire_action(action, current, loop_stack, out)?);
        }
        Ok(current)
    }

    fn wire_action(
        &self,
        action: &CompiledAction,
        next: Option<ExecutorId>,
        loop_stack: &mut Vec<ExecutorId>,
        out: &mut GraphOut,
    ) -> std::result::Result<ExecutorId, CompileError> {
        let id = action.id().to_string();
        let emits = next.is_some();
        match action {
            CompiledAction::SendActivity { message, .. } => {
                let message = message.clone();
                self.sequential(
                    out,
                    &id,
                    "send_activity",
                    Arc::new(move || {
                        Box::new(SendActivityExecutor {
                            message: message.clone(),
                            emits,
                        }) as Box<dyn Executor>
                    }),
                    next,
                );
            }
            CompiledAction::SetVariable { target, value, .. } => {
                let target = target.clone();
                let value = value.clone();
                self.sequential(
                    out,
                    &id,
                    "set_variable",
                    Arc::new(move || {
                        Box::new(SetVariableExecutor {
                            target: target.clone(),
                            value: value.clone(),
                            emits,
                        }) as Box<dyn Executor>
                    }),
                    next,
                );
            }
            CompiledAction::ParseValue {
                target,
                value,
                value_kind,
                ..
            } => {
                let target = target.clone();
                let value = value.clone();
                let value_kind = *value_kind;
                self.sequential(
                    out,
                    &id,
                    "parse_value",
                    Arc::new(move || {
                        Box::new(ParseValueExecutor {
                            target: target.clone(),
                            value: value.clone(),
                            value_kind,
                            emits,
                        }) as Box<dyn Executor>
                    }),
                    next,
                );
            }
            CompiledAction::ClearAllVariables { .. } => {
                self.sequential(
                    out,
                    &id,
                    "clear_all_variables",
                    Arc::new(move || {
                        Box::new(ClearAllVariablesExecutor { emits }) as Box<dyn Executor>
                    }),
                    next,
                );
            }
            CompiledAction::EditTable { target, op, .. } => {
                let target = target.clone();
                let op = op.clone();
                self.sequential(
                    out,
                    &id,
                    "edit_table",
                    Arc::new(move || {
                        Box::new(EditTableExecutor {
                            target: target.clone(),
                            op: op.clone(),
                            emits,
                        }) as Box<dyn Executor>
                    }),
                    next,
                );
            }
            CompiledAction::Condition {
                condition,
                then,
                otherwise,
                ..
            } => {
                let then_head = self.wire_block(then, next.clone(), loop_stack, out)?;
                let else_head = self.wire_block(otherwise, next, loop_stack, out)?;
                let emit_then = then_head.is_some();
                let emit_else = else_head.is_some();

                let condition = condition.clone();
                let mut binding = ExecutorBinding::new(
                    &id,
                    "condition",
                    Arc::new(move || {
                        Box::new(ConditionExecutor {
                            condition: condition.clone(),
                            emit_then,
                            emit_else,
                        }) as Box<dyn Executor>
                    }),
                )
                .with_input(tags::FLOW_TOKEN);
                if emit_then || emit_else {
                    binding = binding.with_output(tags::FLOW_TOKEN);
                }
                out.bindings.push(binding);

                let mut cases = Vec::new();
                if let Some(target) = then_head {
                    cases.push(("then".to_string(), target));
                }
                if let Some(target) = else_head {
                    cases.push(("else".to_string(), target));
                }
                if !cases.is_empty() {
                    out.edges.push(EdgeSpec::Switch {
                        from: id.clone(),
                        cases,
                    });
                }
            }
            CompiledAction::Switch { cases, default, .. } => {
                let mut case_exprs = Vec::new();
                let mut emit_case = Vec::new();
                let mut edge_cases = Vec::new();
                for (index, (condition, actions)) in cases.iter().enumerate() {
                    let head = self.wire_block(actions, next.clone(), loop_stack, out)?;
                    emit_case.push(head.is_some());
                    if let Some(target) = head {
                        edge_cases.push((format!("case-{}", index), target));
                    }
                    case_exprs.push(condition.clone());
                }
                let default_head = self.wire_block(default, next, loop_stack, out)?;
                let emit_default = default_head.is_some();
                if let Some(target) = default_head {
                    edge_cases.push(("default".to_string(), target));
                }

                let mut binding = ExecutorBinding::new(
                    &id,
                    "switch",
                    Arc::new(move || {
                        Box::new(SwitchExecutor {
                            cases: case_exprs.clone(),
                            emit_case: emit_case.clone(),
                            emit_default,
                        }) as Box<dyn Executor>
                    }),
                )
                .with_input(tags::FLOW_TOKEN);
                if !edge_cases.is_empty() {
                    binding = binding.with_output(tags::FLOW_TOKEN);
                }
                out.bindings.push(binding);

                if !edge_cases.is_empty() {
                    out.edges.push(EdgeSpec::Switch {
                        from: id.clone(),
                        cases: edge_cases,
                    });
                }
            }
            CompiledAction::LoopEach {
                items, item, body, ..
            } => {
                loop_stack.push(id.clone());
                let body_head = self.wire_block(body, Some(id.clone()), loop_stack, out)?;
                loop_stack.pop();

                let (has_break, has_continue) = scan_controls(body);
                let emit_iterate = body_head.is_some();
                let emit_exit = next.is_some();

                let items = items.clone();
                let item = item.clone();
                let mut binding = ExecutorBinding::new(
                    &id,
                    "loop_each",
                    Arc::new(move || {
                        Box::new(LoopEachExecutor::new(
                            items.clone(),
                            item.clone(),
                            emit_iterate,
                            emit_exit,
                        )) as Box<dyn Executor>
                    }),
                )
                .with_input(tags::FLOW_TOKEN)
                .with_output(tags::FLOW_TOKEN);
                if has_break {
                    binding = binding.with_input(tags::CONTROL_BREAK);
                }
                if has_continue {
                    binding = binding.with_input(tags::CONTROL_CONTINUE);
                }
                out.bindings.push(binding);

                let mut cases = Vec::new();
                if let Some(target) = body_head {
                    cases.push(("iterate".to_string(), target));
                }
                if let Some(target) = next {
                    cases.push(("exit".to_string(), target));
                }
                if !cases.is_empty() {
                    out.edges.push(EdgeSpec::Switch {
                        from: id.clone(),
                        cases,
                    });
                }
            }
            CompiledAction::BreakLoop { .. } => {
                let enclosing = loop_stack
                    .last()
                    .cloned()
                    .ok_or_else(|| CompileError::for_action(&id, "break_loop outside a loop"))?;
                out.bindings.push(
                    ExecutorBinding::new(
                        &id,
                        "break_loop",
                        Arc::new(move || Box::new(BreakLoopExecutor) as Box<dyn Executor>),
                    )
                    .with_input(tags::FLOW_TOKEN)
                    .with_output(tags::CONTROL_BREAK),
                );
                out.edges.push(EdgeSpec::Direct {
                    from: id.clone(),
                    to: enclosing,
                });
            }
            CompiledAction::ContinueLoop { .. } => {
                let enclosing = loop_stack.last().cloned().ok_or_else(|| {
                    CompileError::for_action(&id, "continue_loop outside a loop")
                })?;
                out.bindings.push(
                    ExecutorBinding::new(
                        &id,
                        "continue_loop",
                        Arc::new(move || Box::new(ContinueLoopExecutor) as Box<dyn Executor>),
                    )
                    .with_input(tags::FLOW_TOKEN)
                    .with_output(tags::CONTROL_CONTINUE),
                );
                out.edges.push(EdgeSpec::Direct {
                    from: id.clone(),
                    to: enclosing,
                });
            }
            CompiledAction::Goto { target, .. } => {
                out.bindings.push(
                    ExecutorBinding::new(
                        &id,
                        "goto",
                        Arc::new(move || Box::new(GotoExecutor) as Box<dyn Executor>),
                    )
                    .with_input(tags::FLOW_TOKEN)
                    .with_output(tags::FLOW_TOKEN),
                );
                out.edges.push(EdgeSpec::Direct {
                    from: id.clone(),
                    to: target.clone(),
                });
            }
            CompiledAction::InvokeAgent {
                agent,
                input,
                output,
                ..
            } => {
                let provider = self.provider.clone().ok_or_else(|| {
                    CompileError::for_action(&id, "invoke_agent requires an agent provider")
                })?;
                let agent = agent.clone();
                let input = input.clone();
                let output = output.clone();
                let mut binding = ExecutorBinding::new(
                    &id,
                    "invoke_agent",
                    Arc::new(move || {
                        Box::new(InvokeAgentExecutor::new(
                            AgentExecutor::new(agent.clone(), provider.clone()),
                            input.clone(),
                            output.clone(),
                            emits,
                        )) as Box<dyn Executor>
                    }),
                )
                .with_input(tags::FLOW_TOKEN)
                .with_input(tags::EXTERNAL_RESPONSE);
                if emits {
                    binding = binding.with_output(tags::FLOW_TOKEN);
                }
                out.bindings.push(binding);
                if let Some(target) = next {
                    out.edges.push(EdgeSpec::Direct {
                        from: id.clone(),
                        to: target,
                    });
                }
            }
            CompiledAction::EndConversation { value, .. } => {
                let value = value.clone();
                out.bindings.push(
                    ExecutorBinding::new(
                        &id,
                        "end_conversation",
                        Arc::new(move || {
                            Box::new(EndConversationExecutor {
                                value: value.clone(),
                            }) as Box<dyn Executor>
                        }),
                    )
                    .with_input(tags::FLOW_TOKEN)
                    .with_output(tags::CONTROL_END_CONVERSATION),
                );
            }
        }
        Ok(id)
    }

    fn sequential(
        &self,
        out: &mut GraphOut,
        id: &str,
        kind: &str,
        factory: crate::workflow::ExecutorFactory,
        next: Option<ExecutorId>,
    ) {
        let mut binding =
            ExecutorBinding::new(id, kind, factory).with_input(tags::FLOW_TOKEN);
        if next.is_some() {
            binding = binding.with_output(tags::FLOW_TOKEN);
        }
        out.bindings.push(binding);
        if let Some(target) = next {
            out.edges.push(EdgeSpec::Direct {
                from: id.to_string(),
                to: target,
            });
        }
    }
}
