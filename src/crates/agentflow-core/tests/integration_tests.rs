//! Integration tests for complete workflow runs
//!
//! These cover the engine's end-to-end behavior: linear chains, fan-out
//! with cohort-correlated fan-in, switch routing, error policies,
//! human-in-the-loop suspension and checkpoint/restore, plus the
//! determinism and isolation laws the scheduler guarantees.

use agentflow_core::{
    restore_run, start_run, tags, AgentProvider, AgentUpdate, AgentUpdateStream, ChatMessage,
    CheckpointPolicy, CheckpointStore, DeliveryStatus, DiagnosticEvent, ErrorPolicy, Executor,
    ExecutorBinding, ExecutorContext, ExternalInputResponse, InMemoryCheckpointStore,
    InvokeRequest, ListMessagesQuery, MessageStream, Result, RunEvent, RunHandle, RunOptions,
    ScopeKind, TypedPayload, Workflow, WorkflowBuilder, WorkflowError,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn make_binding(
    id: &str,
    kind: &str,
    factory: impl Fn() -> Box<dyn Executor> + Send + Sync + 'static,
    inputs: &[&str],
    outputs: &[&str],
) -> ExecutorBinding {
    let mut binding = ExecutorBinding::new(id, kind, Arc::new(factory));
    for input in inputs {
        binding = binding.with_input(*input);
    }
    for output in outputs {
        binding = binding.with_output(*output);
    }
    binding
}

struct Double;

#[async_trait]
impl Executor for Double {
    fn kind(&self) -> &str {
        "double"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let n = payload.value.as_i64().unwrap_or(0);
        ctx.queue_scope_write(ScopeKind::Topic, "doubled", json!(n * 2))?;
        ctx.emit(TypedPayload::new("i64", json!(n * 2)));
        Ok(())
    }
}

struct AddTen;

#[async_trait]
impl Executor for AddTen {
    fn kind(&self) -> &str {
        "add_ten"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let n = payload.value.as_i64().unwrap_or(0);
        ctx.emit(TypedPayload::new("i64", json!(n + 10)));
        Ok(())
    }
}

struct Stringify;

#[async_trait]
impl Executor for Stringify {
    fn kind(&self) -> &str {
        "stringify"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let n = payload.value.as_i64().unwrap_or(0);
        ctx.queue_scope_write(ScopeKind::Topic, "result", json!(n.to_string()))?;
        ctx.emit(TypedPayload::new("text", json!(n.to_string())));
        Ok(())
    }
}

struct PassThrough;

#[async_trait]
impl Executor for PassThrough {
    fn kind(&self) -> &str {
        "pass_through"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        ctx.emit(payload);
        Ok(())
    }
}

struct Prefix(&'static str);

#[async_trait]
impl Executor for Prefix {
    fn kind(&self) -> &str {
        "prefix"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let s = payload.value.as_str().unwrap_or_default();
        ctx.emit(TypedPayload::new("text", json!(format!("{}{}", self.0, s))));
        Ok(())
    }
}

struct Join;

#[async_trait]
impl Executor for Join {
    fn kind(&self) -> &str {
        "join"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let parts: Vec<String> = payload
            .value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default();
        ctx.emit(TypedPayload::new("text", json!(parts.join("|"))));
        Ok(())
    }
}

fn linear_chain() -> Workflow {
    WorkflowBuilder::new("linear-chain")
        .add_executor(make_binding(
            "a",
            "double",
            || Box::new(Double),
            &["i64"],
            &["i64"],
        ))
        .add_executor(make_binding(
            "b",
            "add_ten",
            || Box::new(AddTen),
            &["i64"],
            &["i64"],
        ))
        .add_executor(make_binding(
            "c",
            "stringify",
            || Box::new(Stringify),
            &["i64"],
            &["text"],
        ))
        .with_start("a")
        .add_edge("a", "b")
        .add_edge("b", "c")
        .build()
        .unwrap()
}

async fn collect_until_terminal(handle: &mut RunHandle) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.poll_event().await {
        let terminal = matches!(
            event,
            RunEvent::Completed(_) | RunEvent::Failed(_) | RunEvent::Cancelled
        );
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

fn final_output(events: &[RunEvent]) -> Option<TypedPayload> {
    events.iter().find_map(|event| match event {
        RunEvent::Completed(output) => output.clone(),
        _ => None,
    })
}

/// Scenario: linear chain A -> B -> C, input 5, output "20", 3 super-steps
#[tokio::test]
async fn test_linear_chain() {
    let mut handle = start_run(
        linear_chain(),
        TypedPayload::new("i64", json!(5)),
        RunOptions::default(),
    )
    .unwrap();

    let events = collect_until_terminal(&mut handle).await;
    let output = final_output(&events).unwrap();
    assert_eq!(output.type_tag, "text");
    assert_eq!(output.value, json!("20"));

    let steps = events
        .iter()
        .filter(|e| matches!(e, RunEvent::SuperStep(_)))
        .count();
    assert_eq!(steps, 3);
    assert!(events.iter().any(|e| matches!(e, RunEvent::Started)));
}

/// The handle's event side doubles as a plain `Stream` for observers
#[tokio::test]
async fn test_event_stream_view() {
    use futures::StreamExt;

    let mut stream = start_run(
        linear_chain(),
        TypedPayload::new("i64", json!(5)),
        RunOptions::default(),
    )
    .unwrap()
    .into_event_stream();

    let mut completed = None;
    while let Some(event) = stream.next().await {
        if let RunEvent::Completed(output) = event {
            completed = output;
            break;
        }
    }
    assert_eq!(completed.unwrap().value, json!("20"));
}

/// Scenario: fan-out to X and Y, fan-in at J with source-ordered aggregate
#[tokio::test]
async fn test_fan_out_fan_in() {
    let workflow = WorkflowBuilder::new("scatter-gather")
        .add_executor(make_binding(
            "s",
            "pass_through",
            || Box::new(PassThrough),
            &["text"],
            &["text"],
        ))
        .add_executor(make_binding(
            "x",
            "prefix",
            || Box::new(Prefix("x:")),
            &["text"],
            &["text"],
        ))
        .add_executor(make_binding(
            "y",
            "prefix",
            || Box::new(Prefix("y:")),
            &["text"],
            &["text"],
        ))
        .add_executor(make_binding(
            "j",
            "join",
            || Box::new(Join),
            &[tags::FAN_IN],
            &["text"],
        ))
        .with_start("s")
        .add_fan_out("s", vec!["x".to_string(), "y".to_string()])
        .add_fan_in(vec!["x".to_string(), "y".to_string()], "j")
        .build()
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new("text", json!("q")),
        RunOptions::default(),
    )
    .unwrap();

    let events = collect_until_terminal(&mut handle).await;
    let output = final_output(&events).unwrap();
    assert_eq!(output.value, json!("x:q|y:q"));

    // The join target is invoked exactly once per cohort.
    let emitted = events
        .iter()
        .filter(|e| matches!(e, RunEvent::Emitted(_)))
        .count();
    assert_eq!(emitted, 1);
}

/// Scenario: switch with default; the "fr" branch wins, others never run
#[tokio::test]
async fn test_switch_with_default() {
    fn lang_is(lang: &'static str) -> agentflow_core::Predicate {
        Arc::new(move |payload: &TypedPayload| {
            payload.value.get("lang").and_then(Value::as_str) == Some(lang)
        })
    }

    let workflow = WorkflowBuilder::new("router")
        .add_executor(make_binding(
            "s",
            "pass_through",
            || Box::new(PassThrough),
            &["record"],
            &["record"],
        ))
        .add_executor(make_binding(
            "a",
            "prefix",
            || Box::new(Prefix("from-A")),
            &["record"],
            &["text"],
        ))
        .add_executor(make_binding(
            "b",
            "prefix",
            || Box::new(Prefix("from-B")),
            &["record"],
            &["text"],
        ))
        .add_executor(make_binding(
            "d",
            "prefix",
            || Box::new(Prefix("from-D")),
            &["record"],
            &["text"],
        ))
        .with_start("s")
        .add_switch(
            "s",
            vec![
                (lang_is("en"), "a".to_string()),
                (lang_is("fr"), "b".to_string()),
            ],
            Some("d".to_string()),
        )
        .build()
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new("record", json!({"lang": "fr"})),
        RunOptions::default(),
    )
    .unwrap();

    let events = collect_until_terminal(&mut handle).await;
    let output = final_output(&events).unwrap();
    assert_eq!(output.value, json!("from-B"));

    // Exactly two super-steps ran: the router and the taken branch.
    let steps = events
        .iter()
        .filter(|e| matches!(e, RunEvent::SuperStep(_)))
        .count();
    assert_eq!(steps, 2);
}

struct WriteThenRead;

#[async_trait]
impl Executor for WriteThenRead {
    fn kind(&self) -> &str {
        "write_then_read"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        ctx.queue_scope_write(ScopeKind::Topic, "x", json!(1))?;
        let same_step = ctx.read_scope(ScopeKind::Topic, "x");
        ctx.emit(TypedPayload::new(
            "record",
            json!({ "same_step_read": same_step }),
        ));
        Ok(())
    }
}

struct ReadBack;

#[async_trait]
impl Executor for ReadBack {
    fn kind(&self) -> &str {
        "read_back"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        let next_step = ctx.read_scope(ScopeKind::Topic, "x");
        let mut record = payload.value;
        record["next_step_read"] = next_step.unwrap_or(Value::Null);
        ctx.emit(TypedPayload::new("record", record));
        Ok(())
    }
}

/// Law: reads never observe writes queued in the same super-step
#[tokio::test]
async fn test_scope_isolation_within_superstep() {
    let workflow = WorkflowBuilder::new("isolation")
        .add_executor(make_binding(
            "writer",
            "write_then_read",
            || Box::new(WriteThenRead),
            &["record"],
            &["record"],
        ))
        .add_executor(make_binding(
            "reader",
            "read_back",
            || Box::new(ReadBack),
            &["record"],
            &["record"],
        ))
        .with_start("writer")
        .add_edge("writer", "reader")
        .build()
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new("record", json!({})),
        RunOptions::default(),
    )
    .unwrap();

    let events = collect_until_terminal(&mut handle).await;
    let output = final_output(&events).unwrap();
    assert_eq!(output.value["same_step_read"], Value::Null);
    assert_eq!(output.value["next_step_read"], json!(1));
}

struct WrongTyped;

#[async_trait]
impl Executor for WrongTyped {
    fn kind(&self) -> &str {
        "wrong_typed"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        ctx.emit(TypedPayload::new("weird", json!("??")));
        Ok(())
    }
}

/// Law: a payload no target handler accepts is dropped with a diagnostic
#[tokio::test]
async fn test_type_mismatch_drops_message() {
    let workflow = WorkflowBuilder::new("mismatch")
        .add_executor(make_binding(
            "w",
            "wrong_typed",
            || Box::new(WrongTyped),
            &["text"],
            &["text", "weird"],
        ))
        .add_executor(make_binding(
            "sink",
            "pass_through",
            || Box::new(PassThrough),
            &["text"],
            &["text"],
        ))
        .with_start("w")
        .add_edge("w", "sink")
        .build()
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new("text", json!("go")),
        RunOptions::default(),
    )
    .unwrap();

    let events = collect_until_terminal(&mut handle).await;
    assert!(final_output(&events).is_none());
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Diagnostic(DiagnosticEvent::Delivery(obs))
            if obs.status == DeliveryStatus::DroppedTypeMismatch
    )));
}

struct FlakyUntil {
    failures_left: Arc<AtomicU32>,
}

#[async_trait]
impl Executor for FlakyUntil {
    fn kind(&self) -> &str {
        "flaky"
    }

    async fn handle(&mut self, _payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(WorkflowError::handler(ctx.executor_id(), "transient"));
        }
        ctx.emit(TypedPayload::new("text", json!("done")));
        Ok(())
    }
}

#[tokio::test]
async fn test_retry_policy_reinjects_envelope() {
    let failures = Arc::new(AtomicU32::new(2));
    let failures_factory = failures.clone();
    let workflow = WorkflowBuilder::new("retry")
        .add_executor(make_binding(
            "flaky",
            "flaky",
            move || {
                Box::new(FlakyUntil {
                    failures_left: failures_factory.clone(),
                })
            },
            &["text"],
            &["text"],
        ))
        .with_start("flaky")
        .build()
        .unwrap();

    let options = RunOptions::default().with_error_policy(
        "flaky",
        ErrorPolicy::RetryWithBackoff {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    );
    let mut handle = start_run(workflow, TypedPayload::new("text", json!("go")), options).unwrap();
    let output = handle.run_to_completion().await.unwrap().unwrap();
    assert_eq!(output.value, json!("done"));
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fail_run_policy_surfaces_cause_chain() {
    let failures = Arc::new(AtomicU32::new(u32::MAX));
    let workflow = WorkflowBuilder::new("fails")
        .add_executor(make_binding(
            "flaky",
            "flaky",
            move || {
                Box::new(FlakyUntil {
                    failures_left: failures.clone(),
                })
            },
            &["text"],
            &["text"],
        ))
        .with_start("flaky")
        .build()
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new("text", json!("go")),
        RunOptions::default(),
    )
    .unwrap();

    let events = collect_until_terminal(&mut handle).await;
    let failure = events
        .iter()
        .find_map(|e| match e {
            RunEvent::Failed(failure) => Some(failure.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(failure.executor.as_deref(), Some("flaky"));
    assert!(failure.chain.len() >= 2);
    assert!(failure.chain.last().unwrap().contains("transient"));
}

#[tokio::test]
async fn test_skip_policy_continues_run() {
    let failures = Arc::new(AtomicU32::new(u32::MAX));
    let workflow = WorkflowBuilder::new("skips")
        .add_executor(make_binding(
            "flaky",
            "flaky",
            move || {
                Box::new(FlakyUntil {
                    failures_left: failures.clone(),
                })
            },
            &["text"],
            &["text"],
        ))
        .with_start("flaky")
        .build()
        .unwrap();

    let options =
        RunOptions::default().with_error_policy("flaky", ErrorPolicy::SkipMessage);
    let mut handle = start_run(workflow, TypedPayload::new("text", json!("go")), options).unwrap();

    let events = collect_until_terminal(&mut handle).await;
    assert!(final_output(&events).is_none());
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEvent::Completed(None))));
}

#[tokio::test]
async fn test_cancellation_is_terminal() {
    let workflow = WorkflowBuilder::new("spinner")
        .add_executor(make_binding(
            "looper",
            "pass_through",
            || Box::new(PassThrough),
            &["text"],
            &["text"],
        ))
        .with_start("looper")
        .add_edge("looper", "looper")
        .build()
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new("text", json!("spin")),
        RunOptions::default().with_max_supersteps(1_000_000),
    )
    .unwrap();
    handle.cancel();

    let events = collect_until_terminal(&mut handle).await;
    assert!(events.iter().any(|e| matches!(e, RunEvent::Cancelled)));
}

#[tokio::test]
async fn test_max_supersteps_guard() {
    let workflow = WorkflowBuilder::new("spinner")
        .add_executor(make_binding(
            "looper",
            "pass_through",
            || Box::new(PassThrough),
            &["text"],
            &["text"],
        ))
        .with_start("looper")
        .add_edge("looper", "looper")
        .build()
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new("text", json!("spin")),
        RunOptions::default().with_max_supersteps(5),
    )
    .unwrap();
    let err = handle.run_to_completion().await.unwrap_err();
    assert!(err.to_string().contains("5 super-steps"));
}

fn non_system_scopes(checkpoint: &agentflow_core::RunCheckpoint) -> Vec<(String, Value)> {
    let mut entries: Vec<(String, Value)> = checkpoint
        .scopes
        .iter()
        .filter(|(key, _)| !key.starts_with("system/"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// Law: identical inputs produce identical scope snapshots at every
/// boundary and the same final output
#[tokio::test]
async fn test_determinism_across_runs() {
    async fn run_once() -> (String, Arc<InMemoryCheckpointStore>, Option<TypedPayload>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let options = RunOptions::default()
            .with_checkpoint_policy(CheckpointPolicy::EveryStep)
            .with_checkpoint_store(store.clone());
        let mut handle =
            start_run(linear_chain(), TypedPayload::new("i64", json!(5)), options).unwrap();
        let output = handle.run_to_completion().await.unwrap();
        (handle.run_id().to_string(), store, output)
    }

    let (run_a, store_a, output_a) = run_once().await;
    let (run_b, store_b, output_b) = run_once().await;
    assert_eq!(output_a, output_b);

    let index_a = store_a.retrieve_index(&run_a, None).await.unwrap();
    let index_b = store_b.retrieve_index(&run_b, None).await.unwrap();
    assert_eq!(index_a.len(), index_b.len());

    for (entry_a, entry_b) in index_a.iter().zip(&index_b) {
        assert_eq!(entry_a.step, entry_b.step);
        let cp_a = store_a.retrieve(&run_a, &entry_a.id).await.unwrap();
        let cp_b = store_b.retrieve(&run_b, &entry_b.id).await.unwrap();
        assert_eq!(non_system_scopes(&cp_a), non_system_scopes(&cp_b));
    }
}

/// Law: restore(checkpoint(k)) then continue == uninterrupted execution
#[tokio::test]
async fn test_checkpoint_round_trip_mid_run() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let options = RunOptions::default()
        .with_checkpoint_policy(CheckpointPolicy::EveryStep)
        .with_checkpoint_store(store.clone());

    let mut handle =
        start_run(linear_chain(), TypedPayload::new("i64", json!(5)), options).unwrap();
    let uninterrupted = handle.run_to_completion().await.unwrap().unwrap();
    let run_id = handle.run_id().to_string();

    // Resume from each boundary and expect the same terminal output.
    let index = store.retrieve_index(&run_id, None).await.unwrap();
    assert!(!index.is_empty());
    for entry in index.iter().filter(|e| e.step < 3) {
        let mut restored = restore_run(
            linear_chain(),
            store.clone() as Arc<dyn CheckpointStore>,
            &run_id,
            &entry.id,
            RunOptions::default(),
        )
        .await
        .unwrap();
        let replayed = restored.run_to_completion().await.unwrap().unwrap();
        assert_eq!(replayed, uninterrupted, "diverged at step {}", entry.step);
    }
}

// -- Human-in-the-loop ----------------------------------------------------

#[derive(Default)]
struct ScriptedProvider {
    log: Mutex<Vec<ChatMessage>>,
}

impl ScriptedProvider {
    fn appended(&self) -> Vec<ChatMessage> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentProvider for ScriptedProvider {
    async fn create_conversation(&self) -> Result<String> {
        Ok("conv-1".to_string())
    }

    async fn append_message(&self, _conversation_id: &str, message: ChatMessage) -> Result<()> {
        self.log.lock().unwrap().push(message);
        Ok(())
    }

    async fn invoke(&self, _request: InvokeRequest) -> Result<AgentUpdateStream> {
        let approval = self
            .log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|m| m.approval_response_part().map(|(id, ok)| (id.to_string(), ok)));
        let updates = match approval {
            Some((call_id, true)) if call_id == "call-42" => vec![
                Ok(AgentUpdate::MessageDelta {
                    text: "email ".to_string(),
                }),
                Ok(AgentUpdate::Message {
                    message: ChatMessage::assistant("email sent").with_author("mailer"),
                }),
            ],
            Some((_, _)) => vec![Ok(AgentUpdate::Message {
                message: ChatMessage::assistant("okay, not sending").with_author("mailer"),
            })],
            None => vec![Ok(AgentUpdate::ApprovalRequest {
                call_id: "call-42".to_string(),
                name: "send_email".to_string(),
                arguments: json!({"to": "ada@example.com"}),
            })],
        };
        Ok(Box::pin(futures::stream::iter(updates)))
    }

    async fn get_message(&self, _conversation_id: &str, message_id: &str) -> Result<ChatMessage> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| WorkflowError::AgentProvider("message not found".to_string()))
    }

    async fn list_messages(
        &self,
        _conversation_id: &str,
        _query: ListMessagesQuery,
    ) -> Result<MessageStream> {
        let messages: Vec<Result<ChatMessage>> =
            self.appended().into_iter().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(messages)))
    }
}

fn agent_workflow(provider: Arc<ScriptedProvider>) -> Workflow {
    WorkflowBuilder::new("mailer")
        .add_executor(agentflow_core::AgentExecutor::binding(
            "agent", "mailer", provider,
        ))
        .with_start("agent")
        .build()
        .unwrap()
}

async fn wait_for_request(handle: &mut RunHandle) -> agentflow_core::ExternalInputRequest {
    loop {
        match handle.poll_event().await.expect("run ended early") {
            RunEvent::ExternalInputRequested(request) => return request,
            _ => continue,
        }
    }
}

/// Scenario: approval request suspends; approval resumes and completes
#[tokio::test]
async fn test_human_in_the_loop_approval() {
    let provider = Arc::new(ScriptedProvider::default());
    let store = Arc::new(InMemoryCheckpointStore::new());
    let options = RunOptions::default()
        .with_checkpoint_policy(CheckpointPolicy::EveryStep)
        .with_checkpoint_store(store.clone());

    let mut handle = start_run(
        agent_workflow(provider.clone()),
        TypedPayload::of(tags::CHAT_MESSAGE, &ChatMessage::user("please send the email")).unwrap(),
        options,
    )
    .unwrap();

    let request = wait_for_request(&mut handle).await;
    let (call_id, name, _) = request.message.approval_request_part().unwrap();
    assert_eq!(call_id, "call-42");
    assert_eq!(name, "send_email");

    // A mismatched response is rejected and the run stays suspended.
    handle
        .resume_with(ExternalInputResponse::new(ChatMessage::approval_response(
            "call-99", true,
        )))
        .unwrap();
    loop {
        match handle.poll_event().await.unwrap() {
            RunEvent::Diagnostic(DiagnosticEvent::ResponseRejected { .. }) => break,
            RunEvent::Completed(_) | RunEvent::Failed(_) => panic!("run advanced on bad response"),
            _ => continue,
        }
    }

    handle
        .resume_with(ExternalInputResponse::new(ChatMessage::approval_response(
            "call-42", true,
        )))
        .unwrap();
    let events = collect_until_terminal(&mut handle).await;
    let output = final_output(&events).unwrap();
    let reply = ChatMessage::from_tagged_value(&output.value).unwrap();
    assert_eq!(reply.text(), "email sent");

    // The conversation scope holds both sides of the approval exchange.
    let index = store.retrieve_index(handle.run_id(), None).await.unwrap();
    let last = store
        .retrieve(handle.run_id(), &index.last().unwrap().id)
        .await
        .unwrap();
    let history = agentflow_core::messages::messages_from_tagged_value(
        last.scopes.get("conversation/history"),
    );
    assert!(history.iter().any(|m| m.approval_request_part().is_some()));
    assert!(history.iter().any(|m| m.approval_response_part().is_some()));
    assert!(history.iter().any(|m| m.text() == "email sent"));
}

/// Scenario: checkpoint across the suspension, discard, restore, resume
#[tokio::test]
async fn test_checkpoint_restore_across_suspension() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let provider = Arc::new(ScriptedProvider::default());
    let options = RunOptions::default()
        .with_checkpoint_policy(CheckpointPolicy::Manual)
        .with_checkpoint_store(store.clone());

    let mut handle = start_run(
        agent_workflow(provider),
        TypedPayload::of(tags::CHAT_MESSAGE, &ChatMessage::user("please send the email")).unwrap(),
        options,
    )
    .unwrap();

    wait_for_request(&mut handle).await;
    handle.checkpoint_now().unwrap();
    let checkpoint_id = loop {
        match handle.poll_event().await.unwrap() {
            RunEvent::Checkpointed(id) => break id,
            _ => continue,
        }
    };
    let run_id = handle.run_id().to_string();

    // Discard the in-memory run entirely.
    drop(handle);

    let fresh_provider = Arc::new(ScriptedProvider::default());
    let mut restored = restore_run(
        agent_workflow(fresh_provider),
        store.clone() as Arc<dyn CheckpointStore>,
        &run_id,
        &checkpoint_id,
        RunOptions::default(),
    )
    .await
    .unwrap();

    restored
        .resume_with(ExternalInputResponse::new(ChatMessage::approval_response(
            "call-42", true,
        )))
        .unwrap();
    let output = restored.run_to_completion().await.unwrap().unwrap();
    let reply = ChatMessage::from_tagged_value(&output.value).unwrap();
    assert_eq!(reply.text(), "email sent");
}

#[test]
fn test_determinism_property() {
    use proptest::prelude::*;

    proptest!(ProptestConfig::with_cases(16), |(input in -1000i64..1000)| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (first, second) = runtime.block_on(async {
            let mut a = start_run(
                linear_chain(),
                TypedPayload::new("i64", json!(input)),
                RunOptions::default(),
            )
            .unwrap();
            let mut b = start_run(
                linear_chain(),
                TypedPayload::new("i64", json!(input)),
                RunOptions::default(),
            )
            .unwrap();
            (
                a.run_to_completion().await.unwrap(),
                b.run_to_completion().await.unwrap(),
            )
        });
        prop_assert_eq!(first.clone(), second);
        prop_assert_eq!(
            first.unwrap().value,
            json!((input * 2 + 10).to_string())
        );
    });
}
