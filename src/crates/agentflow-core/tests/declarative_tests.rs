//! End-to-end tests for declaratively compiled workflows

use agentflow_core::{
    start_run, tags, AgentProvider, AgentUpdate, AgentUpdateStream, ChatMessage,
    CheckpointPolicy, CheckpointStore, DeclarativeCompiler, InMemoryCheckpointStore,
    InvokeRequest, ListMessagesQuery, MessageStream, Result, RunOptions, TypedPayload,
    WorkflowError,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

async fn run_to_output(yaml: &str, input: Value) -> Option<TypedPayload> {
    let workflow = DeclarativeCompiler::new().compile_str(yaml).unwrap();
    let mut handle = start_run(
        workflow,
        TypedPayload::new(tags::FLOW_TOKEN, input),
        RunOptions::default(),
    )
    .unwrap();
    handle.run_to_completion().await.unwrap()
}

/// Scenario: loop-each with break; acc accumulates 1+2+3 and breaks
/// before 4
#[tokio::test]
async fn test_loop_each_with_break() {
    let output = run_to_output(
        r#"
id: accumulate
inputs:
  items: list
actions:
  - kind: set_variable
    id: init
    variable: topic.acc
    value: 0
  - kind: loop_each
    id: loop1
    items: "=topic.items"
    item_variable: topic.item
    body:
      - kind: set_variable
        id: add
        variable: topic.acc
        value: "=topic.acc + topic.item"
      - kind: condition
        id: check
        condition: "=topic.acc > 3"
        then:
          - kind: break_loop
            id: stop
  - kind: end_conversation
    id: done
    value: "=topic.acc"
"#,
        json!({"items": [1, 2, 3, 4]}),
    )
    .await
    .unwrap();

    assert_eq!(output.type_tag, tags::CONTROL_END_CONVERSATION);
    assert_eq!(output.value, json!(6));
}

/// Scenario: switch with default; the "fr" case runs, others do not
#[tokio::test]
async fn test_switch_routes_first_matching_case() {
    let yaml = r#"
id: router
inputs:
  lang: string
actions:
  - kind: switch
    id: route
    cases:
      - condition: "=topic.lang == 'en'"
        actions:
          - kind: set_variable
            id: english
            variable: topic.result
            value: A
      - condition: "=topic.lang == 'fr'"
        actions:
          - kind: set_variable
            id: french
            variable: topic.result
            value: B
    default:
      - kind: set_variable
        id: fallback
        variable: topic.result
        value: D
  - kind: end_conversation
    id: done
    value: "=topic.result"
"#;

    let fr = run_to_output(yaml, json!({"lang": "fr"})).await.unwrap();
    assert_eq!(fr.value, json!("B"));

    let en = run_to_output(yaml, json!({"lang": "en"})).await.unwrap();
    assert_eq!(en.value, json!("A"));

    let other = run_to_output(yaml, json!({"lang": "de"})).await.unwrap();
    assert_eq!(other.value, json!("D"));
}

#[tokio::test]
async fn test_continue_skips_rest_of_iteration() {
    // Sum only the odd numbers.
    let output = run_to_output(
        r#"
id: odd-sum
inputs:
  items: list
actions:
  - kind: set_variable
    id: init
    variable: topic.acc
    value: 0
  - kind: loop_each
    id: loop1
    items: "=topic.items"
    item_variable: topic.item
    body:
      - kind: condition
        id: even_check
        condition: "=topic.item % 2 == 0"
        then:
          - kind: continue_loop
            id: skip
      - kind: set_variable
        id: add
        variable: topic.acc
        value: "=topic.acc + topic.item"
  - kind: end_conversation
    id: done
    value: "=topic.acc"
"#,
        json!({"items": [1, 2, 3, 4, 5]}),
    )
    .await
    .unwrap();

    assert_eq!(output.value, json!(9));
}

#[tokio::test]
async fn test_goto_jumps_over_actions() {
    let output = run_to_output(
        r#"
id: jumper
actions:
  - kind: set_variable
    id: first
    variable: topic.first
    value: 1
  - kind: condition
    id: decide
    condition: "=topic.first == 1"
    then:
      - kind: goto
        id: jump
        target: finish
    else:
      - kind: set_variable
        id: skipped
        variable: topic.skipped
        value: true
  - kind: end_conversation
    id: finish
    value: "=IsBlank(topic.skipped) && topic.first == 1"
"#,
        json!({}),
    )
    .await
    .unwrap();

    assert_eq!(output.value, json!(true));
}

#[tokio::test]
async fn test_edit_table_and_len() {
    let output = run_to_output(
        r#"
id: tables
actions:
  - kind: edit_table
    id: add1
    variable: topic.orders
    operation:
      op: add_row
      value: "=UserMessage()"
  - kind: edit_table
    id: add2
    variable: topic.orders
    operation:
      op: add_row
      value: second
  - kind: edit_table
    id: drop1
    variable: topic.orders
    operation:
      op: remove_row
      index: 0
  - kind: end_conversation
    id: done
    value: "=Len(topic.orders)"
"#,
        json!({}),
    )
    .await
    .unwrap();

    assert_eq!(output.value, json!(1));
}

#[tokio::test]
async fn test_clear_all_variables() {
    let output = run_to_output(
        r#"
id: clearer
inputs:
  keep: string
actions:
  - kind: clear_all_variables
    id: wipe
  - kind: end_conversation
    id: done
    value: "=IsBlank(topic.keep)"
"#,
        json!({"keep": "something"}),
    )
    .await
    .unwrap();

    assert_eq!(output.value, json!(true));
}

#[tokio::test]
async fn test_parse_value_coerces_number() {
    let output = run_to_output(
        r#"
id: parser
inputs:
  raw: string
actions:
  - kind: parse_value
    id: parse
    variable: topic.count
    value: "=topic.raw"
    value_type: number
  - kind: end_conversation
    id: done
    value: "=topic.count + 1"
"#,
        json!({"raw": "41"}),
    )
    .await
    .unwrap();

    assert_eq!(output.value, json!(42));
}

#[tokio::test]
async fn test_send_activity_appends_to_conversation() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let workflow = DeclarativeCompiler::new()
        .compile_str(
            r#"
id: greeter
actions:
  - kind: send_activity
    id: greet
    message: "='hello ' & UserMessage()"
"#,
        )
        .unwrap();

    let options = RunOptions::default()
        .with_checkpoint_policy(CheckpointPolicy::EveryStep)
        .with_checkpoint_store(store.clone());
    let mut handle = start_run(
        workflow,
        TypedPayload::new(tags::FLOW_TOKEN, json!("ada")),
        options,
    )
    .unwrap();
    handle.run_to_completion().await.unwrap();

    let index = store.retrieve_index(handle.run_id(), None).await.unwrap();
    let last = store
        .retrieve(handle.run_id(), &index.last().unwrap().id)
        .await
        .unwrap();
    let history = agentflow_core::messages::messages_from_tagged_value(
        last.scopes.get("conversation/history"),
    );
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text(), "hello ada");
}

struct EchoProvider;

#[async_trait]
impl AgentProvider for EchoProvider {
    async fn create_conversation(&self) -> Result<String> {
        Ok("conv-echo".to_string())
    }

    async fn append_message(&self, _conversation_id: &str, _message: ChatMessage) -> Result<()> {
        Ok(())
    }

    async fn invoke(&self, _request: InvokeRequest) -> Result<AgentUpdateStream> {
        Ok(Box::pin(futures::stream::iter(vec![Ok(
            AgentUpdate::Message {
                message: ChatMessage::assistant("echo: hi"),
            },
        )])))
    }

    async fn get_message(&self, _conversation_id: &str, _message_id: &str) -> Result<ChatMessage> {
        Err(WorkflowError::AgentProvider("not recorded".to_string()))
    }

    async fn list_messages(
        &self,
        _conversation_id: &str,
        _query: ListMessagesQuery,
    ) -> Result<MessageStream> {
        Ok(Box::pin(futures::stream::iter(Vec::<
            Result<ChatMessage>,
        >::new())))
    }
}

#[tokio::test]
async fn test_invoke_agent_binds_reply_to_variable() {
    let workflow = DeclarativeCompiler::new()
        .with_agent_provider(Arc::new(EchoProvider))
        .compile_str(
            r#"
id: ask
actions:
  - kind: invoke_agent
    id: consult
    agent: echo
    input: "hi"
    output_variable: topic.reply
  - kind: end_conversation
    id: done
    value: "=topic.reply"
"#,
        )
        .unwrap();

    let mut handle = start_run(
        workflow,
        TypedPayload::new(tags::FLOW_TOKEN, json!({})),
        RunOptions::default(),
    )
    .unwrap();
    let output = handle.run_to_completion().await.unwrap().unwrap();
    assert_eq!(output.value, json!("echo: hi"));
}

#[tokio::test]
async fn test_input_defaults_apply_when_absent() {
    let output = run_to_output(
        r#"
id: defaults
inputs:
  greeting:
    type: string
    default: hello
actions:
  - kind: end_conversation
    id: done
    value: "=topic.greeting"
"#,
        json!({}),
    )
    .await
    .unwrap();

    assert_eq!(output.value, json!("hello"));
}
