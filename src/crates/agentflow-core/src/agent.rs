//! Agent provider capability and the agent executor adapter
//!
//! The engine never talks to a concrete model client. It consumes an
//! [`AgentProvider`] - an external collaborator with a narrow contract:
//! conversations, message append/list, and `invoke`, which returns a lazy,
//! finite, non-restartable stream of [`AgentUpdate`]s that the adapter
//! drains to completion inside its handler.
//!
//! [`AgentExecutor`] presents a provider-backed agent as an engine node:
//! it accepts a conversation update, forwards it to the provider, writes
//! the exchange into the `conversation` scope and emits the assistant
//! reply. When the agent proposes a function call that needs approval, the
//! adapter publishes an external-input request instead and the run
//! suspends; the matching response is routed back to it on resume. The
//! pending approval is part of the executor's snapshot state, so the
//! request survives checkpoint/restore.

use crate::envelope::{tags, TypedPayload};
use crate::error::{Result, WorkflowError};
use crate::executor::{Executor, ExecutorContext};
use crate::messages::{
    messages_from_tagged_value, messages_to_tagged_value, ChatMessage,
};
use crate::scopes::ScopeKind;
use crate::workflow::ExecutorBinding;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::Arc;

/// One update in an agent invocation stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentUpdate {
    /// Incremental assistant text
    MessageDelta { text: String },

    /// A complete message produced by the agent
    Message { message: ChatMessage },

    /// The agent proposes a function call that requires approval
    ApprovalRequest {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

/// Lazy, finite, non-restartable stream of invocation updates
pub type AgentUpdateStream = Pin<Box<dyn Stream<Item = Result<AgentUpdate>> + Send>>;

/// Stream of conversation messages
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<ChatMessage>> + Send>>;

/// Parameters for one agent invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeRequest {
    /// Agent to invoke
    pub agent_id: String,

    /// Optional pinned agent version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,

    /// Conversation to run in, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,

    /// Ad-hoc messages for conversationless invocations
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Provider-specific arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl InvokeRequest {
    /// Request for an agent id
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    /// Pin an agent version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.agent_version = Some(version.into());
        self
    }

    /// Run in an existing conversation
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Supply ad-hoc messages
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Provider-specific arguments
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }
}

/// Query options for listing conversation messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub newest_first: bool,
}

/// External agent capability consumed by the engine
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Create a conversation; returns its id
    async fn create_conversation(&self) -> Result<String>;

    /// Append a message to a conversation
    async fn append_message(&self, conversation_id: &str, message: ChatMessage) -> Result<()>;

    /// Invoke an agent; the returned stream is drained to completion by
    /// the caller
    async fn invoke(&self, request: InvokeRequest) -> Result<AgentUpdateStream>;

    /// Fetch one message
    async fn get_message(&self, conversation_id: &str, message_id: &str) -> Result<ChatMessage>;

    /// List conversation messages
    async fn list_messages(
        &self,
        conversation_id: &str,
        query: ListMessagesQuery,
    ) -> Result<MessageStream>;
}

/// Approval the adapter is waiting on across a suspension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PendingApproval {
    call_id: String,
    name: String,
    arguments: Value,
}

/// Conversation scope key holding the chat history
pub const CONVERSATION_HISTORY_KEY: &str = "history";

/// Conversation scope key holding the provider conversation id
pub const CONVERSATION_ID_KEY: &str = "id";

/// Executor adapter wrapping an [`AgentProvider`] as an engine node
pub struct AgentExecutor {
    agent_id: String,
    provider: Arc<dyn AgentProvider>,
    conversation_id: Option<String>,
    pending_approval: Option<PendingApproval>,
}

impl AgentExecutor {
    /// Wrap a provider-backed agent
    pub fn new(agent_id: impl Into<String>, provider: Arc<dyn AgentProvider>) -> Self {
        Self {
            agent_id: agent_id.into(),
            provider,
            conversation_id: None,
            pending_approval: None,
        }
    }

    /// Binding with the adapter's declared types: accepts conversation
    /// updates (and scheduler-injected responses), emits replies
    pub fn binding(
        executor_id: impl Into<String>,
        agent_id: impl Into<String>,
        provider: Arc<dyn AgentProvider>,
    ) -> ExecutorBinding {
        let agent_id = agent_id.into();
        ExecutorBinding::new(executor_id, "agent", {
            let agent_id = agent_id.clone();
            Arc::new(move || {
                Box::new(AgentExecutor::new(agent_id.clone(), provider.clone()))
                    as Box<dyn Executor>
            })
        })
        .with_input(tags::CHAT_MESSAGE)
        .with_input(tags::EXTERNAL_RESPONSE)
        .with_output(tags::CHAT_MESSAGE)
    }

    async fn ensure_conversation(&mut self) -> Result<String> {
        if let Some(id) = &self.conversation_id {
            return Ok(id.clone());
        }
        let id = self.provider.create_conversation().await?;
        self.conversation_id = Some(id.clone());
        Ok(id)
    }

    /// Drain an invocation stream into (reply, approval request)
    async fn drain_invocation(
        &self,
        conversation_id: &str,
    ) -> Result<(Option<ChatMessage>, Option<PendingApproval>)> {
        let request = InvokeRequest::new(self.agent_id.clone()).with_conversation(conversation_id);
        let mut stream = self.provider.invoke(request).await?;

        let mut delta_text = String::new();
        let mut last_message: Option<ChatMessage> = None;
        let mut approval: Option<PendingApproval> = None;
        while let Some(update) = stream.next().await {
            match update? {
                AgentUpdate::MessageDelta { text } => delta_text.push_str(&text),
                AgentUpdate::Message { message } => last_message = Some(message),
                AgentUpdate::ApprovalRequest {
                    call_id,
                    name,
                    arguments,
                } => {
                    approval = Some(PendingApproval {
                        call_id,
                        name,
                        arguments,
                    });
                }
            }
        }

        let reply = match last_message {
            Some(message) => Some(message),
            None if !delta_text.is_empty() => {
                Some(ChatMessage::assistant(delta_text).with_author(self.agent_id.clone()))
            }
            None => None,
        };
        Ok((reply, approval))
    }

    fn write_history(
        &self,
        ctx: &mut ExecutorContext,
        conversation_id: &str,
        history: &[ChatMessage],
    ) -> Result<()> {
        ctx.queue_scope_write(
            ScopeKind::Conversation,
            CONVERSATION_HISTORY_KEY,
            messages_to_tagged_value(history),
        )?;
        ctx.queue_scope_write(
            ScopeKind::Conversation,
            CONVERSATION_ID_KEY,
            json!(conversation_id),
        )?;
        Ok(())
    }

    fn save_state(&self, ctx: &mut ExecutorContext) {
        ctx.save_executor_state(json!({
            "conversation_id": self.conversation_id,
            "pending_approval": self.pending_approval,
        }));
    }

    fn history_from_scope(&self, ctx: &ExecutorContext) -> Vec<ChatMessage> {
        messages_from_tagged_value(
            ctx.read_scope(ScopeKind::Conversation, CONVERSATION_HISTORY_KEY)
                .as_ref(),
        )
    }

    async fn handle_conversation_update(
        &mut self,
        payload: TypedPayload,
        ctx: &mut ExecutorContext,
    ) -> Result<()> {
        let incoming: ChatMessage = serde_json::from_value(payload.value)
            .map_err(|e| WorkflowError::handler(ctx.executor_id(), e.to_string()))?;

        let conversation_id = self.ensure_conversation().await?;
        self.provider
            .append_message(&conversation_id, incoming.clone())
            .await?;

        let mut history = self.history_from_scope(ctx);
        history.push(incoming);

        let (reply, approval) = self.drain_invocation(&conversation_id).await?;

        if let Some(approval) = approval {
            let request_message = ChatMessage::approval_request(
                approval.call_id.clone(),
                approval.name.clone(),
                approval.arguments.clone(),
            )
            .with_author(self.agent_id.clone());
            history.push(request_message.clone());
            self.pending_approval = Some(approval);
            self.write_history(ctx, &conversation_id, &history)?;
            ctx.request_external(request_message);
            self.save_state(ctx);
            return Ok(());
        }

        let reply = reply.ok_or_else(|| {
            WorkflowError::AgentProvider("invocation produced no reply".to_string())
        })?;
        self.provider
            .append_message(&conversation_id, reply.clone())
            .await?;
        history.push(reply.clone());
        self.write_history(ctx, &conversation_id, &history)?;
        self.save_state(ctx);
        ctx.emit(TypedPayload::of(tags::CHAT_MESSAGE, &reply)?);
        Ok(())
    }

    async fn handle_approval_response(
        &mut self,
        payload: TypedPayload,
        ctx: &mut ExecutorContext,
    ) -> Result<()> {
        let response: ChatMessage = serde_json::from_value(payload.value)
            .map_err(|e| WorkflowError::handler(ctx.executor_id(), e.to_string()))?;

        let pending = self.pending_approval.take().ok_or_else(|| {
            WorkflowError::ExternalInput("no approval is pending on this executor".to_string())
        })?;
        match response.approval_response_part() {
            Some((call_id, _)) if call_id == pending.call_id => {}
            _ => {
                self.pending_approval = Some(pending);
                return Err(WorkflowError::ExternalInput(
                    "response does not answer the pending approval".to_string(),
                ));
            }
        }

        let conversation_id = self.ensure_conversation().await?;
        self.provider
            .append_message(&conversation_id, response.clone())
            .await?;
        let mut history = self.history_from_scope(ctx);
        history.push(response);

        let (reply, approval) = self.drain_invocation(&conversation_id).await?;
        if approval.is_some() {
            return Err(WorkflowError::AgentProvider(
                "provider requested a second approval during resume".to_string(),
            ));
        }
        let reply = reply.ok_or_else(|| {
            WorkflowError::AgentProvider("invocation produced no reply".to_string())
        })?;
        self.provider
            .append_message(&conversation_id, reply.clone())
            .await?;
        history.push(reply.clone());
        self.write_history(ctx, &conversation_id, &history)?;
        self.save_state(ctx);
        ctx.emit(TypedPayload::of(tags::CHAT_MESSAGE, &reply)?);
        Ok(())
    }
}

#[async_trait]
impl Executor for AgentExecutor {
    fn kind(&self) -> &str {
        "agent"
    }

    async fn handle(&mut self, payload: TypedPayload, ctx: &mut ExecutorContext) -> Result<()> {
        match payload.type_tag.as_str() {
            tags::EXTERNAL_RESPONSE => self.handle_approval_response(payload, ctx).await,
            _ => self.handle_conversation_update(payload, ctx).await,
        }
    }

    fn snapshot_state(&self) -> Option<Value> {
        Some(json!({
            "conversation_id": self.conversation_id,
            "pending_approval": self.pending_approval,
        }))
    }

    fn on_restore(&mut self, blob: Value) -> Result<()> {
        self.conversation_id = blob
            .get("conversation_id")
            .and_then(Value::as_str)
            .map(String::from);
        self.pending_approval = blob
            .get("pending_approval")
            .filter(|v| !v.is_null())
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?;
        Ok(())
    }
}
