//! Chat message types and engine-recognized structured values
//!
//! The engine recognizes a small set of structured values beyond plain
//! JSON: the chat message, the message list and the tabular record. They
//! are what the `conversation` scope holds, what the agent executor
//! adapter exchanges with providers, and what `edit_table` operates on.
//!
//! On the checkpoint wire these values carry a `$type` discriminator
//! (`chat_message`, `message_list`, `table`) produced by the
//! `to_tagged_value` helpers so stores can round-trip them without knowing
//! their shape and the wire marshaller can validate them on restore.
//!
//! # Examples
//!
//! ```rust
//! use agentflow_core::messages::{ChatMessage, MessageRole};
//!
//! let msg = ChatMessage::user("What is the weather?");
//! assert_eq!(msg.role, MessageRole::User);
//! assert_eq!(msg.text(), "What is the weather?");
//!
//! let approval = ChatMessage::approval_request("call-42", "send_email", serde_json::json!({}));
//! assert_eq!(approval.content_id(), "call-42");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Role of the message sender in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions and constraints for the conversation
    System,
    /// Input from the end user
    User,
    /// Replies from the agent
    Assistant,
    /// Output of a tool or function execution
    Tool,
}

/// One piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },

    /// A function call proposed by the agent
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },

    /// Result of an executed function call
    FunctionResult { call_id: String, result: Value },

    /// Approval request for a proposed function or server-tool call
    ApprovalRequest {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },

    /// Approval or denial matching an earlier request, by call id
    ApprovalResponse { call_id: String, approved: bool },
}

/// A chat message exchanged with agents and stored in the conversation scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Stable message id
    pub id: String,

    /// Sender role
    pub role: MessageRole,

    /// Ordered content parts
    pub content: Vec<ContentPart>,

    /// Optional author name (agent id, user handle)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl ChatMessage {
    /// Create a message with a fresh id
    pub fn new(role: MessageRole, content: Vec<ContentPart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            author: None,
        }
    }

    /// Plain-text user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentPart::Text { text: text.into() }])
    }

    /// Plain-text assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(
            MessageRole::Assistant,
            vec![ContentPart::Text { text: text.into() }],
        )
    }

    /// Plain-text system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ContentPart::Text { text: text.into() }])
    }

    /// Assistant message carrying an approval request for a function call
    pub fn approval_request(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self::new(
            MessageRole::Assistant,
            vec![ContentPart::ApprovalRequest {
                call_id: call_id.into(),
                name: name.into(),
                arguments,
            }],
        )
    }

    /// User message carrying an approval or denial for a call id
    pub fn approval_response(call_id: impl Into<String>, approved: bool) -> Self {
        Self::new(
            MessageRole::User,
            vec![ContentPart::ApprovalResponse {
                call_id: call_id.into(),
                approved,
            }],
        )
    }

    /// Set an explicit id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the author
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The approval request part, if any
    pub fn approval_request_part(&self) -> Option<(&str, &str, &Value)> {
        self.content.iter().find_map(|part| match part {
            ContentPart::ApprovalRequest {
                call_id,
                name,
                arguments,
            } => Some((call_id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }

    /// The approval response part, if any
    pub fn approval_response_part(&self) -> Option<(&str, bool)> {
        self.content.iter().find_map(|part| match part {
            ContentPart::ApprovalResponse { call_id, approved } => {
                Some((call_id.as_str(), *approved))
            }
            _ => None,
        })
    }

    /// Correlation id used by the human-in-the-loop contract: the approval
    /// call id when present, otherwise the message id
    pub fn content_id(&self) -> String {
        if let Some((call_id, _, _)) = self.approval_request_part() {
            return call_id.to_string();
        }
        if let Some((call_id, _)) = self.approval_response_part() {
            return call_id.to_string();
        }
        self.id.clone()
    }

    /// Serialize with the `$type` wire discriminator
    pub fn to_tagged_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("$type".to_string(), json!("chat_message"));
        }
        value
    }

    /// Parse a value produced by [`to_tagged_value`](Self::to_tagged_value)
    pub fn from_tagged_value(value: &Value) -> Option<Self> {
        let mut value = value.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.remove("$type");
        }
        serde_json::from_value(value).ok()
    }
}

/// Serialize a message list with the `$type` wire discriminator
pub fn messages_to_tagged_value(messages: &[ChatMessage]) -> Value {
    json!({
        "$type": "message_list",
        "messages": messages.iter().map(ChatMessage::to_tagged_value).collect::<Vec<_>>(),
    })
}

/// Parse a tagged message list; tolerates a missing or empty value
pub fn messages_from_tagged_value(value: Option<&Value>) -> Vec<ChatMessage> {
    value
        .and_then(|v| v.get("messages"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(ChatMessage::from_tagged_value)
                .collect()
        })
        .unwrap_or_default()
}

/// Tabular record: named columns plus rows of values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TableRecord {
    /// Column names, in display order
    pub columns: Vec<String>,

    /// Row data; each row is positionally aligned with `columns`
    pub rows: Vec<Vec<Value>>,
}

impl TableRecord {
    /// Empty table with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row
    pub fn add_row(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Remove a row by index; out-of-range indexes are ignored
    pub fn remove_row(&mut self, index: usize) {
        if index < self.rows.len() {
            self.rows.remove(index);
        }
    }

    /// Remove all rows, keeping the columns
    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Serialize with the `$type` wire discriminator
    pub fn to_tagged_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert("$type".to_string(), json!("table"));
        }
        value
    }

    /// Parse a value produced by [`to_tagged_value`](Self::to_tagged_value)
    pub fn from_tagged_value(value: &Value) -> Option<Self> {
        let mut value = value.clone();
        if let Some(obj) = value.as_object_mut() {
            obj.remove("$type");
        }
        serde_json::from_value(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_concatenates_text_parts() {
        let msg = ChatMessage::new(
            MessageRole::Assistant,
            vec![
                ContentPart::Text {
                    text: "Hello ".to_string(),
                },
                ContentPart::FunctionResult {
                    call_id: "c1".to_string(),
                    result: json!(1),
                },
                ContentPart::Text {
                    text: "world".to_string(),
                },
            ],
        );
        assert_eq!(msg.text(), "Hello world");
    }

    #[test]
    fn test_content_id_prefers_approval_call_id() {
        let request = ChatMessage::approval_request("call-42", "send_email", json!({}));
        assert_eq!(request.content_id(), "call-42");

        let response = ChatMessage::approval_response("call-42", true);
        assert_eq!(response.content_id(), "call-42");

        let plain = ChatMessage::user("hi").with_id("m-1");
        assert_eq!(plain.content_id(), "m-1");
    }

    #[test]
    fn test_tagged_round_trip() {
        let msg = ChatMessage::assistant("done").with_author("agent-1");
        let tagged = msg.to_tagged_value();
        assert_eq!(tagged["$type"], json!("chat_message"));
        assert_eq!(ChatMessage::from_tagged_value(&tagged), Some(msg));
    }

    #[test]
    fn test_message_list_round_trip() {
        let history = vec![ChatMessage::user("q"), ChatMessage::assistant("a")];
        let tagged = messages_to_tagged_value(&history);
        assert_eq!(tagged["$type"], json!("message_list"));
        assert_eq!(messages_from_tagged_value(Some(&tagged)), history);
        assert!(messages_from_tagged_value(None).is_empty());
    }

    #[test]
    fn test_table_operations() {
        let mut table = TableRecord::new(vec!["name".to_string(), "count".to_string()]);
        table.add_row(vec![json!("a"), json!(1)]);
        table.add_row(vec![json!("b"), json!(2)]);
        table.remove_row(0);
        assert_eq!(table.rows, vec![vec![json!("b"), json!(2)]]);

        table.clear();
        assert!(table.rows.is_empty());
        assert_eq!(table.columns.len(), 2);
    }
}
