//! Message envelopes and payload type tags
//!
//! Envelopes are the only means of inter-executor communication. Every
//! payload travels with a **type tag**; the router dispatches on it and the
//! build-time validator checks edge compatibility against the tags each
//! executor declares. Envelopes are fully serde-serializable so inbox
//! contents round-trip through checkpoints.
//!
//! The `delivery_id` identifies the cohort a message belongs to: envelopes
//! emitted while handling a message inherit its delivery id, and fan-out
//! clones share one, so a downstream fan-in can correlate siblings on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Executor identifier - unique name for each executor in the workflow
pub type ExecutorId = String;

/// Edge group identifier
pub type EdgeId = String;

/// Delivery cohort identifier
pub type DeliveryId = String;

/// Payload type tag used for handler dispatch and edge validation
pub type TypeTag = String;

/// Pseudo source id for the run's initial input envelope
pub const INPUT_SOURCE: &str = "__input__";

/// Well-known payload type tags recognized by the engine
pub mod tags {
    /// Sequential flow token produced by declarative action executors
    pub const FLOW_TOKEN: &str = "flow.token";

    /// A chat message (conversation update)
    pub const CHAT_MESSAGE: &str = "chat.message";

    /// Ordered aggregate produced by a completed fan-in cohort
    pub const FAN_IN: &str = "fanin.tuple";

    /// Response to an outstanding external-input request, injected by the
    /// scheduler on resume (never routed by edges)
    pub const EXTERNAL_RESPONSE: &str = "external.response";

    /// Loop break control payload
    pub const CONTROL_BREAK: &str = "control.break";

    /// Loop continue control payload
    pub const CONTROL_CONTINUE: &str = "control.continue";

    /// Conversation end control payload carrying the final value
    pub const CONTROL_END_CONVERSATION: &str = "control.end_conversation";

    /// Catch-all input declaration accepting any payload type
    pub const ANY: &str = "*";
}

/// A payload together with its type tag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypedPayload {
    /// Tag the router dispatches on
    pub type_tag: TypeTag,

    /// The payload value
    pub value: Value,
}

impl TypedPayload {
    /// Create a payload from a tag and a JSON value
    pub fn new(type_tag: impl Into<TypeTag>, value: Value) -> Self {
        Self {
            type_tag: type_tag.into(),
            value,
        }
    }

    /// Create a payload by serializing any `Serialize` value
    pub fn of<T: Serialize>(type_tag: impl Into<TypeTag>, value: &T) -> crate::error::Result<Self> {
        Ok(Self {
            type_tag: type_tag.into(),
            value: serde_json::to_value(value)?,
        })
    }
}

/// Message envelope - the unit the scheduler queues, routes and checkpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// The typed payload
    pub payload: TypedPayload,

    /// Executor that emitted the message (or [`INPUT_SOURCE`])
    pub source_id: ExecutorId,

    /// Explicit target for directed sends; `None` for edge-routed messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<ExecutorId>,

    /// Cohort identifier, inherited through handlers and fan-outs
    pub delivery_id: DeliveryId,

    /// Trace correlation id for the observability surface
    pub trace_span: String,

    /// Retry attempt counter, bumped by the retry error policy
    #[serde(default)]
    pub attempt: u32,
}

impl Envelope {
    /// New envelope with a fresh delivery id and trace span
    pub fn new(source_id: impl Into<ExecutorId>, payload: TypedPayload) -> Self {
        Self {
            payload,
            source_id: source_id.into(),
            target_id: None,
            delivery_id: Uuid::new_v4().to_string(),
            trace_span: Uuid::new_v4().to_string(),
            attempt: 0,
        }
    }

    /// Set an explicit target
    pub fn with_target(mut self, target_id: impl Into<ExecutorId>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Join an existing delivery cohort
    pub fn with_delivery(mut self, delivery_id: impl Into<DeliveryId>) -> Self {
        self.delivery_id = delivery_id.into();
        self
    }
}
