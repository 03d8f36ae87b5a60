//! Shared state scopes with super-step commit semantics
//!
//! Three scopes exist per run: `topic` (workflow variables), `conversation`
//! (the active chat) and `system` (read-only runtime facts seeded by the
//! engine). Handlers never touch scope storage directly: they read from a
//! pre-step snapshot and queue writes that commit atomically at the
//! super-step boundary. Reads within a super-step therefore always observe
//! the pre-step value, which is what makes super-steps deterministic.
//!
//! Concurrent writes to the same key resolve last-write-wins in the
//! deterministic commit order (executor registration order, then emission
//! order within a handler); the engine records a [`ScopeConflict`] for each
//! key written more than once so the collision is observable.
//!
//! Keys may carry a declared [`ValueKind`]; a write of the wrong kind is a
//! state error and fails the owning handler.

use crate::envelope::ExecutorId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The three built-in scopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    /// Per-run workflow variables
    Topic,
    /// The active chat history and related conversation state
    Conversation,
    /// Read-only runtime facts (run id, workflow id, triggering message)
    System,
}

impl ScopeKind {
    /// Scope name as used in variable paths and snapshot keys
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Topic => "topic",
            ScopeKind::Conversation => "conversation",
            ScopeKind::System => "system",
        }
    }

    /// Parse a scope name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "topic" => Some(ScopeKind::Topic),
            "conversation" => Some(ScopeKind::Conversation),
            "system" => Some(ScopeKind::System),
            _ => None,
        }
    }
}

/// Kinds a scope value can take, for declared-key validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    List,
    Object,
    /// A chat message (`$type: chat_message`)
    Message,
    /// A message list (`$type: message_list`)
    MessageList,
    /// A tabular record (`$type: table`)
    Table,
}

impl ValueKind {
    /// Classify a value, recognizing the engine's `$type` discriminators
    pub fn of(value: &Value) -> Self {
        if let Some(tag) = value.get("$type").and_then(Value::as_str) {
            match tag {
                "chat_message" => return ValueKind::Message,
                "message_list" => return ValueKind::MessageList,
                "table" => return ValueKind::Table,
                _ => {}
            }
        }
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Parse a declared-kind name from a declarative input section
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "null" => Some(ValueKind::Null),
            "bool" | "boolean" => Some(ValueKind::Bool),
            "number" => Some(ValueKind::Number),
            "string" => Some(ValueKind::String),
            "list" | "array" => Some(ValueKind::List),
            "object" | "record" => Some(ValueKind::Object),
            "message" => Some(ValueKind::Message),
            "message_list" | "messages" => Some(ValueKind::MessageList),
            "table" => Some(ValueKind::Table),
            _ => None,
        }
    }
}

/// One queued mutation of a scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    /// Set a key to a value
    Set { key: String, value: Value },
    /// Remove a key
    Remove { key: String },
    /// Remove every key in the scope
    Clear,
}

/// A scope mutation queued by a handler, applied at the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeWrite {
    pub scope: ScopeKind,
    #[serde(flatten)]
    pub op: WriteOp,
}

impl ScopeWrite {
    /// Queue a set
    pub fn set(scope: ScopeKind, key: impl Into<String>, value: Value) -> Self {
        Self {
            scope,
            op: WriteOp::Set {
                key: key.into(),
                value,
            },
        }
    }

    /// Queue a removal
    pub fn remove(scope: ScopeKind, key: impl Into<String>) -> Self {
        Self {
            scope,
            op: WriteOp::Remove { key: key.into() },
        }
    }

    /// Queue a full clear of a scope
    pub fn clear(scope: ScopeKind) -> Self {
        Self {
            scope,
            op: WriteOp::Clear,
        }
    }
}

/// Diagnostic recorded when one key is written more than once in a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeConflict {
    pub scope: ScopeKind,
    pub key: String,
    /// Executors that wrote the key, in commit order; the last one won
    pub writers: Vec<ExecutorId>,
}

/// Versioned key/value storage for the three scopes
#[derive(Debug, Clone, Default)]
pub struct ScopeState {
    topic: BTreeMap<String, Value>,
    conversation: BTreeMap<String, Value>,
    system: BTreeMap<String, Value>,
    declared: HashMap<ScopeKind, HashMap<String, ValueKind>>,
}

impl ScopeState {
    /// Empty scope state
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, scope: ScopeKind) -> &BTreeMap<String, Value> {
        match scope {
            ScopeKind::Topic => &self.topic,
            ScopeKind::Conversation => &self.conversation,
            ScopeKind::System => &self.system,
        }
    }

    fn map_mut(&mut self, scope: ScopeKind) -> &mut BTreeMap<String, Value> {
        match scope {
            ScopeKind::Topic => &mut self.topic,
            ScopeKind::Conversation => &mut self.conversation,
            ScopeKind::System => &mut self.system,
        }
    }

    /// Read a value
    pub fn read(&self, scope: ScopeKind, key: &str) -> Option<&Value> {
        self.map(scope).get(key)
    }

    /// Declare the expected kind for a key
    pub fn declare(&mut self, scope: ScopeKind, key: impl Into<String>, kind: ValueKind) {
        self.declared
            .entry(scope)
            .or_default()
            .insert(key.into(), kind);
    }

    /// Declared kind for a key, if any
    pub fn declared_kind(&self, scope: ScopeKind, key: &str) -> Option<ValueKind> {
        self.declared.get(&scope).and_then(|m| m.get(key)).copied()
    }

    /// Engine-side write into the read-only system scope
    pub fn set_system(&mut self, key: impl Into<String>, value: Value) {
        self.system.insert(key.into(), value);
    }

    /// Check a queued write against scope rules and declared kinds
    pub fn validate_write(&self, write: &ScopeWrite) -> crate::error::Result<()> {
        if write.scope == ScopeKind::System {
            let key = match &write.op {
                WriteOp::Set { key, .. } | WriteOp::Remove { key } => key.as_str(),
                WriteOp::Clear => "*",
            };
            return Err(crate::error::WorkflowError::state(
                "system",
                key,
                "the system scope is read-only",
            ));
        }
        if let WriteOp::Set { key, value } = &write.op {
            if let Some(expected) = self.declared_kind(write.scope, key) {
                let actual = ValueKind::of(value);
                if actual != expected && actual != ValueKind::Null {
                    return Err(crate::error::WorkflowError::state(
                        write.scope.as_str(),
                        key,
                        format!("expected {:?} value, got {:?}", expected, actual),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Apply queued writes atomically, in the order given
    ///
    /// The caller supplies writes already sorted into the deterministic
    /// commit order; later writes to the same key win. Returns a conflict
    /// diagnostic for every key written more than once.
    pub fn commit(&mut self, writes: Vec<(ExecutorId, ScopeWrite)>) -> Vec<ScopeConflict> {
        let mut writers: HashMap<(ScopeKind, String), Vec<ExecutorId>> = HashMap::new();

        for (executor, write) in writes {
            match write.op {
                WriteOp::Set { key, value } => {
                    writers
                        .entry((write.scope, key.clone()))
                        .or_default()
                        .push(executor);
                    self.map_mut(write.scope).insert(key, value);
                }
                WriteOp::Remove { key } => {
                    self.map_mut(write.scope).remove(&key);
                }
                WriteOp::Clear => {
                    self.map_mut(write.scope).clear();
                }
            }
        }

        let mut conflicts: Vec<ScopeConflict> = writers
            .into_iter()
            .filter(|(_, writers)| writers.len() > 1)
            .map(|((scope, key), writers)| ScopeConflict {
                scope,
                key,
                writers,
            })
            .collect();
        conflicts.sort_by(|a, b| (a.scope.as_str(), &a.key).cmp(&(b.scope.as_str(), &b.key)));
        conflicts
    }

    /// Flatten every scope into `"{scope}/{key}"` entries for checkpointing
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for scope in [ScopeKind::Topic, ScopeKind::Conversation, ScopeKind::System] {
            for (key, value) in self.map(scope) {
                out.insert(format!("{}/{}", scope.as_str(), key), value.clone());
            }
        }
        out
    }

    /// Rebuild scope contents from a checkpoint snapshot
    pub fn restore(&mut self, snapshot: &HashMap<String, Value>) {
        self.topic.clear();
        self.conversation.clear();
        self.system.clear();
        for (path, value) in snapshot {
            if let Some((scope_name, key)) = path.split_once('/') {
                if let Some(scope) = ScopeKind::parse(scope_name) {
                    self.map_mut(scope).insert(key.to_string(), value.clone());
                }
            }
        }
    }
}
