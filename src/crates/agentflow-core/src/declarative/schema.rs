//! YAML workflow document schema
//!
//! The declarative surface: a document with `id`, `name`, `inputs`,
//! `start` and a tree of `actions`. Action kinds map one-to-one onto the
//! executors in [`super::actions`]; structured control flow (`condition`,
//! `switch`, `loop_each`) nests child action lists. Expression fields are
//! strings prefixed with `=`; everything else is a literal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Top-level declarative workflow document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDoc {
    /// Workflow id
    pub id: String,

    /// Human-readable name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Declared workflow inputs, seeded into the topic scope at start
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDecl>,

    /// Action id execution starts at; defaults to the first action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// The action tree
    pub actions: Vec<ActionDef>,
}

/// One declared workflow input
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputDecl {
    /// Shorthand: `items: list`
    Kind(String),
    /// Full form with optional default
    Spec {
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
}

impl InputDecl {
    /// Declared kind name, if any
    pub fn kind(&self) -> Option<&str> {
        match self {
            InputDecl::Kind(kind) => Some(kind),
            InputDecl::Spec { kind, .. } => kind.as_deref(),
        }
    }

    /// Default value, if any
    pub fn default_value(&self) -> Option<&Value> {
        match self {
            InputDecl::Kind(_) => None,
            InputDecl::Spec { default, .. } => default.as_ref(),
        }
    }
}

/// One case of a declarative switch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCaseDef {
    /// Case condition expression
    pub condition: Value,
    /// Actions executed when the condition holds
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

/// Table mutation performed by `edit_table`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TableOpDef {
    /// Append a row (expression evaluating to a list of cell values)
    AddRow { value: Value },
    /// Remove the row at an index (expression or literal number)
    RemoveRow { index: Value },
    /// Remove every row
    Clear,
}

/// A declarative action; `kind` selects the executor it compiles to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDef {
    /// Send a message/activity to the conversation surface
    SendActivity {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        message: Value,
    },

    /// Assign a variable
    SetVariable {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        variable: String,
        value: Value,
    },

    /// Evaluate and coerce a value into a typed variable
    ParseValue {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        variable: String,
        value: Value,
        value_type: String,
    },

    /// Two-way branch
    Condition {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        condition: Value,
        #[serde(default)]
        then: Vec<ActionDef>,
        #[serde(default, rename = "else")]
        r#else: Vec<ActionDef>,
    },

    /// Multi-way branch
    Switch {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        cases: Vec<SwitchCaseDef>,
        #[serde(default)]
        default: Vec<ActionDef>,
    },

    /// Iterate a list, binding each item to a variable
    LoopEach {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        items: Value,
        item_variable: String,
        #[serde(default)]
        body: Vec<ActionDef>,
    },

    /// Break out of the enclosing loop
    BreakLoop {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    /// Skip to the next iteration of the enclosing loop
    ContinueLoop {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    /// Jump to another action by id
    Goto {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        target: String,
    },

    /// Invoke an agent and continue with its reply
    InvokeAgent {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_variable: Option<String>,
    },

    /// Finish the conversation with an optional final value
    EndConversation {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },

    /// Remove every topic variable
    ClearAllVariables {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    /// Mutate a table variable
    EditTable {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        variable: String,
        operation: TableOpDef,
    },
}

impl ActionDef {
    /// The action's stable id, used in traces, checkpoints and diagnostics
    pub fn id(&self) -> &str {
        match self {
            ActionDef::SendActivity { id, .. }
            | ActionDef::SetVariable { id, .. }
            | ActionDef::ParseValue { id, .. }
            | ActionDef::Condition { id, .. }
            | ActionDef::Switch { id, .. }
            | ActionDef::LoopEach { id, .. }
            | ActionDef::BreakLoop { id, .. }
            | ActionDef::ContinueLoop { id, .. }
            | ActionDef::Goto { id, .. }
            | ActionDef::InvokeAgent { id, .. }
            | ActionDef::EndConversation { id, .. }
            | ActionDef::ClearAllVariables { id, .. }
            | ActionDef::EditTable { id, .. } => id,
        }
    }
}
