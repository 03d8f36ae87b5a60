//! Error types and error handling for workflow operations
//!
//! This module defines all error kinds the engine can surface:
//!
//! ```text
//! WorkflowError
//! ├── Build            - invalid graph, raised at build(), no run begins
//! ├── Compile          - declarative YAML issues, with source position
//! ├── Routing          - message with no matching handler or edge target
//! ├── Handler          - executor handler failure
//! ├── Expression       - expression evaluation failure
//! ├── State            - scope type mismatch or illegal scope write
//! ├── ExternalInput    - response does not match the outstanding request
//! ├── Checkpoint       - store unreachable / version mismatch / corrupt
//! ├── RunFailed        - structured cause chain for a failed run
//! ├── Cancelled        - terminal, non-error classification
//! └── Serialization / Yaml / Io - wrapped library errors
//! ```
//!
//! Recoverable conditions (routing drops, scope conflicts, checkpoint write
//! failures) are surfaced as run events and never abort the run by
//! themselves; everything that does abort the run arrives wrapped in
//! [`WorkflowError::RunFailed`] so callers can walk the cause chain from
//! the workflow down to the original error.

use thiserror::Error;

/// Convenience result type using [`WorkflowError`]
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// A single graph validation violation, with the identifiers needed to fix it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// No start executor was configured
    #[error("no start executor was set")]
    MissingStart,

    /// The configured start executor was never registered
    #[error("start executor '{0}' is not registered")]
    UnknownStart(String),

    /// Two executors were registered under the same id
    #[error("duplicate executor id '{0}'")]
    DuplicateExecutor(String),

    /// An edge references an executor that does not exist
    #[error("edge '{edge}' references unknown executor '{executor}'")]
    UnknownEndpoint { edge: String, executor: String },

    /// An executor cannot be reached from the start executor
    #[error("executor '{0}' is not reachable from the start executor")]
    Unreachable(String),

    /// A fan-out or fan-in edge with no targets or sources
    #[error("edge '{0}' declares no endpoints")]
    EmptyEdge(String),

    /// No output type of the edge source is accepted by the target
    #[error("edge '{edge}': no output type of '{from}' is accepted by '{to}'")]
    IncompatibleEdge {
        edge: String,
        from: String,
        to: String,
    },

    /// A declared input type is not produced by any incoming edge
    #[error("executor '{executor}' declares input type '{type_tag}' which no incoming edge produces")]
    UnfedInput {
        executor: String,
        type_tag: String,
    },
}

/// Declarative compilation error with source position where available
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}{}{}",
    action_id.as_ref().map(|id| format!(" (action '{}')", id)).unwrap_or_default(),
    location.map(|(line, column)| format!(" at line {}, column {}", line, column)).unwrap_or_default())]
pub struct CompileError {
    /// What went wrong
    pub message: String,
    /// Offending action id, when the error is attributable to one
    pub action_id: Option<String>,
    /// (line, column) in the source document, when the parser provides one
    pub location: Option<(usize, usize)>,
}

impl CompileError {
    /// Error attributable to a specific action
    pub fn for_action(action_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            action_id: Some(action_id.into()),
            location: None,
        }
    }

    /// Error without an action context (document-level)
    pub fn document(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            action_id: None,
            location: None,
        }
    }

    /// Wrap a YAML parser error, carrying its source position
    pub fn from_yaml(err: &serde_yaml::Error) -> Self {
        Self {
            message: err.to_string(),
            action_id: None,
            location: err
                .location()
                .map(|loc| (loc.line(), loc.column())),
        }
    }
}

/// Comprehensive error type for all workflow operations
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Graph validation failed; every violation is reported
    #[error("workflow build failed: {}", format_build_errors(.0))]
    Build(Vec<BuildError>),

    /// Declarative YAML compilation failed
    #[error("declarative compile failed: {0}")]
    Compile(#[from] CompileError),

    /// A message had no matching handler or edge target
    #[error("no route for message of type '{type_tag}' emitted by '{emitter}'")]
    Routing { emitter: String, type_tag: String },

    /// An executor handler returned an error
    #[error("executor '{executor}' handler failed: {error}")]
    Handler { executor: String, error: String },

    /// Expression evaluation failed
    #[error("expression '{expression}' failed: {error}")]
    Expression { expression: String, error: String },

    /// A scope write was rejected
    #[error("state error for {scope}/{key}: {error}")]
    State {
        scope: String,
        key: String,
        error: String,
    },

    /// A resume response did not match the outstanding request
    #[error("external input rejected: {0}")]
    ExternalInput(String),

    /// Checkpoint store failure
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] agentflow_checkpoint::CheckpointError),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Agent provider failure
    #[error("agent provider error: {0}")]
    AgentProvider(String),

    /// The run was cancelled
    #[error("run was cancelled")]
    Cancelled,

    /// The run exceeded its configured super-step bound
    #[error("run exceeded {0} super-steps")]
    MaxSuperSteps(u64),

    /// Structured cause chain for a failed run: workflow → executor → leaf
    #[error("run of workflow '{workflow}' failed in executor '{executor}'")]
    RunFailed {
        workflow: String,
        executor: String,
        #[source]
        source: Box<WorkflowError>,
    },

    /// Custom application-defined error
    #[error("{0}")]
    Custom(String),
}

impl WorkflowError {
    /// Create a handler error with executor context
    pub fn handler(executor: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Handler {
            executor: executor.into(),
            error: error.into(),
        }
    }

    /// Create a state error with scope/key context
    pub fn state(
        scope: impl Into<String>,
        key: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::State {
            scope: scope.into(),
            key: key.into(),
            error: error.into(),
        }
    }

    /// Wrap an error into the run-level cause chain
    pub fn run_failed(
        workflow: impl Into<String>,
        executor: impl Into<String>,
        source: WorkflowError,
    ) -> Self {
        Self::RunFailed {
            workflow: workflow.into(),
            executor: executor.into(),
            source: Box::new(source),
        }
    }

    /// Render the full cause chain, outermost first
    pub fn cause_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current: &dyn std::error::Error = self;
        while let Some(source) = current.source() {
            chain.push(source.to_string());
            current = source;
        }
        chain
    }
}

fn format_build_errors(errors: &[BuildError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_display_lists_all_violations() {
        let err = WorkflowError::Build(vec![
            BuildError::MissingStart,
            BuildError::Unreachable("b".to_string()),
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("no start executor"));
        assert!(rendered.contains("'b' is not reachable"));
    }

    #[test]
    fn test_compile_error_display() {
        let err = CompileError {
            message: "unknown action kind 'frobnicate'".to_string(),
            action_id: Some("a1".to_string()),
            location: Some((3, 5)),
        };
        assert_eq!(
            err.to_string(),
            "unknown action kind 'frobnicate' (action 'a1') at line 3, column 5"
        );
    }

    #[test]
    fn test_cause_chain_walks_to_leaf() {
        let leaf = WorkflowError::handler("agent", "provider timed out");
        let outer = WorkflowError::run_failed("wf", "agent", leaf);
        let chain = outer.cause_chain();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].contains("workflow 'wf'"));
        assert!(chain[1].contains("provider timed out"));
    }
}
