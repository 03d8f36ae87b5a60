//! Declarative YAML workflows
//!
//! Compiles a YAML workflow document into the same immutable [`Workflow`]
//! graph the programmatic builder produces: actions become executors,
//! structured control flow becomes direct/switch edges, and expression
//! fields become parsed [`CompiledValue`](crate::expr::CompiledValue)s
//! evaluated against scope state at run time.
//!
//! ```rust,ignore
//! use agentflow_core::declarative::DeclarativeCompiler;
//!
//! let workflow = DeclarativeCompiler::new().compile_str(r#"
//! id: greeter
//! actions:
//!   - kind: set_variable
//!     id: greet
//!     variable: topic.greeting
//!     value: "='hello ' & UserMessage()"
//!   - kind: end_conversation
//!     id: done
//!     value: "=topic.greeting"
//! "#)?;
//! ```

pub mod actions;
pub mod compile;
pub mod schema;

pub use compile::{
    compile_document, CompiledAction, CompiledTableOp, DeclarativeCompiler, VariablePath,
};
pub use schema::{ActionDef, InputDecl, SwitchCaseDef, TableOpDef, WorkflowDoc};
