//! # agentflow-core - Declarative Multi-Agent Workflow Engine
//!
//! A graph-executed, message-passing runtime that orchestrates AI agents
//! and ordinary compute units ("executors") through typed edges, with
//! deterministic replay, checkpointing and human-in-the-loop suspension.
//!
//! ## Overview
//!
//! `agentflow-core` provides:
//!
//! - **Typed message routing** - envelopes carry a type tag; dispatch and
//!   edge compatibility are validated at build time
//! - **Super-step scheduling** - turn-by-turn execution with atomic
//!   boundary commits, deterministic given identical inputs
//! - **Fan-out / fan-in / switch edges** - delivery disciplines executed
//!   by dedicated runners with cohort-correlated joins
//! - **Scoped shared state** - `topic`, `conversation` and `system`
//!   scopes with read-snapshot / commit-at-boundary semantics
//! - **Checkpoint & restore** - every runtime datum round-trips through a
//!   pluggable store ([`agentflow_checkpoint`])
//! - **Human-in-the-loop** - external-input requests suspend the run;
//!   validated responses resume it
//! - **Agent adapter** - any [`AgentProvider`] becomes an engine node
//! - **Declarative YAML** - action documents compile to the same graphs
//!   the programmatic builder produces, with a pure expression evaluator
//!
//! ## Core Concepts
//!
//! ### 1. Workflow - immutable graph
//!
//! A [`Workflow`] holds executor bindings by id plus ordered edge groups.
//! It is built once by [`WorkflowBuilder`] (or the
//! [`DeclarativeCompiler`]) and shared by every run over it.
//!
//! ### 2. Super-steps
//!
//! The scheduler drains all queued envelopes, invokes handlers (in
//! parallel across executors when configured), then commits scope writes,
//! executor state and routed messages atomically. Reads within a
//! super-step always observe the pre-step snapshot.
//!
//! ### 3. Runs and suspension
//!
//! [`start_run`] spawns the scheduler and returns a [`RunHandle`]. A
//! handler may publish an external-input request; the run then suspends
//! in `AwaitingInput` until [`RunHandle::resume_with`] supplies a
//! matching response. Mismatched responses are rejected without
//! advancing state.
//!
//! ### 4. Checkpointing
//!
//! At any super-step boundary the scheduler can capture the complete run
//! state - scopes, executor state blobs, queued inboxes, fan-in buffers
//! and pending requests - and restore it later with identical subsequent
//! behavior.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agentflow_core::{
//!     builder::WorkflowBuilder, envelope::TypedPayload, run::start_run,
//!     scheduler::RunOptions,
//! };
//! use serde_json::json;
//!
//! let workflow = WorkflowBuilder::new("pipeline")
//!     .add_executor(double)      // accepts "i64", emits "i64"
//!     .add_executor(stringify)   // accepts "i64", emits "text"
//!     .with_start("double")
//!     .add_edge("double", "stringify")
//!     .build()?;
//!
//! let mut handle = start_run(
//!     workflow,
//!     TypedPayload::new("i64", json!(5)),
//!     RunOptions::default(),
//! )?;
//! let output = handle.run_to_completion().await?;
//! ```
//!
//! ## Module Organization
//!
//! ### Core APIs
//! - [`builder`] - [`WorkflowBuilder`] and graph validation
//! - [`run`] - [`start_run`], [`restore_run`], [`RunHandle`]
//! - [`scheduler`] - super-step loop, [`RunOptions`], policies
//! - [`workflow`] - immutable graph model
//!
//! ### Messaging
//! - [`envelope`] - envelopes, payloads, type tags
//! - [`edges`] - direct / fan-out / fan-in / switch runners
//! - [`executor`] - the [`Executor`] trait and handler context
//!
//! ### State
//! - [`scopes`] - scoped shared state with boundary commits
//! - [`messages`] - chat messages, message lists, tabular records
//!
//! ### Interaction
//! - [`external`] - human-in-the-loop request/response contract
//! - [`agent`] - [`AgentProvider`] capability and executor adapter
//! - [`events`] - run lifecycle and diagnostic events
//!
//! ### Declarative
//! - [`declarative`] - YAML schema, compiler and action executors
//! - [`expr`] - the `=`-sigil expression evaluator

pub mod agent;
pub mod builder;
pub mod declarative;
pub mod edges;
pub mod envelope;
pub mod error;
pub mod events;
pub mod executor;
pub mod expr;
pub mod external;
pub mod messages;
pub mod run;
pub mod scheduler;
pub mod scopes;
pub mod workflow;

// Re-export main types
pub use agent::{
    AgentExecutor, AgentProvider, AgentUpdate, AgentUpdateStream, InvokeRequest,
    ListMessagesQuery, MessageStream,
};
pub use builder::WorkflowBuilder;
pub use declarative::{DeclarativeCompiler, WorkflowDoc};
pub use edges::{DeliveryObservation, DeliveryStatus};
pub use envelope::{tags, DeliveryId, EdgeId, Envelope, ExecutorId, TypeTag, TypedPayload};
pub use error::{BuildError, CompileError, Result, WorkflowError};
pub use events::{DiagnosticEvent, RunEvent, RunFailure};
pub use executor::{Executor, ExecutorContext};
pub use expr::{CompiledValue, Expr, ExprError};
pub use external::{ExternalInputRequest, ExternalInputResponse};
pub use messages::{ChatMessage, ContentPart, MessageRole, TableRecord};
pub use run::{restore_run, start_run, EventStream, RunHandle};
pub use scheduler::{
    CheckpointPolicy, ErrorPolicy, InboxBound, OverflowPolicy, RunOptions, RunStatus,
};
pub use scopes::{ScopeConflict, ScopeKind, ScopeState, ScopeWrite, ValueKind};
pub use workflow::{EdgeGroup, EdgeKind, ExecutorBinding, Predicate, SwitchCase, Workflow};

pub use agentflow_checkpoint::{
    CheckpointId, CheckpointStore, InMemoryCheckpointStore, RunCheckpoint, WireMarshaller,
};
