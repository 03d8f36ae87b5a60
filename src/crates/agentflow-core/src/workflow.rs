//! Immutable workflow graph: executor bindings and edge groups
//!
//! A [`Workflow`] is built once by the
//! [`WorkflowBuilder`](crate::builder::WorkflowBuilder) and never mutated
//! afterwards; it lives for the process lifetime and is shared by every run
//! over it. Executors are held by id, never by pointer: a binding pairs the
//! id with a factory that yields fresh instances, plus the input/output
//! type tags that drive handler dispatch and build-time validation.
//!
//! Edges come in four groups, each executed by a dedicated runner at
//! commit time: direct (with an optional predicate), fan-out, fan-in and
//! switch. Declaration order is preserved - it is the deterministic
//! tie-break for routing and for fan-in aggregate ordering.

use crate::envelope::{tags, EdgeId, ExecutorId, TypeTag, TypedPayload};
use crate::executor::Executor;
use crate::scopes::{ScopeKind, ValueKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Pure predicate over a message payload
pub type Predicate = Arc<dyn Fn(&TypedPayload) -> bool + Send + Sync>;

/// Factory yielding a fresh executor instance
pub type ExecutorFactory = Arc<dyn Fn() -> Box<dyn Executor> + Send + Sync>;

/// Registration of one executor: identity, factory and declared types
#[derive(Clone)]
pub struct ExecutorBinding {
    /// Unique executor id within the workflow
    pub id: ExecutorId,

    /// Executor type tag; identity is `(kind, id)` and two executors with
    /// the same pair are interchangeable across checkpoint/restore
    pub kind: String,

    /// Factory producing fresh instances
    pub factory: ExecutorFactory,

    /// Accepted input type tags, most specific first; this order is the
    /// total order the router resolves dispatch with
    pub inputs: Vec<TypeTag>,

    /// Output type tags the executor may emit
    pub outputs: Vec<TypeTag>,
}

impl ExecutorBinding {
    /// Create a binding with no declared types
    pub fn new(
        id: impl Into<ExecutorId>,
        kind: impl Into<String>,
        factory: ExecutorFactory,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            factory,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Declare an accepted input type (appended, so call order is the
    /// specificity order)
    pub fn with_input(mut self, type_tag: impl Into<TypeTag>) -> Self {
        self.inputs.push(type_tag.into());
        self
    }

    /// Declare an emitted output type
    pub fn with_output(mut self, type_tag: impl Into<TypeTag>) -> Self {
        self.outputs.push(type_tag.into());
        self
    }

    /// Resolve the handler tag for an incoming payload type, if any
    ///
    /// The most specific match wins: the first declared input equal to the
    /// payload tag, falling back to a declared `*` catch-all.
    pub fn resolve_input(&self, type_tag: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|t| t.as_str() == type_tag)
            .or_else(|| self.inputs.iter().find(|t| t.as_str() == tags::ANY))
            .map(String::as_str)
    }

    /// Whether this executor accepts a payload type
    pub fn accepts(&self, type_tag: &str) -> bool {
        self.resolve_input(type_tag).is_some()
    }
}

impl std::fmt::Debug for ExecutorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorBinding")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("factory", &"<function>")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// One branch of a switch edge group
#[derive(Clone)]
pub struct SwitchCase {
    /// Predicate evaluated against the payload
    pub predicate: Predicate,
    /// Target when the predicate matches
    pub target: ExecutorId,
}

impl std::fmt::Debug for SwitchCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchCase")
            .field("predicate", &"<function>")
            .field("target", &self.target)
            .finish()
    }
}

/// Edge group variants, each with its own delivery discipline
#[derive(Clone)]
pub enum EdgeKind {
    /// Forward one payload to one target, with an optional predicate
    Direct {
        from: ExecutorId,
        to: ExecutorId,
        condition: Option<Predicate>,
    },

    /// Clone every emitted message to all targets, in declaration order
    FanOut {
        from: ExecutorId,
        targets: Vec<ExecutorId>,
    },

    /// Buffer one message per source per delivery cohort; invoke the target
    /// once with the ordered aggregate when the cohort completes
    FanIn {
        sources: Vec<ExecutorId>,
        to: ExecutorId,
    },

    /// Evaluate predicates in declaration order; first match wins
    Switch {
        from: ExecutorId,
        cases: Vec<SwitchCase>,
        default: Option<ExecutorId>,
    },
}

impl std::fmt::Debug for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Direct { from, to, condition } => f
                .debug_struct("Direct")
                .field("from", from)
                .field("to", to)
                .field("condition", &condition.as_ref().map(|_| "<function>"))
                .finish(),
            EdgeKind::FanOut { from, targets } => f
                .debug_struct("FanOut")
                .field("from", from)
                .field("targets", targets)
                .finish(),
            EdgeKind::FanIn { sources, to } => f
                .debug_struct("FanIn")
                .field("sources", sources)
                .field("to", to)
                .finish(),
            EdgeKind::Switch { from, cases, default } => f
                .debug_struct("Switch")
                .field("from", from)
                .field("cases", cases)
                .field("default", default)
                .finish(),
        }
    }
}

/// An edge group with its stable id
#[derive(Debug, Clone)]
pub struct EdgeGroup {
    /// Stable id used in traces, diagnostics and checkpointed buffers
    pub id: EdgeId,
    /// The routing discipline
    pub kind: EdgeKind,
}

impl EdgeGroup {
    /// Sources this group routes messages from
    pub fn sources(&self) -> Vec<&ExecutorId> {
        match &self.kind {
            EdgeKind::Direct { from, .. }
            | EdgeKind::FanOut { from, .. }
            | EdgeKind::Switch { from, .. } => vec![from],
            EdgeKind::FanIn { sources, .. } => sources.iter().collect(),
        }
    }

    /// Targets this group can deliver to
    pub fn targets(&self) -> Vec<&ExecutorId> {
        match &self.kind {
            EdgeKind::Direct { to, .. } | EdgeKind::FanIn { to, .. } => vec![to],
            EdgeKind::FanOut { targets, .. } => targets.iter().collect(),
            EdgeKind::Switch { cases, default, .. } => {
                let mut out: Vec<&ExecutorId> = cases.iter().map(|c| &c.target).collect();
                if let Some(d) = default {
                    out.push(d);
                }
                out
            }
        }
    }

    /// Whether messages emitted by `executor` route through this group
    pub fn routes_from(&self, executor: &str) -> bool {
        self.sources().iter().any(|s| s.as_str() == executor)
    }
}

/// Immutable workflow: executors by id plus ordered edge groups
#[derive(Debug, Clone)]
pub struct Workflow {
    /// Workflow id
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Entry point; external input enters here
    pub start_executor_id: ExecutorId,

    pub(crate) executors: HashMap<ExecutorId, ExecutorBinding>,
    pub(crate) order: Vec<ExecutorId>,
    pub(crate) edges: Vec<EdgeGroup>,
    pub(crate) scope_declarations: Vec<(ScopeKind, String, ValueKind)>,
    pub(crate) scope_defaults: Vec<(ScopeKind, String, serde_json::Value)>,
    pub(crate) seed_topic_from_input: bool,
}

impl Workflow {
    /// Binding for an executor id
    pub fn binding(&self, id: &str) -> Option<&ExecutorBinding> {
        self.executors.get(id)
    }

    /// Executor ids in registration order
    pub fn executor_order(&self) -> &[ExecutorId] {
        &self.order
    }

    /// Registration index of an executor (deterministic commit order key)
    pub fn registration_index(&self, id: &str) -> usize {
        self.order
            .iter()
            .position(|e| e == id)
            .unwrap_or(usize::MAX)
    }

    /// All edge groups, in declaration order
    pub fn edges(&self) -> &[EdgeGroup] {
        &self.edges
    }

    /// Edge groups routing messages emitted by `executor`
    pub fn edges_from<'a>(&'a self, executor: &'a str) -> impl Iterator<Item = &'a EdgeGroup> + 'a {
        self.edges.iter().filter(move |g| g.routes_from(executor))
    }

    /// Whether an executor has any outgoing edge group
    ///
    /// Untargeted messages from an executor without outgoing edges are the
    /// run's output surface.
    pub fn has_outgoing(&self, executor: &str) -> bool {
        self.edges_from(executor).next().is_some()
    }

    /// Declared scope keys to apply when a run starts
    pub fn scope_declarations(&self) -> &[(ScopeKind, String, ValueKind)] {
        &self.scope_declarations
    }

    /// Default scope values applied before the initial input is seeded
    pub fn scope_defaults(&self) -> &[(ScopeKind, String, serde_json::Value)] {
        &self.scope_defaults
    }

    /// Whether an object-shaped initial payload seeds the topic scope
    pub fn seeds_topic_from_input(&self) -> bool {
        self.seed_topic_from_input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(id: &str) -> ExecutorBinding {
        ExecutorBinding::new(id, "test", Arc::new(|| unreachable!("not instantiated")))
    }

    #[test]
    fn test_resolve_input_prefers_exact_match() {
        let b = binding("a").with_input("chat.message").with_input(tags::ANY);
        assert_eq!(b.resolve_input("chat.message"), Some("chat.message"));
        assert_eq!(b.resolve_input("flow.token"), Some(tags::ANY));
    }

    #[test]
    fn test_resolve_input_without_catch_all() {
        let b = binding("a").with_input("chat.message");
        assert!(b.resolve_input("flow.token").is_none());
        assert!(!b.accepts("flow.token"));
    }

    #[test]
    fn test_edge_group_endpoints() {
        let group = EdgeGroup {
            id: "fan_in-0".to_string(),
            kind: EdgeKind::FanIn {
                sources: vec!["x".to_string(), "y".to_string()],
                to: "j".to_string(),
            },
        };
        assert!(group.routes_from("x"));
        assert!(group.routes_from("y"));
        assert!(!group.routes_from("j"));
        assert_eq!(group.targets(), vec!["j"]);
    }
}
