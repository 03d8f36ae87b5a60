//! Workflow construction and build-time validation
//!
//! [`WorkflowBuilder`] produces an immutable [`Workflow`] from a sequence
//! of declarative operations: register executors, set the start executor,
//! and wire edges (direct, fan-out, fan-in, switch). `build()` validates
//! the whole graph and reports **every** violation as a structured
//! [`BuildError`] carrying the executor/edge identifiers involved - no run
//! begins on a graph that fails validation.
//!
//! # Example
//!
//! ```rust,ignore
//! use agentflow_core::builder::WorkflowBuilder;
//!
//! let workflow = WorkflowBuilder::new("pipeline")
//!     .with_name("Example pipeline")
//!     .add_executor(double_binding)   // emits "i64"
//!     .add_executor(stringify_binding) // accepts "i64", emits "text"
//!     .with_start("double")
//!     .add_edge("double", "stringify")
//!     .build()?;
//! ```

use crate::envelope::{tags, ExecutorId};
use crate::error::{BuildError, Result, WorkflowError};
use crate::scopes::{ScopeKind, ValueKind};
use crate::workflow::{
    EdgeGroup, EdgeKind, ExecutorBinding, Predicate, SwitchCase, Workflow,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Builder for immutable [`Workflow`] graphs
pub struct WorkflowBuilder {
    id: String,
    name: Option<String>,
    start: Option<ExecutorId>,
    bindings: Vec<ExecutorBinding>,
    edges: Vec<EdgeKind>,
    scope_declarations: Vec<(ScopeKind, String, ValueKind)>,
    scope_defaults: Vec<(ScopeKind, String, serde_json::Value)>,
    seed_topic_from_input: bool,
}

impl WorkflowBuilder {
    /// Create a builder for a workflow id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            start: None,
            bindings: Vec::new(),
            edges: Vec::new(),
            scope_declarations: Vec::new(),
            scope_defaults: Vec::new(),
            seed_topic_from_input: false,
        }
    }

    /// Set the human-readable workflow name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the entry point; required before `build()`
    pub fn with_start(mut self, executor_id: impl Into<ExecutorId>) -> Self {
        self.start = Some(executor_id.into());
        self
    }

    /// Register an executor binding
    ///
    /// Registration order is preserved; it is the deterministic commit
    /// order for scope writes.
    pub fn add_executor(mut self, binding: ExecutorBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Add a direct edge
    pub fn add_edge(mut self, from: impl Into<ExecutorId>, to: impl Into<ExecutorId>) -> Self {
        self.edges.push(EdgeKind::Direct {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Add a direct edge guarded by a pure predicate over the payload
    pub fn add_edge_when(
        mut self,
        from: impl Into<ExecutorId>,
        to: impl Into<ExecutorId>,
        condition: Predicate,
    ) -> Self {
        self.edges.push(EdgeKind::Direct {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        });
        self
    }

    /// Add a fan-out edge: every emitted message is cloned to all targets
    /// in listed order
    pub fn add_fan_out(
        mut self,
        from: impl Into<ExecutorId>,
        targets: Vec<ExecutorId>,
    ) -> Self {
        self.edges.push(EdgeKind::FanOut {
            from: from.into(),
            targets,
        });
        self
    }

    /// Add a fan-in edge: one message per source per delivery cohort, then
    /// the target is invoked once with the ordered aggregate
    pub fn add_fan_in(mut self, sources: Vec<ExecutorId>, to: impl Into<ExecutorId>) -> Self {
        self.edges.push(EdgeKind::FanIn {
            sources,
            to: to.into(),
        });
        self
    }

    /// Add a switch edge: predicates evaluated in declaration order, first
    /// match wins, optional default
    pub fn add_switch(
        mut self,
        from: impl Into<ExecutorId>,
        cases: Vec<(Predicate, ExecutorId)>,
        default: Option<ExecutorId>,
    ) -> Self {
        self.edges.push(EdgeKind::Switch {
            from: from.into(),
            cases: cases
                .into_iter()
                .map(|(predicate, target)| SwitchCase { predicate, target })
                .collect(),
            default,
        });
        self
    }

    /// Declare the expected value kind for a scope key
    pub fn declare_scope_key(
        mut self,
        scope: ScopeKind,
        key: impl Into<String>,
        kind: ValueKind,
    ) -> Self {
        self.scope_declarations.push((scope, key.into(), kind));
        self
    }

    /// Provide a default value for a scope key, applied at run start
    /// before the initial input is seeded
    pub fn default_scope_value(
        mut self,
        scope: ScopeKind,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.scope_defaults.push((scope, key.into(), value));
        self
    }

    /// Seed the topic scope from an object-shaped initial payload
    ///
    /// Used by the declarative compiler so workflow inputs become topic
    /// variables before the first super-step.
    pub fn seed_topic_from_input(mut self) -> Self {
        self.seed_topic_from_input = true;
        self
    }

    /// Validate and produce the immutable workflow
    pub fn build(self) -> Result<Workflow> {
        let mut errors = Vec::new();

        // Duplicate executor ids.
        let mut seen = HashSet::new();
        for binding in &self.bindings {
            if !seen.insert(binding.id.clone()) {
                errors.push(BuildError::DuplicateExecutor(binding.id.clone()));
            }
        }

        let executors: HashMap<ExecutorId, ExecutorBinding> = self
            .bindings
            .iter()
            .map(|b| (b.id.clone(), b.clone()))
            .collect();
        let order: Vec<ExecutorId> = self.bindings.iter().map(|b| b.id.clone()).collect();

        // Start executor.
        match &self.start {
            None => errors.push(BuildError::MissingStart),
            Some(start) if !executors.contains_key(start) => {
                errors.push(BuildError::UnknownStart(start.clone()))
            }
            Some(_) => {}
        }

        // Assemble edge groups with stable ids.
        let groups: Vec<EdgeGroup> = self
            .edges
            .iter()
            .enumerate()
            .map(|(index, kind)| EdgeGroup {
                id: format!("{}-{}", edge_kind_name(kind), index),
                kind: kind.clone(),
            })
            .collect();

        // Edge endpoints must be registered; fan edges must be non-empty.
        for group in &groups {
            let endpoint_count = group.sources().len() + group.targets().len();
            match &group.kind {
                EdgeKind::FanOut { targets, .. } if targets.is_empty() => {
                    errors.push(BuildError::EmptyEdge(group.id.clone()));
                }
                EdgeKind::FanIn { sources, .. } if sources.is_empty() => {
                    errors.push(BuildError::EmptyEdge(group.id.clone()));
                }
                _ if endpoint_count < 2 => {
                    errors.push(BuildError::EmptyEdge(group.id.clone()));
                }
                _ => {}
            }
            for endpoint in group.sources().into_iter().chain(group.targets()) {
                if !executors.contains_key(endpoint) {
                    errors.push(BuildError::UnknownEndpoint {
                        edge: group.id.clone(),
                        executor: endpoint.clone(),
                    });
                }
            }
        }

        // Connectivity from the start executor.
        if let Some(start) = self.start.as_ref().filter(|s| executors.contains_key(*s)) {
            let mut reachable: HashSet<&str> = HashSet::new();
            let mut queue: VecDeque<&str> = VecDeque::new();
            reachable.insert(start.as_str());
            queue.push_back(start.as_str());
            while let Some(current) = queue.pop_front() {
                for group in groups.iter().filter(|g| g.routes_from(current)) {
                    for target in group.targets() {
                        if reachable.insert(target.as_str()) {
                            queue.push_back(target.as_str());
                        }
                    }
                }
            }
            for id in &order {
                if !reachable.contains(id.as_str()) {
                    errors.push(BuildError::Unreachable(id.clone()));
                }
            }
        }

        // Declared-type compatibility, both directions.
        self.check_type_compatibility(&executors, &groups, &mut errors);

        if !errors.is_empty() {
            return Err(WorkflowError::Build(errors));
        }

        Ok(Workflow {
            id: self.id.clone(),
            name: self.name.unwrap_or_else(|| self.id.clone()),
            start_executor_id: self.start.expect("validated above"),
            executors,
            order,
            edges: groups,
            scope_declarations: self.scope_declarations,
            scope_defaults: self.scope_defaults,
            seed_topic_from_input: self.seed_topic_from_input,
        })
    }

    fn check_type_compatibility(
        &self,
        executors: &HashMap<ExecutorId, ExecutorBinding>,
        groups: &[EdgeGroup],
        errors: &mut Vec<BuildError>,
    ) {
        // Forward: every edge must carry at least one type its target accepts.
        for group in groups {
            match &group.kind {
                EdgeKind::FanIn { to, .. } => {
                    if let Some(target) = executors.get(to) {
                        if !target.accepts(tags::FAN_IN) {
                            errors.push(BuildError::IncompatibleEdge {
                                edge: group.id.clone(),
                                from: group
                                    .sources()
                                    .first()
                                    .map(|s| s.to_string())
                                    .unwrap_or_default(),
                                to: to.clone(),
                            });
                        }
                    }
                }
                _ => {
                    for source_id in group.sources() {
                        let Some(source) = executors.get(source_id) else {
                            continue;
                        };
                        if source.outputs.is_empty() {
                            continue;
                        }
                        for target_id in group.targets() {
                            let Some(target) = executors.get(target_id) else {
                                continue;
                            };
                            let compatible =
                                source.outputs.iter().any(|tag| target.accepts(tag));
                            if !compatible {
                                errors.push(BuildError::IncompatibleEdge {
                                    edge: group.id.clone(),
                                    from: source_id.clone(),
                                    to: target_id.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        // Reverse: every declared input must be fed by some incoming edge.
        // The catch-all and the scheduler-injected external response are
        // exempt (the latter is never routed by edges).
        for binding in &self.bindings {
            if Some(&binding.id) == self.start.as_ref() {
                continue;
            }
            for input in &binding.inputs {
                if input == tags::ANY || input == tags::EXTERNAL_RESPONSE {
                    continue;
                }
                let fed = groups.iter().any(|group| {
                    if !group.targets().iter().any(|t| *t == &binding.id) {
                        return false;
                    }
                    match &group.kind {
                        EdgeKind::FanIn { .. } => input == tags::FAN_IN,
                        _ => group.sources().iter().any(|source_id| {
                            executors
                                .get(*source_id)
                                .map(|source| {
                                    source.outputs.is_empty()
                                        || source.outputs.iter().any(|t| t == input)
                                })
                                .unwrap_or(false)
                        }),
                    }
                });
                if !fed {
                    errors.push(BuildError::UnfedInput {
                        executor: binding.id.clone(),
                        type_tag: input.clone(),
                    });
                }
            }
        }
    }
}

fn edge_kind_name(kind: &EdgeKind) -> &'static str {
    match kind {
        EdgeKind::Direct { .. } => "direct",
        EdgeKind::FanOut { .. } => "fan_out",
        EdgeKind::FanIn { .. } => "fan_in",
        EdgeKind::Switch { .. } => "switch",
    }
}
