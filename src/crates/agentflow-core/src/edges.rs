//! Edge runners: direct, fan-out, fan-in and switch delivery disciplines
//!
//! Every message an executor emits is routed during the commit phase by
//! the runner for each edge group whose source matches. Runners never
//! invoke handlers; they produce [`Envelope`]s for the next super-step's
//! frontier plus a [`DeliveryObservation`] per attempted delivery that the
//! scheduler writes to the trace.
//!
//! The fan-in runner is the only stateful one: it buffers one message per
//! declared source per delivery cohort and releases the ordered aggregate
//! when the cohort completes. Buffers are part of the checkpoint payload
//! and survive restore; cohorts older than the configured timeout (in
//! super-steps) are evicted.

use crate::envelope::{tags, DeliveryId, EdgeId, Envelope, ExecutorId, TypeTag, TypedPayload};
use crate::executor::EmittedMessage;
use crate::workflow::{EdgeKind, Predicate, SwitchCase, Workflow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Outcome classification of one attempted delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Deposited into the target's next-step inbox
    Delivered,
    /// A direct-edge or switch predicate rejected the payload
    DroppedConditionFalse,
    /// The target declares no handler for the payload type
    DroppedTypeMismatch,
    /// A targeted send named an unknown executor
    DroppedTargetMismatch,
    /// Held in a fan-in cohort buffer awaiting siblings
    Buffered,
    /// The handler producing this envelope raised an error
    Exception,
}

impl DeliveryStatus {
    /// Status name as written to trace spans
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::DroppedConditionFalse => "dropped_condition_false",
            DeliveryStatus::DroppedTypeMismatch => "dropped_type_mismatch",
            DeliveryStatus::DroppedTargetMismatch => "dropped_target_mismatch",
            DeliveryStatus::Buffered => "buffered",
            DeliveryStatus::Exception => "exception",
        }
    }
}

/// Structured record of one delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryObservation {
    /// Edge group involved; `None` for targeted sends and outputs
    pub edge_id: Option<EdgeId>,
    /// Emitting executor
    pub source: ExecutorId,
    /// Intended target, when one was resolved
    pub target: Option<ExecutorId>,
    /// Payload type tag
    pub type_tag: TypeTag,
    /// What happened
    pub status: DeliveryStatus,
}

/// Result of routing one emitted message
#[derive(Debug, Default)]
pub struct RouteOutcome {
    /// Envelopes for the next super-step's frontier
    pub deliveries: Vec<Envelope>,
    /// One observation per attempted delivery
    pub observations: Vec<DeliveryObservation>,
    /// Set when the message is the run's output surface (untargeted, and
    /// the source has no outgoing edge groups)
    pub output: Option<TypedPayload>,
}

/// One partially filled fan-in cohort
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Cohort {
    /// Super-step the first sibling arrived in, for timeout eviction
    pub created_step: u64,
    /// Arrived payloads keyed by source; first arrival per source wins
    pub arrived: BTreeMap<ExecutorId, TypedPayload>,
}

/// Stateful runner for one fan-in edge group
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FanInEdgeRunner {
    cohorts: BTreeMap<DeliveryId, Cohort>,
}

impl FanInEdgeRunner {
    /// Offer a sibling message to its cohort
    ///
    /// Returns the ordered aggregate (source declaration order) when the
    /// cohort completes, consuming the buffer entry.
    pub fn offer(
        &mut self,
        sources: &[ExecutorId],
        source: &str,
        delivery_id: &str,
        payload: TypedPayload,
        step: u64,
    ) -> Option<Vec<TypedPayload>> {
        let cohort = self
            .cohorts
            .entry(delivery_id.to_string())
            .or_insert_with(|| Cohort {
                created_step: step,
                arrived: BTreeMap::new(),
            });
        cohort
            .arrived
            .entry(source.to_string())
            .or_insert(payload);

        if cohort.arrived.len() == sources.len() {
            let cohort = self.cohorts.remove(delivery_id)?;
            Some(
                sources
                    .iter()
                    .filter_map(|s| cohort.arrived.get(s).cloned())
                    .collect(),
            )
        } else {
            None
        }
    }

    /// Evict cohorts older than `timeout` super-steps
    pub fn evict_expired(&mut self, step: u64, timeout: u64) -> Vec<DeliveryId> {
        let expired: Vec<DeliveryId> = self
            .cohorts
            .iter()
            .filter(|(_, c)| step.saturating_sub(c.created_step) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.cohorts.remove(id);
        }
        expired
    }

    /// Number of open cohorts
    pub fn open_cohorts(&self) -> usize {
        self.cohorts.len()
    }
}

/// Routes emitted messages through edge groups and maintains fan-in state
#[derive(Debug, Default)]
pub struct EdgeRouter {
    fan_in: HashMap<EdgeId, FanInEdgeRunner>,
    cohort_timeout_steps: Option<u64>,
}

impl EdgeRouter {
    /// Router with no cohort timeout
    pub fn new(cohort_timeout_steps: Option<u64>) -> Self {
        Self {
            fan_in: HashMap::new(),
            cohort_timeout_steps,
        }
    }

    /// Route one emitted message, producing deliveries and observations
    pub fn route(
        &mut self,
        workflow: &Workflow,
        source: &str,
        message: EmittedMessage,
        delivery_id: &DeliveryId,
        trace_span: &str,
        step: u64,
    ) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        // Targeted sends bypass edge groups entirely.
        if let Some(target) = message.target {
            deliver_direct(
                workflow,
                None,
                source,
                &target,
                message.payload,
                delivery_id,
                trace_span,
                &mut outcome,
            );
            return outcome;
        }

        let groups: Vec<_> = workflow
            .edges_from(source)
            .map(|g| (g.id.clone(), g.kind.clone()))
            .collect();
        if groups.is_empty() {
            // Output surface: nothing to route to.
            outcome.output = Some(message.payload);
            return outcome;
        }

        for (edge_id, kind) in groups {
            match kind {
                EdgeKind::Direct {
                    to, condition, ..
                } => DirectEdgeRunner::run(
                    workflow,
                    &edge_id,
                    source,
                    &to,
                    condition.as_ref(),
                    &message.payload,
                    delivery_id,
                    trace_span,
                    &mut outcome,
                ),
                EdgeKind::FanOut { targets, .. } => FanOutEdgeRunner::run(
                    workflow,
                    &edge_id,
                    source,
                    &targets,
                    &message.payload,
                    delivery_id,
                    trace_span,
                    &mut outcome,
                ),
                EdgeKind::FanIn { sources, to } => {
                    let runner = self.fan_in.entry(edge_id.clone()).or_default();
                    match runner.offer(&sources, source, delivery_id, message.payload.clone(), step)
                    {
                        Some(parts) => {
                            let aggregate = TypedPayload::new(
                                tags::FAN_IN,
                                Value::Array(parts.into_iter().map(|p| p.value).collect()),
                            );
                            deliver_from_edge(
                                workflow,
                                &edge_id,
                                &edge_id,
                                &to,
                                aggregate,
                                delivery_id,
                                trace_span,
                                &mut outcome,
                            );
                        }
                        None => outcome.observations.push(DeliveryObservation {
                            edge_id: Some(edge_id.clone()),
                            source: source.to_string(),
                            target: Some(to.clone()),
                            type_tag: message.payload.type_tag.clone(),
                            status: DeliveryStatus::Buffered,
                        }),
                    }
                }
                EdgeKind::Switch {
                    cases, default, ..
                } => SwitchEdgeRunner::run(
                    workflow,
                    &edge_id,
                    source,
                    &cases,
                    default.as_deref(),
                    &message.payload,
                    delivery_id,
                    trace_span,
                    &mut outcome,
                ),
            }
        }

        outcome
    }

    /// Evict expired cohorts across all fan-in runners
    pub fn evict_expired(&mut self, step: u64) -> Vec<(EdgeId, DeliveryId)> {
        let Some(timeout) = self.cohort_timeout_steps else {
            return Vec::new();
        };
        let mut evicted = Vec::new();
        for (edge_id, runner) in &mut self.fan_in {
            for delivery_id in runner.evict_expired(step, timeout) {
                evicted.push((edge_id.clone(), delivery_id));
            }
        }
        evicted.sort();
        evicted
    }

    /// Serialize fan-in buffers for checkpointing
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.fan_in
            .iter()
            .filter(|(_, runner)| runner.open_cohorts() > 0)
            .map(|(edge_id, runner)| {
                (
                    edge_id.clone(),
                    serde_json::to_value(runner).unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    /// Rehydrate fan-in buffers from a checkpoint
    pub fn restore(&mut self, snapshot: &HashMap<String, Value>) {
        self.fan_in.clear();
        for (edge_id, value) in snapshot {
            if let Ok(runner) = serde_json::from_value::<FanInEdgeRunner>(value.clone()) {
                self.fan_in.insert(edge_id.clone(), runner);
            }
        }
    }
}

/// Runner for direct edges
pub struct DirectEdgeRunner;

impl DirectEdgeRunner {
    #[allow(clippy::too_many_arguments)]
    fn run(
        workflow: &Workflow,
        edge_id: &str,
        source: &str,
        to: &str,
        condition: Option<&Predicate>,
        payload: &TypedPayload,
        delivery_id: &DeliveryId,
        trace_span: &str,
        outcome: &mut RouteOutcome,
    ) {
        if let Some(condition) = condition {
            if !condition(payload) {
                outcome.observations.push(DeliveryObservation {
                    edge_id: Some(edge_id.to_string()),
                    source: source.to_string(),
                    target: Some(to.to_string()),
                    type_tag: payload.type_tag.clone(),
                    status: DeliveryStatus::DroppedConditionFalse,
                });
                return;
            }
        }
        deliver_from_edge(
            workflow,
            edge_id,
            source,
            to,
            payload.clone(),
            delivery_id,
            trace_span,
            outcome,
        );
    }
}

/// Runner for fan-out edges
pub struct FanOutEdgeRunner;

impl FanOutEdgeRunner {
    #[allow(clippy::too_many_arguments)]
    fn run(
        workflow: &Workflow,
        edge_id: &str,
        source: &str,
        targets: &[ExecutorId],
        payload: &TypedPayload,
        delivery_id: &DeliveryId,
        trace_span: &str,
        outcome: &mut RouteOutcome,
    ) {
        // One delivery per listed target, same cohort tag throughout so a
        // downstream fan-in can correlate the siblings.
        for target in targets {
            deliver_from_edge(
                workflow,
                edge_id,
                source,
                target,
                payload.clone(),
                delivery_id,
                trace_span,
                outcome,
            );
        }
    }
}

/// Runner for switch edges
pub struct SwitchEdgeRunner;

impl SwitchEdgeRunner {
    #[allow(clippy::too_many_arguments)]
    fn run(
        workflow: &Workflow,
        edge_id: &str,
        source: &str,
        cases: &[SwitchCase],
        default: Option<&str>,
        payload: &TypedPayload,
        delivery_id: &DeliveryId,
        trace_span: &str,
        outcome: &mut RouteOutcome,
    ) {
        for case in cases {
            if (case.predicate)(payload) {
                deliver_from_edge(
                    workflow,
                    edge_id,
                    source,
                    &case.target,
                    payload.clone(),
                    delivery_id,
                    trace_span,
                    outcome,
                );
                return;
            }
        }
        match default {
            Some(target) => deliver_from_edge(
                workflow,
                edge_id,
                source,
                target,
                payload.clone(),
                delivery_id,
                trace_span,
                outcome,
            ),
            None => outcome.observations.push(DeliveryObservation {
                edge_id: Some(edge_id.to_string()),
                source: source.to_string(),
                target: None,
                type_tag: payload.type_tag.clone(),
                status: DeliveryStatus::DroppedConditionFalse,
            }),
        }
    }
}

/// Deliver through an edge group, checking target handler types
#[allow(clippy::too_many_arguments)]
fn deliver_from_edge(
    workflow: &Workflow,
    edge_id: &str,
    source: &str,
    target: &str,
    payload: TypedPayload,
    delivery_id: &DeliveryId,
    trace_span: &str,
    outcome: &mut RouteOutcome,
) {
    let status = match workflow.binding(target) {
        Some(binding) if binding.accepts(&payload.type_tag) => DeliveryStatus::Delivered,
        Some(_) => DeliveryStatus::DroppedTypeMismatch,
        None => DeliveryStatus::DroppedTargetMismatch,
    };
    if status == DeliveryStatus::Delivered {
        outcome.deliveries.push(
            Envelope {
                payload: payload.clone(),
                source_id: source.to_string(),
                target_id: Some(target.to_string()),
                delivery_id: delivery_id.clone(),
                trace_span: trace_span.to_string(),
                attempt: 0,
            },
        );
    }
    outcome.observations.push(DeliveryObservation {
        edge_id: Some(edge_id.to_string()),
        source: source.to_string(),
        target: Some(target.to_string()),
        type_tag: payload.type_tag,
        status,
    });
}

/// Deliver a targeted send, which bypasses edge groups
#[allow(clippy::too_many_arguments)]
fn deliver_direct(
    workflow: &Workflow,
    edge_id: Option<&str>,
    source: &str,
    target: &str,
    payload: TypedPayload,
    delivery_id: &DeliveryId,
    trace_span: &str,
    outcome: &mut RouteOutcome,
) {
    let status = match workflow.binding(target) {
        Some(binding) if binding.accepts(&payload.type_tag) => DeliveryStatus::Delivered,
        Some(_) => DeliveryStatus::DroppedTypeMismatch,
        None => DeliveryStatus::DroppedTargetMismatch,
    };
    if status == DeliveryStatus::Delivered {
        outcome.deliveries.push(
            Envelope {
                payload: payload.clone(),
                source_id: source.to_string(),
                target_id: Some(target.to_string()),
                delivery_id: delivery_id.clone(),
                trace_span: trace_span.to_string(),
                attempt: 0,
            },
        );
    }
    outcome.observations.push(DeliveryObservation {
        edge_id: edge_id.map(|e| e.to_string()),
        source: source.to_string(),
        target: Some(target.to_string()),
        type_tag: payload.type_tag,
        status,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fan_in_completes_only_with_all_sources() {
        let sources = vec!["x".to_string(), "y".to_string()];
        let mut runner = FanInEdgeRunner::default();

        let first = runner.offer(
            &sources,
            "x",
            "d-1",
            TypedPayload::new("text", json!("x:q")),
            1,
        );
        assert!(first.is_none());
        assert_eq!(runner.open_cohorts(), 1);

        let second = runner.offer(
            &sources,
            "y",
            "d-1",
            TypedPayload::new("text", json!("y:q")),
            1,
        );
        let parts = second.unwrap();
        assert_eq!(parts.len(), 2);
        // Ordered by source declaration order, not arrival order.
        assert_eq!(parts[0].value, json!("x:q"));
        assert_eq!(parts[1].value, json!("y:q"));
        assert_eq!(runner.open_cohorts(), 0);
    }

    #[test]
    fn test_fan_in_keeps_first_message_per_source() {
        let sources = vec!["x".to_string(), "y".to_string()];
        let mut runner = FanInEdgeRunner::default();
        runner.offer(&sources, "x", "d-1", TypedPayload::new("text", json!("first")), 1);
        runner.offer(&sources, "x", "d-1", TypedPayload::new("text", json!("second")), 1);
        let parts = runner
            .offer(&sources, "y", "d-1", TypedPayload::new("text", json!("y")), 2)
            .unwrap();
        assert_eq!(parts[0].value, json!("first"));
    }

    #[test]
    fn test_fan_in_separates_cohorts_by_delivery() {
        let sources = vec!["x".to_string(), "y".to_string()];
        let mut runner = FanInEdgeRunner::default();
        runner.offer(&sources, "x", "d-1", TypedPayload::new("text", json!(1)), 1);
        runner.offer(&sources, "y", "d-2", TypedPayload::new("text", json!(2)), 1);
        assert_eq!(runner.open_cohorts(), 2);
    }

    #[test]
    fn test_fan_in_eviction() {
        let sources = vec!["x".to_string(), "y".to_string()];
        let mut runner = FanInEdgeRunner::default();
        runner.offer(&sources, "x", "d-1", TypedPayload::new("text", json!(1)), 1);

        assert!(runner.evict_expired(2, 5).is_empty());
        let evicted = runner.evict_expired(10, 5);
        assert_eq!(evicted, vec!["d-1".to_string()]);
        assert_eq!(runner.open_cohorts(), 0);
    }

    #[test]
    fn test_fan_in_buffer_round_trips() {
        let sources = vec!["x".to_string(), "y".to_string()];
        let mut runner = FanInEdgeRunner::default();
        runner.offer(&sources, "x", "d-1", TypedPayload::new("text", json!(1)), 3);

        let value = serde_json::to_value(&runner).unwrap();
        let mut restored: FanInEdgeRunner = serde_json::from_value(value).unwrap();
        let parts = restored
            .offer(&sources, "y", "d-1", TypedPayload::new("text", json!(2)), 4)
            .unwrap();
        assert_eq!(parts.len(), 2);
    }
}
