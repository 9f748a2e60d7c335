//! Gateway Executor
//!
//! Decides where a token goes when it reaches a gateway. Exclusive and
//! event-based gateways are pure functions of the flows and variables;
//! forks and joins additionally record their bookkeeping through the
//! [`GatewayStateStore`].

pub mod validate;

use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::expression::ExpressionEvaluator;
use crate::store::{GatewayStateKind, GatewayStateStore, NewForkState, NewJoinState};
use crate::types::{ForkFrame, Gateway, GatewayType, SequenceFlow, Variables};

pub use validate::{validate_definition, validate_gateway, ensure_valid, Severity, ValidationIssue};

/// Everything the gateway executor needs to decide one activation.
#[derive(Clone, Copy, Debug)]
pub struct GatewayRequest<'a> {
    pub gateway: &'a Gateway,
    /// Outgoing flows in definition order.
    pub outgoing: &'a [&'a SequenceFlow],
    pub variables: &'a Variables,
    /// Number of incoming flows, when the caller knows the graph. `None`
    /// leaves join sizing to the most recently active fork.
    pub incoming_count: Option<usize>,
    pub process_instance_id: Option<&'a str>,
    pub execution_id: Option<&'a str>,
    /// Fork frames carried by the arriving token, outermost first.
    pub frames: &'a [ForkFrame],
}

impl<'a> GatewayRequest<'a> {
    pub fn new(
        gateway: &'a Gateway,
        outgoing: &'a [&'a SequenceFlow],
        variables: &'a Variables,
    ) -> Self {
        Self {
            gateway,
            outgoing,
            variables,
            incoming_count: None,
            process_instance_id: None,
            execution_id: None,
            frames: &[],
        }
    }

    pub fn for_instance(mut self, process_instance_id: &'a str) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_execution(mut self, execution_id: &'a str) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_incoming(mut self, incoming_count: usize) -> Self {
        self.incoming_count = Some(incoming_count);
        self
    }

    pub fn with_frames(mut self, frames: &'a [ForkFrame]) -> Self {
        self.frames = frames;
        self
    }
}

/// Outcome of one gateway activation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GatewayDecision {
    pub next_element_ids: Vec<String>,
    /// For joins: the arriving token is absorbed until the remaining branches
    /// arrive. For event-based gateways: park until one candidate fires.
    pub needs_wait: bool,
    pub is_fork: bool,
    pub is_join: bool,
    pub active_branches: Option<u32>,
    /// Frame to push onto the branches spawned by this fork; each branch
    /// takes [`ForkFrame::for_branch`] with its own index.
    pub fork_frame: Option<ForkFrame>,
    /// For released joins: the frames the outgoing token carries in place of
    /// the arriving token's.
    pub continue_frames: Option<Vec<ForkFrame>>,
    pub gateway_state_id: Option<Uuid>,
}

impl GatewayDecision {
    fn single(target: &str) -> Self {
        Self {
            next_element_ids: vec![target.to_string()],
            ..Default::default()
        }
    }
}

struct JoinOutcome {
    released: bool,
    active_branches: u32,
    state_id: Option<Uuid>,
    continue_frames: Option<Vec<ForkFrame>>,
}

pub struct GatewayExecutor {
    states: Arc<dyn GatewayStateStore>,
    evaluator: ExpressionEvaluator,
}

impl GatewayExecutor {
    pub fn new(states: Arc<dyn GatewayStateStore>, evaluator: ExpressionEvaluator) -> Self {
        Self { states, evaluator }
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    pub async fn execute(&self, req: GatewayRequest<'_>) -> Result<GatewayDecision> {
        let decision = match req.gateway.gateway_type {
            GatewayType::Exclusive => self.exclusive(&req)?,
            GatewayType::Parallel => self.parallel(&req).await?,
            GatewayType::Inclusive => self.inclusive(&req).await?,
            GatewayType::EventBased => event_based(&req)?,
        };
        debug!(
            gateway = %req.gateway.id,
            kind = req.gateway.gateway_type.as_str(),
            next = ?decision.next_element_ids,
            needs_wait = decision.needs_wait,
            "gateway decided"
        );
        Ok(decision)
    }

    /// Evaluate a flow guard. A failing expression is logged and counts as false.
    fn flow_taken(&self, gateway: &Gateway, flow: &SequenceFlow, variables: &Variables) -> bool {
        let condition = match flow.condition_expression.as_deref() {
            Some(c) if flow.is_conditional() => c,
            _ => return true,
        };
        match self.evaluator.evaluate_condition(condition, variables) {
            Ok(taken) => taken,
            Err(e) => {
                warn!(
                    gateway = %gateway.id,
                    flow = %flow.id,
                    error = %e,
                    "condition evaluation failed, treating flow as not taken"
                );
                false
            }
        }
    }

    fn exclusive(&self, req: &GatewayRequest<'_>) -> Result<GatewayDecision> {
        let default = default_flow(req.gateway, req.outgoing);

        for flow in req.outgoing.iter().copied() {
            if !flow.is_conditional() || is_same(default, flow) {
                continue;
            }
            if self.flow_taken(req.gateway, flow, req.variables) {
                return Ok(GatewayDecision::single(&flow.target_ref));
            }
        }

        default
            .map(|f| GatewayDecision::single(&f.target_ref))
            .ok_or_else(|| EngineError::NoSatisfiedFlow(req.gateway.id.clone()))
    }

    async fn parallel(&self, req: &GatewayRequest<'_>) -> Result<GatewayDecision> {
        if req.outgoing.is_empty() {
            return Err(EngineError::NoOutgoingFlow(req.gateway.id.clone()));
        }

        let mut decision = GatewayDecision::default();

        if req.incoming_count.is_some_and(|n| n > 1) {
            let expected = req.incoming_count.unwrap_or(1) as u32;
            let join = self.join(req, Some(expected)).await?;
            decision.is_join = true;
            decision.continue_frames = join.continue_frames;
            decision.gateway_state_id = join.state_id;
            decision.active_branches = Some(join.active_branches);
            if !join.released {
                decision.needs_wait = true;
                return Ok(decision);
            }
        }

        let targets: Vec<String> = req.outgoing.iter().map(|f| f.target_ref.clone()).collect();
        if targets.len() > 1 {
            let frame = self.record_fork(req, &targets).await?;
            decision.is_fork = true;
            decision.active_branches = Some(targets.len() as u32);
            decision.gateway_state_id = frame.as_ref().map(|f| f.fork_state_id);
            decision.fork_frame = frame;
        }
        decision.next_element_ids = targets;
        Ok(decision)
    }

    async fn inclusive(&self, req: &GatewayRequest<'_>) -> Result<GatewayDecision> {
        let is_fork = req.outgoing.len() > 1
            || req.outgoing.first().is_some_and(|f| f.is_conditional());

        if is_fork {
            // Without conditions there is nothing to default from: every
            // unconditioned flow is taken.
            let default = if req.gateway.default_flow.is_some()
                || req.outgoing.iter().any(|f| f.is_conditional())
            {
                default_flow(req.gateway, req.outgoing)
            } else {
                None
            };
            let mut targets: Vec<String> = req
                .outgoing
                .iter()
                .copied()
                .filter(|f| !is_same(default, f))
                .filter(|f| self.flow_taken(req.gateway, f, req.variables))
                .map(|f| f.target_ref.clone())
                .collect();

            if targets.is_empty() {
                let default =
                    default.ok_or_else(|| EngineError::NoSatisfiedFlow(req.gateway.id.clone()))?;
                targets.push(default.target_ref.clone());
            }

            let frame = self.record_fork(req, &targets).await?;
            return Ok(GatewayDecision {
                active_branches: Some(targets.len() as u32),
                next_element_ids: targets,
                is_fork: true,
                gateway_state_id: frame.as_ref().map(|f| f.fork_state_id),
                fork_frame: frame,
                ..Default::default()
            });
        }

        let next = req
            .outgoing
            .first()
            .ok_or_else(|| EngineError::NoOutgoingFlow(req.gateway.id.clone()))?;

        let join = self.join(req, None).await?;
        Ok(GatewayDecision {
            next_element_ids: if join.released {
                vec![next.target_ref.clone()]
            } else {
                Vec::new()
            },
            needs_wait: !join.released,
            is_join: true,
            active_branches: Some(join.active_branches),
            continue_frames: join.continue_frames,
            gateway_state_id: join.state_id,
            ..Default::default()
        })
    }

    /// Persist a fork state and build the frame its branches carry. Without an
    /// instance id there is nothing to key the state by, so nothing is stored.
    async fn record_fork(
        &self,
        req: &GatewayRequest<'_>,
        targets: &[String],
    ) -> Result<Option<ForkFrame>> {
        let Some(pid) = req.process_instance_id else {
            return Ok(None);
        };
        let state = self
            .states
            .create_fork_state(NewForkState {
                process_instance_id: pid.to_string(),
                execution_id: req.execution_id.map(str::to_string),
                gateway_id: req.gateway.id.clone(),
                branch_targets: targets.to_vec(),
            })
            .await?;
        Ok(Some(ForkFrame {
            gateway_id: state.gateway_id,
            fork_state_id: state.id,
            branch_count: state.active_branches,
            generation: state.generation,
            branches: Vec::new(),
        }))
    }

    /// Register one arrival at a join.
    ///
    /// A parallel join (`static_expected`, the incoming flow count) waits for
    /// that many arrivals within the outermost fork the token belongs to, so
    /// branches from nested forks meet in one state. An inclusive join is
    /// sized by the token's innermost fork frame, else by the most recently
    /// active fork state of the instance, else 1.
    async fn join(
        &self,
        req: &GatewayRequest<'_>,
        static_expected: Option<u32>,
    ) -> Result<JoinOutcome> {
        let pid = req
            .process_instance_id
            .ok_or_else(|| EngineError::MissingProcessInstanceId(req.gateway.id.clone()))?;

        // A single incoming flow cannot synchronize anything.
        if req.incoming_count.is_some_and(|n| n <= 1) {
            return Ok(JoinOutcome {
                released: true,
                active_branches: 1,
                state_id: None,
                continue_frames: None,
            });
        }

        // (expected arrivals, join key, fork state this join closes)
        let (expected, correlation_id, sized_by) = match static_expected {
            Some(n) => (n, req.frames.first().map(|f| f.fork_state_id), None),
            None => match req.frames.last() {
                Some(frame) => (
                    frame.branch_count,
                    Some(frame.fork_state_id),
                    Some(frame.fork_state_id),
                ),
                None => {
                    let recent_fork = self
                        .states
                        .get_active_states(pid)
                        .await?
                        .into_iter()
                        .find(|s| s.gateway_type == GatewayStateKind::Fork);
                    match recent_fork {
                        Some(fork) => (fork.active_branches, Some(fork.id), Some(fork.id)),
                        None => (1, None, None),
                    }
                }
            },
        };

        let state = self
            .states
            .create_join_state(NewJoinState {
                process_instance_id: pid.to_string(),
                execution_id: req.execution_id.map(str::to_string),
                gateway_id: req.gateway.id.clone(),
                active_branches: expected,
                correlation_id,
            })
            .await?;

        let updated = self.states.record_arrival(state.id, req.frames).await?;
        let released = updated.completed_branches == updated.active_branches;

        let mut continue_frames = None;
        if released {
            if let Some(fork_id) = sized_by {
                self.states.complete_state(fork_id).await?;
            }
            let shared = updated.arrived_frames.clone().unwrap_or_default();
            let mut open = Vec::with_capacity(shared.len());
            for frame in shared {
                if frame.is_closed() {
                    self.states.complete_state(frame.fork_state_id).await?;
                } else {
                    open.push(frame);
                }
            }
            continue_frames = Some(open);
        }

        debug!(
            gateway = %req.gateway.id,
            completed = updated.completed_branches,
            expected = updated.active_branches,
            released,
            "join arrival"
        );

        Ok(JoinOutcome {
            released,
            active_branches: updated.active_branches,
            state_id: Some(updated.id),
            continue_frames,
        })
    }
}

fn event_based(req: &GatewayRequest<'_>) -> Result<GatewayDecision> {
    if req.outgoing.is_empty() {
        return Err(EngineError::NoOutgoingFlow(req.gateway.id.clone()));
    }
    Ok(GatewayDecision {
        next_element_ids: req.outgoing.iter().map(|f| f.target_ref.clone()).collect(),
        needs_wait: true,
        ..Default::default()
    })
}

/// The declared default flow, or else the first unconditioned flow.
pub fn default_flow<'f>(gateway: &Gateway, outgoing: &[&'f SequenceFlow]) -> Option<&'f SequenceFlow> {
    match &gateway.default_flow {
        Some(id) => outgoing.iter().copied().find(|f| &f.id == id),
        None => outgoing.iter().copied().find(|f| !f.is_conditional()),
    }
}

fn is_same(default: Option<&SequenceFlow>, flow: &SequenceFlow) -> bool {
    default.is_some_and(|d| d.id == flow.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryGatewayStateStore;
    use serde_json::json;

    fn executor() -> (GatewayExecutor, Arc<MemoryGatewayStateStore>) {
        let store = Arc::new(MemoryGatewayStateStore::new());
        (
            GatewayExecutor::new(store.clone(), ExpressionEvaluator::new()),
            store,
        )
    }

    fn vars(v: serde_json::Value) -> Variables {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn exclusive_takes_first_true_in_definition_order() {
        let (exec, _) = executor();
        let gw = Gateway::new("gw", GatewayType::Exclusive);
        let flows = [
            SequenceFlow::new("f1", "gw", "a").with_condition("${x} > 1"),
            SequenceFlow::new("f2", "gw", "b").with_condition("${x} > 0"),
            SequenceFlow::new("f3", "gw", "c"),
        ];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let v = vars(json!({"x": 5}));

        let d = exec.execute(GatewayRequest::new(&gw, &refs, &v)).await.unwrap();
        assert_eq!(d.next_element_ids, vec!["a"]);
        assert!(!d.needs_wait && !d.is_fork && !d.is_join);
    }

    #[tokio::test]
    async fn exclusive_falls_back_to_default_and_skips_broken_conditions() {
        let (exec, _) = executor();
        let gw = Gateway::new("gw", GatewayType::Exclusive);
        let flows = [
            SequenceFlow::new("f1", "gw", "a").with_condition("${x} >"),
            SequenceFlow::new("f2", "gw", "b").with_condition("${x} < 0"),
            SequenceFlow::new("f3", "gw", "c"),
        ];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let v = vars(json!({"x": 5}));

        let d = exec.execute(GatewayRequest::new(&gw, &refs, &v)).await.unwrap();
        assert_eq!(d.next_element_ids, vec!["c"]);
    }

    #[tokio::test]
    async fn exclusive_honours_declared_default() {
        let (exec, _) = executor();
        let gw = Gateway::new("gw", GatewayType::Exclusive).with_default_flow("f2");
        let flows = [
            SequenceFlow::new("f1", "gw", "a").with_condition("false"),
            SequenceFlow::new("f2", "gw", "b").with_condition("true"),
        ];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let d = exec
            .execute(GatewayRequest::new(&gw, &refs, &Variables::new()))
            .await
            .unwrap();
        assert_eq!(d.next_element_ids, vec!["b"]);
    }

    #[tokio::test]
    async fn exclusive_without_match_or_default_fails() {
        let (exec, _) = executor();
        let gw = Gateway::new("gw", GatewayType::Exclusive);
        let flows = [SequenceFlow::new("f1", "gw", "a").with_condition("${x} > 10")];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let err = exec
            .execute(GatewayRequest::new(&gw, &refs, &vars(json!({"x": 1}))))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoSatisfiedFlow(id) if id == "gw"));
    }

    #[tokio::test]
    async fn parallel_fork_returns_all_targets() {
        let (exec, store) = executor();
        let gw = Gateway::new("p", GatewayType::Parallel);
        let flows = [
            SequenceFlow::new("f1", "p", "a").with_condition("false"),
            SequenceFlow::new("f2", "p", "b"),
            SequenceFlow::new("f3", "p", "c"),
        ];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let d = exec
            .execute(GatewayRequest::new(&gw, &refs, &Variables::new()).for_instance("pi-1"))
            .await
            .unwrap();
        assert_eq!(d.next_element_ids, vec!["a", "b", "c"]);
        assert!(d.is_fork);
        assert_eq!(d.active_branches, Some(3));
        assert_eq!(d.fork_frame.as_ref().map(|f| f.branch_count), Some(3));
        assert_eq!(store.get_active_states("pi-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn parallel_without_flows_fails() {
        let (exec, _) = executor();
        let gw = Gateway::new("p", GatewayType::Parallel);
        let err = exec
            .execute(GatewayRequest::new(&gw, &[], &Variables::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoOutgoingFlow(_)));
    }

    #[tokio::test]
    async fn parallel_join_waits_for_every_incoming_flow() {
        let (exec, _) = executor();
        let gw = Gateway::new("pj", GatewayType::Parallel);
        let flows = [SequenceFlow::new("out", "pj", "end")];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let v = Variables::new();
        let req = GatewayRequest::new(&gw, &refs, &v)
            .for_instance("pi-1")
            .with_incoming(3);

        for _ in 0..2 {
            let d = exec.execute(req).await.unwrap();
            assert!(d.is_join && d.needs_wait);
            assert!(d.next_element_ids.is_empty());
        }
        let d = exec.execute(req).await.unwrap();
        assert!(d.is_join && !d.needs_wait);
        assert_eq!(d.next_element_ids, vec!["end"]);
    }

    #[tokio::test]
    async fn inclusive_fork_then_join_needs_exactly_k_arrivals() {
        let (exec, _) = executor();
        let v = vars(json!({"a": true, "b": true, "c": false}));

        let fork = Gateway::new("or-split", GatewayType::Inclusive);
        let fork_flows = [
            SequenceFlow::new("f1", "or-split", "ta").with_condition("${a}"),
            SequenceFlow::new("f2", "or-split", "tb").with_condition("${b}"),
            SequenceFlow::new("f3", "or-split", "tc").with_condition("${c}"),
        ];
        let fork_refs: Vec<&SequenceFlow> = fork_flows.iter().collect();
        let d = exec
            .execute(GatewayRequest::new(&fork, &fork_refs, &v).for_instance("pi-1"))
            .await
            .unwrap();
        assert!(d.is_fork);
        assert_eq!(d.next_element_ids, vec!["ta", "tb"]);
        let k = d.active_branches.unwrap();
        assert_eq!(k, 2);

        let join = Gateway::new("or-join", GatewayType::Inclusive);
        let join_flows = [SequenceFlow::new("j", "or-join", "end")];
        let join_refs: Vec<&SequenceFlow> = join_flows.iter().collect();
        let req = GatewayRequest::new(&join, &join_refs, &v).for_instance("pi-1");

        for _ in 0..k - 1 {
            let d = exec.execute(req).await.unwrap();
            assert!(d.is_join);
            assert!(d.needs_wait);
        }
        let d = exec.execute(req).await.unwrap();
        assert!(!d.needs_wait);
        assert_eq!(d.next_element_ids, vec!["end"]);
    }

    #[tokio::test]
    async fn inclusive_join_uses_correlation_frame_over_recency() {
        let (exec, store) = executor();
        let v = Variables::new();

        // Two forks are active; the token carries the older one's frame.
        let older = store
            .create_fork_state(NewForkState {
                process_instance_id: "pi-1".into(),
                execution_id: None,
                gateway_id: "outer".into(),
                branch_targets: vec!["x".into(), "y".into(), "z".into()],
            })
            .await
            .unwrap();
        store
            .create_fork_state(NewForkState {
                process_instance_id: "pi-1".into(),
                execution_id: None,
                gateway_id: "inner".into(),
                branch_targets: vec!["p".into(), "q".into()],
            })
            .await
            .unwrap();
        let frame = ForkFrame {
            gateway_id: "outer".into(),
            fork_state_id: older.id,
            branch_count: older.active_branches,
            generation: older.generation,
            branches: vec![],
        };

        let join = Gateway::new("join", GatewayType::Inclusive);
        let flows = [SequenceFlow::new("j", "join", "end")];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let branches: Vec<Vec<ForkFrame>> = (0..3).map(|i| vec![frame.for_branch(i)]).collect();
        let req = |frames| {
            GatewayRequest::new(&join, &refs, &v)
                .for_instance("pi-1")
                .with_incoming(3)
                .with_frames(frames)
        };

        let d = exec.execute(req(branches[0].as_slice())).await.unwrap();
        assert_eq!(d.active_branches, Some(3));
        assert!(d.needs_wait);
        exec.execute(req(branches[1].as_slice())).await.unwrap();
        let d = exec.execute(req(branches[2].as_slice())).await.unwrap();
        assert!(!d.needs_wait);
        assert_eq!(d.continue_frames, Some(vec![]));

        let fork_state = store.get_state(older.id).await.unwrap().unwrap();
        assert!(!fork_state.is_active);
    }

    #[tokio::test]
    async fn parallel_join_counts_arrivals_from_nested_forks_together() {
        let (exec, store) = executor();
        let v = Variables::new();
        let fork = |gw: &str, targets: &[&str]| NewForkState {
            process_instance_id: "pi-1".into(),
            execution_id: None,
            gateway_id: gw.into(),
            branch_targets: targets.iter().map(|t| t.to_string()).collect(),
        };
        let p1 = store.create_fork_state(fork("p1", &["u", "p2"])).await.unwrap();
        let p2 = store.create_fork_state(fork("p2", &["x", "y"])).await.unwrap();
        let frame = |s: &crate::store::GatewayState| ForkFrame {
            gateway_id: s.gateway_id.clone(),
            fork_state_id: s.id,
            branch_count: s.active_branches,
            generation: s.generation,
            branches: vec![],
        };
        let (outer, inner) = (frame(&p1), frame(&p2));
        let x = vec![outer.for_branch(1), inner.for_branch(0)];
        let y = vec![outer.for_branch(1), inner.for_branch(1)];
        let u = vec![outer.for_branch(0)];

        let gw = Gateway::new("j", GatewayType::Parallel);
        let flows = [SequenceFlow::new("out", "j", "end")];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let req = |frames| {
            GatewayRequest::new(&gw, &refs, &v)
                .for_instance("pi-1")
                .with_incoming(3)
                .with_frames(frames)
        };

        assert!(exec.execute(req(x.as_slice())).await.unwrap().needs_wait);
        assert!(exec.execute(req(y.as_slice())).await.unwrap().needs_wait);
        let d = exec.execute(req(u.as_slice())).await.unwrap();
        assert!(!d.needs_wait);
        assert_eq!(d.continue_frames, Some(vec![]));
        assert!(!store.get_state(p1.id).await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn inclusive_fork_uses_default_when_nothing_matches() {
        let (exec, _) = executor();
        let gw = Gateway::new("or", GatewayType::Inclusive);
        let flows = [
            SequenceFlow::new("f1", "or", "a").with_condition("${n} > 10"),
            SequenceFlow::new("f2", "or", "b"),
        ];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let d = exec
            .execute(GatewayRequest::new(&gw, &refs, &vars(json!({"n": 1}))))
            .await
            .unwrap();
        assert_eq!(d.next_element_ids, vec!["b"]);
        assert!(d.is_fork);
        assert!(d.fork_frame.is_none());
    }

    #[tokio::test]
    async fn inclusive_fork_without_conditions_takes_every_flow() {
        let (exec, _) = executor();
        let gw = Gateway::new("or", GatewayType::Inclusive);
        let flows = [
            SequenceFlow::new("f1", "or", "a"),
            SequenceFlow::new("f2", "or", "b"),
        ];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let d = exec
            .execute(GatewayRequest::new(&gw, &refs, &Variables::new()))
            .await
            .unwrap();
        assert_eq!(d.next_element_ids, vec!["a", "b"]);
        assert_eq!(d.active_branches, Some(2));
    }

    #[tokio::test]
    async fn inclusive_join_requires_instance_id() {
        let (exec, _) = executor();
        let gw = Gateway::new("or-join", GatewayType::Inclusive);
        let flows = [SequenceFlow::new("j", "or-join", "end")];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let err = exec
            .execute(GatewayRequest::new(&gw, &refs, &Variables::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingProcessInstanceId(_)));
    }

    #[tokio::test]
    async fn event_based_waits_on_every_candidate() {
        let (exec, _) = executor();
        let gw = Gateway::new("ev", GatewayType::EventBased);
        let flows = [
            SequenceFlow::new("f1", "ev", "timer"),
            SequenceFlow::new("f2", "ev", "message"),
        ];
        let refs: Vec<&SequenceFlow> = flows.iter().collect();
        let d = exec
            .execute(GatewayRequest::new(&gw, &refs, &Variables::new()))
            .await
            .unwrap();
        assert!(d.needs_wait);
        assert_eq!(d.next_element_ids, vec!["timer", "message"]);
    }
}
