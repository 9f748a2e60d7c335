use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Variables ────────────────────────────────────────────────

/// Instance variables. Ordered so serialized contexts are reproducible.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Reserved variable name seeded by `start()`.
pub const BUSINESS_KEY_VAR: &str = "businessKey";

// ─── Process definition (external input) ─────────────────────

/// A flow node with no behaviour beyond its identity (events, tasks).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl FlowNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GatewayType {
    Exclusive,
    Parallel,
    Inclusive,
    EventBased,
}

impl GatewayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayType::Exclusive => "exclusiveGateway",
            GatewayType::Parallel => "parallelGateway",
            GatewayType::Inclusive => "inclusiveGateway",
            GatewayType::EventBased => "eventBasedGateway",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub gateway_type: GatewayType,
    /// Explicitly declared default flow id. When absent the unconditioned
    /// outgoing flow acts as the default.
    #[serde(default)]
    pub default_flow: Option<String>,
}

impl Gateway {
    pub fn new(id: impl Into<String>, gateway_type: GatewayType) -> Self {
        Self {
            id: id.into(),
            name: None,
            gateway_type,
            default_flow: None,
        }
    }

    pub fn with_default_flow(mut self, flow_id: impl Into<String>) -> Self {
        self.default_flow = Some(flow_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceFlow {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    #[serde(default)]
    pub condition_expression: Option<String>,
}

impl SequenceFlow {
    pub fn new(
        id: impl Into<String>,
        source_ref: impl Into<String>,
        target_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
            condition_expression: None,
        }
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition_expression = Some(expression.into());
        self
    }

    /// A flow with a blank condition counts as unconditioned.
    pub fn is_conditional(&self) -> bool {
        self.condition_expression
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }
}

/// Parsed process graph. Produced by an external parser and never mutated
/// here; instances hold it behind an `Arc` so a running instance keeps the
/// snapshot it was started with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_events: Vec<FlowNode>,
    #[serde(default)]
    pub end_events: Vec<FlowNode>,
    #[serde(default)]
    pub user_tasks: Vec<FlowNode>,
    #[serde(default)]
    pub service_tasks: Vec<FlowNode>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub sequence_flows: Vec<SequenceFlow>,
    #[serde(default)]
    pub sub_processes: Vec<FlowNode>,
}

fn default_version() -> u32 {
    1
}

/// The kind of graph element an id resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementType {
    StartEvent,
    EndEvent,
    UserTask,
    ServiceTask,
    Gateway,
    SubProcess,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::StartEvent => "startEvent",
            ElementType::EndEvent => "endEvent",
            ElementType::UserTask => "userTask",
            ElementType::ServiceTask => "serviceTask",
            ElementType::Gateway => "gateway",
            ElementType::SubProcess => "subProcess",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Borrowed view of a resolved element.
#[derive(Clone, Copy, Debug)]
pub enum Element<'a> {
    StartEvent(&'a FlowNode),
    EndEvent(&'a FlowNode),
    UserTask(&'a FlowNode),
    ServiceTask(&'a FlowNode),
    Gateway(&'a Gateway),
    SubProcess(&'a FlowNode),
}

impl<'a> Element<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            Element::StartEvent(n)
            | Element::EndEvent(n)
            | Element::UserTask(n)
            | Element::ServiceTask(n)
            | Element::SubProcess(n) => &n.id,
            Element::Gateway(g) => &g.id,
        }
    }

    pub fn name(&self) -> Option<&'a str> {
        match self {
            Element::StartEvent(n)
            | Element::EndEvent(n)
            | Element::UserTask(n)
            | Element::ServiceTask(n)
            | Element::SubProcess(n) => n.name.as_deref(),
            Element::Gateway(g) => g.name.as_deref(),
        }
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            Element::StartEvent(_) => ElementType::StartEvent,
            Element::EndEvent(_) => ElementType::EndEvent,
            Element::UserTask(_) => ElementType::UserTask,
            Element::ServiceTask(_) => ElementType::ServiceTask,
            Element::Gateway(_) => ElementType::Gateway,
            Element::SubProcess(_) => ElementType::SubProcess,
        }
    }
}

impl ProcessDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            ..Default::default()
        }
    }

    /// Resolve an element id. Lookup order follows the element lists.
    pub fn element(&self, id: &str) -> Option<Element<'_>> {
        let find = |nodes: &[FlowNode]| nodes.iter().position(|n| n.id == id);

        if let Some(i) = find(&self.start_events) {
            return Some(Element::StartEvent(&self.start_events[i]));
        }
        if let Some(i) = find(&self.end_events) {
            return Some(Element::EndEvent(&self.end_events[i]));
        }
        if let Some(i) = find(&self.user_tasks) {
            return Some(Element::UserTask(&self.user_tasks[i]));
        }
        if let Some(i) = find(&self.service_tasks) {
            return Some(Element::ServiceTask(&self.service_tasks[i]));
        }
        if let Some(g) = self.gateways.iter().find(|g| g.id == id) {
            return Some(Element::Gateway(g));
        }
        find(&self.sub_processes).map(|i| Element::SubProcess(&self.sub_processes[i]))
    }

    /// Outgoing flows of an element, in definition order.
    pub fn outgoing(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.sequence_flows
            .iter()
            .filter(|f| f.source_ref == element_id)
            .collect()
    }

    pub fn incoming_count(&self, element_id: &str) -> usize {
        self.sequence_flows
            .iter()
            .filter(|f| f.target_ref == element_id)
            .count()
    }

    /// Ids of every element in the graph.
    pub fn element_ids(&self) -> impl Iterator<Item = &str> {
        self.start_events
            .iter()
            .chain(&self.end_events)
            .chain(&self.user_tasks)
            .chain(&self.service_tasks)
            .chain(&self.sub_processes)
            .map(|n| n.id.as_str())
            .chain(self.gateways.iter().map(|g| g.id.as_str()))
    }
}

// ─── Execution context ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Active,
    Suspended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    Completed,
    Suspended,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHistoryEntry {
    pub element_id: String,
    pub element_type: ElementType,
    pub status: HistoryStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// One fork activation, carried by every token spawned from it so the
/// matching join can size itself without guessing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkFrame {
    pub gateway_id: String,
    pub fork_state_id: Uuid,
    pub branch_count: u32,
    pub generation: u32,
    /// Branch indexes this token stands for. A spawned branch holds its own
    /// index; a token leaving a join holds the union of what arrived.
    #[serde(default)]
    pub branches: Vec<u32>,
}

impl ForkFrame {
    pub fn for_branch(&self, index: u32) -> Self {
        Self {
            branches: vec![index],
            ..self.clone()
        }
    }

    /// Every branch of the fork has been merged back.
    pub fn is_closed(&self) -> bool {
        self.branches.len() as u32 >= self.branch_count
    }
}

/// Fold the frames of a token arriving at a join into the frames shared by
/// the earlier arrivals: keep the common prefix of fork activations and
/// union the branches on each level.
pub fn merge_frames(shared: &[ForkFrame], arriving: &[ForkFrame]) -> Vec<ForkFrame> {
    shared
        .iter()
        .zip(arriving)
        .take_while(|(a, b)| a.fork_state_id == b.fork_state_id)
        .map(|(a, b)| {
            let mut merged = a.clone();
            merged.branches.extend(b.branches.iter().copied());
            merged.branches.sort_unstable();
            merged.branches.dedup();
            merged
        })
        .collect()
}

/// What a parked token waits for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum WaitKind {
    UserTask,
    SubProcess,
    /// Parked at an event-based gateway; whichever candidate fires first wins.
    EventGateway { candidates: Vec<String> },
}

/// A parked locus of execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token_id: Uuid,
    pub element_id: String,
    pub wait: WaitKind,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub frames: Vec<ForkFrame>,
}

impl Token {
    /// True if this token can be completed by `continue(element_id)`.
    pub fn accepts(&self, element_id: &str) -> bool {
        match &self.wait {
            WaitKind::UserTask | WaitKind::SubProcess => self.element_id == element_id,
            WaitKind::EventGateway { candidates } => candidates.iter().any(|c| c == element_id),
        }
    }
}

/// A process instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub process_instance_id: String,
    pub process_definition_id: String,
    pub business_key: String,
    pub variables: Variables,
    pub history: Vec<ExecutionHistoryEntry>,
    pub state: InstanceState,
    pub tokens: Vec<Token>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(
        process_instance_id: String,
        process_definition_id: String,
        business_key: String,
        variables: Variables,
    ) -> Self {
        Self {
            process_instance_id,
            process_definition_id,
            business_key,
            variables,
            history: Vec::new(),
            state: InstanceState::Active,
            tokens: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Append a history entry. Timestamps are clamped so history never goes
    /// backwards even if the wall clock does.
    pub fn record(
        &mut self,
        element_id: &str,
        element_type: ElementType,
        status: HistoryStatus,
        execution_id: Option<String>,
    ) {
        let mut now = Utc::now();
        if let Some(last) = self.history.last() {
            if now < last.end_time {
                now = last.end_time;
            }
        }
        self.history.push(ExecutionHistoryEntry {
            element_id: element_id.to_string(),
            element_type,
            status,
            start_time: now,
            end_time: now,
            execution_id,
        });
    }

    /// Shallow merge, last write wins.
    pub fn merge_variables(&mut self, updates: Variables) {
        self.variables.extend(updates);
    }

    pub fn waiting_elements(&self) -> Vec<&str> {
        self.tokens.iter().map(|t| t.element_id.as_str()).collect()
    }

    pub fn history_for(&self, element_id: &str) -> Vec<&ExecutionHistoryEntry> {
        self.history
            .iter()
            .filter(|h| h.element_id == element_id)
            .collect()
    }
}
