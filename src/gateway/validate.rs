//! Structural checks for gateways and process definitions.
//!
//! Issues carry a rule code so callers can filter them. Only `Error` issues
//! make [`ensure_valid`] fail; `Warning` issues describe models that run but
//! may fail at runtime (an exclusive gateway without a default flow, say).

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use std::collections::HashSet;
use std::fmt;

use crate::error::{EngineError, Result};
use crate::types::{Gateway, GatewayType, ProcessDefinition, SequenceFlow};

use super::default_flow;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    pub rule: &'static str,
    pub severity: Severity,
    pub element_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn error(rule: &'static str, element_id: Option<&str>, message: String) -> Self {
        Self {
            rule,
            severity: Severity::Error,
            element_id: element_id.map(str::to_string),
            message,
        }
    }

    fn warning(rule: &'static str, element_id: Option<&str>, message: String) -> Self {
        Self {
            rule,
            severity: Severity::Warning,
            element_id: element_id.map(str::to_string),
            message,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

/// Check one gateway against its outgoing flows.
pub fn validate_gateway(gateway: &Gateway, outgoing: &[&SequenceFlow]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let id = Some(gateway.id.as_str());

    if outgoing.is_empty() {
        issues.push(ValidationIssue::error(
            "G1",
            id,
            format!("Gateway '{}' has no outgoing flows", gateway.id),
        ));
        return issues;
    }

    if let Some(declared) = &gateway.default_flow {
        if !outgoing.iter().any(|f| &f.id == declared) {
            issues.push(ValidationIssue::error(
                "G2",
                id,
                format!(
                    "Gateway '{}' declares default flow '{}' which is not one of its outgoing flows",
                    gateway.id, declared
                ),
            ));
        }
    }

    match gateway.gateway_type {
        GatewayType::Exclusive => {
            if default_flow(gateway, outgoing).is_none() {
                issues.push(ValidationIssue::warning(
                    "G3",
                    id,
                    format!(
                        "Exclusive gateway '{}' has no default flow; it fails when no condition holds",
                        gateway.id
                    ),
                ));
            }
        }
        GatewayType::Parallel => {
            for flow in outgoing.iter().filter(|f| f.is_conditional()) {
                issues.push(ValidationIssue::warning(
                    "G4",
                    id,
                    format!(
                        "Parallel gateway '{}' ignores the condition on flow '{}'",
                        gateway.id, flow.id
                    ),
                ));
            }
        }
        GatewayType::Inclusive | GatewayType::EventBased => {}
    }

    issues
}

/// Check a whole definition: start/end events, unique ids, dangling flow
/// references, reachability from the start events, then every gateway.
pub fn validate_definition(definition: &ProcessDefinition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if definition.start_events.is_empty() {
        issues.push(ValidationIssue::error(
            "D1",
            None,
            format!("Process '{}' has no start event", definition.id),
        ));
    }
    if definition.end_events.is_empty() {
        issues.push(ValidationIssue::error(
            "D2",
            None,
            format!("Process '{}' has no end event", definition.id),
        ));
    }

    let mut seen = HashSet::new();
    for id in definition.element_ids() {
        if !seen.insert(id) {
            issues.push(ValidationIssue::error(
                "D3",
                Some(id),
                format!("Element id '{id}' is used more than once"),
            ));
        }
    }

    for flow in &definition.sequence_flows {
        for (side, target) in [("source", &flow.source_ref), ("target", &flow.target_ref)] {
            if definition.element(target).is_none() {
                issues.push(ValidationIssue::error(
                    "D4",
                    Some(&flow.id),
                    format!(
                        "Sequence flow '{}' has unknown {side} '{target}'",
                        flow.id
                    ),
                ));
            }
        }
    }

    if !definition.start_events.is_empty() {
        for id in unreachable_elements(definition) {
            issues.push(ValidationIssue::warning(
                "D5",
                Some(id),
                format!("Element '{id}' cannot be reached from any start event"),
            ));
        }
    }

    for gateway in &definition.gateways {
        issues.extend(validate_gateway(gateway, &definition.outgoing(&gateway.id)));
    }

    issues
}

/// Elements no start event leads to, in element order.
fn unreachable_elements(definition: &ProcessDefinition) -> Vec<&str> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for id in definition.element_ids() {
        graph.add_node(id);
    }
    for flow in &definition.sequence_flows {
        graph.add_edge(flow.source_ref.as_str(), flow.target_ref.as_str(), ());
    }

    let mut reached = HashSet::new();
    for start in &definition.start_events {
        let mut dfs = Dfs::new(&graph, start.id.as_str());
        while let Some(node) = dfs.next(&graph) {
            reached.insert(node);
        }
    }

    definition
        .element_ids()
        .filter(|id| !reached.contains(id))
        .collect()
}

/// Fail with [`EngineError::InvalidDefinition`] if any error-level issue exists.
pub fn ensure_valid(definition: &ProcessDefinition) -> Result<()> {
    let errors: Vec<String> = validate_definition(definition)
        .into_iter()
        .filter(|i| i.severity == Severity::Error)
        .map(|i| i.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidDefinition(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FlowNode;

    fn linear() -> ProcessDefinition {
        let mut def = ProcessDefinition::new("p");
        def.start_events.push(FlowNode::new("start"));
        def.gateways.push(Gateway::new("gw", GatewayType::Exclusive));
        def.end_events.push(FlowNode::new("end"));
        def.sequence_flows.push(SequenceFlow::new("f1", "start", "gw"));
        def.sequence_flows
            .push(SequenceFlow::new("f2", "gw", "end").with_condition("${ok}"));
        def
    }

    #[test]
    fn exclusive_without_default_is_only_a_warning() {
        let issues = validate_definition(&linear());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, "G3");
        assert_eq!(issues[0].severity, Severity::Warning);
        assert!(ensure_valid(&linear()).is_ok());
    }

    #[test]
    fn dangling_flow_and_missing_end_are_errors() {
        let mut def = linear();
        def.end_events.clear();
        let err = ensure_valid(&def).unwrap_err();
        let EngineError::InvalidDefinition(msg) = err else {
            panic!("expected InvalidDefinition");
        };
        assert!(msg.contains("[D2]"));
        assert!(msg.contains("[D4]"));
    }

    #[test]
    fn gateway_without_flows_and_bad_default() {
        let gw = Gateway::new("gw", GatewayType::Inclusive).with_default_flow("nope");
        let issues = validate_gateway(&gw, &[]);
        assert_eq!(issues.iter().map(|i| i.rule).collect::<Vec<_>>(), vec!["G1"]);

        let flow = SequenceFlow::new("f", "gw", "x");
        let issues = validate_gateway(&gw, &[&flow]);
        assert_eq!(issues.iter().map(|i| i.rule).collect::<Vec<_>>(), vec!["G2"]);
    }

    #[test]
    fn parallel_conditions_are_flagged() {
        let gw = Gateway::new("p", GatewayType::Parallel);
        let a = SequenceFlow::new("a", "p", "x").with_condition("${go}");
        let b = SequenceFlow::new("b", "p", "y");
        let issues = validate_gateway(&gw, &[&a, &b]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].rule, "G4");
    }

    #[test]
    fn unreachable_elements_are_warnings() {
        let mut def = linear();
        def.user_tasks.push(FlowNode::new("orphan"));
        let issues = validate_definition(&def);
        let orphan = issues.iter().find(|i| i.rule == "D5").unwrap();
        assert_eq!(orphan.element_id.as_deref(), Some("orphan"));
        assert_eq!(orphan.severity, Severity::Warning);
    }

    #[test]
    fn duplicate_ids_are_errors() {
        let mut def = linear();
        def.user_tasks.push(FlowNode::new("gw"));
        assert!(validate_definition(&def).iter().any(|i| i.rule == "D3"));
    }
}
