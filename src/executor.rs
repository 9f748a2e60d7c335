//! Process Executor
//!
//! Owns the lifecycle of process instances and walks their graphs. Each
//! `start`/`continue_instance` call runs its traversal to completion: tokens
//! move until they park at a wait state (user task, sub-process, event-based
//! gateway), are absorbed by a join that is still waiting, or end.
//!
//! Every mutating call works on a copy of the instance context and commits
//! it, together with the events it produced, only once the whole step has
//! succeeded.

use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::compensation::{CompensationCoordinator, RecordExecution};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::expression::ExpressionEvaluator;
use crate::gateway::{GatewayExecutor, GatewayRequest};
use crate::store::GatewayStateStore;
use crate::store_memory::MemoryGatewayStateStore;
use crate::types::*;

const ID_SUFFIX_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

struct InstanceRecord {
    context: ExecutionContext,
    definition: Arc<ProcessDefinition>,
}

/// A token in flight during one traversal.
#[derive(Debug)]
struct Cursor {
    element_id: String,
    frames: Vec<ForkFrame>,
}

/// Working state of one call, committed only on success.
struct Run<'a> {
    definition: &'a ProcessDefinition,
    ctx: ExecutionContext,
    events: Vec<EngineEvent>,
    completions: Vec<RecordExecution>,
    steps: usize,
}

impl<'a> Run<'a> {
    fn new(definition: &'a ProcessDefinition, ctx: ExecutionContext) -> Self {
        Self {
            definition,
            ctx,
            events: Vec::new(),
            completions: Vec::new(),
            steps: 0,
        }
    }

    fn pid(&self) -> &str {
        &self.ctx.process_instance_id
    }

    fn complete(&mut self, element: Element<'_>, execution_id: String) {
        let element_type = element.element_type();
        self.ctx.record(
            element.id(),
            element_type,
            HistoryStatus::Completed,
            Some(execution_id.clone()),
        );
        if matches!(element_type, ElementType::UserTask | ElementType::ServiceTask) {
            let mut completion = RecordExecution::new(
                self.ctx.process_instance_id.clone(),
                execution_id,
                element.id(),
                element_type.as_str(),
            )
            .with_snapshot(self.ctx.variables.clone());
            if let Some(name) = element.name() {
                completion = completion.with_name(name);
            }
            self.completions.push(completion);
        }
    }

    fn park(&mut self, element_id: &str, wait: WaitKind, frames: Vec<ForkFrame>) {
        self.ctx.tokens.push(Token {
            token_id: Uuid::now_v7(),
            element_id: element_id.to_string(),
            wait,
            suspended: false,
            frames,
        });
    }

    /// End the instance if no token is left.
    fn finish_if_done(&mut self) {
        if self.ctx.tokens.is_empty() && !self.ctx.is_ended() {
            self.ctx.ended_at = Some(Utc::now());
            self.events.push(EngineEvent::ProcessEnd {
                process_instance_id: self.ctx.process_instance_id.clone(),
            });
        }
    }
}

/// Drives process instances through their definitions.
pub struct ProcessExecutor {
    config: EngineConfig,
    instances: RwLock<HashMap<String, Arc<Mutex<InstanceRecord>>>>,
    gateways: GatewayExecutor,
    gateway_states: Arc<dyn GatewayStateStore>,
    events: EventBus,
    compensation: Option<Arc<CompensationCoordinator>>,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryGatewayStateStore::new()))
    }

    pub fn with_store(config: EngineConfig, gateway_states: Arc<dyn GatewayStateStore>) -> Self {
        let events = EventBus::new(config.event_channel_capacity);
        let gateways = GatewayExecutor::new(
            gateway_states.clone(),
            ExpressionEvaluator::with_events(events.clone()),
        );
        let compensation = config.compensation.record_executions.then(|| {
            Arc::new(CompensationCoordinator::new(
                config.compensation.retry.to_policy(),
            ))
        });
        Self {
            config,
            instances: RwLock::new(HashMap::new()),
            gateways,
            gateway_states,
            events,
            compensation,
        }
    }

    /// Record every completed task with the given coordinator, replacing any
    /// coordinator built from the config.
    pub fn with_compensation(mut self, coordinator: Arc<CompensationCoordinator>) -> Self {
        self.compensation = Some(coordinator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn gateway_states(&self) -> Arc<dyn GatewayStateStore> {
        self.gateway_states.clone()
    }

    pub fn compensation(&self) -> Option<&Arc<CompensationCoordinator>> {
        self.compensation.as_ref()
    }

    // ─── Lifecycle ────────────────────────────────────────────

    /// Create an instance and run it until every token waits or ends.
    pub async fn start(
        &self,
        definition: Arc<ProcessDefinition>,
        business_key: &str,
        initial_variables: Option<Variables>,
    ) -> Result<ExecutionContext> {
        let start_event = definition
            .start_events
            .first()
            .ok_or_else(|| EngineError::NoStartEvent(definition.id.clone()))?;

        let mut variables = initial_variables.unwrap_or_default();
        variables.insert(
            BUSINESS_KEY_VAR.to_string(),
            serde_json::Value::String(business_key.to_string()),
        );

        // Reserve the id so concurrent starts never collide.
        let (pid, mut record) = {
            let mut instances = self.instances.write().await;
            let pid = loop {
                let candidate = generate_instance_id();
                if !instances.contains_key(&candidate) {
                    break candidate;
                }
            };
            let ctx = ExecutionContext::new(
                pid.clone(),
                definition.id.clone(),
                business_key.to_string(),
                variables,
            );
            let slot = Arc::new(Mutex::new(InstanceRecord {
                context: ctx,
                definition: definition.clone(),
            }));
            // Held until the first traversal commits, so readers never see a
            // half-started instance.
            let record = slot.clone().lock_owned().await;
            instances.insert(pid.clone(), slot);
            (pid, record)
        };

        info!(
            process_instance_id = %pid,
            process_definition_id = %definition.id,
            business_key,
            "starting process instance"
        );

        let mut run = Run::new(&definition, record.context.clone());
        run.events.push(EngineEvent::ProcessStart {
            process_instance_id: pid.clone(),
            process_definition_id: definition.id.clone(),
            business_key: business_key.to_string(),
        });

        let cursor = Cursor {
            element_id: start_event.id.clone(),
            frames: Vec::new(),
        };
        if let Err(e) = self.traverse(&mut run, vec![cursor]).await {
            drop(record);
            self.instances.write().await.remove(&pid);
            self.gateway_states.delete_by_process_instance(&pid).await?;
            return Err(e);
        }

        run.events.push(EngineEvent::ProcessStarted {
            process_instance_id: pid.clone(),
        });
        run.finish_if_done();

        self.commit(&mut record, run).await
    }

    /// Merge variables and, with a `task_id`, complete the token waiting there
    /// and resume traversal from it.
    pub async fn continue_instance(
        &self,
        process_instance_id: &str,
        task_id: Option<&str>,
        variable_updates: Option<Variables>,
    ) -> Result<ExecutionContext> {
        let slot = self.slot(process_instance_id).await?;
        let mut record = slot.lock().await;
        if record.context.is_ended() {
            return Err(EngineError::InstanceEnded(process_instance_id.to_string()));
        }

        let definition = record.definition.clone();
        let mut run = Run::new(&definition, record.context.clone());
        run.events.push(EngineEvent::ProcessContinue {
            process_instance_id: process_instance_id.to_string(),
            task_id: task_id.map(str::to_string),
        });

        if let Some(updates) = variable_updates {
            run.ctx.merge_variables(updates);
        }

        if let Some(task_id) = task_id {
            let index = run
                .ctx
                .tokens
                .iter()
                .position(|t| t.accepts(task_id))
                .ok_or_else(|| EngineError::TaskNotActive {
                    process_instance_id: process_instance_id.to_string(),
                    element_id: task_id.to_string(),
                })?;
            if run.ctx.tokens[index].suspended {
                return Err(EngineError::TokenSuspended {
                    process_instance_id: process_instance_id.to_string(),
                    element_id: task_id.to_string(),
                });
            }
            let token = run.ctx.tokens.remove(index);
            let element = definition
                .element(task_id)
                .ok_or_else(|| EngineError::ElementNotFound {
                    definition_id: definition.id.clone(),
                    element_id: task_id.to_string(),
                })?;

            debug!(process_instance_id, task_id, "completing waiting element");
            run.complete(element, token.token_id.to_string());

            // Join arrivals are written to the store as they happen; put them
            // back if the step fails so a retry counts from the same place.
            let snapshot = self.gateway_states.get_states(process_instance_id).await?;
            let cursors = next_cursors(&definition, task_id, &token.frames);
            if let Err(e) = self.traverse(&mut run, cursors).await {
                self.gateway_states
                    .restore_states(process_instance_id, snapshot)
                    .await?;
                return Err(e);
            }
            run.finish_if_done();
        }

        self.commit(&mut record, run).await
    }

    /// Suspend waiting tokens: the one at `element_id`, or all of them.
    pub async fn suspend(
        &self,
        process_instance_id: &str,
        element_id: Option<&str>,
    ) -> Result<ExecutionContext> {
        let slot = self.slot(process_instance_id).await?;
        let mut record = slot.lock().await;
        if record.context.is_ended() {
            return Err(EngineError::InstanceEnded(process_instance_id.to_string()));
        }

        let definition = record.definition.clone();
        let mut run = Run::new(&definition, record.context.clone());
        run.events.push(EngineEvent::ProcessSuspend {
            process_instance_id: process_instance_id.to_string(),
            element_id: element_id.map(str::to_string),
        });

        if let Some(id) = element_id {
            if !run.ctx.tokens.iter().any(|t| t.element_id == id) {
                return Err(EngineError::TaskNotActive {
                    process_instance_id: process_instance_id.to_string(),
                    element_id: id.to_string(),
                });
            }
        }

        let mut suspended = Vec::new();
        for token in run.ctx.tokens.iter_mut() {
            if token.suspended || element_id.is_some_and(|id| token.element_id != id) {
                continue;
            }
            token.suspended = true;
            suspended.push((token.element_id.clone(), token.token_id));
        }
        for (element, token_id) in &suspended {
            let element_type = definition
                .element(element)
                .map(|e| e.element_type())
                .unwrap_or(ElementType::UserTask);
            run.ctx.record(
                element,
                element_type,
                HistoryStatus::Suspended,
                Some(token_id.to_string()),
            );
        }
        if run.ctx.tokens.iter().all(|t| t.suspended) {
            run.ctx.state = InstanceState::Suspended;
        }

        info!(process_instance_id, count = suspended.len(), "suspended tokens");
        run.events.push(EngineEvent::ProcessSuspended {
            process_instance_id: process_instance_id.to_string(),
            element_ids: suspended.into_iter().map(|(e, _)| e).collect(),
        });

        self.commit(&mut record, run).await
    }

    /// Resume suspended tokens: the one at `element_id`, or all of them.
    pub async fn resume(
        &self,
        process_instance_id: &str,
        element_id: Option<&str>,
    ) -> Result<ExecutionContext> {
        let slot = self.slot(process_instance_id).await?;
        let mut record = slot.lock().await;
        if record.context.is_ended() {
            return Err(EngineError::InstanceEnded(process_instance_id.to_string()));
        }

        let definition = record.definition.clone();
        let mut run = Run::new(&definition, record.context.clone());
        run.events.push(EngineEvent::ProcessResume {
            process_instance_id: process_instance_id.to_string(),
            element_id: element_id.map(str::to_string),
        });

        let mut resumed = Vec::new();
        for token in run.ctx.tokens.iter_mut() {
            if token.suspended && element_id.map_or(true, |id| token.element_id == id) {
                token.suspended = false;
                resumed.push(token.element_id.clone());
            }
        }
        if resumed.is_empty() {
            return Err(EngineError::NoSuspendedElement(
                process_instance_id.to_string(),
            ));
        }
        run.ctx.state = InstanceState::Active;

        info!(process_instance_id, count = resumed.len(), "resumed tokens");
        run.events.push(EngineEvent::ProcessResumed {
            process_instance_id: process_instance_id.to_string(),
            element_ids: resumed,
        });

        self.commit(&mut record, run).await
    }

    /// Cancel every waiting token, drop gateway bookkeeping and forget the
    /// instance. Returns its final context.
    pub async fn terminate(
        &self,
        process_instance_id: &str,
        reason: Option<&str>,
    ) -> Result<ExecutionContext> {
        let slot = self
            .instances
            .write()
            .await
            .remove(process_instance_id)
            .ok_or_else(|| EngineError::ProcessInstanceNotFound(process_instance_id.to_string()))?;
        let mut record = slot.lock().await;

        let definition = record.definition.clone();
        let mut run = Run::new(&definition, record.context.clone());
        run.events.push(EngineEvent::ProcessTerminate {
            process_instance_id: process_instance_id.to_string(),
            reason: reason.map(str::to_string),
        });

        for token in std::mem::take(&mut run.ctx.tokens) {
            let element_type = definition
                .element(&token.element_id)
                .map(|e| e.element_type())
                .unwrap_or(ElementType::UserTask);
            run.ctx.record(
                &token.element_id,
                element_type,
                HistoryStatus::Cancelled,
                Some(token.token_id.to_string()),
            );
        }
        if !run.ctx.is_ended() {
            run.ctx.ended_at = Some(Utc::now());
        }

        let removed = self
            .gateway_states
            .delete_by_process_instance(process_instance_id)
            .await?;
        info!(
            process_instance_id,
            reason = reason.unwrap_or(""),
            gateway_states = removed,
            "terminated process instance"
        );

        run.events.push(EngineEvent::ProcessTerminated {
            process_instance_id: process_instance_id.to_string(),
            reason: reason.map(str::to_string),
        });

        self.commit(&mut record, run).await
    }

    pub async fn get_execution_context(&self, process_instance_id: &str) -> Option<ExecutionContext> {
        let slot = self.instances.read().await.get(process_instance_id).cloned()?;
        let record = slot.lock().await;
        Some(record.context.clone())
    }

    /// Ids of every known instance, sorted.
    pub async fn list_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Internals ────────────────────────────────────────────

    async fn slot(&self, process_instance_id: &str) -> Result<Arc<Mutex<InstanceRecord>>> {
        self.instances
            .read()
            .await
            .get(process_instance_id)
            .cloned()
            .ok_or_else(|| EngineError::ProcessInstanceNotFound(process_instance_id.to_string()))
    }

    /// Store the run's context, then publish its events and record completions.
    /// An ended instance has no further use for its gateway states.
    async fn commit(&self, record: &mut InstanceRecord, run: Run<'_>) -> Result<ExecutionContext> {
        let Run {
            ctx,
            events,
            completions,
            ..
        } = run;

        if let Some(ended_at) = ctx.ended_at {
            let removed = self
                .gateway_states
                .delete_by_process_instance(&ctx.process_instance_id)
                .await?;
            info!(
                process_instance_id = %ctx.process_instance_id,
                %ended_at,
                gateway_states = removed,
                "process instance ended"
            );
        }
        record.context = ctx;

        self.events.publish_batch(events);
        if let Some(coordinator) = &self.compensation {
            for completion in completions {
                coordinator.record_execution(completion).await;
            }
        }
        Ok(record.context.clone())
    }

    /// Depth-first walk from the given cursors.
    async fn traverse(&self, run: &mut Run<'_>, start: Vec<Cursor>) -> Result<()> {
        let definition = run.definition;
        let mut stack: Vec<Cursor> = start.into_iter().rev().collect();

        while let Some(cursor) = stack.pop() {
            run.steps += 1;
            if run.steps > self.config.max_traversal_steps {
                return Err(EngineError::TraversalLimitExceeded {
                    process_instance_id: run.pid().to_string(),
                    limit: self.config.max_traversal_steps,
                });
            }

            let element = definition.element(&cursor.element_id).ok_or_else(|| {
                EngineError::ElementNotFound {
                    definition_id: definition.id.clone(),
                    element_id: cursor.element_id.clone(),
                }
            })?;
            debug!(
                process_instance_id = %run.pid(),
                element_id = %cursor.element_id,
                element_type = %element.element_type(),
                "visiting element"
            );

            match element {
                Element::StartEvent(_) | Element::ServiceTask(_) | Element::EndEvent(_) => {
                    run.complete(element, Uuid::now_v7().to_string());
                    push_next(&mut stack, definition, &cursor.element_id, &cursor.frames);
                }
                Element::UserTask(task) => {
                    let process_instance_id = run.pid().to_string();
                    run.events.push(EngineEvent::TaskCreated {
                        process_instance_id,
                        task_id: task.id.clone(),
                        task_name: task.name.clone(),
                    });
                    run.park(&task.id, WaitKind::UserTask, cursor.frames);
                }
                Element::SubProcess(sub) => {
                    run.park(&sub.id, WaitKind::SubProcess, cursor.frames);
                }
                Element::Gateway(gateway) => {
                    self.visit_gateway(run, gateway, cursor, &mut stack).await?;
                }
            }
        }
        Ok(())
    }

    async fn visit_gateway(
        &self,
        run: &mut Run<'_>,
        gateway: &Gateway,
        cursor: Cursor,
        stack: &mut Vec<Cursor>,
    ) -> Result<()> {
        let definition = run.definition;
        let outgoing = definition.outgoing(&gateway.id);
        let execution_id = Uuid::now_v7().to_string();

        let decision = {
            let request = GatewayRequest::new(gateway, &outgoing, &run.ctx.variables)
                .for_instance(&run.ctx.process_instance_id)
                .with_execution(&execution_id)
                .with_incoming(definition.incoming_count(&gateway.id))
                .with_frames(&cursor.frames);
            self.gateways.execute(request).await?
        };

        run.ctx.record(
            &gateway.id,
            ElementType::Gateway,
            HistoryStatus::Completed,
            Some(execution_id),
        );

        if decision.needs_wait {
            if !decision.is_join {
                run.park(
                    &gateway.id,
                    WaitKind::EventGateway {
                        candidates: decision.next_element_ids,
                    },
                    cursor.frames,
                );
            }
            return Ok(());
        }

        let frames = decision.continue_frames.unwrap_or(cursor.frames);
        let targets = decision.next_element_ids.into_iter().enumerate().rev();
        for (index, target) in targets {
            let mut branch_frames = frames.clone();
            if let Some(fork) = &decision.fork_frame {
                branch_frames.push(fork.for_branch(index as u32));
            }
            stack.push(Cursor {
                element_id: target,
                frames: branch_frames,
            });
        }
        Ok(())
    }
}

fn next_cursors(definition: &ProcessDefinition, element_id: &str, frames: &[ForkFrame]) -> Vec<Cursor> {
    definition
        .outgoing(element_id)
        .into_iter()
        .map(|f| Cursor {
            element_id: f.target_ref.clone(),
            frames: frames.to_vec(),
        })
        .collect()
}

/// Push the targets of every outgoing flow so the first flow is visited first.
fn push_next(stack: &mut Vec<Cursor>, definition: &ProcessDefinition, element_id: &str, frames: &[ForkFrame]) {
    stack.extend(next_cursors(definition, element_id, frames).into_iter().rev());
}

/// `pi-<epochMillis>-<9 lowercase alphanumerics>`.
pub fn generate_instance_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_SUFFIX_CHARSET[rng.gen_range(0..ID_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("pi-{}-{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use regex::Regex;
    use serde_json::json;

    fn linear() -> Arc<ProcessDefinition> {
        let mut def = ProcessDefinition::new("linear");
        def.start_events.push(FlowNode::new("start"));
        def.user_tasks.push(FlowNode::named("task1", "Review"));
        def.end_events.push(FlowNode::new("end"));
        def.sequence_flows.push(SequenceFlow::new("f1", "start", "task1"));
        def.sequence_flows.push(SequenceFlow::new("f2", "task1", "end"));
        Arc::new(def)
    }

    fn visited(ctx: &ExecutionContext) -> Vec<&str> {
        ctx.history.iter().map(|h| h.element_id.as_str()).collect()
    }

    #[test]
    fn instance_id_format() {
        let re = Regex::new(r"^pi-\d+-[0-9a-z]{9}$").unwrap();
        for _ in 0..50 {
            assert!(re.is_match(&generate_instance_id()));
        }
    }

    #[tokio::test]
    async fn start_parks_at_user_task() {
        let exec = ProcessExecutor::new();
        let mut rx = exec.subscribe_events();

        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        assert_eq!(ctx.business_key, "bk-1");
        assert_eq!(ctx.variables["businessKey"], json!("bk-1"));
        assert_eq!(visited(&ctx), vec!["start"]);
        assert_eq!(ctx.waiting_elements(), vec!["task1"]);
        assert!(!ctx.is_ended());

        let names: Vec<&str> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.name())
        .collect();
        assert_eq!(names, vec!["process.start", "task.created", "process.started"]);
    }

    #[tokio::test]
    async fn continue_completes_task_and_ends() {
        let exec = ProcessExecutor::new();
        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        let pid = ctx.process_instance_id.clone();

        let mut updates = Variables::new();
        updates.insert("approved".into(), json!(true));
        let ctx = exec
            .continue_instance(&pid, Some("task1"), Some(updates))
            .await
            .unwrap();
        assert_eq!(visited(&ctx), vec!["start", "task1", "end"]);
        assert!(ctx.is_ended());
        assert!(ctx.tokens.is_empty());
        assert_eq!(ctx.variables["approved"], json!(true));

        let err = exec.continue_instance(&pid, None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InstanceEnded(_)));
    }

    #[tokio::test]
    async fn continue_rejects_inactive_task_without_side_effects() {
        let exec = ProcessExecutor::new();
        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        let pid = ctx.process_instance_id.clone();

        let mut updates = Variables::new();
        updates.insert("x".into(), json!(1));
        let err = exec
            .continue_instance(&pid, Some("end"), Some(updates))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskNotActive { .. }));

        let after = exec.get_execution_context(&pid).await.unwrap();
        assert_eq!(after, ctx);
    }

    #[tokio::test]
    async fn continue_without_task_only_merges_variables() {
        let exec = ProcessExecutor::new();
        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        let mut updates = Variables::new();
        updates.insert("note".into(), json!("hi"));
        let after = exec
            .continue_instance(&ctx.process_instance_id, None, Some(updates))
            .await
            .unwrap();
        assert_eq!(after.history, ctx.history);
        assert_eq!(after.variables["note"], json!("hi"));
        assert_eq!(after.waiting_elements(), vec!["task1"]);
    }

    #[tokio::test]
    async fn start_without_start_event_fails() {
        let exec = ProcessExecutor::new();
        let err = exec
            .start(Arc::new(ProcessDefinition::new("empty")), "bk", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoStartEvent(_)));
        assert!(exec.list_instances().await.is_empty());
    }

    #[tokio::test]
    async fn dangling_flow_fails_start_and_leaves_nothing_behind() {
        let mut def = ProcessDefinition::new("broken");
        def.start_events.push(FlowNode::new("start"));
        def.sequence_flows.push(SequenceFlow::new("f1", "start", "ghost"));
        let exec = ProcessExecutor::new();

        let err = exec.start(Arc::new(def), "bk", None).await.unwrap_err();
        assert!(matches!(err, EngineError::ElementNotFound { element_id, .. } if element_id == "ghost"));
        assert!(exec.list_instances().await.is_empty());
    }

    #[tokio::test]
    async fn cycles_hit_the_traversal_limit() {
        let mut def = ProcessDefinition::new("loop");
        def.start_events.push(FlowNode::new("start"));
        def.service_tasks.push(FlowNode::new("a"));
        def.service_tasks.push(FlowNode::new("b"));
        def.sequence_flows.push(SequenceFlow::new("f1", "start", "a"));
        def.sequence_flows.push(SequenceFlow::new("f2", "a", "b"));
        def.sequence_flows.push(SequenceFlow::new("f3", "b", "a"));

        let config = EngineConfig {
            max_traversal_steps: 50,
            ..Default::default()
        };
        let exec = ProcessExecutor::with_config(config);
        let err = exec.start(Arc::new(def), "bk", None).await.unwrap_err();
        assert!(matches!(err, EngineError::TraversalLimitExceeded { limit: 50, .. }));
    }

    #[tokio::test]
    async fn suspend_and_resume_per_token() {
        let exec = ProcessExecutor::new();
        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        let pid = ctx.process_instance_id.clone();

        let ctx = exec.suspend(&pid, Some("task1")).await.unwrap();
        assert_eq!(ctx.state, InstanceState::Suspended);
        assert_eq!(ctx.history.last().unwrap().status, HistoryStatus::Suspended);

        let err = exec.continue_instance(&pid, Some("task1"), None).await.unwrap_err();
        assert!(matches!(err, EngineError::TokenSuspended { .. }));

        let ctx = exec.resume(&pid, None).await.unwrap();
        assert_eq!(ctx.state, InstanceState::Active);
        let err = exec.resume(&pid, None).await.unwrap_err();
        assert!(matches!(err, EngineError::NoSuspendedElement(_)));

        let ctx = exec.continue_instance(&pid, Some("task1"), None).await.unwrap();
        assert!(ctx.is_ended());
    }

    #[tokio::test]
    async fn terminate_cancels_waiting_tokens_and_forgets_instance() {
        let exec = ProcessExecutor::new();
        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        let pid = ctx.process_instance_id.clone();

        let ctx = exec.terminate(&pid, Some("customer cancelled")).await.unwrap();
        let last = ctx.history.last().unwrap();
        assert_eq!(last.element_id, "task1");
        assert_eq!(last.status, HistoryStatus::Cancelled);
        assert!(ctx.tokens.is_empty());
        assert!(exec.get_execution_context(&pid).await.is_none());

        let err = exec.terminate(&pid, None).await.unwrap_err();
        assert!(matches!(err, EngineError::ProcessInstanceNotFound(_)));
    }

    #[tokio::test]
    async fn completed_tasks_are_recorded_for_compensation() {
        let coordinator = Arc::new(CompensationCoordinator::default());
        let exec = ProcessExecutor::new().with_compensation(coordinator.clone());
        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        let pid = ctx.process_instance_id.clone();
        assert!(coordinator.get_records(&pid).await.is_empty());

        exec.continue_instance(&pid, Some("task1"), None).await.unwrap();
        let records = coordinator.get_records(&pid).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].activity_id, "task1");
        assert_eq!(records[0].activity_type, "userTask");
        assert_eq!(records[0].activity_name.as_deref(), Some("Review"));
    }

    #[tokio::test]
    async fn config_can_enable_compensation_recording() {
        assert!(ProcessExecutor::new().compensation().is_none());

        let mut config = EngineConfig::default();
        config.compensation.record_executions = true;
        config.compensation.retry.max_attempts = Some(5);
        let exec = ProcessExecutor::with_config(config);
        let coordinator = exec.compensation().cloned().unwrap();
        assert_eq!(coordinator.default_policy().max_attempts, Some(5));

        let ctx = exec.start(linear(), "bk-1", None).await.unwrap();
        let pid = ctx.process_instance_id;
        exec.continue_instance(&pid, Some("task1"), None).await.unwrap();
        assert_eq!(coordinator.get_records(&pid).await.len(), 1);
    }
}
