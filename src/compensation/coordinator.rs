use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::*;
use crate::error::{EngineError, Result};

type HandlerKey = (String, String);

#[derive(Default)]
struct Inner {
    handlers: HashMap<HandlerKey, Arc<dyn CompensationHandler>>,
    /// Per instance, in recording order.
    records: HashMap<String, Vec<CompensationExecutionRecord>>,
    /// Per instance, keyed by scope id.
    scopes: HashMap<String, HashMap<String, CompensationScope>>,
    subscriptions: HashMap<String, Vec<CompensationSubscription>>,
    next_sequence: u64,
}

impl Inner {
    /// `scope_id` plus every scope below it.
    fn scope_with_descendants(&self, process_instance_id: &str, scope_id: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut queue = VecDeque::from([scope_id.to_string()]);
        let scopes = self.scopes.get(process_instance_id);
        while let Some(id) = queue.pop_front() {
            if !out.insert(id.clone()) {
                continue;
            }
            if let Some(scope) = scopes.and_then(|s| s.get(&id)) {
                queue.extend(scope.child_scopes.iter().cloned());
            }
        }
        out
    }

    fn record_mut(
        &mut self,
        process_instance_id: &str,
        sequence: u64,
    ) -> Option<&mut CompensationExecutionRecord> {
        self.records
            .get_mut(process_instance_id)?
            .iter_mut()
            .find(|r| r.sequence == sequence)
    }
}

/// Records compensable completions and undoes them in reverse order.
pub struct CompensationCoordinator {
    inner: Mutex<Inner>,
    default_policy: RetryPolicy,
}

impl Default for CompensationCoordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl CompensationCoordinator {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            default_policy,
        }
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    // ─── Handlers ─────────────────────────────────────────────

    pub async fn register_handler(
        &self,
        process_instance_id: &str,
        activity_id: &str,
        handler: Arc<dyn CompensationHandler>,
    ) {
        debug!(process_instance_id, activity_id, "registering compensation handler");
        self.inner.lock().await.handlers.insert(
            (process_instance_id.to_string(), activity_id.to_string()),
            handler,
        );
    }

    /// Returns true if a handler was removed.
    pub async fn unregister_handler(&self, process_instance_id: &str, activity_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .handlers
            .remove(&(process_instance_id.to_string(), activity_id.to_string()))
            .is_some()
    }

    pub async fn has_handler(&self, process_instance_id: &str, activity_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .handlers
            .contains_key(&(process_instance_id.to_string(), activity_id.to_string()))
    }

    // ─── Recording ────────────────────────────────────────────

    pub async fn record_execution(&self, input: RecordExecution) -> CompensationExecutionRecord {
        let mut inner = self.inner.lock().await;
        inner.next_sequence += 1;
        let record = CompensationExecutionRecord {
            sequence: inner.next_sequence,
            process_instance_id: input.process_instance_id,
            execution_id: input.execution_id,
            activity_id: input.activity_id,
            activity_type: input.activity_type,
            activity_name: input.activity_name,
            variable_snapshot: input.variable_snapshot,
            scope_id: input.scope_id,
            state: CompensationState::Pending,
            attempts: 0,
            recorded_at: Utc::now(),
        };
        debug!(
            process_instance_id = %record.process_instance_id,
            activity_id = %record.activity_id,
            sequence = record.sequence,
            "recorded compensable execution"
        );
        inner
            .records
            .entry(record.process_instance_id.clone())
            .or_default()
            .push(record.clone());
        record
    }

    pub async fn get_records(&self, process_instance_id: &str) -> Vec<CompensationExecutionRecord> {
        self.inner
            .lock()
            .await
            .records
            .get(process_instance_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn create_scope(
        &self,
        process_instance_id: &str,
        scope_id: &str,
        activity_id: Option<&str>,
        parent_scope_id: Option<&str>,
    ) -> Result<CompensationScope> {
        let mut inner = self.inner.lock().await;
        let scopes = inner
            .scopes
            .entry(process_instance_id.to_string())
            .or_default();

        if scopes.contains_key(scope_id) {
            return Err(EngineError::ScopeAlreadyExists(scope_id.to_string()));
        }

        let depth = match parent_scope_id {
            Some(parent_id) => {
                let parent = scopes
                    .get_mut(parent_id)
                    .ok_or_else(|| EngineError::ScopeNotFound(parent_id.to_string()))?;
                parent.child_scopes.push(scope_id.to_string());
                parent.depth + 1
            }
            None => 0,
        };

        let scope = CompensationScope {
            scope_id: scope_id.to_string(),
            process_instance_id: process_instance_id.to_string(),
            activity_id: activity_id.map(str::to_string),
            parent_scope_id: parent_scope_id.map(str::to_string),
            depth,
            child_scopes: Vec::new(),
            created_at: Utc::now(),
        };
        scopes.insert(scope_id.to_string(), scope.clone());
        Ok(scope)
    }

    pub async fn get_scope(&self, process_instance_id: &str, scope_id: &str) -> Option<CompensationScope> {
        self.inner
            .lock()
            .await
            .scopes
            .get(process_instance_id)
            .and_then(|s| s.get(scope_id))
            .cloned()
    }

    pub async fn subscribe(
        &self,
        process_instance_id: &str,
        activity_id: &str,
        boundary_event_id: Option<&str>,
    ) -> CompensationSubscription {
        let subscription = CompensationSubscription {
            process_instance_id: process_instance_id.to_string(),
            activity_id: activity_id.to_string(),
            boundary_event_id: boundary_event_id.map(str::to_string),
            subscribed_at: Utc::now(),
        };
        self.inner
            .lock()
            .await
            .subscriptions
            .entry(process_instance_id.to_string())
            .or_default()
            .push(subscription.clone());
        subscription
    }

    pub async fn get_subscriptions(&self, process_instance_id: &str) -> Vec<CompensationSubscription> {
        self.inner
            .lock()
            .await
            .subscriptions
            .get(process_instance_id)
            .cloned()
            .unwrap_or_default()
    }

    // ─── Compensation ─────────────────────────────────────────

    /// Undo pending and failed records, last recorded first.
    pub async fn compensate(
        &self,
        process_instance_id: &str,
        activity_id: Option<&str>,
        scope_id: Option<&str>,
    ) -> Result<Vec<CompensationReport>> {
        let plan = self
            .create_plan(process_instance_id, activity_id, scope_id)
            .await;
        self.execute_plan(&plan).await
    }

    /// Compute the compensation order without invoking anything.
    pub async fn create_plan(
        &self,
        process_instance_id: &str,
        activity_id: Option<&str>,
        scope_id: Option<&str>,
    ) -> CompensationPlan {
        let inner = self.inner.lock().await;
        let scope_filter = scope_id.map(|s| inner.scope_with_descendants(process_instance_id, s));

        let steps = inner
            .records
            .get(process_instance_id)
            .map(|records| {
                records
                    .iter()
                    .rev()
                    .filter(|r| r.state != CompensationState::Compensated)
                    .filter(|r| activity_id.map_or(true, |a| r.activity_id == a))
                    .filter(|r| match (&scope_filter, &r.scope_id) {
                        (None, _) => true,
                        (Some(scopes), Some(s)) => scopes.contains(s),
                        (Some(_), None) => false,
                    })
                    .map(|r| PlanStep {
                        sequence: r.sequence,
                        execution_id: r.execution_id.clone(),
                        activity_id: r.activity_id.clone(),
                        activity_type: r.activity_type.clone(),
                        scope_id: r.scope_id.clone(),
                        has_handler: inner.handlers.contains_key(&(
                            process_instance_id.to_string(),
                            r.activity_id.clone(),
                        )),
                    })
                    .collect()
            })
            .unwrap_or_default();

        CompensationPlan {
            plan_id: Uuid::new_v4(),
            process_instance_id: process_instance_id.to_string(),
            activity_id: activity_id.map(str::to_string),
            scope_id: scope_id.map(str::to_string),
            steps,
            created_at: Utc::now(),
        }
    }

    /// Run a plan step by step. A failed step is reported and marked FAILED;
    /// later steps still run.
    pub async fn execute_plan(&self, plan: &CompensationPlan) -> Result<Vec<CompensationReport>> {
        info!(
            process_instance_id = %plan.process_instance_id,
            steps = plan.steps.len(),
            "executing compensation plan"
        );
        let mut reports = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            let (record, handler) = {
                let mut inner = self.inner.lock().await;
                let handler = inner
                    .handlers
                    .get(&(plan.process_instance_id.clone(), step.activity_id.clone()))
                    .cloned();
                let Some(record) = inner.record_mut(&plan.process_instance_id, step.sequence)
                else {
                    // Cleaned up since the plan was made.
                    continue;
                };
                if record.state == CompensationState::Compensated {
                    continue;
                }
                (record.clone(), handler)
            };

            let Some(handler) = handler else {
                debug!(activity_id = %record.activity_id, "no compensation handler, skipping");
                self.finish(&record, CompensationState::Compensated, 0).await;
                reports.push(CompensationReport {
                    sequence: record.sequence,
                    execution_id: record.execution_id,
                    activity_id: record.activity_id,
                    success: true,
                    error: None,
                    skipped: true,
                    attempts: 0,
                });
                continue;
            };

            let policy = handler
                .config()
                .retry_policy
                .unwrap_or_else(|| self.default_policy.clone());
            let (result, attempts) = invoke_with_retry(handler.as_ref(), &record, &policy).await;

            let state = if result.success {
                CompensationState::Compensated
            } else {
                warn!(
                    process_instance_id = %record.process_instance_id,
                    activity_id = %record.activity_id,
                    attempts,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "compensation failed"
                );
                CompensationState::Failed
            };
            self.finish(&record, state, attempts).await;

            reports.push(CompensationReport {
                sequence: record.sequence,
                execution_id: record.execution_id,
                activity_id: record.activity_id,
                success: result.success,
                error: result.error,
                skipped: false,
                attempts,
            });
        }

        Ok(reports)
    }

    async fn finish(&self, record: &CompensationExecutionRecord, state: CompensationState, attempts: u32) {
        let mut inner = self.inner.lock().await;
        if let Some(r) = inner.record_mut(&record.process_instance_id, record.sequence) {
            r.state = state;
            r.attempts += attempts;
        }
    }

    /// Forget every record, scope, subscription and handler of an instance.
    pub async fn cleanup(&self, process_instance_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.records.remove(process_instance_id);
        inner.scopes.remove(process_instance_id);
        inner.subscriptions.remove(process_instance_id);
        inner.handlers.retain(|(pid, _), _| pid.as_str() != process_instance_id);
        debug!(process_instance_id, "compensation state cleaned up");
    }

    pub async fn get_statistics(&self) -> CompensationStatistics {
        let inner = self.inner.lock().await;
        let mut stats = CompensationStatistics {
            handlers: inner.handlers.len(),
            scopes: inner.scopes.values().map(|s| s.len()).sum(),
            subscriptions: inner.subscriptions.values().map(|s| s.len()).sum(),
            instances: inner.records.len(),
            ..Default::default()
        };

        for record in inner.records.values().flatten() {
            stats.total_records += 1;
            let per_type = stats
                .by_activity_type
                .entry(record.activity_type.clone())
                .or_default();
            per_type.recorded += 1;
            match record.state {
                CompensationState::Pending => {
                    stats.pending += 1;
                    per_type.pending += 1;
                }
                CompensationState::Compensated => {
                    stats.compensated += 1;
                    per_type.compensated += 1;
                }
                CompensationState::Failed => {
                    stats.failed += 1;
                    per_type.failed += 1;
                }
            }
        }
        stats
    }
}

async fn invoke_with_retry(
    handler: &dyn CompensationHandler,
    record: &CompensationExecutionRecord,
    policy: &RetryPolicy,
) -> (CompensationHandlerResult, u32) {
    let mut ctx = CompensationContext {
        process_instance_id: record.process_instance_id.clone(),
        execution_id: record.execution_id.clone(),
        activity_id: record.activity_id.clone(),
        activity_type: record.activity_type.clone(),
        activity_name: record.activity_name.clone(),
        variables: record.variable_snapshot.clone(),
        scope_id: record.scope_id.clone(),
        attempt: 0,
    };

    loop {
        ctx.attempt += 1;
        let result = handler.compensate(&ctx).await;
        if result.success || !result.retry || !policy.allows_another(ctx.attempt) {
            return (result, ctx.attempt);
        }
        let delay = policy.delay_for(ctx.attempt);
        debug!(
            activity_id = %ctx.activity_id,
            attempt = ctx.attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying compensation"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
