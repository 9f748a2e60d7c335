use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::types::Variables;

// ─── Retry policy ─────────────────────────────────────────────

/// How often a failing, retryable compensation is re-invoked.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries until the handler
    /// succeeds or reports a non-retryable failure.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately and without limit.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, multiplier: f64, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.backoff_multiplier = multiplier;
        self.max_backoff = max;
        self
    }

    /// Whether another attempt may follow `attempts_made` attempts.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

// ─── Records, scopes, subscriptions ───────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationState {
    Pending,
    Compensated,
    Failed,
}

/// One compensable completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationExecutionRecord {
    /// Coordinator-wide, strictly increasing in recording order.
    pub sequence: u64,
    pub process_instance_id: String,
    pub execution_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub activity_name: Option<String>,
    pub variable_snapshot: Variables,
    pub scope_id: Option<String>,
    pub state: CompensationState,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Arguments of `record_execution`.
#[derive(Clone, Debug)]
pub struct RecordExecution {
    pub process_instance_id: String,
    pub execution_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub activity_name: Option<String>,
    pub variable_snapshot: Variables,
    pub scope_id: Option<String>,
}

impl RecordExecution {
    pub fn new(
        process_instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
    ) -> Self {
        Self {
            process_instance_id: process_instance_id.into(),
            execution_id: execution_id.into(),
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            activity_name: None,
            variable_snapshot: Variables::new(),
            scope_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.activity_name = Some(name.into());
        self
    }

    pub fn with_snapshot(mut self, variables: Variables) -> Self {
        self.variable_snapshot = variables;
        self
    }

    pub fn in_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationScope {
    pub scope_id: String,
    pub process_instance_id: String,
    pub activity_id: Option<String>,
    pub parent_scope_id: Option<String>,
    /// 0 for a root scope.
    pub depth: u32,
    pub child_scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Declares an activity compensable before it completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationSubscription {
    pub process_instance_id: String,
    pub activity_id: String,
    pub boundary_event_id: Option<String>,
    pub subscribed_at: DateTime<Utc>,
}

// ─── Handlers ─────────────────────────────────────────────────

/// What a handler sees when asked to undo one completion.
#[derive(Clone, Debug, PartialEq)]
pub struct CompensationContext {
    pub process_instance_id: String,
    pub execution_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub activity_name: Option<String>,
    pub variables: Variables,
    pub scope_id: Option<String>,
    /// 1 on the first invocation.
    pub attempt: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationHandlerResult {
    pub success: bool,
    pub error: Option<String>,
    /// Only meaningful on failure.
    #[serde(default)]
    pub retry: bool,
}

impl CompensationHandlerResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retry: false,
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retry: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandlerConfig {
    /// Overrides the coordinator's policy for this handler.
    pub retry_policy: Option<RetryPolicy>,
    pub description: Option<String>,
}

/// Undo logic for one activity of one instance.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(&self, ctx: &CompensationContext) -> CompensationHandlerResult;

    fn config(&self) -> HandlerConfig {
        HandlerConfig::default()
    }
}

/// Adapts a plain closure into a [`CompensationHandler`].
pub struct FnHandler<F> {
    f: F,
    config: HandlerConfig,
}

impl<F> FnHandler<F>
where
    F: Fn(&CompensationContext) -> CompensationHandlerResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            config: HandlerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<F> CompensationHandler for FnHandler<F>
where
    F: Fn(&CompensationContext) -> CompensationHandlerResult + Send + Sync,
{
    async fn compensate(&self, ctx: &CompensationContext) -> CompensationHandlerResult {
        (self.f)(ctx)
    }

    fn config(&self) -> HandlerConfig {
        self.config.clone()
    }
}

// ─── Plans and reports ────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStep {
    pub sequence: u64,
    pub execution_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub scope_id: Option<String>,
    pub has_handler: bool,
}

/// Compensation order computed ahead of invocation, for audit or dry runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationPlan {
    pub plan_id: Uuid,
    pub process_instance_id: String,
    pub activity_id: Option<String>,
    pub scope_id: Option<String>,
    /// Last recorded first.
    pub steps: Vec<PlanStep>,
    pub created_at: DateTime<Utc>,
}

impl CompensationPlan {
    pub fn activity_order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.activity_id.as_str()).collect()
    }
}

/// Outcome for one record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationReport {
    pub sequence: u64,
    pub execution_id: String,
    pub activity_id: String,
    pub success: bool,
    pub error: Option<String>,
    /// No handler was registered; nothing ran.
    pub skipped: bool,
    pub attempts: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityTypeStats {
    pub recorded: usize,
    pub pending: usize,
    pub compensated: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationStatistics {
    pub total_records: usize,
    pub pending: usize,
    pub compensated: usize,
    pub failed: usize,
    pub handlers: usize,
    pub scopes: usize,
    pub subscriptions: usize,
    pub instances: usize,
    pub by_activity_type: BTreeMap<String, ActivityTypeStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default().with_backoff(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(350),
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn attempt_limits() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        assert!(policy.allows_another(1));
        assert!(!policy.allows_another(2));
        assert!(RetryPolicy::unbounded().allows_another(u32::MAX));
        assert_eq!(RetryPolicy::unbounded().delay_for(10), Duration::ZERO);
    }
}
