use crate::error::Result;
use crate::types::ForkFrame;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Gateway state ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStateKind {
    Fork,
    Join,
}

/// Fork/join bookkeeping for one gateway activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayState {
    pub id: Uuid,
    pub process_instance_id: String,
    pub execution_id: Option<String>,
    pub gateway_id: String,
    pub gateway_type: GatewayStateKind,
    pub active_branches: u32,
    pub completed_branches: u32,
    /// Selected targets (forks only).
    pub branch_targets: Vec<String>,
    pub is_active: bool,
    /// For joins: the fork state that scopes this join.
    pub correlation_id: Option<Uuid>,
    /// For joins: fork frames shared by every arrival so far, `None` before
    /// the first arrival.
    #[serde(default)]
    pub arrived_frames: Option<Vec<ForkFrame>>,
    /// Activation counter per (instance, gateway); increases on every new state.
    pub generation: u32,
    pub created_at: DateTime<Utc>,
}

impl GatewayState {
    pub fn is_resolved(&self) -> bool {
        self.completed_branches >= self.active_branches
    }
}

/// Input for a fork state.
#[derive(Clone, Debug)]
pub struct NewForkState {
    pub process_instance_id: String,
    pub execution_id: Option<String>,
    pub gateway_id: String,
    pub branch_targets: Vec<String>,
}

/// Input for a join state. `correlation_id` names the fork being joined.
#[derive(Clone, Debug)]
pub struct NewJoinState {
    pub process_instance_id: String,
    pub execution_id: Option<String>,
    pub gateway_id: String,
    pub active_branches: u32,
    pub correlation_id: Option<Uuid>,
}

/// Persistence for gateway fork/join bookkeeping.
///
/// The executor only talks to this trait, so the in-memory implementation can
/// be swapped for a transactional store keyed the same way. Implementations
/// must make `increment_completed_branches` a single atomic read-modify-write.
#[async_trait]
pub trait GatewayStateStore: Send + Sync {
    async fn create_fork_state(&self, new: NewForkState) -> Result<GatewayState>;

    /// Get-or-create: returns the active join state for
    /// (instance, gateway, correlation) if one exists.
    async fn create_join_state(&self, new: NewJoinState) -> Result<GatewayState>;

    async fn get_join_state(
        &self,
        process_instance_id: &str,
        gateway_id: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<Option<GatewayState>>;

    async fn get_state(&self, id: Uuid) -> Result<Option<GatewayState>>;

    /// Atomically add one completed branch. A join that reaches its expected
    /// count is marked inactive in the same step.
    async fn increment_completed_branches(&self, id: Uuid) -> Result<GatewayState>;

    /// `increment_completed_branches` that also folds the arriving token's
    /// fork frames into `arrived_frames`, in the same atomic step.
    async fn record_arrival(&self, id: Uuid, frames: &[ForkFrame]) -> Result<GatewayState>;

    /// Mark a state inactive. Idempotent.
    async fn complete_state(&self, id: Uuid) -> Result<()>;

    /// Active states for an instance, most recently created first.
    async fn get_active_states(&self, process_instance_id: &str) -> Result<Vec<GatewayState>>;

    /// Drop every state of an instance. Returns how many were removed.
    async fn delete_by_process_instance(&self, process_instance_id: &str) -> Result<usize>;

    /// Every state of an instance, active or not, oldest first.
    async fn get_states(&self, process_instance_id: &str) -> Result<Vec<GatewayState>>;

    /// Replace every state of an instance with `states`, as returned by
    /// `get_states`. Used to undo the writes of a failed step.
    async fn restore_states(
        &self,
        process_instance_id: &str,
        states: Vec<GatewayState>,
    ) -> Result<()>;
}
