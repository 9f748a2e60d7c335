//! Engine error types
//!
//! Every public operation returns `Result<T, EngineError>`. Variants are grouped
//! the way callers need to react to them: not-found, validation, evaluation,
//! concurrency/state and compensation.

use uuid::Uuid;

use crate::expression::ExpressionError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Not found ──
    #[error("Process instance not found: {0}")]
    ProcessInstanceNotFound(String),

    #[error("Element not found in definition {definition_id}: {element_id}")]
    ElementNotFound {
        definition_id: String,
        element_id: String,
    },

    #[error("Gateway state not found: {0}")]
    GatewayStateNotFound(Uuid),

    #[error("Compensation scope not found: {0}")]
    ScopeNotFound(String),

    // ── Validation ──
    #[error("Process definition {0} has no start event")]
    NoStartEvent(String),

    #[error("Gateway {0} has no outgoing flow")]
    NoOutgoingFlow(String),

    #[error("Gateway {0}: no condition satisfied and no default flow")]
    NoSatisfiedFlow(String),

    #[error("Gateway {0}: join requires a process instance id")]
    MissingProcessInstanceId(String),

    #[error("Invalid process definition: {0}")]
    InvalidDefinition(String),

    #[error("Compensation scope already exists: {0}")]
    ScopeAlreadyExists(String),

    // ── Evaluation ──
    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    // ── Concurrency / state ──
    #[error("Gateway state {state_id}: completed branches would exceed {active_branches}")]
    BranchCountExceeded { state_id: Uuid, active_branches: u32 },

    #[error("Gateway state {0} already resolved")]
    JoinAlreadyResolved(Uuid),

    #[error("Process instance {0} has ended")]
    InstanceEnded(String),

    #[error("No active token waits at {element_id} in instance {process_instance_id}")]
    TaskNotActive {
        process_instance_id: String,
        element_id: String,
    },

    #[error("Token at {element_id} in instance {process_instance_id} is suspended")]
    TokenSuspended {
        process_instance_id: String,
        element_id: String,
    },

    #[error("Process instance {0} has no suspended element")]
    NoSuspendedElement(String),

    #[error("Process instance {process_instance_id}: traversal exceeded {limit} steps")]
    TraversalLimitExceeded {
        process_instance_id: String,
        limit: usize,
    },
}

impl EngineError {
    /// True for errors that name something missing (instance, element, state, scope).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ProcessInstanceNotFound(_)
                | EngineError::ElementNotFound { .. }
                | EngineError::GatewayStateNotFound(_)
                | EngineError::ScopeNotFound(_)
        )
    }
}
