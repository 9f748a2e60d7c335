//! bpmn-exec
//!
//! Execution core for BPMN-style process graphs: token traversal, exclusive,
//! parallel, inclusive and event-based gateways, fork/join bookkeeping,
//! guard expressions and scoped compensation.
//!
//! Definitions arrive already parsed (see [`types::ProcessDefinition`]);
//! everything else happens in memory behind the [`store::GatewayStateStore`]
//! trait.

pub mod compensation;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod expression;
pub mod gateway;
pub mod store;
pub mod store_memory;
pub mod telemetry;
pub mod types;

pub use compensation::{CompensationCoordinator, RetryPolicy};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EventBus};
pub use executor::ProcessExecutor;
pub use expression::ExpressionEvaluator;
pub use gateway::{GatewayDecision, GatewayExecutor, GatewayRequest};
pub use store::GatewayStateStore;
pub use store_memory::MemoryGatewayStateStore;
pub use types::{ExecutionContext, ProcessDefinition, Variables};
