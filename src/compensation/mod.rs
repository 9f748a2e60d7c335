//! Compensation Coordinator
//!
//! Keeps an ordered log of compensable completions per process instance and,
//! on demand, invokes the registered undo handlers in reverse order. Records
//! can be tagged with a scope; scopes form a tree per instance so compensating
//! a scope also covers everything nested inside it.

pub mod coordinator;
pub mod types;

pub use coordinator::CompensationCoordinator;
pub use types::*;
