//! Engine events and the broadcast bus that carries them to logging, audit
//! and notification collaborators.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Events published by the process and expression layers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    ProcessStart {
        process_instance_id: String,
        process_definition_id: String,
        business_key: String,
    },
    ProcessStarted {
        process_instance_id: String,
    },
    ProcessContinue {
        process_instance_id: String,
        task_id: Option<String>,
    },
    ProcessSuspend {
        process_instance_id: String,
        element_id: Option<String>,
    },
    ProcessSuspended {
        process_instance_id: String,
        element_ids: Vec<String>,
    },
    ProcessResume {
        process_instance_id: String,
        element_id: Option<String>,
    },
    ProcessResumed {
        process_instance_id: String,
        element_ids: Vec<String>,
    },
    ProcessEnd {
        process_instance_id: String,
    },
    ProcessTerminate {
        process_instance_id: String,
        reason: Option<String>,
    },
    ProcessTerminated {
        process_instance_id: String,
        reason: Option<String>,
    },
    TaskCreated {
        process_instance_id: String,
        task_id: String,
        task_name: Option<String>,
    },
    ExpressionEvaluateStart {
        expression: String,
    },
    ExpressionEvaluateEnd {
        expression: String,
        result: Option<serde_json::Value>,
    },
    ExpressionEvaluateError {
        expression: String,
        error: String,
    },
}

impl EngineEvent {
    /// Dotted event name (`process.start`, `task.created`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ProcessStart { .. } => "process.start",
            EngineEvent::ProcessStarted { .. } => "process.started",
            EngineEvent::ProcessContinue { .. } => "process.continue",
            EngineEvent::ProcessSuspend { .. } => "process.suspend",
            EngineEvent::ProcessSuspended { .. } => "process.suspended",
            EngineEvent::ProcessResume { .. } => "process.resume",
            EngineEvent::ProcessResumed { .. } => "process.resumed",
            EngineEvent::ProcessEnd { .. } => "process.end",
            EngineEvent::ProcessTerminate { .. } => "process.terminate",
            EngineEvent::ProcessTerminated { .. } => "process.terminated",
            EngineEvent::TaskCreated { .. } => "task.created",
            EngineEvent::ExpressionEvaluateStart { .. } => "expression.evaluate.start",
            EngineEvent::ExpressionEvaluateEnd { .. } => "expression.evaluate.end",
            EngineEvent::ExpressionEvaluateError { .. } => "expression.evaluate.error",
        }
    }

    /// Instance the event belongs to. Expression events are instance-agnostic.
    pub fn process_instance_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ProcessStart {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessStarted {
                process_instance_id,
            }
            | EngineEvent::ProcessContinue {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessSuspend {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessSuspended {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessResume {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessResumed {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessEnd {
                process_instance_id,
            }
            | EngineEvent::ProcessTerminate {
                process_instance_id,
                ..
            }
            | EngineEvent::ProcessTerminated {
                process_instance_id,
                ..
            }
            | EngineEvent::TaskCreated {
                process_instance_id,
                ..
            } => Some(process_instance_id),
            EngineEvent::ExpressionEvaluateStart { .. }
            | EngineEvent::ExpressionEvaluateEnd { .. }
            | EngineEvent::ExpressionEvaluateError { .. } => None,
        }
    }
}

/// Broadcast bus for engine events.
///
/// Slow subscribers lose the oldest events once their buffer is full;
/// publishing never blocks the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn publish(&self, event: EngineEvent) -> usize {
        debug!(event = event.name(), instance = ?event.process_instance_id(), "engine event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn publish_batch(&self, events: Vec<EngineEvent>) -> usize {
        events.into_iter().map(|e| self.publish(e)).sum()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
