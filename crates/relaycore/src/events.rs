use crate::{InstanceId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Events emitted during instance execution, fanned out to any subscriber
/// (dashboards, metrics bridges, tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    InstanceStarted {
        instance_id: InstanceId,
        definition_id: String,
        timestamp: DateTime<Utc>,
    },
    InstanceCompleted {
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
    InstanceFailed {
        instance_id: InstanceId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    InstanceSuspended {
        instance_id: InstanceId,
        node_id: String,
        resume_key: String,
        timestamp: DateTime<Utc>,
    },
    InstanceResumed {
        instance_id: InstanceId,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        instance_id: InstanceId,
        node_id: String,
        node_type: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        instance_id: InstanceId,
        node_id: String,
        attempt: u32,
        outputs: HashMap<String, Value>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        instance_id: InstanceId,
        node_id: String,
        attempt: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeEvent {
        instance_id: InstanceId,
        node_id: String,
        event: NodeSignal,
        timestamp: DateTime<Utc>,
    },
}

/// Node-scoped signals for real-time observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum NodeSignal {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Emitter handed to node executors for real-time updates.
#[derive(Clone)]
pub struct EventEmitter {
    instance_id: InstanceId,
    node_id: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        instance_id: InstanceId,
        node_id: String,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            instance_id,
            node_id,
            sender,
        }
    }

    pub fn emit(&self, event: NodeSignal) {
        let _ = self.sender.send(ExecutionEvent::NodeEvent {
            instance_id: self.instance_id,
            node_id: self.node_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(NodeSignal::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(NodeSignal::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeSignal::Progress { percent, message });
    }
}

/// In-process broadcast bus for execution events.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, instance_id: InstanceId, node_id: impl Into<String>) -> EventEmitter {
        EventEmitter::new(instance_id, node_id.into(), self.sender.clone())
    }
}
