use crate::{InstanceId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Append-only audit record for one node visit. A node revisited through a
/// loop edge or a retry produces a new entry, never an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub instance_id: InstanceId,
    pub node_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: LogOutcome,
    /// Node configuration as resolved for this visit.
    pub input: HashMap<String, Value>,
    pub output: HashMap<String, Value>,
    pub error: Option<String>,
}

impl ExecutionLogEntry {
    pub fn success(
        instance_id: InstanceId,
        node_id: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        input: HashMap<String, Value>,
        output: HashMap<String, Value>,
    ) -> Self {
        Self {
            instance_id,
            node_id: node_id.into(),
            attempt,
            started_at,
            ended_at: Utc::now(),
            outcome: LogOutcome::Success,
            input,
            output,
            error: None,
        }
    }

    pub fn failure(
        instance_id: InstanceId,
        node_id: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        input: HashMap<String, Value>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            node_id: node_id.into(),
            attempt,
            started_at,
            ended_at: Utc::now(),
            outcome: LogOutcome::Failure,
            input,
            output: HashMap::new(),
            error: Some(error.into()),
        }
    }

    /// Entry for a step replayed from the instance's step record without
    /// re-executing the node.
    pub fn skipped(instance_id: InstanceId, node_id: impl Into<String>, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            node_id: node_id.into(),
            attempt,
            started_at: now,
            ended_at: now,
            outcome: LogOutcome::Skipped,
            input: HashMap::new(),
            output: HashMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Success,
    Failure,
    Skipped,
}
