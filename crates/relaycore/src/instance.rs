use crate::{ExecutionContext, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub type InstanceId = Uuid;

/// One live or completed execution of a flow definition.
///
/// Mutated exclusively by the orchestrator under the instance execution
/// lock; persisted through the instance store with optimistic concurrency
/// (`store_version`). Terminal statuses are final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: InstanceId,
    pub definition_id: String,
    pub definition_version: u32,
    pub status: InstanceStatus,
    pub current_node: String,
    /// 1-based attempt counter for the current node.
    pub attempt: u32,
    pub context: ExecutionContext,
    /// Persisted join barrier for an in-progress fork, if any.
    pub fork: Option<ForkLedger>,
    /// Most recent completed step, kept for idempotent step replay.
    pub last_step: Option<StepRecord>,
    /// Payload handed to the suspended node when it is re-entered.
    pub pending_resume: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Wall-clock budget for the whole instance.
    pub deadline: DateTime<Utc>,
    /// Accumulated node execution time.
    pub processing_ms: u64,
    /// Optimistic-concurrency version, bumped by every store save.
    pub store_version: u64,
}

impl FlowInstance {
    pub fn new(
        definition_id: impl Into<String>,
        definition_version: u32,
        entry_node: impl Into<String>,
        context: ExecutionContext,
        deadline: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            definition_version,
            status: InstanceStatus::Running,
            current_node: entry_node.into(),
            attempt: 1,
            context,
            fork: None,
            last_step: None,
            pending_resume: None,
            started_at: now,
            updated_at: now,
            deadline,
            processing_ms: 0,
            store_version: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            InstanceStatus::Completed | InstanceStatus::Failed { .. }
        )
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.status, InstanceStatus::Suspended { .. })
    }

    /// Transition to `Failed`. Terminal statuses are never overwritten.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.is_terminal() {
            self.status = InstanceStatus::Failed {
                reason: reason.into(),
            };
            self.touch();
        }
    }

    pub fn complete(&mut self) {
        if !self.is_terminal() {
            self.status = InstanceStatus::Completed;
            self.touch();
        }
    }

    pub fn suspend(&mut self, resume_key: impl Into<String>, timeout_at: Option<DateTime<Utc>>) {
        if !self.is_terminal() {
            self.status = InstanceStatus::Suspended {
                resume_key: resume_key.into(),
                timeout_at,
            };
            self.touch();
        }
    }

    /// Advance to the next node, resetting the attempt counter. The step
    /// record is cleared: its crash-replay window ends once the advance is
    /// persisted, and a loop edge revisiting the node must re-execute it.
    pub fn advance_to(&mut self, node_id: impl Into<String>) {
        self.current_node = node_id.into();
        self.attempt = 1;
        self.last_step = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn fail_reason(&self) -> Option<&str> {
        match &self.status {
            InstanceStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Instance status state machine:
/// `running -> suspended -> running (resume) -> completed | failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Suspended {
        resume_key: String,
        timeout_at: Option<DateTime<Utc>>,
    },
    Completed,
    Failed {
        reason: String,
    },
}

/// Completed step keyed by `(node, attempt)`. Re-invoking the step for the
/// same key replays this record instead of re-executing the node, so a
/// crash between side effect and advance cannot double-fire an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub node_id: String,
    pub attempt: u32,
    pub output: HashMap<String, Value>,
}

/// Join barrier for an in-progress fork, persisted on the instance so that
/// branch completions survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkLedger {
    pub fork_node: String,
    pub join_node: String,
    pub branches: Vec<BranchState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchState {
    pub index: usize,
    pub entry_node: String,
    pub status: BranchStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchStatus {
    Running,
    Completed {
        /// Namespaced context writes produced by the branch, merged into
        /// the parent context only once every branch has completed.
        writes: HashMap<String, HashMap<String, Value>>,
    },
    Failed {
        reason: String,
    },
}
