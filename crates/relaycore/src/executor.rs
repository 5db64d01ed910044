use crate::error::NodeError;
use crate::events::EventEmitter;
use crate::{ExecutionContext, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Contract implemented by every node type.
///
/// Executors are stateless: everything they need arrives in the
/// [`ExecutorContext`], and everything they produce leaves through the
/// [`Outcome`] (or a [`NodeError`] for the failure arm, which the
/// orchestrator feeds into the node's retry policy).
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Registry key, e.g. "ai.invoke" or "time.delay".
    fn type_id(&self) -> &'static str;

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError>;
}

/// Everything a node executor sees for one attempt.
#[derive(Clone)]
pub struct ExecutorContext {
    pub node_id: String,
    /// 1-based attempt number for this node visit.
    pub attempt: u32,
    /// Static node configuration from the definition.
    pub config: HashMap<String, Value>,
    /// Read view of the instance's execution context.
    pub vars: ExecutionContext,
    /// Present when the node is re-entered after a suspension.
    pub resume: Option<Value>,
    pub events: EventEmitter,
    pub cancellation: CancellationToken,
}

impl ExecutorContext {
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("missing config: {name}")))
    }

    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    /// Resolve a dot-separated path against the execution context.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        self.vars.get(path)
    }
}

/// Result of a node execution attempt.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Node finished; the output is merged into the context under the
    /// node's namespace and the orchestrator advances via outgoing edges.
    Completed { output: HashMap<String, Value> },
    /// Node is waiting on an external event or timer. The instance is
    /// persisted as suspended and re-entered via resume, with the timeout
    /// (if any) firing a synthetic timed-out resume.
    Suspended {
        resume_key: String,
        timeout: Option<Duration>,
    },
}

impl Outcome {
    pub fn completed() -> Self {
        Outcome::Completed {
            output: HashMap::new(),
        }
    }

    pub fn with_output(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        match self {
            Outcome::Completed { mut output } => {
                output.insert(key.into(), value.into());
                Outcome::Completed { output }
            }
            suspended => suspended,
        }
    }
}
