use crate::error::NodeError;
use crate::Value;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Reply from an AI model invocation.
#[derive(Debug, Clone)]
pub struct AiReply {
    pub output: Value,
    pub tokens_used: u64,
}

/// External AI model access, implemented by the surrounding proxy code.
/// Failures map onto `NodeError::Provider` / `NodeError::Timeout` so the
/// orchestrator's retry path treats them like any transient node failure.
#[async_trait]
pub trait AiGateway: Send + Sync {
    async fn invoke(
        &self,
        model: &str,
        prompt: &str,
        timeout: Duration,
    ) -> Result<AiReply, NodeError>;
}

/// Outbound side effects (send a message, raise an alert, ...), implemented
/// by the surrounding messaging code.
#[async_trait]
pub trait ActionGateway: Send + Sync {
    async fn dispatch(
        &self,
        action_type: &str,
        payload: HashMap<String, Value>,
    ) -> Result<(), NodeError>;
}
