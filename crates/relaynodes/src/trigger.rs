use async_trait::async_trait;
use relaycore::{ExecutorContext, NodeError, NodeExecutor, Outcome};

/// Entry node. The trigger payload is already seeded as the read-only
/// `trigger` global at instance creation, so execution is a pass-through.
pub struct TriggerExecutor;

#[async_trait]
impl NodeExecutor for TriggerExecutor {
    fn type_id(&self) -> &'static str {
        "flow.trigger"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        ctx.events.info("instance triggered");
        Ok(Outcome::completed())
    }
}

/// Structural fork marker; the orchestrator owns the branch bookkeeping.
pub struct ForkExecutor;

#[async_trait]
impl NodeExecutor for ForkExecutor {
    fn type_id(&self) -> &'static str {
        "flow.fork"
    }

    async fn execute(&self, _ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        Ok(Outcome::completed())
    }
}

/// Structural join marker; reached only once every fork branch completed.
pub struct JoinExecutor;

#[async_trait]
impl NodeExecutor for JoinExecutor {
    fn type_id(&self) -> &'static str {
        "flow.join"
    }

    async fn execute(&self, _ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        Ok(Outcome::completed())
    }
}

/// Terminal marker. The terminal disposition lives on the node kind in the
/// definition; the orchestrator sets the instance status from it.
pub struct TerminalExecutor;

#[async_trait]
impl NodeExecutor for TerminalExecutor {
    fn type_id(&self) -> &'static str {
        "flow.terminal"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        match ctx.config.get("code").and_then(|v| v.as_str()) {
            Some(code) => Ok(Outcome::completed().with_output("code", code)),
            None => Ok(Outcome::completed()),
        }
    }
}
