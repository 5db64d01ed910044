use async_trait::async_trait;
use relaycore::{ExecutorContext, NodeError, NodeExecutor, Outcome, Value};

/// Side-effect-free routing node. The real branching happens on the node's
/// outgoing edge guards; this executor only (optionally) projects context
/// paths into its own namespace so guards can reference them under a
/// stable name.
///
/// Config:
///   expose (optional) — object mapping output key to a context path, e.g.
///     { "intent": "classify.intent" }
pub struct BranchExecutor;

#[async_trait]
impl NodeExecutor for BranchExecutor {
    fn type_id(&self) -> &'static str {
        "flow.branch"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        let mut outcome = Outcome::completed();
        if let Some(expose) = ctx.config.get("expose") {
            let entries = expose
                .clone()
                .into_entries()
                .ok_or_else(|| NodeError::Configuration("expose must be an object".to_string()))?;
            for (key, path) in entries {
                let path = path
                    .as_str()
                    .ok_or_else(|| {
                        NodeError::Configuration(format!("expose.{key} must be a path string"))
                    })?
                    .to_string();
                let value = ctx.lookup(&path).unwrap_or(Value::Null);
                outcome = outcome.with_output(key, value);
            }
        }
        Ok(outcome)
    }
}
