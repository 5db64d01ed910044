use crate::template;
use async_trait::async_trait;
use relaycore::{AiGateway, ExecutorContext, NodeError, NodeExecutor, Outcome, Value};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Calls an external AI model through the injected gateway.
///
/// Config:
///   model (required) — model reference understood by the gateway
///   prompt (required) — template with `{{path}}` placeholders resolved
///     from the execution context
///   timeout_ms (optional, default 30000)
///
/// An object-shaped reply merges key by key into the node's namespace
/// (so `classify` producing `{"intent": ...}` is addressable as
/// `classify.intent`); anything else lands under `output`. `tokens_used`
/// is always recorded.
pub struct AiInvokeExecutor {
    gateway: Arc<dyn AiGateway>,
}

impl AiInvokeExecutor {
    pub fn new(gateway: Arc<dyn AiGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl NodeExecutor for AiInvokeExecutor {
    fn type_id(&self) -> &'static str {
        "ai.invoke"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        let model = ctx
            .require_config("model")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("model must be a string".to_string()))?
            .to_string();
        let prompt_template = ctx
            .require_config("prompt")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("prompt must be a string".to_string()))?
            .to_string();
        let timeout = Duration::from_millis(
            ctx.config
                .get("timeout_ms")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        );

        let prompt = template::render(&prompt_template, &ctx.vars);
        ctx.events.info(format!("invoking model {model}"));
        let reply = self.gateway.invoke(&model, &prompt, timeout).await?;

        let mut outcome = Outcome::completed();
        match reply.output.clone().into_entries() {
            Some(entries) => {
                for (key, value) in entries {
                    outcome = outcome.with_output(key, value);
                }
            }
            None => outcome = outcome.with_output("output", reply.output),
        }
        Ok(outcome.with_output("tokens_used", Value::from(reply.tokens_used)))
    }
}
