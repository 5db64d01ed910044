use crate::template;
use async_trait::async_trait;
use relaycore::{ActionGateway, ExecutorContext, NodeError, NodeExecutor, Outcome, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Dispatches an outbound side effect (send a message, raise an alert)
/// through the injected action gateway.
///
/// Config:
///   action_type (required) — gateway-understood action identifier
///   payload (optional) — object; string values support `{{path}}`
///     templating against the execution context
pub struct ActionExecutor {
    gateway: Arc<dyn ActionGateway>,
}

impl ActionExecutor {
    pub fn new(gateway: Arc<dyn ActionGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl NodeExecutor for ActionExecutor {
    fn type_id(&self) -> &'static str {
        "message.action"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        let action_type = ctx
            .require_config("action_type")?
            .as_str()
            .ok_or_else(|| NodeError::Configuration("action_type must be a string".to_string()))?
            .to_string();

        let mut payload = HashMap::new();
        if let Some(raw) = ctx.config.get("payload") {
            let entries = raw
                .clone()
                .into_entries()
                .ok_or_else(|| NodeError::Configuration("payload must be an object".to_string()))?;
            for (key, value) in entries {
                let resolved = match value.as_str() {
                    Some(text) => Value::String(template::render(text, &ctx.vars)),
                    None => value,
                };
                payload.insert(key, resolved);
            }
        }

        ctx.events.info(format!("dispatching {action_type}"));
        self.gateway.dispatch(&action_type, payload).await?;

        Ok(Outcome::completed()
            .with_output("dispatched", true)
            .with_output("action_type", action_type))
    }
}
