use async_trait::async_trait;
use relaycore::{ExecutorContext, NodeError, NodeExecutor, Outcome};
use std::time::Duration;

/// Suspends the instance on a timer.
///
/// First entry returns `Suspended` with a timer resume key; the engine
/// schedules an auto-resume carrying `{"timed_out": true}` when the timer
/// fires. A manual resume before the timer wins and its payload flows
/// through instead. Re-entry completes with the resume payload in the
/// node's namespace.
///
/// Config:
///   delay_ms (optional, default 1000)
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    fn type_id(&self) -> &'static str {
        "time.delay"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        if let Some(payload) = ctx.resume.clone() {
            let timed_out = payload
                .get("timed_out")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            return Ok(Outcome::completed()
                .with_output("resumed", payload)
                .with_output("timed_out", timed_out));
        }

        let delay_ms = ctx
            .config
            .get("delay_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(1000);
        ctx.events.info(format!("waiting {delay_ms}ms"));
        Ok(Outcome::Suspended {
            resume_key: format!("timer:{}:{}", ctx.node_id, ctx.attempt),
            timeout: Some(Duration::from_millis(delay_ms)),
        })
    }
}
