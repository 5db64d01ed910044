//! Built-in node executor library.
//!
//! One executor per spec'd node variant, registered against the type ids
//! the definition kinds map to. Side-effecting executors take their
//! gateway collaborators by injection.

mod action;
mod ai;
mod branch;
mod delay;
mod template;
mod trigger;

pub use action::ActionExecutor;
pub use ai::AiInvokeExecutor;
pub use branch::BranchExecutor;
pub use delay::DelayExecutor;
pub use template::render;
pub use trigger::{ForkExecutor, JoinExecutor, TerminalExecutor, TriggerExecutor};

use relaycore::{ActionGateway, AiGateway};
use relayengine::ExecutorRegistry;
use std::sync::Arc;

/// Register every built-in executor with a registry.
pub fn register_builtins(
    registry: &mut ExecutorRegistry,
    ai_gateway: Arc<dyn AiGateway>,
    action_gateway: Arc<dyn ActionGateway>,
) {
    registry.register(Arc::new(TriggerExecutor));
    registry.register(Arc::new(BranchExecutor));
    registry.register(Arc::new(ActionExecutor::new(action_gateway)));
    registry.register(Arc::new(AiInvokeExecutor::new(ai_gateway)));
    registry.register(Arc::new(DelayExecutor));
    registry.register(Arc::new(ForkExecutor));
    registry.register(Arc::new(JoinExecutor));
    registry.register(Arc::new(TerminalExecutor));
}
