//! Core abstractions for the relay flow engine.
//!
//! This crate provides the fundamental types and traits that the runtime
//! and the node library depend on: flow definitions, execution contexts,
//! instances, audit log entries, the executor contract, gateway seams, and
//! the error taxonomy. It carries no engine logic.

mod context;
mod definition;
mod error;
pub mod events;
mod executor;
mod gateways;
pub mod guard;
mod instance;
mod log;
mod value;

pub use context::ExecutionContext;
pub use definition::{
    Edge, FlowDefinition, FlowDefinitionSummary, NodeKind, NodeSpec, RetryPolicy,
    TerminalOutcome, TriggerType,
};
pub use error::{EngineError, FlowGraphError, NodeError, StoreError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, NodeSignal};
pub use executor::{ExecutorContext, NodeExecutor, Outcome};
pub use gateways::{ActionGateway, AiGateway, AiReply};
pub use guard::{Guard, GuardError};
pub use instance::{
    BranchState, BranchStatus, FlowInstance, ForkLedger, InstanceId, InstanceStatus, StepRecord,
};
pub use log::{ExecutionLogEntry, LogOutcome};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, EngineError>;
