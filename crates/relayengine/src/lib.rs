//! Flow execution runtime.
//!
//! This crate provides the engine that runs flow instances: the executor
//! registry, the store seams (with in-memory implementations), the
//! orchestrator step loop, and the `FlowEngine` trigger-intake facade.

mod engine;
mod memory;
mod orchestrator;
mod registry;
mod stores;

pub use engine::{EngineConfig, FlowEngine};
pub use memory::{MemoryDefinitionStore, MemoryInstanceStore, MemoryLogSink};
pub use registry::ExecutorRegistry;
pub use stores::{DefinitionStore, InstanceStore, LogSink};
