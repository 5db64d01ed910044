use relaycore::{FlowDefinition, FlowGraphError, NodeExecutor};
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of available node executors, keyed by type id.
///
/// Read-mostly: populated at startup, shared behind an `Arc`, and safe for
/// concurrent resolution once definitions are loaded. Registering the same
/// type id again replaces the executor, which keeps the built-in set open
/// for overrides.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        let type_id = executor.type_id().to_string();
        tracing::info!("registering node type: {}", type_id);
        self.executors.insert(type_id, executor);
    }

    pub fn resolve(&self, type_id: &str) -> Result<Arc<dyn NodeExecutor>, FlowGraphError> {
        self.executors
            .get(type_id)
            .cloned()
            .ok_or_else(|| FlowGraphError::UnregisteredNodeType(type_id.to_string()))
    }

    /// Pre-start check: every node type a definition references must
    /// resolve, so an unregistered type is rejected before an instance is
    /// created rather than mid-execution.
    pub fn verify_definition(&self, definition: &FlowDefinition) -> Result<(), FlowGraphError> {
        for node in &definition.nodes {
            let type_id = node.kind.type_id();
            if !self.executors.contains_key(type_id) {
                return Err(FlowGraphError::UnregisteredNodeType(type_id.to_string()));
            }
        }
        Ok(())
    }

    pub fn list_types(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }
}
