use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-instance variable store threaded through node executions.
///
/// Globals are seeded once at instance creation (e.g. the trigger payload)
/// and are read-only afterwards. Everything else lives under a namespace
/// keyed by the id of the node that produced it, so concurrently executing
/// fork branches can never write the same slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    globals: HashMap<String, Value>,
    namespaces: HashMap<String, HashMap<String, Value>>,
}

impl ExecutionContext {
    pub fn new(globals: HashMap<String, Value>) -> Self {
        Self {
            globals,
            namespaces: HashMap::new(),
        }
    }

    /// Resolve a dot-separated path such as `trigger.text` or
    /// `classify.intent`. The first segment is looked up in the globals
    /// before falling back to node namespaces; globals shadow namespaces.
    pub fn get(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;

        let mut current = if let Some(global) = self.globals.get(head) {
            global.clone()
        } else {
            let key = segments.next()?;
            self.namespaces.get(head)?.get(key)?.clone()
        };

        for segment in segments {
            current = current.get(segment)?;
        }
        Some(current)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn global(&self, key: &str) -> Option<&Value> {
        self.globals.get(key)
    }

    /// Merge a node's output under its own namespace.
    pub fn merge_output(&mut self, node_id: &str, output: HashMap<String, Value>) {
        if output.is_empty() {
            return;
        }
        self.namespaces
            .entry(node_id.to_string())
            .or_default()
            .extend(output);
    }

    pub fn namespace(&self, node_id: &str) -> Option<&HashMap<String, Value>> {
        self.namespaces.get(node_id)
    }
}
