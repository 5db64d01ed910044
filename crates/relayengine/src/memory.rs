use crate::stores::{DefinitionStore, InstanceStore, LogSink};
use async_trait::async_trait;
use relaycore::{
    ExecutionLogEntry, FlowDefinition, FlowDefinitionSummary, FlowInstance, InstanceId, StoreError,
};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-memory definition store keyed by id and version.
#[derive(Default)]
pub struct MemoryDefinitionStore {
    definitions: RwLock<HashMap<String, BTreeMap<u32, FlowDefinition>>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, definition: FlowDefinition) {
        let mut definitions = self.definitions.write().await;
        definitions
            .entry(definition.id.clone())
            .or_default()
            .insert(definition.version, definition);
    }
}

#[async_trait]
impl DefinitionStore for MemoryDefinitionStore {
    async fn get(&self, id: &str, version: Option<u32>) -> Result<FlowDefinition, StoreError> {
        let definitions = self.definitions.read().await;
        let versions = definitions
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let found = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        found
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{id}@{version:?}")))
    }

    async fn list_active(&self) -> Result<Vec<FlowDefinitionSummary>, StoreError> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .filter_map(|versions| versions.values().next_back())
            .map(|d| FlowDefinitionSummary {
                id: d.id.clone(),
                version: d.version,
                name: d.name.clone(),
                trigger: d.trigger.clone(),
            })
            .collect())
    }
}

/// In-memory instance store with compare-and-swap versioning.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: RwLock<HashMap<InstanceId, FlowInstance>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn create(&self, instance: FlowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id, instance);
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<FlowInstance, StoreError> {
        let instances = self.instances.read().await;
        instances
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn save(
        &self,
        instance: &FlowInstance,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(&instance.id)
            .ok_or_else(|| StoreError::NotFound(instance.id.to_string()))?;
        if stored.store_version != expected_version {
            return Err(StoreError::Conflict {
                expected: expected_version,
                actual: stored.store_version,
            });
        }
        let mut updated = instance.clone();
        updated.store_version = expected_version + 1;
        let new_version = updated.store_version;
        *stored = updated;
        Ok(new_version)
    }

    async fn list_active(&self) -> Result<Vec<FlowInstance>, StoreError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| !i.is_terminal())
            .cloned()
            .collect())
    }
}

/// In-memory append-only log sink.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: RwLock<Vec<ExecutionLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ExecutionLogEntry> {
        self.entries.read().await.clone()
    }

    pub async fn entries_for(&self, instance_id: InstanceId) -> Vec<ExecutionLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, entry: ExecutionLogEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(())
    }
}
