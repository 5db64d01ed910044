use async_trait::async_trait;
use relaycore::{
    ExecutionLogEntry, FlowDefinition, FlowDefinitionSummary, FlowInstance, InstanceId, StoreError,
};

/// Read access to published flow definitions. Implemented by the authoring
/// collaborator; the engine never writes definitions.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Fetch a definition, latest version when `version` is `None`.
    async fn get(&self, id: &str, version: Option<u32>) -> Result<FlowDefinition, StoreError>;

    async fn list_active(&self) -> Result<Vec<FlowDefinitionSummary>, StoreError>;
}

/// Durable record of running and archived instances.
///
/// `save` is a compare-and-swap on the instance's store version: a caller
/// passing a stale `expected_version` gets `StoreError::Conflict` and must
/// re-load. Timeout-driven resumes and explicit resumes race through this.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create(&self, instance: FlowInstance) -> Result<(), StoreError>;

    async fn load(&self, id: InstanceId) -> Result<FlowInstance, StoreError>;

    /// Persist the instance if its stored version still equals
    /// `expected_version`; returns the new version on success.
    async fn save(&self, instance: &FlowInstance, expected_version: u64)
        -> Result<u64, StoreError>;

    /// Running and suspended instances.
    async fn list_active(&self) -> Result<Vec<FlowInstance>, StoreError>;
}

/// Append-only audit sink. Entries are never updated or deleted.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: ExecutionLogEntry) -> Result<(), StoreError>;
}
