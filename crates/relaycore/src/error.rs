use crate::guard::GuardError;
use thiserror::Error;

/// Authoring defects in a flow graph. Always fatal to the instance, never
/// retried: the definition itself has to be corrected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FlowGraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("entry node not found: {0}")]
    MissingEntry(String),

    #[error("definition has no terminal node")]
    NoTerminalNode,

    #[error("edge references unknown node: {0}")]
    DanglingEdge(String),

    #[error("node not found in definition: {0}")]
    NodeNotFound(String),

    #[error("terminal node {0} has outgoing edges")]
    TerminalWithEdges(String),

    #[error("non-terminal node {0} has no outgoing edges")]
    DeadEnd(String),

    #[error("branch node {0} needs at least two outgoing edges")]
    BranchTooNarrow(String),

    #[error("node {0} has more than one default (unguarded) edge")]
    MultipleDefaultEdges(String),

    #[error("invalid guard on edge {from} -> {to}: {source}")]
    InvalidGuard {
        from: String,
        to: String,
        #[source]
        source: GuardError,
    },

    #[error("no matching edge out of node {0} and no default")]
    NoMatchingEdge(String),

    #[error("unregistered node type: {0}")]
    UnregisteredNodeType(String),

    #[error("fork node {fork}: {detail}")]
    ForkRegionViolation { fork: String, detail: String },
}

/// Runtime failure inside a node execution. Retried per the node's policy,
/// then fatal to the instance.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("cancelled")]
    Cancelled,
}

/// Persistence-layer errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
}

/// Errors surfaced by the engine facade to its callers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] FlowGraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("flow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("flow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("instance {0} is not suspended")]
    NotSuspended(String),

    #[error("resume key does not match the suspension of instance {0}")]
    ResumeKeyMismatch(String),
}
