use crate::error::FlowGraphError;
use crate::guard::Guard;
use crate::Value;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Immutable, versioned graph of nodes and edges describing an automation.
///
/// Definitions are authored and versioned by an external collaborator and
/// are read-only to the engine. `validate` enforces the structural
/// invariants a definition must satisfy before it is runnable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub trigger: TriggerType,
    /// Id of the single entry node.
    pub entry: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<Edge>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            name: name.into(),
            trigger: TriggerType::Manual,
            entry: entry.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            category: None,
            tags: Vec::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: TriggerType) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn add_node(&mut self, node: NodeSpec) -> &mut Self {
        self.nodes.push(node);
        self
    }

    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            guard: None,
        });
        self
    }

    pub fn connect_if(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        guard: impl Into<String>,
    ) -> &mut Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            guard: Some(guard.into()),
        });
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node in declared order.
    pub fn edges_from<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Check every structural invariant of the definition.
    pub fn validate(&self) -> Result<(), FlowGraphError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(FlowGraphError::DuplicateNodeId(node.id.clone()));
            }
        }

        if !ids.contains(self.entry.as_str()) {
            return Err(FlowGraphError::MissingEntry(self.entry.clone()));
        }
        if !self
            .nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Terminal { .. }))
        {
            return Err(FlowGraphError::NoTerminalNode);
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(FlowGraphError::DanglingEdge(endpoint.clone()));
                }
            }
            if let Some(guard) = &edge.guard {
                Guard::parse(guard).map_err(|source| FlowGraphError::InvalidGuard {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    source,
                })?;
            }
        }

        for node in &self.nodes {
            let outgoing: Vec<&Edge> = self.edges_from(&node.id).collect();
            if matches!(node.kind, NodeKind::Terminal { .. }) {
                if !outgoing.is_empty() {
                    return Err(FlowGraphError::TerminalWithEdges(node.id.clone()));
                }
                continue;
            }
            if outgoing.is_empty() {
                return Err(FlowGraphError::DeadEnd(node.id.clone()));
            }
            if matches!(node.kind, NodeKind::Branch) && outgoing.len() < 2 {
                return Err(FlowGraphError::BranchTooNarrow(node.id.clone()));
            }
            // Fork edges are all unguarded; the fork checks below own them.
            if !matches!(node.kind, NodeKind::Fork { .. })
                && outgoing.iter().filter(|e| e.guard.is_none()).count() > 1
            {
                return Err(FlowGraphError::MultipleDefaultEdges(node.id.clone()));
            }
        }

        self.validate_forks()
    }

    /// Fork/join invariants: every fork names an existing join node that all
    /// of its branches reach, fork edges are unguarded, each join belongs to
    /// exactly one fork, and the region between them contains nothing that
    /// could suspend (delay) or nest (fork) or exit early (terminal).
    fn validate_forks(&self) -> Result<(), FlowGraphError> {
        let (graph, index) = self.build_graph();
        let mut join_owners: HashMap<&str, &str> = HashMap::new();

        for node in &self.nodes {
            let NodeKind::Fork { join } = &node.kind else {
                continue;
            };
            let violation = |detail: &str| FlowGraphError::ForkRegionViolation {
                fork: node.id.clone(),
                detail: detail.to_string(),
            };

            let join_spec = self
                .node(join)
                .ok_or_else(|| violation(&format!("join node {join} does not exist")))?;
            if !matches!(join_spec.kind, NodeKind::Join) {
                return Err(violation(&format!("node {join} is not a join")));
            }
            if let Some(owner) = join_owners.insert(join.as_str(), node.id.as_str()) {
                return Err(violation(&format!(
                    "join node {join} is already claimed by fork {owner}"
                )));
            }

            let outgoing: Vec<&Edge> = self.edges_from(&node.id).collect();
            if outgoing.len() < 2 {
                return Err(violation("fork needs at least two outgoing edges"));
            }
            if outgoing.iter().any(|e| e.guard.is_some()) {
                return Err(violation("fork edges must be unguarded"));
            }

            let join_idx = index[join.as_str()];
            for edge in &outgoing {
                let branch_idx = index[edge.to.as_str()];
                if !has_path_connecting(&graph, branch_idx, join_idx, None) {
                    return Err(violation(&format!(
                        "branch starting at {} never reaches join {join}",
                        edge.to
                    )));
                }
            }

            for region_id in self.fork_region(&outgoing, join) {
                let region_node = self
                    .node(&region_id)
                    .ok_or_else(|| FlowGraphError::NodeNotFound(region_id.clone()))?;
                match region_node.kind {
                    NodeKind::Delay => {
                        return Err(violation(&format!(
                            "delay node {region_id} cannot suspend inside a fork branch"
                        )))
                    }
                    NodeKind::Fork { .. } => {
                        return Err(violation(&format!("nested fork {region_id}")))
                    }
                    NodeKind::Terminal { .. } => {
                        return Err(violation(&format!(
                            "terminal node {region_id} exits before join {join}"
                        )))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Nodes reachable from the fork's branch entries without passing
    /// through the join node.
    fn fork_region(&self, outgoing: &[&Edge], join: &str) -> Vec<String> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = outgoing.iter().map(|e| e.to.as_str()).collect();
        while let Some(current) = stack.pop() {
            if current == join || !seen.insert(current) {
                continue;
            }
            if let Some(next) = adjacency.get(current) {
                stack.extend(next.iter().copied());
            }
        }
        seen.into_iter().map(str::to_string).collect()
    }

    fn build_graph(&self) -> (DiGraph<&str, ()>, HashMap<&str, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.id.as_str());
            index.insert(node.id.as_str(), idx);
        }
        for edge in &self.edges {
            if let (Some(from), Some(to)) =
                (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
            {
                graph.add_edge(*from, *to, ());
            }
        }
        (graph, index)
    }
}

/// Lightweight listing row for active definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinitionSummary {
    pub id: String,
    pub version: u32,
    pub name: String,
    pub trigger: TriggerType,
}

/// Typed unit of work in a flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    /// Opaque to the orchestrator; interpreted only by the node's executor.
    pub config: HashMap<String, Value>,
    pub retry: Option<RetryPolicy>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            config: HashMap::new(),
            retry: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Discriminant selecting a node's executor and telling the orchestrator
/// which nodes carry structural meaning (entry routing, fork barriers,
/// terminal status).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Branch,
    Action,
    AiInvoke,
    Delay,
    Fork { join: String },
    Join,
    Terminal { outcome: TerminalOutcome },
}

impl NodeKind {
    /// Registry key for this node kind.
    pub fn type_id(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "flow.trigger",
            NodeKind::Branch => "flow.branch",
            NodeKind::Action => "message.action",
            NodeKind::AiInvoke => "ai.invoke",
            NodeKind::Delay => "time.delay",
            NodeKind::Fork { .. } => "flow.fork",
            NodeKind::Join => "flow.join",
            NodeKind::Terminal { .. } => "flow.terminal",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Completed,
    Failed,
}

/// Directed transition between nodes, optionally conditional on context
/// variables. Declared order is evaluation order; first match wins; the
/// unguarded edge is the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub guard: Option<String>,
}

/// What fires an instance of this definition. Informational to the engine;
/// upstream intake decides when to call `start_instance`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    MessageEvent,
    Scheduled { schedule: String },
}

/// Bounded exponential backoff for retryable nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay before the given attempt (attempts are 1-based; the delay
    /// applies before attempts 2..=max).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1);
        let ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        std::time::Duration::from_millis(ms as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}
