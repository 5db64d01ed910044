use crate::registry::ExecutorRegistry;
use crate::stores::{InstanceStore, LogSink};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use relaycore::{
    BranchState, BranchStatus, EngineError, EventBus, ExecutionContext, ExecutionEvent,
    ExecutionLogEntry, ExecutorContext, FlowDefinition, FlowGraphError, FlowInstance, ForkLedger,
    Guard, InstanceId, NodeError, NodeExecutor, NodeKind, NodeSpec, Outcome, RetryPolicy,
    StepRecord, StoreError, TerminalOutcome, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Drives one instance at a time through its flow graph.
///
/// The caller (the engine facade) holds the instance execution lock for the
/// whole `run_to_settle` sequence, so no two steps of the same instance can
/// ever overlap. Suspension returns control to the caller, which releases
/// the lock; resume re-enters through the same path.
pub(crate) struct Orchestrator {
    registry: Arc<ExecutorRegistry>,
    instances: Arc<dyn InstanceStore>,
    log: Arc<dyn LogSink>,
    events: Arc<EventBus>,
    default_node_timeout: Duration,
    default_retry: Option<RetryPolicy>,
}

/// What a single step did to the instance.
enum StepResult {
    /// Advanced to another node; keep stepping.
    Continue,
    /// Attempt failed but the node is retryable; sleep, then step again.
    Retry { delay: Duration },
    /// Instance persisted as suspended; stop until resume.
    Suspended,
    /// Instance reached a terminal status.
    Finished,
}

impl Orchestrator {
    pub(crate) fn new(
        registry: Arc<ExecutorRegistry>,
        instances: Arc<dyn InstanceStore>,
        log: Arc<dyn LogSink>,
        events: Arc<EventBus>,
        default_node_timeout: Duration,
        default_retry: Option<RetryPolicy>,
    ) -> Self {
        Self {
            registry,
            instances,
            log,
            events,
            default_node_timeout,
            default_retry,
        }
    }

    /// Step the instance until it completes, fails, or suspends.
    ///
    /// Every iteration re-loads the instance and saves it back with the
    /// optimistic-concurrency version; a conflicting save re-loads and
    /// re-evaluates instead of clobbering the winner's state.
    pub(crate) async fn run_to_settle(
        &self,
        definition: Arc<FlowDefinition>,
        id: InstanceId,
        cancel: CancellationToken,
    ) -> Result<FlowInstance, EngineError> {
        loop {
            let mut instance = self.load(id).await?;
            if instance.is_terminal() || instance.is_suspended() {
                return Ok(instance);
            }

            if cancel.is_cancelled() {
                self.fail_instance(&mut instance, "cancelled");
                self.persist(&mut instance).await?;
                return Ok(instance);
            }
            if Utc::now() > instance.deadline {
                self.fail_instance(&mut instance, "deadline_exceeded");
                self.persist(&mut instance).await?;
                return Ok(instance);
            }

            let step = self.step(&definition, &mut instance, &cancel).await?;

            match self.instances.save(&instance, instance.store_version).await {
                Ok(version) => instance.store_version = version,
                Err(StoreError::Conflict { .. }) => {
                    tracing::warn!(instance = %id, "save conflict, re-evaluating step");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }

            match step {
                StepResult::Continue => {}
                StepResult::Retry { delay } => sleep(delay).await,
                StepResult::Suspended | StepResult::Finished => return Ok(instance),
            }
        }
    }

    /// Execute one attempt of the instance's current node.
    async fn step(
        &self,
        definition: &Arc<FlowDefinition>,
        instance: &mut FlowInstance,
        cancel: &CancellationToken,
    ) -> Result<StepResult, EngineError> {
        let Some(node) = definition.node(&instance.current_node).cloned() else {
            let err = FlowGraphError::NodeNotFound(instance.current_node.clone());
            return Ok(self.fail_instance(instance, err.to_string()));
        };

        // Idempotent replay: a crash after the step record was persisted but
        // before the advance must not re-fire the node's side effect.
        if let Some(record) = instance.last_step.clone() {
            if record.node_id == instance.current_node && record.attempt == instance.attempt {
                tracing::info!(
                    instance = %instance.id,
                    node = %node.id,
                    attempt = instance.attempt,
                    "replaying recorded step without re-execution"
                );
                self.log
                    .append(ExecutionLogEntry::skipped(
                        instance.id,
                        &node.id,
                        instance.attempt,
                    ))
                    .await?;
                return self.conclude_success(definition, instance, &node, record.output);
            }
        }

        if let NodeKind::Fork { join } = &node.kind {
            let join = join.clone();
            return self.run_fork(definition, instance, &node, join, cancel).await;
        }

        let executor = match self.registry.resolve(node.kind.type_id()) {
            Ok(executor) => executor,
            Err(err) => return Ok(self.fail_instance(instance, err.to_string())),
        };

        let started_at = Utc::now();
        let started = Instant::now();
        let ctx = ExecutorContext {
            node_id: node.id.clone(),
            attempt: instance.attempt,
            config: node.config.clone(),
            vars: instance.context.clone(),
            resume: instance.pending_resume.take(),
            events: self.events.create_emitter(instance.id, node.id.clone()),
            cancellation: cancel.clone(),
        };

        self.events.emit(ExecutionEvent::NodeStarted {
            instance_id: instance.id,
            node_id: node.id.clone(),
            node_type: node.kind.type_id().to_string(),
            attempt: instance.attempt,
            timestamp: started_at,
        });
        tracing::info!(
            instance = %instance.id,
            node = %node.id,
            attempt = instance.attempt,
            "executing node"
        );

        let result = self.invoke(executor, &node, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        instance.processing_ms += duration_ms;

        match result {
            Ok(Outcome::Completed { output }) => {
                self.log
                    .append(ExecutionLogEntry::success(
                        instance.id,
                        &node.id,
                        instance.attempt,
                        started_at,
                        node.config.clone(),
                        output.clone(),
                    ))
                    .await?;
                self.events.emit(ExecutionEvent::NodeCompleted {
                    instance_id: instance.id,
                    node_id: node.id.clone(),
                    attempt: instance.attempt,
                    outputs: output.clone(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                instance.last_step = Some(StepRecord {
                    node_id: node.id.clone(),
                    attempt: instance.attempt,
                    output: output.clone(),
                });
                if matches!(node.kind, NodeKind::Action | NodeKind::AiInvoke) {
                    // Side-effect fence: persist the step record before
                    // advancing so a crash here replays instead of re-firing.
                    self.persist(instance).await?;
                }
                self.conclude_success(definition, instance, &node, output)
            }
            Ok(Outcome::Suspended {
                resume_key,
                timeout,
            }) => {
                let timeout_at = timeout
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| Utc::now() + d);
                instance.suspend(resume_key.clone(), timeout_at);
                self.events.emit(ExecutionEvent::InstanceSuspended {
                    instance_id: instance.id,
                    node_id: node.id.clone(),
                    resume_key,
                    timestamp: Utc::now(),
                });
                tracing::info!(instance = %instance.id, node = %node.id, "instance suspended");
                Ok(StepResult::Suspended)
            }
            Err(err) => {
                self.log
                    .append(ExecutionLogEntry::failure(
                        instance.id,
                        &node.id,
                        instance.attempt,
                        started_at,
                        node.config.clone(),
                        err.to_string(),
                    ))
                    .await?;
                self.events.emit(ExecutionEvent::NodeFailed {
                    instance_id: instance.id,
                    node_id: node.id.clone(),
                    attempt: instance.attempt,
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
                tracing::error!(
                    instance = %instance.id,
                    node = %node.id,
                    attempt = instance.attempt,
                    error = %err,
                    "node failed"
                );

                if matches!(err, NodeError::Cancelled) {
                    return Ok(self.fail_instance(instance, "cancelled"));
                }
                if let Some(policy) = retry_policy(&node, &self.default_retry) {
                    if instance.attempt < policy.max_attempts {
                        let delay = policy.delay_for(instance.attempt);
                        instance.attempt += 1;
                        instance.touch();
                        return Ok(StepResult::Retry { delay });
                    }
                }
                Ok(self.fail_instance(
                    instance,
                    format!("node {} failed: {}", node.id, err),
                ))
            }
        }
    }

    /// Merge the node's output and move on: set the terminal status for
    /// terminal nodes, otherwise pick the next node from the outgoing edges.
    fn conclude_success(
        &self,
        definition: &FlowDefinition,
        instance: &mut FlowInstance,
        node: &NodeSpec,
        output: HashMap<String, Value>,
    ) -> Result<StepResult, EngineError> {
        instance.context.merge_output(&node.id, output);

        if let NodeKind::Terminal { outcome } = &node.kind {
            match outcome {
                TerminalOutcome::Completed => {
                    instance.complete();
                    self.events.emit(ExecutionEvent::InstanceCompleted {
                        instance_id: instance.id,
                        timestamp: Utc::now(),
                    });
                    tracing::info!(instance = %instance.id, "instance completed");
                }
                TerminalOutcome::Failed => {
                    let reason = node
                        .config
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("terminal")
                        .to_string();
                    self.fail_instance(instance, reason);
                }
            }
            return Ok(StepResult::Finished);
        }

        match select_edge(definition, &node.id, &instance.context) {
            Some(next) => {
                instance.advance_to(next);
                Ok(StepResult::Continue)
            }
            None => {
                let err = FlowGraphError::NoMatchingEdge(node.id.clone());
                Ok(self.fail_instance(instance, err.to_string()))
            }
        }
    }

    /// Invoke an executor under the per-node timeout. Delay nodes are
    /// exempt: their timeout is the expected resume trigger, not a failure.
    async fn invoke(
        &self,
        executor: Arc<dyn NodeExecutor>,
        node: &NodeSpec,
        ctx: ExecutorContext,
    ) -> Result<Outcome, NodeError> {
        if matches!(node.kind, NodeKind::Delay) {
            return executor.execute(ctx).await;
        }
        let limit = node
            .config
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.default_node_timeout);
        match timeout(limit, executor.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout {
                ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Run a fork node: walk every branch concurrently until the declared
    /// join, folding results into the persisted join barrier as they
    /// arrive. First failure cancels the siblings and fails the instance;
    /// late sibling results are recorded in the ledger but never merged.
    async fn run_fork(
        &self,
        definition: &Arc<FlowDefinition>,
        instance: &mut FlowInstance,
        node: &NodeSpec,
        join: String,
        cancel: &CancellationToken,
    ) -> Result<StepResult, EngineError> {
        let resuming = instance
            .fork
            .as_ref()
            .map(|l| l.fork_node == node.id)
            .unwrap_or(false);
        if !resuming {
            let branches = definition
                .edges_from(&node.id)
                .enumerate()
                .map(|(index, edge)| BranchState {
                    index,
                    entry_node: edge.to.clone(),
                    status: BranchStatus::Running,
                })
                .collect();
            instance.fork = Some(ForkLedger {
                fork_node: node.id.clone(),
                join_node: join.clone(),
                branches,
            });
            instance.touch();
            self.persist(instance).await?;
        }

        let started_at = Utc::now();
        self.events.emit(ExecutionEvent::NodeStarted {
            instance_id: instance.id,
            node_id: node.id.clone(),
            node_type: node.kind.type_id().to_string(),
            attempt: instance.attempt,
            timestamp: started_at,
        });
        tracing::info!(instance = %instance.id, node = %node.id, "forking branches");

        let branch_cancel = cancel.child_token();
        let mut running = FuturesUnordered::new();
        if let Some(ledger) = &instance.fork {
            for branch in &ledger.branches {
                if !matches!(branch.status, BranchStatus::Running) {
                    continue;
                }
                let walk = run_branch(
                    definition.clone(),
                    self.registry.clone(),
                    self.events.clone(),
                    instance.context.clone(),
                    instance.id,
                    branch.entry_node.clone(),
                    join.clone(),
                    self.default_node_timeout,
                    self.default_retry.clone(),
                    branch_cancel.clone(),
                    branch.index,
                );
                running.push(tokio::spawn(walk));
            }
        }

        let mut failure: Option<String> = None;
        while let Some(joined) = running.next().await {
            let run = match joined {
                Ok(run) => run,
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(format!("branch task aborted: {err}"));
                        branch_cancel.cancel();
                    }
                    continue;
                }
            };
            for entry in run.visits {
                self.log.append(entry).await?;
            }
            if let Some(ledger) = instance.fork.as_mut() {
                if let Some(branch) = ledger.branches.get_mut(run.index) {
                    branch.status = match run.outcome {
                        Ok(()) => BranchStatus::Completed { writes: run.writes },
                        Err(ref reason) => BranchStatus::Failed {
                            reason: reason.clone(),
                        },
                    };
                }
            }
            if let Err(reason) = run.outcome {
                if failure.is_none() {
                    failure = Some(reason);
                    branch_cancel.cancel();
                }
            }
            instance.touch();
            self.persist(instance).await?;
        }

        if let Some(reason) = failure {
            self.log
                .append(ExecutionLogEntry::failure(
                    instance.id,
                    &node.id,
                    instance.attempt,
                    started_at,
                    node.config.clone(),
                    reason.clone(),
                ))
                .await?;
            self.events.emit(ExecutionEvent::NodeFailed {
                instance_id: instance.id,
                node_id: node.id.clone(),
                attempt: instance.attempt,
                error: reason.clone(),
                timestamp: Utc::now(),
            });
            return Ok(self.fail_instance(
                instance,
                format!("fork {} failed: {}", node.id, reason),
            ));
        }

        // All branches resolved successfully (including any completed
        // before a restart): merge their namespaced writes and move past
        // the barrier to the join node.
        let mut merged: Vec<(String, HashMap<String, Value>)> = Vec::new();
        if let Some(ledger) = &instance.fork {
            for branch in &ledger.branches {
                if let BranchStatus::Completed { writes } = &branch.status {
                    for (namespace, output) in writes {
                        merged.push((namespace.clone(), output.clone()));
                    }
                }
            }
        }
        for (namespace, output) in merged {
            instance.context.merge_output(&namespace, output);
        }

        self.log
            .append(ExecutionLogEntry::success(
                instance.id,
                &node.id,
                instance.attempt,
                started_at,
                node.config.clone(),
                HashMap::new(),
            ))
            .await?;
        self.events.emit(ExecutionEvent::NodeCompleted {
            instance_id: instance.id,
            node_id: node.id.clone(),
            attempt: instance.attempt,
            outputs: HashMap::new(),
            duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
            timestamp: Utc::now(),
        });
        // The barrier is spent: a loop edge revisiting this fork must start
        // a fresh ledger and re-run every branch.
        instance.fork = None;
        instance.advance_to(join);
        Ok(StepResult::Continue)
    }

    fn fail_instance(&self, instance: &mut FlowInstance, reason: impl Into<String>) -> StepResult {
        let reason = reason.into();
        tracing::error!(instance = %instance.id, %reason, "instance failed");
        instance.fail(reason.clone());
        self.events.emit(ExecutionEvent::InstanceFailed {
            instance_id: instance.id,
            reason,
            timestamp: Utc::now(),
        });
        StepResult::Finished
    }

    async fn persist(&self, instance: &mut FlowInstance) -> Result<(), EngineError> {
        let version = self
            .instances
            .save(instance, instance.store_version)
            .await?;
        instance.store_version = version;
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<FlowInstance, EngineError> {
        self.instances.load(id).await.map_err(|err| match err {
            StoreError::NotFound(_) => EngineError::InstanceNotFound(id.to_string()),
            other => other.into(),
        })
    }
}

/// Pick the next node from a node's outgoing edges: guarded edges in
/// declared order, first match wins; otherwise the unguarded default.
pub(crate) fn select_edge(
    definition: &FlowDefinition,
    from: &str,
    ctx: &ExecutionContext,
) -> Option<String> {
    let mut default = None;
    for edge in definition.edges_from(from) {
        match &edge.guard {
            None => {
                if default.is_none() {
                    default = Some(edge.to.clone());
                }
            }
            Some(src) => {
                // Guards were parsed at validation time; a malformed guard
                // here simply never matches.
                if Guard::parse(src).map(|g| g.eval(ctx)).unwrap_or(false) {
                    return Some(edge.to.clone());
                }
            }
        }
    }
    default
}

/// Effective retry policy for a node: its own, or the engine default for
/// the side-effecting kinds.
fn retry_policy(node: &NodeSpec, default: &Option<RetryPolicy>) -> Option<RetryPolicy> {
    node.retry.clone().or_else(|| match node.kind {
        NodeKind::Action | NodeKind::AiInvoke => default.clone(),
        _ => None,
    })
}

struct BranchRun {
    index: usize,
    outcome: Result<(), String>,
    /// Namespaced context writes, applied to the parent only if every
    /// branch succeeds.
    writes: HashMap<String, HashMap<String, Value>>,
    visits: Vec<ExecutionLogEntry>,
}

/// Walk one fork branch sequentially until the join node. Branches share
/// the fork-time context snapshot; their writes stay namespaced, so sibling
/// branches can never collide.
#[allow(clippy::too_many_arguments)]
async fn run_branch(
    definition: Arc<FlowDefinition>,
    registry: Arc<ExecutorRegistry>,
    events: Arc<EventBus>,
    base: ExecutionContext,
    instance_id: InstanceId,
    entry: String,
    join: String,
    default_timeout: Duration,
    default_retry: Option<RetryPolicy>,
    cancel: CancellationToken,
    index: usize,
) -> BranchRun {
    let mut ctx = base;
    let mut writes: HashMap<String, HashMap<String, Value>> = HashMap::new();
    let mut visits = Vec::new();
    let mut current = entry;
    let mut attempt: u32 = 1;

    let outcome = loop {
        if cancel.is_cancelled() {
            break Err("cancelled".to_string());
        }
        if current == join {
            break Ok(());
        }
        let Some(node) = definition.node(&current) else {
            break Err(FlowGraphError::NodeNotFound(current.clone()).to_string());
        };
        let executor = match registry.resolve(node.kind.type_id()) {
            Ok(executor) => executor,
            Err(err) => break Err(err.to_string()),
        };

        let started_at = Utc::now();
        let exec_ctx = ExecutorContext {
            node_id: node.id.clone(),
            attempt,
            config: node.config.clone(),
            vars: ctx.clone(),
            resume: None,
            events: events.create_emitter(instance_id, node.id.clone()),
            cancellation: cancel.clone(),
        };
        let limit = node
            .config
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        let result = match timeout(limit, executor.execute(exec_ctx)).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout {
                ms: limit.as_millis() as u64,
            }),
        };

        match result {
            Ok(Outcome::Completed { output }) => {
                visits.push(ExecutionLogEntry::success(
                    instance_id,
                    &node.id,
                    attempt,
                    started_at,
                    node.config.clone(),
                    output.clone(),
                ));
                ctx.merge_output(&node.id, output.clone());
                if !output.is_empty() {
                    writes.entry(node.id.clone()).or_default().extend(output);
                }
                match select_edge(&definition, &node.id, &ctx) {
                    Some(next) => {
                        current = next;
                        attempt = 1;
                    }
                    None => break Err(FlowGraphError::NoMatchingEdge(node.id.clone()).to_string()),
                }
            }
            Ok(Outcome::Suspended { .. }) => {
                break Err(format!("node {} suspended inside a fork branch", node.id));
            }
            Err(err) => {
                visits.push(ExecutionLogEntry::failure(
                    instance_id,
                    &node.id,
                    attempt,
                    started_at,
                    node.config.clone(),
                    err.to_string(),
                ));
                if let Some(policy) = retry_policy(node, &default_retry) {
                    if attempt < policy.max_attempts {
                        sleep(policy.delay_for(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                }
                break Err(format!("node {} failed: {}", node.id, err));
            }
        }
    };

    BranchRun {
        index,
        outcome,
        writes,
        visits,
    }
}
