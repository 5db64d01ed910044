use async_trait::async_trait;
use chrono::Utc;
use relaycore::{
    EngineError, ExecutionContext, ExecutorContext, FlowDefinition, FlowInstance, InstanceStatus,
    LogOutcome, NodeError, NodeExecutor, NodeKind, NodeSpec, Outcome, RetryPolicy, StepRecord,
    TerminalOutcome, Value,
};
use relayengine::{
    EngineConfig, ExecutorRegistry, FlowEngine, InstanceStore, MemoryDefinitionStore,
    MemoryInstanceStore, MemoryLogSink,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Always succeeds, echoing nothing. Stands in for any node type.
struct StaticExecutor(&'static str);

#[async_trait]
impl NodeExecutor for StaticExecutor {
    fn type_id(&self) -> &'static str {
        self.0
    }

    async fn execute(&self, _ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        Ok(Outcome::completed().with_output("ok", true))
    }
}

/// Fails the first `fail_first` invocations, then succeeds.
struct FlakyExecutor {
    type_id: &'static str,
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyExecutor {
    fn new(type_id: &'static str, fail_first: u32) -> Self {
        Self {
            type_id,
            fail_first,
            calls: AtomicU32::new(0),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    fn type_id(&self) -> &'static str {
        self.type_id
    }

    async fn execute(&self, _ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            Err(NodeError::Dispatch(format!("attempt {call} refused")))
        } else {
            Ok(Outcome::completed().with_output("ok", true))
        }
    }
}

/// Reports completion once it has been invoked three times.
struct PollingExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl NodeExecutor for PollingExecutor {
    fn type_id(&self) -> &'static str {
        "message.action"
    }

    async fn execute(&self, _ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Outcome::completed()
            .with_output("count", call as u64)
            .with_output("done", call >= 3))
    }
}

/// Counts invocations per node id and reports the node's own count.
#[derive(Default)]
struct PerNodeCounter {
    calls: std::sync::Mutex<HashMap<String, u64>>,
}

impl PerNodeCounter {
    fn count(&self, node_id: &str) -> u64 {
        self.calls
            .lock()
            .unwrap()
            .get(node_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl NodeExecutor for PerNodeCounter {
    fn type_id(&self) -> &'static str {
        "message.action"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(ctx.node_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        Ok(Outcome::completed().with_output("count", count))
    }
}

/// Suspends until resumed; no timer.
struct GateExecutor;

#[async_trait]
impl NodeExecutor for GateExecutor {
    fn type_id(&self) -> &'static str {
        "time.delay"
    }

    async fn execute(&self, ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        match ctx.resume {
            Some(payload) => Ok(Outcome::completed().with_output("resumed", payload)),
            None => Ok(Outcome::Suspended {
                resume_key: format!("gate:{}", ctx.node_id),
                timeout: None,
            }),
        }
    }
}

/// Succeeds after holding the task for a fixed time.
struct SlowExecutor(Duration);

#[async_trait]
impl NodeExecutor for SlowExecutor {
    fn type_id(&self) -> &'static str {
        "message.action"
    }

    async fn execute(&self, _ctx: ExecutorContext) -> Result<Outcome, NodeError> {
        tokio::time::sleep(self.0).await;
        Ok(Outcome::completed())
    }
}

struct Harness {
    engine: FlowEngine,
    definitions: Arc<MemoryDefinitionStore>,
    instances: Arc<MemoryInstanceStore>,
    log: Arc<MemoryLogSink>,
}

fn harness(executors: Vec<Arc<dyn NodeExecutor>>, config: EngineConfig) -> Harness {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(StaticExecutor("flow.trigger")));
    registry.register(Arc::new(StaticExecutor("flow.terminal")));
    for executor in executors {
        registry.register(executor);
    }
    let definitions = Arc::new(MemoryDefinitionStore::new());
    let instances = Arc::new(MemoryInstanceStore::new());
    let log = Arc::new(MemoryLogSink::new());
    let engine = FlowEngine::new(
        Arc::new(registry),
        definitions.clone(),
        instances.clone(),
        log.clone(),
        config,
    );
    Harness {
        engine,
        definitions,
        instances,
        log,
    }
}

fn linear_definition() -> FlowDefinition {
    let mut def = FlowDefinition::new("notify", "Notify", "start");
    def.add_node(NodeSpec::new("start", NodeKind::Trigger))
        .add_node(NodeSpec::new("send", NodeKind::Action))
        .add_node(NodeSpec::new(
            "done",
            NodeKind::Terminal {
                outcome: TerminalOutcome::Completed,
            },
        ))
        .connect("start", "send")
        .connect("send", "done");
    def
}

#[tokio::test]
async fn linear_flow_runs_to_completion() {
    let h = harness(
        vec![Arc::new(StaticExecutor("message.action"))],
        EngineConfig::default(),
    );
    h.definitions.insert(linear_definition()).await;

    let id = h
        .engine
        .start_instance("notify", Value::from(json!({"user": "u-1"})))
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance.context.get("send.ok").and_then(|v| v.as_bool()),
        Some(true)
    );

    let entries = h.log.entries_for(id).await;
    let visited: Vec<&str> = entries.iter().map(|e| e.node_id.as_str()).collect();
    assert_eq!(visited, vec!["start", "send", "done"]);
    assert!(entries.iter().all(|e| e.outcome == LogOutcome::Success));
}

#[tokio::test]
async fn branch_without_matching_edge_fails_instance() {
    let h = harness(
        vec![Arc::new(StaticExecutor("flow.branch"))],
        EngineConfig::default(),
    );
    let mut def = FlowDefinition::new("route", "Route", "start");
    def.add_node(NodeSpec::new("start", NodeKind::Trigger))
        .add_node(NodeSpec::new("route", NodeKind::Branch))
        .add_node(NodeSpec::new(
            "a",
            NodeKind::Terminal {
                outcome: TerminalOutcome::Completed,
            },
        ))
        .add_node(NodeSpec::new(
            "b",
            NodeKind::Terminal {
                outcome: TerminalOutcome::Completed,
            },
        ))
        .connect("start", "route")
        .connect_if("route", "a", "trigger.kind == \"alpha\"")
        .connect_if("route", "b", "trigger.kind == \"beta\"");
    h.definitions.insert(def).await;

    let id = h
        .engine
        .start_instance("route", Value::from(json!({"kind": "gamma"})))
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    let reason = instance.fail_reason().unwrap_or_default().to_string();
    assert!(
        reason.contains("no matching edge"),
        "unexpected reason: {reason}"
    );
}

#[tokio::test]
async fn retry_recovers_after_transient_failures() {
    let flaky = Arc::new(FlakyExecutor::new("message.action", 2));
    let h = harness(vec![flaky.clone()], EngineConfig::default());
    let mut def = linear_definition();
    for node in &mut def.nodes {
        if node.id == "send" {
            node.retry = Some(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                backoff_multiplier: 2.0,
            });
        }
    }
    h.definitions.insert(def).await;

    let id = h
        .engine
        .start_instance("notify", Value::Null)
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(flaky.call_count(), 3);

    let send: Vec<_> = h
        .log
        .entries_for(id)
        .await
        .into_iter()
        .filter(|e| e.node_id == "send")
        .collect();
    assert_eq!(send.len(), 3);
    assert_eq!(send[0].outcome, LogOutcome::Failure);
    assert_eq!(send[0].attempt, 1);
    assert_eq!(send[1].outcome, LogOutcome::Failure);
    assert_eq!(send[1].attempt, 2);
    assert_eq!(send[2].outcome, LogOutcome::Success);
    assert_eq!(send[2].attempt, 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_instance() {
    let flaky = Arc::new(FlakyExecutor::new("message.action", 10));
    let h = harness(vec![flaky.clone()], EngineConfig::default());
    let mut def = linear_definition();
    for node in &mut def.nodes {
        if node.id == "send" {
            node.retry = Some(RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
                backoff_multiplier: 2.0,
            });
        }
    }
    h.definitions.insert(def).await;

    let id = h
        .engine
        .start_instance("notify", Value::Null)
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert!(instance.fail_reason().is_some());
    assert_eq!(flaky.call_count(), 3);
}

#[tokio::test]
async fn recovery_replays_recorded_step_without_reexecuting() {
    let flaky = Arc::new(FlakyExecutor::new("message.action", 0));
    let h = harness(vec![flaky.clone()], EngineConfig::default());
    h.definitions.insert(linear_definition()).await;

    // An instance persisted right after the side effect but before the
    // advance: current node and attempt match the recorded step.
    let mut instance = FlowInstance::new(
        "notify",
        1,
        "send",
        ExecutionContext::new(HashMap::new()),
        Utc::now() + chrono::Duration::hours(1),
    );
    instance.last_step = Some(StepRecord {
        node_id: "send".to_string(),
        attempt: 1,
        output: HashMap::from([("ok".to_string(), Value::Bool(true))]),
    });
    let id = instance.id;
    h.instances.create(instance).await.unwrap();

    let recovered = h.engine.recover_instance(id).await.unwrap();
    assert_eq!(recovered.status, InstanceStatus::Completed);
    // The recorded output is replayed into the context; the executor is
    // never invoked again.
    assert_eq!(flaky.call_count(), 0);
    assert_eq!(
        recovered.context.get("send.ok").and_then(|v| v.as_bool()),
        Some(true)
    );

    let entries = h.log.entries_for(id).await;
    assert_eq!(entries[0].node_id, "send");
    assert_eq!(entries[0].outcome, LogOutcome::Skipped);
}

#[tokio::test]
async fn loop_edge_reexecutes_node_until_guard_flips() {
    let poll = Arc::new(PollingExecutor {
        calls: AtomicU32::new(0),
    });
    let h = harness(vec![poll.clone()], EngineConfig::default());
    let mut def = FlowDefinition::new("poller", "Poller", "start");
    def.add_node(NodeSpec::new("start", NodeKind::Trigger))
        .add_node(NodeSpec::new("poll", NodeKind::Action))
        .add_node(NodeSpec::new(
            "done",
            NodeKind::Terminal {
                outcome: TerminalOutcome::Completed,
            },
        ))
        .connect("start", "poll")
        .connect_if("poll", "done", "poll.done == true")
        .connect("poll", "poll");
    h.definitions.insert(def).await;

    let id = h
        .engine
        .start_instance("poller", Value::Null)
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(poll.calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        instance.context.get("poll.count").and_then(|v| v.as_u64()),
        Some(3)
    );

    // Every revisit is a real execution: one Success entry per pass with a
    // strictly increasing count, and no replayed entries anywhere.
    let entries = h.log.entries_for(id).await;
    assert!(entries.iter().all(|e| e.outcome != LogOutcome::Skipped));
    let polls: Vec<_> = entries.iter().filter(|e| e.node_id == "poll").collect();
    assert_eq!(polls.len(), 3);
    for (i, entry) in polls.iter().enumerate() {
        assert_eq!(entry.outcome, LogOutcome::Success);
        assert_eq!(entry.attempt, 1);
        assert_eq!(
            entry.output.get("count").and_then(|v| v.as_u64()),
            Some(i as u64 + 1)
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fork_revisited_through_loop_reruns_branches() {
    let counter = Arc::new(PerNodeCounter::default());
    let h = harness(
        vec![
            counter.clone(),
            Arc::new(StaticExecutor("flow.fork")),
            Arc::new(StaticExecutor("flow.join")),
        ],
        EngineConfig::default(),
    );
    let mut def = FlowDefinition::new("fanloop", "Fanloop", "start");
    def.add_node(NodeSpec::new("start", NodeKind::Trigger))
        .add_node(NodeSpec::new(
            "fan",
            NodeKind::Fork {
                join: "gather".to_string(),
            },
        ))
        .add_node(NodeSpec::new("a", NodeKind::Action))
        .add_node(NodeSpec::new("b", NodeKind::Action))
        .add_node(NodeSpec::new("gather", NodeKind::Join))
        .add_node(NodeSpec::new(
            "done",
            NodeKind::Terminal {
                outcome: TerminalOutcome::Completed,
            },
        ))
        .connect("start", "fan")
        .connect("fan", "a")
        .connect("fan", "b")
        .connect("a", "gather")
        .connect("b", "gather")
        .connect_if("gather", "done", "a.count >= 2")
        .connect("gather", "fan");
    h.definitions.insert(def).await;

    let id = h
        .engine
        .start_instance("fanloop", Value::Null)
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    // Both branches ran again on the second pass through the fork, and the
    // spent barrier was dropped.
    assert_eq!(counter.count("a"), 2);
    assert_eq!(counter.count("b"), 2);
    assert!(instance.fork.is_none());
}

#[tokio::test]
async fn actions_without_policy_use_engine_default_retry() {
    let flaky = Arc::new(FlakyExecutor::new("message.action", 2));
    let config = EngineConfig {
        default_retry: Some(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            backoff_multiplier: 2.0,
        }),
        ..EngineConfig::default()
    };
    let h = harness(vec![flaky.clone()], config);
    // The "send" node declares no retry of its own.
    h.definitions.insert(linear_definition()).await;

    let id = h
        .engine
        .start_instance("notify", Value::Null)
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(flaky.call_count(), 3);
}

#[tokio::test]
async fn disabled_default_retry_fails_fast() {
    let flaky = Arc::new(FlakyExecutor::new("message.action", 1));
    let config = EngineConfig {
        default_retry: None,
        ..EngineConfig::default()
    };
    let h = harness(vec![flaky.clone()], config);
    h.definitions.insert(linear_definition()).await;

    let id = h
        .engine
        .start_instance("notify", Value::Null)
        .await
        .unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert!(instance.fail_reason().is_some());
    assert_eq!(flaky.call_count(), 1);
}

#[tokio::test]
async fn resume_rejected_when_not_suspended() {
    let h = harness(
        vec![Arc::new(StaticExecutor("message.action"))],
        EngineConfig::default(),
    );
    h.definitions.insert(linear_definition()).await;
    let id = h
        .engine
        .start_instance("notify", Value::Null)
        .await
        .unwrap();

    let err = h
        .engine
        .resume_instance(id, "gate:send", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotSuspended(_)));
}

fn gated_definition() -> FlowDefinition {
    let mut def = FlowDefinition::new("gated", "Gated", "start");
    def.add_node(NodeSpec::new("start", NodeKind::Trigger))
        .add_node(NodeSpec::new("wait", NodeKind::Delay))
        .add_node(NodeSpec::new(
            "done",
            NodeKind::Terminal {
                outcome: TerminalOutcome::Completed,
            },
        ))
        .connect("start", "wait")
        .connect("wait", "done");
    def
}

#[tokio::test]
async fn resume_requires_matching_key() {
    let h = harness(vec![Arc::new(GateExecutor)], EngineConfig::default());
    h.definitions.insert(gated_definition()).await;
    let id = h.engine.start_instance("gated", Value::Null).await.unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert!(instance.is_suspended());

    let err = h
        .engine
        .resume_instance(id, "gate:somewhere-else", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ResumeKeyMismatch(_)));

    h.engine
        .resume_instance(id, "gate:wait", Value::from(json!({"approved": true})))
        .await
        .unwrap();
    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance
            .context
            .get("wait.resumed.approved")
            .and_then(|v| v.as_bool()),
        Some(true)
    );
}

#[tokio::test]
async fn cancel_fails_suspended_instance() {
    let h = harness(vec![Arc::new(GateExecutor)], EngineConfig::default());
    h.definitions.insert(gated_definition()).await;
    let id = h.engine.start_instance("gated", Value::Null).await.unwrap();

    h.engine.cancel_instance(id).await.unwrap();
    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.fail_reason(), Some("cancelled"));

    // A late resume for the old key is rejected.
    let err = h
        .engine
        .resume_instance(id, "gate:wait", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotSuspended(_)));
}

#[tokio::test]
async fn cancel_takes_effect_at_step_boundary() {
    let h = harness(
        vec![Arc::new(SlowExecutor(Duration::from_millis(100)))],
        EngineConfig::default(),
    );
    let mut def = FlowDefinition::new("slow", "Slow", "start");
    def.add_node(NodeSpec::new("start", NodeKind::Trigger))
        .add_node(NodeSpec::new("first", NodeKind::Action))
        .add_node(NodeSpec::new("second", NodeKind::Action))
        .add_node(NodeSpec::new(
            "done",
            NodeKind::Terminal {
                outcome: TerminalOutcome::Completed,
            },
        ))
        .connect("start", "first")
        .connect("first", "second")
        .connect("second", "done");
    h.definitions.insert(def).await;

    let mut events = h.engine.subscribe_events();
    let engine = h.engine.clone();
    let runner = tokio::spawn(async move { engine.start_instance("slow", Value::Null).await });

    let id = loop {
        match events.recv().await.unwrap() {
            relaycore::ExecutionEvent::InstanceStarted { instance_id, .. } => break instance_id,
            _ => continue,
        }
    };
    h.engine.cancel_instance(id).await.unwrap();
    runner.await.unwrap().unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.fail_reason(), Some("cancelled"));
}

#[tokio::test]
async fn deadline_sweep_fails_overdue_suspensions() {
    let config = EngineConfig {
        instance_deadline: Duration::from_millis(20),
        ..EngineConfig::default()
    };
    let h = harness(vec![Arc::new(GateExecutor)], config);
    h.definitions.insert(gated_definition()).await;
    let id = h.engine.start_instance("gated", Value::Null).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.sweep_deadlines().await.unwrap();

    let instance = h.engine.instance(id).await.unwrap();
    assert_eq!(instance.fail_reason(), Some("deadline_exceeded"));
}

#[tokio::test]
async fn instance_store_rejects_stale_saves() {
    let store = MemoryInstanceStore::new();
    let instance = FlowInstance::new(
        "notify",
        1,
        "start",
        ExecutionContext::new(HashMap::new()),
        Utc::now() + chrono::Duration::hours(1),
    );
    let id = instance.id;
    store.create(instance).await.unwrap();

    let mut first = store.load(id).await.unwrap();
    let second = store.load(id).await.unwrap();

    let version = store.save(&first, first.store_version).await.unwrap();
    first.store_version = version;

    let err = store.save(&second, second.store_version).await.unwrap_err();
    assert!(matches!(
        err,
        relaycore::StoreError::Conflict {
            expected: 1,
            actual: 2
        }
    ));
}
