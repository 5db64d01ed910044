use crate::orchestrator::Orchestrator;
use crate::registry::ExecutorRegistry;
use crate::stores::{DefinitionStore, InstanceStore, LogSink};
use chrono::{DateTime, Utc};
use relaycore::{
    EngineError, EventBus, ExecutionContext, ExecutionEvent, FlowDefinition, FlowInstance,
    InstanceId, InstanceStatus, RetryPolicy, StoreError, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Applied to node invocations without a `timeout_ms` config.
    pub default_node_timeout: Duration,
    /// Fallback policy for action and AI-invoke nodes that declare no
    /// `retry` of their own. `None` disables retries for such nodes.
    pub default_retry: Option<RetryPolicy>,
    /// Overall wall-clock budget per instance; suspended instances past it
    /// are auto-failed with reason `deadline_exceeded`.
    pub instance_deadline: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_node_timeout: Duration::from_secs(30),
            default_retry: Some(RetryPolicy::default()),
            instance_deadline: Duration::from_secs(3600),
            event_capacity: 1000,
        }
    }
}

/// Trigger intake and instance lifecycle facade.
///
/// Cheap to clone; all state lives behind an `Arc`. Upstream HTTP or event
/// handlers call `start_instance` / `resume_instance`; everything else is
/// internal to the engine.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: Arc<ExecutorRegistry>,
    definitions: Arc<dyn DefinitionStore>,
    instances: Arc<dyn InstanceStore>,
    events: Arc<EventBus>,
    orchestrator: Orchestrator,
    /// Per-instance execution locks: acquire-before-step,
    /// release-after-settle. Guarantees the one-step-at-a-time invariant.
    locks: Mutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
    cancels: Mutex<HashMap<InstanceId, CancellationToken>>,
    config: EngineConfig,
}

impl FlowEngine {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        definitions: Arc<dyn DefinitionStore>,
        instances: Arc<dyn InstanceStore>,
        log: Arc<dyn LogSink>,
        config: EngineConfig,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_capacity));
        let orchestrator = Orchestrator::new(
            registry.clone(),
            instances.clone(),
            log,
            events.clone(),
            config.default_node_timeout,
            config.default_retry.clone(),
        );
        Self {
            inner: Arc::new(EngineInner {
                registry,
                definitions,
                instances,
                events,
                orchestrator,
                locks: Mutex::new(HashMap::new()),
                cancels: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Create an instance of a definition and drive it until it settles
    /// (terminal or suspended). Wrap in `tokio::spawn` for fire-and-forget.
    pub async fn start_instance(
        &self,
        definition_id: &str,
        trigger_payload: Value,
    ) -> Result<InstanceId, EngineError> {
        let definition = self.load_definition(definition_id, None).await?;
        definition.validate()?;
        self.inner.registry.verify_definition(&definition)?;

        let mut globals = HashMap::new();
        globals.insert("trigger".to_string(), trigger_payload);
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.inner.config.instance_deadline)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let instance = FlowInstance::new(
            &definition.id,
            definition.version,
            &definition.entry,
            ExecutionContext::new(globals),
            deadline,
        );
        let id = instance.id;
        self.inner.instances.create(instance).await?;
        self.inner.events.emit(ExecutionEvent::InstanceStarted {
            instance_id: id,
            definition_id: definition.id.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!(instance = %id, definition = %definition.id, "starting instance");

        let definition = Arc::new(definition);
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        self.settle(definition, id).await?;
        Ok(id)
    }

    /// Re-enter a suspended instance with a payload. Rejected without any
    /// state mutation when the instance is not suspended or the key does
    /// not match; a resume that loses the save race is discarded the same
    /// way.
    pub async fn resume_instance(
        &self,
        id: InstanceId,
        resume_key: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(id).await?;
        match &instance.status {
            InstanceStatus::Suspended { resume_key: key, .. } if key == resume_key => {}
            InstanceStatus::Suspended { .. } => {
                return Err(EngineError::ResumeKeyMismatch(id.to_string()));
            }
            _ => return Err(EngineError::NotSuspended(id.to_string())),
        }

        instance.status = InstanceStatus::Running;
        instance.pending_resume = Some(payload);
        instance.touch();
        match self
            .inner
            .instances
            .save(&instance, instance.store_version)
            .await
        {
            Ok(version) => instance.store_version = version,
            Err(StoreError::Conflict { .. }) => {
                return Err(EngineError::NotSuspended(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        self.inner.events.emit(ExecutionEvent::InstanceResumed {
            instance_id: id,
            node_id: instance.current_node.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!(instance = %id, node = %instance.current_node, "resuming instance");

        let definition = Arc::new(
            self.load_definition(&instance.definition_id, Some(instance.definition_version))
                .await?,
        );
        self.settle(definition, id).await?;
        Ok(())
    }

    /// Request cancellation. Takes effect at the next step boundary, or
    /// immediately when the instance is suspended; an in-progress node
    /// invocation is not interrupted.
    pub async fn cancel_instance(&self, id: InstanceId) -> Result<(), EngineError> {
        {
            let cancels = self.inner.cancels.lock().await;
            if let Some(token) = cancels.get(&id) {
                token.cancel();
            }
        }

        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut instance = self.load_instance(id).await?;
        if !instance.is_terminal() {
            instance.fail("cancelled");
            let version = self
                .inner
                .instances
                .save(&instance, instance.store_version)
                .await?;
            instance.store_version = version;
            self.inner.events.emit(ExecutionEvent::InstanceFailed {
                instance_id: id,
                reason: "cancelled".to_string(),
                timestamp: Utc::now(),
            });
            tracing::info!(instance = %id, "instance cancelled");
        }
        self.forget(id).await;
        Ok(())
    }

    pub async fn instance(&self, id: InstanceId) -> Result<FlowInstance, EngineError> {
        self.load_instance(id).await
    }

    /// Pick up a persisted `Running` instance and drive it to a settled
    /// state. Used after a process restart; idempotency of the last step
    /// is handled by the orchestrator's step-record replay. Instances that
    /// are already settled are returned as-is.
    pub async fn recover_instance(&self, id: InstanceId) -> Result<FlowInstance, EngineError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let instance = self.load_instance(id).await?;
        if !matches!(instance.status, InstanceStatus::Running) {
            return Ok(instance);
        }
        tracing::info!(instance = %id, "recovering in-flight instance");
        let definition = Arc::new(
            self.load_definition(&instance.definition_id, Some(instance.definition_version))
                .await?,
        );
        self.settle(definition, id).await
    }

    /// Recover every persisted `Running` instance, e.g. at process startup.
    pub async fn recover_all(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;
        for stale in self.inner.instances.list_active().await? {
            if matches!(stale.status, InstanceStatus::Running) {
                self.recover_instance(stale.id).await?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Background sweep that auto-fails suspended instances past their
    /// wall-clock deadline.
    pub fn spawn_deadline_monitor(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = engine.sweep_deadlines().await {
                    tracing::warn!(error = %err, "deadline sweep failed");
                }
            }
        })
    }

    pub async fn sweep_deadlines(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        for stale in self.inner.instances.list_active().await? {
            if !(stale.is_suspended() && now > stale.deadline) {
                continue;
            }
            let id = stale.id;
            let lock = self.lock_for(id).await;
            let _guard = lock.lock().await;
            let Ok(mut instance) = self.load_instance(id).await else {
                continue;
            };
            if instance.is_suspended() && now > instance.deadline {
                instance.fail("deadline_exceeded");
                if let Ok(version) = self
                    .inner
                    .instances
                    .save(&instance, instance.store_version)
                    .await
                {
                    instance.store_version = version;
                    self.inner.events.emit(ExecutionEvent::InstanceFailed {
                        instance_id: id,
                        reason: "deadline_exceeded".to_string(),
                        timestamp: Utc::now(),
                    });
                    tracing::warn!(instance = %id, "suspended instance passed its deadline");
                }
                self.forget(id).await;
            }
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.inner.registry
    }

    /// Run the orchestrator with the lock already held, then deal with the
    /// settled state: schedule the timeout resume for suspensions, drop
    /// bookkeeping for terminal instances.
    async fn settle(
        &self,
        definition: Arc<FlowDefinition>,
        id: InstanceId,
    ) -> Result<FlowInstance, EngineError> {
        let cancel = self.cancel_token(id).await;
        let instance = self
            .inner
            .orchestrator
            .run_to_settle(definition, id, cancel)
            .await?;
        match &instance.status {
            InstanceStatus::Suspended {
                resume_key,
                timeout_at: Some(timeout_at),
            } => self.schedule_timeout_resume(id, resume_key.clone(), *timeout_at),
            InstanceStatus::Suspended { .. } => {}
            _ => self.forget(id).await,
        }
        Ok(instance)
    }

    /// Timer-driven auto-resume with a synthetic timed-out payload. A
    /// manual resume that got there first wins: the late timer resume is
    /// rejected by the status/key check and discarded.
    fn schedule_timeout_resume(
        &self,
        id: InstanceId,
        resume_key: String,
        timeout_at: DateTime<Utc>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let wait = (timeout_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            let payload = Value::Object(HashMap::from([(
                "timed_out".to_string(),
                Value::Bool(true),
            )]));
            if let Err(err) = engine.resume_instance(id, &resume_key, payload).await {
                tracing::debug!(instance = %id, error = %err, "timed-out resume discarded");
            }
        });
    }

    async fn lock_for(&self, id: InstanceId) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    async fn cancel_token(&self, id: InstanceId) -> CancellationToken {
        let mut cancels = self.inner.cancels.lock().await;
        cancels.entry(id).or_default().clone()
    }

    async fn forget(&self, id: InstanceId) {
        self.inner.locks.lock().await.remove(&id);
        self.inner.cancels.lock().await.remove(&id);
    }

    async fn load_definition(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> Result<FlowDefinition, EngineError> {
        self.inner
            .definitions
            .get(id, version)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => EngineError::DefinitionNotFound(id.to_string()),
                other => other.into(),
            })
    }

    async fn load_instance(&self, id: InstanceId) -> Result<FlowInstance, EngineError> {
        self.inner.instances.load(id).await.map_err(|err| match err {
            StoreError::NotFound(_) => EngineError::InstanceNotFound(id.to_string()),
            other => other.into(),
        })
    }
}
