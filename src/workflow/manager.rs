//! Workflow manager: registry of components and templates, and the front door
//! to every live process instance.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tracing::{info, warn};

use super::errors::{ResourceKind, Result, WorkflowError};
use super::executor::{ComponentExecutor, ComponentRegistry};
use super::instance_task::{Command, CommandEnvelope, InstanceTask};
use super::persistence::{InMemoryProcessStore, PersistReason, ProcessStore};
use super::types::{InstanceId, Metadata, ProcessInstance, WorkflowTemplate};
use crate::config::EngineConfig;

#[derive(Clone)]
struct InstanceHandle {
    commands: mpsc::Sender<CommandEnvelope>,
    snapshot: watch::Receiver<ProcessInstance>,
}

impl InstanceHandle {
    fn current(&self) -> ProcessInstance {
        self.snapshot.borrow().clone()
    }
}

/// Owns the component registry, the template catalogue and the handles of all
/// live instances. Each instance runs in its own task; the manager only sends
/// it commands and reads its published snapshots.
pub struct WorkflowManager {
    registry: Arc<RwLock<ComponentRegistry>>,
    templates: RwLock<HashMap<String, Arc<WorkflowTemplate>>>,
    instances: RwLock<HashMap<InstanceId, InstanceHandle>>,
    store: Arc<dyn ProcessStore>,
    config: EngineConfig,
}

impl WorkflowManager {
    /// Manager with an in-memory store
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryProcessStore::new()))
    }

    pub fn with_store(config: EngineConfig, store: Arc<dyn ProcessStore>) -> Self {
        Self {
            registry: Arc::new(RwLock::new(ComponentRegistry::new())),
            templates: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a component using the configured concurrency cap, if any
    pub async fn register_component(
        &self,
        name: impl Into<String>,
        executor: Arc<dyn ComponentExecutor>,
    ) {
        let name = name.into();
        let cap = self.config.concurrency_for(&name);
        self.registry.write().await.register(name, executor, cap);
    }

    pub async fn register_component_with_limit(
        &self,
        name: impl Into<String>,
        executor: Arc<dyn ComponentExecutor>,
        max_concurrency: usize,
    ) {
        self.registry
            .write()
            .await
            .register(name, executor, Some(max_concurrency));
    }

    pub async fn component_names(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .names()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Validate and register a template.
    ///
    /// Replacing an existing id only affects instances created afterwards.
    pub async fn register_template(&self, template: WorkflowTemplate) -> Result<()> {
        template.validate()?;

        {
            let registry = self.registry.read().await;
            for step in &template.steps {
                if !registry.contains(&step.component) {
                    return Err(WorkflowError::validation(format!(
                        "Step '{}' uses unregistered component '{}'",
                        step.id, step.component
                    )));
                }
            }
        }

        info!(
            template_id = %template.id,
            version = template.version,
            steps = template.steps.len(),
            "Workflow template registered"
        );
        self.templates
            .write()
            .await
            .insert(template.id.clone(), Arc::new(template));
        Ok(())
    }

    pub async fn template(&self, template_id: &str) -> Result<Arc<WorkflowTemplate>> {
        self.templates
            .read()
            .await
            .get(template_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Template, template_id))
    }

    /// Create a PENDING instance from a registered template and spawn its task
    pub async fn create_instance(
        &self,
        template_id: &str,
        batch_id: Option<String>,
        metadata: Metadata,
    ) -> Result<ProcessInstance> {
        let template = self.template(template_id).await?;
        let instance = ProcessInstance::from_template(&template, batch_id, metadata);

        self.store
            .save_instance(&instance, PersistReason::Created)
            .await?;

        let (commands, snapshot) = InstanceTask::spawn(
            instance.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.config.clone(),
        );
        self.instances
            .write()
            .await
            .insert(instance.id, InstanceHandle { commands, snapshot });

        info!(
            instance_id = %instance.id,
            template_id = %template.id,
            batch_id = ?instance.batch_id,
            "Process instance created"
        );
        Ok(instance)
    }

    pub async fn start(&self, instance_id: InstanceId) -> Result<()> {
        self.send(instance_id, Command::Start).await
    }

    pub async fn pause(&self, instance_id: InstanceId) -> Result<()> {
        self.send(instance_id, Command::Pause).await
    }

    pub async fn resume(&self, instance_id: InstanceId) -> Result<()> {
        self.send(instance_id, Command::Resume).await
    }

    /// Abort a non-terminal instance; returns once running steps acknowledged
    /// cancellation or the abort grace period elapsed
    pub async fn abort(&self, instance_id: InstanceId) -> Result<()> {
        self.send(instance_id, Command::Abort).await
    }

    /// Latest snapshot; instances no longer live are read back from the store
    pub async fn status(&self, instance_id: InstanceId) -> Result<ProcessInstance> {
        if let Some(handle) = self.handle(instance_id).await {
            return Ok(handle.current());
        }
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Instance, instance_id.to_string()))
    }

    /// Snapshots of every live instance, oldest first
    pub async fn list(&self) -> Vec<ProcessInstance> {
        let mut snapshots: Vec<ProcessInstance> = self
            .instances
            .read()
            .await
            .values()
            .map(InstanceHandle::current)
            .collect();
        snapshots.sort_by_key(|instance| instance.created_at);
        snapshots
    }

    /// Wait until the instance reaches a terminal state and return that snapshot
    pub async fn wait_for_terminal(&self, instance_id: InstanceId) -> Result<ProcessInstance> {
        let handle = self
            .handle(instance_id)
            .await
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Instance, instance_id.to_string()))?;

        let mut snapshot = handle.snapshot;
        let reached = snapshot
            .wait_for(|instance| instance.state.is_terminal())
            .await
            .map(|instance| instance.clone());
        Ok(match reached {
            Ok(instance) => instance,
            Err(_) => snapshot.borrow().clone(),
        })
    }

    /// Drop a terminal instance from the live registry. Its record stays in the store.
    pub async fn remove(&self, instance_id: InstanceId) -> Result<ProcessInstance> {
        let mut instances = self.instances.write().await;
        let handle = instances
            .get(&instance_id)
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Instance, instance_id.to_string()))?;

        let current = handle.current();
        if !current.state.is_terminal() {
            return Err(WorkflowError::InvalidStateTransition {
                instance_id: instance_id.to_string(),
                from: current.state,
                action: "remove",
            });
        }
        instances.remove(&instance_id);
        Ok(current)
    }

    /// Abort every live, non-terminal instance. The aborts run side by side, so
    /// the whole call is bounded by a single abort grace period.
    pub async fn shutdown(&self) {
        let live: Vec<InstanceId> = self
            .list()
            .await
            .into_iter()
            .filter(|instance| !instance.state.is_terminal())
            .map(|instance| instance.id)
            .collect();

        info!(count = live.len(), "Shutting down workflow manager");
        let aborts = live
            .into_iter()
            .map(|instance_id| async move { (instance_id, self.abort(instance_id).await) });
        for (instance_id, outcome) in join_all(aborts).await {
            if let Err(e) = outcome {
                warn!(instance_id = %instance_id, error = %e, "Abort during shutdown failed");
            }
        }
    }

    async fn handle(&self, instance_id: InstanceId) -> Option<InstanceHandle> {
        self.instances.read().await.get(&instance_id).cloned()
    }

    async fn send(&self, instance_id: InstanceId, command: Command) -> Result<()> {
        let handle = self
            .handle(instance_id)
            .await
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Instance, instance_id.to_string()))?;

        let (reply, response) = oneshot::channel();
        if handle
            .commands
            .send(CommandEnvelope { command, reply })
            .await
            .is_err()
        {
            return Err(rejected(&handle, instance_id, command));
        }
        // A dropped reply means the task finished before handling the command
        response
            .await
            .unwrap_or_else(|_| Err(rejected(&handle, instance_id, command)))
    }
}

fn rejected(handle: &InstanceHandle, instance_id: InstanceId, command: Command) -> WorkflowError {
    WorkflowError::InvalidStateTransition {
        instance_id: instance_id.to_string(),
        from: handle.current().state,
        action: command.event().action(),
    }
}
