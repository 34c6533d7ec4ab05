use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use super::state::ProcessState;
use super::types::{InstanceId, ProcessInstance, StepResult};

/// Errors raised by a process store
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Instance {instance_id} is not in the store")]
    MissingInstance { instance_id: InstanceId },
}

/// Why a record was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistReason {
    Created,
    Transition,
    StepUpdate,
}

/// External persistence boundary.
///
/// Every instance transition and step-result update is mirrored here before
/// the engine treats it as committed.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn save_instance(
        &self,
        instance: &ProcessInstance,
        reason: PersistReason,
    ) -> Result<(), PersistenceError>;

    async fn save_step_result(
        &self,
        instance_id: InstanceId,
        step_id: &str,
        result: &StepResult,
    ) -> Result<(), PersistenceError>;

    async fn load_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<ProcessInstance>, PersistenceError>;
}

/// Process store kept in memory; also records the sequence of persisted states
#[derive(Debug, Default)]
pub struct InMemoryProcessStore {
    instances: RwLock<HashMap<InstanceId, ProcessInstance>>,
    transitions: RwLock<Vec<(InstanceId, ProcessState)>>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// States written for `instance_id`, oldest first
    pub async fn state_history(&self, instance_id: InstanceId) -> Vec<ProcessState> {
        self.transitions
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id == instance_id)
            .map(|(_, state)| *state)
            .collect()
    }
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn save_instance(
        &self,
        instance: &ProcessInstance,
        reason: PersistReason,
    ) -> Result<(), PersistenceError> {
        self.instances
            .write()
            .await
            .insert(instance.id, instance.clone());
        if reason != PersistReason::StepUpdate {
            self.transitions
                .write()
                .await
                .push((instance.id, instance.state));
        }
        Ok(())
    }

    async fn save_step_result(
        &self,
        instance_id: InstanceId,
        step_id: &str,
        result: &StepResult,
    ) -> Result<(), PersistenceError> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(&instance_id)
            .ok_or(PersistenceError::MissingInstance { instance_id })?;
        stored
            .step_results
            .insert(step_id.to_string(), result.clone());
        Ok(())
    }

    async fn load_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<ProcessInstance>, PersistenceError> {
        Ok(self.instances.read().await.get(&instance_id).cloned())
    }
}

/// On-disk record, one JSON file per instance
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceRecord {
    instance: ProcessInstance,
    reason: PersistReason,
    persisted_at: chrono::DateTime<chrono::Utc>,
}

/// Process store writing one pretty-printed JSON document per instance
#[derive(Debug)]
pub struct JsonFileProcessStore {
    directory: PathBuf,
    // Serializes read-modify-write cycles on step updates
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileProcessStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn instance_path(&self, instance_id: InstanceId) -> PathBuf {
        self.directory.join(format!("{instance_id}.instance.json"))
    }

    async fn write_record(&self, record: &InstanceRecord) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.directory).await?;
        let path = self.instance_path(record.instance.id);
        let serialized = serde_json::to_string_pretty(record)?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serialized).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            instance_id = %record.instance.id,
            state = %record.instance.state,
            reason = ?record.reason,
            file = ?path,
            "Instance persisted"
        );
        Ok(())
    }

    async fn read_record(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<InstanceRecord>, PersistenceError> {
        let path = self.instance_path(instance_id);
        match fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProcessStore for JsonFileProcessStore {
    async fn save_instance(
        &self,
        instance: &ProcessInstance,
        reason: PersistReason,
    ) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        self.write_record(&InstanceRecord {
            instance: instance.clone(),
            reason,
            persisted_at: chrono::Utc::now(),
        })
        .await
    }

    async fn save_step_result(
        &self,
        instance_id: InstanceId,
        step_id: &str,
        result: &StepResult,
    ) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read_record(instance_id)
            .await?
            .ok_or(PersistenceError::MissingInstance { instance_id })?;
        record
            .instance
            .step_results
            .insert(step_id.to_string(), result.clone());
        record.reason = PersistReason::StepUpdate;
        record.persisted_at = chrono::Utc::now();
        self.write_record(&record).await
    }

    async fn load_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<ProcessInstance>, PersistenceError> {
        Ok(self.read_record(instance_id).await?.map(|r| r.instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Metadata, ProcessStep, StepStatus, WorkflowTemplate};
    use chrono::Utc;
    use tempfile::TempDir;

    fn instance() -> ProcessInstance {
        let tpl = WorkflowTemplate::new("tpl", "Test").with_step(ProcessStep::new("a", "noop"));
        ProcessInstance::from_template(&tpl, Some("batch-7".into()), Metadata::new())
    }

    #[tokio::test]
    async fn in_memory_store_tracks_transitions() {
        let store = InMemoryProcessStore::new();
        let mut inst = instance();
        store.save_instance(&inst, PersistReason::Created).await.unwrap();
        inst.state = ProcessState::Running;
        store.save_instance(&inst, PersistReason::Transition).await.unwrap();
        store
            .save_step_result(inst.id, "a", &StepResult::running(Utc::now()))
            .await
            .unwrap();

        assert_eq!(
            store.state_history(inst.id).await,
            vec![ProcessState::Pending, ProcessState::Running]
        );
        let loaded = store.load_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.step_status("a"), StepStatus::Running);
    }

    #[tokio::test]
    async fn json_store_round_trips_instance() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileProcessStore::new(dir.path());
        let inst = instance();

        store.save_instance(&inst, PersistReason::Created).await.unwrap();
        let mut done = StepResult::running(Utc::now());
        done.status = StepStatus::Completed;
        store.save_step_result(inst.id, "a", &done).await.unwrap();

        let loaded = store.load_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.batch_id.as_deref(), Some("batch-7"));
        assert_eq!(loaded.step_status("a"), StepStatus::Completed);

        let raw = std::fs::read_to_string(dir.path().join(format!("{}.instance.json", inst.id)))
            .unwrap();
        assert!(raw.contains("\"PENDING\""));
    }

    #[tokio::test]
    async fn json_store_missing_instance() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileProcessStore::new(dir.path());
        let id = uuid::Uuid::new_v4();

        assert!(store.load_instance(id).await.unwrap().is_none());
        let err = store
            .save_step_result(id, "a", &StepResult::running(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::MissingInstance { .. }));
    }
}
