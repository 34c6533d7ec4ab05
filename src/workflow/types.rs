// Workflow data model: templates, steps, step results and process instances

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::errors::Result;
use super::graph::StepGraph;
use super::state::ProcessState;

/// Parameters handed to a component executor, exactly as written in the template
pub type StepParameters = serde_json::Map<String, Value>;

/// Opaque caller metadata; never interpreted by the engine
pub type Metadata = serde_json::Map<String, Value>;

pub type InstanceId = Uuid;

/// One unit of orchestrated work, bound to a named component executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub component: String,
    #[serde(default)]
    pub parameters: StepParameters,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra attempts after the first failure
    #[serde(default)]
    pub retry_count: u32,
    /// Failure of a critical step fails the whole instance
    #[serde(default)]
    pub critical: bool,
}

impl ProcessStep {
    pub fn new(id: impl Into<String>, component: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            component: component.into(),
            parameters: StepParameters::new(),
            dependencies: Vec::new(),
            timeout_ms: None,
            retry_count: 0,
            critical: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Upper bound on execution attempts for this step
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// A named, versioned step graph that instances are created from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub steps: Vec<ProcessStep>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: default_version(),
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: ProcessStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Structural validation: unique ids, known dependencies, no cycles.
    ///
    /// Component names are checked separately against the executor registry.
    pub fn validate(&self) -> Result<StepGraph> {
        use super::errors::WorkflowError;

        if self.id.trim().is_empty() {
            return Err(WorkflowError::validation("Template id must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::validation(format!(
                "Template '{}' has no steps",
                self.id
            )));
        }
        let graph = StepGraph::from_steps(&self.steps)?;
        graph.ensure_acyclic()?;
        Ok(graph)
    }

    pub fn step(&self, id: &str) -> Option<&ProcessStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    Timeout,
    Execution,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

/// Recorded outcome of one step within one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            status: StepStatus::Running,
            attempts: 0,
            started_at: Some(started_at),
            finished_at: None,
            output: None,
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// One concrete execution of a workflow template.
///
/// Steps are a value copy of the template at creation time, so later template
/// edits never reach a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: InstanceId,
    pub template_id: String,
    pub template_name: String,
    pub template_version: u32,
    pub batch_id: Option<String>,
    pub state: ProcessState,
    pub current_steps: BTreeSet<String>,
    pub steps: Vec<ProcessStep>,
    pub step_results: BTreeMap<String, StepResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    /// Instance-level diagnostic when the instance failed or was aborted
    pub failure: Option<String>,
}

impl ProcessInstance {
    pub fn from_template(
        template: &WorkflowTemplate,
        batch_id: Option<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            template_version: template.version,
            batch_id,
            state: ProcessState::Pending,
            current_steps: BTreeSet::new(),
            steps: template.steps.clone(),
            step_results: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata,
            failure: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&ProcessStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Status of a step, `Pending` when it has no result yet
    pub fn step_status(&self, id: &str) -> StepStatus {
        self.step_results
            .get(id)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn completed_count(&self) -> usize {
        self.step_results.values().filter(|r| r.is_completed()).count()
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.completed_count() as f64 / self.steps.len() as f64 * 100.0
    }

    /// Every step has a completed result
    pub fn is_complete(&self) -> bool {
        self.steps
            .iter()
            .all(|s| self.step_results.get(&s.id).is_some_and(StepResult::is_completed))
    }

    /// Every step has some result, successful or not
    pub fn all_accounted_for(&self) -> bool {
        self.steps.iter().all(|s| self.step_results.contains_key(&s.id))
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.step_results
            .iter()
            .filter(|(_, r)| r.is_failed())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> WorkflowTemplate {
        WorkflowTemplate::new("tpl", "Fiber attach")
            .with_step(ProcessStep::new("coarse", "aligner"))
            .with_step(ProcessStep::new("fine", "aligner").with_dependencies(["coarse"]))
    }

    #[test]
    fn instance_copies_template_steps() {
        let mut tpl = template();
        let instance = ProcessInstance::from_template(&tpl, None, Metadata::new());

        tpl.steps[0].parameters.insert("mutated".into(), Value::Bool(true));
        assert!(instance.steps[0].parameters.is_empty());
        assert_eq!(instance.state, ProcessState::Pending);
        assert_eq!(instance.template_version, 1);
    }

    #[test]
    fn progress_counts_only_completed_steps() {
        let mut instance = ProcessInstance::from_template(&template(), None, Metadata::new());
        assert_eq!(instance.progress_percentage(), 0.0);

        let mut done = StepResult::running(Utc::now());
        done.status = StepStatus::Completed;
        instance.step_results.insert("coarse".into(), done);
        assert_eq!(instance.progress_percentage(), 50.0);

        let mut failed = StepResult::running(Utc::now());
        failed.status = StepStatus::Failed;
        instance.step_results.insert("fine".into(), failed);
        assert_eq!(instance.progress_percentage(), 50.0);
        assert!(instance.all_accounted_for());
        assert!(!instance.is_complete());
        assert_eq!(instance.failed_steps(), vec!["fine"]);
    }

    #[test]
    fn missing_result_reads_as_pending() {
        let instance = ProcessInstance::from_template(&template(), None, Metadata::new());
        assert_eq!(instance.step_status("fine"), StepStatus::Pending);
    }

    #[test]
    fn template_parses_from_toml() {
        let raw = r#"
            id = "attach"
            name = "Fiber attach"
            version = 2

            [[steps]]
            id = "coarse"
            component = "aligner"
            critical = true
            timeout_ms = 5000

            [[steps]]
            id = "fine"
            component = "aligner"
            dependencies = ["coarse"]
            retry_count = 2
            parameters = { strategy = "gradient" }
        "#;
        let tpl: WorkflowTemplate = toml::from_str(raw).unwrap();
        assert_eq!(tpl.version, 2);
        assert!(tpl.step("coarse").unwrap().critical);
        assert_eq!(tpl.step("fine").unwrap().max_attempts(), 3);
        assert_eq!(
            tpl.step("fine").unwrap().parameters.get("strategy"),
            Some(&Value::String("gradient".into()))
        );
        assert!(tpl.validate().is_ok());
    }

    #[test]
    fn empty_template_is_invalid() {
        let tpl = WorkflowTemplate::new("empty", "Empty");
        assert!(tpl.validate().is_err());
    }
}
