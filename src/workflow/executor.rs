//! Component executor contract and the typed registry steps are resolved against.
//!
//! Every step names a component. Components are registered once, up front, and
//! templates referencing an unknown component are rejected at registration
//! rather than failing late during dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::errors::{ResourceKind, Result, WorkflowError};
use super::types::StepParameters;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Execution failed: {message}")]
    Failed { message: String },
    #[error("Invalid parameters: {message}")]
    InvalidParameters { message: String },
    #[error("Execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutionError::Failed {
            message: message.into(),
        }
    }
}

/// Uniform interface a workflow step invokes.
///
/// Implementations must watch `cancel` at their own suspend points and return
/// promptly (typically with [`ExecutionError::Cancelled`]) once it fires. The
/// engine never drops an in-flight call before giving it a grace period.
#[async_trait]
pub trait ComponentExecutor: Send + Sync {
    async fn execute(
        &self,
        parameters: &StepParameters,
        cancel: CancellationToken,
    ) -> std::result::Result<Value, ExecutionError>;
}

/// A registered executor plus the permits bounding its concurrent calls
#[derive(Clone)]
pub struct RegisteredComponent {
    pub name: String,
    pub executor: Arc<dyn ComponentExecutor>,
    pub permits: Arc<Semaphore>,
    pub max_concurrency: Option<usize>,
}

impl std::fmt::Debug for RegisteredComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredComponent")
            .field("name", &self.name)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// Name to executor map, resolved when templates are registered
#[derive(Debug, Default, Clone)]
pub struct ComponentRegistry {
    components: HashMap<String, RegisteredComponent>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a component. `max_concurrency = None` means unbounded.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        executor: Arc<dyn ComponentExecutor>,
        max_concurrency: Option<usize>,
    ) {
        let name = name.into();
        let permits = match max_concurrency {
            Some(cap) => Semaphore::new(cap.max(1)),
            None => Semaphore::new(Semaphore::MAX_PERMITS),
        };
        tracing::info!(component = %name, max_concurrency = ?max_concurrency, "Component registered");
        self.components.insert(
            name.clone(),
            RegisteredComponent {
                name,
                executor,
                permits: Arc::new(permits),
                max_concurrency,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&RegisteredComponent> {
        self.components
            .get(name)
            .ok_or_else(|| WorkflowError::not_found(ResourceKind::Component, name))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.components.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ComponentExecutor for Echo {
        async fn execute(
            &self,
            parameters: &StepParameters,
            _cancel: CancellationToken,
        ) -> std::result::Result<Value, ExecutionError> {
            Ok(Value::Object(parameters.clone()))
        }
    }

    #[tokio::test]
    async fn registered_component_is_resolvable() {
        let mut registry = ComponentRegistry::new();
        registry.register("echo", Arc::new(Echo), Some(2));

        let component = registry.get("echo").unwrap();
        assert_eq!(component.permits.available_permits(), 2);

        let mut params = StepParameters::new();
        params.insert("k".into(), Value::from(1));
        let out = component
            .executor
            .execute(&params, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["k"], 1);
    }

    #[test]
    fn unknown_component_is_not_found() {
        let registry = ComponentRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::NotFound {
                kind: ResourceKind::Component,
                ..
            }
        ));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = ComponentRegistry::new();
        registry.register("zeta", Arc::new(Echo), None);
        registry.register("alpha", Arc::new(Echo), None);
        assert_eq!(registry.names(), vec!["alpha", "zeta"]);
    }
}
