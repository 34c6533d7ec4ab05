//! Runs a single step to its final result: permit acquisition, per-attempt
//! timeout with cooperative cancellation, and bounded retries.

use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::errors::WorkflowError;
use super::executor::{ExecutionError, RegisteredComponent};
use super::state::ProcessState;
use super::types::{InstanceId, ProcessStep, StepError, StepErrorKind, StepResult, StepStatus};

/// Everything a step needs while it runs, detached from the instance task
pub(crate) struct StepRunner {
    pub instance_id: InstanceId,
    pub step: ProcessStep,
    pub component: RegisteredComponent,
    /// Cancelled when the round is torn down (abort or critical failure)
    pub round_cancel: CancellationToken,
    /// Lifecycle state of the owning instance; retries wait while it is paused
    pub state: watch::Receiver<ProcessState>,
    pub retry_delay: Duration,
    pub cancel_grace: Duration,
}

impl StepRunner {
    pub async fn run(mut self, mut result: StepResult) -> StepResult {
        let max_attempts = self.step.max_attempts();

        for attempt in 1..=max_attempts {
            if attempt > 1 && !self.ready_for_retry().await {
                result.error = Some(cancelled_error("Retry abandoned"));
                break;
            }
            if self.round_cancel.is_cancelled() {
                result.error = Some(cancelled_error("Step cancelled before attempt"));
                break;
            }

            result.attempts = attempt;
            debug!(
                instance_id = %self.instance_id,
                step_id = %self.step.id,
                attempt,
                max_attempts,
                "Executing step"
            );

            let token = self.round_cancel.child_token();
            match self.attempt(token).await {
                Ok(output) => {
                    info!(
                        instance_id = %self.instance_id,
                        step_id = %self.step.id,
                        attempts = attempt,
                        "Step completed"
                    );
                    result.status = StepStatus::Completed;
                    result.output = Some(output);
                    result.error = None;
                    result.finished_at = Some(Utc::now());
                    return result;
                }
                Err(error) => {
                    warn!(
                        instance_id = %self.instance_id,
                        step_id = %self.step.id,
                        attempt,
                        max_attempts,
                        kind = ?error.kind,
                        error = %error.message,
                        "Step attempt failed"
                    );
                    let cancelled = error.kind == StepErrorKind::Cancelled;
                    result.error = Some(error);
                    if cancelled {
                        break;
                    }
                }
            }
        }

        result.status = StepStatus::Failed;
        result.finished_at = Some(Utc::now());
        result
    }

    async fn attempt(&mut self, token: CancellationToken) -> Result<Value, StepError> {
        let _permit = self.acquire(&token).await?;

        let execution = self
            .component
            .executor
            .execute(&self.step.parameters, token.clone());
        tokio::pin!(execution);

        let Some(timeout) = self.step.timeout() else {
            return execution.await.map_err(|e| self.execution_error(e));
        };

        tokio::select! {
            outcome = &mut execution => outcome.map_err(|e| self.execution_error(e)),
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                // The executor gets a bounded window to observe the token
                if tokio::time::timeout(self.cancel_grace, &mut execution).await.is_err() {
                    warn!(
                        instance_id = %self.instance_id,
                        step_id = %self.step.id,
                        grace_ms = self.cancel_grace.as_millis() as u64,
                        "Executor ignored cancellation, dropping call"
                    );
                }
                let timeout_ms = timeout.as_millis() as u64;
                Err(StepError {
                    kind: StepErrorKind::Timeout,
                    message: WorkflowError::Timeout {
                        step_id: self.step.id.clone(),
                        timeout_ms,
                    }
                    .to_string(),
                })
            }
        }
    }

    /// Take a component permit, but only hand it out while the instance is
    /// running. A pause observed after the wait releases the permit again.
    async fn acquire(
        &mut self,
        token: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, StepError> {
        loop {
            let permit = tokio::select! {
                permit = self.component.permits.clone().acquire_owned() => permit
                    .map_err(|_| cancelled_error("Component permits closed"))?,
                _ = token.cancelled() => return Err(cancelled_error("Cancelled while waiting for component")),
            };

            let state = *self.state.borrow();
            match state {
                ProcessState::Running => return Ok(permit),
                ProcessState::Paused => {
                    drop(permit);
                    debug!(
                        instance_id = %self.instance_id,
                        step_id = %self.step.id,
                        "Instance paused while waiting for component, permit released"
                    );
                    let resumed = tokio::select! {
                        outcome = self.state.wait_for(|s| *s != ProcessState::Paused) => outcome.is_ok(),
                        _ = token.cancelled() => false,
                    };
                    if !resumed {
                        return Err(cancelled_error("Cancelled while paused"));
                    }
                }
                other => {
                    return Err(cancelled_error(&format!(
                        "Instance is {other}, step not started"
                    )))
                }
            }
        }
    }

    fn execution_error(&self, source: ExecutionError) -> StepError {
        let kind = match source {
            ExecutionError::Cancelled => StepErrorKind::Cancelled,
            _ => StepErrorKind::Execution,
        };
        StepError {
            kind,
            message: WorkflowError::Execution {
                step_id: self.step.id.clone(),
                source,
            }
            .to_string(),
        }
    }

    /// Wait out the retry delay and any pause. False means the step must not retry.
    async fn ready_for_retry(&mut self) -> bool {
        if !self.retry_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.round_cancel.cancelled() => return false,
            }
        }

        let round_cancel = self.round_cancel.clone();
        let unpaused = tokio::select! {
            settled = self
                .state
                .wait_for(|s| *s != ProcessState::Paused)
                .map(|outcome| outcome.is_ok()) => settled,
            _ = round_cancel.cancelled() => false,
        };
        let running = *self.state.borrow() == ProcessState::Running;
        unpaused && running && !self.round_cancel.is_cancelled()
    }
}

fn cancelled_error(message: &str) -> StepError {
    StepError {
        kind: StepErrorKind::Cancelled,
        message: message.to_string(),
    }
}
