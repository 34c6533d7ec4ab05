//! Single-owner task driving one process instance.
//!
//! The task owns its `ProcessInstance` outright. The manager talks to it over
//! an `mpsc` command queue and observes it through a `watch` snapshot, so no
//! lock is ever held across an executor call. Each scheduling round fans out
//! every executable step and handles completions as they arrive; the next
//! round starts only after the current one has fully drained. A critical
//! failure or an abort during a round is held back until that drain is over,
//! so a terminal snapshot never changes afterwards.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::errors::{Result, WorkflowError};
use super::executor::ComponentRegistry;
use super::graph::StepGraph;
use super::persistence::{PersistReason, ProcessStore};
use super::scheduler::{next_decision, ScheduleDecision};
use super::state::{ProcessEvent, ProcessState};
use super::step_runner::StepRunner;
use super::types::{ProcessInstance, StepError, StepErrorKind, StepResult, StepStatus};
use crate::config::EngineConfig;
use crate::telemetry::create_process_span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Pause,
    Resume,
    Abort,
}

impl Command {
    pub fn event(self) -> ProcessEvent {
        match self {
            Command::Start => ProcessEvent::Start,
            Command::Pause => ProcessEvent::Pause,
            Command::Resume => ProcessEvent::Resume,
            Command::Abort => ProcessEvent::Abort,
        }
    }
}

pub(crate) struct CommandEnvelope {
    pub command: Command,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Terminal transition held back until every step of the round has settled
enum Settle {
    Fail(String),
    Abort {
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

/// Bookkeeping for the steps of one round while they are in flight
struct Round {
    cancel: CancellationToken,
    drain_deadline: Option<Instant>,
    cancel_reason: Option<String>,
    settle: Option<Settle>,
}

impl Round {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            drain_deadline: None,
            cancel_reason: None,
            settle: None,
        }
    }

    /// Cancel every in-flight step and bound how long the round may keep draining
    fn begin_drain(&mut self, grace: Duration, reason: &str) {
        if self.drain_deadline.is_some() {
            return;
        }
        self.cancel.cancel();
        self.drain_deadline = Some(Instant::now() + grace);
        self.cancel_reason = Some(reason.to_string());
    }

    /// State the instance enters once the drain finishes, if it is on its way out
    fn settling_to(&self) -> Option<ProcessState> {
        match self.settle {
            Some(Settle::Fail(_)) => Some(ProcessState::Failed),
            Some(Settle::Abort { .. }) => Some(ProcessState::Aborted),
            None => None,
        }
    }
}

pub(crate) struct InstanceTask {
    instance: ProcessInstance,
    registry: Arc<RwLock<ComponentRegistry>>,
    store: Arc<dyn ProcessStore>,
    config: EngineConfig,
    commands: mpsc::Receiver<CommandEnvelope>,
    commands_open: bool,
    snapshot: watch::Sender<ProcessInstance>,
    lifecycle: watch::Sender<ProcessState>,
}

impl InstanceTask {
    /// Spawn the task; returns its command queue and snapshot feed
    pub fn spawn(
        instance: ProcessInstance,
        registry: Arc<RwLock<ComponentRegistry>>,
        store: Arc<dyn ProcessStore>,
        config: EngineConfig,
    ) -> (
        mpsc::Sender<CommandEnvelope>,
        watch::Receiver<ProcessInstance>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(instance.clone());
        let (lifecycle_tx, _) = watch::channel(instance.state);
        let span = create_process_span(
            &instance.id,
            &instance.template_id,
            instance.batch_id.as_deref(),
        );

        let task = Self {
            instance,
            registry,
            store,
            config,
            commands: command_rx,
            commands_open: true,
            snapshot: snapshot_tx,
            lifecycle: lifecycle_tx,
        };
        tokio::spawn(task.run().instrument(span));

        (command_tx, snapshot_rx)
    }

    async fn run(mut self) {
        let mut stalled_polls = 0u32;

        while !self.instance.state.is_terminal() {
            if self.instance.state != ProcessState::Running {
                match self.next_command().await {
                    Some(envelope) => self.handle_command(envelope, None).await,
                    None => self.abort_detached(None).await,
                }
                continue;
            }

            if let Some(step_id) = self.failed_critical_step() {
                self.fail(format!("Critical step '{step_id}' failed")).await;
                continue;
            }

            match next_decision(&self.instance) {
                ScheduleDecision::Dispatch(step_ids) => {
                    stalled_polls = 0;
                    self.run_round(step_ids).await;
                }
                ScheduleDecision::Complete => {
                    if let Err(e) = self.transition(ProcessEvent::Complete, false).await {
                        error!(error = %e, "Failed to complete process instance");
                    }
                }
                ScheduleDecision::Exhausted { failed } => {
                    self.fail(format!("Steps failed: {}", failed.join(", "))).await;
                }
                ScheduleDecision::Stalled { waiting } => {
                    if stalled_polls >= self.config.stall_max_polls {
                        let stalled = WorkflowError::Stalled {
                            instance_id: self.instance.id.to_string(),
                            blocked_by: self.blocking_steps(&waiting),
                            waiting,
                        };
                        self.fail(stalled.to_string()).await;
                        continue;
                    }
                    stalled_polls += 1;
                    debug!(
                        poll = stalled_polls,
                        max_polls = self.config.stall_max_polls,
                        waiting = ?waiting,
                        "No executable steps, polling"
                    );

                    let poll_interval = self.config.stall_poll_interval();
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        command = self.next_command() => match command {
                            Some(envelope) => self.handle_command(envelope, None).await,
                            None => self.abort_detached(None).await,
                        },
                    }
                }
            }
        }

        self.publish();
        info!(
            state = %self.instance.state,
            progress = self.instance.progress_percentage(),
            "Process instance finished"
        );
    }

    async fn run_round(&mut self, step_ids: Vec<String>) {
        let mut round = Round::new();
        let mut in_flight = FuturesUnordered::new();
        let started_at = Utc::now();

        info!(steps = ?step_ids, "Dispatching round");

        for step_id in step_ids {
            let Some(step) = self.instance.step(&step_id).cloned() else {
                continue;
            };
            let component = self.registry.read().await.get(&step.component).cloned();

            match component {
                Ok(component) => {
                    let result = StepResult::running(started_at);
                    self.instance
                        .step_results
                        .insert(step_id.clone(), result.clone());
                    self.instance.current_steps.insert(step_id.clone());

                    let runner = StepRunner {
                        instance_id: self.instance.id,
                        step,
                        component,
                        round_cancel: round.cancel.clone(),
                        state: self.lifecycle.subscribe(),
                        retry_delay: self.config.retry_delay(),
                        cancel_grace: self.config.cancel_grace(),
                    };
                    in_flight.push(async move {
                        let result = runner.run(result).await;
                        (step_id, result)
                    });
                }
                Err(e) => {
                    let result = StepResult {
                        status: StepStatus::Failed,
                        attempts: 0,
                        started_at: Some(started_at),
                        finished_at: Some(started_at),
                        output: None,
                        error: Some(StepError {
                            kind: StepErrorKind::Execution,
                            message: e.to_string(),
                        }),
                    };
                    self.apply_step_result(&mut round, step_id, result).await;
                }
            }
        }

        self.persist(PersistReason::StepUpdate).await;
        self.publish();

        while !in_flight.is_empty() {
            let deadline = round.drain_deadline;
            tokio::select! {
                Some((step_id, result)) = in_flight.next() => {
                    self.apply_step_result(&mut round, step_id, result).await;
                }
                command = self.next_command() => match command {
                    Some(envelope) => self.handle_command(envelope, Some(&mut round)).await,
                    None => self.abort_detached(Some(&mut round)).await,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(
                        unacknowledged = ?self.instance.current_steps,
                        "Grace period expired before every step acknowledged cancellation"
                    );
                    break;
                }
            }
        }
        drop(in_flight);

        if !self.instance.current_steps.is_empty() {
            let reason = round
                .cancel_reason
                .clone()
                .unwrap_or_else(|| "Step cancelled".to_string());
            self.cancel_unfinished_steps(&reason).await;
        }
        self.persist(PersistReason::StepUpdate).await;

        // Terminal states are entered only once no step can change any more
        match round.settle.take() {
            Some(Settle::Fail(reason)) => self.fail(reason).await,
            Some(Settle::Abort { reply }) => {
                let outcome = self.transition(ProcessEvent::Abort, reply.is_some()).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Err(e) = outcome {
                            error!(error = %e, "Failed to abort process instance");
                        }
                    }
                }
            }
            None => self.publish(),
        }
    }

    async fn apply_step_result(&mut self, round: &mut Round, step_id: String, result: StepResult) {
        self.instance.current_steps.remove(&step_id);

        if let Err(e) = self
            .store
            .save_step_result(self.instance.id, &step_id, &result)
            .await
        {
            error!(step_id = %step_id, error = %e, "Failed to persist step result");
        }

        let critical_failure = result.is_failed()
            && self
                .instance
                .step(&step_id)
                .is_some_and(|step| step.critical);
        let message = result
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        self.instance.step_results.insert(step_id.clone(), result);
        self.publish();

        if critical_failure && round.cancel_reason.is_none() {
            error!(step_id = %step_id, error = %message, "Critical step failed");
            round.begin_drain(
                self.config.cancel_grace(),
                "Cancelled after critical step failure",
            );
            if self.instance.state == ProcessState::Running {
                round.settle = Some(Settle::Fail(format!(
                    "Critical step '{step_id}' failed: {message}"
                )));
            }
        }
    }

    async fn handle_command(&mut self, envelope: CommandEnvelope, round: Option<&mut Round>) {
        let CommandEnvelope { command, reply } = envelope;

        if let Some(round) = round {
            if let Some(target) = round.settling_to() {
                let _ = reply.send(Err(WorkflowError::InvalidStateTransition {
                    instance_id: self.instance.id.to_string(),
                    from: target,
                    action: command.event().action(),
                }));
                return;
            }
            if command == Command::Abort {
                // Acknowledged once the round has drained
                info!(
                    running = ?self.instance.current_steps,
                    "Abort requested, draining running steps"
                );
                round.begin_drain(self.config.abort_grace(), "Process aborted");
                round.settle = Some(Settle::Abort { reply: Some(reply) });
                return;
            }
        }

        let outcome = self.transition(command.event(), true).await;
        let _ = reply.send(outcome);
    }

    /// The manager went away; nobody can drive this instance any more
    async fn abort_detached(&mut self, round: Option<&mut Round>) {
        warn!("Command channel closed, aborting process instance");
        match round {
            Some(round) => {
                if round.settle.is_none() {
                    self.instance.failure = Some("Workflow manager dropped".to_string());
                    round.begin_drain(self.config.abort_grace(), "Process aborted");
                    round.settle = Some(Settle::Abort { reply: None });
                }
            }
            None => {
                self.instance.failure = Some("Workflow manager dropped".to_string());
                if let Err(e) = self.transition(ProcessEvent::Abort, false).await {
                    error!(error = %e, "Failed to abort process instance");
                }
            }
        }
    }

    async fn fail(&mut self, reason: String) {
        error!(reason = %reason, "Process instance failed");
        self.instance.failure = Some(reason);
        if let Err(e) = self.transition(ProcessEvent::Fail, false).await {
            error!(error = %e, "Failed to record process failure");
        }
    }

    /// Apply `event` and mirror the new state to the store before publishing it.
    ///
    /// With `strict`, a store failure rolls the transition back and is returned
    /// to the caller; otherwise it is logged and the transition stands.
    async fn transition(&mut self, event: ProcessEvent, strict: bool) -> Result<()> {
        let from = self.instance.state;
        let to = from
            .apply(event)
            .ok_or_else(|| WorkflowError::InvalidStateTransition {
                instance_id: self.instance.id.to_string(),
                from,
                action: event.action(),
            })?;

        let previous = (
            self.instance.state,
            self.instance.started_at,
            self.instance.completed_at,
        );
        let now = Utc::now();
        self.instance.state = to;
        if to == ProcessState::Running && self.instance.started_at.is_none() {
            self.instance.started_at = Some(now);
        }
        if to.is_terminal() {
            self.instance.completed_at = Some(now);
        }

        if let Err(e) = self
            .store
            .save_instance(&self.instance, PersistReason::Transition)
            .await
        {
            if strict {
                (
                    self.instance.state,
                    self.instance.started_at,
                    self.instance.completed_at,
                ) = previous;
                error!(from = %from, to = %to, error = %e, "Transition rejected, store unavailable");
                return Err(e.into());
            }
            error!(from = %from, to = %to, error = %e, "Failed to persist transition");
        }

        self.lifecycle.send_replace(to);
        self.publish();
        info!(from = %from, to = %to, "Process state changed");
        Ok(())
    }

    async fn cancel_unfinished_steps(&mut self, reason: &str) {
        let now = Utc::now();
        let unfinished = std::mem::take(&mut self.instance.current_steps);

        for step_id in unfinished {
            let Some(result) = self.instance.step_results.get_mut(&step_id) else {
                continue;
            };
            result.status = StepStatus::Failed;
            result.finished_at = Some(now);
            result.error = Some(StepError {
                kind: StepErrorKind::Cancelled,
                message: reason.to_string(),
            });
            let result = result.clone();

            if let Err(e) = self
                .store
                .save_step_result(self.instance.id, &step_id, &result)
                .await
            {
                error!(step_id = %step_id, error = %e, "Failed to persist cancelled step");
            }
        }
    }

    /// Failed steps that keep any of `waiting` from ever becoming executable
    fn blocking_steps(&self, waiting: &[String]) -> Vec<String> {
        let failed = self
            .instance
            .step_results
            .iter()
            .filter(|(_, result)| result.is_failed())
            .map(|(id, _)| id.as_str());
        match StepGraph::from_steps(&self.instance.steps) {
            Ok(graph) => graph.blocking_steps(failed, waiting),
            Err(e) => {
                warn!(error = %e, "Could not rebuild step graph for stall diagnostic");
                Vec::new()
            }
        }
    }

    fn failed_critical_step(&self) -> Option<String> {
        self.instance
            .steps
            .iter()
            .find(|step| {
                step.critical
                    && self
                        .instance
                        .step_results
                        .get(&step.id)
                        .is_some_and(StepResult::is_failed)
            })
            .map(|step| step.id.clone())
    }

    async fn next_command(&mut self) -> Option<CommandEnvelope> {
        if !self.commands_open {
            return std::future::pending().await;
        }
        let command = self.commands.recv().await;
        if command.is_none() {
            self.commands_open = false;
        }
        command
    }

    async fn persist(&self, reason: PersistReason) {
        if let Err(e) = self.store.save_instance(&self.instance, reason).await {
            error!(error = %e, "Failed to persist process instance");
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.instance.clone());
    }
}
