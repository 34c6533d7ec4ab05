// Step scheduling: decide what an instance should do next from its step results

use super::types::{ProcessInstance, ProcessStep};

/// What the instance task should do after inspecting its step results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Run these steps concurrently as one round, in template order
    Dispatch(Vec<String>),
    /// Every step completed
    Complete,
    /// Every step has a result but at least one failed
    Exhausted { failed: Vec<String> },
    /// Some steps have no result and none can run
    Stalled { waiting: Vec<String> },
}

/// A step is executable iff it has no result yet and every dependency completed.
pub fn is_executable(instance: &ProcessInstance, step: &ProcessStep) -> bool {
    !instance.step_results.contains_key(&step.id)
        && step.dependencies.iter().all(|dep| {
            instance
                .step_results
                .get(dep)
                .is_some_and(|r| r.is_completed())
        })
}

pub fn executable_steps(instance: &ProcessInstance) -> Vec<&ProcessStep> {
    instance
        .steps
        .iter()
        .filter(|step| is_executable(instance, step))
        .collect()
}

pub fn next_decision(instance: &ProcessInstance) -> ScheduleDecision {
    let ready: Vec<String> = executable_steps(instance)
        .into_iter()
        .map(|s| s.id.clone())
        .collect();

    if !ready.is_empty() {
        return ScheduleDecision::Dispatch(ready);
    }
    if instance.is_complete() {
        return ScheduleDecision::Complete;
    }
    if instance.all_accounted_for() {
        return ScheduleDecision::Exhausted {
            failed: instance.failed_steps().into_iter().map(String::from).collect(),
        };
    }

    let waiting = instance
        .steps
        .iter()
        .filter(|s| !instance.step_results.contains_key(&s.id))
        .map(|s| s.id.clone())
        .collect();
    ScheduleDecision::Stalled { waiting }
}
