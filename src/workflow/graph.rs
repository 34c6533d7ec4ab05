//! Step dependency graph used to validate templates at registration time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::errors::{Result, WorkflowError};
use super::types::ProcessStep;

/// Dependency relationships between the steps of one template.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    /// Step id to its direct dependencies.
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Step id to the steps that depend on it.
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl StepGraph {
    /// Build the graph for `steps`.
    ///
    /// Fails if step ids repeat, a step depends on itself, or a dependency
    /// references a step outside the set.
    pub fn from_steps(steps: &[ProcessStep]) -> Result<Self> {
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for step in steps {
            if step.id.trim().is_empty() {
                return Err(WorkflowError::validation("Step ids must not be empty"));
            }
            let deps: BTreeSet<String> = step.dependencies.iter().cloned().collect();
            if deps.contains(&step.id) {
                return Err(WorkflowError::validation(format!(
                    "Step '{}' depends on itself",
                    step.id
                )));
            }
            if dependencies.insert(step.id.clone(), deps).is_some() {
                return Err(WorkflowError::validation(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = dependencies
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for (step, deps) in &dependencies {
            for dep in deps {
                match dependents.get_mut(dep) {
                    Some(set) => {
                        set.insert(step.clone());
                    }
                    None => {
                        return Err(WorkflowError::validation(format!(
                            "Step '{step}' depends on unknown step '{dep}'"
                        )));
                    }
                }
            }
        }

        Ok(Self {
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependents_of(&self, step: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(step)
    }

    /// Find a dependency cycle, returning its path (first node repeated at the end).
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Visiting,
            Visited,
        }

        fn dfs<'a>(
            node: &'a str,
            graph: &'a StepGraph,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(node, Mark::Visiting);
            path.push(node);

            if let Some(deps) = graph.dependencies.get(node) {
                for dep in deps {
                    match marks.get(dep.as_str()).copied().unwrap_or(Mark::Unvisited) {
                        Mark::Visiting => {
                            let start = path.iter().position(|s| *s == dep.as_str())?;
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(dep.clone());
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            if let Some(cycle) = dfs(dep, graph, marks, path) {
                                return Some(cycle);
                            }
                        }
                        Mark::Visited => {}
                    }
                }
            }

            path.pop();
            marks.insert(node, Mark::Visited);
            None
        }

        let mut marks: HashMap<&str, Mark> = self
            .dependencies
            .keys()
            .map(|s| (s.as_str(), Mark::Unvisited))
            .collect();
        let mut path = Vec::new();

        for step in self.dependencies.keys() {
            if marks.get(step.as_str()) == Some(&Mark::Unvisited) {
                if let Some(cycle) = dfs(step, self, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Reject the graph if it contains a cycle.
    pub fn ensure_acyclic(&self) -> Result<()> {
        match self.find_cycle() {
            Some(cycle) => Err(WorkflowError::validation(format!(
                "Circular dependency detected: {}",
                cycle.join(" -> ")
            ))),
            None => Ok(()),
        }
    }

    /// Every step that depends on `step`, directly or transitively.
    pub fn transitive_dependents(&self, step: &str) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let mut to_visit = vec![step.to_string()];

        while let Some(current) = to_visit.pop() {
            if let Some(dependents) = self.dependents_of(&current) {
                for dep in dependents {
                    if result.insert(dep.clone()) {
                        to_visit.push(dep.clone());
                    }
                }
            }
        }
        result
    }

    /// The steps in `failed` that sit upstream of at least one `waiting` step
    pub fn blocking_steps<'a, I>(&self, failed: I, waiting: &[String]) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        failed
            .into_iter()
            .filter(|step| {
                let downstream = self.transitive_dependents(step);
                waiting.iter().any(|w| downstream.contains(w))
            })
            .map(String::from)
            .collect()
    }
}
