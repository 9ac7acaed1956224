//! Structural validation of workflow specifications.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::context::{parse_handover_key, RETRIEVAL_PREFIX};

use super::error::ValidationError;
use super::spec::{PhaseSpec, TaskSpec, WorkflowSpec};

/// A workflow specification that passed structural validation.
///
/// Immutable once built: every dependency and input reference resolves and
/// the dependency relation is acyclic.
#[derive(Debug, Clone)]
pub struct ValidatedSpec {
    spec: WorkflowSpec,
    task_phase: HashMap<String, usize>,
    topological_order: Vec<String>,
}

impl ValidatedSpec {
    /// Validate a workflow specification.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn new(spec: WorkflowSpec) -> Result<Self, ValidationError> {
        if spec.phases.is_empty() {
            return Err(ValidationError::EmptyWorkflow(spec.name.clone()));
        }

        let mut phase_index: HashMap<&str, usize> = HashMap::new();
        for (idx, phase) in spec.phases.iter().enumerate() {
            check_phase_shape(phase)?;
            if phase_index.insert(phase.id.as_str(), idx).is_some() {
                return Err(ValidationError::DuplicatePhase(phase.id.clone()));
            }
        }

        let mut task_phase: HashMap<String, usize> = HashMap::new();
        for (phase_idx, task) in spec.tasks() {
            if !is_valid_task_id(&task.id) {
                return Err(ValidationError::InvalidTaskId(task.id.clone()));
            }
            if task_phase.insert(task.id.clone(), phase_idx).is_some() {
                return Err(ValidationError::DuplicateTask(task.id.clone()));
            }
        }

        let retrieving: HashSet<&str> = spec
            .tasks()
            .filter(|(_, t)| t.retrieval.is_some())
            .map(|(_, t)| t.id.as_str())
            .collect();
        for (phase_idx, task) in spec.tasks() {
            let tables = References {
                phases: &spec.phases,
                phase_index: &phase_index,
                task_phase: &task_phase,
                retrieving: &retrieving,
            };
            check_references(task, phase_idx, &tables)?;
        }

        let topological_order = topological_order(&spec)?;

        Ok(Self {
            spec,
            task_phase,
            topological_order,
        })
    }

    /// The underlying specification.
    #[must_use]
    pub fn spec(&self) -> &WorkflowSpec {
        &self.spec
    }

    /// Workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Index of the phase owning `task_id`.
    #[must_use]
    pub fn phase_of(&self, task_id: &str) -> Option<usize> {
        self.task_phase.get(task_id).copied()
    }

    /// Task ids ordered so that every dependency precedes its dependents.
    ///
    /// Ties are broken by definition order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    /// Consume into the underlying specification.
    #[must_use]
    pub fn into_spec(self) -> WorkflowSpec {
        self.spec
    }
}

fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/') && !id.contains(':')
}

fn check_phase_shape(phase: &PhaseSpec) -> Result<(), ValidationError> {
    if phase.tasks.is_empty() {
        return Err(ValidationError::EmptyPhase(phase.id.clone()));
    }
    if phase.concurrency.limit() == 0 {
        return Err(ValidationError::InvalidConcurrency(phase.id.clone()));
    }
    Ok(())
}

/// Lookup tables used to resolve a task's references.
struct References<'a> {
    phases: &'a [PhaseSpec],
    phase_index: &'a HashMap<&'a str, usize>,
    task_phase: &'a HashMap<String, usize>,
    /// Tasks that declare a retrieval request.
    retrieving: &'a HashSet<&'a str>,
}

fn check_references(
    task: &TaskSpec,
    phase_idx: usize,
    refs: &References<'_>,
) -> Result<(), ValidationError> {
    let References {
        phases,
        phase_index,
        task_phase,
        retrieving,
    } = refs;

    for dep in &task.depends_on {
        match task_phase.get(dep) {
            None => {
                return Err(ValidationError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })
            }
            Some(&dep_phase) if dep_phase > phase_idx => {
                return Err(ValidationError::ForwardDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })
            }
            Some(_) => {}
        }
    }

    for key in &task.inputs {
        if let Some(phase_id) = parse_handover_key(key) {
            let Some(&source_idx) = phase_index.get(phase_id) else {
                return Err(ValidationError::UnknownHandover {
                    task: task.id.clone(),
                    phase: phase_id.to_string(),
                });
            };
            if !phases[source_idx].checkpoint {
                return Err(ValidationError::HandoverWithoutCheckpoint {
                    task: task.id.clone(),
                    phase: phase_id.to_string(),
                });
            }
            if source_idx >= phase_idx {
                return Err(ValidationError::HandoverNotEarlier {
                    task: task.id.clone(),
                    phase: phase_id.to_string(),
                });
            }
            continue;
        }

        let (referenced, is_retrieval) = match key.strip_prefix(RETRIEVAL_PREFIX) {
            Some(source) => (source, true),
            None => (key.as_str(), false),
        };
        let Some(&source_phase) = task_phase.get(referenced) else {
            return Err(ValidationError::UnknownInput {
                task: task.id.clone(),
                key: key.clone(),
            });
        };
        if is_retrieval && !retrieving.contains(referenced) {
            return Err(ValidationError::UnknownInput {
                task: task.id.clone(),
                key: key.clone(),
            });
        }
        // Earlier phases are settled before this one starts
        if source_phase >= phase_idx && !task.depends_on.iter().any(|d| d == referenced) {
            return Err(ValidationError::UnorderedInput {
                task: task.id.clone(),
                key: key.clone(),
            });
        }
    }

    if task.retrieval.as_ref().is_some_and(|r| r.k == Some(0)) {
        return Err(ValidationError::InvalidRetrieval(task.id.clone()));
    }

    Ok(())
}

/// Kahn's algorithm over all tasks, seeded and drained in definition order.
fn topological_order(spec: &WorkflowSpec) -> Result<Vec<String>, ValidationError> {
    let ids: Vec<&str> = spec.tasks().map(|(_, t)| t.id.as_str()).collect();
    let position: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut in_degree = vec![0usize; ids.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (_, task) in spec.tasks() {
        let idx = position[task.id.as_str()];
        let unique: HashSet<&str> = task.depends_on.iter().map(String::as_str).collect();
        for dep in unique {
            in_degree[idx] += 1;
            dependents[position[dep]].push(idx);
            dependencies[idx].push(position[dep]);
        }
    }

    let mut queue: VecDeque<usize> = (0..ids.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());

    while let Some(idx) = queue.pop_front() {
        order.push(ids[idx].to_string());
        let mut next = Vec::new();
        for &dependent in &dependents[idx] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                next.push(dependent);
            }
        }
        next.sort_unstable();
        queue.extend(next);
    }

    if order.len() == ids.len() {
        return Ok(order);
    }

    let remaining: HashSet<usize> = (0..ids.len()).filter(|&i| in_degree[i] > 0).collect();
    let cycle = find_cycle(&remaining, &dependencies)
        .into_iter()
        .map(|i| ids[i].to_string())
        .collect();
    Err(ValidationError::DependencyCycle { tasks: cycle })
}

/// Walk dependencies from the lowest remaining node until a node repeats.
///
/// Every node left over by Kahn's algorithm still has an unprocessed
/// dependency, so the walk never dead-ends. The result reads as
/// "depends on" from left to right.
fn find_cycle(remaining: &HashSet<usize>, dependencies: &[Vec<usize>]) -> Vec<usize> {
    let Some(&start) = remaining.iter().min() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(&next) = dependencies[current]
            .iter()
            .filter(|d| remaining.contains(d))
            .min()
        else {
            return path;
        };
        if let Some(&at) = seen.get(&next) {
            let mut cycle = path[at..].to_vec();
            cycle.push(next);
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ConcurrencyPolicy, RetrievalRequest};

    fn single_phase(tasks: Vec<TaskSpec>) -> WorkflowSpec {
        let mut phase = PhaseSpec::new("p1").concurrency(ConcurrencyPolicy::Parallel(2));
        phase.tasks = tasks;
        WorkflowSpec::new("w").phase(phase)
    }

    #[test]
    fn test_valid_spec_topological_order() {
        let spec = single_phase(vec![
            TaskSpec::new("c", "r").depends_on(["a", "b"]),
            TaskSpec::new("a", "r"),
            TaskSpec::new("b", "r"),
        ]);
        let validated = ValidatedSpec::new(spec).unwrap();
        assert_eq!(validated.topological_order(), ["a", "b", "c"]);
        assert_eq!(validated.phase_of("c"), Some(0));
        assert_eq!(validated.phase_of("zzz"), None);
    }

    #[test]
    fn test_empty_workflow() {
        let err = ValidatedSpec::new(WorkflowSpec::new("w")).unwrap_err();
        assert!(matches!(err, ValidationError::EmptyWorkflow(_)));
    }

    #[test]
    fn test_empty_phase() {
        let err = ValidatedSpec::new(WorkflowSpec::new("w").phase(PhaseSpec::new("p")))
            .unwrap_err();
        assert!(matches!(err, ValidationError::EmptyPhase(p) if p == "p"));
    }

    #[test]
    fn test_zero_parallel_limit() {
        let spec = WorkflowSpec::new("w").phase(
            PhaseSpec::new("p")
                .concurrency(ConcurrencyPolicy::Parallel(0))
                .task(TaskSpec::new("a", "r")),
        );
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::InvalidConcurrency(_)
        ));
    }

    #[test]
    fn test_duplicate_task_across_phases() {
        let spec = WorkflowSpec::new("w")
            .phase(PhaseSpec::new("p1").task(TaskSpec::new("a", "r")))
            .phase(PhaseSpec::new("p2").task(TaskSpec::new("a", "r")));
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::DuplicateTask(id) if id == "a"
        ));
    }

    #[test]
    fn test_duplicate_phase() {
        let spec = WorkflowSpec::new("w")
            .phase(PhaseSpec::new("p").task(TaskSpec::new("a", "r")))
            .phase(PhaseSpec::new("p").task(TaskSpec::new("b", "r")));
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::DuplicatePhase(_)
        ));
    }

    #[test]
    fn test_reserved_characters_in_task_id() {
        for bad in ["a/b", "handover:x", ""] {
            let spec = single_phase(vec![TaskSpec::new(bad, "r")]);
            assert!(matches!(
                ValidatedSpec::new(spec).unwrap_err(),
                ValidationError::InvalidTaskId(_)
            ));
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let spec = single_phase(vec![TaskSpec::new("a", "r").depends_on(["ghost"])]);
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::UnknownDependency { dependency, .. } if dependency == "ghost"
        ));
    }

    #[test]
    fn test_forward_phase_dependency() {
        let spec = WorkflowSpec::new("w")
            .phase(PhaseSpec::new("p1").task(TaskSpec::new("a", "r").depends_on(["b"])))
            .phase(PhaseSpec::new("p2").task(TaskSpec::new("b", "r")));
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::ForwardDependency { .. }
        ));
    }

    #[test]
    fn test_cross_phase_dependency_allowed() {
        let spec = WorkflowSpec::new("w")
            .phase(PhaseSpec::new("p1").task(TaskSpec::new("a", "r")))
            .phase(PhaseSpec::new("p2").task(TaskSpec::new("b", "r").depends_on(["a"])));
        assert!(ValidatedSpec::new(spec).is_ok());
    }

    #[test]
    fn test_unknown_input() {
        let spec = single_phase(vec![TaskSpec::new("a", "r").inputs(["nope"])]);
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::UnknownInput { key, .. } if key == "nope"
        ));
    }

    #[test]
    fn test_retrieval_input_key_resolves_to_task() {
        let spec = single_phase(vec![
            TaskSpec::new("a", "r").retrieval("q", None),
            TaskSpec::new("b", "r").depends_on(["a"]).inputs(["retrieval:a"]),
        ]);
        assert!(ValidatedSpec::new(spec).is_ok());
    }

    #[test]
    fn test_input_from_later_phase_rejected() {
        let spec = WorkflowSpec::new("w")
            .phase(PhaseSpec::new("p1").task(TaskSpec::new("a", "r").inputs(["z"])))
            .phase(PhaseSpec::new("p2").task(TaskSpec::new("z", "r")));
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::UnorderedInput { task, key } if task == "a" && key == "z"
        ));
    }

    #[test]
    fn test_same_phase_input_requires_dependency() {
        let spec = single_phase(vec![
            TaskSpec::new("a", "r").retrieval("q", None),
            TaskSpec::new("b", "r").inputs(["a"]),
        ]);
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::UnorderedInput { key, .. } if key == "a"
        ));

        let spec = single_phase(vec![
            TaskSpec::new("a", "r").retrieval("q", None),
            TaskSpec::new("b", "r").inputs(["retrieval:a"]),
        ]);
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::UnorderedInput { key, .. } if key == "retrieval:a"
        ));
    }

    #[test]
    fn test_earlier_phase_input_needs_no_dependency() {
        let spec = WorkflowSpec::new("w")
            .phase(PhaseSpec::new("p1").task(TaskSpec::new("a", "r")))
            .phase(PhaseSpec::new("p2").task(TaskSpec::new("b", "r").inputs(["a"])));
        assert!(ValidatedSpec::new(spec).is_ok());
    }

    #[test]
    fn test_retrieval_input_requires_retrieval_request() {
        let spec = single_phase(vec![
            TaskSpec::new("a", "r"),
            TaskSpec::new("b", "r").depends_on(["a"]).inputs(["retrieval:a"]),
        ]);
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::UnknownInput { key, .. } if key == "retrieval:a"
        ));
    }

    #[test]
    fn test_handover_rules() {
        let with_checkpoint = PhaseSpec::new("p1")
            .with_checkpoint()
            .task(TaskSpec::new("a", "r"));

        let ok = WorkflowSpec::new("w").phase(with_checkpoint.clone()).phase(
            PhaseSpec::new("p2").task(TaskSpec::new("b", "r").inputs(["handover:p1"])),
        );
        assert!(ValidatedSpec::new(ok).is_ok());

        let unknown = WorkflowSpec::new("w").phase(with_checkpoint.clone()).phase(
            PhaseSpec::new("p2").task(TaskSpec::new("b", "r").inputs(["handover:zz"])),
        );
        assert!(matches!(
            ValidatedSpec::new(unknown).unwrap_err(),
            ValidationError::UnknownHandover { .. }
        ));

        let no_checkpoint = WorkflowSpec::new("w")
            .phase(PhaseSpec::new("p1").task(TaskSpec::new("a", "r")))
            .phase(PhaseSpec::new("p2").task(TaskSpec::new("b", "r").inputs(["handover:p1"])));
        assert!(matches!(
            ValidatedSpec::new(no_checkpoint).unwrap_err(),
            ValidationError::HandoverWithoutCheckpoint { .. }
        ));

        let same_phase = WorkflowSpec::new("w").phase(
            PhaseSpec::new("p1")
                .with_checkpoint()
                .task(TaskSpec::new("a", "r").inputs(["handover:p1"])),
        );
        assert!(matches!(
            ValidatedSpec::new(same_phase).unwrap_err(),
            ValidationError::HandoverNotEarlier { .. }
        ));
    }

    #[test]
    fn test_zero_k_retrieval() {
        let mut task = TaskSpec::new("a", "r");
        task.retrieval = Some(RetrievalRequest {
            query: "q".into(),
            k: Some(0),
        });
        assert!(matches!(
            ValidatedSpec::new(single_phase(vec![task])).unwrap_err(),
            ValidationError::InvalidRetrieval(_)
        ));
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let spec = single_phase(vec![
            TaskSpec::new("a", "r").depends_on(["c"]),
            TaskSpec::new("b", "r").depends_on(["a"]),
            TaskSpec::new("c", "r").depends_on(["b"]),
            TaskSpec::new("d", "r"),
        ]);
        match ValidatedSpec::new(spec).unwrap_err() {
            ValidationError::DependencyCycle { tasks } => {
                assert_eq!(tasks, vec!["a", "c", "b", "a"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let spec = single_phase(vec![TaskSpec::new("a", "r").depends_on(["a"])]);
        assert!(matches!(
            ValidatedSpec::new(spec).unwrap_err(),
            ValidationError::DependencyCycle { .. }
        ));
    }
}
