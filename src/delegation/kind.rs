//! Task kinds and delegated child declarations.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::error::DelegationError;

/// How a manager combines its children's outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationStrategy {
    /// One object keyed by child name.
    Merge,
    /// Array of outputs in delegation order.
    Concat,
    /// A single output chosen by an [`Evaluator`](super::Evaluator).
    SelectBest,
}

impl AggregationStrategy {
    /// Whether a failed child fails the manager.
    #[must_use]
    pub fn requires_all_children(&self) -> bool {
        !matches!(self, Self::SelectBest)
    }
}

/// Whether a task does the work itself or delegates it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Produces its output directly.
    #[default]
    Specialist,
    /// Produces child tasks and aggregates their outputs.
    Manager { aggregation: AggregationStrategy },
}

impl TaskKind {
    /// Manager with the given aggregation strategy.
    #[must_use]
    pub fn manager(aggregation: AggregationStrategy) -> Self {
        Self::Manager { aggregation }
    }

    /// Whether this is a manager.
    #[must_use]
    pub fn is_manager(&self) -> bool {
        matches!(self, Self::Manager { .. })
    }

    /// The aggregation strategy, for managers.
    #[must_use]
    pub fn aggregation(&self) -> Option<AggregationStrategy> {
        match self {
            Self::Specialist => None,
            Self::Manager { aggregation } => Some(*aggregation),
        }
    }
}

/// A child task produced by a manager's worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedTask {
    /// Name unique among siblings; the task id becomes `<manager>/<name>`.
    pub name: String,
    /// Specialist role the child is bound to.
    pub role: String,
    /// Sibling names this child waits for.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Children may themselves be managers.
    #[serde(default)]
    pub kind: TaskKind,
}

impl DelegatedTask {
    /// Create a specialist child.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            depends_on: Vec::new(),
            kind: TaskKind::Specialist,
        }
    }

    /// Add sibling dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set the child kind.
    #[must_use]
    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Id of a delegated child task.
#[must_use]
pub fn child_task_id(manager_id: &str, name: &str) -> String {
    format!("{manager_id}/{name}")
}

/// Depth at which children of a manager at `parent_depth` run.
///
/// # Errors
///
/// Returns [`DelegationError::DepthExceeded`] if that depth is above `max_depth`.
pub fn child_depth(parent_depth: u32, max_depth: u32) -> Result<u32, DelegationError> {
    let depth = parent_depth.saturating_add(1);
    if depth > max_depth {
        return Err(DelegationError::DepthExceeded {
            depth,
            max: max_depth,
        });
    }
    Ok(depth)
}

/// Check sibling names and dependencies of a delegation.
///
/// # Errors
///
/// Returns an error for duplicate or reserved names, unknown siblings, or
/// cyclic sibling dependencies.
pub fn validate_children(children: &[DelegatedTask]) -> Result<(), DelegationError> {
    let mut names = HashSet::new();
    for child in children {
        if child.name.is_empty() || child.name.contains('/') || child.name.contains(':') {
            return Err(DelegationError::InvalidChildName(child.name.clone()));
        }
        if !names.insert(child.name.as_str()) {
            return Err(DelegationError::DuplicateChild(child.name.clone()));
        }
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for child in children {
        let deps: HashSet<&str> = child.depends_on.iter().map(String::as_str).collect();
        for dep in &deps {
            if !names.contains(dep) {
                return Err(DelegationError::UnknownSibling {
                    child: child.name.clone(),
                    dependency: (*dep).to_string(),
                });
            }
            dependents.entry(dep).or_default().push(child.name.as_str());
        }
        in_degree.insert(child.name.as_str(), deps.len());
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();
    let mut visited = 0;
    while let Some(name) = ready.pop() {
        visited += 1;
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(dependent);
                }
            }
        }
    }

    if visited == children.len() {
        Ok(())
    } else {
        Err(DelegationError::ChildCycle)
    }
}
