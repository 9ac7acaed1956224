//! Combining child outputs into a manager's output.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::DelegationError;
use super::kind::AggregationStrategy;

/// Terminal state of one delegated child, in delegation order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildOutcome {
    /// Child name (without the manager prefix).
    pub name: String,
    /// Full task id.
    pub task_id: String,
    /// Output for completed children; `None` for failed or skipped ones.
    pub output: Option<Value>,
}

impl ChildOutcome {
    /// Completed child.
    pub fn completed(name: impl Into<String>, task_id: impl Into<String>, output: Value) -> Self {
        Self {
            name: name.into(),
            task_id: task_id.into(),
            output: Some(output),
        }
    }

    /// Failed or skipped child.
    pub fn failed(name: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_id: task_id.into(),
            output: None,
        }
    }

    /// Whether the child completed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.output.is_some()
    }
}

/// Chooses one output for `select-best` managers.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Return the index of the best candidate. Every candidate succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the evaluation itself fails.
    async fn select_best(
        &self,
        manager_id: &str,
        candidates: &[ChildOutcome],
    ) -> Result<usize, DelegationError>;
}

/// Evaluator that picks the first successful child.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstSuccess;

#[async_trait]
impl Evaluator for FirstSuccess {
    async fn select_best(
        &self,
        _manager_id: &str,
        _candidates: &[ChildOutcome],
    ) -> Result<usize, DelegationError> {
        Ok(0)
    }
}

/// Aggregate child outcomes according to `strategy`.
///
/// With no children at all, `merge` yields `{}` and `concat` yields `[]`.
///
/// # Errors
///
/// - `merge`/`concat`: [`DelegationError::ChildFailed`] for the first failed child.
/// - `select-best`: [`DelegationError::NoSuccessfulChild`] if nothing succeeded,
///   [`DelegationError::NoEvaluator`] if `evaluator` is `None`, or the evaluator's error.
pub async fn aggregate(
    manager_id: &str,
    strategy: AggregationStrategy,
    children: &[ChildOutcome],
    evaluator: Option<&dyn Evaluator>,
) -> Result<Value, DelegationError> {
    if strategy.requires_all_children() {
        if let Some(failed) = children.iter().find(|c| !c.succeeded()) {
            return Err(DelegationError::ChildFailed {
                child: failed.task_id.clone(),
            });
        }
    }

    match strategy {
        AggregationStrategy::Merge => {
            let merged: Map<String, Value> = children
                .iter()
                .filter_map(|c| c.output.clone().map(|out| (c.name.clone(), out)))
                .collect();
            Ok(Value::Object(merged))
        }
        AggregationStrategy::Concat => Ok(Value::Array(
            children.iter().filter_map(|c| c.output.clone()).collect(),
        )),
        AggregationStrategy::SelectBest => {
            let candidates: Vec<ChildOutcome> =
                children.iter().filter(|c| c.succeeded()).cloned().collect();
            if candidates.is_empty() {
                return Err(DelegationError::NoSuccessfulChild);
            }
            let evaluator = evaluator.ok_or(DelegationError::NoEvaluator)?;
            let index = evaluator.select_best(manager_id, &candidates).await?;
            let chosen = candidates
                .get(index)
                .and_then(|c| c.output.clone())
                .ok_or(DelegationError::InvalidSelection {
                    index,
                    candidates: candidates.len(),
                })?;
            tracing::debug!(
                manager = %manager_id,
                chosen = %candidates[index].task_id,
                "Selected best child output"
            );
            Ok(chosen)
        }
    }
}
