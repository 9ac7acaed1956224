//! Explicit gate registry.

use std::collections::HashMap;
use std::sync::Arc;

use super::evaluator::{ApproveGate, NoFailuresGate, QualityGate};

/// Gate name to evaluator mapping, built per scheduler and passed explicitly.
#[derive(Clone, Default)]
pub struct GateRegistry {
    gates: HashMap<String, Arc<dyn QualityGate>>,
}

impl GateRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in `approve` and `no-failures` gates.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new()
            .with(crate::workflow::DEFAULT_GATE, ApproveGate)
            .with("no-failures", NoFailuresGate)
    }

    /// Register `gate` under `name`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, gate: impl QualityGate + 'static) -> Self {
        self.register(name, Arc::new(gate));
        self
    }

    /// Register a shared gate under `name`.
    pub fn register(&mut self, name: impl Into<String>, gate: Arc<dyn QualityGate>) {
        self.gates.insert(name.into(), gate);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn QualityGate>> {
        self.gates.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.gates.contains_key(name)
    }
}

impl std::fmt::Debug for GateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.gates.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("GateRegistry").field("gates", &names).finish()
    }
}
