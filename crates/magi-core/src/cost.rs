use std::collections::HashMap;
use std::sync::Mutex;

use magi_model::Usage;

/// Per-model accumulated usage.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ModelTotals {
    pub calls: u64,
    pub input: u64,
    pub output: u64,
    pub cached: u64,
    pub cost: f64,
}

/// Process-wide cost accumulator fed by `cost_update` events.
#[derive(Default)]
pub struct CostTracker {
    inner: Mutex<HashMap<String, ModelTotals>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, usage: &Usage) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entry(usage.model.clone()).or_default();
        entry.calls += 1;
        entry.input += usage.input;
        entry.output += usage.output;
        entry.cached += usage.cached;
        entry.cost += usage.cost;
    }

    pub fn total_cost(&self) -> f64 {
        self.inner.lock().unwrap().values().map(|t| t.cost).sum()
    }

    pub fn per_model(&self) -> HashMap<String, ModelTotals> {
        self.inner.lock().unwrap().clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
