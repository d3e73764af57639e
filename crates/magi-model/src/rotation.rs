//! Weighted model rotation within a named model class.
//!
//! Each agent rotates away from the model it used last, skips disabled
//! models, and draws from the remaining candidates weighted by their
//! per-class score.  A class listed in `class_overrides` is pinned: the
//! override is returned unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rand::Rng;
use tracing::debug;

use magi_config::{ModelScore, ModelsConfig};

pub const STANDARD_CLASS: &str = "standard";

pub struct ModelRotation {
    classes: HashMap<String, Vec<ModelScore>>,
    disabled: HashSet<String>,
    overrides: HashMap<String, String>,
    /// Agent name → model used on that agent's previous pick.
    last_used: Mutex<HashMap<String, String>>,
}

impl ModelRotation {
    pub fn from_config(cfg: &ModelsConfig) -> Self {
        Self {
            classes: cfg
                .classes
                .iter()
                .map(|(k, v)| (k.clone(), v.models.clone()))
                .collect(),
            disabled: cfg.disabled.iter().cloned().collect(),
            overrides: cfg.class_overrides.clone(),
            last_used: Mutex::new(HashMap::new()),
        }
    }

    pub fn disable(&mut self, model: impl Into<String>) {
        self.disabled.insert(model.into());
    }

    /// Pick the next model for `agent_name` from `class`.
    ///
    /// Returns `None` only when neither the class nor the `standard`
    /// fallback has any candidate at all.
    pub fn pick(&self, agent_name: &str, class: &str) -> Option<String> {
        if let Some(pinned) = self.overrides.get(class) {
            return Some(pinned.clone());
        }

        let last = self
            .last_used
            .lock()
            .unwrap()
            .get(agent_name)
            .cloned();

        let chosen = self
            .candidates(class, last.as_deref())
            .or_else(|| self.candidates(STANDARD_CLASS, last.as_deref()))
            // All candidates filtered away: allow repeating the last model
            // rather than failing the turn.
            .or_else(|| self.candidates(class, None))
            .or_else(|| self.candidates(STANDARD_CLASS, None))
            .map(|pool| weighted_draw(&pool))?;

        debug!(agent = agent_name, class, model = %chosen, "model rotation pick");
        self.last_used
            .lock()
            .unwrap()
            .insert(agent_name.to_string(), chosen.clone());
        Some(chosen)
    }

    fn candidates(&self, class: &str, exclude: Option<&str>) -> Option<Vec<ModelScore>> {
        let pool: Vec<ModelScore> = self
            .classes
            .get(class)?
            .iter()
            .filter(|m| Some(m.name.as_str()) != exclude)
            .filter(|m| !self.disabled.contains(&m.name))
            .cloned()
            .collect();
        (!pool.is_empty()).then_some(pool)
    }
}

fn weighted_draw(pool: &[ModelScore]) -> String {
    let total: u64 = pool.iter().map(|m| m.score as u64).sum();
    let mut rng = rand::thread_rng();
    if total == 0 {
        return pool[rng.gen_range(0..pool.len())].name.clone();
    }
    let mut r = rng.gen_range(0..total);
    for m in pool {
        let score = m.score as u64;
        if r < score {
            return m.name.clone();
        }
        r -= score;
    }
    // Rounding shortfall: last candidate.
    pool.last().unwrap().name.clone()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
