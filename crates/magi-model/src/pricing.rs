//! Static per-model pricing used to fill `cost_update.usage.cost`.
//!
//! Prices are dollars per million tokens.  Lookup is by longest matching
//! model-name prefix so versioned releases (`deepseek-chat-0905`) inherit
//! their family's rate.  Unknown models cost 0.0 — the cost tracker still
//! accumulates their token counts.

/// (model prefix, input $/M, cached-input $/M, output $/M)
static PRICES: &[(&str, f64, f64, f64)] = &[
    ("gpt-5", 1.25, 0.125, 10.0),
    ("gpt-4o", 2.50, 1.25, 10.0),
    ("o3", 2.0, 0.5, 8.0),
    ("claude-opus", 15.0, 1.5, 75.0),
    ("claude-sonnet", 3.0, 0.3, 15.0),
    ("claude-haiku", 0.8, 0.08, 4.0),
    ("deepseek-reasoner", 0.55, 0.14, 2.19),
    ("deepseek-chat", 0.27, 0.07, 1.10),
    ("grok-4", 3.0, 0.75, 15.0),
    ("grok-3-mini", 0.30, 0.075, 0.50),
    ("gemini-2.5-pro", 1.25, 0.31, 10.0),
    ("gemini-2.5-flash", 0.30, 0.075, 2.50),
];

/// Dollar cost of one call.  `cached` tokens are billed at the cached-input
/// rate and are assumed to be included in `input`.
pub fn cost_for(model: &str, input: u64, cached: u64, output: u64) -> f64 {
    let Some((_, in_rate, cached_rate, out_rate)) = PRICES
        .iter()
        .filter(|(prefix, ..)| model.starts_with(prefix))
        .max_by_key(|(prefix, ..)| prefix.len())
    else {
        return 0.0;
    };
    let fresh = input.saturating_sub(cached);
    (fresh as f64 * in_rate + cached as f64 * cached_rate + output as f64 * out_rate) / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_has_positive_cost() {
        assert!(cost_for("deepseek-chat", 1_000_000, 0, 0) > 0.0);
    }

    #[test]
    fn unknown_model_costs_zero() {
        assert_eq!(cost_for("totally-unknown", 1_000_000, 0, 1_000_000), 0.0);
    }

    #[test]
    fn longest_prefix_wins() {
        // deepseek-reasoner must not match the deepseek-chat row.
        let reasoner = cost_for("deepseek-reasoner", 1_000_000, 0, 0);
        let chat = cost_for("deepseek-chat", 1_000_000, 0, 0);
        assert!(reasoner > chat);
    }

    #[test]
    fn cached_tokens_billed_at_cached_rate() {
        let all_fresh = cost_for("deepseek-chat", 1_000_000, 0, 0);
        let all_cached = cost_for("deepseek-chat", 1_000_000, 1_000_000, 0);
        assert!(all_cached < all_fresh);
    }

    #[test]
    fn versioned_model_inherits_family_rate() {
        let base = cost_for("deepseek-chat", 1_000_000, 0, 500_000);
        let versioned = cost_for("deepseek-chat-0905", 1_000_000, 0, 500_000);
        assert_eq!(base, versioned);
    }
}
