use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub overseer: OverseerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
}

/// Settings for one engine process (overseer or task worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Shared output volume root.  Each process writes under
    /// `<output_dir>/<process_id>/`.
    pub output_dir: String,
    /// Host where the controller listens.
    pub controller_host: String,
    /// When true the engine never opens a socket; events are pretty-printed
    /// to stdout instead.
    #[serde(default)]
    pub test_mode: bool,
    /// Seconds of continuous controller disconnect after which the engine
    /// exits non-zero.
    pub disconnect_exit_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: "/magi_output".into(),
            controller_host: "127.0.0.1".into(),
            test_mode: false,
            disconnect_exit_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Named provider endpoints.  Each entry configures one driver; providers
    /// are matched to models by the `model_prefixes` list.
    ///
    /// ```yaml
    /// models:
    ///   providers:
    ///     deepseek:
    ///       driver: openai_compat
    ///       base_url: https://api.deepseek.com/v1
    ///       api_key_env: DEEPSEEK_API_KEY
    ///       model_prefixes: ["deepseek-"]
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Model classes used for rotation: a class maps to a scored candidate
    /// list.  Scores are 0–100; higher means selected more often.
    #[serde(default)]
    pub classes: HashMap<String, ModelClassConfig>,
    /// Models excluded from rotation everywhere (quota exhausted, broken).
    #[serde(default)]
    pub disabled: Vec<String>,
    /// Pinned class → model overrides.  When a class appears here, rotation
    /// returns the pinned model unchanged (used for experiments).
    #[serde(default)]
    pub class_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Driver implementation: "openai_compat" | "anthropic" | "mock".
    pub driver: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env so secrets stay out of files.
    pub api_key: Option<String>,
    /// API base URL (before `/chat/completions` for openai_compat drivers).
    pub base_url: Option<String>,
    /// Maximum output tokens per completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Model-name prefixes routed to this provider, e.g. `["claude-"]`.
    #[serde(default)]
    pub model_prefixes: Vec<String>,
    /// Additional HTTP headers sent with every request (OpenRouter referer
    /// and title, gateway routing hints).
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// Extra key-value pairs merged verbatim into the request body, e.g.
    /// OpenRouter's `provider` routing object.
    #[serde(default)]
    pub extra_body: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelClassConfig {
    pub models: Vec<ModelScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelScore {
    pub name: String,
    /// Selection weight 0–100 within this class.
    #[serde(default = "default_score")]
    pub score: u32,
}

fn default_score() -> u32 {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverseerConfig {
    /// Display name of the overseer agent, used in monologue prefixes.
    pub ai_name: String,
    /// Display name of the human; chat ingestion normalizes user turns to
    /// `"<user_name> said: ..."`.
    pub user_name: String,
    /// Initial pause between monologue turns, seconds.  Must be one of the
    /// allowed thought-delay values {0,2,4,8,16,32,64,128}.
    pub thought_delay_secs: u64,
    /// Approximate token budget before history compaction triggers.
    pub history_token_limit: usize,
    /// Whether the overseer injects the mind-wandering nudge when idle.
    #[serde(default = "default_true")]
    pub mind_wandering: bool,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            ai_name: "Magi".into(),
            user_name: "User".into(),
            thought_delay_secs: 4,
            history_token_limit: 50_000,
            mind_wandering: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Port the controller listens on for engine and UI sockets.
    pub port: u16,
    /// Semantic version reported to UI clients in `server:info`.
    pub version: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: 3010,
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Default timeout for `wait_for_running_task`, seconds.
    pub wait_timeout_secs: u64,
    /// Interval between background health sweeps, milliseconds.
    pub health_check_interval_ms: u64,
    /// A task with no observed progress for this long (and a non-terminal
    /// status) is reported as stuck.
    pub health_stall_secs: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 1800,
            health_check_interval_ms: 600_000,
            health_stall_secs: 300,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key: explicit value first, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            return Some(k.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
