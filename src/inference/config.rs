//! Agent configuration loading and validation.
//!
//! Reads `config/agent.yaml` and resolves environment variables. Every field
//! except `endpoint.base_url` has a default, so a minimal file is just:
//!
//! ```yaml
//! endpoint:
//!   base_url: "http://localhost:8080/v1"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;
use super::reasoning::{DEFAULT_CLOSE_TAG, DEFAULT_OPEN_TAG};

/// Env var that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "LOCALCHAT_CONFIG";

/// Seconds a stream may go without a chunk before it counts as stalled.
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;

/// Path searched for, relative to each ancestor of the start directory.
const CONFIG_RELATIVE_PATH: &str = "config/agent.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// The OpenAI-compatible server to talk to.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Sent as a bearer token when present.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Longest gap allowed between two chunks of one stream.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

impl EndpointConfig {
    /// Minimal endpoint with every other field at its default.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: default_model(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base × 2^attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Loop-controller limits and tool execution policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_stagnation_limit")]
    pub stagnation_limit: u32,
    #[serde(default = "default_protocol_strike_limit")]
    pub protocol_strike_limit: u32,
    #[serde(default = "default_tool_repeat_limit")]
    pub tool_repeat_limit: u32,
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub request_retry: RetryPolicy,
    #[serde(default)]
    pub tool_retry: RetryPolicy,
    #[serde(default)]
    pub context: ContextSettings,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stagnation_limit: default_stagnation_limit(),
            protocol_strike_limit: default_protocol_strike_limit(),
            tool_repeat_limit: default_tool_repeat_limit(),
            tool_concurrency: default_tool_concurrency(),
            tool_timeout_secs: default_tool_timeout_secs(),
            request_retry: RetryPolicy::default(),
            tool_retry: RetryPolicy::default(),
            context: ContextSettings::default(),
            reasoning: ReasoningConfig::default(),
        }
    }
}

impl AgentSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// History pruning and working-memory sizes.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSettings {
    /// Character budget for the request history.
    #[serde(default = "default_char_budget")]
    pub char_budget: usize,
    /// Tool results newer than this many keep their full content.
    #[serde(default = "default_tool_result_keep")]
    pub tool_result_keep: usize,
    #[serde(default = "default_keep_recent_messages")]
    pub keep_recent_messages: usize,
    /// Digests rendered into the working-memory system entry.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
    #[serde(default = "default_max_digests")]
    pub max_digests: usize,
    #[serde(default = "default_digest_summary_chars")]
    pub digest_summary_chars: usize,
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            char_budget: default_char_budget(),
            tool_result_keep: default_tool_result_keep(),
            keep_recent_messages: default_keep_recent_messages(),
            memory_window: default_memory_window(),
            max_digests: default_max_digests(),
            digest_summary_chars: default_digest_summary_chars(),
            max_tool_result_chars: default_max_tool_result_chars(),
        }
    }
}

/// Inline reasoning tag pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_open_tag")]
    pub open_tag: String,
    #[serde(default = "default_close_tag")]
    pub close_tag: String,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            open_tag: default_open_tag(),
            close_tag: default_close_tag(),
        }
    }
}

/// Top-level configuration (mirrors `config/agent.yaml`).
///
/// `context` and `reasoning` live at the top level of the file and are folded
/// into [`AgentSettings`] by [`load_config`].
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub context: Option<ContextSettings>,
    #[serde(default)]
    pub reasoning: Option<ReasoningConfig>,
}

impl AgentConfig {
    /// Agent settings with the top-level `context` / `reasoning` sections applied.
    pub fn settings(&self) -> AgentSettings {
        let mut settings = self.agent.clone();
        if let Some(ref context) = self.context {
            settings.context = context.clone();
        }
        if let Some(ref reasoning) = self.reasoning {
            settings.reasoning = reasoning.clone();
        }
        settings
    }

    fn validate(&self) -> Result<(), InferenceError> {
        if self.endpoint.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "endpoint.base_url must not be empty".into(),
            });
        }
        let reasoning = self.settings().reasoning;
        if reasoning.open_tag.is_empty() || reasoning.close_tag.is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "reasoning tags must not be empty".into(),
            });
        }
        if self.agent.tool_concurrency == 0 {
            return Err(InferenceError::ConfigError {
                reason: "agent.tool_concurrency must be at least 1".into(),
            });
        }
        Ok(())
    }
}

fn default_model() -> String {
    "default".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    600
}
fn default_stream_idle_timeout_secs() -> u64 {
    DEFAULT_STREAM_IDLE_TIMEOUT_SECS
}
fn default_max_retries() -> u32 {
    2
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_max_iterations() -> u32 {
    25
}
fn default_stagnation_limit() -> u32 {
    5
}
fn default_protocol_strike_limit() -> u32 {
    3
}
fn default_tool_repeat_limit() -> u32 {
    2
}
fn default_tool_concurrency() -> usize {
    4
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_char_budget() -> usize {
    48_000
}
fn default_tool_result_keep() -> usize {
    6
}
fn default_keep_recent_messages() -> usize {
    16
}
fn default_memory_window() -> usize {
    8
}
fn default_max_digests() -> usize {
    32
}
fn default_digest_summary_chars() -> usize {
    240
}
fn default_max_tool_result_chars() -> usize {
    6_000
}
fn default_open_tag() -> String {
    DEFAULT_OPEN_TAG.to_string()
}
fn default_close_tag() -> String {
    DEFAULT_CLOSE_TAG.to_string()
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Uses `LOCALCHAT_CONFIG` when it names an existing file, otherwise searches
/// upward from `start` for `config/agent.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not point at a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_RELATIVE_PATH}"),
    })
}

/// Load, interpolate and validate the configuration file.
///
/// String values may use `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_config(path: &Path) -> Result<AgentConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse configuration text (after env-var interpolation).
pub fn parse_config(raw: &str) -> Result<AgentConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: AgentConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
