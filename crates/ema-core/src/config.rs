//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default system prompt used when the config does not supply one. The
/// `{MEMORY_BUFFER}` placeholder is expanded with recent buffer lines before
/// every fresh run.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are Ema, a helpful conversational companion. Answer through the ema_reply \
tool; plain text answers are not delivered to the user.\n\n\
Recent conversation:\n{MEMORY_BUFFER}\n";

/// Top-level Ema configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorSettings {
    /// Display name the actor signs its buffer records with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// System prompt template; `{MEMORY_BUFFER}` placeholders are expanded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Main-loop step bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    /// Token count above which history summarisation triggers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_limit: Option<u64>,

    /// How many buffer records `{MEMORY_BUFFER}` expands to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_inject_count: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ProviderConfig {
    /// Resolve the API key: a non-empty `api_key` wins, else the variable
    /// named by `api_key_env` is consulted.
    pub fn resolve_api_key(&self) -> Option<String> {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => Some(key.to_string()),
            _ => self
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|value| !value.is_empty()),
        }
    }
}

/// Retry policy for LLM calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "ema_actor=debug").
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_log_format() -> String {
    "plain".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for buffer files. In-memory stores are used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_dir: Option<String>,
}

/// Expand `${ENV_VAR}` references in the raw config text. Unset variables
/// expand to the empty string; a `${` without a closing brace is left as-is.
fn expand_env_refs(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&std::env::var(&after[..end]).unwrap_or_default());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

impl Config {
    /// Load config from a JSON5 file, expanding `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        json5::from_str(&expand_env_refs(&raw))
            .map_err(|e| crate::EmaError::Config(format!("{}: {e}", path.display())))
    }

    pub fn actor_name(&self) -> String {
        self.actor
            .as_ref()
            .and_then(|a| a.name.clone())
            .unwrap_or_else(|| "Ema".into())
    }

    pub fn system_prompt(&self) -> String {
        self.actor
            .as_ref()
            .and_then(|a| a.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into())
    }

    pub fn max_steps(&self) -> u32 {
        self.actor
            .as_ref()
            .and_then(|a| a.max_steps)
            .unwrap_or(50)
    }

    pub fn token_limit(&self) -> u64 {
        self.actor
            .as_ref()
            .and_then(|a| a.token_limit)
            .unwrap_or(80_000)
    }

    pub fn buffer_inject_count(&self) -> usize {
        self.actor
            .as_ref()
            .and_then(|a| a.buffer_inject_count)
            .unwrap_or(10)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        self.retry.clone().unwrap_or_default()
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.iter().find(|pc| pc.id == id))
    }

    /// Get the first provider config.
    pub fn first_provider(&self) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.first())
    }

    pub fn buffer_dir(&self) -> Option<PathBuf> {
        self.storage
            .as_ref()
            .and_then(|s| s.buffer_dir.as_ref())
            .map(PathBuf::from)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(providers) = self.models.as_ref().and_then(|m| m.providers.as_ref()) {
            for p in providers {
                if p.resolve_api_key().is_none() {
                    warnings.push(format!("Provider '{}' has no API key configured", p.id));
                }
            }
        } else {
            warnings.push("No LLM providers configured".into());
        }

        if self.max_steps() == 0 {
            errors.push("actor.max_steps cannot be 0".into());
        }
        if self.token_limit() == 0 {
            errors.push("actor.token_limit cannot be 0".into());
        }
        if !self.system_prompt().contains("{MEMORY_BUFFER}") {
            warnings.push(
                "System prompt has no {MEMORY_BUFFER} placeholder; buffer injection is disabled"
                    .into(),
            );
        }

        (warnings, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = Config::default();
        assert_eq!(config.max_steps(), 50);
        assert_eq!(config.token_limit(), 80_000);
        assert_eq!(config.buffer_inject_count(), 10);
        assert_eq!(config.actor_name(), "Ema");
        assert!(config.system_prompt().contains("{MEMORY_BUFFER}"));
    }

    #[test]
    fn json5_parse_with_actor_section() {
        let raw = r#"{
            // comments are allowed
            actor: { name: "Mira", max_steps: 12, token_limit: 4000 },
            retry: { enabled: false },
        }"#;
        let config: Config = json5::from_str(raw).unwrap();
        assert_eq!(config.actor_name(), "Mira");
        assert_eq!(config.max_steps(), 12);
        assert_eq!(config.token_limit(), 4000);
        assert!(!config.retry_settings().enabled);
    }

    #[test]
    fn validate_flags_zero_steps() {
        let raw = r#"{ actor: { max_steps: 0 } }"#;
        let config: Config = json5::from_str(raw).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("max_steps")));
    }

    #[test]
    fn retry_defaults() {
        let retry = RetrySettings::default();
        assert!(retry.enabled);
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay_ms, 1000);
    }

    #[test]
    fn env_refs_expand_and_unterminated_braces_survive() {
        std::env::set_var("EMA_TEST_MODEL", "test-model");
        assert_eq!(
            expand_env_refs(r#"{ model: "${EMA_TEST_MODEL}" }"#),
            r#"{ model: "test-model" }"#
        );
        // Unset variables become empty; a dangling ${ is kept verbatim.
        assert_eq!(expand_env_refs("${EMA_TEST_UNSET_VAR}x"), "x");
        assert_eq!(expand_env_refs("tail ${broken"), "tail ${broken");
        std::env::remove_var("EMA_TEST_MODEL");
    }

    #[test]
    fn provider_api_key_prefers_direct_value() {
        std::env::set_var("EMA_TEST_KEY", "from-env");
        let mut provider = ProviderConfig {
            id: "openai".into(),
            api_key: Some("direct".into()),
            api_key_env: Some("EMA_TEST_KEY".into()),
            base_url: None,
            default_model: None,
            max_tokens: None,
            temperature: None,
        };
        assert_eq!(provider.resolve_api_key().as_deref(), Some("direct"));

        provider.api_key = Some(String::new());
        assert_eq!(provider.resolve_api_key().as_deref(), Some("from-env"));

        provider.api_key_env = Some("EMA_TEST_KEY_UNSET".into());
        assert_eq!(provider.resolve_api_key(), None);
        std::env::remove_var("EMA_TEST_KEY");
    }
}
