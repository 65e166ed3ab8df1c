use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_KEY_ENV: &str = "TRIAGE_API_KEY";

const DEFAULT_SYSTEM_INSTRUCTION: &str = r#"You are a first-line emotional support assistant. Listen actively, respond with empathy, and never diagnose.
Reply in the user's language. After your reply, always append exactly one fenced JSON block as the very last thing in your message:

```json
{
  "topic": "Relationships",
  "urgency": "Low | Medium | High | Critical",
  "suggested_action": "Recommend consultation",
  "flagged_keywords": ["divorce", "pain"],
  "language": "en"
}
```
JSON values must be in English regardless of the conversation language."#;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Tried front to back; never reordered at runtime.
    pub model_priority: Vec<String>,
    pub system_instruction: String,
    /// When readable, the file contents replace `system_instruction`.
    pub system_instruction_path: Option<PathBuf>,
    pub temperature: f32,
    /// Number of most recent turns sent upstream.
    pub history_window: usize,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Resolved once from `TRIAGE_API_KEY`; never read from the YAML file.
    #[serde(skip)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Allow one extra attempt on the same model after a rate-limit response.
    pub rate_limit_retry: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub bearer_token: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            model_priority: vec![
                "gemini-3-pro-preview".to_string(),
                "gemini-3-flash-preview".to_string(),
                "gemini-1.5-pro".to_string(),
                "gemini-1.5-flash".to_string(),
            ],
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            system_instruction_path: None,
            temperature: 0.7,
            history_window: 10,
            max_output_tokens: None,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_retry: true,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter_factor: 0.2,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            bearer_token: None,
        }
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides.
    /// Always returns a usable config; problems are logged.
    pub fn load() -> Self {
        for path in ["../.env", ".env"] {
            if dotenvy::from_path(path).is_ok() {
                tracing::info!("Loaded .env from: {}", path);
                break;
            }
        }

        let config_path =
            env::var("TRIAGE_CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        let mut config = Self::from_file(Path::new(&config_path));

        config.apply_env_overrides();
        config.resolve_system_instruction();

        if let Err(e) = config.validate() {
            tracing::warn!("Config validation warnings: {} - continuing anyway", e);
        }

        config
    }

    fn from_file(path: &Path) -> Self {
        if !path.exists() {
            tracing::warn!(
                "Config file not found at {} - using defaults",
                path.display()
            );
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::error!(
                        "Failed to parse config file {}: {} - using defaults",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::error!(
                    "Failed to read config file {}: {} - using defaults",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn from_yaml(contents: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Apply overrides from any key lookup; `apply_env_overrides` feeds it the process env.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = lookup("TRIAGE_PROVIDER_URL") {
            self.provider.base_url = url;
        }

        if let Some(models) = lookup("TRIAGE_MODELS") {
            self.dispatch.model_priority = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(temperature) = lookup("TRIAGE_TEMPERATURE") {
            if let Ok(t) = temperature.parse() {
                self.dispatch.temperature = t;
            }
        }
        if let Some(window) = lookup("TRIAGE_HISTORY_WINDOW") {
            if let Ok(w) = window.parse() {
                self.dispatch.history_window = w;
            }
        }
        if let Some(path) = lookup("TRIAGE_SYSTEM_INSTRUCTION_PATH") {
            self.dispatch.system_instruction_path = Some(PathBuf::from(path));
        }

        if let Some(flag) = lookup("TRIAGE_RATE_LIMIT_RETRY") {
            if let Ok(enabled) = flag.parse() {
                self.retry.rate_limit_retry = enabled;
            }
        }

        if let Some(endpoint) = lookup("TRIAGE_AUDIT_ENDPOINT") {
            self.audit.endpoint = Some(endpoint);
            self.audit.enabled = true;
        }

        if let Some(bind) = lookup("TRIAGE_HTTP_BIND") {
            self.server.bind = bind;
        }
        if let Some(token) = lookup("TRIAGE_BEARER_TOKEN") {
            self.server.bearer_token = Some(token);
        }
    }

    fn resolve_system_instruction(&mut self) {
        let Some(path) = self.dispatch.system_instruction_path.clone() else {
            return;
        };
        match fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => {
                tracing::info!("Loaded system instruction from {}", path.display());
                self.dispatch.system_instruction = contents;
            }
            Ok(_) => tracing::warn!(
                "System instruction file {} is empty - keeping configured instruction",
                path.display()
            ),
            Err(e) => tracing::warn!(
                "Failed to read system instruction {}: {} - keeping configured instruction",
                path.display(),
                e
            ),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.dispatch.model_priority.is_empty() {
            return Err("dispatch.model_priority must list at least one model".into());
        }
        if self.dispatch.history_window == 0 {
            return Err("dispatch.history_window cannot be 0".into());
        }
        if !(0.0..=2.0).contains(&self.dispatch.temperature) {
            return Err("dispatch.temperature must be between 0.0 and 2.0".into());
        }
        if self.retry.jitter_factor < 0.0 || self.retry.jitter_factor > 1.0 {
            return Err("Retry jitter factor must be between 0.0 and 1.0".into());
        }
        if self.audit.enabled && self.audit.endpoint.is_none() {
            return Err("audit.enabled requires audit.endpoint".into());
        }
        if self.provider.api_key.is_none() {
            return Err(format!("{API_KEY_ENV} environment variable must be set").into());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_secs)
    }
}
