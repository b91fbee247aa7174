use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub completions: CompletionsConfig,
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 被拦截请求的错误信息中展示给调用方的联系方式
    #[serde(default = "default_support_contact")]
    pub support_contact: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            support_contact: default_support_contact(),
        }
    }
}

fn default_support_contact() -> String {
    "support@example.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub database_path: String,
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
    #[serde(default = "default_flagged_prompt_retention_minutes")]
    pub flagged_prompt_retention_minutes: i64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: "data/gateway.db".to_string(),
            event_queue_size: default_event_queue_size(),
            flagged_prompt_retention_minutes: default_flagged_prompt_retention_minutes(),
        }
    }
}

fn default_event_queue_size() -> usize {
    1024
}

fn default_flagged_prompt_retention_minutes() -> i64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// 直连（绕过 HTTP(S)_PROXY）的上游主机，支持 `.example.com` 后缀匹配
    #[serde(default)]
    pub no_proxy_hosts: Vec<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            no_proxy_hosts: Vec::new(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub rate_limit_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionsConfig {
    pub anthropic: Option<ProviderConfig>,
    pub fireworks: Option<ProviderConfig>,
    pub google: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    /// 为空时从对应的 `*_ACCESS_TOKEN` 环境变量读取
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_max_tokens_to_sample")]
    pub max_tokens_to_sample: u32,
    #[serde(default = "default_retry_after_seconds")]
    pub default_retry_after_seconds: u64,
    #[serde(default = "default_true")]
    pub auto_flush_streaming_responses: bool,
    /// `cl100k_base` or unset
    pub tokenizer: Option<String>,
    #[serde(default)]
    pub model_rewrites: HashMap<String, String>,
    #[serde(default)]
    pub flagging: FlaggingSettings,
}

fn default_max_tokens_to_sample() -> u32 {
    10_000
}

fn default_retry_after_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlaggingSettings {
    pub allowed_prompt_patterns: Vec<String>,
    pub blocked_prompt_patterns: Vec<String>,
    pub prompt_token_flagging_limit: usize,
    pub prompt_token_blocking_limit: usize,
    pub max_tokens_to_sample_flagging_limit: u32,
    pub response_token_blocking_limit: u32,
    pub request_blocking_enabled: bool,
}

impl Default for FlaggingSettings {
    fn default() -> Self {
        Self {
            allowed_prompt_patterns: Vec::new(),
            blocked_prompt_patterns: Vec::new(),
            prompt_token_flagging_limit: 18_000,
            prompt_token_blocking_limit: 20_000,
            max_tokens_to_sample_flagging_limit: 1_000,
            response_token_blocking_limit: 1_000,
            request_blocking_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    pub token: String,
    pub id: String,
    #[serde(default = "default_actor_source")]
    pub source: String,
    #[serde(default)]
    pub dotcom: bool,
    /// 以 feature 名（`chat_completions` / `code_completions`）为键
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

fn default_actor_source() -> String {
    "static".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub interval_seconds: u64,
    #[serde(default)]
    pub allowed_models: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let mut settings = Self::from_toml_str(&config_content)?;
        settings.apply_env_overrides(|key| std::env::var(key).ok());
        tracing::info!("Loaded configuration from {}", config_path);
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Fills empty provider access tokens from the environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let providers = [
            (&mut self.completions.anthropic, "ANTHROPIC_ACCESS_TOKEN"),
            (&mut self.completions.fireworks, "FIREWORKS_ACCESS_TOKEN"),
            (&mut self.completions.google, "GOOGLE_ACCESS_TOKEN"),
        ];
        for (provider, var) in providers {
            if let Some(p) = provider.as_mut()
                && p.access_token.trim().is_empty()
                && let Some(token) = lookup(var)
            {
                p.access_token = token;
            }
        }
    }

    fn find_config_file() -> Result<String, Box<dyn std::error::Error>> {
        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err("Configuration file not found. Please create custom-config.toml or config.toml".into())
    }
}
