use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderMap;

use crate::config::settings::ActorConfig;
use crate::error::GatewayError;

pub const FEATURE_HEADER: &str = "x-gateway-feature";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    ChatCompletions,
    CodeCompletions,
}

impl Feature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::ChatCompletions => "chat_completions",
            Feature::CodeCompletions => "code_completions",
        }
    }

    /// Reads the feature header, defaulting to chat completions.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, GatewayError> {
        match headers.get(FEATURE_HEADER) {
            None => Ok(Feature::ChatCompletions),
            Some(v) => v
                .to_str()
                .map_err(|_| GatewayError::Validation("invalid feature header".into()))?
                .parse(),
        }
    }
}

impl FromStr for Feature {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "chat_completions" => Ok(Feature::ChatCompletions),
            "code_completions" => Ok(Feature::CodeCompletions),
            other => Err(GatewayError::Validation(format!("unknown feature {other:?}"))),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u64,
    pub interval: Duration,
    /// Empty means every model the provider allows.
    pub allowed_models: Vec<String>,
}

impl RateLimit {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub source: String,
    pub dotcom: bool,
    pub rate_limits: HashMap<Feature, RateLimit>,
}

impl Actor {
    pub fn rate_limit(&self, feature: Feature) -> Option<&RateLimit> {
        self.rate_limits.get(&feature)
    }
}

/// Resolves the caller behind a bearer token.
pub trait ActorSource: Send + Sync {
    fn resolve(&self, token: &str) -> Option<Actor>;
}

pub struct StaticActorSource {
    actors: HashMap<String, Actor>,
}

impl StaticActorSource {
    pub fn from_config(configs: &[ActorConfig]) -> Result<Self, GatewayError> {
        let mut actors = HashMap::with_capacity(configs.len());
        for cfg in configs {
            if cfg.token.trim().is_empty() {
                return Err(GatewayError::Config(format!("actor {} has an empty token", cfg.id)));
            }
            let mut rate_limits = HashMap::new();
            for (name, limit) in &cfg.rate_limits {
                let feature: Feature = name
                    .parse()
                    .map_err(|_| GatewayError::Config(format!("actor {}: unknown feature {name:?}", cfg.id)))?;
                if limit.interval_seconds == 0 {
                    return Err(GatewayError::Config(format!(
                        "actor {}: interval_seconds must be positive for {name}",
                        cfg.id
                    )));
                }
                rate_limits.insert(
                    feature,
                    RateLimit {
                        limit: limit.limit,
                        interval: Duration::from_secs(limit.interval_seconds),
                        allowed_models: limit.allowed_models.clone(),
                    },
                );
            }
            let actor = Actor {
                id: cfg.id.clone(),
                source: cfg.source.clone(),
                dotcom: cfg.dotcom,
                rate_limits,
            };
            if actors.insert(cfg.token.clone(), actor).is_some() {
                return Err(GatewayError::Config(format!("duplicate actor token for {}", cfg.id)));
            }
        }
        Ok(Self { actors })
    }
}

impl ActorSource for StaticActorSource {
    fn resolve(&self, token: &str) -> Option<Actor> {
        self.actors.get(token).cloned()
    }
}
