use std::env;
use std::fs;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

/// Runtime knobs for the orchestration layer. Loaded from an optional TOML
/// file with environment overrides; defaults match the documented policy
/// values (30s sync timeout, 20s idle timeout, 1h cache TTL).
#[derive(Clone, Debug)]
pub struct AiConfig {
    pub provider: ProviderConfig,
    pub budget: BudgetConfig,
    pub gateway: GatewayConfig,
    pub cache: CacheConfig,
    pub chat: ChatConfig,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
}

#[derive(Clone, Debug)]
pub struct BudgetConfig {
    pub daily_token_limit: u64,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub sync_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub context_window: usize,
    pub max_output_tokens: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                base_url: "http://localhost:8089".to_owned(),
                api_key: None,
                model: "advisor-default".to_owned(),
            },
            budget: BudgetConfig { daily_token_limit: 50_000 },
            gateway: GatewayConfig {
                sync_timeout_secs: 30,
                idle_timeout_secs: 20,
                max_retries: 1,
                backoff_ms: 500,
            },
            cache: CacheConfig { ttl_secs: 3_600 },
            chat: ChatConfig { context_window: 10, max_output_tokens: 1_024 },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    provider: Option<RawProvider>,
    budget: Option<RawBudget>,
    gateway: Option<RawGateway>,
    cache: Option<RawCache>,
    chat: Option<RawChat>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProvider {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBudget {
    daily_token_limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGateway {
    sync_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCache {
    ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChat {
    context_window: Option<usize>,
    max_output_tokens: Option<u32>,
}

impl AiConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let raw = match &options.config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|source| {
                    ConfigError::ReadFile { path: path.clone(), source }
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::ParseFile {
                    path: path.clone(),
                    source,
                })?
            }
            Some(path) if options.require_file => {
                return Err(ConfigError::MissingConfigFile(path.clone()))
            }
            _ => RawConfig::default(),
        };

        let mut config = Self::default().merge(raw);
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn merge(mut self, raw: RawConfig) -> Self {
        if let Some(provider) = raw.provider {
            if let Some(base_url) = provider.base_url {
                self.provider.base_url = base_url;
            }
            if let Some(api_key) = provider.api_key {
                self.provider.api_key = Some(SecretString::from(api_key));
            }
            if let Some(model) = provider.model {
                self.provider.model = model;
            }
        }
        if let Some(budget) = raw.budget {
            if let Some(limit) = budget.daily_token_limit {
                self.budget.daily_token_limit = limit;
            }
        }
        if let Some(gateway) = raw.gateway {
            if let Some(secs) = gateway.sync_timeout_secs {
                self.gateway.sync_timeout_secs = secs;
            }
            if let Some(secs) = gateway.idle_timeout_secs {
                self.gateway.idle_timeout_secs = secs;
            }
            if let Some(retries) = gateway.max_retries {
                self.gateway.max_retries = retries;
            }
            if let Some(ms) = gateway.backoff_ms {
                self.gateway.backoff_ms = ms;
            }
        }
        if let Some(cache) = raw.cache {
            if let Some(secs) = cache.ttl_secs {
                self.cache.ttl_secs = secs;
            }
        }
        if let Some(chat) = raw.chat {
            if let Some(window) = chat.context_window {
                self.chat.context_window = window;
            }
            if let Some(tokens) = chat.max_output_tokens {
                self.chat.max_output_tokens = tokens;
            }
        }
        self
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(base_url) = env::var("ADVISOR_AI_BASE_URL") {
            self.provider.base_url = base_url;
        }
        if let Ok(api_key) = env::var("ADVISOR_AI_API_KEY") {
            self.provider.api_key = Some(SecretString::from(api_key));
        }
        if let Ok(model) = env::var("ADVISOR_AI_MODEL") {
            self.provider.model = model;
        }
        if let Ok(value) = env::var("ADVISOR_AI_DAILY_TOKEN_LIMIT") {
            self.budget.daily_token_limit =
                value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                    key: "ADVISOR_AI_DAILY_TOKEN_LIMIT".to_owned(),
                    value,
                })?;
        }
        if let Ok(value) = env::var("ADVISOR_AI_CACHE_TTL_SECS") {
            self.cache.ttl_secs = value.parse().map_err(|_| ConfigError::InvalidEnvOverride {
                key: "ADVISOR_AI_CACHE_TTL_SECS".to_owned(),
                value,
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.base_url.is_empty() {
            return Err(ConfigError::Validation("provider.base_url must not be empty".to_owned()));
        }
        if self.budget.daily_token_limit == 0 {
            return Err(ConfigError::Validation(
                "budget.daily_token_limit must be positive".to_owned(),
            ));
        }
        if self.gateway.sync_timeout_secs == 0 || self.gateway.idle_timeout_secs == 0 {
            return Err(ConfigError::Validation("gateway timeouts must be positive".to_owned()));
        }
        if self.chat.context_window == 0 {
            return Err(ConfigError::Validation(
                "chat.context_window must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
