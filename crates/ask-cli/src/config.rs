//! Configuration file support

use std::{fs, path::PathBuf, time::Duration};

use ask_ai::{CapabilityRule, CapabilityTable, GenerationConfig, ProviderKind, ProviderSettings, Vendor};
use ask_chat::{RetryConfig, SessionConfig, TokenEstimation};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROVIDER: &str = "gemini";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Configuration for ask
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider: gemini, gemini-sdk, portkey, or multi:<openai|anthropic|google>
    pub provider: Option<String>,
    /// Model id
    pub model: Option<String>,
    /// System prompt sent with every request
    pub system_prompt: Option<String>,
    /// Base URL override for OpenAI-compatible endpoints
    pub endpoint: Option<String>,
    /// Token counting for responses without usage (off, chars_div4)
    pub token_estimation: TokenEstimation,
    /// Seconds to wait before retrying a rate-limited request
    pub rate_limit_delay: Option<f64>,
    pub generation: GenerationSettings,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
    /// Extra capability rules, matched by model-id prefix
    pub capabilities: Vec<CapabilityRule>,
}

/// Sampling overrides; unset values use the provider defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub gemini: Option<String>,
    pub portkey: Option<String>,
    pub portkey_virtual: Option<String>,
    pub openai: Option<String>,
    pub anthropic: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ask")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("ASK_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Write the example config if no config file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Provider kind, CLI value first
    pub fn provider_kind(&self, cli: Option<&str>) -> ask_ai::Result<ProviderKind> {
        ProviderKind::parse(cli.or(self.provider.as_deref()).unwrap_or(DEFAULT_PROVIDER))
    }

    /// API key for a provider, checking config then env
    fn get_api_key_with(&self, kind: ProviderKind, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        let (from_config, vars): (&Option<String>, &[&str]) = match kind {
            ProviderKind::GeminiRest
            | ProviderKind::GeminiSdk
            | ProviderKind::MultiProvider(Vendor::Google) => {
                (&self.api_keys.gemini, &["GEMINI_API_KEY", "GOOGLE_API_KEY"])
            }
            ProviderKind::Portkey => (&self.api_keys.portkey, &["PORTKEY_API_KEY"]),
            ProviderKind::MultiProvider(Vendor::OpenAI) => (&self.api_keys.openai, &["OPENAI_API_KEY"]),
            ProviderKind::MultiProvider(Vendor::Anthropic) => {
                (&self.api_keys.anthropic, &["ANTHROPIC_API_KEY"])
            }
        };

        from_config
            .clone()
            .or_else(|| vars.iter().copied().find_map(&env))
    }

    fn get_virtual_key_with(&self, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        self.api_keys
            .portkey_virtual
            .clone()
            .or_else(|| env("PORTKEY_VIRTUAL_KEY"))
    }

    /// Settings for building the provider; missing keys are left for the
    /// provider to report on the first request
    pub fn provider_settings(&self, kind: ProviderKind, model: Option<&str>) -> ProviderSettings {
        self.provider_settings_with(kind, model, |var| std::env::var(var).ok())
    }

    fn provider_settings_with(
        &self,
        kind: ProviderKind,
        model: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> ProviderSettings {
        let model = model
            .or(self.model.as_deref())
            .unwrap_or(DEFAULT_MODEL);
        let mut settings = ProviderSettings::new(kind, model);
        settings.capabilities = CapabilityTable::default().with_overrides(self.capabilities.clone());
        settings.api_key = self.get_api_key_with(kind, &env);
        if kind == ProviderKind::Portkey {
            settings.virtual_key = self.get_virtual_key_with(&env);
        }
        match &self.endpoint {
            Some(endpoint) => settings.with_endpoint(endpoint.as_str()),
            None => settings,
        }
    }

    /// Settings for every multi-provider vendor that has a key, for listing
    pub fn listing_settings(&self) -> Vec<ProviderSettings> {
        self.listing_settings_with(|var| std::env::var(var).ok())
    }

    fn listing_settings_with(&self, env: impl Fn(&str) -> Option<String>) -> Vec<ProviderSettings> {
        [Vendor::OpenAI, Vendor::Anthropic, Vendor::Google]
            .into_iter()
            .map(|vendor| self.provider_settings_with(ProviderKind::MultiProvider(vendor), None, &env))
            .filter(|settings| settings.api_key.is_some())
            .collect()
    }

    /// Session settings, CLI system prompt first
    pub fn session_config(&self, system_prompt: Option<String>) -> SessionConfig {
        let mut retry = RetryConfig::default();
        if let Some(delay) = self.rate_limit_delay.and_then(|s| Duration::try_from_secs_f64(s).ok()) {
            retry.rate_limit_delay = delay;
        }

        SessionConfig {
            system_prompt: system_prompt.or_else(|| self.system_prompt.clone()),
            generation: GenerationConfig {
                temperature: self.generation.temperature,
                top_p: self.generation.top_p,
                max_output_tokens: self.generation.max_output_tokens,
                ..Default::default()
            },
            retry,
            token_estimation: self.token_estimation,
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# ask configuration file
# Place at ~/.config/ask/config.toml (Linux) or set ASK_CONFIG_PATH

# Provider: gemini, gemini-sdk, portkey, multi:openai, multi:anthropic, multi:google
provider = "gemini"
model = "gemini-2.0-flash"

# system_prompt = "You are a concise assistant."

# Base URL for OpenAI-compatible endpoints
# endpoint = "https://api.openai.com/v1"

# Count tokens as ceil(chars / 4) when a full response reports no usage
token_estimation = "off"

# Seconds to wait before retrying a rate-limited request once
rate_limit_delay = 5.0

[generation]
# temperature = 0.7
# top_p = 0.95
# max_output_tokens = 8192

# API keys (optional - environment variables are read when unset)
# GEMINI_API_KEY / GOOGLE_API_KEY, PORTKEY_API_KEY, PORTKEY_VIRTUAL_KEY,
# OPENAI_API_KEY, ANTHROPIC_API_KEY
[api_keys]
# gemini = "..."
# portkey = "..."
# portkey_virtual = "..."

# Capability overrides by model-id prefix
# [[capabilities]]
# prefix = "gemini-2.5-flash-lite"
# streaming_fallback = true
# search_tool = false
"#
}
