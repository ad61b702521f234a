//! Provider kinds and per-model capability data.
//!
//! Which options a model accepts (search tool, thinking budget, streaming
//! fallback) is looked up in a [`CapabilityTable`] rather than decided by
//! model-name checks scattered through the providers.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Vendors reachable through the multi-provider wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAI,
    Anthropic,
    Google,
}

impl Vendor {
    /// Get a human-readable name for this vendor
    pub fn name(&self) -> &'static str {
        match self {
            Vendor::OpenAI => "OpenAI",
            Vendor::Anthropic => "Anthropic",
            Vendor::Google => "Google",
        }
    }

    /// Parse a vendor name as written in configuration
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Vendor::OpenAI),
            "anthropic" => Ok(Vendor::Anthropic),
            "google" => Ok(Vendor::Google),
            other => Err(Error::UnsupportedProvider(other.to_string())),
        }
    }
}

/// The provider variants a session can talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Gemini REST `generateContent`
    GeminiRest,
    /// Gemini requests shaped like the official SDK: system instruction, thinking config
    GeminiSdk,
    /// Portkey gateway (OpenAI-compatible, with a virtual routing key)
    Portkey,
    /// Multi-provider wrapper; always streams
    MultiProvider(Vendor),
}

impl ProviderKind {
    /// Get a human-readable name for this provider
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::GeminiRest | ProviderKind::GeminiSdk => "Gemini",
            ProviderKind::Portkey => "Portkey",
            ProviderKind::MultiProvider(vendor) => vendor.name(),
        }
    }

    /// Parse `gemini`, `gemini-sdk`, `portkey`, or `multi:<vendor>`
    pub fn parse(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "gemini" | "gemini-rest" => Ok(ProviderKind::GeminiRest),
            "gemini-sdk" => Ok(ProviderKind::GeminiSdk),
            "portkey" => Ok(ProviderKind::Portkey),
            _ => match lower.split_once(':') {
                Some(("multi", vendor)) => Ok(ProviderKind::MultiProvider(Vendor::parse(vendor)?)),
                _ => Err(Error::UnsupportedProvider(s.to_string())),
            },
        }
    }

    /// Whether this variant issues every request as a stream
    pub fn stream_only(&self) -> bool {
        matches!(self, ProviderKind::MultiProvider(_))
    }
}

/// What a model accepts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Retry a failed non-streaming call over the streaming transport
    pub streaming_fallback: bool,
    /// Declare the provider-side search tool
    pub search_tool: bool,
    /// Declare the provider-side code execution tool
    pub code_execution: bool,
    /// Reasoning token budget
    pub thinking_budget: Option<u32>,
    /// Return reasoning as separate parts
    pub include_thoughts: bool,
}

/// A capability rule matched by model-id prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub prefix: String,
    #[serde(flatten)]
    pub capabilities: Capabilities,
}

impl CapabilityRule {
    /// Create a rule
    pub fn new(prefix: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            prefix: prefix.into(),
            capabilities,
        }
    }
}

/// Ordered capability rules; the longest matching prefix wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    pub rules: Vec<CapabilityRule>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self {
            rules: vec![
                CapabilityRule::new(
                    "gemini-2.5",
                    Capabilities {
                        streaming_fallback: true,
                        search_tool: true,
                        code_execution: true,
                        thinking_budget: Some(24576),
                        include_thoughts: true,
                    },
                ),
                CapabilityRule::new(
                    "gemini-2.0",
                    Capabilities {
                        streaming_fallback: true,
                        search_tool: true,
                        ..Default::default()
                    },
                ),
                CapabilityRule::new(
                    "gemini",
                    Capabilities {
                        streaming_fallback: true,
                        ..Default::default()
                    },
                ),
            ],
        }
    }
}

impl CapabilityTable {
    /// Resolve the capabilities of a model id
    pub fn resolve(&self, model_id: &str) -> Capabilities {
        self.rules
            .iter()
            .filter(|r| model_id.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())
            .map(|r| r.capabilities.clone())
            .unwrap_or_default()
    }

    /// Add user rules; an identical prefix replaces the built-in one
    pub fn with_overrides(mut self, overrides: Vec<CapabilityRule>) -> Self {
        for rule in overrides {
            self.rules.retain(|r| r.prefix != rule.prefix);
            self.rules.push(rule);
        }
        self
    }
}
