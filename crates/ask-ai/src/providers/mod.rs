//! Provider variants

pub mod anthropic;
pub mod chat_completions;
pub mod gemini;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    Capabilities, CapabilityTable, CompletedResponse, Error, GenerationConfig, ModelInfo,
    ProviderKind, RequestPayload, Result, StreamDelta, ToolDeclaration, Vendor,
    http::HttpTransport,
    sse::LineStream,
};

/// Request defaults a provider variant applies before user overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDefaults {
    pub generation: GenerationConfig,
    pub tools: Vec<ToolDeclaration>,
}

/// One provider variant: shapes requests, issues them, parses the answers
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> ProviderKind;

    /// Model id requests are sent to
    fn model(&self) -> &str;

    /// Endpoint requests are sent to
    fn base_url(&self) -> &str;

    /// Capabilities resolved for the model
    fn capabilities(&self) -> &Capabilities;

    /// Generation parameters and tools this variant sends by default
    fn defaults(&self) -> RequestDefaults;

    /// Fail with [`Error::MissingCredential`] before any network call if keys are absent
    fn check_credentials(&self) -> Result<()>;

    /// Whether the streaming transport is available at all
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Issue a non-streaming request
    async fn complete(&self, payload: &RequestPayload) -> Result<CompletedResponse>;

    /// Issue a streaming request and return its lines
    async fn stream(&self, payload: &RequestPayload) -> Result<LineStream>;

    /// Parse one stream data payload.
    ///
    /// [`Error::MalformedChunk`] means skip the line; any other error ends the stream.
    fn decode_chunk(&self, data: &str) -> Result<StreamDelta>;

    /// List the models this provider offers
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

/// Credentials and preferences for building a provider
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: Option<String>,
    /// Portkey virtual key routing the request to an upstream provider
    pub virtual_key: Option<String>,
    /// Base URL override (custom OpenAI-compatible endpoints, proxies)
    pub endpoint: Option<String>,
    pub capabilities: CapabilityTable,
}

impl ProviderSettings {
    /// Create settings with default capabilities and no credentials
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            api_key: None,
            virtual_key: None,
            endpoint: None,
            capabilities: CapabilityTable::default(),
        }
    }

    /// Set the API key
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the routing key
    pub fn with_virtual_key(mut self, key: impl Into<String>) -> Self {
        self.virtual_key = Some(key.into());
        self
    }

    /// Set the base URL
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Key with blank values treated as absent
    pub(crate) fn key(&self) -> Option<String> {
        non_blank(self.api_key.as_deref())
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Require a credential, naming the provider in the error
pub(crate) fn require(key: &Option<String>, provider: &str) -> Result<()> {
    match key {
        Some(_) => Ok(()),
        None => Err(Error::MissingCredential {
            provider: provider.to_string(),
        }),
    }
}

/// Build the provider variant named by the settings
pub fn build_provider(
    settings: &ProviderSettings,
    http: Arc<dyn HttpTransport>,
) -> Result<Arc<dyn ChatProvider>> {
    if settings.model.trim().is_empty() {
        return Err(Error::UnsupportedProvider(format!(
            "{} with no model configured",
            settings.kind.name()
        )));
    }

    let provider: Arc<dyn ChatProvider> = match settings.kind {
        ProviderKind::GeminiRest => Arc::new(gemini::GeminiProvider::new(
            settings,
            http,
            gemini::GeminiDialect::Rest,
        )),
        ProviderKind::GeminiSdk | ProviderKind::MultiProvider(Vendor::Google) => Arc::new(
            gemini::GeminiProvider::new(settings, http, gemini::GeminiDialect::Sdk),
        ),
        ProviderKind::Portkey => Arc::new(chat_completions::ChatCompletionsProvider::portkey(
            settings, http,
        )),
        ProviderKind::MultiProvider(Vendor::OpenAI) => Arc::new(
            chat_completions::ChatCompletionsProvider::openai(settings, http),
        ),
        ProviderKind::MultiProvider(Vendor::Anthropic) => {
            Arc::new(anthropic::AnthropicProvider::new(settings, http))
        }
    };

    tracing::debug!(
        "Built {} provider for model {}",
        provider.kind().name(),
        provider.model()
    );
    Ok(provider)
}
