//! OpenAI-compatible Chat Completions provider
//!
//! Serves OpenAI itself, custom compatible endpoints, and the Portkey gateway,
//! which speaks the same wire format behind its own key headers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatProvider, ProviderSettings, RequestDefaults, non_blank, require};
use crate::{
    Capabilities, CompletedResponse, GenerationConfig, ModelInfo, ProviderKind, RequestPayload,
    Role, StreamDelta, ToolDeclaration, UsageReport,
    error::{Error, Result},
    http::{HttpRequest, HttpTransport},
    sse::{self, LineStream},
};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const PORTKEY_BASE_URL: &str = "https://api.portkey.ai/v1";

/// Content used when a choice arrives without any message content
pub const NO_CONTENT: &str = "No response content available";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gateway {
    OpenAI,
    Portkey,
}

/// Chat Completions client
pub struct ChatCompletionsProvider {
    http: Arc<dyn HttpTransport>,
    kind: ProviderKind,
    gateway: Gateway,
    model: String,
    api_key: Option<String>,
    virtual_key: Option<String>,
    base_url: String,
    capabilities: Capabilities,
}

impl ChatCompletionsProvider {
    /// Create an OpenAI (or compatible endpoint) provider
    pub fn openai(settings: &ProviderSettings, http: Arc<dyn HttpTransport>) -> Self {
        Self::new(settings, http, Gateway::OpenAI, OPENAI_BASE_URL)
    }

    /// Create a Portkey gateway provider
    pub fn portkey(settings: &ProviderSettings, http: Arc<dyn HttpTransport>) -> Self {
        Self::new(settings, http, Gateway::Portkey, PORTKEY_BASE_URL)
    }

    fn new(
        settings: &ProviderSettings,
        http: Arc<dyn HttpTransport>,
        gateway: Gateway,
        default_base: &str,
    ) -> Self {
        let base_url = settings
            .endpoint
            .as_deref()
            .unwrap_or(default_base)
            .trim_end_matches('/')
            .to_string();

        Self {
            http,
            kind: settings.kind,
            gateway,
            model: settings.model.clone(),
            api_key: settings.key(),
            virtual_key: non_blank(settings.virtual_key.as_deref()),
            base_url,
            capabilities: settings.capabilities.resolve(&settings.model),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        let key = self.api_key.clone().unwrap_or_default();
        match self.gateway {
            Gateway::OpenAI => vec![("Authorization".to_string(), format!("Bearer {}", key))],
            Gateway::Portkey => vec![
                ("x-portkey-api-key".to_string(), key),
                (
                    "x-portkey-virtual-key".to_string(),
                    self.virtual_key.clone().unwrap_or_default(),
                ),
            ],
        }
    }

    fn build_request(&self, payload: &RequestPayload, stream: bool) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(prompt) = &payload.system_instruction {
            messages.push(ChatMessage {
                role: "system",
                content: prompt.clone(),
            });
        }
        for msg in &payload.messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System | Role::Error => continue,
            };
            messages.push(ChatMessage {
                role,
                content: msg.content.clone(),
            });
        }

        let tools: Vec<ChatTool> = payload
            .tools
            .iter()
            .filter_map(|tool| match tool {
                ToolDeclaration::Function { name } => Some(ChatTool {
                    tool_type: "function",
                    function: ChatFunction {
                        name: name.clone(),
                        description: name.replace('_', " "),
                    },
                }),
                // Provider-side tools have no Chat Completions equivalent
                ToolDeclaration::GoogleSearch | ToolDeclaration::CodeExecution => None,
            })
            .collect();

        ChatRequest {
            model: self.model.clone(),
            messages,
            stream,
            max_tokens: payload.generation.max_output_tokens,
            temperature: payload.generation.temperature,
            top_p: payload.generation.top_p,
            tools: (!tools.is_empty()).then_some(tools),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn http_request(&self, payload: &RequestPayload, stream: bool) -> Result<HttpRequest> {
        let body = serde_json::to_value(self.build_request(payload, stream))?;
        let request = self
            .headers()
            .into_iter()
            .fold(
                HttpRequest::new(format!("{}/chat/completions", self.base_url), body),
                |request, (name, value)| request.header(name, value),
            );
        Ok(request)
    }
}

#[async_trait]
impl ChatProvider for ChatCompletionsProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn defaults(&self) -> RequestDefaults {
        match self.gateway {
            Gateway::OpenAI => RequestDefaults::default(),
            Gateway::Portkey => RequestDefaults {
                generation: GenerationConfig {
                    temperature: Some(0.95),
                    top_p: Some(0.9),
                    max_output_tokens: Some(32768),
                    ..Default::default()
                },
                tools: vec![ToolDeclaration::Function {
                    name: "google_search".to_string(),
                }],
            },
        }
    }

    fn check_credentials(&self) -> Result<()> {
        match self.gateway {
            Gateway::OpenAI => require(&self.api_key, "OpenAI"),
            Gateway::Portkey => {
                require(&self.api_key, "Portkey")?;
                require(&self.virtual_key, "Portkey (virtual key)")
            }
        }
    }

    async fn complete(&self, payload: &RequestPayload) -> Result<CompletedResponse> {
        let request = self.http_request(payload, false)?;
        tracing::debug!("{} request for {}: {}", self.kind.name(), self.model, request.body);

        let response = self.http.post_json(request).await?.error_for_status()?;
        let parsed: ChatResponse = serde_json::from_str(&response.body)?;
        if let Some(error) = parsed.error {
            return Err(error.into());
        }

        let usage = parsed.usage.map(UsageReport::from).unwrap_or_default();
        let choice = parsed
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| Error::empty_response(self.kind.name()))?;

        let message = choice.message.unwrap_or_default();
        Ok(CompletedResponse {
            answer: message
                .content
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| NO_CONTENT.to_string()),
            thought: message.reasoning_content.filter(|r| !r.is_empty()),
            grounding: None,
            usage,
        })
    }

    async fn stream(&self, payload: &RequestPayload) -> Result<LineStream> {
        let request = self.http_request(payload, true)?;
        tracing::debug!(
            "{} stream request for {}: {}",
            self.kind.name(),
            self.model,
            request.body
        );

        let bytes = self.http.post_stream(request).await?;
        Ok(sse::lines(bytes))
    }

    fn decode_chunk(&self, data: &str) -> Result<StreamDelta> {
        let chunk: ChatResponse = serde_json::from_str(data)
            .map_err(|e| Error::MalformedChunk(format!("{}: {}", e, data)))?;

        if let Some(error) = chunk.error {
            return Err(error.into());
        }
        if chunk.choices.is_none() && chunk.usage.is_none() {
            return Err(Error::MalformedChunk(format!("unrecognised chunk: {}", data)));
        }

        let delta = chunk
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .unwrap_or_default();

        Ok(StreamDelta {
            text: delta.content.filter(|c| !c.is_empty()),
            thought: delta.reasoning_content.filter(|r| !r.is_empty()),
            grounding: None,
            usage: chunk.usage.map(UsageReport::from),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.base_url);
        let response = self.http.get(&url, &self.headers()).await?.error_for_status()?;
        let list: ModelList = serde_json::from_str(&response.body)?;

        let filter_chat = self.gateway == Gateway::OpenAI && self.base_url == OPENAI_BASE_URL;
        Ok(list
            .data
            .into_iter()
            .filter(|m| !filter_chat || is_chat_model(&m.id))
            .map(|m| ModelInfo {
                name: m.id.clone(),
                id: m.id,
                provider: self.kind.name().to_string(),
            })
            .collect())
    }
}

/// Filter function to identify chat-capable OpenAI models
fn is_chat_model(id: &str) -> bool {
    if id.starts_with("gpt-") {
        !["instruct", "embedding", "audio", "realtime", "transcribe", "tts", "image"]
            .iter()
            .any(|excluded| id.contains(excluded))
    } else {
        id.starts_with("o1") || id.starts_with("o3") || id.starts_with("o4")
    }
}

// Request types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunction,
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

// Response types, shared by full bodies and stream chunks

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Option<Vec<ChatChoice>>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatContent>,
    #[serde(default)]
    delta: Option<ChatContent>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl From<ChatUsage> for UsageReport {
    fn from(usage: ChatUsage) -> Self {
        UsageReport {
            input: usage.prompt_tokens,
            output: usage.completion_tokens,
            total: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl From<ChatError> for Error {
    fn from(error: ChatError) -> Self {
        let status = error
            .code
            .as_ref()
            .and_then(|code| match code {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .and_then(|code| u16::try_from(code).ok());
        Error::Transport {
            status,
            body: error.message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}
