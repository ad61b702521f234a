//! Anthropic Messages API provider

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatProvider, ProviderSettings, RequestDefaults, require};
use crate::{
    Capabilities, CompletedResponse, GenerationConfig, ModelInfo, ProviderKind, RequestPayload,
    Role, StreamDelta, ToolDeclaration, UsageReport,
    error::{Error, Result},
    http::{HttpRequest, HttpTransport},
    sse::{self, LineStream},
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// max_tokens is mandatory on this API
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Room left for the answer when a thinking budget is set
const ANSWER_HEADROOM: u32 = 4096;

/// Anthropic API client
pub struct AnthropicProvider {
    http: Arc<dyn HttpTransport>,
    kind: ProviderKind,
    model: String,
    api_key: Option<String>,
    base_url: String,
    capabilities: Capabilities,
}

impl AnthropicProvider {
    /// Create a provider from settings
    pub fn new(settings: &ProviderSettings, http: Arc<dyn HttpTransport>) -> Self {
        Self {
            http,
            kind: settings.kind,
            model: settings.model.clone(),
            api_key: settings.key(),
            base_url: settings
                .endpoint
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            capabilities: settings.capabilities.resolve(&settings.model),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "x-api-key".to_string(),
                self.api_key.clone().unwrap_or_default(),
            ),
            ("anthropic-version".to_string(), API_VERSION.to_string()),
        ]
    }

    fn build_request(&self, payload: &RequestPayload, stream: bool) -> AnthropicRequest {
        let messages = payload
            .messages
            .iter()
            .filter_map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System | Role::Error => return None,
                };
                Some(AnthropicMessage {
                    role,
                    content: msg.content.clone(),
                })
            })
            .collect();

        let tools: Vec<AnthropicTool> = payload
            .tools
            .iter()
            .filter_map(|tool| match tool {
                ToolDeclaration::Function { name } => Some(AnthropicTool {
                    name: name.clone(),
                    description: name.replace('_', " "),
                    input_schema: serde_json::json!({"type": "object", "properties": {}}),
                }),
                ToolDeclaration::GoogleSearch | ToolDeclaration::CodeExecution => None,
            })
            .collect();

        let generation = &payload.generation;
        let mut max_tokens = generation.max_output_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let thinking = generation.thinking_budget.map(|budget| {
            max_tokens = max_tokens.max(budget.saturating_add(ANSWER_HEADROOM));
            ThinkingConfig {
                thinking_type: "enabled",
                budget_tokens: budget,
            }
        });

        // Sampling parameters are rejected while extended thinking is on
        let (temperature, top_p) = match thinking {
            Some(_) => (None, None),
            None => (generation.temperature, generation.top_p),
        };

        AnthropicRequest {
            model: self.model.clone(),
            messages,
            max_tokens,
            stream,
            system: payload.system_instruction.as_ref().map(|text| {
                vec![SystemBlock {
                    block_type: "text",
                    text: text.clone(),
                }]
            }),
            temperature,
            top_p,
            tools: (!tools.is_empty()).then_some(tools),
            thinking,
        }
    }

    fn http_request(&self, payload: &RequestPayload, stream: bool) -> Result<HttpRequest> {
        let body = serde_json::to_value(self.build_request(payload, stream))?;
        let request = self.headers().into_iter().fold(
            HttpRequest::new(format!("{}/messages", self.base_url), body),
            |request, (name, value)| request.header(name, value),
        );
        Ok(request)
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
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
        RequestDefaults {
            generation: GenerationConfig {
                thinking_budget: self.capabilities.thinking_budget,
                ..Default::default()
            },
            tools: Vec::new(),
        }
    }

    fn check_credentials(&self) -> Result<()> {
        require(&self.api_key, "Anthropic")
    }

    async fn complete(&self, payload: &RequestPayload) -> Result<CompletedResponse> {
        let request = self.http_request(payload, false)?;
        tracing::debug!("Anthropic request for {}: {}", self.model, request.body);

        let response = self.http.post_json(request).await?.error_for_status()?;
        let parsed: MessageResponse = serde_json::from_str(&response.body)?;
        if let Some(error) = parsed.error {
            return Err(error.into());
        }
        if parsed.content.is_empty() {
            return Err(Error::empty_response("Anthropic"));
        }

        let mut answer = String::new();
        let mut thought: Option<String> = None;
        for block in parsed.content {
            match block {
                ResponseBlock::Text { text } => answer.push_str(&text),
                ResponseBlock::Thinking { thinking } => {
                    thought.get_or_insert_with(String::new).push_str(&thinking)
                }
                ResponseBlock::Other => {}
            }
        }

        Ok(CompletedResponse {
            answer,
            thought,
            grounding: None,
            usage: parsed.usage.map(UsageReport::from).unwrap_or_default(),
        })
    }

    async fn stream(&self, payload: &RequestPayload) -> Result<LineStream> {
        let request = self.http_request(payload, true)?;
        tracing::debug!("Anthropic stream request for {}: {}", self.model, request.body);

        let bytes = self.http.post_stream(request).await?;
        Ok(sse::lines(bytes))
    }

    fn decode_chunk(&self, data: &str) -> Result<StreamDelta> {
        let event: StreamEvent = serde_json::from_str(data)
            .map_err(|e| Error::MalformedChunk(format!("{}: {}", e, data)))?;

        let delta = match event {
            StreamEvent::MessageStart { message } => StreamDelta {
                usage: message.usage.map(UsageReport::from),
                ..Default::default()
            },
            StreamEvent::ContentBlockDelta { delta } => match delta {
                DeltaInfo::TextDelta { text } => StreamDelta::text(text),
                DeltaInfo::ThinkingDelta { thinking } => StreamDelta {
                    thought: Some(thinking),
                    ..Default::default()
                },
                DeltaInfo::Other => StreamDelta::default(),
            },
            StreamEvent::MessageDelta { usage } => StreamDelta {
                // Output count is cumulative; the input count came with message_start
                usage: usage.map(|u| UsageReport {
                    output: u.output_tokens,
                    ..Default::default()
                }),
                ..Default::default()
            },
            StreamEvent::Error { error } => return Err(error.into()),
            StreamEvent::Other => StreamDelta::default(),
        };

        Ok(delta)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.base_url);
        let response = self.http.get(&url, &self.headers()).await?.error_for_status()?;
        let list: ModelList = serde_json::from_str(&response.body)?;

        Ok(list
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.display_name.unwrap_or_else(|| m.id.clone()),
                id: m.id,
                provider: "Anthropic".to_string(),
            })
            .collect())
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    thinking_type: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<UsageInfo>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: MessageInfo,
    },
    ContentBlockDelta {
        delta: DeltaInfo,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<UsageInfo>,
    },
    Error {
        error: ApiError,
    },
    /// ping, content_block_start/stop, message_stop
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum DeltaInfo {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

impl From<UsageInfo> for UsageReport {
    fn from(usage: UsageInfo) -> Self {
        UsageReport {
            input: usage.input_tokens,
            output: usage.output_tokens,
            total: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

impl From<ApiError> for Error {
    fn from(error: ApiError) -> Self {
        if error.error_type == "rate_limit_error" {
            return Error::RateLimited(error.message);
        }
        let status = match error.error_type.as_str() {
            "overloaded_error" => Some(529),
            "api_error" => Some(500),
            _ => None,
        };
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
    #[serde(default)]
    display_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PayloadMessage, Vendor, providers::testing::RecordingTransport};
    use serde_json::json;

    fn provider(http: Arc<RecordingTransport>) -> AnthropicProvider {
        let settings = ProviderSettings::new(
            ProviderKind::MultiProvider(Vendor::Anthropic),
            "claude-sonnet-4-5",
        )
        .with_api_key("sk-ant-test");
        AnthropicProvider::new(&settings, http)
    }

    #[tokio::test]
    async fn test_stream_request_shape() {
        let http = RecordingTransport::streaming("event: message_stop\ndata: {\"type\":\"message_stop\"}\n");
        let provider = provider(http.clone());
        let payload = RequestPayload::new(vec![PayloadMessage::user("Hello")])
            .with_system(Some("Be brief."))
            .with_generation(GenerationConfig {
                temperature: Some(0.7),
                thinking_budget: Some(10000),
                max_output_tokens: Some(2048),
                ..Default::default()
            });
        provider.stream(&payload).await.unwrap();

        let request = http.last_request();
        assert_eq!(request.url, "https://api.anthropic.com/v1/messages");
        assert!(request.headers.contains(&("x-api-key".into(), "sk-ant-test".into())));
        assert!(request.headers.contains(&("anthropic-version".into(), "2023-06-01".into())));

        let body = request.body;
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"][0]["text"], "Be brief.");
        assert_eq!(body["thinking"], json!({"type": "enabled", "budget_tokens": 10000}));
        assert_eq!(body["max_tokens"], 14096);
        assert!(body.get("temperature").is_none());
    }

    #[tokio::test]
    async fn test_huge_thinking_budget_saturates_max_tokens() {
        let http = RecordingTransport::streaming("data: {\"type\":\"message_stop\"}\n");
        let provider = provider(http.clone());
        let payload = RequestPayload::new(vec![PayloadMessage::user("Hello")]).with_generation(
            GenerationConfig {
                thinking_budget: Some(u32::MAX - 10),
                ..Default::default()
            },
        );
        provider.stream(&payload).await.unwrap();
        assert_eq!(http.last_request().body["max_tokens"], u32::MAX);
    }

    #[tokio::test]
    async fn test_complete_separates_thinking() {
        let http = RecordingTransport::responding(
            200,
            json!({
                "content": [
                    {"type": "thinking", "thinking": "Short greeting.", "signature": "sig"},
                    {"type": "text", "text": "Hello!"}
                ],
                "usage": {"input_tokens": 8, "output_tokens": 3}
            }),
        );
        let provider = provider(http);
        let response = provider
            .complete(&RequestPayload::new(vec![PayloadMessage::user("Hi")]))
            .await
            .unwrap();
        assert_eq!(response.answer, "Hello!");
        assert_eq!(response.thought.as_deref(), Some("Short greeting."));
        assert_eq!(response.usage.resolved_total(), Some(11));
    }

    #[test]
    fn test_decode_stream_events() {
        let provider = provider(Arc::new(RecordingTransport::default()));

        let start = provider
            .decode_chunk(r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":25,"output_tokens":1}}}"#)
            .unwrap();
        assert_eq!(start.usage.unwrap().input, Some(25));

        let text = provider
            .decode_chunk(r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hi"}}"#)
            .unwrap();
        assert_eq!(text.text.as_deref(), Some("Hi"));

        let thought = provider
            .decode_chunk(r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Hmm"}}"#)
            .unwrap();
        assert_eq!(thought.thought.as_deref(), Some("Hmm"));

        let end = provider
            .decode_chunk(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":15}}"#)
            .unwrap();
        assert_eq!(end.usage.unwrap().output, Some(15));

        assert!(provider.decode_chunk(r#"{"type":"ping"}"#).unwrap().is_empty());
        assert!(matches!(
            provider.decode_chunk(r#"{"no_type":true}"#),
            Err(Error::MalformedChunk(_))
        ));
    }

    #[test]
    fn test_stream_error_event_is_terminal() {
        let provider = provider(Arc::new(RecordingTransport::default()));
        let err = provider
            .decode_chunk(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::Transport { status: Some(529), .. }));
        assert!(!err.is_recoverable());

        let err = provider
            .decode_chunk(r#"{"type":"error","error":{"type":"rate_limit_error","message":"Slow down"}}"#)
            .unwrap_err();
        assert!(err.is_rate_limited());
    }
}
