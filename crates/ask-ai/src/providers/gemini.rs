//! Google Generative AI (Gemini) provider
//!
//! Two request dialects share one response parser. The REST dialect primes the
//! system prompt as an opening user turn and sends fixed sampling parameters;
//! the SDK dialect sends a `systemInstruction` and a thinking configuration.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatProvider, ProviderSettings, RequestDefaults, require};
use crate::{
    Capabilities, CompletedResponse, GenerationConfig, GroundingMetadata, ModelInfo,
    ProviderKind, RequestPayload, Role, StreamDelta, ToolDeclaration, UsageReport,
    error::{Error, Result},
    http::{HttpRequest, HttpTransport},
    sse::{self, LineStream},
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Acknowledgement the REST dialect places after the primed system prompt
const PRIMING_ACK: &str = "I'll follow those instructions.";

/// How requests are shaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeminiDialect {
    /// Plain REST calls with a primed system prompt
    Rest,
    /// SDK-style calls with system instruction and thinking configuration
    Sdk,
}

/// Gemini client
pub struct GeminiProvider {
    http: Arc<dyn HttpTransport>,
    kind: ProviderKind,
    dialect: GeminiDialect,
    model: String,
    api_key: Option<String>,
    base_url: String,
    capabilities: Capabilities,
}

impl GeminiProvider {
    /// Create a provider from settings
    pub fn new(settings: &ProviderSettings, http: Arc<dyn HttpTransport>, dialect: GeminiDialect) -> Self {
        Self {
            http,
            kind: settings.kind,
            dialect,
            model: settings.model.clone(),
            api_key: settings.key(),
            base_url: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            capabilities: settings.capabilities.resolve(&settings.model),
        }
    }

    fn url(&self, streaming: bool) -> String {
        let key = self.api_key.as_deref().unwrap_or_default();
        if streaming {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, self.model, key
            )
        } else {
            format!("{}/models/{}:generateContent?key={}", self.base_url, self.model, key)
        }
    }

    fn build_request(&self, payload: &RequestPayload) -> GeminiRequest {
        let mut contents = Vec::new();
        let mut system_instruction = None;

        if let Some(prompt) = &payload.system_instruction {
            match self.dialect {
                GeminiDialect::Rest => {
                    contents.push(GeminiContent::text("user", prompt));
                    contents.push(GeminiContent::text("model", PRIMING_ACK));
                }
                GeminiDialect::Sdk => {
                    system_instruction = Some(GeminiContent {
                        role: None,
                        parts: vec![GeminiPart { text: prompt.clone() }],
                    });
                }
            }
        }

        for msg in &payload.messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "model",
                Role::System | Role::Error => continue,
            };
            contents.push(GeminiContent::text(role, &msg.content));
        }

        let tools: Vec<GeminiTool> = payload.tools.iter().map(GeminiTool::from).collect();

        GeminiRequest {
            contents,
            system_instruction,
            tools: (!tools.is_empty()).then_some(tools),
            generation_config: GeminiGenerationConfig::from_config(&payload.generation),
        }
    }

    fn http_request(&self, payload: &RequestPayload, streaming: bool) -> Result<HttpRequest> {
        let body = serde_json::to_value(self.build_request(payload))?;
        Ok(HttpRequest::new(self.url(streaming), body))
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
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
        let mut tools = Vec::new();
        if self.capabilities.search_tool {
            tools.push(ToolDeclaration::GoogleSearch);
        }

        let generation = match self.dialect {
            GeminiDialect::Rest => GenerationConfig {
                temperature: Some(0.9),
                top_p: Some(0.95),
                max_output_tokens: Some(32768),
                ..Default::default()
            },
            GeminiDialect::Sdk => {
                if self.capabilities.code_execution {
                    tools.push(ToolDeclaration::CodeExecution);
                }
                GenerationConfig {
                    thinking_budget: self.capabilities.thinking_budget,
                    include_thoughts: self.capabilities.include_thoughts,
                    ..Default::default()
                }
            }
        };

        RequestDefaults { generation, tools }
    }

    fn check_credentials(&self) -> Result<()> {
        require(&self.api_key, "Gemini")
    }

    async fn complete(&self, payload: &RequestPayload) -> Result<CompletedResponse> {
        let request = self.http_request(payload, false)?;
        tracing::debug!("Gemini request for {}: {}", self.model, request.body);

        let response = self.http.post_json(request).await?.error_for_status()?;
        let parsed: GeminiResponse = serde_json::from_str(&response.body)?;
        if let Some(error) = parsed.error {
            return Err(error.into());
        }

        let usage = parsed.usage_metadata.map(UsageReport::from).unwrap_or_default();
        let candidate = parsed
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| Error::empty_response("Gemini"))?;

        let (answer, thought) = candidate.split_parts();
        Ok(CompletedResponse {
            answer,
            thought,
            grounding: candidate.grounding_metadata,
            usage,
        })
    }

    async fn stream(&self, payload: &RequestPayload) -> Result<LineStream> {
        let request = self.http_request(payload, true)?;
        tracing::debug!("Gemini stream request for {}: {}", self.model, request.body);

        let bytes = self.http.post_stream(request).await?;
        Ok(sse::lines(bytes))
    }

    fn decode_chunk(&self, data: &str) -> Result<StreamDelta> {
        let chunk: GeminiResponse = serde_json::from_str(data)
            .map_err(|e| Error::MalformedChunk(format!("{}: {}", e, data)))?;

        if let Some(error) = chunk.error {
            return Err(error.into());
        }
        if chunk.candidates.is_none() && chunk.usage_metadata.is_none() {
            return Err(Error::MalformedChunk(format!("unrecognised chunk: {}", data)));
        }

        let mut delta = StreamDelta {
            usage: chunk.usage_metadata.map(UsageReport::from),
            ..Default::default()
        };

        if let Some(candidate) = chunk.candidates.unwrap_or_default().into_iter().next() {
            let (answer, thought) = candidate.split_parts();
            delta.text = (!answer.is_empty()).then_some(answer);
            delta.thought = thought;
            delta.grounding = candidate.grounding_metadata;
        }

        Ok(delta)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!(
            "{}/models?key={}",
            self.base_url,
            self.api_key.as_deref().unwrap_or_default()
        );
        let response = self.http.get(&url, &[]).await?.error_for_status()?;
        let list: GoogleModelList = serde_json::from_str(&response.body)?;

        Ok(list
            .models
            .into_iter()
            .filter(|m| {
                m.supported_generation_methods
                    .iter()
                    .any(|method| method == "generateContent")
            })
            .map(|m| ModelInfo {
                id: m.id().to_string(),
                name: m.display_name.clone().unwrap_or_else(|| m.id().to_string()),
                provider: "Google".to_string(),
            })
            .collect())
    }
}

// Request types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![GeminiPart {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
enum GeminiTool {
    #[serde(rename = "google_search")]
    GoogleSearch {},
    #[serde(rename = "code_execution")]
    CodeExecution {},
    #[serde(rename = "functionDeclarations")]
    FunctionDeclarations(Vec<GeminiFunctionDeclaration>),
}

impl From<&ToolDeclaration> for GeminiTool {
    fn from(tool: &ToolDeclaration) -> Self {
        match tool {
            ToolDeclaration::GoogleSearch => GeminiTool::GoogleSearch {},
            ToolDeclaration::CodeExecution => GeminiTool::CodeExecution {},
            ToolDeclaration::Function { name } => {
                GeminiTool::FunctionDeclarations(vec![GeminiFunctionDeclaration {
                    name: name.clone(),
                    description: name.replace('_', " "),
                }])
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<GeminiThinkingConfig>,
}

impl GeminiGenerationConfig {
    fn from_config(config: &GenerationConfig) -> Option<Self> {
        let thinking_config = (config.thinking_budget.is_some() || config.include_thoughts)
            .then(|| GeminiThinkingConfig {
                include_thoughts: config.include_thoughts,
                thinking_budget: config.thinking_budget,
            });

        let generation = Self {
            temperature: config.temperature,
            top_p: config.top_p,
            max_output_tokens: config.max_output_tokens,
            thinking_config,
        };

        let empty = generation.temperature.is_none()
            && generation.top_p.is_none()
            && generation.max_output_tokens.is_none()
            && generation.thinking_config.is_none();
        (!empty).then_some(generation)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    include_thoughts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_budget: Option<u32>,
}

// Response types

/// Shared by `generateContent` bodies and stream chunks
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiResponseContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

impl GeminiCandidate {
    /// Concatenate answer parts and thought parts separately, in order
    fn split_parts(&self) -> (String, Option<String>) {
        let mut answer = String::new();
        let mut thought: Option<String> = None;

        let parts = self.content.iter().flat_map(|c| c.parts.iter());
        for part in parts {
            if part.thought {
                if let Some(text) = &part.text {
                    thought.get_or_insert_with(String::new).push_str(text);
                }
            } else if let Some(text) = part.answer_text() {
                answer.push_str(&text);
            }
        }

        (answer, thought)
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    executable_code: Option<GeminiExecutableCode>,
    #[serde(default)]
    code_execution_result: Option<GeminiCodeExecutionResult>,
}

impl GeminiResponsePart {
    /// Text this part contributes to the answer; code execution renders as fenced blocks
    fn answer_text(&self) -> Option<String> {
        if let Some(text) = &self.text {
            return Some(text.clone());
        }
        if let Some(code) = &self.executable_code {
            return Some(format!(
                "\n```{}\n{}\n```\n",
                code.language.to_lowercase(),
                code.code.trim_end()
            ));
        }
        self.code_execution_result
            .as_ref()
            .filter(|result| !result.output.is_empty())
            .map(|result| format!("\n```output\n{}\n```\n", result.output.trim_end()))
    }
}

#[derive(Debug, Deserialize)]
struct GeminiExecutableCode {
    #[serde(default)]
    language: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct GeminiCodeExecutionResult {
    #[serde(default)]
    output: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    total_token_count: Option<u32>,
}

impl From<GeminiUsageMetadata> for UsageReport {
    fn from(usage: GeminiUsageMetadata) -> Self {
        UsageReport {
            input: usage.prompt_token_count,
            output: usage.candidates_token_count,
            total: usage.total_token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

impl From<GeminiError> for Error {
    fn from(error: GeminiError) -> Self {
        Error::Transport {
            status: error.code,
            body: error.message,
        }
    }
}

// Model listing types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleModelInfo {
    /// e.g. "models/gemini-1.5-pro"
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

impl GoogleModelInfo {
    fn id(&self) -> &str {
        self.name.strip_prefix("models/").unwrap_or(&self.name)
    }
}

#[derive(Debug, Deserialize)]
struct GoogleModelList {
    #[serde(default)]
    models: Vec<GoogleModelInfo>,
}
