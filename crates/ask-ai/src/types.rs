//! Core types shared by every provider variant

use serde::{Deserialize, Serialize};

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// A failed turn; kept in the transcript but never sent to a provider
    Error,
}

/// A role-tagged message content as sent to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMessage {
    pub role: Role,
    pub content: String,
}

impl PayloadMessage {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generation parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Temperature (0.0 - 2.0)
    pub temperature: Option<f32>,
    /// Nucleus-sampling top-p
    pub top_p: Option<f32>,
    /// Maximum output tokens
    pub max_output_tokens: Option<u32>,
    /// Reasoning token budget, for models that think before answering
    pub thinking_budget: Option<u32>,
    /// Ask the provider to return its reasoning as separate parts
    pub include_thoughts: bool,
}

impl GenerationConfig {
    /// Fill unset fields from `fallback`
    pub fn or(self, fallback: &GenerationConfig) -> Self {
        Self {
            temperature: self.temperature.or(fallback.temperature),
            top_p: self.top_p.or(fallback.top_p),
            max_output_tokens: self.max_output_tokens.or(fallback.max_output_tokens),
            thinking_budget: self.thinking_budget.or(fallback.thinking_budget),
            include_thoughts: self.include_thoughts || fallback.include_thoughts,
        }
    }
}

/// Tool declarations a request may carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolDeclaration {
    /// Provider-side web search grounding
    GoogleSearch,
    /// Provider-side code execution
    CodeExecution,
    /// A named function tool
    Function { name: String },
}

/// Everything a provider needs to issue one turn.
///
/// Built fresh from the conversation each turn and discarded afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPayload {
    /// System instruction
    pub system_instruction: Option<String>,
    /// Conversation history, oldest first, ending with the new user message
    pub messages: Vec<PayloadMessage>,
    /// Generation parameters
    pub generation: GenerationConfig,
    /// Tool declarations
    pub tools: Vec<ToolDeclaration>,
}

impl RequestPayload {
    /// Create a payload from history
    pub fn new(messages: Vec<PayloadMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Set the system instruction; blank prompts are dropped
    pub fn with_system(mut self, prompt: Option<&str>) -> Self {
        self.system_instruction = prompt
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        self
    }

    /// Set generation parameters
    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    /// Set tool declarations
    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = tools;
        self
    }
}

/// A web source backing a grounded answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    #[serde(default)]
    pub title: String,
    pub uri: String,
}

/// One citation chunk; chunks without a web source are kept for indexing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingChunk {
    #[serde(default)]
    pub web: Option<GroundingSource>,
}

/// Grounding metadata attached to a candidate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
    #[serde(default)]
    pub web_search_queries: Vec<String>,
}

/// Token usage as reported by a provider; every field is optional on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub input: Option<u32>,
    pub output: Option<u32>,
    pub total: Option<u32>,
}

impl UsageReport {
    /// A report carrying only a total
    pub fn total(total: u32) -> Self {
        Self {
            total: Some(total),
            ..Default::default()
        }
    }

    /// Overlay the fields present in `newer`; providers report cumulative values
    pub fn merge(&mut self, newer: UsageReport) {
        if newer.input.is_some() {
            self.input = newer.input;
        }
        if newer.output.is_some() {
            self.output = newer.output;
        }
        if newer.total.is_some() {
            self.total = newer.total;
        }
    }

    /// Resolve the turn total: the reported total, else input + output
    pub fn resolved_total(&self) -> Option<u32> {
        self.total.or(match (self.input, self.output) {
            (None, None) => None,
            (input, output) => Some(input.unwrap_or(0).saturating_add(output.unwrap_or(0))),
        })
    }
}

/// A complete (non-streamed) provider answer, reduced to what the transcript needs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedResponse {
    /// Concatenated non-thought text
    pub answer: String,
    /// Concatenated reasoning text, if the provider returned any
    pub thought: Option<String>,
    /// Grounding metadata of the first candidate
    pub grounding: Option<GroundingMetadata>,
    /// Reported usage
    pub usage: UsageReport,
}

/// What one stream data line contributed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    /// Answer fragment
    pub text: Option<String>,
    /// Reasoning fragment
    pub thought: Option<String>,
    /// Complete grounding metadata as of this chunk
    pub grounding: Option<GroundingMetadata>,
    /// Cumulative usage as of this chunk
    pub usage: Option<UsageReport>,
}

impl StreamDelta {
    /// A delta carrying only answer text
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// True when the chunk carried nothing we use (keep-alives, role headers)
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.thought.is_none()
            && self.grounding.is_none()
            && self.usage.is_none()
    }
}

/// A model entry as listed by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
}
