//! Response aggregation.
//!
//! Folds either one complete provider response or a sequence of stream lines
//! into exactly one in-progress assistant message, plus the side-channel
//! metadata (thinking trace, grounding, token tally) kept on the conversation.

use ask_ai::{
    ChatProvider, CompletedResponse, GroundingMetadata, Result, UsageReport,
    sse::{SseLine, classify},
};
use serde::{Deserialize, Serialize};

use crate::conversation::{Conversation, MessageId};

/// How to count tokens for a full-response turn that reports no usage.
///
/// Streaming turns always estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEstimation {
    /// Leave the tally unchanged
    #[default]
    Off,
    /// One token per four characters, rounded up
    CharsDiv4,
}

/// Rough token count: characters / 4, rounded up
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Apply a complete response to the in-progress message
pub fn apply_full_response(
    conversation: &mut Conversation,
    id: MessageId,
    response: CompletedResponse,
    estimation: TokenEstimation,
) {
    match response.thought.filter(|t| !t.trim().is_empty()) {
        Some(thought) => conversation.set_thinking(id, thought),
        None => conversation.clear_thinking(id),
    };
    conversation.apply_grounding(response.grounding);

    let tokens = match (response.usage.resolved_total(), estimation) {
        (Some(total), _) => u64::from(total),
        (None, TokenEstimation::CharsDiv4) => estimate_tokens(&response.answer),
        (None, TokenEstimation::Off) => 0,
    };
    conversation.add_tokens(tokens);
    conversation.set_content(id, response.answer);
}

/// What feeding one line did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    /// Noise, or a chunk that changed nothing visible
    Ignored,
    /// The message content or thinking trace changed
    Updated,
    /// A malformed chunk was logged and dropped
    Skipped,
    /// The end marker
    Done,
}

/// Accumulates one streamed response
#[derive(Debug)]
pub struct StreamAggregator {
    id: MessageId,
    buffer: String,
    thought: String,
    grounding: Option<GroundingMetadata>,
    usage: UsageReport,
    skipped: usize,
}

impl StreamAggregator {
    /// Start aggregating into the in-progress message `id`
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            buffer: String::new(),
            thought: String::new(),
            grounding: None,
            usage: UsageReport::default(),
            skipped: 0,
        }
    }

    /// Feed one stream line.
    ///
    /// Malformed chunks are skipped; a provider error inside the stream is
    /// returned and ends the turn.
    pub fn feed_line(
        &mut self,
        provider: &dyn ChatProvider,
        conversation: &mut Conversation,
        line: &str,
    ) -> Result<LineOutcome> {
        let data = match classify(line) {
            SseLine::Ignore => return Ok(LineOutcome::Ignored),
            SseLine::Done => return Ok(LineOutcome::Done),
            SseLine::Data(data) => data,
        };

        let delta = match provider.decode_chunk(data) {
            Ok(delta) => delta,
            Err(e) if e.is_recoverable() => {
                tracing::warn!("Skipping stream chunk: {}", e);
                self.skipped += 1;
                return Ok(LineOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let mut outcome = LineOutcome::Ignored;
        if let Some(text) = delta.text {
            self.buffer.push_str(&text);
            conversation.set_content(self.id, self.buffer.clone());
            outcome = LineOutcome::Updated;
        }
        if let Some(thought) = delta.thought {
            self.thought.push_str(&thought);
            conversation.set_thinking(self.id, self.thought.clone());
            outcome = LineOutcome::Updated;
        }
        if let Some(grounding) = delta.grounding {
            self.grounding = Some(grounding);
        }
        if let Some(usage) = delta.usage {
            self.usage.merge(usage);
        }

        Ok(outcome)
    }

    /// Apply end-of-stream metadata and return the tokens added to the tally
    pub fn finish(self, conversation: &mut Conversation) -> u64 {
        conversation.set_content(self.id, self.buffer.clone());
        conversation.apply_grounding(self.grounding);

        let tokens = self
            .usage
            .resolved_total()
            .map(u64::from)
            .unwrap_or_else(|| estimate_tokens(&self.buffer));
        conversation.add_tokens(tokens);

        if self.skipped > 0 {
            tracing::debug!("Stream finished with {} skipped chunks", self.skipped);
        }
        tokens
    }
}
