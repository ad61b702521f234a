//! Conversation state: the message log plus the display metadata derived from it.

use std::collections::BTreeMap;

use ask_ai::{GroundingChunk, GroundingMetadata, PayloadMessage, Role};
use serde::{Deserialize, Serialize};

/// Handle to a message in the log, returned when it is appended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(usize);

impl MessageId {
    /// Position of the message in the log
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A logged message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds, strictly increasing within a conversation
    pub timestamp: i64,
}

/// Conversation state
#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    in_progress: Option<MessageId>,
    token_tally: u64,
    grounding_sources: BTreeMap<usize, GroundingChunk>,
    search_queries: Vec<String>,
    thinking_traces: BTreeMap<usize, String>,
    last_timestamp: i64,
}

impl Conversation {
    /// Create an empty conversation
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Look up a message by handle
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(id.0)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Accumulated token count across turns
    pub fn token_tally(&self) -> u64 {
        self.token_tally
    }

    /// Citation chunks of the latest turn, keyed by citation index
    pub fn grounding_sources(&self) -> &BTreeMap<usize, GroundingChunk> {
        &self.grounding_sources
    }

    /// Search queries of the latest turn
    pub fn search_queries(&self) -> &[String] {
        &self.search_queries
    }

    /// Hidden reasoning recorded for a message
    pub fn thinking_trace(&self, index: usize) -> Option<&str> {
        self.thinking_traces.get(&index).map(String::as_str)
    }

    /// The message currently being produced, if any
    pub fn in_progress(&self) -> Option<MessageId> {
        self.in_progress
    }

    /// Whether a handle still addresses the in-progress message
    pub fn is_in_progress(&self, id: MessageId) -> bool {
        self.in_progress == Some(id)
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    fn push(&mut self, role: Role, content: impl Into<String>) -> MessageId {
        let timestamp = self.next_timestamp();
        self.messages.push(Message {
            role,
            content: content.into(),
            timestamp,
        });
        MessageId(self.messages.len() - 1)
    }

    /// Append a completed user message
    pub fn push_user(&mut self, content: impl Into<String>) -> MessageId {
        self.push(Role::User, content)
    }

    /// Append a system message; kept for display bookkeeping, never rendered or sent
    pub fn push_system(&mut self, content: impl Into<String>) -> MessageId {
        self.push(Role::System, content)
    }

    /// Append an in-progress assistant message and return its handle
    pub fn begin_assistant(&mut self, content: impl Into<String>) -> MessageId {
        if let Some(previous) = self.in_progress.take() {
            tracing::warn!("Abandoning in-progress message {}", previous);
        }
        let id = self.push(Role::Assistant, content);
        self.in_progress = Some(id);
        id
    }

    fn in_progress_mut(&mut self, id: MessageId, action: &str) -> Option<&mut Message> {
        if !self.is_in_progress(id) {
            tracing::warn!("Ignoring {} on completed message {}", action, id);
            return None;
        }
        self.messages.get_mut(id.0)
    }

    /// Replace the content of the in-progress message
    pub fn set_content(&mut self, id: MessageId, content: impl Into<String>) -> bool {
        match self.in_progress_mut(id, "content update") {
            Some(message) => {
                message.content = content.into();
                true
            }
            None => false,
        }
    }

    /// Record the reasoning trace of the in-progress message
    pub fn set_thinking(&mut self, id: MessageId, trace: impl Into<String>) -> bool {
        if self.in_progress_mut(id, "thinking update").is_none() {
            return false;
        }
        self.thinking_traces.insert(id.0, trace.into());
        true
    }

    /// Drop the reasoning trace of the in-progress message
    pub fn clear_thinking(&mut self, id: MessageId) -> bool {
        if self.in_progress_mut(id, "thinking reset").is_none() {
            return false;
        }
        self.thinking_traces.remove(&id.0);
        true
    }

    /// Restart the in-progress message: new content, no reasoning trace
    pub fn reset_in_progress(&mut self, id: MessageId, content: impl Into<String>) -> bool {
        self.set_content(id, content) && self.clear_thinking(id)
    }

    /// Complete the in-progress message; it is immutable afterwards
    pub fn finalize(&mut self, id: MessageId) {
        if self.is_in_progress(id) {
            self.in_progress = None;
        }
    }

    /// Turn the in-progress message into an error message and complete it
    pub fn fail(&mut self, id: MessageId, error: impl Into<String>) {
        let error = error.into();
        if let Some(message) = self.in_progress_mut(id, "failure") {
            message.role = Role::Error;
            message.content = error;
            self.thinking_traces.remove(&id.0);
            self.in_progress = None;
        }
    }

    /// Add tokens to the tally
    pub fn add_tokens(&mut self, tokens: u64) {
        self.token_tally = self.token_tally.saturating_add(tokens);
    }

    /// Replace the grounding sources and search queries; `None` clears both
    pub fn apply_grounding(&mut self, grounding: Option<GroundingMetadata>) {
        let grounding = grounding.unwrap_or_default();
        self.grounding_sources = grounding.grounding_chunks.into_iter().enumerate().collect();
        self.search_queries = grounding.web_search_queries;
    }

    /// Index of the latest completed assistant message
    pub fn last_completed_assistant(&self) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .rev()
            .find(|(index, m)| {
                m.role == Role::Assistant && self.in_progress.map(|id| id.0) != Some(*index)
            })
            .map(|(index, _)| index)
    }

    /// Content of the latest completed assistant message
    pub fn last_response(&self) -> Option<&str> {
        self.last_completed_assistant()
            .map(|index| self.messages[index].content.as_str())
    }

    /// Messages to send with the next request: completed user and assistant turns
    pub fn history(&self) -> Vec<PayloadMessage> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(index, _)| self.in_progress.map(|id| id.0) != Some(*index))
            .filter(|(_, m)| matches!(m.role, Role::User | Role::Assistant))
            .filter(|(_, m)| !m.content.trim().is_empty())
            .map(|(_, m)| PayloadMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    /// Drop all messages and derived metadata
    pub fn clear(&mut self) {
        let last_timestamp = self.last_timestamp;
        *self = Self::default();
        self.last_timestamp = last_timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ask_ai::GroundingSource;

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut conversation = Conversation::new();
        for i in 0..50 {
            conversation.push_user(format!("message {}", i));
        }
        let stamps: Vec<i64> = conversation.messages().iter().map(|m| m.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_updates_after_finalize_are_ignored() {
        let mut conversation = Conversation::new();
        conversation.push_user("Hello");
        let id = conversation.begin_assistant("");
        assert!(conversation.set_content(id, "Hi"));
        conversation.finalize(id);

        assert!(!conversation.set_content(id, "changed"));
        assert!(!conversation.set_thinking(id, "late"));
        assert_eq!(conversation.get(id).unwrap().content, "Hi");
        assert_eq!(conversation.in_progress(), None);
    }

    #[test]
    fn test_reset_in_progress_drops_trace() {
        let mut conversation = Conversation::new();
        conversation.push_user("Hello");
        let id = conversation.begin_assistant("");
        conversation.set_content(id, "partial");
        conversation.set_thinking(id, "abandoned reasoning");

        assert!(conversation.reset_in_progress(id, "Loading response..."));
        assert_eq!(conversation.get(id).unwrap().content, "Loading response...");
        assert_eq!(conversation.thinking_trace(id.index()), None);

        conversation.finalize(id);
        assert!(!conversation.reset_in_progress(id, ""));
    }

    #[test]
    fn test_fail_converts_to_error_role() {
        let mut conversation = Conversation::new();
        conversation.push_user("Hello");
        let id = conversation.begin_assistant("Loading response...");
        conversation.set_thinking(id, "partial thought");
        conversation.fail(id, "API error: 500");

        let message = conversation.get(id).unwrap();
        assert_eq!(message.role, Role::Error);
        assert_eq!(message.content, "API error: 500");
        assert_eq!(conversation.thinking_trace(id.index()), None);
        assert_eq!(conversation.in_progress(), None);
    }

    #[test]
    fn test_history_excludes_errors_and_in_progress() {
        let mut conversation = Conversation::new();
        conversation.push_system("setup");
        conversation.push_user("first");
        let failed = conversation.begin_assistant("");
        conversation.fail(failed, "boom");
        conversation.push_user("second");
        let ok = conversation.begin_assistant("");
        conversation.set_content(ok, "answer");
        conversation.finalize(ok);
        conversation.push_user("third");
        conversation.begin_assistant("Loading response...");

        let history = conversation.history();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "answer", "third"]);
    }

    #[test]
    fn test_apply_grounding_replaces_wholesale() {
        let mut conversation = Conversation::new();
        conversation.apply_grounding(Some(GroundingMetadata {
            grounding_chunks: vec![
                GroundingChunk {
                    web: Some(GroundingSource {
                        title: "A".into(),
                        uri: "https://a.example".into(),
                    }),
                },
                GroundingChunk::default(),
            ],
            web_search_queries: vec!["query".into()],
        }));
        assert_eq!(conversation.grounding_sources().len(), 2);
        assert_eq!(conversation.search_queries(), ["query"]);

        conversation.apply_grounding(None);
        assert!(conversation.grounding_sources().is_empty());
        assert!(conversation.search_queries().is_empty());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut conversation = Conversation::new();
        conversation.push_user("Hello");
        let id = conversation.begin_assistant("");
        conversation.set_thinking(id, "trace");
        conversation.add_tokens(42);
        conversation.clear();

        assert!(conversation.is_empty());
        assert_eq!(conversation.token_tally(), 0);
        assert_eq!(conversation.in_progress(), None);
        assert_eq!(conversation.thinking_trace(1), None);

        let before = conversation.last_timestamp;
        conversation.push_user("again");
        assert!(conversation.messages()[0].timestamp > before);
    }

    #[test]
    fn test_last_response_skips_in_progress() {
        let mut conversation = Conversation::new();
        assert_eq!(conversation.last_response(), None);
        conversation.push_user("Hello");
        let id = conversation.begin_assistant("");
        conversation.set_content(id, "Hi there");
        conversation.finalize(id);
        conversation.push_user("More");
        conversation.begin_assistant("Loading response...");
        assert_eq!(conversation.last_response(), Some("Hi there"));
    }
}
