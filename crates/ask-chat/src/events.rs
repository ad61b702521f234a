//! Chat event types

use ask_ai::Role;
use serde::{Deserialize, Serialize};

use crate::conversation::MessageId;

/// Which transport a request uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    NonStreaming,
    Streaming,
}

/// Where a turn is in the transport state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Requesting(TransportMode),
    /// Waiting out a rate limit before re-issuing the request
    BackingOff,
    Succeeded,
    Terminal,
}

/// Visual style of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStyle {
    Animated,
    Success,
    Failure,
}

/// Follow-up a notification offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    OpenSettings,
}

/// A user-facing status message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub style: NotificationStyle,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NotificationAction>,
}

impl Notification {
    pub fn animated(title: impl Into<String>, message: Option<String>) -> Self {
        Self {
            style: NotificationStyle::Animated,
            title: title.into(),
            message,
            action: None,
        }
    }

    pub fn success(title: impl Into<String>, message: Option<String>) -> Self {
        Self {
            style: NotificationStyle::Success,
            title: title.into(),
            message,
            action: None,
        }
    }

    pub fn failure(title: impl Into<String>, message: Option<String>) -> Self {
        Self {
            style: NotificationStyle::Failure,
            title: title.into(),
            message,
            action: None,
        }
    }

    /// Attach a follow-up action
    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }

    /// One-line text: `title: message`, or the title alone
    pub fn summary(&self) -> String {
        match self.message.as_deref().filter(|m| !m.is_empty()) {
            Some(message) => format!("{}: {}", self.title, message),
            None => self.title.clone(),
        }
    }
}

/// Events emitted during a chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A turn started: the user message and its in-progress reply were appended
    TurnStart { user: MessageId, assistant: MessageId },

    /// The transport state machine changed phase
    Phase { phase: TurnPhase },

    /// In-progress content changed
    MessageUpdate { id: MessageId, content: String },

    /// Status for the user
    Notification(Notification),

    /// A turn completed; `role` is `Error` when it failed
    TurnEnd {
        id: MessageId,
        role: Role,
        token_tally: u64,
    },

    /// The conversation was cleared
    ConversationCleared,
}
