//! Error types for ask-chat

use thiserror::Error;

/// Result type alias using ask-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a chat session
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer
    #[error(transparent)]
    Ai(#[from] ask_ai::Error),

    /// Empty or whitespace-only input; no turn is started
    #[error("Message is empty")]
    EmptyInput,

    /// `add_message` was called before any conversation was opened
    #[error("No conversation is open")]
    NoConversation,
}

impl Error {
    /// Check if the failure is fixed by editing credentials
    pub fn needs_settings(&self) -> bool {
        matches!(self, Error::Ai(ask_ai::Error::MissingCredential { .. }))
    }
}
