//! ask-chat: chat sessions on top of ask-ai
//!
//! This crate keeps the conversation, folds streamed or complete responses
//! into it, and decides when a failed request falls back to streaming.

pub mod aggregator;
pub mod cache;
pub mod conversation;
pub mod error;
pub mod events;
pub mod render;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use aggregator::{StreamAggregator, TokenEstimation};
pub use cache::{MODEL_CACHE_TTL, ModelCache};
pub use conversation::{Conversation, Message, MessageId};
pub use error::{Error, Result};
pub use events::{ChatEvent, Notification, NotificationAction, NotificationStyle, TransportMode, TurnPhase};
pub use render::{RenderOptions, render};
pub use session::{ChatSession, SessionConfig};
pub use transport::{LOADING_PLACEHOLDER, RetryConfig, TransportStrategy};
