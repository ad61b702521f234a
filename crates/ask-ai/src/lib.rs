//! ask-ai: provider request shaping and response parsing
//!
//! Each provider variant turns a [`RequestPayload`] into an HTTP request and
//! parses full responses and stream lines back into [`CompletedResponse`] and
//! [`StreamDelta`] values. Moving bytes is left to an [`http::HttpTransport`].

pub mod error;
pub mod http;
pub mod models;
pub mod providers;
pub mod sse;
pub mod types;

pub use error::{Error, Result};
pub use models::{Capabilities, CapabilityRule, CapabilityTable, ProviderKind, Vendor};
pub use providers::{ChatProvider, ProviderSettings, RequestDefaults, build_provider};
pub use types::*;
