//! Transport strategy: how a turn reaches the provider.
//!
//! Each turn walks a small state machine. Providers that answer in one piece
//! are tried first; when that fails for a model that allows it, the same
//! payload is retried as a stream. A rate-limited attempt waits a fixed delay
//! and re-enters the machine once.

use std::time::Duration;

use ask_ai::{ChatProvider, Error, RequestPayload, Result, Role};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    aggregator::{self, LineOutcome, StreamAggregator, TokenEstimation},
    conversation::{Conversation, MessageId},
    events::{ChatEvent, Notification, NotificationAction, TransportMode, TurnPhase},
};

/// Content shown while a streamed answer has not produced text yet
pub const LOADING_PLACEHOLDER: &str = "Loading response...";

/// Rate-limit re-issues allowed per turn
const MAX_RATE_LIMIT_RETRIES: u32 = 1;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before re-issuing a rate-limited request
    #[serde(with = "secs")]
    pub rate_limit_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Drives one turn from request to completed (or failed) assistant message
#[derive(Debug, Clone, Default)]
pub struct TransportStrategy {
    retry: RetryConfig,
    estimation: TokenEstimation,
}

impl TransportStrategy {
    /// Create a strategy
    pub fn new(retry: RetryConfig, estimation: TokenEstimation) -> Self {
        Self { retry, estimation }
    }

    /// Run a turn into the in-progress message `id`.
    ///
    /// On failure the message is converted to an error message and a failure
    /// notification is sent before the error is returned.
    pub async fn run_turn(
        &self,
        provider: &dyn ChatProvider,
        payload: &RequestPayload,
        conversation: &mut Conversation,
        id: MessageId,
        events: &broadcast::Sender<ChatEvent>,
    ) -> Result<()> {
        let result = match provider.check_credentials() {
            Ok(()) => self.run_with_backoff(provider, payload, conversation, id, events).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                conversation.finalize(id);
                send_phase(events, TurnPhase::Succeeded);
                let _ = events.send(ChatEvent::Notification(Notification::success(
                    "Response received",
                    Some(provider.model().to_string()),
                )));
                Ok(())
            }
            Err(e) => {
                tracing::error!("{} request failed: {}", provider.kind().name(), e);
                conversation.fail(id, e.to_string());
                send_phase(events, TurnPhase::Terminal);

                let mut notification = Notification::failure(failure_title(&e), Some(e.to_string()));
                if matches!(e, Error::MissingCredential { .. }) {
                    notification = notification.with_action(NotificationAction::OpenSettings);
                }
                let _ = events.send(ChatEvent::Notification(notification));
                Err(e)
            }
        }
    }

    async fn run_with_backoff(
        &self,
        provider: &dyn ChatProvider,
        payload: &RequestPayload,
        conversation: &mut Conversation,
        id: MessageId,
        events: &broadcast::Sender<ChatEvent>,
    ) -> Result<()> {
        let mut retries = 0u32;
        loop {
            match self.attempt(provider, payload, conversation, id, events).await {
                Err(e) if e.is_rate_limited() && retries < MAX_RATE_LIMIT_RETRIES => {
                    retries += 1;
                    let delay = self.retry.rate_limit_delay;
                    tracing::warn!("Rate limited: {}. Retrying in {:?}...", e, delay);

                    send_phase(events, TurnPhase::BackingOff);
                    let _ = events.send(ChatEvent::Notification(Notification::animated(
                        "Rate limited",
                        Some(format!("Retrying in {}s", delay.as_secs_f64())),
                    )));
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn attempt(
        &self,
        provider: &dyn ChatProvider,
        payload: &RequestPayload,
        conversation: &mut Conversation,
        id: MessageId,
        events: &broadcast::Sender<ChatEvent>,
    ) -> Result<()> {
        if !provider.kind().stream_only() {
            // A re-issued request starts from a clean message
            conversation.reset_in_progress(id, "");
            send_requesting(events, provider, TransportMode::NonStreaming);
            let error = match provider.complete(payload).await {
                Ok(response) => {
                    aggregator::apply_full_response(conversation, id, response, self.estimation);
                    send_update(events, conversation, id);
                    return Ok(());
                }
                Err(e) => e,
            };

            let eligible = provider.capabilities().streaming_fallback
                && provider.supports_streaming()
                && error.is_fallback_eligible()
                && !error.is_rate_limited();
            if !eligible {
                return Err(error);
            }
            tracing::warn!(
                "Non-streaming request to {} failed ({}), falling back to streaming",
                provider.model(),
                error
            );
        }

        conversation.reset_in_progress(id, LOADING_PLACEHOLDER);
        send_update(events, conversation, id);
        send_requesting(events, provider, TransportMode::Streaming);
        self.stream_into(provider, payload, conversation, id, events).await
    }

    async fn stream_into(
        &self,
        provider: &dyn ChatProvider,
        payload: &RequestPayload,
        conversation: &mut Conversation,
        id: MessageId,
        events: &broadcast::Sender<ChatEvent>,
    ) -> Result<()> {
        let mut lines = provider.stream(payload).await?;
        let mut aggregator = StreamAggregator::new(id);

        while let Some(line) = lines.next().await {
            match aggregator.feed_line(provider, conversation, &line?)? {
                LineOutcome::Updated => send_update(events, conversation, id),
                LineOutcome::Done => break,
                LineOutcome::Ignored | LineOutcome::Skipped => {}
            }
        }

        let tokens = aggregator.finish(conversation);
        tracing::debug!("Stream from {} complete, {} tokens", provider.model(), tokens);
        send_update(events, conversation, id);
        Ok(())
    }
}

fn failure_title(error: &Error) -> &'static str {
    match error {
        Error::MissingCredential { .. } => "No API key configured",
        Error::UnsupportedProvider(_) => "Unsupported provider",
        e if e.is_rate_limited() => "Rate limit exceeded",
        _ => "Request failed",
    }
}

fn send_phase(events: &broadcast::Sender<ChatEvent>, phase: TurnPhase) {
    tracing::debug!("Turn phase: {:?}", phase);
    let _ = events.send(ChatEvent::Phase { phase });
}

fn send_requesting(
    events: &broadcast::Sender<ChatEvent>,
    provider: &dyn ChatProvider,
    mode: TransportMode,
) {
    send_phase(events, TurnPhase::Requesting(mode));
    let title = match mode {
        TransportMode::NonStreaming => format!("Asking {}", provider.kind().name()),
        TransportMode::Streaming => format!("Streaming from {}", provider.kind().name()),
    };
    let _ = events.send(ChatEvent::Notification(Notification::animated(
        title,
        Some(provider.model().to_string()),
    )));
}

fn send_update(events: &broadcast::Sender<ChatEvent>, conversation: &Conversation, id: MessageId) {
    if let Some(message) = conversation.get(id).filter(|m| m.role == Role::Assistant) {
        let _ = events.send(ChatEvent::MessageUpdate {
            id,
            content: message.content.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::NotificationStyle,
        testing::{Reply, ScriptedTransport, provider},
    };
    use ask_ai::{PayloadMessage, ProviderKind, Vendor};
    use serde_json::json;

    fn strategy() -> TransportStrategy {
        TransportStrategy::new(
            RetryConfig {
                rate_limit_delay: Duration::from_millis(1),
            },
            TokenEstimation::Off,
        )
    }

    fn payload() -> RequestPayload {
        RequestPayload::new(vec![PayloadMessage::user("Hello")])
    }

    fn drain(rx: &mut broadcast::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn phases(events: &[ChatEvent]) -> Vec<TurnPhase> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Phase { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    async fn run(
        kind: ProviderKind,
        model: &str,
        replies: Vec<Reply>,
    ) -> (Result<()>, Conversation, MessageId, Vec<ChatEvent>, usize) {
        let http = ScriptedTransport::new(replies);
        let provider = provider(kind, model, http.clone());
        let (tx, mut rx) = broadcast::channel(256);
        let mut conversation = Conversation::new();
        conversation.push_user("Hello");
        let id = conversation.begin_assistant("");

        let result = strategy()
            .run_turn(provider.as_ref(), &payload(), &mut conversation, id, &tx)
            .await;
        (result, conversation, id, drain(&mut rx), http.request_count())
    }

    #[tokio::test]
    async fn test_non_streaming_success() {
        let (result, conversation, id, events, requests) = run(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![Reply::Json(
                200,
                json!({"candidates": [{"content": {"parts": [{"text": "Hi there"}]}}],
                       "usageMetadata": {"totalTokenCount": 5}}),
            )],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(requests, 1);
        assert_eq!(conversation.get(id).unwrap().content, "Hi there");
        assert_eq!(conversation.token_tally(), 5);
        assert_eq!(conversation.in_progress(), None);
        assert_eq!(
            phases(&events),
            vec![
                TurnPhase::Requesting(TransportMode::NonStreaming),
                TurnPhase::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_server_error_falls_back_to_streaming() {
        let (result, conversation, id, events, requests) = run(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![
                Reply::Json(500, json!({"error": {"code": 500, "message": "Internal"}})),
                Reply::stream_lines(&[
                    r#"data: {"candidates":[{"content":{"parts":[{"text":"Streamed "}]}}]}"#,
                    r#"data: {"candidates":[{"content":{"parts":[{"text":"answer"}]}}]}"#,
                ]),
            ],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(requests, 2);
        assert_eq!(conversation.get(id).unwrap().content, "Streamed answer");
        assert_eq!(
            phases(&events),
            vec![
                TurnPhase::Requesting(TransportMode::NonStreaming),
                TurnPhase::Requesting(TransportMode::Streaming),
                TurnPhase::Succeeded
            ]
        );

        let updates: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::MessageUpdate { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(updates.first(), Some(&LOADING_PLACEHOLDER));
        assert_eq!(updates.last(), Some(&"Streamed answer"));
    }

    #[tokio::test]
    async fn test_ineligible_model_does_not_fall_back() {
        let (result, conversation, id, events, requests) = run(
            ProviderKind::Portkey,
            "gpt-4o",
            vec![Reply::Json(500, json!({"error": {"message": "upstream down"}}))],
        )
        .await;

        assert!(result.is_err());
        assert_eq!(requests, 1);
        let message = conversation.get(id).unwrap();
        assert_eq!(message.role, Role::Error);
        assert_eq!(message.content, "API error (500): upstream down");
        assert_eq!(phases(&events).last(), Some(&TurnPhase::Terminal));
    }

    #[tokio::test]
    async fn test_streaming_failure_is_terminal() {
        let (result, conversation, id, _, requests) = run(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![
                Reply::Json(200, json!({"candidates": []})),
                Reply::Json(503, json!({"error": {"code": 503, "message": "Unavailable"}})),
            ],
        )
        .await;

        assert!(result.is_err());
        assert_eq!(requests, 2);
        assert_eq!(conversation.get(id).unwrap().role, Role::Error);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_once() {
        let (result, conversation, id, events, requests) = run(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![
                Reply::Json(429, json!({"error": {"code": 429, "message": "Resource has been exhausted"}})),
                Reply::Json(200, json!({"candidates": [{"content": {"parts": [{"text": "ok"}]}}]})),
            ],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(requests, 2);
        assert_eq!(conversation.get(id).unwrap().content, "ok");
        assert!(phases(&events).contains(&TurnPhase::BackingOff));
    }

    #[tokio::test]
    async fn test_rate_limited_stream_leaves_no_stale_trace() {
        let (result, conversation, id, _, requests) = run(
            ProviderKind::GeminiSdk,
            "gemini-2.5-flash",
            vec![
                Reply::Json(500, json!({"error": {"code": 500, "message": "Internal"}})),
                Reply::stream_lines(&[
                    r#"data: {"candidates":[{"content":{"parts":[{"text":"stale reasoning","thought":true}]}}]}"#,
                    r#"data: {"candidates":[{"content":{"parts":[{"text":"half an"}]}}]}"#,
                    r#"data: {"error":{"code":429,"message":"Resource has been exhausted"}}"#,
                ]),
                Reply::Json(200, json!({"candidates": [{"content": {"parts": [{"text": "ok"}]}}]})),
            ],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(requests, 3);
        assert_eq!(conversation.get(id).unwrap().content, "ok");
        assert_eq!(conversation.thinking_trace(id.index()), None);
    }

    #[tokio::test]
    async fn test_second_rate_limit_is_terminal() {
        let limited = || Reply::Json(429, json!({"error": {"code": 429, "message": "Too many requests"}}));
        let (result, conversation, id, events, requests) = run(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![limited(), limited(), limited()],
        )
        .await;

        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(requests, 2);
        assert_eq!(conversation.get(id).unwrap().role, Role::Error);
        let failure = events.iter().rev().find_map(|e| match e {
            ChatEvent::Notification(n) if n.style == NotificationStyle::Failure => Some(n.clone()),
            _ => None,
        });
        assert_eq!(failure.unwrap().title, "Rate limit exceeded");
    }

    #[tokio::test]
    async fn test_missing_credential_makes_no_request() {
        let http = ScriptedTransport::new(vec![]);
        let settings = ask_ai::ProviderSettings::new(ProviderKind::GeminiRest, "gemini-2.0-flash");
        let provider = ask_ai::build_provider(&settings, http.clone()).unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        let mut conversation = Conversation::new();
        let id = conversation.begin_assistant("");

        let result = strategy()
            .run_turn(provider.as_ref(), &payload(), &mut conversation, id, &tx)
            .await;

        assert!(matches!(result, Err(Error::MissingCredential { .. })));
        assert_eq!(http.request_count(), 0);
        assert_eq!(conversation.get(id).unwrap().role, Role::Error);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::Notification(n) if n.action == Some(NotificationAction::OpenSettings)
        )));
    }

    #[tokio::test]
    async fn test_stream_only_provider_starts_streaming() {
        let (result, conversation, id, events, requests) = run(
            ProviderKind::MultiProvider(Vendor::OpenAI),
            "gpt-4o",
            vec![Reply::stream_lines(&[
                r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
                r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#,
                "data: [DONE]",
            ])],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(requests, 1);
        assert_eq!(conversation.get(id).unwrap().content, "Hi");
        assert_eq!(conversation.token_tally(), 4);
        assert_eq!(
            phases(&events),
            vec![TurnPhase::Requesting(TransportMode::Streaming), TurnPhase::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_in_stream_error_fails_turn() {
        let (result, conversation, id, _, _) = run(
            ProviderKind::MultiProvider(Vendor::Anthropic),
            "claude-sonnet-4-5",
            vec![Reply::stream_lines(&[
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Par"}}"#,
                r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            ])],
        )
        .await;

        assert!(result.is_err());
        let message = conversation.get(id).unwrap();
        assert_eq!(message.role, Role::Error);
        assert!(message.content.contains("Overloaded"));
    }
}
