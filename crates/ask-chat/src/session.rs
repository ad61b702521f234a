//! Chat session: owns the conversation and drives turns

use std::sync::Arc;

use ask_ai::{ChatProvider, GenerationConfig, ModelInfo, RequestPayload, Role};
use tokio::sync::broadcast;

use crate::{
    aggregator::TokenEstimation,
    cache::ModelCache,
    conversation::Conversation,
    error::{Error, Result},
    events::{ChatEvent, TurnPhase},
    render::{RenderOptions, render},
    transport::{RetryConfig, TransportStrategy},
};

/// Session configuration
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Generation overrides; unset fields fall back to the provider defaults
    pub generation: GenerationConfig,
    /// Rate-limit backoff
    pub retry: RetryConfig,
    /// Token counting for full responses without usage
    pub token_estimation: TokenEstimation,
}

/// A conversation with one provider
pub struct ChatSession {
    config: SessionConfig,
    provider: Arc<dyn ChatProvider>,
    conversation: Option<Conversation>,
    strategy: TransportStrategy,
    event_tx: broadcast::Sender<ChatEvent>,
}

impl ChatSession {
    /// Create a session; no conversation is open until the first `submit`
    pub fn new(config: SessionConfig, provider: Arc<dyn ChatProvider>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let strategy = TransportStrategy::new(config.retry.clone(), config.token_estimation);
        Self {
            config,
            provider,
            conversation: None,
            strategy,
            event_tx,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.event_tx.subscribe()
    }

    /// The open conversation
    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn provider(&self) -> &Arc<dyn ChatProvider> {
        &self.provider
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Switch provider or model; the conversation is kept
    pub fn set_provider(&mut self, provider: Arc<dyn ChatProvider>) {
        tracing::debug!("Switching to {} / {}", provider.kind().name(), provider.model());
        self.provider = provider;
    }

    /// Start a turn, opening a conversation first if none is open
    pub async fn submit(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::EmptyInput);
        }
        self.conversation.get_or_insert_with(Conversation::new);
        self.run_turn(text).await
    }

    /// Continue the open conversation
    pub async fn add_message(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::EmptyInput);
        }
        if self.conversation.is_none() {
            return Err(Error::NoConversation);
        }
        self.run_turn(text).await
    }

    /// Clear messages, tally and metadata, and open a fresh conversation
    pub fn new_conversation(&mut self) {
        match self.conversation.as_mut() {
            Some(conversation) => conversation.clear(),
            None => self.conversation = Some(Conversation::new()),
        }
        let _ = self.event_tx.send(ChatEvent::ConversationCleared);
    }

    /// Render the conversation as markdown
    pub fn render(&self) -> String {
        self.conversation
            .as_ref()
            .map(|c| render(c, &RenderOptions::new(self.provider.model())))
            .unwrap_or_default()
    }

    /// Content of the latest completed answer
    pub fn last_response(&self) -> Option<String> {
        self.conversation
            .as_ref()
            .and_then(|c| c.last_response())
            .map(str::to_string)
    }

    /// Models the current provider offers, through the shared cache
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        ModelCache::global().models_for(self.provider.as_ref()).await
    }

    async fn run_turn(&mut self, text: &str) -> Result<()> {
        let Some(conversation) = self.conversation.as_mut() else {
            return Err(Error::NoConversation);
        };

        let user = conversation.push_user(text.trim());
        let defaults = self.provider.defaults();
        let payload = RequestPayload::new(conversation.history())
            .with_system(self.config.system_prompt.as_deref())
            .with_generation(self.config.generation.clone().or(&defaults.generation))
            .with_tools(defaults.tools);
        let assistant = conversation.begin_assistant("");
        let _ = self.event_tx.send(ChatEvent::TurnStart { user, assistant });

        let result = self
            .strategy
            .run_turn(
                self.provider.as_ref(),
                &payload,
                conversation,
                assistant,
                &self.event_tx,
            )
            .await;

        let role = conversation
            .get(assistant)
            .map(|m| m.role)
            .unwrap_or(Role::Error);
        let _ = self.event_tx.send(ChatEvent::TurnEnd {
            id: assistant,
            role,
            token_tally: conversation.token_tally(),
        });
        let _ = self.event_tx.send(ChatEvent::Phase {
            phase: TurnPhase::Idle,
        });

        result.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{NotificationAction, TransportMode},
        testing::{Reply, ScriptedTransport, provider},
        transport::LOADING_PLACEHOLDER,
    };
    use ask_ai::{ProviderKind, ProviderSettings, Vendor};
    use serde_json::json;
    use std::time::Duration;

    fn session(kind: ProviderKind, model: &str, replies: Vec<Reply>) -> (ChatSession, Arc<ScriptedTransport>) {
        let http = ScriptedTransport::new(replies);
        let config = SessionConfig {
            system_prompt: Some("Be helpful.".into()),
            retry: RetryConfig {
                rate_limit_delay: Duration::from_millis(1),
            },
            ..Default::default()
        };
        (ChatSession::new(config, provider(kind, model, http.clone())), http)
    }

    fn gemini_reply(text: &str, total: u32) -> Reply {
        Reply::Json(
            200,
            json!({"candidates": [{"content": {"parts": [{"text": text}]}}],
                   "usageMetadata": {"totalTokenCount": total}}),
        )
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let (mut session, _) = session(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![gemini_reply("Hi there", 5)],
        );
        session.submit("Hello").await.unwrap();

        let conversation = session.conversation().unwrap();
        assert_eq!(conversation.messages().len(), 2);
        assert_eq!(conversation.token_tally(), 5);
        assert_eq!(
            session.render(),
            "### User\n\nHello\n\n---\n\n### gemini-2.0-flash (Token Tally: 5)\n\nHi there\n\n---"
        );
        assert_eq!(session.last_response().as_deref(), Some("Hi there"));
    }

    #[tokio::test]
    async fn test_empty_input_starts_no_turn() {
        let (mut session, http) = session(ProviderKind::GeminiRest, "gemini-2.0-flash", vec![]);
        assert!(matches!(session.submit("   ").await, Err(Error::EmptyInput)));
        assert!(session.conversation().is_none());
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test]
    async fn test_add_message_requires_conversation() {
        let (mut session, _) = session(ProviderKind::GeminiRest, "gemini-2.0-flash", vec![]);
        assert!(matches!(
            session.add_message("Hello").await,
            Err(Error::NoConversation)
        ));
    }

    #[tokio::test]
    async fn test_follow_up_sends_history() {
        let (mut session, http) = session(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![gemini_reply("Hi there", 5), gemini_reply("Fine", 7)],
        );
        session.submit("Hello").await.unwrap();
        session.add_message("How are you?").await.unwrap();

        let requests = http.requests.lock();
        let contents = requests[1].body["contents"].as_array().unwrap().clone();
        let texts: Vec<&str> = contents
            .iter()
            .map(|c| c["parts"][0]["text"].as_str().unwrap())
            .collect();
        assert_eq!(
            texts,
            vec![
                "Be helpful.",
                "I'll follow those instructions.",
                "Hello",
                "Hi there",
                "How are you?"
            ]
        );
        assert_eq!(session.conversation().unwrap().token_tally(), 12);
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_conversation_usable() {
        let (mut session, http) = session(
            ProviderKind::Portkey,
            "gpt-4o",
            vec![
                Reply::Json(401, json!({"error": {"message": "Invalid API key"}})),
                Reply::Json(200, json!({"choices": [{"message": {"content": "Recovered"}}]})),
            ],
        );
        assert!(session.submit("Hello").await.is_err());
        session.add_message("Again").await.unwrap();

        let rendered = session.render();
        assert!(rendered.contains("### ⚠️ Error\n\nAPI error (401): Invalid API key"));
        assert!(rendered.ends_with("Recovered\n\n---"));

        // The failed exchange's error message is not replayed to the provider
        let requests = http.requests.lock();
        let roles: Vec<&str> = requests[1].body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "user"]);
    }

    #[tokio::test]
    async fn test_fallback_events_reach_observers() {
        let (mut session, _) = session(
            ProviderKind::GeminiSdk,
            "gemini-2.5-flash",
            vec![
                Reply::Json(500, json!({"error": {"code": 500, "message": "Internal"}})),
                Reply::Stream(vec![
                    b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel".to_vec(),
                    b"lo\"}]}}]}\n\ndata: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" \xF0\x9F".to_vec(),
                    b"\x8E\x89\"}]}}]}\n".to_vec(),
                ]),
            ],
        );
        let mut rx = session.subscribe();
        session.submit("Hi").await.unwrap();

        let mut saw_placeholder = false;
        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ChatEvent::MessageUpdate { content, .. } if content == LOADING_PLACEHOLDER => {
                    saw_placeholder = true
                }
                ChatEvent::Phase { phase } => phases.push(phase),
                _ => {}
            }
        }
        assert!(saw_placeholder);
        assert!(phases.contains(&TurnPhase::Requesting(TransportMode::Streaming)));
        assert_eq!(phases.last(), Some(&TurnPhase::Idle));
        assert_eq!(session.last_response().as_deref(), Some("Hello 🎉"));
    }

    #[tokio::test]
    async fn test_streamed_fragments_without_usage_are_estimated() {
        let (mut session, _) = session(
            ProviderKind::MultiProvider(Vendor::OpenAI),
            "gpt-4o",
            vec![Reply::stream_lines(&[
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                "",
                r#"data: {"choices":[{"delta":{"content":"lo "}}]}"#,
                "data: {not json",
                r#"data: {"choices":[{"delta":{"content":"world"}}]}"#,
                "data: [DONE]",
            ])],
        );
        session.submit("Greet me").await.unwrap();

        assert_eq!(session.last_response().as_deref(), Some("Hello world"));
        assert_eq!(session.conversation().unwrap().token_tally(), 3);
    }

    #[tokio::test]
    async fn test_missing_key_offers_settings() {
        let http = ScriptedTransport::new(vec![]);
        let settings = ProviderSettings::new(ProviderKind::Portkey, "gpt-4o");
        let provider = ask_ai::build_provider(&settings, http.clone()).unwrap();
        let mut session = ChatSession::new(SessionConfig::default(), provider);
        let mut rx = session.subscribe();

        let err = session.submit("Hello").await.unwrap_err();
        assert!(err.needs_settings());
        assert_eq!(http.request_count(), 0);

        let mut offered = false;
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::Notification(n) = event {
                offered |= n.action == Some(NotificationAction::OpenSettings);
            }
        }
        assert!(offered);
        assert!(session.render().contains("No API key configured for Portkey"));
    }

    #[tokio::test]
    async fn test_new_conversation_clears_state() {
        let (mut session, _) = session(
            ProviderKind::GeminiRest,
            "gemini-2.0-flash",
            vec![gemini_reply("Hi there", 5)],
        );
        session.submit("Hello").await.unwrap();
        session.new_conversation();

        let conversation = session.conversation().unwrap();
        assert!(conversation.is_empty());
        assert_eq!(conversation.token_tally(), 0);
        assert_eq!(session.render(), "");
        assert_eq!(session.last_response(), None);
    }

    #[tokio::test]
    async fn test_generation_overrides_merge_with_defaults() {
        let http = ScriptedTransport::new(vec![gemini_reply("ok", 1)]);
        let config = SessionConfig {
            generation: GenerationConfig {
                temperature: Some(0.2),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut session = ChatSession::new(
            config,
            provider(ProviderKind::GeminiRest, "gemini-2.0-flash", http.clone()),
        );
        session.submit("Hello").await.unwrap();

        let requests = http.requests.lock();
        let generation = &requests[0].body["generationConfig"];
        assert!((generation["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
        assert_eq!(generation["maxOutputTokens"], 32768);
    }
}
