//! Scripted HTTP transport for session and strategy tests

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;

use ask_ai::{
    ChatProvider, Error, ProviderKind, ProviderSettings, Result, build_provider,
    http::{ByteStream, HttpRequest, HttpResponse, HttpTransport},
};

/// One scripted reply
pub enum Reply {
    /// A complete response
    Json(u16, serde_json::Value),
    /// A streamed body, delivered in the given byte chunks
    Stream(Vec<Vec<u8>>),
}

impl Reply {
    /// A stream delivered as one chunk per line
    pub fn stream_lines(lines: &[&str]) -> Self {
        Reply::Stream(lines.iter().map(|l| format!("{}\n", l).into_bytes()).collect())
    }
}

/// Pops replies in order and records every request
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next(&self, request: HttpRequest) -> Result<Reply> {
        self.requests.lock().push(request);
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| Error::network("no scripted reply left"))
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse> {
        match self.next(request)? {
            Reply::Json(status, body) => Ok(HttpResponse {
                status,
                body: body.to_string(),
            }),
            Reply::Stream(_) => Err(Error::network("expected a JSON request, got a stream")),
        }
    }

    async fn post_stream(&self, request: HttpRequest) -> Result<ByteStream> {
        match self.next(request)? {
            Reply::Stream(chunks) => Ok(Box::pin(futures::stream::iter(
                chunks.into_iter().map(Ok),
            ))),
            Reply::Json(status, body) => {
                HttpResponse {
                    status,
                    body: body.to_string(),
                }
                .error_for_status()?;
                Err(Error::network("expected a stream request, got JSON"))
            }
        }
    }

    async fn get(&self, url: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        self.post_json(HttpRequest {
            url: url.to_string(),
            headers: headers.to_vec(),
            body: serde_json::Value::Null,
        })
        .await
    }
}

/// Build a provider of `kind` over a scripted transport
pub fn provider(kind: ProviderKind, model: &str, http: Arc<ScriptedTransport>) -> Arc<dyn ChatProvider> {
    let settings = ProviderSettings::new(kind, model)
        .with_api_key("test-key")
        .with_virtual_key("test-virtual-key");
    build_provider(&settings, http).expect("provider builds")
}

/// A Gemini REST provider with no scripted replies, for parsing-only tests
pub fn gemini_provider(model: &str) -> Arc<dyn ChatProvider> {
    provider(ProviderKind::GeminiRest, model, ScriptedTransport::new(vec![]))
}
