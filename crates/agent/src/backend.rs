//! Generation backends.
//!
//! A [`Backend`] turns a message history into streamed tokens.  The
//! orchestrator is agnostic to where generation happens: the same trait is
//! implemented by the local/cloud clients here and by the mesh-routed and
//! speculative generators in the mesh crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::message::{Message, Role};

/// Receives streamed tokens during generation.
///
/// Returning `false` asks the generator to cease token production
/// cooperatively; generators must honor this within a bounded number of
/// tokens.
pub trait TokenSink: Send + Sync {
    fn on_token(&self, token: &str) -> bool;
}

/// Sampling settings forwarded to the generator.
#[derive(Debug, Clone, Default)]
pub struct GenerationSettings {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Capability record for a token generator.
#[async_trait]
pub trait Backend: Send + Sync {
    fn backend_id(&self) -> &str;
    fn display_name(&self) -> &str;
    /// Relative per-request cost in token credits; 0 for free/local.
    fn token_cost(&self) -> u32 {
        0
    }
    fn is_ready(&self) -> bool;
    fn is_generating(&self) -> bool;

    /// Generates a completion for `messages`, streaming tokens into `sink`
    /// and returning the accumulated text.
    async fn generate(
        &self,
        messages: &[Message],
        system_prompt: &str,
        settings: &GenerationSettings,
        sink: &dyn TokenSink,
    ) -> Result<String, AgentError>;

    /// Advisory, idempotent stop for an in-flight generation.
    fn stop(&self);
}

/// Chat client for a local or remote inference server speaking the
/// line-delimited streaming chat API (`/api/chat`).
pub struct CloudBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    token_cost: u32,
    generating: AtomicBool,
    stop_requested: AtomicBool,
}

impl CloudBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: String::new(),
            token_cost: 1,
            generating: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    fn chat_messages(&self, messages: &[Message], system_prompt: &str) -> Vec<serde_json::Value> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if !system_prompt.is_empty() {
            out.push(json!({ "role": "system", "content": system_prompt }));
        }
        for msg in messages {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            out.push(json!({ "role": role, "content": msg.content }));
        }
        out
    }
}

#[async_trait]
impl Backend for CloudBackend {
    fn backend_id(&self) -> &str {
        "cloud"
    }

    fn display_name(&self) -> &str {
        &self.model
    }

    fn token_cost(&self) -> u32 {
        self.token_cost
    }

    fn is_ready(&self) -> bool {
        !self.base_url.is_empty()
    }

    fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    async fn generate(
        &self,
        messages: &[Message],
        system_prompt: &str,
        settings: &GenerationSettings,
        sink: &dyn TokenSink,
    ) -> Result<String, AgentError> {
        let endpoint = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let mut payload = json!({
            "model": self.model,
            "messages": self.chat_messages(messages, system_prompt),
            "stream": true,
        });
        if let Some(max_tokens) = settings.max_tokens {
            payload["options"]["num_predict"] = json!(max_tokens);
        }
        if let Some(temperature) = settings.temperature {
            payload["options"]["temperature"] = json!(temperature);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.generating.store(true, Ordering::SeqCst);
        let result = self.stream_chat(&endpoint, payload, sink).await;
        self.generating.store(false, Ordering::SeqCst);
        result
    }

    fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }
}

impl CloudBackend {
    async fn stream_chat(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
        sink: &dyn TokenSink,
    ) -> Result<String, AgentError> {
        let mut request = self.client.post(endpoint).json(&payload);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let mut response = request
            .send()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Server {
                code: status.as_u16(),
                detail: body,
            });
        }

        // The server frames one JSON object per line; `message.content`
        // carries the token delta.
        let mut full_response = String::new();
        let mut pending = String::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?
        {
            if self.stop_requested.load(Ordering::SeqCst) {
                debug!("generation stopped by request");
                break;
            }
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                    warn!(len = line.len(), "skipping unparseable stream line");
                    continue;
                };
                if let Some(content) = value
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_str())
                    && !content.is_empty()
                {
                    full_response.push_str(content);
                    if !sink.on_token(content) {
                        debug!("token sink requested stop");
                        return Ok(full_response);
                    }
                }
            }
        }

        Ok(full_response)
    }
}
