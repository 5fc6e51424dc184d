//! Mesh-routed and speculative generation backends.
//!
//! Both implement the same [`Backend`] capability trait as the local and
//! cloud generators, so the orchestrator stays agnostic to where tokens
//! come from.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use elio_agent::{AgentError, Backend, GenerationSettings, Message, Role, TokenSink};
use tracing::{debug, warn};

use crate::error::MeshError;
use crate::protocol::{ChatTurn, InferencePayload, InferenceSettings};
use crate::server::{MeshNode, NullSink};
use crate::speculative::draft_tokenize;

fn messages_to_payload(
    messages: &[Message],
    system_prompt: &str,
    settings: &GenerationSettings,
) -> InferencePayload {
    let turns = messages
        .iter()
        .map(|m| ChatTurn {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            }
            .to_string(),
            content: m.content.clone(),
        })
        .collect();
    InferencePayload {
        messages: turns,
        system_prompt: if system_prompt.is_empty() {
            None
        } else {
            Some(system_prompt.to_string())
        },
        settings: InferenceSettings {
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
        },
    }
}

/// Loop and hop-cap failures arrive as response errors; local routing
/// failures map here.
fn map_mesh_error(err: MeshError) -> AgentError {
    match err {
        MeshError::Timeout => AgentError::Network("mesh request timed out".to_string()),
        MeshError::NoPeers => AgentError::Server {
            code: 503,
            detail: "no eligible peers".to_string(),
        },
        other => AgentError::Network(other.to_string()),
    }
}

/// Generator that routes requests through the mesh.
pub struct MeshBackend {
    node: Arc<MeshNode>,
    generating: AtomicBool,
}

impl MeshBackend {
    pub fn new(node: Arc<MeshNode>) -> Self {
        Self {
            node,
            generating: AtomicBool::new(false),
        }
    }

    async fn generate_inner(
        &self,
        messages: &[Message],
        system_prompt: &str,
        settings: &GenerationSettings,
        sink: &dyn TokenSink,
    ) -> Result<String, AgentError> {
        let payload = messages_to_payload(messages, system_prompt, settings);
        let response = self
            .node
            .request_inference(payload)
            .await
            .map_err(map_mesh_error)?;
        if let Some(error) = response.error {
            return Err(AgentError::Server {
                code: 502,
                detail: error,
            });
        }
        let text = response.response.unwrap_or_default();
        debug!(
            hops = response.hop_count,
            by = response.processing_device_name.as_deref().unwrap_or("?"),
            "mesh inference complete"
        );
        // Mesh responses arrive whole; the sink sees one delivery.
        sink.on_token(&text);
        Ok(text)
    }
}

#[async_trait]
impl Backend for MeshBackend {
    fn backend_id(&self) -> &str {
        "mesh"
    }

    fn display_name(&self) -> &str {
        "Mesh peers"
    }

    fn token_cost(&self) -> u32 {
        2
    }

    fn is_ready(&self) -> bool {
        !self.node.directory().is_empty()
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
        self.generating.store(true, Ordering::SeqCst);
        let result = self
            .generate_inner(messages, system_prompt, settings, sink)
            .await;
        self.generating.store(false, Ordering::SeqCst);
        result
    }

    /// In-flight mesh requests complete or time out on their own; stop is
    /// observed at the next orchestrator checkpoint.
    fn stop(&self) {}
}

/// Draft-and-verify generator: a fast local model proposes, a peer's
/// target model verifies, and on rejection the peer regenerates the full
/// response (target-model fallback).
pub struct SpeculativeBackend {
    draft: Arc<dyn Backend>,
    node: Arc<MeshNode>,
    generating: AtomicBool,
}

impl SpeculativeBackend {
    pub fn new(draft: Arc<dyn Backend>, node: Arc<MeshNode>) -> Self {
        Self {
            draft,
            node,
            generating: AtomicBool::new(false),
        }
    }

    async fn generate_inner(
        &self,
        messages: &[Message],
        system_prompt: &str,
        settings: &GenerationSettings,
        sink: &dyn TokenSink,
    ) -> Result<String, AgentError> {
        // Draft silently; only verified text reaches the caller's sink.
        let draft_text = self
            .draft
            .generate(messages, system_prompt, settings, &NullSink)
            .await?;
        let payload = messages_to_payload(messages, system_prompt, settings);

        match self
            .node
            .request_verification(payload.clone(), draft_tokenize(&draft_text))
            .await
        {
            Ok(verdict) if verdict.rejected_index.is_none() => {
                debug!(tokens = verdict.accepted_tokens.len(), "draft fully accepted");
                sink.on_token(&draft_text);
                Ok(draft_text)
            }
            Ok(verdict) => {
                debug!(
                    rejected_at = ?verdict.rejected_index,
                    "draft rejected; requesting target generation"
                );
                let response = self
                    .node
                    .request_inference(payload)
                    .await
                    .map_err(map_mesh_error)?;
                if let Some(error) = response.error {
                    return Err(AgentError::Server {
                        code: 502,
                        detail: error,
                    });
                }
                let text = response.response.unwrap_or_default();
                sink.on_token(&text);
                Ok(text)
            }
            Err(err) => {
                // Verification unavailable: the draft is the best we have.
                warn!(error = %err, "verification unavailable; keeping local draft");
                sink.on_token(&draft_text);
                Ok(draft_text)
            }
        }
    }
}

#[async_trait]
impl Backend for SpeculativeBackend {
    fn backend_id(&self) -> &str {
        "speculative"
    }

    fn display_name(&self) -> &str {
        "Speculative (draft + verify)"
    }

    fn token_cost(&self) -> u32 {
        1
    }

    fn is_ready(&self) -> bool {
        self.draft.is_ready()
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
        self.generating.store(true, Ordering::SeqCst);
        let result = self
            .generate_inner(messages, system_prompt, settings, sink)
            .await;
        self.generating.store(false, Ordering::SeqCst);
        result
    }

    fn stop(&self) {
        self.draft.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_roles_and_settings() {
        let messages = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let settings = GenerationSettings {
            max_tokens: Some(128),
            temperature: Some(0.2),
        };
        let payload = messages_to_payload(&messages, "prompt", &settings);
        let roles: Vec<&str> = payload.messages.iter().map(|t| t.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant"]);
        assert_eq!(payload.system_prompt.as_deref(), Some("prompt"));
        assert_eq!(payload.settings.max_tokens, Some(128));
    }

    #[test]
    fn empty_system_prompt_is_omitted() {
        let payload = messages_to_payload(&[], "", &GenerationSettings::default());
        assert_eq!(payload.system_prompt, None);
    }

    #[test]
    fn routing_failures_map_to_the_agent_taxonomy() {
        assert!(matches!(
            map_mesh_error(MeshError::Timeout),
            AgentError::Network(_)
        ));
        assert!(matches!(
            map_mesh_error(MeshError::NoPeers),
            AgentError::Server { code: 503, .. }
        ));
    }
}
