//! Wire messages and framing.
//!
//! Every message is one JSON envelope `{"type": <name>, "payload": {...}}`
//! terminated by a single `\n`.  Field names are lower snake case.  Frames
//! beyond [`MAX_FRAME_BYTES`] are rejected and the connection dropped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::capability::Capability;
use crate::error::MeshError;

/// Bounded-size policy for a single frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One chat turn inside an inference payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// The inference work item carried across the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferencePayload {
    pub messages: Vec<ChatTurn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub settings: InferenceSettings,
}

/// Single-hop inference ask from a directly connected peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub request_id: Uuid,
    pub payload: InferencePayload,
}

/// Multi-hop forwarded inference request.
///
/// Every forwarder appends its own device id to `visited_nodes` before
/// relaying, so `visited_nodes` always starts with the origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshForwardRequest {
    pub request_id: Uuid,
    pub payload: InferencePayload,
    pub visited_nodes: Vec<String>,
    pub max_hops: usize,
    pub origin_timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshForwardResponse {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub route_path: Vec<String>,
    pub hop_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_device_name: Option<String>,
}

/// Identity and capability advertisement, exchanged on connect before any
/// other traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDiscovery {
    pub device_id: String,
    pub display_name: String,
    pub capability: Capability,
    #[serde(default)]
    pub connected_peers: Vec<PeerSummary>,
    pub protocol_version: u32,
}

/// One reachable peer as advertised by a neighbour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub device_id: String,
    pub display_name: String,
    pub capability: Capability,
    pub hop_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub device_id: String,
    pub connected_peers: Vec<PeerSummary>,
}

/// HTTP request tunnelled through a peer with internet access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub id: Uuid,
    pub url: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayResponse {
    pub id: Uuid,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Draft-token verification ask for speculative decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecVerifyRequest {
    pub request_id: Uuid,
    pub payload: InferencePayload,
    pub draft_tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecVerifyResponse {
    pub request_id: Uuid,
    pub accepted_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_token: Option<String>,
}

/// User-to-user message.  `signature` is an opaque hook; the signing scheme
/// is a collaborator concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: Uuid,
    pub from_id: String,
    pub to_id: String,
    pub content: String,
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub from_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendAcceptance {
    pub from_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// The envelope: serde's adjacent tagging renders exactly
/// `{"type": "<variant>", "payload": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MeshMessage {
    InferenceRequest(InferenceRequest),
    RelayRequest(RelayRequest),
    RelayResponse(RelayResponse),
    MeshForwardRequest(MeshForwardRequest),
    MeshForwardResponse(MeshForwardResponse),
    PeerDiscovery(PeerDiscovery),
    TopologyUpdate(TopologyUpdate),
    SpecVerifyRequest(SpecVerifyRequest),
    SpecVerifyResponse(SpecVerifyResponse),
    DirectMessage(DirectMessage),
    FriendRequest(FriendRequest),
    FriendAcceptance(FriendAcceptance),
}

/// Writes one newline-terminated envelope.
pub async fn write_message<W>(writer: &mut W, msg: &MeshMessage) -> Result<(), MeshError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(msg)?;
    if line.len() > MAX_FRAME_BYTES {
        return Err(MeshError::FrameTooLarge(line.len()));
    }
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one envelope.  Returns `None` on a clean EOF at a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<MeshMessage>, MeshError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    // Read at most one byte past the cap so oversized frames are detected
    // without buffering them whole.
    let limit = (MAX_FRAME_BYTES + 2) as u64;
    let mut limited = reader.take(limit);
    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() as u64 >= limit {
            return Err(MeshError::FrameTooLarge(buf.len()));
        }
        return Err(MeshError::Violation("connection closed mid-frame".into()));
    }
    buf.pop();
    if buf.len() > MAX_FRAME_BYTES {
        return Err(MeshError::FrameTooLarge(buf.len()));
    }
    Ok(Some(serde_json::from_slice(&buf)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_matches_the_wire_contract() {
        let msg = MeshMessage::FriendRequest(FriendRequest {
            from_id: "dev-1".to_string(),
            display_name: "Phone".to_string(),
            signature: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "FriendRequest");
        assert_eq!(value["payload"]["from_id"], "dev-1");
        assert_eq!(value["payload"]["display_name"], "Phone");
    }

    #[test]
    fn forward_request_roundtrips() {
        let msg = MeshMessage::MeshForwardRequest(MeshForwardRequest {
            request_id: Uuid::new_v4(),
            payload: InferencePayload {
                messages: vec![ChatTurn {
                    role: "user".to_string(),
                    content: "hello".to_string(),
                }],
                system_prompt: None,
                settings: InferenceSettings::default(),
            },
            visited_nodes: vec!["origin".to_string()],
            max_hops: 5,
            origin_timestamp_ms: 12345,
        });
        let text = serde_json::to_string(&msg).unwrap();
        let back: MeshMessage = serde_json::from_str(&text).unwrap();
        let MeshMessage::MeshForwardRequest(req) = back else {
            panic!("wrong variant");
        };
        assert_eq!(req.visited_nodes, ["origin"]);
        assert_eq!(req.max_hops, 5);
    }

    #[tokio::test]
    async fn framing_roundtrip_over_a_duplex_pipe() {
        let (mut client, server) = tokio::io::duplex(4096);

        let msg = MeshMessage::TopologyUpdate(TopologyUpdate {
            device_id: "dev-2".to_string(),
            connected_peers: vec![],
        });
        write_message(&mut client, &msg).await.unwrap();
        drop(client);

        let mut reader = tokio::io::BufReader::new(server);
        let first = read_message(&mut reader).await.unwrap();
        assert!(matches!(first, Some(MeshMessage::TopologyUpdate(_))));
        let second = read_message(&mut reader).await.unwrap();
        assert!(second.is_none(), "clean EOF after the single frame");
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let big = vec![b'x'; MAX_FRAME_BYTES + 16];
            let _ = client.write_all(&big).await;
        });

        let mut reader = tokio::io::BufReader::new(server);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, MeshError::FrameTooLarge(_)));
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let raw = br#"{"type":"Bogus","payload":{}}"#;
        let parsed: Result<MeshMessage, _> = serde_json::from_slice(raw);
        assert!(parsed.is_err());
    }
}
