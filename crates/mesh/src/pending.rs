//! In-flight request correlation.
//!
//! Responses are matched to requests solely by request id.  The originator
//! of a request registers a local waiter; a forwarding node registers the
//! connection the request arrived on so the response can travel back.  A
//! timeout evicts the entry, and a response that arrives afterwards is
//! discarded silently.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{MeshForwardResponse, MeshMessage, RelayResponse, SpecVerifyResponse};

pub enum PendingTarget {
    /// A local task awaiting a forwarded inference response.
    LocalForward(oneshot::Sender<MeshForwardResponse>),
    /// A local task awaiting a relay response.
    LocalRelay(oneshot::Sender<RelayResponse>),
    /// A local task awaiting a speculative verification response.
    LocalVerify(oneshot::Sender<SpecVerifyResponse>),
    /// A response heading back toward the previous hop.
    Backward(mpsc::Sender<MeshMessage>),
}

#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<Uuid, PendingTarget>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, target: PendingTarget) {
        self.inner.lock().unwrap().insert(id, target);
    }

    /// Removes the entry after a timeout; a response arriving later finds
    /// nothing and is dropped.
    pub fn evict(&self, id: &Uuid) {
        self.inner.lock().unwrap().remove(id);
    }

    pub fn take(&self, id: &Uuid) -> Option<PendingTarget> {
        self.inner.lock().unwrap().remove(id)
    }

    /// Routes a forward response to whoever is waiting for it.
    pub async fn resolve_forward(&self, response: MeshForwardResponse) {
        match self.take(&response.request_id) {
            Some(PendingTarget::LocalForward(tx)) => {
                let _ = tx.send(response);
            }
            Some(PendingTarget::Backward(tx)) => {
                let _ = tx.send(MeshMessage::MeshForwardResponse(response)).await;
            }
            Some(_) | None => {
                debug!(request_id = %response.request_id, "dropping unmatched forward response");
            }
        }
    }

    pub async fn resolve_relay(&self, response: RelayResponse) {
        match self.take(&response.id) {
            Some(PendingTarget::LocalRelay(tx)) => {
                let _ = tx.send(response);
            }
            Some(PendingTarget::Backward(tx)) => {
                let _ = tx.send(MeshMessage::RelayResponse(response)).await;
            }
            Some(_) | None => {
                debug!(request_id = %response.id, "dropping unmatched relay response");
            }
        }
    }

    pub async fn resolve_verify(&self, response: SpecVerifyResponse) {
        match self.take(&response.request_id) {
            Some(PendingTarget::LocalVerify(tx)) => {
                let _ = tx.send(response);
            }
            Some(PendingTarget::Backward(tx)) => {
                let _ = tx.send(MeshMessage::SpecVerifyResponse(response)).await;
            }
            Some(_) | None => {
                debug!(request_id = %response.request_id, "dropping unmatched verify response");
            }
        }
    }
}
