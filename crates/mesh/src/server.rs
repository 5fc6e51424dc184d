//! Mesh node: TCP server, connection handling and request origination.
//!
//! Every accepted or initiated connection gets a reader task and a writer
//! task joined by an mpsc queue.  Both sides exchange [`PeerDiscovery`]
//! before any other traffic.  Forwarded inference requests follow the
//! visited-set protocol: detect loops, enforce the hop cap, serve locally
//! when a model is ready, otherwise relay to the best unvisited peer.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use elio_agent::{AgentError, Backend, GenerationSettings, Message, TokenSink};
use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::Capability;
use crate::directory::PeerDirectory;
use crate::error::MeshError;
use crate::friends::FriendStore;
use crate::identity::NodeIdentity;
use crate::pending::{PendingRequests, PendingTarget};
use crate::protocol::{
    DirectMessage, FriendAcceptance, FriendRequest, InferencePayload, InferenceRequest,
    MeshForwardRequest, MeshForwardResponse, MeshMessage, PeerDiscovery, RelayRequest,
    RelayResponse, SpecVerifyRequest, SpecVerifyResponse, read_message, write_message,
};
use crate::relay::RelayHandler;
use crate::speculative;
use crate::stats::{EarningsLedger, estimate_tokens};

const BROADCAST_CAP: usize = 256;
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const CONNECTION_QUEUE: usize = 64;

/// Sink for server-side generations where tokens are not streamed anywhere.
pub(crate) struct NullSink;

impl TokenSink for NullSink {
    fn on_token(&self, _token: &str) -> bool {
        true
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected {
        device_id: String,
        display_name: String,
    },
    PeerDisconnected {
        device_id: String,
    },
    DirectMessage(DirectMessage),
    FriendRequestReceived(FriendRequest),
    FriendAccepted(FriendAcceptance),
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub display_name: String,
    pub max_hops: usize,
    pub request_timeout: Duration,
    pub peer_stale_after: Duration,
    pub protocol_version: u32,
    pub relay_allowed_hosts: Vec<String>,
    pub relay_rate_limit_per_minute: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            display_name: "Elio Node".to_string(),
            max_hops: 5,
            request_timeout: Duration::from_secs(60),
            peer_stale_after: Duration::from_secs(600),
            protocol_version: 1,
            relay_allowed_hosts: vec!["api.openai.com".to_string()],
            relay_rate_limit_per_minute: 30,
        }
    }
}

pub(crate) struct NodeState {
    identity: NodeIdentity,
    options: NodeOptions,
    capability: Mutex<Capability>,
    directory: PeerDirectory,
    pending: PendingRequests,
    friends: FriendStore,
    stats: EarningsLedger,
    backend: Option<Arc<dyn Backend>>,
    relay: RelayHandler,
    events: broadcast::Sender<NodeEvent>,
}

/// One mesh participant.
pub struct MeshNode {
    state: Arc<NodeState>,
    shutdown: watch::Sender<bool>,
}

impl MeshNode {
    /// `backend` is the local model used to serve mesh inference; `None`
    /// for relay-only nodes.
    pub fn new(
        identity: NodeIdentity,
        options: NodeOptions,
        backend: Option<Arc<dyn Backend>>,
        data_dir: impl AsRef<Path>,
    ) -> Result<Self, MeshError> {
        let data_dir = data_dir.as_ref();
        let friends = FriendStore::load_or_create(data_dir.join("friends.json"))?;
        let stats = EarningsLedger::load_or_create(data_dir.join("stats.json"))?;
        let relay = RelayHandler::new(
            options.relay_allowed_hosts.clone(),
            options.relay_rate_limit_per_minute,
        );
        let directory = PeerDirectory::new(options.peer_stale_after);
        let (events, _) = broadcast::channel(BROADCAST_CAP);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            state: Arc::new(NodeState {
                identity,
                options,
                capability: Mutex::new(Capability::default()),
                directory,
                pending: PendingRequests::new(),
                friends,
                stats,
                backend,
                relay,
                events,
            }),
            shutdown,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.state.identity.device_id
    }

    pub fn display_name(&self) -> &str {
        &self.state.options.display_name
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.state.directory
    }

    pub fn friends(&self) -> &FriendStore {
        &self.state.friends
    }

    pub fn stats(&self) -> &EarningsLedger {
        &self.state.stats
    }

    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.state.events.subscribe()
    }

    /// Updates the capability advertised on future discovery exchanges.
    pub fn set_capability(&self, capability: Capability) {
        *self.state.capability.lock().unwrap() = capability;
    }

    /// Accept loop.  Runs until [`MeshNode::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), MeshError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(
            device_id = %self.device_id(),
            addr = ?listener.local_addr().ok(),
            "mesh node listening"
        );
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(STALE_SWEEP_INTERVAL) => {
                    for device_id in self.state.directory.evict_stale() {
                        let _ = self.state.events.send(NodeEvent::PeerDisconnected { device_id });
                    }
                }
                accept = listener.accept() => {
                    let (stream, addr) = accept?;
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(err) = run_connection(state, stream, Some(addr), false).await {
                            warn!(%addr, error = %err, "peer connection failed");
                        }
                    });
                }
            }
        }
        info!("mesh node shut down");
        Ok(())
    }

    /// Initiates a connection to a discovered peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), MeshError> {
        let stream = TcpStream::connect(addr).await?;
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(err) = run_connection(state, stream, Some(addr), true).await {
                warn!(%addr, error = %err, "outbound peer connection failed");
            }
        });
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Originates a mesh inference request: pick the best peer by routing
    /// score, send with `visited = [my_id]`, and await the response keyed by
    /// request id.  A timeout evicts the pending entry so a late response is
    /// discarded silently.
    pub async fn request_inference(
        &self,
        payload: InferencePayload,
    ) -> Result<MeshForwardResponse, MeshError> {
        let state = &self.state;
        let my_id = state.identity.device_id.clone();
        let request = MeshForwardRequest {
            request_id: Uuid::new_v4(),
            payload,
            visited_nodes: vec![my_id.clone()],
            max_hops: state.options.max_hops,
            origin_timestamp_ms: Utc::now().timestamp_millis(),
        };
        let request_id = request.request_id;
        let exclude: HashSet<&str> = [my_id.as_str()].into();
        let (peer_id, sender) = state
            .directory
            .best_routing_peer(&exclude)
            .ok_or(MeshError::NoPeers)?;
        debug!(peer = %peer_id, %request_id, "originating mesh forward");

        let (tx, rx) = oneshot::channel();
        state
            .pending
            .register(request_id, PendingTarget::LocalForward(tx));
        if sender
            .send(MeshMessage::MeshForwardRequest(request))
            .await
            .is_err()
        {
            state.pending.evict(&request_id);
            return Err(MeshError::NotConnected(peer_id));
        }
        match timeout(state.options.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                state.pending.evict(&request_id);
                Err(MeshError::Timeout)
            }
        }
    }

    /// Asks the best peer to verify draft tokens against its target model.
    pub async fn request_verification(
        &self,
        payload: InferencePayload,
        draft_tokens: Vec<String>,
    ) -> Result<SpecVerifyResponse, MeshError> {
        let state = &self.state;
        let my_id = state.identity.device_id.clone();
        let exclude: HashSet<&str> = [my_id.as_str()].into();
        let (peer_id, sender) = state
            .directory
            .best_routing_peer(&exclude)
            .ok_or(MeshError::NoPeers)?;

        let request = SpecVerifyRequest {
            request_id: Uuid::new_v4(),
            payload,
            draft_tokens,
        };
        let request_id = request.request_id;
        let (tx, rx) = oneshot::channel();
        state
            .pending
            .register(request_id, PendingTarget::LocalVerify(tx));
        if sender
            .send(MeshMessage::SpecVerifyRequest(request))
            .await
            .is_err()
        {
            state.pending.evict(&request_id);
            return Err(MeshError::NotConnected(peer_id));
        }
        match timeout(state.options.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                state.pending.evict(&request_id);
                Err(MeshError::Timeout)
            }
        }
    }

    /// Tunnels an HTTP request through a connected peer.
    pub async fn request_relay(
        &self,
        url: impl Into<String>,
        method: impl Into<String>,
        headers: Option<std::collections::HashMap<String, String>>,
        body: Option<String>,
    ) -> Result<RelayResponse, MeshError> {
        let state = &self.state;
        let my_id = state.identity.device_id.clone();
        let exclude: HashSet<&str> = [my_id.as_str()].into();
        let (_, sender) = state
            .directory
            .best_routing_peer(&exclude)
            .ok_or(MeshError::NoPeers)?;

        let request = RelayRequest {
            id: Uuid::new_v4(),
            url: url.into(),
            method: method.into(),
            headers,
            body,
            client_id: my_id,
        };
        let request_id = request.id;
        let (tx, rx) = oneshot::channel();
        state
            .pending
            .register(request_id, PendingTarget::LocalRelay(tx));
        if sender
            .send(MeshMessage::RelayRequest(request))
            .await
            .is_err()
        {
            state.pending.evict(&request_id);
            return Err(MeshError::NoPeers);
        }
        match timeout(state.options.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) | Err(_) => {
                state.pending.evict(&request_id);
                Err(MeshError::Timeout)
            }
        }
    }

    /// Sends a user message to `to_id`, directly or via the route table.
    pub async fn send_direct_message(
        &self,
        to_id: &str,
        content: impl Into<String>,
    ) -> Result<(), MeshError> {
        let message = DirectMessage {
            id: Uuid::new_v4(),
            from_id: self.state.identity.device_id.clone(),
            to_id: to_id.to_string(),
            content: content.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            signature: None,
        };
        route_direct_message(&self.state, message).await
    }

    pub async fn send_friend_request(&self, to_id: &str) -> Result<(), MeshError> {
        let sender = self
            .state
            .directory
            .sender_for(to_id)
            .ok_or_else(|| MeshError::NotConnected(to_id.to_string()))?;
        let request = FriendRequest {
            from_id: self.state.identity.device_id.clone(),
            display_name: self.state.options.display_name.clone(),
            signature: None,
        };
        sender
            .send(MeshMessage::FriendRequest(request))
            .await
            .map_err(|_| MeshError::NotConnected(to_id.to_string()))
    }

    /// Accepts a pending friend request and notifies the requester.
    pub async fn accept_friend(&self, device_id: &str, display_name: &str) -> Result<(), MeshError> {
        self.state.friends.mark_accepted(device_id, display_name)?;
        if let Some(sender) = self.state.directory.sender_for(device_id) {
            let acceptance = FriendAcceptance {
                from_id: self.state.identity.device_id.clone(),
                display_name: self.state.options.display_name.clone(),
                signature: None,
            };
            let _ = sender.send(MeshMessage::FriendAcceptance(acceptance)).await;
        }
        Ok(())
    }
}

pub(crate) fn payload_to_messages(payload: &InferencePayload) -> Vec<Message> {
    payload
        .messages
        .iter()
        .map(|turn| match turn.role.as_str() {
            "system" => Message::system(turn.content.as_str()),
            "assistant" => Message::assistant(turn.content.as_str()),
            _ => Message::user(turn.content.as_str()),
        })
        .collect()
}

async fn run_local_inference(
    backend: &Arc<dyn Backend>,
    payload: &InferencePayload,
) -> Result<String, AgentError> {
    let messages = payload_to_messages(payload);
    let settings = GenerationSettings {
        max_tokens: payload.settings.max_tokens,
        temperature: payload.settings.temperature,
    };
    backend
        .generate(
            &messages,
            payload.system_prompt.as_deref().unwrap_or(""),
            &settings,
            &NullSink,
        )
        .await
}

fn local_discovery(state: &NodeState) -> PeerDiscovery {
    PeerDiscovery {
        device_id: state.identity.device_id.clone(),
        display_name: state.options.display_name.clone(),
        capability: state.capability.lock().unwrap().clone(),
        connected_peers: state.directory.summaries(),
        protocol_version: state.options.protocol_version,
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<MeshMessage>) {
    while let Some(msg) = rx.recv().await {
        if let Err(err) = write_message(&mut write_half, &msg).await {
            debug!(error = %err, "peer write failed; closing writer");
            break;
        }
    }
}

async fn run_connection(
    state: Arc<NodeState>,
    stream: TcpStream,
    addr: Option<SocketAddr>,
    initiated: bool,
) -> Result<(), MeshError> {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<MeshMessage>(CONNECTION_QUEUE);
    let writer = tokio::spawn(write_loop(write_half, rx));

    if initiated {
        let _ = tx
            .send(MeshMessage::PeerDiscovery(local_discovery(&state)))
            .await;
    }

    let mut reader = BufReader::new(read_half);
    let mut peer_id: Option<String> = None;
    let result = loop {
        match read_message(&mut reader).await {
            Ok(Some(msg)) => {
                if let Err(err) = dispatch_message(&state, msg, &tx, &mut peer_id, addr).await {
                    break Err(err);
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    if let Some(device_id) = peer_id {
        state.directory.remove(&device_id);
        let _ = state.events.send(NodeEvent::PeerDisconnected { device_id });
    }
    writer.abort();
    result
}

async fn dispatch_message(
    state: &Arc<NodeState>,
    msg: MeshMessage,
    tx: &mpsc::Sender<MeshMessage>,
    peer_id: &mut Option<String>,
    addr: Option<SocketAddr>,
) -> Result<(), MeshError> {
    let msg = match msg {
        MeshMessage::PeerDiscovery(discovery) => {
            if let Some(existing) = peer_id
                && *existing != discovery.device_id
            {
                return Err(MeshError::Violation(
                    "peer changed identity mid-connection".to_string(),
                ));
            }
            let first_contact = peer_id.is_none();
            *peer_id = Some(discovery.device_id.clone());
            state.directory.upsert_direct(
                &discovery.device_id,
                &discovery.display_name,
                discovery.capability.clone(),
                addr,
                tx.clone(),
            );
            for summary in &discovery.connected_peers {
                if summary.device_id != state.identity.device_id {
                    state.directory.upsert_reachable(summary, &discovery.device_id);
                }
            }
            if first_contact {
                // Answer with our own advertisement so both directories
                // fill, then let other neighbours know the topology grew.
                let _ = tx
                    .send(MeshMessage::PeerDiscovery(local_discovery(state)))
                    .await;
                broadcast_topology(state, &discovery.device_id).await;
                info!(peer = %discovery.device_id, name = %discovery.display_name, "peer connected");
                let _ = state.events.send(NodeEvent::PeerConnected {
                    device_id: discovery.device_id,
                    display_name: discovery.display_name,
                });
            }
            return Ok(());
        }
        other => other,
    };

    // PeerDiscovery must precede any other traffic on a connection.
    let Some(from_id) = peer_id.clone() else {
        return Err(MeshError::Violation(
            "first message on a connection must be PeerDiscovery".to_string(),
        ));
    };
    state.directory.touch(&from_id);

    match msg {
        MeshMessage::PeerDiscovery(_) => unreachable!("handled above"),
        MeshMessage::TopologyUpdate(update) => {
            for summary in &update.connected_peers {
                if summary.device_id != state.identity.device_id {
                    state.directory.upsert_reachable(summary, &from_id);
                }
            }
            Ok(())
        }
        MeshMessage::MeshForwardRequest(request) => {
            let state = state.clone();
            let reply = tx.clone();
            tokio::spawn(async move {
                handle_forward(state, request, reply).await;
            });
            Ok(())
        }
        MeshMessage::MeshForwardResponse(response) => {
            state.pending.resolve_forward(response).await;
            Ok(())
        }
        MeshMessage::InferenceRequest(request) => {
            let state = state.clone();
            let reply = tx.clone();
            tokio::spawn(async move {
                handle_direct_inference(state, request, reply).await;
            });
            Ok(())
        }
        MeshMessage::RelayRequest(request) => {
            let state = state.clone();
            let reply = tx.clone();
            tokio::spawn(async move {
                let response = state.relay.handle(request).await;
                let _ = reply.send(MeshMessage::RelayResponse(response)).await;
            });
            Ok(())
        }
        MeshMessage::RelayResponse(response) => {
            state.pending.resolve_relay(response).await;
            Ok(())
        }
        MeshMessage::SpecVerifyRequest(request) => {
            match state.backend.as_ref().filter(|b| b.is_ready()) {
                Some(backend) => {
                    let backend = backend.clone();
                    let reply = tx.clone();
                    tokio::spawn(async move {
                        let response = speculative::handle_verify(&backend, request).await;
                        let _ = reply.send(MeshMessage::SpecVerifyResponse(response)).await;
                    });
                }
                None => {
                    // No target model here; reject everything so the caller
                    // falls back.
                    let _ = tx
                        .send(MeshMessage::SpecVerifyResponse(SpecVerifyResponse {
                            request_id: request.request_id,
                            accepted_tokens: Vec::new(),
                            rejected_index: Some(0),
                            fallback_token: None,
                        }))
                        .await;
                }
            }
            Ok(())
        }
        MeshMessage::SpecVerifyResponse(response) => {
            state.pending.resolve_verify(response).await;
            Ok(())
        }
        MeshMessage::DirectMessage(message) => route_direct_message(state, message).await,
        MeshMessage::FriendRequest(request) => {
            state.friends.record_request(
                &request.from_id,
                &request.display_name,
                request.signature.clone(),
            )?;
            let _ = state.events.send(NodeEvent::FriendRequestReceived(request));
            Ok(())
        }
        MeshMessage::FriendAcceptance(acceptance) => {
            state
                .friends
                .mark_accepted(&acceptance.from_id, &acceptance.display_name)?;
            let _ = state.events.send(NodeEvent::FriendAccepted(acceptance));
            Ok(())
        }
    }
}

/// Tells every other direct peer about the current neighbour set.
async fn broadcast_topology(state: &Arc<NodeState>, except: &str) {
    let update = MeshMessage::TopologyUpdate(crate::protocol::TopologyUpdate {
        device_id: state.identity.device_id.clone(),
        connected_peers: state.directory.summaries(),
    });
    for info in state.directory.snapshot() {
        if info.device_id == except || info.via.is_some() {
            continue;
        }
        if let Some(sender) = state.directory.sender_for(&info.device_id) {
            let _ = sender.send(update.clone()).await;
        }
    }
}

/// Delivers locally or relays toward the destination via the route table.
async fn route_direct_message(
    state: &Arc<NodeState>,
    message: DirectMessage,
) -> Result<(), MeshError> {
    if message.to_id == state.identity.device_id {
        let _ = state.events.send(NodeEvent::DirectMessage(message));
        return Ok(());
    }
    let next = state.directory.sender_for(&message.to_id).or_else(|| {
        state
            .directory
            .route_table()
            .iter()
            .find(|route| route.destination_id == message.to_id)
            .and_then(|route| state.directory.sender_for(&route.next_hop_id))
    });
    match next {
        Some(sender) => {
            let _ = sender.send(MeshMessage::DirectMessage(message)).await;
            Ok(())
        }
        None => {
            warn!(to = %message.to_id, "dropping direct message with no route");
            Ok(())
        }
    }
}

/// Implements the forwarding steps for one MeshForwardRequest.
async fn handle_forward(
    state: Arc<NodeState>,
    mut request: MeshForwardRequest,
    reply: mpsc::Sender<MeshMessage>,
) {
    let my_id = state.identity.device_id.clone();

    if request.visited_nodes.contains(&my_id) {
        warn!(request_id = %request.request_id, "loop detected");
        let mut route_path = request.visited_nodes.clone();
        route_path.push(my_id);
        let hop_count = route_path.len() - 1;
        let _ = reply
            .send(MeshMessage::MeshForwardResponse(MeshForwardResponse {
                request_id: request.request_id,
                response: None,
                error: Some("Loop detected".to_string()),
                route_path,
                hop_count,
                processing_device_name: None,
            }))
            .await;
        return;
    }

    if request.visited_nodes.len() >= request.max_hops {
        warn!(request_id = %request.request_id, max_hops = request.max_hops, "max hops exceeded");
        let mut route_path = request.visited_nodes.clone();
        route_path.push(my_id);
        let hop_count = route_path.len() - 1;
        let _ = reply
            .send(MeshMessage::MeshForwardResponse(MeshForwardResponse {
                request_id: request.request_id,
                response: None,
                error: Some("Max hops exceeded".to_string()),
                route_path,
                hop_count,
                processing_device_name: None,
            }))
            .await;
        return;
    }

    request.visited_nodes.push(my_id.clone());

    if let Some(backend) = state.backend.as_ref().filter(|b| b.is_ready()) {
        match run_local_inference(backend, &request.payload).await {
            Ok(text) => {
                let earned = estimate_tokens(&text);
                if let Err(err) = state.stats.record_request(earned) {
                    warn!(error = %err, "failed to persist earnings");
                }
                let hop_count = request.visited_nodes.len() - 1;
                debug!(request_id = %request.request_id, hop_count, "served mesh inference locally");
                let _ = reply
                    .send(MeshMessage::MeshForwardResponse(MeshForwardResponse {
                        request_id: request.request_id,
                        response: Some(text),
                        error: None,
                        route_path: request.visited_nodes,
                        hop_count,
                        processing_device_name: Some(state.options.display_name.clone()),
                    }))
                    .await;
                return;
            }
            Err(err) => {
                warn!(error = %err, "local inference failed; forwarding instead");
            }
        }
    }

    // Prefer peers not yet on the path.  When the topology leaves none
    // (every neighbour is already visited), forward to the best peer other
    // than the previous hop and let receiver-side loop detection terminate
    // the request.
    let exclude: HashSet<&str> = request.visited_nodes.iter().map(String::as_str).collect();
    let next = state.directory.best_peer(&exclude).or_else(|| {
        let previous_hop = request
            .visited_nodes
            .len()
            .checked_sub(2)
            .map(|i| request.visited_nodes[i].as_str());
        let exclude_previous: HashSet<&str> = previous_hop.into_iter().collect();
        state.directory.best_peer(&exclude_previous)
    });

    let Some((next_id, sender)) = next else {
        let hop_count = request.visited_nodes.len() - 1;
        let _ = reply
            .send(MeshMessage::MeshForwardResponse(MeshForwardResponse {
                request_id: request.request_id,
                response: None,
                error: Some("No available peers".to_string()),
                route_path: request.visited_nodes,
                hop_count,
                processing_device_name: None,
            }))
            .await;
        return;
    };

    debug!(
        request_id = %request.request_id,
        next = %next_id,
        visited = request.visited_nodes.len(),
        "forwarding mesh request"
    );
    state
        .pending
        .register(request.request_id, PendingTarget::Backward(reply.clone()));
    // The entry must not outlive the request: evict after the timeout so a
    // response that never comes does not leak it, and a late one is dropped.
    {
        let state = state.clone();
        let request_id = request.request_id;
        tokio::spawn(async move {
            tokio::time::sleep(state.options.request_timeout).await;
            state.pending.evict(&request_id);
        });
    }
    if sender
        .send(MeshMessage::MeshForwardRequest(request.clone()))
        .await
        .is_err()
    {
        state.pending.evict(&request.request_id);
        let hop_count = request.visited_nodes.len() - 1;
        let _ = reply
            .send(MeshMessage::MeshForwardResponse(MeshForwardResponse {
                request_id: request.request_id,
                response: None,
                error: Some("No available peers".to_string()),
                route_path: request.visited_nodes,
                hop_count,
                processing_device_name: None,
            }))
            .await;
    }
}

/// Single-hop inference ask from a directly connected peer.
async fn handle_direct_inference(
    state: Arc<NodeState>,
    request: InferenceRequest,
    reply: mpsc::Sender<MeshMessage>,
) {
    let my_id = state.identity.device_id.clone();
    let response = match state.backend.as_ref().filter(|b| b.is_ready()) {
        Some(backend) => match run_local_inference(backend, &request.payload).await {
            Ok(text) => {
                let earned = estimate_tokens(&text);
                if let Err(err) = state.stats.record_request(earned) {
                    warn!(error = %err, "failed to persist earnings");
                }
                MeshForwardResponse {
                    request_id: request.request_id,
                    response: Some(text),
                    error: None,
                    route_path: vec![my_id],
                    hop_count: 0,
                    processing_device_name: Some(state.options.display_name.clone()),
                }
            }
            Err(err) => MeshForwardResponse {
                request_id: request.request_id,
                response: None,
                error: Some(format!("Inference failed: {err}")),
                route_path: vec![my_id],
                hop_count: 0,
                processing_device_name: None,
            },
        },
        None => MeshForwardResponse {
            request_id: request.request_id,
            response: None,
            error: Some("No local model available".to_string()),
            route_path: vec![my_id],
            hop_count: 0,
            processing_device_name: None,
        },
    };
    let _ = reply
        .send(MeshMessage::MeshForwardResponse(response))
        .await;
}
