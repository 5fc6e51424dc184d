//! Mesh P2P inference fabric.
//!
//! Nodes discover each other over Bonjour, exchange capability records on
//! connect, and forward inference requests across multiple hops with
//! visited-set loop prevention.  Nodes without internet can tunnel HTTP
//! through peers via the domain-whitelisted relay, and a fast local model
//! can have its draft tokens verified by a stronger peer model.
//!
//! Wire format: newline-delimited JSON envelopes `{"type", "payload"}` over
//! TCP ([`MeshMessage`]).  PeerDiscovery must precede any inference traffic
//! on a connection.

mod backend;
mod capability;
mod directory;
mod discovery;
mod error;
mod friends;
mod identity;
mod pending;
mod protocol;
mod relay;
mod server;
mod speculative;
mod stats;

pub use backend::{MeshBackend, SpeculativeBackend};
pub use capability::{Capability, routing_score};
pub use directory::{PeerDirectory, PeerInfo, RouteEntry};
pub use discovery::{DEFAULT_PORT, Discovery, DiscoveredPeer, SERVICE_TYPE, resolved_to_peer};
pub use error::MeshError;
pub use friends::{FriendEntry, FriendStore};
pub use identity::NodeIdentity;
pub use protocol::{
    ChatTurn, DirectMessage, FriendAcceptance, FriendRequest, InferencePayload, InferenceRequest,
    InferenceSettings, MAX_FRAME_BYTES, MeshForwardRequest, MeshForwardResponse, MeshMessage,
    PeerDiscovery, PeerSummary, RelayRequest, RelayResponse, SpecVerifyRequest, SpecVerifyResponse,
    TopologyUpdate, read_message, write_message,
};
pub use relay::RelayHandler;
pub use server::{MeshNode, NodeEvent, NodeOptions};
pub use stats::{DayStats, EarningsLedger};
