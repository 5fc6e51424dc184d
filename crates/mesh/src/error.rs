use crate::protocol::MAX_FRAME_BYTES;

/// Failures inside the mesh fabric.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// A peer sent a frame past the bounded-size policy.
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte cap")]
    FrameTooLarge(usize),

    /// A peer violated message ordering (e.g. inference before discovery).
    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("request timed out")]
    Timeout,

    #[error("no eligible peers")]
    NoPeers,

    #[error("peer not connected: {0}")]
    NotConnected(String),

    /// The remote end reported a textual failure.
    #[error("{0}")]
    Remote(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("discovery error: {0}")]
    Discovery(String),
}
