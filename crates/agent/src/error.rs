use elio_arena::ArenaError;

/// Error taxonomy shared across the agent and the mesh fabric.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum AgentError {
    /// Contract violation at an API boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Arena or host allocator exhaustion.
    #[error("out of memory")]
    OutOfMemory,

    /// JSON or response parse failure.
    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },

    /// Non-conforming bytes where text was required.
    #[error("invalid UTF-8 at byte offset {0}")]
    InvalidUtf8(usize),

    /// Lookup by name or id produced no result.
    #[error("not found: {0}")]
    NotFound(String),

    /// The agent loop exceeded the configured iteration cap.
    #[error("agent loop exceeded {0} iterations")]
    MaxIterations(usize),

    /// A user-provided callback refused or failed.
    #[error("callback failed: {0}")]
    CallbackFailed(String),

    /// `stop` was observed, or a cooperative generator aborted.
    #[error("cancelled")]
    Cancelled,

    /// Transport failure or timeout.
    #[error("network error: {0}")]
    Network(String),

    /// The remote end reported failure.
    #[error("server error ({code}): {detail}")]
    Server { code: u16, detail: String },

    /// Relay throttling.
    #[error("rate limited")]
    RateLimited,
}

impl From<ArenaError> for AgentError {
    fn from(_: ArenaError) -> Self {
        AgentError::OutOfMemory
    }
}

impl AgentError {
    /// Partial output accumulated before this failure is still surfaced to
    /// the user.
    pub fn keeps_partial_output(&self) -> bool {
        matches!(self, AgentError::MaxIterations(_) | AgentError::Cancelled)
    }
}
