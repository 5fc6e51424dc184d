//! Agent orchestration.
//!
//! [`Agent::run`] drives one request to completion: build the system prompt
//! from the tool registry, stream a generation from the configured
//! [`Backend`], parse the response into text / thinking / tool calls,
//! dispatch tools and feed their results back, and repeat until the model
//! stops calling tools or the iteration cap is hit.

mod backend;
mod error;
mod message;
mod orchestrator;
mod prompt;

pub use backend::{Backend, CloudBackend, GenerationSettings, TokenSink};
pub use error::AgentError;
pub use message::{Message, Role, ToolCallRecord, ToolResultRecord};
pub use orchestrator::{Agent, AgentConfig, RunResult, Step, StopHandle};
pub use prompt::build_system_prompt;
