//! Arena-backed JSON codec.
//!
//! A single-pass recursive-descent parser over a byte slice producing
//! [`Value`] trees whose string payloads live in an [`elio_arena::Arena`].
//! Strings without escapes are copied into the arena in one pass; escape
//! decoding only runs when a backslash was seen.
//!
//! This codec sits on the model-output hot path (tool-call bodies arrive
//! embedded in generated text).  Wire envelopes and config files use
//! `serde_json`/`toml` like the rest of the workspace; [`Value::to_serde`]
//! bridges parsed arguments across that boundary.

mod parse;
mod ser;
mod value;

pub use parse::{JsonError, parse, parse_str};
pub use ser::{to_string, to_string_pretty};
pub use value::{Object, Value};
