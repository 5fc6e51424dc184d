//! Built-in tools.
//!
//! A small set of host-side tools a node can offer out of the box.  File
//! tools are confined to a workspace root; a path that resolves outside it
//! is refused.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;

use crate::{ParamSchema, Tool, ToolDefinition, ToolOutput};

fn required_str<'a>(args: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolOutput> {
    args.get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutput::error(format!("missing required param: {name}")))
}

/// Resolves `relative` against `root`, refusing paths that escape it.
fn resolve_in_workspace(root: &Path, relative: &str) -> Result<PathBuf, ToolOutput> {
    let root_canonical = root
        .canonicalize()
        .map_err(|e| ToolOutput::error(format!("workspace root unavailable: {e}")))?;
    let full = root.join(relative);
    // The parent must exist and resolve inside the root; the leaf itself may
    // not exist yet (write_file creates it).
    let check = if full.exists() {
        full.canonicalize()
    } else {
        match (full.parent(), full.file_name()) {
            (Some(parent), Some(name)) => parent.canonicalize().map(|p| p.join(name)),
            _ => full.canonicalize(),
        }
    };
    match check {
        Ok(resolved) if resolved.starts_with(&root_canonical) => Ok(resolved),
        Ok(resolved) => Err(ToolOutput::error(format!(
            "path escapes the workspace: {}",
            resolved.display()
        ))),
        Err(e) => Err(ToolOutput::error(format!(
            "cannot resolve path '{relative}': {e}"
        ))),
    }
}

// ── read_file ────────────────────────────────────────────────────────────────

pub struct ReadFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read the contents of a file within the workspace.".to_string(),
            params: vec![
                ParamSchema::string("path", "Relative path from the workspace root").required(),
                ParamSchema::integer("max_bytes", "Maximum bytes to return (default 65536)"),
            ],
        }
    }

    async fn run(&self, args: &serde_json::Value) -> ToolOutput {
        let path = match required_str(args, "path") {
            Ok(p) => p,
            Err(out) => return out,
        };
        let resolved = match resolve_in_workspace(&self.workspace_root, path) {
            Ok(p) => p,
            Err(out) => return out,
        };
        let max_bytes = args
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(65_536) as usize;

        match std::fs::read_to_string(&resolved) {
            Ok(content) => {
                let truncated =
                    elio_arena::text::truncate_text(&content, max_bytes).into_owned();
                ToolOutput::ok(truncated)
            }
            Err(e) => ToolOutput::error(format!("read failed: {e}")),
        }
    }
}

// ── write_file ───────────────────────────────────────────────────────────────

pub struct WriteFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Write content to a file within the workspace (creates or overwrites)."
                .to_string(),
            params: vec![
                ParamSchema::string("path", "Relative path from the workspace root").required(),
                ParamSchema::string("content", "File content to write").required(),
            ],
        }
    }

    async fn run(&self, args: &serde_json::Value) -> ToolOutput {
        let path = match required_str(args, "path") {
            Ok(p) => p,
            Err(out) => return out,
        };
        let content = match required_str(args, "content") {
            Ok(c) => c,
            Err(out) => return out,
        };
        let resolved = match resolve_in_workspace(&self.workspace_root, path) {
            Ok(p) => p,
            Err(out) => return out,
        };
        match std::fs::write(&resolved, content) {
            Ok(()) => ToolOutput::ok(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolOutput::error(format!("write failed: {e}")),
        }
    }
}

// ── list_files ───────────────────────────────────────────────────────────────

pub struct ListFilesTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ListFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_files".to_string(),
            description: "List the entries of a directory within the workspace.".to_string(),
            params: vec![ParamSchema::string(
                "path",
                "Relative directory path (default: workspace root)",
            )],
        }
    }

    async fn run(&self, args: &serde_json::Value) -> ToolOutput {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let resolved = match resolve_in_workspace(&self.workspace_root, path) {
            Ok(p) => p,
            Err(out) => return out,
        };
        match std::fs::read_dir(&resolved) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| {
                        let suffix = if e.path().is_dir() { "/" } else { "" };
                        format!("{}{suffix}", e.file_name().to_string_lossy())
                    })
                    .collect();
                names.sort();
                ToolOutput::ok(names.join("\n"))
            }
            Err(e) => ToolOutput::error(format!("list failed: {e}")),
        }
    }
}

// ── current_time ─────────────────────────────────────────────────────────────

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "current_time".to_string(),
            description: "Get the current date and time (UTC).".to_string(),
            params: vec![],
        }
    }

    async fn run(&self, _args: &serde_json::Value) -> ToolOutput {
        ToolOutput::ok(Utc::now().to_rfc3339())
    }
}

/// Registers the default tool set rooted at `workspace_root`.
pub fn register_builtins(
    registry: &mut crate::ToolRegistry,
    workspace_root: impl Into<PathBuf>,
) -> Result<(), crate::RegistryError> {
    let root = workspace_root.into();
    registry.register(Box::new(ReadFileTool {
        workspace_root: root.clone(),
    }))?;
    registry.register(Box::new(WriteFileTool {
        workspace_root: root.clone(),
    }))?;
    registry.register(Box::new(ListFilesTool {
        workspace_root: root,
    }))?;
    registry.register(Box::new(CurrentTimeTool))?;
    Ok(())
}
