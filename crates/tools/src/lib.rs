//! Tool definitions, registry and schema generation.
//!
//! A [`ToolRegistry`] holds an ordered list of tools keyed by name (lookup is
//! linear; registries are expected to stay small).  From the registered
//! definitions it renders both the OpenAI function-calling JSON array and a
//! Markdown summary, which the orchestrator embeds in the system prompt.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod builtins;
mod schema;

pub use builtins::{CurrentTimeTool, ListFilesTool, ReadFileTool, WriteFileTool, register_builtins};
pub use schema::{ParamSchema, PropertyType};

/// Static metadata about a tool, used by the model to decide what to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Ordered parameter schemas; order is preserved in the generated JSON.
    pub params: Vec<ParamSchema>,
}

/// The result returned after a tool runs.
///
/// Execution failures are represented here rather than as errors so the
/// agent loop can hand them back to the model for recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Trait implemented by every tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn run(&self, args: &serde_json::Value) -> ToolOutput;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Tool names are unique within a registry.
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),
}

/// Ordered registry of tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.definition().name;
        if self.get(&name).is_some() {
            return Err(RegistryError::DuplicateName(name));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.definition().name == name)
            .map(|t| t.as_ref())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// OpenAI function-calling array: one
    /// `{type:"function", function:{name, description, parameters}}` entry
    /// per tool, nested property schemas included.
    pub fn to_openai_schema(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .definitions()
            .iter()
            .map(|def| {
                json!({
                    "type": "function",
                    "function": {
                        "name": def.name,
                        "description": def.description,
                        "parameters": schema::params_to_json_schema(&def.params),
                    }
                })
            })
            .collect();
        serde_json::Value::Array(entries)
    }

    /// Human-readable tool listing for the system prompt.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        for def in self.definitions() {
            out.push_str(&format!("### {}\n{}\n", def.name, def.description));
            if !def.params.is_empty() {
                out.push_str("Parameters:\n");
                for p in &def.params {
                    let required = if p.required { " (required)" } else { "" };
                    out.push_str(&format!(
                        "- `{}` ({}){}: {}\n",
                        p.name,
                        p.property_type.as_str(),
                        required,
                        p.description
                    ));
                }
            }
            out.push('\n');
        }
        out
    }
}

/// A tool backed by a plain function; convenient for tests and small
/// built-ins.
pub struct FnTool<F> {
    definition: ToolDefinition,
    f: F,
}

impl<F> FnTool<F>
where
    F: Fn(&serde_json::Value) -> ToolOutput + Send + Sync,
{
    pub fn new(definition: ToolDefinition, f: F) -> Self {
        Self { definition, f }
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(&serde_json::Value) -> ToolOutput + Send + Sync,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn run(&self, args: &serde_json::Value) -> ToolOutput {
        (self.f)(args)
    }
}

/// Extracts string arguments into a flat map, stringifying scalars the way
/// tool implementations usually want them.
pub fn args_to_string_map(args: &serde_json::Value) -> HashMap<String, String> {
    args.as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    fn dummy(name: &str) -> Box<dyn Tool> {
        let definition = ToolDefinition {
            name: name.to_string(),
            description: format!("Dummy tool: {name}"),
            params: vec![ParamSchema::string("input", "test param").required()],
        };
        let reply = format!("ran {name}");
        Box::new(FnTool::new(definition, move |_| ToolOutput::ok(reply.clone())))
    }

    #[test]
    fn empty_registry() {
        let reg = ToolRegistry::new();
        assert!(reg.definitions().is_empty());
        assert!(reg.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("alpha")).unwrap();
        reg.register(dummy("beta")).unwrap();

        assert!(reg.get("alpha").is_some());
        assert!(reg.get("beta").is_some());
        assert!(reg.get("gamma").is_none());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("dup")).unwrap();
        assert_eq!(
            reg.register(dummy("dup")),
            Err(RegistryError::DuplicateName("dup".to_string()))
        );
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn run_registered_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("runner")).unwrap();

        let tool = reg.get("runner").unwrap();
        let out = tool.run(&serde_json::json!({})).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "ran runner");
    }

    #[test]
    fn openai_schema_shape() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("web_search")).unwrap();

        let schema = reg.to_openai_schema();
        let arr = schema.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["type"], "function");
        assert_eq!(arr[0]["function"]["name"], "web_search");
        let params = &arr[0]["function"]["parameters"];
        assert_eq!(params["type"], "object");
        assert_eq!(params["properties"]["input"]["type"], "string");
        assert_eq!(params["required"][0], "input");
    }

    #[test]
    fn markdown_lists_tools_and_params() {
        let mut reg = ToolRegistry::new();
        reg.register(dummy("lookup")).unwrap();
        let md = reg.to_markdown();
        assert!(md.contains("### lookup"));
        assert!(md.contains("`input` (string) (required)"));
    }

    #[test]
    fn args_map_stringifies_scalars() {
        let map = args_to_string_map(&serde_json::json!({
            "query": "rust",
            "count": 5,
            "verbose": true,
            "empty": null
        }));
        assert_eq!(map["query"], "rust");
        assert_eq!(map["count"], "5");
        assert_eq!(map["verbose"], "true");
        assert_eq!(map["empty"], "");
    }
}
