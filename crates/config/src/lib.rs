use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub display_name: String,
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: "Elio Node".to_string(),
            data_dir: ".elio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub port: u16,
    pub max_hops: usize,
    pub request_timeout_secs: u64,
    /// Peers silent for longer than this are evicted from the directory.
    pub peer_stale_secs: u64,
    pub protocol_version: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            port: 8765,
            max_hops: 5,
            request_timeout_secs: 60,
            peer_stale_secs: 600,
            protocol_version: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Hosts the relay is willing to reach on behalf of offline peers.
    pub allowed_hosts: Vec<String>,
    /// Sliding-window limit per client id per 60 seconds.
    pub rate_limit_per_minute: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: vec![
                "api.openai.com".to_string(),
                "api.anthropic.com".to_string(),
                "generativelanguage.googleapis.com".to_string(),
            ],
            rate_limit_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// "local", "cloud", "mesh" or "speculative".
    pub kind: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "cloud".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: usize,
    pub max_tool_result_len: usize,
    pub use_japanese: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tool_result_len: 4096,
            use_japanese: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub mesh: MeshConfig,
    pub relay: RelayConfig,
    pub backend: BackendConfig,
    pub agent: AgentSection,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Loads config from `path`, falling back to defaults when the file does
    /// not exist.  `ELIO_BASE_URL` overrides the backend URL at runtime.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("ELIO_BASE_URL")
            && !value.is_empty()
        {
            config.backend.base_url = value;
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from("/nonexistent/elio.toml").unwrap();
        assert_eq!(config.mesh.port, 8765);
        assert_eq!(config.mesh.max_hops, 5);
        assert_eq!(config.agent.max_iterations, 10);
    }

    #[test]
    fn roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elio.toml");

        let mut config = AppConfig::default();
        config.node.display_name = "Kitchen iPad".to_string();
        config.mesh.max_hops = 3;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.node.display_name, "Kitchen iPad");
        assert_eq!(loaded.mesh.max_hops, 3);
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elio.toml");
        fs::write(&path, "[mesh]\nport = 9000\n").unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.mesh.port, 9000);
        assert_eq!(loaded.relay.rate_limit_per_minute, 30);
    }
}
