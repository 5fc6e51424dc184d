//! Node identity persistence.

use std::fs;
use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::MeshError;

/// Stable per-device identity.  The device id is generated once and
/// persists across restarts; the pairing code can be rotated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub device_id: String,
    /// Four-digit code advertised in the Bonjour TXT record.
    pub pairing_code: String,
}

impl NodeIdentity {
    /// Loads the identity from `path`, creating and persisting a fresh one
    /// on first run.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();
        if let Ok(raw) = fs::read_to_string(path)
            && let Ok(identity) = serde_json::from_str::<NodeIdentity>(&raw)
        {
            return Ok(identity);
        }

        let identity = NodeIdentity {
            device_id: Uuid::new_v4().to_string(),
            pairing_code: generate_pairing_code(),
        };
        identity.save_to(path)?;
        info!(device_id = %identity.device_id, "created new node identity");
        Ok(identity)
    }

    /// Replaces the pairing code and persists.  The caller re-registers the
    /// Bonjour service so the new TXT record is published.
    pub fn rotate_pairing_code(&mut self, path: impl AsRef<Path>) -> Result<String, MeshError> {
        self.pairing_code = generate_pairing_code();
        self.save_to(path.as_ref())?;
        Ok(self.pairing_code.clone())
    }

    fn save_to(&self, path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}

fn generate_pairing_code() -> String {
    format!("{:04}", rand::thread_rng().gen_range(0..10_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = NodeIdentity::load_or_create(&path).unwrap();
        let second = NodeIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.pairing_code, second.pairing_code);
    }

    #[test]
    fn pairing_code_is_four_digits() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::load_or_create(dir.path().join("id.json")).unwrap();
        assert_eq!(identity.pairing_code.len(), 4);
        assert!(identity.pairing_code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn rotation_changes_only_the_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let mut identity = NodeIdentity::load_or_create(&path).unwrap();
        let old_id = identity.device_id.clone();

        // Rotation may randomly produce the same code; retry a few times to
        // keep the test deterministic enough.
        let old_code = identity.pairing_code.clone();
        let mut changed = false;
        for _ in 0..50 {
            identity.rotate_pairing_code(&path).unwrap();
            if identity.pairing_code != old_code {
                changed = true;
                break;
            }
        }
        assert!(changed);
        assert_eq!(identity.device_id, old_id);

        let reloaded = NodeIdentity::load_or_create(&path).unwrap();
        assert_eq!(reloaded.pairing_code, identity.pairing_code);
    }
}
