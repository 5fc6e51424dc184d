//! Persisted friends set.
//!
//! FriendRequest/FriendAcceptance exchanges update this store; trust
//! bootstrapping beyond the pairing code (signatures) is a collaborator
//! concern, so the signature string is kept verbatim.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FriendEntry {
    pub device_id: String,
    pub display_name: String,
    pub accepted: bool,
    pub added_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

pub struct FriendStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, FriendEntry>>,
}

impl FriendStore {
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref().to_path_buf();
        let inner = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Records an incoming (not yet accepted) friend request.
    pub fn record_request(
        &self,
        device_id: &str,
        display_name: &str,
        signature: Option<String>,
    ) -> Result<(), MeshError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .entry(device_id.to_string())
                .or_insert_with(|| FriendEntry {
                    device_id: device_id.to_string(),
                    display_name: display_name.to_string(),
                    accepted: false,
                    added_at: Utc::now(),
                    signature,
                });
        }
        self.save()
    }

    /// Marks a peer as an accepted friend (either side of the handshake).
    pub fn mark_accepted(&self, device_id: &str, display_name: &str) -> Result<(), MeshError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .entry(device_id.to_string())
                .or_insert_with(|| FriendEntry {
                    device_id: device_id.to_string(),
                    display_name: display_name.to_string(),
                    accepted: false,
                    added_at: Utc::now(),
                    signature: None,
                });
            entry.accepted = true;
            entry.display_name = display_name.to_string();
        }
        self.save()
    }

    pub fn is_friend(&self, device_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(device_id)
            .is_some_and(|e| e.accepted)
    }

    pub fn list(&self) -> Vec<FriendEntry> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    fn save(&self) -> Result<(), MeshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = {
            let inner = self.inner.lock().unwrap();
            serde_json::to_string_pretty(&*inner)?
        };
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_then_accept_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("friends.json");

        let store = FriendStore::load_or_create(&path).unwrap();
        store.record_request("dev-9", "Tablet", None).unwrap();
        assert!(!store.is_friend("dev-9"));

        store.mark_accepted("dev-9", "Tablet").unwrap();
        assert!(store.is_friend("dev-9"));

        let reloaded = FriendStore::load_or_create(&path).unwrap();
        assert!(reloaded.is_friend("dev-9"));
        assert_eq!(reloaded.list().len(), 1);
    }
}
