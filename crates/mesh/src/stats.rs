//! Token earnings and per-day request statistics.
//!
//! Single-writer on the server-owning task; persisted after each successful
//! request so a crash loses at most the in-flight one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MeshError;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DayStats {
    pub requests_served: u64,
    pub tokens_earned: u64,
}

/// Daily ledger keyed by date.
pub struct EarningsLedger {
    path: PathBuf,
    days: Mutex<HashMap<NaiveDate, DayStats>>,
}

impl EarningsLedger {
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref().to_path_buf();
        let days = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            days: Mutex::new(days),
        })
    }

    /// Records one served request and its earned tokens, then persists.
    pub fn record_request(&self, tokens_earned: u64) -> Result<DayStats, MeshError> {
        let today = Utc::now().date_naive();
        let snapshot = {
            let mut days = self.days.lock().unwrap();
            let entry = days.entry(today).or_default();
            entry.requests_served += 1;
            entry.tokens_earned += tokens_earned;
            *entry
        };
        self.save()?;
        Ok(snapshot)
    }

    pub fn today(&self) -> DayStats {
        let today = Utc::now().date_naive();
        self.days
            .lock()
            .unwrap()
            .get(&today)
            .copied()
            .unwrap_or_default()
    }

    pub fn total_tokens_earned(&self) -> u64 {
        self.days
            .lock()
            .unwrap()
            .values()
            .map(|d| d.tokens_earned)
            .sum()
    }

    fn save(&self) -> Result<(), MeshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = {
            let days = self.days.lock().unwrap();
            serde_json::to_string_pretty(&*days)?
        };
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// Coarse token estimate for earnings when the backend does not report a
/// count: one token per four bytes of output.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let ledger = EarningsLedger::load_or_create(&path).unwrap();
        ledger.record_request(10).unwrap();
        ledger.record_request(5).unwrap();
        assert_eq!(ledger.today().requests_served, 2);
        assert_eq!(ledger.today().tokens_earned, 15);

        let reloaded = EarningsLedger::load_or_create(&path).unwrap();
        assert_eq!(reloaded.today().requests_served, 2);
        assert_eq!(reloaded.total_tokens_earned(), 15);
    }

    #[test]
    fn token_estimate_is_positive() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
