//! Peer directory and route table.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use crate::capability::{Capability, routing_score};
use crate::protocol::{MeshMessage, PeerSummary};

/// A known peer: directly connected (hop 1, live sender) or reachable
/// through a neighbour (hop > 1, no sender).
#[derive(Clone)]
pub struct PeerInfo {
    pub device_id: String,
    pub display_name: String,
    pub endpoint: Option<SocketAddr>,
    pub capability: Capability,
    pub hop_count: usize,
    pub last_seen: Instant,
    /// Direct peer this one is reachable through; `None` for direct peers.
    pub via: Option<String>,
}

struct PeerEntry {
    info: PeerInfo,
    sender: Option<mpsc::Sender<MeshMessage>>,
}

/// Shared peer table.  The mutex is only held for map operations, never
/// across I/O.
pub struct PeerDirectory {
    inner: Mutex<HashMap<String, PeerEntry>>,
    stale_after: Duration,
}

/// One entry of the rebuilt route table.  Entries store device ids, not
/// connections; the table is derived from the peer set and never mutated
/// mid-traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination_id: String,
    pub next_hop_id: String,
    pub hop_count: usize,
    pub updated_at: Instant,
}

impl PeerDirectory {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Registers or refreshes a directly connected peer.
    pub fn upsert_direct(
        &self,
        device_id: &str,
        display_name: &str,
        capability: Capability,
        endpoint: Option<SocketAddr>,
        sender: mpsc::Sender<MeshMessage>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            device_id.to_string(),
            PeerEntry {
                info: PeerInfo {
                    device_id: device_id.to_string(),
                    display_name: display_name.to_string(),
                    endpoint,
                    capability,
                    hop_count: 1,
                    last_seen: Instant::now(),
                    via: None,
                },
                sender: Some(sender),
            },
        );
    }

    /// Ingests a peer advertised by the neighbour `via`.  A direct entry is
    /// never downgraded to a multi-hop one.
    pub fn upsert_reachable(&self, summary: &PeerSummary, via: &str) {
        let mut inner = self.inner.lock().unwrap();
        let hop_count = summary.hop_count.saturating_add(1);
        match inner.get_mut(&summary.device_id) {
            Some(existing) if existing.info.via.is_none() => {
                existing.info.last_seen = Instant::now();
            }
            Some(existing) if existing.info.hop_count >= hop_count => {
                existing.info.capability = summary.capability.clone();
                existing.info.hop_count = hop_count;
                existing.info.via = Some(via.to_string());
                existing.info.last_seen = Instant::now();
            }
            Some(_) => {}
            None => {
                inner.insert(
                    summary.device_id.clone(),
                    PeerEntry {
                        info: PeerInfo {
                            device_id: summary.device_id.clone(),
                            display_name: summary.display_name.clone(),
                            endpoint: None,
                            capability: summary.capability.clone(),
                            hop_count,
                            last_seen: Instant::now(),
                            via: Some(via.to_string()),
                        },
                        sender: None,
                    },
                );
            }
        }
    }

    pub fn touch(&self, device_id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(device_id) {
            entry.info.last_seen = Instant::now();
        }
    }

    pub fn remove(&self, device_id: &str) {
        self.inner.lock().unwrap().remove(device_id);
    }

    /// Drops peers whose `last_seen` exceeded the staleness threshold and
    /// returns their ids.
    pub fn evict_stale(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let stale: Vec<String> = inner
            .iter()
            .filter(|(_, e)| now.duration_since(e.info.last_seen) > self.stale_after)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            debug!(peer = %id, "evicting stale peer");
            inner.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Direct peers rendered as advertisements for PeerDiscovery and
    /// TopologyUpdate payloads.
    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|e| PeerSummary {
                device_id: e.info.device_id.clone(),
                display_name: e.info.display_name.clone(),
                capability: e.info.capability.clone(),
                hop_count: e.info.hop_count,
            })
            .collect()
    }

    pub fn sender_for(&self, device_id: &str) -> Option<mpsc::Sender<MeshMessage>> {
        self.inner
            .lock()
            .unwrap()
            .get(device_id)
            .and_then(|e| e.sender.clone())
    }

    /// Best directly connected peer by server-side capability score,
    /// excluding `exclude`.  Ties break by lowest hop count, then the most
    /// recently seen peer.
    pub fn best_peer(
        &self,
        exclude: &HashSet<&str>,
    ) -> Option<(String, mpsc::Sender<MeshMessage>)> {
        self.pick(exclude, |info| info.capability.score())
    }

    /// Best directly connected peer by the client-side routing score (hop
    /// penalty plus recency bonus).
    pub fn best_routing_peer(
        &self,
        exclude: &HashSet<&str>,
    ) -> Option<(String, mpsc::Sender<MeshMessage>)> {
        self.pick(exclude, |info| {
            routing_score(&info.capability, info.hop_count, info.last_seen.elapsed())
        })
    }

    fn pick(
        &self,
        exclude: &HashSet<&str>,
        score: impl Fn(&PeerInfo) -> f32,
    ) -> Option<(String, mpsc::Sender<MeshMessage>)> {
        let inner = self.inner.lock().unwrap();
        let mut best: Option<(&PeerEntry, f32)> = None;
        for entry in inner.values() {
            if entry.sender.is_none() || exclude.contains(entry.info.device_id.as_str()) {
                continue;
            }
            let s = score(&entry.info);
            let better = match &best {
                None => true,
                Some((current, current_score)) => {
                    s > *current_score
                        || (s == *current_score
                            && (entry.info.hop_count < current.info.hop_count
                                || (entry.info.hop_count == current.info.hop_count
                                    && entry.info.last_seen > current.info.last_seen)))
                }
            };
            if better {
                best = Some((entry, s));
            }
        }
        best.map(|(e, _)| (e.info.device_id.clone(), e.sender.clone().unwrap()))
    }

    /// Rebuilds the route table from the current peer set.
    pub fn route_table(&self) -> Vec<RouteEntry> {
        let now = Instant::now();
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|e| RouteEntry {
                destination_id: e.info.device_id.clone(),
                next_hop_id: e
                    .info
                    .via
                    .clone()
                    .unwrap_or_else(|| e.info.device_id.clone()),
                hop_count: e.info.hop_count,
                updated_at: now,
            })
            .collect()
    }
}
