//! Bonjour service discovery.
//!
//! Each node registers `_eliochat._tcp` with a TXT record carrying its
//! four-digit pairing code and protocol version, and browses for peers of
//! the same type.  Rotating the pairing code re-registers the service so
//! the new TXT record is published.

use std::net::IpAddr;

use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::info;

use crate::error::MeshError;

pub const SERVICE_TYPE: &str = "_eliochat._tcp.local.";
pub const DEFAULT_PORT: u16 = 8765;

/// A peer resolved from the local network.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub instance_name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub pairing_code: Option<String>,
    pub protocol_version: Option<u32>,
}

pub struct Discovery {
    daemon: ServiceDaemon,
    instance_name: String,
    port: u16,
    protocol_version: u32,
}

impl Discovery {
    /// Registers this node on the local network.  The device id doubles as
    /// the instance name so advertisements stay stable across renames.
    pub fn announce(
        instance_name: &str,
        port: u16,
        pairing_code: &str,
        protocol_version: u32,
    ) -> Result<Self, MeshError> {
        let daemon = ServiceDaemon::new().map_err(|e| MeshError::Discovery(e.to_string()))?;
        let mut discovery = Self {
            daemon,
            instance_name: instance_name.to_string(),
            port,
            protocol_version,
        };
        discovery.register(pairing_code)?;
        info!(instance = %instance_name, port, "announced mesh service");
        Ok(discovery)
    }

    fn register(&mut self, pairing_code: &str) -> Result<(), MeshError> {
        let hostname = format!("{}.local.", self.instance_name);
        let version = self.protocol_version.to_string();
        let properties = [("code", pairing_code), ("version", version.as_str())];
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &self.instance_name,
            &hostname,
            "",
            self.port,
            &properties[..],
        )
        .map_err(|e| MeshError::Discovery(e.to_string()))?
        .enable_addr_auto();
        self.daemon
            .register(info)
            .map_err(|e| MeshError::Discovery(e.to_string()))
    }

    /// Starts browsing; the caller drains the receiver and connects to
    /// resolved peers.
    pub fn browse(&self) -> Result<Receiver<ServiceEvent>, MeshError> {
        self.daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| MeshError::Discovery(e.to_string()))
    }

    /// Publishes a fresh pairing code by restarting the registration.
    pub fn rotate_pairing_code(&mut self, new_code: &str) -> Result<(), MeshError> {
        let fullname = format!("{}.{}", self.instance_name, SERVICE_TYPE);
        let _ = self.daemon.unregister(&fullname);
        self.register(new_code)?;
        info!(instance = %self.instance_name, "pairing code rotated; service re-registered");
        Ok(())
    }

    pub fn shutdown(self) {
        let _ = self.daemon.shutdown();
    }
}

/// Converts a resolved service into a connectable peer record.
pub fn resolved_to_peer(info: &ServiceInfo) -> DiscoveredPeer {
    DiscoveredPeer {
        instance_name: info.get_fullname().to_string(),
        addresses: info.get_addresses().iter().copied().collect(),
        port: info.get_port(),
        pairing_code: info
            .get_property_val_str("code")
            .map(ToString::to_string),
        protocol_version: info
            .get_property_val_str("version")
            .and_then(|v| v.parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_record_carries_code_and_version() {
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            "device-1234",
            "device-1234.local.",
            "192.168.1.7",
            DEFAULT_PORT,
            &[("code", "0427"), ("version", "1")][..],
        )
        .unwrap();

        let peer = resolved_to_peer(&info);
        assert_eq!(peer.port, DEFAULT_PORT);
        assert_eq!(peer.pairing_code.as_deref(), Some("0427"));
        assert_eq!(peer.protocol_version, Some(1));
        assert!(peer.instance_name.contains("device-1234"));
    }
}
