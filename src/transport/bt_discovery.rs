//! Bluetooth device discovery

use crate::transport::traits::DiscoveredPeer;
use anyhow::Result;
use bluer::{Adapter, AdapterEvent, Address};
use btcomm_shared::PeerId;
use futures::StreamExt;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

/// Configuration for Bluetooth discovery
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// How long to scan; `None` scans until the discovery task is cancelled
    pub scan_duration: Option<Duration>,
}

/// Bluetooth device discovery service
pub struct BtDiscovery {
    config: DiscoveryConfig,
}

impl BtDiscovery {
    /// Create a new discovery service
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Scan for devices, forwarding each newly seen one to `found`.
    ///
    /// Stops when the scan duration elapses or the receiver is dropped.
    /// Dropping the returned future stops the adapter's discovery session.
    pub async fn scan(
        &self,
        adapter: &Adapter,
        found: mpsc::UnboundedSender<DiscoveredPeer>,
    ) -> Result<()> {
        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);
        let mut seen: HashSet<Address> = HashSet::new();

        let scan = async {
            while let Some(evt) = discover.next().await {
                let AdapterEvent::DeviceAdded(addr) = evt else {
                    continue;
                };
                if !seen.insert(addr) {
                    continue;
                }

                let name = match adapter.device(addr) {
                    Ok(device) => device.name().await.ok().flatten(),
                    Err(_) => None,
                };
                debug!("[BT] Found device {} ({:?})", addr, name);

                let peer = DiscoveredPeer {
                    peer: PeerId::from(addr.to_string()),
                    name,
                };
                if found.send(peer).is_err() {
                    break;
                }
            }
        };

        match self.config.scan_duration {
            Some(duration) => {
                // Timeout is expected, not an error
                if timeout(duration, scan).await.is_err() {
                    info!("[BT] Discovery scan completed");
                }
            }
            None => scan.await,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert!(config.scan_duration.is_none());
    }
}
