//! Local Bluetooth adapter pass-throughs

use crate::transport::DiscoveredPeer;
use anyhow::{anyhow, Result};
use bluer::Adapter;
use btcomm_shared::PeerId;
use tracing::{debug, info};

/// Thin wrapper over the local BlueZ adapter
#[derive(Clone)]
pub struct BluetoothAdapter {
    adapter: Adapter,
}

impl BluetoothAdapter {
    /// Open the default adapter
    pub async fn open() -> Result<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| anyhow!("Cannot reach bluetoothd: {}", e))?;
        let adapter = session.default_adapter().await?;
        debug!("[BT] Using adapter {}", adapter.name());
        Ok(Self { adapter })
    }

    pub fn from_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// True if the host has a usable Bluetooth adapter
    pub async fn is_supported() -> bool {
        Self::open().await.is_ok()
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        Ok(self.adapter.is_powered().await?)
    }

    /// Power the adapter on
    pub async fn request_enable(&self) -> Result<()> {
        if !self.is_enabled().await? {
            info!("[BT] Powering on adapter {}", self.adapter.name());
            self.adapter.set_powered(true).await?;
        }
        Ok(())
    }

    /// Devices the adapter knows about that are paired
    pub async fn paired_devices(&self) -> Result<Vec<DiscoveredPeer>> {
        let mut paired = Vec::new();
        for address in self.adapter.device_addresses().await? {
            let device = self.adapter.device(address)?;
            if !device.is_paired().await? {
                continue;
            }
            paired.push(DiscoveredPeer {
                peer: PeerId::from(address.to_string()),
                name: device.name().await?,
            });
        }
        Ok(paired)
    }

    pub fn inner(&self) -> &Adapter {
        &self.adapter
    }
}
