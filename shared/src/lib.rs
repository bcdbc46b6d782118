//! Bluetooth Communicator Shared Types
//!
//! This crate provides the peer identity, well-known service identifiers and
//! the newline line codec used by both the communicator library and the
//! sample application.

pub mod codec;

use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Service name advertised by the sample application
pub const DEFAULT_SERVICE_NAME: &str = "BluetoothSample";

/// Service UUID shared by the sample server and client
pub const SAMPLE_SERVICE_UUID: Uuid = Uuid::from_u128(0x99E4C09C_67C1_40E0_A11B_B1C888AE4B65);

/// Standard Serial Port Profile UUID
pub const SPP_UUID: Uuid = Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB);

/// Opaque identity of a remote device.
///
/// For Bluetooth this is the `XX:XX:XX:XX:XX:XX` address, for TCP the
/// `host:port` of the remote socket. Two sessions are for the same peer iff
/// their identities compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Bluetooth addresses are upper-cased so `aa:bb:..` and `AA:BB:..` name
    /// the same peer; anything else is kept verbatim.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        if is_bluetooth_address(&id) {
            Self(id.to_ascii_uppercase())
        } else {
            Self(id)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_bluetooth_address(id: &str) -> bool {
    id.len() == 17
        && id.split(':').count() == 6
        && id
            .split(':')
            .all(|octet| octet.len() == 2 && octet.bytes().all(|b| b.is_ascii_hexdigit()))
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let peer = PeerId::from(addr);
        assert_eq!(peer.as_str(), "127.0.0.1:9000");
        assert_eq!(peer, PeerId::from("127.0.0.1:9000"));
    }

    #[test]
    fn test_bluetooth_address_is_case_insensitive() {
        let lower = PeerId::from("aa:bb:cc:0d:1e:ff");
        assert_eq!(lower.as_str(), "AA:BB:CC:0D:1E:FF");
        assert_eq!(lower, PeerId::new("AA:bb:CC:0d:1E:ff".to_string()));

        // Not an address: left alone
        assert_eq!(PeerId::from("node-a").as_str(), "node-a");
        assert_eq!(PeerId::from("aa:bb:cc:dd:ee").as_str(), "aa:bb:cc:dd:ee");
    }

    #[test]
    fn test_sample_uuid_matches_string_form() {
        assert_eq!(
            SAMPLE_SERVICE_UUID.to_string().to_uppercase(),
            "99E4C09C-67C1-40E0-A11B-B1C888AE4B65"
        );
        assert_eq!(SPP_UUID.to_string(), "00001101-0000-1000-8000-00805f9b34fb");
    }
}
