//! Bluetooth Communicator
//!
//! Newline-delimited text messaging between devices over stream sockets.
//! A [`BluetoothServer`] accepts any number of peers on one service, a
//! [`BluetoothClient`] connects out to a single peer. Both dereference to
//! the shared [`BluetoothCommunicator`], which owns the sessions and posts
//! every callback onto the application's [`DeliveryContext`].
//!
//! Transports:
//! - [`transport::RfcommTransport`]: Bluetooth RFCOMM via BlueZ (feature `rfcomm`)
//! - [`transport::TcpTransport`]: TCP, for development hosts
//! - [`transport::MemoryTransport`]: in-process, for tests

#[cfg(feature = "rfcomm")]
pub mod adapter;
pub mod client;
pub mod communicator;
pub mod server;
pub mod session;
pub mod transport;

pub use btcomm_shared;
pub use btcomm_shared::{PeerId, DEFAULT_SERVICE_NAME, SAMPLE_SERVICE_UUID, SPP_UUID};

#[cfg(feature = "rfcomm")]
pub use adapter::BluetoothAdapter;
pub use client::{BluetoothClient, ConnectOutcome};
pub use communicator::{
    delivery_queue, BluetoothCommunicator, CommunicatorConfig, DeliveryContext, DeliveryLoop,
    DeliveryQueue, Immediate, OnLoseConnection, OnReceive, OnSend, SendOutcome,
};
pub use server::{BluetoothServer, ListenEvent, OnListen, ServerConfig};
pub use transport::{DiscoveredPeer, Transport};
