//! Communicator base shared by the client and server roles
//!
//! This module handles:
//! - The peer -> session registry
//! - Dispatching received lines and lost connections to user callbacks
//! - Sending lines to one peer or to every peer
//! - Posting every callback onto the application's delivery context

pub mod delivery;
mod manager;

pub use delivery::{delivery_queue, DeliveryContext, DeliveryLoop, DeliveryQueue, Immediate, Job};
pub use manager::{
    BluetoothCommunicator, CommunicatorConfig, OnLoseConnection, OnReceive, OnSend, SendOutcome,
};
