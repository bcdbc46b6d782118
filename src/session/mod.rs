//! Per-connection sessions
//!
//! This module handles:
//! - Wrapping an established stream into a session
//! - The background line reader for each session
//! - Synchronous line writes to a peer
//! - Telling the owner apart "closed on purpose" from "peer dropped"

mod connection;

pub use connection::{ReaderOptions, Session, SessionEvents, SessionId};
