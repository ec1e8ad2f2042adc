//! Companion Protocol
//!
//! Shared types for communication between the Companion daemon, its backend
//! adapters, and browser clients. These types are serialized as JSON over
//! WebSocket and HTTP.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::BrowserCommand;
pub use server::{Envelope, SeqEnvelope, ServerEvent};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
