//! Murmur Core - outbound dispatch engine for murmur mail.
//!
//! This crate implements:
//! - Fragment size budgeting and fragmentation of emails
//! - The packets stored in the DHT (encrypted fragments, index records)
//! - Onion-wrapped relay chains with per-hop delays
//! - Direct or relayed DHT stores
//! - Per-recipient routing, including the external mail gateway
//! - The outbox processor that ties it together

#![forbid(unsafe_code)]

// Packets and sizing
pub mod packet;
pub mod budget;
pub mod fragment;
pub mod relay;

// Services
pub mod store;
pub mod router;
pub mod processor;

// Collaborators
pub mod outbox;
pub mod identities;
pub mod network;

// Supporting modules
pub mod config;
pub mod errors;
pub mod stats;
pub mod types;

pub use config::{ConfigError, DispatchConfig, SharedConfig};
pub use errors::{SendError, StorageError};
pub use outbox::{EmailStatus, Outbox, OutboxListener};
pub use processor::{CycleSummary, OutboxProcessor, OutboxServices};
pub use types::{Email, MessageId};

#[cfg(test)]
mod proptests;
