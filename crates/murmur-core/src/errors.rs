//! Error types for the dispatch engine.
//!
//! Every failure that can stop an email is a [`SendError`]. The per-recipient
//! path returns it with `?` and the outbox processor catches it once per
//! email, so the first failure ends that email's recipient loop while the
//! cycle moves on to the next email.

use thiserror::Error;

/// Failures of the DHT, the relay queue or the outbox.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The DHT rejected or could not complete a store
    #[error("DHT store failed: {0}")]
    Dht(String),

    /// The outgoing relay queue has no room left
    #[error("relay queue is full ({capacity} packets)")]
    QueueFull { capacity: usize },

    /// The outgoing relay queue cannot be written to
    #[error("relay queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The peer pool cannot supply any relay peers
    #[error("not enough relay peers: need {needed}, have {available}")]
    NotEnoughPeers { needed: usize, available: usize },

    /// A relay chain could not be built
    #[error("cannot build relay chain: {0}")]
    RelayChain(String),

    /// The outbox could not be read
    #[error("outbox unavailable: {0}")]
    Outbox(String),
}

/// Reasons an email (or one of its recipients) could not be dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Recipient address does not decode to a destination
    #[error("invalid recipient address '{address}': {reason}")]
    Security { address: String, reason: String },

    /// Fragmentation, authentication or encryption failed
    #[error("{0}")]
    MessageConstruction(String),

    /// DHT store or relay enqueue failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// External recipients present but gateway relay is off
    #[error("the email contains external addresses, but the gateway is disabled")]
    GatewayDisabled,

    /// Settings that can never produce a deliverable packet
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No local identity for the sender address
    #[error("no identity matches the sender address '{0}'")]
    UnknownSender(String),
}

impl SendError {
    /// Short label for log fields and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::Security { .. } => "security",
            SendError::MessageConstruction(_) => "message_construction",
            SendError::Storage(_) => "storage",
            SendError::GatewayDisabled => "gateway_disabled",
            SendError::Configuration(_) => "configuration",
            SendError::UnknownSender(_) => "unknown_sender",
        }
    }
}
