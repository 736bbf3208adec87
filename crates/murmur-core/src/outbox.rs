//! The outbox: pending emails and their user-visible status.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::StorageError;
use crate::types::{Email, MessageId};

/// Status shown to the user for an email in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailStatus {
    Sending,
    /// `sent` is the 1-based position of the last recipient delivered.
    SentTo { sent: usize, total: usize },
    Sent,
    GatewayDisabled,
    InvalidRecipient(String),
    PacketError(String),
    SendFailed(String),
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmailStatus::Sending => f.write_str("Sending"),
            EmailStatus::SentTo { sent, total } => {
                write!(f, "Sent to {sent} of {total} recipients")
            }
            EmailStatus::Sent => f.write_str("Sent"),
            EmailStatus::GatewayDisabled => f.write_str("Gateway disabled"),
            EmailStatus::InvalidRecipient(addr) => write!(f, "Invalid recipient address: {addr}"),
            EmailStatus::PacketError(detail) => write!(f, "Error creating email packets: {detail}"),
            EmailStatus::SendFailed(detail) => write!(f, "Error while sending email: {detail}"),
        }
    }
}

/// Persistent set of emails waiting to be sent.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Snapshot of the pending emails in send order.
    async fn pending(&self) -> Result<Vec<Email>, StorageError>;

    async fn set_status(&self, email: &Email, status: EmailStatus);
}

/// Notified once for every email that was sent completely.
///
/// Listeners typically move the email out of the outbox.
#[async_trait]
pub trait OutboxListener: Send + Sync {
    async fn email_sent(&self, email: &Email);
}

#[derive(Debug, Default)]
struct OutboxState {
    emails: Vec<Email>,
    statuses: HashMap<MessageId, Vec<EmailStatus>>,
    unavailable: bool,
}

/// Outbox kept in process memory. Records every status it is given.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    state: Mutex<OutboxState>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, email: Email) {
        self.state.lock().emails.push(email);
    }

    pub fn remove(&self, message_id: &MessageId) -> bool {
        let mut state = self.state.lock();
        let before = state.emails.len();
        state.emails.retain(|e| e.message_id() != *message_id);
        state.emails.len() != before
    }

    pub fn len(&self) -> usize {
        self.state.lock().emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().emails.is_empty()
    }

    /// Latest status of an email.
    pub fn status(&self, message_id: &MessageId) -> Option<EmailStatus> {
        self.state
            .lock()
            .statuses
            .get(message_id)
            .and_then(|h| h.last().cloned())
    }

    /// Every status an email has been given, oldest first.
    pub fn status_history(&self, message_id: &MessageId) -> Vec<EmailStatus> {
        self.state
            .lock()
            .statuses
            .get(message_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Make [`Outbox::pending`] fail until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn pending(&self) -> Result<Vec<Email>, StorageError> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(StorageError::Outbox("outbox is unavailable".into()));
        }
        Ok(state.emails.clone())
    }

    async fn set_status(&self, email: &Email, status: EmailStatus) {
        self.state
            .lock()
            .statuses
            .entry(email.message_id())
            .or_default()
            .push(status);
    }
}
