//! Core domain types: emails, message ids, DHT keys and recipient addresses.

use std::fmt;

use bytes::Bytes;

/// Unique identifier of one outgoing email.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 32]);

impl MessageId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..8]))
    }
}

/// Address of a storable unit in the DHT.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtKey(pub [u8; 32]);

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({self})")
    }
}

/// A pending outbound message.
///
/// `sender` is `None` for anonymous mail. Sender and recipients are kept as
/// the user wrote them (`Alice <dest>` or a bare address); see
/// [`extract_destination`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    message_id: MessageId,
    sender: Option<String>,
    recipients: Vec<String>,
    content: Bytes,
}

impl Email {
    pub fn new(
        sender: Option<String>,
        recipients: Vec<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            message_id: MessageId::random(),
            sender,
            recipients,
            content: content.into(),
        }
    }

    pub fn anonymous(recipients: Vec<String>, content: impl Into<Bytes>) -> Self {
        Self::new(None, recipients, content)
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.sender.is_none()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Serialized body as handed over by the composer.
    pub fn content(&self) -> &Bytes {
        &self.content
    }
}

/// How a recipient is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientAddress<'a> {
    /// Expected to decode as an email destination; decoding happens at send time.
    Native(&'a str),
    /// Conventional `user@domain.tld` address, delivered through the gateway.
    External(&'a str),
}

impl<'a> RecipientAddress<'a> {
    pub fn classify(address: &'a str) -> Self {
        let extracted = extract_destination(address);
        if is_external_address(extracted) {
            RecipientAddress::External(extracted)
        } else {
            RecipientAddress::Native(extracted)
        }
    }
}

/// Strip a display name: `"Alice <xyz>"` → `"xyz"`. Bare addresses are
/// returned trimmed.
pub fn extract_destination(address: &str) -> &str {
    let trimmed = address.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => trimmed[start + 1..end].trim(),
        _ => trimmed,
    }
}

/// `true` for a conventional `local@domain.tld` address.
pub fn is_external_address(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}
