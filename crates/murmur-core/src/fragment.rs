//! Cutting an email into fragments for one recipient.
//!
//! The email body is first wrapped in an authenticated payload:
//!
//! ```text
//! version (1) | flags (1) | [signature (64) if flags & SIGNED] | content
//! ```
//!
//! The signature covers a transcript of the message id, the recipient
//! address, the sender destination and the content. Anonymous mail carries no
//! signature. The payload is then split into pieces that each fit the size
//! budget of an [`UnencryptedFragment`].

use bytes::{BufMut, Bytes};
use murmur_crypto::transcript::{tags, Transcript};
use murmur_crypto::{verify_signature, EmailDestination, EmailIdentity, IdentityError};

use crate::errors::SendError;
use crate::packet::{PacketError, Reader, UnencryptedFragment};
use crate::types::{extract_destination, Email, MessageId};

const PAYLOAD_VERSION: u8 = 1;
const FLAG_SIGNED: u8 = 0x01;
const SIGNATURE_LEN: usize = 64;
const SIGNATURE_DOMAIN: &str = "murmur_email_sig_v1";

/// Split `data` into consecutive pieces of at most `chunk_size` bytes.
///
/// Empty input yields one empty piece so every email has at least one
/// fragment. A `chunk_size` of zero is treated as one.
pub fn split_content(data: &[u8], chunk_size: usize) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(chunk_size.max(1)).collect()
}

fn signing_digest(
    message_id: &MessageId,
    recipient: &str,
    sender: &EmailDestination,
    content: &[u8],
) -> [u8; 32] {
    let mut t = Transcript::new(SIGNATURE_DOMAIN);
    t.append_bytes(tags::MESSAGE_ID, message_id.as_bytes());
    t.append_str(tags::RECIPIENT, recipient);
    t.append_bytes(tags::SENDER, &sender.to_bytes());
    t.append_bytes(tags::CONTENT, content);
    t.digest()
}

/// Sign the email for `recipient` if it has a sender.
fn authenticate(
    email: &Email,
    identity: Option<&EmailIdentity>,
    recipient: &str,
) -> Result<Option<[u8; SIGNATURE_LEN]>, SendError> {
    let Some(sender) = email.sender() else {
        return Ok(None);
    };
    let identity = identity.ok_or_else(|| {
        SendError::MessageConstruction("email has a sender but no identity to sign with".into())
    })?;

    let claimed = extract_destination(sender);
    let destination = identity.destination();
    match claimed.parse::<EmailDestination>() {
        Ok(d) if d == destination => {}
        _ => {
            return Err(SendError::MessageConstruction(format!(
                "signing identity does not match sender '{claimed}'"
            )))
        }
    }

    let digest = signing_digest(&email.message_id(), recipient, &destination, email.content());
    Ok(Some(identity.sign(&digest)))
}

fn encode_payload(signature: Option<&[u8; SIGNATURE_LEN]>, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + SIGNATURE_LEN + content.len());
    out.put_u8(PAYLOAD_VERSION);
    match signature {
        Some(sig) => {
            out.put_u8(FLAG_SIGNED);
            out.extend_from_slice(sig);
        }
        None => out.put_u8(0),
    }
    out.extend_from_slice(content);
    out
}

/// Turn `email` into the fragments addressed to `recipient`.
///
/// `max_fragment_size` is the encoded size limit from
/// [`crate::budget::max_fragment_size`]. `identity` must be the sender's
/// identity unless the email is anonymous.
pub fn create_fragments(
    email: &Email,
    identity: Option<&EmailIdentity>,
    recipient: &str,
    max_fragment_size: usize,
) -> Result<Vec<UnencryptedFragment>, SendError> {
    let content_budget = max_fragment_size
        .checked_sub(UnencryptedFragment::HEADER_SIZE)
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            SendError::Configuration(format!(
                "fragment size {max_fragment_size} leaves no room for content"
            ))
        })?;

    let signature = authenticate(email, identity, recipient)?;
    let payload = encode_payload(signature.as_ref(), email.content());
    let pieces = split_content(&payload, content_budget);

    let count = u16::try_from(pieces.len()).map_err(|_| {
        SendError::MessageConstruction(format!(
            "email needs {} fragments, at most {} are allowed",
            pieces.len(),
            u16::MAX
        ))
    })?;

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            UnencryptedFragment::new(
                email.message_id(),
                index as u16,
                count,
                Bytes::copy_from_slice(piece),
            )
            .map_err(|e| SendError::MessageConstruction(e.to_string()))
        })
        .collect()
}

/// An email body put back together from its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledEmail {
    message_id: MessageId,
    signature: Option<[u8; SIGNATURE_LEN]>,
    content: Bytes,
}

impl ReassembledEmail {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Check the signature against the claimed sender.
    pub fn verify(&self, recipient: &str, sender: &EmailDestination) -> Result<(), IdentityError> {
        let signature = self.signature.as_ref().ok_or(IdentityError::InvalidSignature)?;
        let digest = signing_digest(&self.message_id, recipient, sender, &self.content);
        verify_signature(sender, &digest, signature)
    }
}

/// Put fragments back together, in any order.
///
/// All fragments must belong to one email and every index from `0` to
/// `count - 1` must be present exactly once.
pub fn reassemble(fragments: &[UnencryptedFragment]) -> Result<ReassembledEmail, PacketError> {
    let first = fragments
        .first()
        .ok_or_else(|| PacketError::Invalid("no fragments".into()))?;
    let message_id = first.message_id();
    let count = first.count() as usize;

    let mut slots: Vec<Option<&UnencryptedFragment>> = vec![None; count];
    for fragment in fragments {
        if fragment.message_id() != message_id || fragment.count() as usize != count {
            return Err(PacketError::Invalid("fragments of different emails".into()));
        }
        let slot = &mut slots[fragment.index() as usize];
        if slot.is_some() {
            return Err(PacketError::Invalid(format!(
                "duplicate fragment {}",
                fragment.index()
            )));
        }
        *slot = Some(fragment);
    }

    let mut payload = Vec::new();
    for (index, slot) in slots.iter().enumerate() {
        let fragment = slot.ok_or_else(|| PacketError::Invalid(format!("missing fragment {index}")))?;
        payload.extend_from_slice(fragment.content());
    }

    let mut r = Reader::new(&payload);
    let version = r.u8()?;
    if version != PAYLOAD_VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }
    let flags = r.u8()?;
    let signature = if flags & FLAG_SIGNED != 0 {
        Some(r.array::<SIGNATURE_LEN>()?)
    } else {
        None
    };
    let content = Bytes::copy_from_slice(r.rest());

    Ok(ReassembledEmail {
        message_id,
        signature,
        content,
    })
}
