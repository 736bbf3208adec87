//! Packets stored in the DHT.
//!
//! An email is cut into [`UnencryptedFragment`]s, each sealed to the
//! recipient as an [`EncryptedFragment`]. An [`IndexRecord`] stored under the
//! recipient's DHT key lists the fragments that make up the email. Both are
//! [`DhtStorable`]; a [`StoreOperation`] is the request to store one of them
//! and is what relay chains carry.
//!
//! Every packet starts with a type byte and a version byte. Integers are
//! big-endian and length prefixes are `u32`.

use bytes::{Buf, BufMut, Bytes};
use murmur_crypto::hash::sha256;
use murmur_crypto::{open, seal, EmailDestination, EmailIdentity, SealError, SealedBox, SEAL_OVERHEAD};
use thiserror::Error;

use crate::types::{DhtKey, MessageId};

/// Largest packet the network transport delivers in one datagram.
pub const MAX_DATAGRAM_SIZE: usize = 31 * 1024;

pub const PROTOCOL_VERSION: u8 = 1;

const TYPE_UNENCRYPTED: u8 = b'U';
const TYPE_ENCRYPTED: u8 = b'E';
const TYPE_INDEX: u8 = b'I';
const TYPE_STORE: u8 = b'S';

const FRAGMENT_PURPOSE: &str = "murmur/fragment/v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unexpected packet type {found:#04x}, expected {expected:#04x}")]
    UnexpectedType { expected: u8, found: u8 },

    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),

    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),

    #[error("{0} trailing bytes after packet")]
    Trailing(usize),

    #[error("invalid packet: {0}")]
    Invalid(String),

    #[error("sealed box: {0}")]
    Seal(#[from] SealError),
}

/// Bounds-checked cursor over an encoded packet.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), PacketError> {
        if self.buf.remaining() < n {
            return Err(PacketError::Truncated {
                needed: n,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Check the type and version bytes.
    pub(crate) fn header(&mut self, expected: u8) -> Result<(), PacketError> {
        let found = self.u8()?;
        if found != expected {
            return Err(PacketError::UnexpectedType { expected, found });
        }
        let version = self.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, PacketError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, PacketError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, PacketError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, PacketError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Length-prefixed (`u32`) byte string.
    pub(crate) fn prefixed(&mut self) -> Result<&'a [u8], PacketError> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    pub(crate) fn finish(self) -> Result<(), PacketError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(PacketError::Trailing(self.buf.len()))
        }
    }
}

fn put_header(out: &mut Vec<u8>, packet_type: u8) {
    out.put_u8(packet_type);
    out.put_u8(PROTOCOL_VERSION);
}

fn put_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.extend_from_slice(data);
}

// ============================================================================
// Fragments
// ============================================================================

/// One plaintext slice of an email, addressed to a single recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnencryptedFragment {
    message_id: MessageId,
    index: u16,
    count: u16,
    content: Bytes,
}

impl UnencryptedFragment {
    /// type + version + message id + index + count + content length
    pub const HEADER_SIZE: usize = 1 + 1 + 32 + 2 + 2 + 4;

    pub fn new(
        message_id: MessageId,
        index: u16,
        count: u16,
        content: Bytes,
    ) -> Result<Self, PacketError> {
        if count == 0 || index >= count {
            return Err(PacketError::Invalid(format!(
                "fragment index {index} out of range for {count} fragments"
            )));
        }
        Ok(Self {
            message_id,
            index,
            count,
            content,
        })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.content.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        put_header(&mut out, TYPE_UNENCRYPTED);
        out.extend_from_slice(self.message_id.as_bytes());
        out.put_u16(self.index);
        out.put_u16(self.count);
        put_prefixed(&mut out, &self.content);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        r.header(TYPE_UNENCRYPTED)?;
        let message_id = MessageId::from_bytes(r.array()?);
        let index = r.u16()?;
        let count = r.u16()?;
        let content = Bytes::copy_from_slice(r.prefixed()?);
        r.finish()?;
        Self::new(message_id, index, count, content)
    }
}

/// An [`UnencryptedFragment`] sealed to its recipient.
///
/// The DHT key is the hash of the sealed bytes, so a fragment cannot be
/// swapped for another under the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFragment {
    dht_key: DhtKey,
    sealed: SealedBox,
}

impl EncryptedFragment {
    /// Fixed number of bytes encryption adds to an encoded [`UnencryptedFragment`].
    pub const MAX_OVERHEAD: usize = 1 + 1 + 32 + 4 + SEAL_OVERHEAD;

    pub fn encrypt(
        fragment: &UnencryptedFragment,
        recipient: &EmailDestination,
    ) -> Result<Self, PacketError> {
        let sealed = seal(recipient.kex_pub(), FRAGMENT_PURPOSE, &fragment.to_bytes())?;
        let dht_key = DhtKey(sha256(&sealed.to_bytes()));
        Ok(Self { dht_key, sealed })
    }

    pub fn decrypt(&self, identity: &EmailIdentity) -> Result<UnencryptedFragment, PacketError> {
        let plaintext = open(&self.sealed, identity.kex_secret(), FRAGMENT_PURPOSE)?;
        UnencryptedFragment::from_bytes(&plaintext)
    }

    pub fn dht_key(&self) -> DhtKey {
        self.dht_key
    }

    pub fn encoded_len(&self) -> usize {
        1 + 1 + 32 + 4 + self.sealed.encoded_len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        put_header(&mut out, TYPE_ENCRYPTED);
        out.extend_from_slice(&self.dht_key.0);
        put_prefixed(&mut out, &self.sealed.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        r.header(TYPE_ENCRYPTED)?;
        let dht_key = DhtKey(r.array()?);
        let sealed_bytes = r.prefixed()?;
        r.finish()?;
        if sha256(sealed_bytes) != dht_key.0 {
            return Err(PacketError::Invalid("fragment key does not match content".into()));
        }
        Ok(Self {
            dht_key,
            sealed: SealedBox::from_bytes(sealed_bytes)?,
        })
    }
}

// ============================================================================
// Index records
// ============================================================================

/// Lists the fragments of one email for one recipient.
///
/// Stored under the recipient's DHT key, which is how the recipient finds
/// new mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    recipient: DhtKey,
    entries: Vec<DhtKey>,
}

impl IndexRecord {
    pub const HEADER_SIZE: usize = 1 + 1 + 32 + 4;
    pub const ENTRY_SIZE: usize = 32;

    pub fn new(recipient: &EmailDestination) -> Self {
        Self {
            recipient: DhtKey(recipient.dht_key()),
            entries: Vec::new(),
        }
    }

    pub fn put(&mut self, fragment: &EncryptedFragment) {
        self.entries.push(fragment.dht_key());
    }

    pub fn entries(&self) -> &[DhtKey] {
        &self.entries
    }

    pub fn recipient(&self) -> DhtKey {
        self.recipient
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.entries.len() * Self::ENTRY_SIZE
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        put_header(&mut out, TYPE_INDEX);
        out.extend_from_slice(&self.recipient.0);
        out.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            out.extend_from_slice(&entry.0);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        r.header(TYPE_INDEX)?;
        let recipient = DhtKey(r.array()?);
        let count = r.u32()? as usize;
        let needed = count.saturating_mul(Self::ENTRY_SIZE);
        let body = r.bytes(needed)?;
        r.finish()?;
        let entries = body
            .chunks_exact(Self::ENTRY_SIZE)
            .map(|chunk| {
                let mut key = [0u8; 32];
                key.copy_from_slice(chunk);
                DhtKey(key)
            })
            .collect();
        Ok(Self { recipient, entries })
    }
}

// ============================================================================
// Storable units and store operations
// ============================================================================

/// Anything that can be stored in the DHT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtStorable {
    Fragment(EncryptedFragment),
    Index(IndexRecord),
}

impl DhtStorable {
    pub fn dht_key(&self) -> DhtKey {
        match self {
            DhtStorable::Fragment(f) => f.dht_key(),
            DhtStorable::Index(i) => i.recipient(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DhtStorable::Fragment(_) => "fragment",
            DhtStorable::Index(_) => "index",
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            DhtStorable::Fragment(f) => f.encoded_len(),
            DhtStorable::Index(i) => i.encoded_len(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DhtStorable::Fragment(f) => f.to_bytes(),
            DhtStorable::Index(i) => i.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        match bytes.first() {
            Some(&TYPE_ENCRYPTED) => Ok(DhtStorable::Fragment(EncryptedFragment::from_bytes(bytes)?)),
            Some(&TYPE_INDEX) => Ok(DhtStorable::Index(IndexRecord::from_bytes(bytes)?)),
            Some(&other) => Err(PacketError::UnknownType(other)),
            None => Err(PacketError::Truncated {
                needed: 1,
                available: 0,
            }),
        }
    }
}

impl From<EncryptedFragment> for DhtStorable {
    fn from(f: EncryptedFragment) -> Self {
        DhtStorable::Fragment(f)
    }
}

impl From<IndexRecord> for DhtStorable {
    fn from(i: IndexRecord) -> Self {
        DhtStorable::Index(i)
    }
}

/// Request to store one unit in the DHT, executed by the last relay hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOperation {
    packet: DhtStorable,
}

impl StoreOperation {
    pub const OVERHEAD: usize = 1 + 1 + 4;

    pub fn new(packet: DhtStorable) -> Self {
        Self { packet }
    }

    pub fn packet(&self) -> &DhtStorable {
        &self.packet
    }

    pub fn into_packet(self) -> DhtStorable {
        self.packet
    }

    pub fn encoded_len(&self) -> usize {
        Self::OVERHEAD + self.packet.encoded_len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        put_header(&mut out, TYPE_STORE);
        put_prefixed(&mut out, &self.packet.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        r.header(TYPE_STORE)?;
        let packet = DhtStorable::from_bytes(r.prefixed()?)?;
        r.finish()?;
        Ok(Self { packet })
    }
}
