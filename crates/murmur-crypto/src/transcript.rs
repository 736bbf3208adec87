//! Deterministic tagged transcripts.
//!
//! Signatures in murmur are never computed over ad-hoc concatenations. Every
//! field goes in as `(tag, len, bytes)` after a domain separator, so two
//! different field layouts can never produce the same signing input.

use bytes::{BufMut, BytesMut};

use crate::hash::sha256;

/// Field tags shared by every transcript in the mail protocol.
pub mod tags {
    pub const DOMAIN: u32 = 0;
    pub const MESSAGE_ID: u32 = 1;
    pub const RECIPIENT: u32 = 2;
    pub const CONTENT: u32 = 3;
    pub const SENDER: u32 = 4;
}

#[derive(Clone, Debug)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self {
            buf: BytesMut::with_capacity(256),
        };
        t.append_str(tags::DOMAIN, domain);
        t
    }

    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u64(data.len() as u64);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_u64(&mut self, tag: u32, v: u64) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u64(8);
        self.buf.put_u64(v);
        self
    }

    pub fn append_str(&mut self, tag: u32, s: &str) -> &mut Self {
        self.append_bytes(tag, s.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// SHA-256 of the transcript; this is what gets signed.
    pub fn digest(&self) -> [u8; 32] {
        sha256(&self.buf)
    }
}
