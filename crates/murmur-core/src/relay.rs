//! Relay chains.
//!
//! A [`StoreOperation`] sent through `H` relay hops is wrapped in `H` nested
//! [`RelayEnvelope`]s, innermost layer first. Each envelope is addressed to
//! one peer and sealed to that peer's key. Opening it yields a
//! [`RelayLayer`]: how long the peer holds the packet, and either the next
//! envelope to forward or, at the last hop, the store operation to execute.
//!
//! ```text
//! Envelope(peer1) ─open─▶ delay₁, Envelope(peer2) ─open─▶ ... ─▶ delayₕ, StoreOperation
//! ```

use std::time::Duration;

use bytes::BufMut;
use murmur_crypto::{open, seal, EmailDestination, EmailIdentity, SealError, SealedBox, SEAL_OVERHEAD};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::errors::StorageError;
use crate::packet::{PacketError, Reader, StoreOperation, PROTOCOL_VERSION};

const TYPE_RELAY: u8 = b'R';
const RELAY_PURPOSE: &str = "murmur/relay/v1";

const PAYLOAD_STORE: u8 = 0;
const PAYLOAD_FORWARD: u8 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("not enough relay peers: need {needed}, have {available}")]
    NotEnoughPeers { needed: usize, available: usize },

    #[error("relay chain needs at least one hop")]
    NoHops,

    #[error("invalid relay delay range {min:?}..={max:?}")]
    InvalidDelayRange { min: Duration, max: Duration },

    #[error("relay packet: {0}")]
    Packet(#[from] PacketError),
}

impl From<SealError> for RelayError {
    fn from(e: SealError) -> Self {
        RelayError::Packet(PacketError::Seal(e))
    }
}

impl From<RelayError> for StorageError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::NotEnoughPeers { needed, available } => {
                StorageError::NotEnoughPeers { needed, available }
            }
            other => StorageError::RelayChain(other.to_string()),
        }
    }
}

/// A peer willing to forward relay packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayPeer {
    destination: EmailDestination,
}

impl RelayPeer {
    pub fn new(destination: EmailDestination) -> Self {
        Self { destination }
    }

    pub fn destination(&self) -> &EmailDestination {
        &self.destination
    }
}

/// Source of relay peers.
///
/// May return fewer than `count` peers; the chain builder treats that as an
/// error.
pub trait PeerPool: Send + Sync {
    fn select_peers(&self, count: usize) -> Vec<RelayPeer>;
}

/// Fixed set of known relay peers.
///
/// Picks distinct peers while the pool is large enough, then starts
/// reusing them so small pools still produce full-length chains.
#[derive(Debug, Default)]
pub struct StaticPeerPool {
    peers: RwLock<Vec<RelayPeer>>,
}

impl StaticPeerPool {
    pub fn new(peers: Vec<RelayPeer>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    pub fn add(&self, peer: RelayPeer) {
        let mut peers = self.peers.write();
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl PeerPool for StaticPeerPool {
    fn select_peers(&self, count: usize) -> Vec<RelayPeer> {
        let peers = self.peers.read();
        if peers.is_empty() {
            return Vec::new();
        }
        let mut rng = rand::thread_rng();
        let mut selected: Vec<RelayPeer> = peers
            .choose_multiple(&mut rng, count.min(peers.len()))
            .copied()
            .collect();
        selected.shuffle(&mut rng);
        while selected.len() < count {
            if let Some(peer) = peers.choose(&mut rng) {
                selected.push(*peer);
            }
        }
        selected
    }
}

/// What a relay peer does with an opened envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPayload {
    /// Last hop: store the unit in the DHT.
    Store(StoreOperation),
    /// Forward to the next hop.
    Forward(RelayEnvelope),
}

/// Decrypted content of one [`RelayEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLayer {
    pub delay: Duration,
    pub payload: RelayPayload,
}

impl RelayLayer {
    /// delay (ms) + payload kind
    const HEADER_SIZE: usize = 8 + 1;

    fn to_bytes(&self) -> Vec<u8> {
        let (kind, body) = match &self.payload {
            RelayPayload::Store(op) => (PAYLOAD_STORE, op.to_bytes()),
            RelayPayload::Forward(env) => (PAYLOAD_FORWARD, env.to_bytes()),
        };
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + body.len());
        out.put_u64(saturating_millis(self.delay));
        out.put_u8(kind);
        out.extend_from_slice(&body);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        let delay = Duration::from_millis(r.u64()?);
        let payload = match r.u8()? {
            PAYLOAD_STORE => RelayPayload::Store(StoreOperation::from_bytes(r.rest())?),
            PAYLOAD_FORWARD => RelayPayload::Forward(RelayEnvelope::from_bytes(r.rest())?),
            other => {
                return Err(PacketError::Invalid(format!("unknown relay payload kind {other}")))
            }
        };
        Ok(Self { delay, payload })
    }
}

/// One onion layer, addressed to and readable only by `next_hop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    next_hop: EmailDestination,
    sealed: SealedBox,
}

impl RelayEnvelope {
    /// type + version + next hop + sealed length
    const HEADER_SIZE: usize = 1 + 1 + EmailDestination::LEN + 4;

    /// Bytes one layer adds to the payload it wraps.
    pub const LAYER_OVERHEAD: usize = Self::HEADER_SIZE + SEAL_OVERHEAD + RelayLayer::HEADER_SIZE;

    /// Seal `layer` to `peer`.
    pub fn wrap(peer: &RelayPeer, layer: &RelayLayer) -> Result<Self, RelayError> {
        let sealed = seal(peer.destination().kex_pub(), RELAY_PURPOSE, &layer.to_bytes())?;
        Ok(Self {
            next_hop: *peer.destination(),
            sealed,
        })
    }

    /// Decrypt this layer with the identity of the peer it is addressed to.
    pub fn open(&self, identity: &EmailIdentity) -> Result<RelayLayer, RelayError> {
        let plaintext = open(&self.sealed, identity.kex_secret(), RELAY_PURPOSE)?;
        Ok(RelayLayer::from_bytes(&plaintext)?)
    }

    pub fn next_hop(&self) -> &EmailDestination {
        &self.next_hop
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.sealed.encoded_len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.put_u8(TYPE_RELAY);
        out.put_u8(PROTOCOL_VERSION);
        out.extend_from_slice(&self.next_hop.to_bytes());
        let sealed = self.sealed.to_bytes();
        out.put_u32(sealed.len() as u32);
        out.extend_from_slice(&sealed);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut r = Reader::new(bytes);
        r.header(TYPE_RELAY)?;
        let next_hop = EmailDestination::from_bytes(r.bytes(EmailDestination::LEN)?)
            .map_err(|e| PacketError::Invalid(format!("next hop: {e}")))?;
        let sealed = SealedBox::from_bytes(r.prefixed()?)?;
        r.finish()?;
        Ok(Self { next_hop, sealed })
    }
}

/// Builds onion-wrapped relay chains with a random hold time per hop.
#[derive(Debug, Clone, Copy)]
pub struct RelayChainBuilder {
    min_delay: Duration,
    max_delay: Duration,
}

impl RelayChainBuilder {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Result<Self, RelayError> {
        if min_delay > max_delay {
            return Err(RelayError::InvalidDelayRange {
                min: min_delay,
                max: max_delay,
            });
        }
        Ok(Self {
            min_delay,
            max_delay,
        })
    }

    /// Select `hops` peers from `pool` and wrap `op` for them.
    pub fn create<R: Rng>(
        &self,
        op: &StoreOperation,
        pool: &dyn PeerPool,
        hops: usize,
        rng: &mut R,
    ) -> Result<RelayEnvelope, RelayError> {
        let peers = pool.select_peers(hops);
        if peers.len() < hops {
            return Err(RelayError::NotEnoughPeers {
                needed: hops,
                available: peers.len(),
            });
        }
        self.build(op, &peers[..hops], rng)
    }

    /// Wrap `op` so that `peers[0]` receives it first and `peers[last]`
    /// performs the store.
    pub fn build<R: Rng>(
        &self,
        op: &StoreOperation,
        peers: &[RelayPeer],
        rng: &mut R,
    ) -> Result<RelayEnvelope, RelayError> {
        let (first, rest) = peers.split_first().ok_or(RelayError::NoHops)?;

        let mut payload = RelayPayload::Store(op.clone());
        for peer in rest.iter().rev() {
            let layer = RelayLayer {
                delay: self.draw_delay(rng),
                payload,
            };
            payload = RelayPayload::Forward(RelayEnvelope::wrap(peer, &layer)?);
        }
        let layer = RelayLayer {
            delay: self.draw_delay(rng),
            payload,
        };
        RelayEnvelope::wrap(first, &layer)
    }

    fn draw_delay<R: Rng>(&self, rng: &mut R) -> Duration {
        let min = saturating_millis(self.min_delay);
        let max = saturating_millis(self.max_delay);
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

/// Milliseconds as carried on the wire, clamped to `u64::MAX`.
fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
