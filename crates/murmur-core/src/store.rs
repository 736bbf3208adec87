//! Getting storable units into the DHT.
//!
//! [`StoreDispatcher`] either stores a unit directly or, when relay hops are
//! configured, hands redundant onion-wrapped copies to the relay queue. The
//! [`Dht`] and [`RelayQueue`] traits are the seams to the network; the
//! in-memory versions here back the tests and the demo.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{DispatchConfig, MAX_RELAY_REDUNDANCY};
use crate::errors::StorageError;
use crate::packet::{DhtStorable, StoreOperation};
use crate::relay::{PeerPool, RelayChainBuilder, RelayEnvelope};
use crate::stats::DispatchStats;
use crate::types::DhtKey;

/// Distributed hash table store.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Store `packet`, returning once the DHT reports success.
    async fn store(&self, packet: &DhtStorable) -> Result<(), StorageError>;
}

/// Queue of relay packets waiting for the relay transmitter.
#[async_trait]
pub trait RelayQueue: Send + Sync {
    async fn append(&self, envelope: RelayEnvelope) -> Result<(), StorageError>;
}

// ============================================================================
// In-memory DHT
// ============================================================================

#[derive(Debug, Default)]
struct DhtState {
    log: Vec<DhtStorable>,
    by_key: HashMap<DhtKey, Vec<DhtStorable>>,
    /// Stores left before failures start; `None` never fails
    fail_after: Option<usize>,
}

/// DHT kept in process memory.
///
/// Index records for the same recipient share a key, so each key holds a
/// list of units.
#[derive(Debug, Default)]
pub struct MemoryDht {
    state: Mutex<DhtState>,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `successes` more stores succeed, then fail every store after.
    pub fn fail_after(&self, successes: usize) {
        self.state.lock().fail_after = Some(successes);
    }

    pub fn heal(&self) {
        self.state.lock().fail_after = None;
    }

    /// Every stored unit, in store order.
    pub fn stored(&self) -> Vec<DhtStorable> {
        self.state.lock().log.clone()
    }

    pub fn get(&self, key: &DhtKey) -> Vec<DhtStorable> {
        self.state
            .lock()
            .by_key
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().log.is_empty()
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn store(&self, packet: &DhtStorable) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        match state.fail_after {
            Some(0) => return Err(StorageError::Dht("injected store failure".into())),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        state.log.push(packet.clone());
        state
            .by_key
            .entry(packet.dht_key())
            .or_default()
            .push(packet.clone());
        Ok(())
    }
}

// ============================================================================
// In-memory relay queue
// ============================================================================

/// Relay queue kept in process memory, optionally bounded.
#[derive(Debug, Default)]
pub struct MemoryRelayQueue {
    packets: Mutex<Vec<RelayEnvelope>>,
    capacity: Option<usize>,
}

impl MemoryRelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            packets: Mutex::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    pub fn packets(&self) -> Vec<RelayEnvelope> {
        self.packets.lock().clone()
    }

    /// Remove and return everything queued so far.
    pub fn drain(&self) -> Vec<RelayEnvelope> {
        std::mem::take(&mut *self.packets.lock())
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }
}

#[async_trait]
impl RelayQueue for MemoryRelayQueue {
    async fn append(&self, envelope: RelayEnvelope) -> Result<(), StorageError> {
        let mut packets = self.packets.lock();
        if let Some(capacity) = self.capacity {
            if packets.len() >= capacity {
                return Err(StorageError::QueueFull { capacity });
            }
        }
        packets.push(envelope);
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Sends storable units to the DHT, directly or through relay chains.
pub struct StoreDispatcher {
    dht: Arc<dyn Dht>,
    relay_queue: Arc<dyn RelayQueue>,
    peers: Arc<dyn PeerPool>,
    stats: Arc<DispatchStats>,
}

impl StoreDispatcher {
    pub fn new(
        dht: Arc<dyn Dht>,
        relay_queue: Arc<dyn RelayQueue>,
        peers: Arc<dyn PeerPool>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            dht,
            relay_queue,
            peers,
            stats,
        }
    }

    /// Store `packet` according to `config`.
    ///
    /// With `store_hops == 0` this waits for the DHT. Otherwise it builds
    /// `relay_redundancy` independent chains of `store_hops` peers each and
    /// returns once all of them are queued; delivery happens later.
    pub async fn send(
        &self,
        packet: DhtStorable,
        config: &DispatchConfig,
    ) -> Result<(), StorageError> {
        if config.store_hops == 0 {
            trace!(key = %packet.dht_key(), kind = packet.kind(), "storing directly");
            self.dht.store(&packet).await?;
            DispatchStats::inc(&self.stats.direct_stores);
            return Ok(());
        }

        let envelopes = self.build_envelopes(packet, config)?;
        debug!(
            count = envelopes.len(),
            hops = config.store_hops,
            "queueing relay envelopes"
        );
        for envelope in envelopes {
            self.relay_queue.append(envelope).await?;
            DispatchStats::inc(&self.stats.relay_envelopes);
        }
        Ok(())
    }

    fn build_envelopes(
        &self,
        packet: DhtStorable,
        config: &DispatchConfig,
    ) -> Result<Vec<RelayEnvelope>, StorageError> {
        let builder = RelayChainBuilder::new(config.relay_min_delay(), config.relay_max_delay())?;
        let op = StoreOperation::new(packet);
        let hops = config.store_hops as usize;
        let mut rng = rand::thread_rng();
        let mut envelopes =
            Vec::with_capacity(config.relay_redundancy.min(MAX_RELAY_REDUNDANCY) as usize);
        for _ in 0..config.relay_redundancy {
            envelopes.push(builder.create(&op, self.peers.as_ref(), hops, &mut rng)?);
        }
        Ok(envelopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IndexRecord;
    use crate::relay::{RelayPayload, RelayPeer, StaticPeerPool};
    use murmur_crypto::EmailIdentity;
    use std::time::Duration;

    fn index_unit() -> DhtStorable {
        IndexRecord::new(&EmailIdentity::generate().destination()).into()
    }

    fn dispatcher(
        peers: Arc<StaticPeerPool>,
    ) -> (StoreDispatcher, Arc<MemoryDht>, Arc<MemoryRelayQueue>, Arc<DispatchStats>) {
        let dht = Arc::new(MemoryDht::new());
        let queue = Arc::new(MemoryRelayQueue::new());
        let stats = Arc::new(DispatchStats::new());
        let d = StoreDispatcher::new(dht.clone(), queue.clone(), peers, stats.clone());
        (d, dht, queue, stats)
    }

    #[tokio::test]
    async fn direct_store() {
        let (d, dht, queue, stats) = dispatcher(Arc::new(StaticPeerPool::default()));
        let unit = index_unit();
        d.send(unit.clone(), &DispatchConfig::default()).await.unwrap();
        assert_eq!(dht.stored(), vec![unit.clone()]);
        assert_eq!(dht.get(&unit.dht_key()), vec![unit]);
        assert!(queue.is_empty());
        assert_eq!(stats.snapshot().direct_stores, 1);
    }

    #[tokio::test]
    async fn relayed_store_queues_redundant_chains() {
        let ids: Vec<EmailIdentity> = (0..3).map(|_| EmailIdentity::generate()).collect();
        let pool = StaticPeerPool::new(ids.iter().map(|i| RelayPeer::new(i.destination())).collect());
        let (d, dht, queue, stats) = dispatcher(Arc::new(pool));
        let config = DispatchConfig {
            store_hops: 1,
            relay_redundancy: 3,
            relay_min_delay_secs: 1,
            relay_max_delay_secs: 2,
            ..Default::default()
        };
        let unit = index_unit();
        d.send(unit.clone(), &config).await.unwrap();

        assert!(dht.is_empty());
        let packets = queue.packets();
        assert_eq!(packets.len(), 3);
        assert_eq!(stats.snapshot().relay_envelopes, 3);
        for env in packets {
            let owner = ids
                .iter()
                .find(|i| &i.destination() == env.next_hop())
                .unwrap();
            let layer = env.open(owner).unwrap();
            assert!(layer.delay >= Duration::from_secs(1) && layer.delay <= Duration::from_secs(2));
            assert_eq!(layer.payload, RelayPayload::Store(StoreOperation::new(unit.clone())));
        }
    }

    #[tokio::test]
    async fn relayed_store_without_peers_fails() {
        let (d, _, queue, _) = dispatcher(Arc::new(StaticPeerPool::default()));
        let config = DispatchConfig {
            store_hops: 2,
            ..Default::default()
        };
        let err = d.send(index_unit(), &config).await.unwrap_err();
        assert_eq!(err, StorageError::NotEnoughPeers { needed: 2, available: 0 });
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dht_failure_injection() {
        let dht = MemoryDht::new();
        dht.fail_after(1);
        assert!(dht.store(&index_unit()).await.is_ok());
        assert!(matches!(dht.store(&index_unit()).await, Err(StorageError::Dht(_))));
        dht.heal();
        assert!(dht.store(&index_unit()).await.is_ok());
        assert_eq!(dht.len(), 2);
    }

    #[tokio::test]
    async fn bounded_queue_reports_full() {
        let ids: Vec<EmailIdentity> = (0..2).map(|_| EmailIdentity::generate()).collect();
        let pool = StaticPeerPool::new(ids.iter().map(|i| RelayPeer::new(i.destination())).collect());
        let queue = Arc::new(MemoryRelayQueue::with_capacity(2));
        let d = StoreDispatcher::new(
            Arc::new(MemoryDht::new()),
            queue.clone(),
            Arc::new(pool),
            Arc::new(DispatchStats::new()),
        );
        let config = DispatchConfig {
            store_hops: 1,
            relay_redundancy: 3,
            ..Default::default()
        };
        assert_eq!(
            d.send(index_unit(), &config).await,
            Err(StorageError::QueueFull { capacity: 2 })
        );
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }
}
