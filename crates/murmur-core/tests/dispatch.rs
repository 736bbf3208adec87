//! End-to-end tests of the outbox processor against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use murmur_core::fragment::reassemble;
use murmur_core::identities::MemoryIdentities;
use murmur_core::network::ConnectivityFlag;
use murmur_core::outbox::MemoryOutbox;
use murmur_core::packet::DhtStorable;
use murmur_core::relay::{RelayEnvelope, RelayPayload, RelayPeer, StaticPeerPool};
use murmur_core::store::{MemoryDht, MemoryRelayQueue};
use murmur_core::types::DhtKey;
use murmur_core::{
    DispatchConfig, Email, EmailStatus, MessageId, OutboxListener, OutboxProcessor,
    OutboxServices, SharedConfig,
};
use murmur_crypto::{EmailDestination, EmailIdentity};
use parking_lot::Mutex;

struct Harness {
    processor: Arc<OutboxProcessor>,
    outbox: Arc<MemoryOutbox>,
    dht: Arc<MemoryDht>,
    queue: Arc<MemoryRelayQueue>,
    identities: Arc<MemoryIdentities>,
    network: Arc<ConnectivityFlag>,
    config: SharedConfig,
    listener: Arc<RecordingListener>,
}

struct RecordingListener {
    sent: Mutex<Vec<MessageId>>,
    outbox: Option<Arc<MemoryOutbox>>,
}

#[async_trait]
impl OutboxListener for RecordingListener {
    async fn email_sent(&self, email: &Email) {
        self.sent.lock().push(email.message_id());
        if let Some(outbox) = &self.outbox {
            outbox.remove(&email.message_id());
        }
    }
}

impl RecordingListener {
    fn sent(&self) -> Vec<MessageId> {
        self.sent.lock().clone()
    }
}

fn harness(config: DispatchConfig, peers: Vec<RelayPeer>, remove_sent: bool) -> Harness {
    let outbox = Arc::new(MemoryOutbox::new());
    let dht = Arc::new(MemoryDht::new());
    let queue = Arc::new(MemoryRelayQueue::new());
    let identities = Arc::new(MemoryIdentities::new());
    let network = Arc::new(ConnectivityFlag::new(true));
    let config = config.into_shared();

    let services = OutboxServices {
        outbox: outbox.clone(),
        identities: identities.clone(),
        dht: dht.clone(),
        relay_queue: queue.clone(),
        peers: Arc::new(StaticPeerPool::new(peers)),
        network: network.clone(),
    };
    let processor = Arc::new(OutboxProcessor::new(services, config.clone()).unwrap());
    let listener = Arc::new(RecordingListener {
        sent: Mutex::new(Vec::new()),
        outbox: remove_sent.then(|| outbox.clone()),
    });
    processor.add_listener(listener.clone());

    Harness {
        processor,
        outbox,
        dht,
        queue,
        identities,
        network,
        config,
        listener,
    }
}

fn direct() -> Harness {
    harness(DispatchConfig::default(), Vec::new(), false)
}

/// Fetch, decrypt and reassemble what the DHT holds for `recipient`.
fn read_mailbox(dht: &MemoryDht, recipient: &EmailIdentity) -> Vec<murmur_core::fragment::ReassembledEmail> {
    let key = DhtKey(recipient.destination().dht_key());
    dht.get(&key)
        .into_iter()
        .map(|unit| {
            let DhtStorable::Index(index) = unit else {
                panic!("expected index record under recipient key");
            };
            let fragments: Vec<_> = index
                .entries()
                .iter()
                .map(|entry| match dht.get(entry).as_slice() {
                    [DhtStorable::Fragment(f)] => f.decrypt(recipient).unwrap(),
                    other => panic!("expected one fragment, got {other:?}"),
                })
                .collect();
            reassemble(&fragments).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn direct_send_stores_fragments_and_index() {
    let h = direct();
    let alice = EmailIdentity::generate();
    let alice_dest = alice.destination();
    let alice_text = h.identities.insert(alice);
    let bob = EmailIdentity::generate();
    let bob_text = bob.destination().to_base64();

    let content: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    let email = Email::new(
        Some(format!("Alice <{alice_text}>")),
        vec![format!("Bob <{bob_text}>")],
        content.clone(),
    );
    h.outbox.add(email.clone());

    let summary = h.processor.run_cycle().await;
    assert_eq!(summary.sent, 1);

    // 70 000 bytes need three fragments, plus one index record
    assert_eq!(h.dht.len(), 4);
    assert!(h.queue.is_empty());

    let received = read_mailbox(&h.dht, &bob);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].message_id(), email.message_id());
    assert_eq!(received[0].content().as_ref(), content.as_slice());
    received[0].verify(&bob_text, &alice_dest).unwrap();

    assert_eq!(
        h.outbox.status_history(&email.message_id()),
        vec![EmailStatus::Sending, EmailStatus::SentTo { sent: 1, total: 1 }]
    );
    assert_eq!(h.listener.sent(), vec![email.message_id()]);
}

#[tokio::test]
async fn relayed_send_wraps_every_unit() {
    let relays: Vec<EmailIdentity> = (0..4).map(|_| EmailIdentity::generate()).collect();
    let peers = relays.iter().map(|r| RelayPeer::new(r.destination())).collect();
    let config = DispatchConfig {
        store_hops: 2,
        relay_redundancy: 3,
        relay_min_delay_secs: 10,
        relay_max_delay_secs: 20,
        ..Default::default()
    };
    let h = harness(config, peers, false);
    let bob = EmailIdentity::generate();
    let email = Email::anonymous(vec![bob.destination().to_base64()], b"through the relays".to_vec());
    h.outbox.add(email.clone());

    assert_eq!(h.processor.run_cycle().await.sent, 1);
    assert!(h.dht.is_empty());

    // one fragment and one index, three chains each
    let envelopes = h.queue.drain();
    assert_eq!(envelopes.len(), 6);
    assert_eq!(h.processor.stats().snapshot().relay_envelopes, 6);

    let mut delivered = Vec::new();
    let mut chain_delays = Vec::new();
    for envelope in envelopes {
        let mut current: RelayEnvelope = envelope;
        let mut layers = 0;
        let mut delays = Vec::new();
        loop {
            let owner = relays
                .iter()
                .find(|r| &r.destination() == current.next_hop())
                .expect("envelope addressed to a known relay");
            let layer = current.open(owner).unwrap();
            layers += 1;
            assert!(layer.delay >= Duration::from_secs(10));
            assert!(layer.delay <= Duration::from_secs(20));
            delays.push(layer.delay);
            match layer.payload {
                RelayPayload::Forward(next) => current = next,
                RelayPayload::Store(op) => {
                    delivered.push(op.into_packet());
                    break;
                }
            }
        }
        assert_eq!(layers, 2);
        chain_delays.push(delays);
    }

    // every layer of every chain draws its own delay
    let mut all: Vec<Duration> = chain_delays.iter().flatten().copied().collect();
    all.sort();
    all.dedup();
    assert!(all.len() > 2, "{chain_delays:?}");

    let fragments = delivered
        .iter()
        .filter(|u| matches!(u, DhtStorable::Fragment(_)))
        .count();
    let indexes = delivered
        .iter()
        .filter(|u| matches!(u, DhtStorable::Index(_)))
        .count();
    assert_eq!((fragments, indexes), (3, 3));

    for unit in &delivered {
        if let DhtStorable::Fragment(f) = unit {
            let plain = f.decrypt(&bob).unwrap();
            let back = reassemble(&[plain]).unwrap();
            assert_eq!(back.content().as_ref(), b"through the relays");
        }
    }
}

#[tokio::test]
async fn external_recipients_go_to_gateway() {
    let gateway = EmailIdentity::generate();
    let config = DispatchConfig {
        gateway_enabled: true,
        gateway_destination: gateway.destination().to_base64(),
        ..Default::default()
    };
    let h = harness(config, Vec::new(), false);
    let a = EmailIdentity::generate();
    let b = EmailIdentity::generate();
    let email = Email::anonymous(
        vec![
            a.destination().to_base64(),
            b.destination().to_base64(),
            "Carol <carol@example.com>".into(),
        ],
        b"hello".to_vec(),
    );
    h.outbox.add(email.clone());

    assert_eq!(h.processor.run_cycle().await.sent, 1);
    assert_eq!(
        h.outbox.status_history(&email.message_id()),
        vec![
            EmailStatus::Sending,
            EmailStatus::SentTo { sent: 1, total: 3 },
            EmailStatus::SentTo { sent: 2, total: 3 },
            EmailStatus::Sent,
        ]
    );
    assert_eq!(read_mailbox(&h.dht, &a).len(), 1);
    assert_eq!(read_mailbox(&h.dht, &b).len(), 1);
    assert_eq!(read_mailbox(&h.dht, &gateway).len(), 1);
    assert_eq!(h.listener.sent().len(), 1);
}

#[tokio::test]
async fn disabled_gateway_fails_after_natives() {
    let h = direct();
    let a = EmailIdentity::generate();
    let b = EmailIdentity::generate();
    let email = Email::anonymous(
        vec![
            a.destination().to_base64(),
            "carol@example.com".into(),
            b.destination().to_base64(),
        ],
        b"hello".to_vec(),
    );
    h.outbox.add(email.clone());

    let summary = h.processor.run_cycle().await;
    assert_eq!((summary.sent, summary.failed), (0, 1));
    assert_eq!(
        h.outbox.status_history(&email.message_id()),
        vec![
            EmailStatus::Sending,
            EmailStatus::SentTo { sent: 1, total: 3 },
            EmailStatus::SentTo { sent: 3, total: 3 },
            EmailStatus::GatewayDisabled,
        ]
    );
    assert_eq!(read_mailbox(&h.dht, &a).len(), 1);
    assert_eq!(read_mailbox(&h.dht, &b).len(), 1);
    assert!(h.listener.sent().is_empty());
}

#[tokio::test]
async fn invalid_recipient_aborts_email() {
    let h = direct();
    let later = EmailIdentity::generate();
    let email = Email::anonymous(
        vec!["Dave <not-a-destination>".into(), later.destination().to_base64()],
        b"hello".to_vec(),
    );
    h.outbox.add(email.clone());

    let summary = h.processor.run_cycle().await;
    assert_eq!(summary.failed, 1);
    assert_eq!(
        h.outbox.status_history(&email.message_id()),
        vec![
            EmailStatus::Sending,
            EmailStatus::InvalidRecipient("Dave <not-a-destination>".into()),
        ]
    );
    assert!(h.dht.is_empty());
    assert!(h.listener.sent().is_empty());
}

#[tokio::test]
async fn low_order_recipient_key_is_an_invalid_address() {
    let h = direct();
    let mut bytes = EmailIdentity::generate().destination().to_bytes();
    bytes[32..].fill(0);
    let weak = EmailDestination::from_bytes(&bytes).unwrap().to_base64();
    let recipient = format!("Eve <{weak}>");
    let email = Email::anonymous(vec![recipient.clone()], b"hello".to_vec());
    h.outbox.add(email.clone());

    assert_eq!(h.processor.run_cycle().await.failed, 1);
    assert_eq!(
        h.outbox.status_history(&email.message_id()),
        vec![EmailStatus::Sending, EmailStatus::InvalidRecipient(recipient)]
    );
    assert!(h.dht.is_empty());
}

#[tokio::test]
async fn one_failed_email_does_not_stop_the_cycle() {
    let h = direct();
    let bob = EmailIdentity::generate();
    let bad = Email::anonymous(vec!["garbage".into()], b"x".to_vec());
    let good = Email::anonymous(vec![bob.destination().to_base64()], b"y".to_vec());
    h.outbox.add(bad);
    h.outbox.add(good.clone());

    let summary = h.processor.run_cycle().await;
    assert_eq!((summary.processed, summary.sent, summary.failed), (2, 1, 1));
    assert_eq!(h.listener.sent(), vec![good.message_id()]);
}

#[tokio::test]
async fn unknown_sender_is_rejected_without_status() {
    let h = direct();
    let stranger = EmailIdentity::generate();
    let bob = EmailIdentity::generate();
    let email = Email::new(
        Some(stranger.destination().to_base64()),
        vec![bob.destination().to_base64()],
        b"hi".to_vec(),
    );
    h.outbox.add(email.clone());

    assert_eq!(h.processor.run_cycle().await.failed, 1);
    assert!(h.outbox.status_history(&email.message_id()).is_empty());
    assert!(h.dht.is_empty());
    assert!(h.listener.sent().is_empty());
}

#[tokio::test]
async fn partial_failure_retries_from_first_recipient() {
    let h = harness(DispatchConfig::default(), Vec::new(), true);
    let a = EmailIdentity::generate();
    let b = EmailIdentity::generate();
    let email = Email::anonymous(
        vec![a.destination().to_base64(), b.destination().to_base64()],
        b"hello".to_vec(),
    );
    h.outbox.add(email.clone());

    // fragment + index for the first recipient, then the DHT gives out
    h.dht.fail_after(2);
    assert_eq!(h.processor.run_cycle().await.failed, 1);
    let history = h.outbox.status_history(&email.message_id());
    assert_eq!(history[..2], [EmailStatus::Sending, EmailStatus::SentTo { sent: 1, total: 2 }]);
    assert!(matches!(history[2], EmailStatus::SendFailed(_)));
    assert_eq!(h.outbox.len(), 1);

    h.dht.heal();
    assert_eq!(h.processor.run_cycle().await.sent, 1);
    assert_eq!(read_mailbox(&h.dht, &a).len(), 2);
    assert_eq!(read_mailbox(&h.dht, &b).len(), 1);
    assert!(h.outbox.is_empty());

    // sent emails leave the outbox, so nothing is sent twice
    assert_eq!(h.processor.run_cycle().await.processed, 0);
    assert_eq!(h.listener.sent(), vec![email.message_id()]);
}

#[tokio::test]
async fn offline_cycle_stores_nothing() {
    let h = direct();
    let bob = EmailIdentity::generate();
    h.outbox.add(Email::anonymous(vec![bob.destination().to_base64()], b"x".to_vec()));
    h.network.set_connected(false);

    assert!(h.processor.run_cycle().await.offline);
    assert!(h.dht.is_empty());

    h.network.set_connected(true);
    assert_eq!(h.processor.run_cycle().await.sent, 1);
}

#[tokio::test]
async fn settings_changes_apply_to_next_send() {
    let h = direct();
    let bob = EmailIdentity::generate();
    let email = Email::anonymous(vec![bob.destination().to_base64()], b"x".to_vec());
    h.outbox.add(email.clone());

    h.config.write().store_hops = murmur_core::budget::max_hops() + 1;
    assert_eq!(h.processor.run_cycle().await.failed, 1);
    match h.outbox.status(&email.message_id()) {
        Some(EmailStatus::SendFailed(detail)) => assert!(detail.contains("configuration")),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(h.dht.is_empty());
}

#[tokio::test]
async fn check_for_email_wakes_the_loop() {
    let h = harness(DispatchConfig::default(), Vec::new(), true);
    let task = h.processor.clone().spawn();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.processor.stats().snapshot().cycles == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let bob = EmailIdentity::generate();
    h.outbox.add(Email::anonymous(vec![bob.destination().to_base64()], b"now".to_vec()));
    h.processor.check_for_email();

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.listener.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("email sent long before the ten minute interval");
    assert_eq!(read_mailbox(&h.dht, &bob).len(), 1);

    h.processor.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("processor stops promptly")
        .unwrap();
    assert!(h.processor.is_shutdown_requested());
}

#[tokio::test]
async fn offline_loop_still_wakes_on_request() {
    let h = direct();
    h.network.set_connected(false);
    let bob = EmailIdentity::generate();
    h.outbox.add(Email::anonymous(vec![bob.destination().to_base64()], b"x".to_vec()));
    let task = h.processor.clone().spawn();

    for target in 1..=2u64 {
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.processor.stats().snapshot().cycles < target {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cycle started");
        h.processor.check_for_email();
    }

    let snapshot = h.processor.stats().snapshot();
    assert!(snapshot.offline_cycles >= 2);
    assert!(h.dht.is_empty());
    assert!(h.queue.is_empty());

    h.processor.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("processor stops promptly")
        .unwrap();
}
