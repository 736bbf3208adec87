//! murmur-demo: send one email through an in-memory network and report what
//! reached the DHT or the relay queue.
//!
//! Usage: `murmur-demo [config.toml]`. `MURMUR_*` environment variables
//! override the file, e.g. `MURMUR_STORE_HOPS=2`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use murmur_core::identities::MemoryIdentities;
use murmur_core::network::ConnectivityFlag;
use murmur_core::outbox::MemoryOutbox;
use murmur_core::relay::{RelayPeer, StaticPeerPool};
use murmur_core::store::{MemoryDht, MemoryRelayQueue};
use murmur_core::{DispatchConfig, Email, OutboxListener, OutboxProcessor, OutboxServices};
use murmur_crypto::EmailIdentity;

/// Moves sent mail out of the outbox and wakes `main`.
struct SentFolder {
    outbox: Arc<MemoryOutbox>,
    done: Arc<Notify>,
}

#[async_trait]
impl OutboxListener for SentFolder {
    async fn email_sent(&self, email: &Email) {
        self.outbox.remove(&email.message_id());
        self.done.notify_one();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = DispatchConfig::load(config_path.as_deref()).context("loading configuration")?;
    info!(hops = config.store_hops, redundancy = config.relay_redundancy, "configuration loaded");

    let outbox = Arc::new(MemoryOutbox::new());
    let identities = Arc::new(MemoryIdentities::new());
    let dht = Arc::new(MemoryDht::new());
    let relay_queue = Arc::new(MemoryRelayQueue::new());
    let peers = Arc::new(StaticPeerPool::default());
    for _ in 0..5 {
        peers.add(RelayPeer::new(EmailIdentity::generate().destination()));
    }

    let alice = identities.insert(EmailIdentity::generate());
    let bob = EmailIdentity::generate().destination();
    let carol = EmailIdentity::generate().destination();

    let email = Email::new(
        Some(format!("Alice <{alice}>")),
        vec![format!("Bob <{bob}>"), carol.to_base64()],
        b"Subject: hello\r\n\r\nSent without a server.".to_vec(),
    );
    let message_id = email.message_id();
    outbox.add(email);

    let services = OutboxServices {
        outbox: outbox.clone(),
        identities,
        dht: dht.clone(),
        relay_queue: relay_queue.clone(),
        peers,
        network: Arc::new(ConnectivityFlag::new(true)),
    };
    let processor = Arc::new(
        OutboxProcessor::new(services, config.into_shared()).context("starting outbox processor")?,
    );
    let done = Arc::new(Notify::new());
    processor.add_listener(Arc::new(SentFolder {
        outbox: outbox.clone(),
        done: done.clone(),
    }));

    let task = processor.clone().spawn();
    processor.check_for_email();

    let sent = tokio::time::timeout(Duration::from_secs(30), done.notified())
        .await
        .is_ok();
    for status in outbox.status_history(&message_id) {
        println!("STATUS={status}");
    }
    println!("SENT={sent}");
    println!("DHT_UNITS={}", dht.len());
    println!("RELAY_PACKETS={}", relay_queue.len());

    let stats = processor.stats().snapshot();
    info!(?stats, "dispatch statistics");

    processor.request_shutdown();
    task.await.context("outbox processor task")?;
    Ok(())
}
