//! The outbox processor.
//!
//! A background task that scans the outbox at a fixed interval and sends
//! every pending email. Each cycle runs to completion:
//!
//! 1. If the network is down the cycle does nothing.
//! 2. Otherwise every pending email is handed to the [`RecipientRouter`].
//!    A failure is logged and the cycle moves on to the next email.
//! 3. Listeners are told about each email that was sent completely.
//! 4. The task sleeps for the check interval, or until
//!    [`OutboxProcessor::check_for_email`] or
//!    [`OutboxProcessor::request_shutdown`] wakes it.
//!
//! Failed emails stay in the outbox and are retried from their first
//! recipient on the next cycle.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SharedConfig;
use crate::errors::SendError;
use crate::identities::IdentityStore;
use crate::network::NetworkStatus;
use crate::outbox::{Outbox, OutboxListener};
use crate::relay::PeerPool;
use crate::router::RecipientRouter;
use crate::stats::DispatchStats;
use crate::store::{Dht, RelayQueue, StoreDispatcher};
use crate::types::Email;

/// Collaborators the processor sends through.
#[derive(Clone)]
pub struct OutboxServices {
    pub outbox: Arc<dyn Outbox>,
    pub identities: Arc<dyn IdentityStore>,
    pub dht: Arc<dyn Dht>,
    pub relay_queue: Arc<dyn RelayQueue>,
    pub peers: Arc<dyn PeerPool>,
    pub network: Arc<dyn NetworkStatus>,
}

/// Outcome of one processing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Pending emails seen
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    /// The network was down and nothing was attempted
    pub offline: bool,
}

pub struct OutboxProcessor {
    outbox: Arc<dyn Outbox>,
    network: Arc<dyn NetworkStatus>,
    router: RecipientRouter,
    config: SharedConfig,
    listeners: RwLock<Vec<Arc<dyn OutboxListener>>>,
    /// Fired by `check_for_email`; replaced at the start of every cycle
    wakeup: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<DispatchStats>,
}

impl OutboxProcessor {
    /// Refuses to start with a configuration that could never deliver.
    pub fn new(services: OutboxServices, config: SharedConfig) -> Result<Self, SendError> {
        config
            .read()
            .validate()
            .map_err(|e| SendError::Configuration(e.to_string()))?;

        let stats = Arc::new(DispatchStats::new());
        let dispatcher = StoreDispatcher::new(
            services.dht,
            services.relay_queue,
            services.peers,
            stats.clone(),
        );
        let router = RecipientRouter::new(
            services.outbox.clone(),
            services.identities,
            dispatcher,
            config.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            outbox: services.outbox,
            network: services.network,
            router,
            config,
            listeners: RwLock::new(Vec::new()),
            wakeup: Mutex::new(None),
            shutdown_tx,
            stats,
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn OutboxListener>) {
        self.listeners.write().push(listener);
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn router(&self) -> &RecipientRouter {
        &self.router
    }

    /// Run the processing loop on the tokio runtime.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Process the outbox until shutdown is requested.
    pub async fn run(&self) {
        info!("outbox processor started");
        while !self.is_shutdown_requested() {
            let wakeup = self.arm_wakeup();
            self.run_cycle().await;
            if self.is_shutdown_requested() {
                break;
            }
            self.wait(wakeup).await;
        }
        info!("outbox processor stopped");
    }

    /// One pass over the outbox.
    pub async fn run_cycle(&self) -> CycleSummary {
        DispatchStats::inc(&self.stats.cycles);
        let mut summary = CycleSummary::default();

        if !self.network.is_connected() {
            debug!("network not connected, skipping outbox");
            DispatchStats::inc(&self.stats.offline_cycles);
            summary.offline = true;
            return summary;
        }

        let emails = match self.outbox.pending().await {
            Ok(emails) => emails,
            Err(e) => {
                warn!("cannot read outbox: {e}");
                return summary;
            }
        };
        debug!(count = emails.len(), "processing outgoing emails");

        for email in &emails {
            summary.processed += 1;
            info!(message_id = %email.message_id(), "processing email");
            match self.router.send_email(email).await {
                Ok(()) => {
                    DispatchStats::inc(&self.stats.emails_sent);
                    summary.sent += 1;
                    self.notify_listeners(email).await;
                }
                Err(e) => {
                    DispatchStats::inc(&self.stats.emails_failed);
                    summary.failed += 1;
                    error!(
                        message_id = %email.message_id(),
                        kind = e.kind(),
                        "error sending email: {e}"
                    );
                }
            }
        }
        summary
    }

    /// End the current wait early. Does nothing if the processor is not
    /// waiting and has already been woken this cycle.
    pub fn check_for_email(&self) {
        if let Some(tx) = self.wakeup.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Stop after the current cycle. In-flight sends are not interrupted.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.check_for_email();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn arm_wakeup(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.wakeup.lock() = Some(tx);
        rx
    }

    async fn wait(&self, wakeup: oneshot::Receiver<()>) {
        let interval = self.config.read().check_interval();
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = wakeup => debug!("outbox check requested"),
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn notify_listeners(&self, email: &Email) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.email_sent(email).await;
        }
    }
}
