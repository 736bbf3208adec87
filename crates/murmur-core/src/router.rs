//! Per-recipient delivery of one email.

use std::sync::Arc;

use murmur_crypto::{EmailDestination, EmailIdentity, SealError};
use tracing::{debug, error, info};

use crate::budget;
use crate::config::{DispatchConfig, SharedConfig};
use crate::errors::SendError;
use crate::fragment::create_fragments;
use crate::identities::IdentityStore;
use crate::outbox::{EmailStatus, Outbox};
use crate::packet::{EncryptedFragment, IndexRecord, PacketError, MAX_DATAGRAM_SIZE};
use crate::store::StoreDispatcher;
use crate::types::{extract_destination, Email, RecipientAddress};

/// Sends an email to each of its recipients in turn.
///
/// Native recipients get their own encrypted fragments and index record.
/// External recipients are collected and the email goes once to the mail
/// gateway on their behalf. The first failure stops the recipient loop;
/// recipients already handled stay delivered.
pub struct RecipientRouter {
    outbox: Arc<dyn Outbox>,
    identities: Arc<dyn IdentityStore>,
    dispatcher: StoreDispatcher,
    config: SharedConfig,
}

impl RecipientRouter {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        identities: Arc<dyn IdentityStore>,
        dispatcher: StoreDispatcher,
        config: SharedConfig,
    ) -> Self {
        Self {
            outbox,
            identities,
            dispatcher,
            config,
        }
    }

    pub async fn send_email(&self, email: &Email) -> Result<(), SendError> {
        let identity = match email.sender() {
            None => None,
            Some(sender) => {
                let destination = extract_destination(sender);
                match self.identities.get(destination).await {
                    Some(identity) => Some(identity),
                    None => {
                        error!(sender = destination, "no identity for sender address");
                        return Err(SendError::UnknownSender(destination.to_string()));
                    }
                }
            }
        };
        let identity = identity.as_deref();

        self.outbox.set_status(email, EmailStatus::Sending).await;

        let total = email.recipients().len();
        let mut has_external = false;
        for (position, recipient) in email.recipients().iter().enumerate() {
            match RecipientAddress::classify(recipient) {
                RecipientAddress::External(address) => {
                    debug!(recipient = address, "deferring external recipient to the gateway");
                    has_external = true;
                }
                RecipientAddress::Native(_) => {
                    self.send_to_one(identity, recipient, email).await?;
                    self.outbox
                        .set_status(
                            email,
                            EmailStatus::SentTo {
                                sent: position + 1,
                                total,
                            },
                        )
                        .await;
                }
            }
        }

        if has_external {
            let (enabled, gateway) = {
                let config = self.config.read();
                (config.gateway_enabled, config.gateway_destination.clone())
            };
            if !enabled {
                self.outbox.set_status(email, EmailStatus::GatewayDisabled).await;
                return Err(SendError::GatewayDisabled);
            }
            debug!(message_id = %email.message_id(), "sending to the mail gateway");
            self.send_to_one(identity, &gateway, email).await?;
            self.outbox.set_status(email, EmailStatus::Sent).await;
        }

        Ok(())
    }

    /// Fragment, encrypt and store `email` for one native recipient.
    ///
    /// `recipient` is the address as written, display name included.
    /// Failures set the matching outbox status before they are returned.
    pub async fn send_to_one(
        &self,
        identity: Option<&EmailIdentity>,
        recipient: &str,
        email: &Email,
    ) -> Result<(), SendError> {
        let config = self.config.read().clone();
        let address = extract_destination(recipient);
        info!(
            message_id = %email.message_id(),
            recipient = address,
            hops = config.store_hops,
            "sending email to recipient"
        );

        let result = self.deliver(identity, recipient, email, &config).await;
        if let Err(e) = &result {
            error!(recipient = address, kind = e.kind(), "error sending email: {e}");
            let status = match e {
                SendError::Security { address, .. } => EmailStatus::InvalidRecipient(address.clone()),
                SendError::MessageConstruction(detail) => EmailStatus::PacketError(detail.clone()),
                other => EmailStatus::SendFailed(other.to_string()),
            };
            self.outbox.set_status(email, status).await;
        }
        result
    }

    async fn deliver(
        &self,
        identity: Option<&EmailIdentity>,
        recipient: &str,
        email: &Email,
        config: &DispatchConfig,
    ) -> Result<(), SendError> {
        let address = extract_destination(recipient);
        let destination: EmailDestination =
            address.parse().map_err(|e: murmur_crypto::IdentityError| SendError::Security {
                address: recipient.to_string(),
                reason: e.to_string(),
            })?;

        let max_size = budget::max_fragment_size(config.store_hops)?;
        let fragments = create_fragments(email, identity, address, max_size)?;

        let mut index = IndexRecord::new(&destination);
        let mut encrypted = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            let packet = EncryptedFragment::encrypt(fragment, &destination).map_err(|e| match e {
                PacketError::Seal(SealError::WeakKey) => SendError::Security {
                    address: recipient.to_string(),
                    reason: e.to_string(),
                },
                other => SendError::MessageConstruction(other.to_string()),
            })?;
            index.put(&packet);
            encrypted.push(packet);
        }

        let mut index_size = index.encoded_len();
        if config.store_hops > 0 {
            index_size += budget::relay_overhead(config.store_hops);
        }
        if index_size > MAX_DATAGRAM_SIZE {
            return Err(SendError::MessageConstruction(format!(
                "index record for {} fragments does not fit in a datagram",
                encrypted.len()
            )));
        }

        debug!(
            fragments = encrypted.len(),
            recipient_key = %index.recipient(),
            "storing fragments"
        );
        for packet in encrypted {
            self.dispatcher.send(packet.into(), config).await?;
        }
        self.dispatcher.send(index.into(), config).await?;
        Ok(())
    }
}
