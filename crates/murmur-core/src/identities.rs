//! Local sender identities.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use murmur_crypto::EmailIdentity;
use parking_lot::RwLock;

/// Looks up the identity that owns a destination.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// `destination` is the bare text form, without a display name.
    async fn get(&self, destination: &str) -> Option<Arc<EmailIdentity>>;
}

/// Identities held in process memory, keyed by destination text.
#[derive(Default)]
pub struct MemoryIdentities {
    identities: RwLock<HashMap<String, Arc<EmailIdentity>>>,
}

impl MemoryIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity and return its destination text.
    pub fn insert(&self, identity: EmailIdentity) -> String {
        let key = identity.destination().to_base64();
        self.identities
            .write()
            .insert(key.clone(), Arc::new(identity));
        key
    }

    pub fn len(&self) -> usize {
        self.identities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.read().is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentities {
    async fn get(&self, destination: &str) -> Option<Arc<EmailIdentity>> {
        self.identities.read().get(destination.trim()).cloned()
    }
}
