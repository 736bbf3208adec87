//! Email identities and destinations.
//!
//! An [`EmailIdentity`] is the private key material a user sends mail as: an
//! Ed25519 key for authenticating outgoing mail and an X25519 key for opening
//! mail sealed to it. The public half is an [`EmailDestination`], which is
//! also the address other users write in their recipient lists.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hash::{derive_id, short_id};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid destination length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("destination is not valid base64")]
    InvalidEncoding,
    #[error("destination signing key is not a valid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Public address of an [`EmailIdentity`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmailDestination {
    sign_pub: [u8; 32],
    kex_pub: [u8; 32],
}

impl EmailDestination {
    /// Length of the binary form.
    pub const LEN: usize = 64;

    /// Length of the text form (unpadded base64 of [`Self::LEN`] bytes).
    pub const ENCODED_LEN: usize = 86;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != Self::LEN {
            return Err(IdentityError::InvalidLength {
                expected: Self::LEN,
                got: bytes.len(),
            });
        }
        let mut sign_pub = [0u8; 32];
        let mut kex_pub = [0u8; 32];
        sign_pub.copy_from_slice(&bytes[..32]);
        kex_pub.copy_from_slice(&bytes[32..]);
        VerifyingKey::from_bytes(&sign_pub).map_err(|_| IdentityError::InvalidPublicKey)?;
        Ok(Self { sign_pub, kex_pub })
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.sign_pub);
        out[32..].copy_from_slice(&self.kex_pub);
        out
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    pub fn sign_pub(&self) -> &[u8; 32] {
        &self.sign_pub
    }

    pub fn kex_pub(&self) -> &[u8; 32] {
        &self.kex_pub
    }

    /// DHT key under which index records for this destination are stored.
    pub fn dht_key(&self) -> [u8; 32] {
        derive_id(&self.to_bytes())
    }
}

impl FromStr for EmailDestination {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != Self::ENCODED_LEN {
            return Err(IdentityError::InvalidLength {
                expected: Self::ENCODED_LEN,
                got: s.len(),
            });
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| IdentityError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for EmailDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for EmailDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmailDestination({})", short_id(&self.dht_key()))
    }
}

/// Private key material for sending and receiving mail.
///
/// Key material is zeroized when the identity is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EmailIdentity {
    #[zeroize(skip)] // SigningKey zeroizes itself
    sign_key: SigningKey,
    #[zeroize(skip)] // StaticSecret zeroizes itself
    kex_key: StaticSecret,
}

impl EmailIdentity {
    pub fn generate() -> Self {
        Self {
            sign_key: SigningKey::generate(&mut OsRng),
            kex_key: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild an identity from a 32-byte Ed25519 seed and a 32-byte X25519 secret.
    pub fn from_bytes(sign_seed: &[u8; 32], kex_secret: &[u8; 32]) -> Self {
        Self {
            sign_key: SigningKey::from_bytes(sign_seed),
            kex_key: StaticSecret::from(*kex_secret),
        }
    }

    pub fn destination(&self) -> EmailDestination {
        EmailDestination {
            sign_pub: self.sign_key.verifying_key().to_bytes(),
            kex_pub: *X25519PublicKey::from(&self.kex_key).as_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    /// X25519 secret used to open boxes sealed to this identity.
    pub fn kex_secret(&self) -> &StaticSecret {
        &self.kex_key
    }
}

impl fmt::Debug for EmailIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailIdentity")
            .field("destination", &self.destination())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature made by the owner of `destination`.
pub fn verify_signature(
    destination: &EmailDestination,
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), IdentityError> {
    let key = VerifyingKey::from_bytes(destination.sign_pub())
        .map_err(|_| IdentityError::InvalidPublicKey)?;
    key.verify_strict(message, &Signature::from_bytes(signature))
        .map_err(|_| IdentityError::InvalidSignature)
}
