//! Cryptographic building blocks for murmur mail.
//!
//! - [`identity`]: sender identities and the public destinations mail is addressed to
//! - [`sealed`]: anonymous sealed boxes used for fragments and relay layers
//! - [`transcript`]: deterministic input for signatures
//! - [`hash`]: SHA-256 helpers and DHT key derivation

#![forbid(unsafe_code)]

pub mod hash;
pub mod transcript;
pub mod identity;
pub mod sealed;

pub use identity::{verify_signature, EmailDestination, EmailIdentity, IdentityError};
pub use sealed::{open, seal, SealError, SealedBox, SEAL_OVERHEAD};

#[cfg(test)]
mod proptests;
