//! Anonymous sealed boxes.
//!
//! A box is sealed to an X25519 public key with a fresh ephemeral key, so it
//! carries nothing that identifies the sender. Keys come from
//! HKDF-SHA256(salt, shared secret) with a purpose label, and the payload is
//! encrypted with ChaCha20-Poly1305. The purpose label means a box sealed as
//! an email fragment cannot be opened as a relay layer and vice versa.
//!
//! Layout: `ephemeral_pub (32) || salt (24) || ciphertext+tag`.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

const EPH_LEN: usize = 32;
const SALT_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// Bytes a sealed box adds on top of its plaintext.
pub const SEAL_OVERHEAD: usize = EPH_LEN + SALT_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("sealed box too short: {0} bytes")]
    Truncated(usize),
    #[error("recipient key produced a non-contributory shared secret")]
    WeakKey,
    #[error("random number generator failed")]
    Rng,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SealedBox {
    eph_pub: [u8; EPH_LEN],
    salt: [u8; SALT_LEN],
    ciphertext: Vec<u8>,
}

impl SealedBox {
    pub fn encoded_len(&self) -> usize {
        EPH_LEN + SALT_LEN + self.ciphertext.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.eph_pub);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SealError> {
        if bytes.len() < SEAL_OVERHEAD {
            return Err(SealError::Truncated(bytes.len()));
        }
        let mut eph_pub = [0u8; EPH_LEN];
        let mut salt = [0u8; SALT_LEN];
        eph_pub.copy_from_slice(&bytes[..EPH_LEN]);
        salt.copy_from_slice(&bytes[EPH_LEN..EPH_LEN + SALT_LEN]);
        Ok(Self {
            eph_pub,
            salt,
            ciphertext: bytes[EPH_LEN + SALT_LEN..].to_vec(),
        })
    }
}

impl std::fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBox")
            .field("len", &self.encoded_len())
            .finish()
    }
}

fn derive_key_nonce(
    shared: &[u8; 32],
    salt: &[u8; SALT_LEN],
    purpose: &str,
) -> Result<([u8; 32], [u8; 12]), SealError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);

    let mut key = [0u8; 32];
    hk.expand_multi_info(&[purpose.as_bytes(), b"/key"], &mut key)
        .map_err(|_| SealError::EncryptFailed)?;

    let mut nonce = [0u8; 12];
    hk.expand_multi_info(&[purpose.as_bytes(), b"/nonce"], &mut nonce)
        .map_err(|_| SealError::EncryptFailed)?;

    Ok((key, nonce))
}

fn aad(eph_pub: &[u8; EPH_LEN], salt: &[u8; SALT_LEN]) -> [u8; EPH_LEN + SALT_LEN] {
    let mut out = [0u8; EPH_LEN + SALT_LEN];
    out[..EPH_LEN].copy_from_slice(eph_pub);
    out[EPH_LEN..].copy_from_slice(salt);
    out
}

/// Seal `plaintext` to `recipient_kex_pub` for the given purpose.
pub fn seal(
    recipient_kex_pub: &[u8; 32],
    purpose: &str,
    plaintext: &[u8],
) -> Result<SealedBox, SealError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|_| SealError::Rng)?;

    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = *X25519PublicKey::from(&eph).as_bytes();

    let shared = eph.diffie_hellman(&X25519PublicKey::from(*recipient_kex_pub));
    if !shared.was_contributory() {
        return Err(SealError::WeakKey);
    }

    let (mut key, nonce) = derive_key_nonce(shared.as_bytes(), &salt, purpose)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad(&eph_pub, &salt),
            },
        )
        .map_err(|_| SealError::EncryptFailed)?;

    Ok(SealedBox {
        eph_pub,
        salt,
        ciphertext,
    })
}

/// Open a box sealed to the public half of `kex_secret`.
pub fn open(
    sealed: &SealedBox,
    kex_secret: &StaticSecret,
    purpose: &str,
) -> Result<Vec<u8>, SealError> {
    let shared = kex_secret.diffie_hellman(&X25519PublicKey::from(sealed.eph_pub));
    if !shared.was_contributory() {
        return Err(SealError::WeakKey);
    }

    let (mut key, nonce) = derive_key_nonce(shared.as_bytes(), &sealed.salt, purpose)
        .map_err(|_| SealError::DecryptFailed)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();

    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: &aad(&sealed.eph_pub, &sealed.salt),
            },
        )
        .map_err(|_| SealError::DecryptFailed)
}
