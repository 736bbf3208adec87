use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Key under which data about a public key lives in the DHT: sha256(pubkey_bytes).
pub fn derive_id(pubkey_bytes: &[u8]) -> [u8; 32] {
    sha256(pubkey_bytes)
}

/// First eight bytes of an id as hex, for log lines.
pub fn short_id(id: &[u8]) -> String {
    hex::encode(&id[..id.len().min(8)])
}
