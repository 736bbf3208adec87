//! Fragment size budgeting.
//!
//! A fragment must still fit in one datagram after it has been encrypted and,
//! when relaying is on, wrapped in a store operation and one envelope per hop.

use crate::errors::SendError;
use crate::packet::{EncryptedFragment, StoreOperation, UnencryptedFragment, MAX_DATAGRAM_SIZE};
use crate::relay::RelayEnvelope;

/// Bytes added by wrapping a storable unit for `hops` relay hops.
pub fn relay_overhead(hops: u32) -> usize {
    (hops as usize)
        .saturating_mul(RelayEnvelope::LAYER_OVERHEAD)
        .saturating_add(StoreOperation::OVERHEAD)
}

/// Bytes added to an encoded [`UnencryptedFragment`] on its way to the DHT.
pub fn total_overhead(hops: u32) -> usize {
    let mut overhead = EncryptedFragment::MAX_OVERHEAD;
    if hops > 0 {
        overhead = overhead.saturating_add(relay_overhead(hops));
    }
    overhead
}

/// Largest encoded [`UnencryptedFragment`] that survives encryption and
/// `hops` layers of relay wrapping within [`MAX_DATAGRAM_SIZE`].
///
/// A hop count that leaves no room for fragment content is a configuration
/// error and is reported before any email is cut up.
pub fn max_fragment_size(hops: u32) -> Result<usize, SendError> {
    match MAX_DATAGRAM_SIZE.checked_sub(total_overhead(hops)) {
        Some(size) if size > UnencryptedFragment::HEADER_SIZE => Ok(size),
        _ => Err(SendError::Configuration(format!(
            "{hops} relay hops leave no room for email content in a {MAX_DATAGRAM_SIZE}-byte datagram"
        ))),
    }
}

/// Largest hop count for which [`max_fragment_size`] succeeds.
pub fn max_hops() -> u32 {
    let room = MAX_DATAGRAM_SIZE
        - EncryptedFragment::MAX_OVERHEAD
        - StoreOperation::OVERHEAD
        - UnencryptedFragment::HEADER_SIZE
        - 1;
    (room / RelayEnvelope::LAYER_OVERHEAD) as u32
}
