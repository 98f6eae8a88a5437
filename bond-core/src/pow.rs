//! Proof-of-work: target derivation, the mining loop, and difficulty
//! retargeting (C4, §4.4).

use crate::block::BlockHeader;
use crate::error::ChainError;
use num_bigint::BigUint;
use std::sync::atomic::{AtomicBool, Ordering};

/// `target = 1 << (256 - bits)`. `bits` is clamped to `[1, 255]` by
/// [`get_new_bits`]; a `bits` outside that range here saturates at the
/// nearest edge rather than overflowing the shift.
#[must_use]
pub fn target_from_bits(bits: u32) -> BigUint {
    let shift = 256u32.saturating_sub(bits.clamp(1, 255));
    BigUint::from(1u8) << shift
}

/// A header is valid proof-of-work iff its id, read as a big-endian unsigned
/// integer, is strictly below the `bits`-derived target.
#[must_use]
pub fn is_valid(header: &BlockHeader) -> bool {
    header.id().as_uint() < target_from_bits(header.bits)
}

/// `Run`: iterates `nonce` from zero, recomputing the header id each time,
/// until a value satisfies [`is_valid`] or `cancel` is observed set.
///
/// # Errors
///
/// Returns [`ChainError::MiningCancelled`] if `cancel` is set before a
/// satisfying nonce is found.
pub fn mine(header: &mut BlockHeader, cancel: &AtomicBool) -> Result<u64, ChainError> {
    let mut nonce: u64 = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ChainError::MiningCancelled);
        }
        header.nonce = nonce;
        if is_valid(header) {
            return Ok(nonce);
        }
        nonce = nonce.wrapping_add(1);
    }
}

/// `GetNewBits`: epoch-boundary retarget. `bits` is unchanged between
/// boundaries (the caller is responsible for only invoking this once per
/// `EpochLength` blocks, §4.4).
///
/// The log2-ratio formula is a documented reconstruction, not a literal
/// port (§9 decision 5): a faster-than-expected epoch (`actual_span_secs <
/// expected_span_secs`) raises `bits` (harder target); a slower epoch
/// lowers it.
#[must_use]
pub fn get_new_bits(prev_bits: u32, actual_span_secs: i64, expected_span_secs: i64) -> u32 {
    if actual_span_secs <= 0 || expected_span_secs <= 0 {
        return prev_bits.clamp(1, 255);
    }
    let ratio = actual_span_secs as f64 / expected_span_secs as f64;
    let adjustment = ratio.log2().round() as i64;
    let new_bits = i64::from(prev_bits) - adjustment;
    new_bits.clamp(1, 255) as u32
}
