//! Buyer/seller escrow on a Cardano-style UTXO ledger.
//!
//! Funds are locked at a Plutus script address with an inline datum describing
//! the order, then released to the seller (buyer signs) or refunded to the
//! buyer after the deadline. The [`sdk`] module holds the codecs, the script
//! consistency check, the wallet session guard and the orchestrator; [`api`]
//! exposes them over HTTP.

pub mod api;
pub mod config;
pub mod sdk;

use rand::RngCore;
use rand::thread_rng;

use sdk::{EscrowError, KeyHash};

/// Lovelace per ada.
pub const LOVELACE_PER_ADA: u64 = 1_000_000;

/// Random 28-byte key hash, for demo wallets and tests.
pub fn generate_key_hash() -> KeyHash {
    let mut bytes = [0u8; KeyHash::LEN];
    thread_rng().fill_bytes(&mut bytes);
    KeyHash(bytes)
}

/// Convert an ada amount to lovelace, flooring so the result never exceeds
/// what the caller asked for.
pub fn lovelace_from_ada(ada: f64) -> Result<u64, EscrowError> {
    if !ada.is_finite() || ada <= 0.0 {
        return Err(EscrowError::InvalidInput(format!(
            "amount must be a positive number, got {ada}"
        )));
    }
    let scaled = (ada * LOVELACE_PER_ADA as f64).floor();
    if scaled < 1.0 || scaled >= u64::MAX as f64 {
        return Err(EscrowError::InvalidInput(format!(
            "amount {ada} is out of range"
        )));
    }
    Ok(scaled as u64)
}
