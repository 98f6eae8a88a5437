//! Type aliases and node configuration shared across the consensus crates.

use serde::{Deserialize, Serialize};

/// Identifier of a transaction (its `id = H(serialize(Tx))`).
pub type TxId = crate::Hash256;

/// Identifier of a block (its `id = H(serialize(header))`).
pub type BlockId = crate::Hash256;

/// A coin amount, non-negative.
pub type Amount = u64;

/// Unix seconds.
pub type Timestamp = i64;

/// Chain height, genesis = 0.
pub type BlockHeight = u64;

/// Build-time constants fixed for a given network (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable network identifier (e.g. `"mainnet"`, `"regtest"`).
    pub network: String,
    /// Block reward paid to a coinbase output, before fees.
    pub reward: Amount,
    /// Byte length of a raw ECDSA-P256 `r || s` signature.
    pub sig_length: usize,
    /// Upper bound on blocks returned by a single `GetNBlocksNextToHeight` call.
    pub max_block_per_msg: u32,
    /// Number of blocks between difficulty retargets.
    pub epoch_length: u64,
    /// Target wall-clock seconds per block, used by the retarget formula.
    pub target_block_time_secs: i64,
    /// Hex-encoded bootstrap public key paid by genesis's coinbase.
    pub bootstrap_pubkey_hex: String,
    /// Directory backing the node's persistence driver (unused by the
    /// in-memory store, kept for parity with a real deployment).
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "devnet".to_string(),
            reward: 5_000,
            sig_length: crate::crypto::SIG_LENGTH,
            max_block_per_msg: 500,
            epoch_length: 2_016,
            target_block_time_secs: 600,
            bootstrap_pubkey_hex: String::new(),
            data_dir: "./data".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_defaults_match_documented_constants() {
        let config = NodeConfig::default();
        assert_eq!(config.network, "devnet");
        assert_eq!(config.reward, 5_000);
        assert_eq!(config.sig_length, 64);
        assert_eq!(config.epoch_length, 2_016);
    }
}
