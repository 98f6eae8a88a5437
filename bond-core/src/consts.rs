//! Build-time constants (§6). A deployment overriding these for a test
//! network does so through [`shared::NodeConfig`], not by recompiling.

use shared::Hash256;

pub const VERSION: u32 = 1;
pub const REWARD: u64 = 5_000;
pub const SIG_LENGTH: usize = shared::crypto::SIG_LENGTH;
pub const MAX_BLOCK_PER_MSG: u32 = 500;
pub const EPOCH_LENGTH: u64 = 2_016;
pub const TARGET_BLOCK_TIME_SECS: i64 = 600;

/// The distinguished previous-hash value chained from by the genesis block.
#[must_use]
pub fn genesis_block_prevhash() -> Hash256 {
    Hash256::zero()
}
