pub mod block;
pub mod chain;
pub mod collab;
pub mod consts;
pub mod error;
pub mod mining;
pub mod pow;
pub mod script;
pub mod transaction;
pub mod utxo;

// Core re-exports
pub use block::{merkle_root, Block, BlockHeader};
pub use chain::{Chain, Explorer};
pub use collab::{
    is_node_able_to_mine, BlockStore, GossipSink, GossipSource, InMemoryBlockStore,
    InMemoryUtxoBucketStore, LoopbackGossip, UtxoBucketStore,
};
pub use error::{ChainError, ScriptError, TxError};
pub use mining::MiningCoordinator;
pub use script::{Script, ScriptBuilder, ScriptContext};
pub use transaction::{Transaction, TxInput, TxOutput};
pub use utxo::{UnspentOutput, UtxoStore};

// Re-exports of shared primitives
pub use shared::{hash160, BlockchainError, Hash256, PubKeyHash, Result};
