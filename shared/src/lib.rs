pub mod codec;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod types;

pub use codec::{decode_int, encode_int, read_int_field, write_int_field};
pub use crypto::{public_key_from_bytes, KeyPair, PrivateKey, PublicKey, Signature};
pub use error::BlockchainError;
pub use hash::{hash160, Hash256, PubKeyHash};
pub use types::{Amount, BlockHeight, BlockId, NodeConfig, Timestamp, TxId};

pub type Result<T> = std::result::Result<T, BlockchainError>;
