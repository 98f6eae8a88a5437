use thiserror::Error;

/// Shared error type returned by the hash/crypto primitives.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("invalid hash")]
    InvalidHash,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },
}
