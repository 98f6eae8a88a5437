use shared::Hash256;
use thiserror::Error;

/// Failures raised while executing a script (§4.3, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("stack underflow")]
    StackUnderflow,

    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("truncated push: wanted {wanted} bytes, got {got}")]
    TruncatedPush { wanted: usize, got: usize },

    #[error("verify failed: {0}")]
    VerifyFailed(&'static str),

    #[error("signature length mismatch: expected {expected}, got {actual}")]
    SignatureLengthMismatch { expected: usize, actual: usize },

    #[error("invalid multisig parameters")]
    InvalidMultisig,

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("terminal stack is empty or false")]
    TerminalFalse,
}

/// Failures raised while validating a single transaction (§4.2, §7).
#[derive(Error, Debug)]
pub enum TxError {
    #[error("script validation failed for input {index}: {source}")]
    Script {
        index: usize,
        #[source]
        source: ScriptError,
    },

    #[error("coinbase structural violation: {0}")]
    InvalidCoinbase(String),

    #[error("value invariant violated: inputs {inputs} < outputs {outputs}")]
    ValueInvariant { inputs: u64, outputs: u64 },

    #[error("referenced previous output not found: tx {txid} vout {vout}")]
    PrevOutputNotFound { txid: Hash256, vout: i64 },

    #[error("malformed wire encoding: {0}")]
    Serialization(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),
}

/// The consensus error kinds reported by the chain manager (§7, §9.2).
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("WRONG_MERKLE_HASH")]
    WrongMerkleHash,

    #[error("WRONG_BITS")]
    WrongBits,

    #[error("WRONG_POW_ERROR")]
    WrongPow,

    #[error("WRONG_BLOCK_TIME_ERROR")]
    WrongBlockTime,

    #[error("WRONG_BLOCK_PUTS_VALUE")]
    WrongBlockPutsValue,

    #[error("WRONG_SCRIPT: {0}")]
    WrongScript(#[from] TxError),

    #[error("NO_NEXT_TO_TIP_ERROR")]
    NoNextToTip,

    #[error("BLOCK_EXISTS")]
    BlockExists,

    #[error("NIL_BLOCK")]
    NilBlock,

    #[error("NOT_FOUND")]
    NotFound,

    #[error("mining cancelled")]
    MiningCancelled,
}
