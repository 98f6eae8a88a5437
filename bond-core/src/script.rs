//! The stack-based script virtual machine (C2).
//!
//! A script is an ordered list of tokens, each an independently
//! length-prefixed byte string (mirroring the wire format, §4.2). During
//! execution a token that is exactly one byte long is either `OP_0`, a
//! small-literal push in `OP_DATA_1..16`, or dispatched through
//! [`OPCODE_TABLE`] as an opcode; any other single byte value is an
//! unknown opcode and fails the script outright. Multi-byte tokens are
//! always pushed verbatim, which is what lets a 20-byte pubkey hash or a
//! 64-byte signature push just as directly as a small literal.

use crate::error::ScriptError;
use crate::transaction::Transaction;
use shared::crypto::{self, PublicKey, Signature, SIG_LENGTH};
use shared::{hash160, Hash256};
use std::collections::HashMap;

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_DATA_1: u8 = 0x01;
    pub const OP_DATA_16: u8 = 0x10;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
}
use opcodes::*;

/// A single script token: either a literal opcode byte or a data push.
pub type Token = Vec<u8>;

/// An ordered list of tokens making up a locking or unlocking script.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Script(pub Vec<Token>);

impl Script {
    #[must_use]
    pub fn new(tokens: Vec<Token>) -> Self {
        Self(tokens)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends the tokens of `other` after this script's own tokens,
    /// producing the single stream `script_sig || script_pubkey` (§4.2).
    #[must_use]
    pub fn concat(&self, other: &Self) -> Self {
        let mut tokens = self.0.clone();
        tokens.extend(other.0.iter().cloned());
        Self(tokens)
    }

    /// Serializes as a length-prefixed sequence of length-prefixed byte
    /// strings (§4.2).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.0.len() as u32).to_be_bytes());
        for token in &self.0 {
            out.extend_from_slice(&(token.len() as u32).to_be_bytes());
            out.extend_from_slice(token);
        }
        out
    }

    /// Inverse of [`Script::serialize`]. Rejects truncated pushes.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::TruncatedPush`] if a declared length runs past
    /// the end of `bytes`.
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize), ScriptError> {
        let mut cursor = 0usize;
        let count = read_u32(bytes, &mut cursor)?;
        let mut tokens = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = read_u32(bytes, &mut cursor)? as usize;
            if cursor + len > bytes.len() {
                return Err(ScriptError::TruncatedPush {
                    wanted: len,
                    got: bytes.len() - cursor,
                });
            }
            tokens.push(bytes[cursor..cursor + len].to_vec());
            cursor += len;
        }
        Ok((Self(tokens), cursor))
    }
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, ScriptError> {
    if *cursor + 4 > bytes.len() {
        return Err(ScriptError::TruncatedPush {
            wanted: 4,
            got: bytes.len().saturating_sub(*cursor),
        });
    }
    let value = u32::from_be_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    Ok(value)
}

/// Builds the fixed script shapes described in §4.3.
pub struct ScriptBuilder;

impl ScriptBuilder {
    #[must_use]
    pub fn p2pkh_lock(pubkey_hash: &[u8; 20]) -> Script {
        Script::new(vec![
            vec![OP_DUP],
            vec![OP_HASH160],
            pubkey_hash.to_vec(),
            vec![OP_EQUALVERIFY],
            vec![OP_CHECKSIG],
        ])
    }

    #[must_use]
    pub fn coinbase_lock(pubkey: &[u8]) -> Script {
        Script::new(vec![pubkey.to_vec(), vec![OP_CHECKSIG]])
    }

    #[must_use]
    pub fn standard_unlock(signature: &[u8], pubkey: &[u8]) -> Script {
        Script::new(vec![signature.to_vec(), pubkey.to_vec()])
    }

    #[must_use]
    pub fn multisig_lock(n_sig: u8, pubkeys: &[Vec<u8>]) -> Script {
        let mut tokens = vec![vec![n_sig]];
        tokens.extend(pubkeys.iter().cloned());
        tokens.push(vec![pubkeys.len() as u8]);
        tokens.push(vec![OP_CHECKMULTISIG]);
        Script::new(tokens)
    }
}

/// True iff `script` matches the pay-to-script (multisig) shape: a data
/// push followed immediately by `OP_CHECKMULTISIG` as its final opcode,
/// rather than the P2PKH shape (§4.3).
#[must_use]
pub fn is_multisig_script(script: &Script) -> bool {
    matches!(script.0.last(), Some(tok) if tok.as_slice() == [OP_CHECKMULTISIG])
        && !matches!(script.0.first(), Some(tok) if tok.as_slice() == [OP_DUP])
}

/// Read-only context a script executes against.
pub struct ScriptContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub prev_txs: &'a HashMap<Hash256, Transaction>,
}

/// Boolean encoding (§4.3): empty or a single `0x00` byte is false.
#[must_use]
pub fn is_truthy(bytes: &[u8]) -> bool {
    !(bytes.is_empty() || bytes == [0x00])
}

#[must_use]
pub fn push_bool(value: bool) -> Token {
    if value {
        vec![0x01]
    } else {
        Vec::new()
    }
}

struct Stack(Vec<Token>);

impl Stack {
    fn pop(&mut self) -> Result<Token, ScriptError> {
        self.0.pop().ok_or(ScriptError::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i64, ScriptError> {
        Ok(shared::decode_int(&self.pop()?))
    }

    fn push(&mut self, item: Token) {
        self.0.push(item);
    }
}

type OpcodeHandler = fn(&mut Stack, &ScriptContext<'_>) -> Result<(), ScriptError>;

/// 256-entry dispatch table indexed by opcode byte (§9). `None` means the
/// byte has no defined action-opcode handler and is instead treated as a
/// literal data push by [`execute`].
static OPCODE_TABLE: [Option<OpcodeHandler>; 256] = build_table();

const fn build_table() -> [Option<OpcodeHandler>; 256] {
    let mut table: [Option<OpcodeHandler>; 256] = [None; 256];
    table[OP_DUP as usize] = Some(op_dup);
    table[OP_EQUAL as usize] = Some(op_equal);
    table[OP_EQUALVERIFY as usize] = Some(op_equalverify);
    table[OP_ADD as usize] = Some(op_add);
    table[OP_SUB as usize] = Some(op_sub);
    table[OP_HASH160 as usize] = Some(op_hash160);
    table[OP_CHECKSIG as usize] = Some(op_checksig);
    table[OP_CHECKSIGVERIFY as usize] = Some(op_checksigverify);
    table[OP_CHECKMULTISIG as usize] = Some(op_checkmultisig);
    table
}

fn op_dup(stack: &mut Stack, _ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    let top = stack.0.last().ok_or(ScriptError::StackUnderflow)?.clone();
    stack.push(top);
    Ok(())
}

fn op_equal(stack: &mut Stack, _ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    let a = stack.pop()?;
    let b = stack.pop()?;
    stack.push(push_bool(a == b));
    Ok(())
}

fn op_equalverify(stack: &mut Stack, ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    op_equal(stack, ctx)?;
    let verified = is_truthy(&stack.pop()?);
    if verified {
        Ok(())
    } else {
        Err(ScriptError::VerifyFailed("OP_EQUALVERIFY"))
    }
}

fn op_add(stack: &mut Stack, _ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    let v0 = stack.pop_int()?;
    let v1 = stack.pop_int()?;
    stack.push(shared::encode_int(v0 + v1));
    Ok(())
}

fn op_sub(stack: &mut Stack, _ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    let v0 = stack.pop_int()?;
    let v1 = stack.pop_int()?;
    stack.push(shared::encode_int(v1 - v0));
    Ok(())
}

fn op_hash160(stack: &mut Stack, _ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    let data = stack.pop()?;
    stack.push(hash160(&data).as_bytes().to_vec());
    Ok(())
}

/// Looks up the previous transaction serialization that `sig`/`pubkey`
/// pairs in the current input are checked against.
fn signing_preimage(ctx: &ScriptContext<'_>) -> Result<Vec<u8>, ScriptError> {
    let input = ctx
        .tx
        .inputs
        .get(ctx.input_index)
        .ok_or(ScriptError::StackUnderflow)?;
    let prev_tx = ctx
        .prev_txs
        .get(&input.prev_tx)
        .ok_or_else(|| ScriptError::Crypto("previous transaction not found".into()))?;
    Ok(prev_tx.serialize())
}

fn verify_checksig(sig_bytes: &[u8], pk_bytes: &[u8], preimage: &[u8]) -> bool {
    if sig_bytes.len() != SIG_LENGTH || pk_bytes.len() != crypto::PUBKEY_LENGTH {
        return false;
    }
    let Ok(public_key) = PublicKey::from_bytes(pk_bytes.to_vec()) else {
        return false;
    };
    let Ok(signature) = Signature::from_bytes(sig_bytes.to_vec()) else {
        return false;
    };
    signature.verify(preimage, &public_key).unwrap_or(false)
}

fn op_checksig(stack: &mut Stack, ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    let pk_bytes = stack.pop()?;
    let sig_bytes = stack.pop()?;
    if sig_bytes.len() != SIG_LENGTH {
        return Err(ScriptError::SignatureLengthMismatch {
            expected: SIG_LENGTH,
            actual: sig_bytes.len(),
        });
    }
    let preimage = signing_preimage(ctx)?;
    stack.push(push_bool(verify_checksig(&sig_bytes, &pk_bytes, &preimage)));
    Ok(())
}

fn op_checksigverify(stack: &mut Stack, ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    op_checksig(stack, ctx)?;
    if is_truthy(&stack.pop()?) {
        Ok(())
    } else {
        Err(ScriptError::VerifyFailed("OP_CHECKSIGVERIFY"))
    }
}

fn op_checkmultisig(stack: &mut Stack, ctx: &ScriptContext<'_>) -> Result<(), ScriptError> {
    let n_pub = stack.pop_int()?;
    if n_pub < 0 {
        return Err(ScriptError::InvalidMultisig);
    }
    let mut pubkeys = Vec::with_capacity(n_pub as usize);
    for _ in 0..n_pub {
        pubkeys.push(stack.pop()?);
    }

    let n_sig = stack.pop_int()?;
    if n_sig < 0 || n_sig > n_pub {
        return Err(ScriptError::InvalidMultisig);
    }

    let mut signatures = Vec::new();
    while !stack.0.is_empty() {
        signatures.push(stack.pop()?);
    }

    let preimage = signing_preimage(ctx)?;
    let mut successes = 0i64;
    for (sig, pk) in signatures.iter().zip(pubkeys.iter()) {
        if sig.len() != SIG_LENGTH {
            continue;
        }
        if verify_checksig(sig, pk, &preimage) {
            successes += 1;
        }
    }

    stack.push(push_bool(successes >= n_sig));
    Ok(())
}

/// Executes `script` and returns the resulting data stack.
///
/// # Errors
///
/// Returns the first [`ScriptError`] encountered; execution stops at the
/// offending opcode.
pub fn execute(script: &Script, ctx: &ScriptContext<'_>) -> Result<Vec<Token>, ScriptError> {
    let mut stack = Stack(Vec::new());
    for token in &script.0 {
        if token.len() == 1 {
            let byte = token[0];
            if byte == OP_0 {
                stack.push(Vec::new());
                continue;
            }
            if (OP_DATA_1..=OP_DATA_16).contains(&byte) {
                stack.push(shared::encode_int(i64::from(byte)));
                continue;
            }
            if let Some(handler) = OPCODE_TABLE[byte as usize] {
                handler(&mut stack, ctx)?;
                continue;
            }
            return Err(ScriptError::UnknownOpcode(byte));
        }
        stack.push(token.clone());
    }
    Ok(stack.0)
}

/// Runs `CheckIfTxIsCorrect`'s per-input script check: concatenate
/// `script_sig || script_pubkey` into one stream and execute it, requiring
/// a non-empty, truthy terminal stack (§4.2 step 2).
///
/// # Errors
///
/// Returns [`ScriptError::TerminalFalse`] if the script runs to completion
/// without leaving a truthy value, or any execution error.
pub fn verify_input(
    script_sig: &Script,
    script_pubkey: &Script,
    ctx: &ScriptContext<'_>,
) -> Result<(), ScriptError> {
    let combined = script_sig.concat(script_pubkey);
    let stack = execute(&combined, ctx)?;
    match stack.last() {
        Some(top) if is_truthy(top) => Ok(()),
        _ => Err(ScriptError::TerminalFalse),
    }
}
