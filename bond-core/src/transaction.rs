//! Transactions, the unit of value transfer validated against the UTXO set
//! (C3, §4.2).

use crate::consts::REWARD;
use crate::error::TxError;
use crate::script::{self, Script, ScriptBuilder, ScriptContext};
use crate::utxo::UnspentOutput;
use shared::{hash160, Amount, Hash256, KeyPair};
use std::collections::HashMap;

/// `vout` carried by the distinguished coinbase input.
pub const COINBASE_VOUT: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_tx: Hash256,
    pub vout: i64,
    pub script_sig: Script,
}

impl TxInput {
    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.prev_tx.as_bytes());
        shared::write_int_field(out, self.vout);
        let script_bytes = self.script_sig.serialize();
        out.extend_from_slice(&(script_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&script_bytes);
    }

    fn deserialize_from(bytes: &[u8], cursor: &mut usize) -> Result<Self, TxError> {
        let prev_tx = read_hash(bytes, cursor)?;
        let vout = shared::read_int_field(bytes, cursor).map_err(TxError::Serialization)?;
        let script_sig = read_script(bytes, cursor)?;
        Ok(Self {
            prev_tx,
            vout,
            script_sig,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: Amount,
    pub script_pubkey: Script,
}

impl TxOutput {
    fn serialize_into(&self, out: &mut Vec<u8>) {
        shared::write_int_field(out, self.value as i64);
        let script_bytes = self.script_pubkey.serialize();
        out.extend_from_slice(&(script_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&script_bytes);
    }

    fn deserialize_from(bytes: &[u8], cursor: &mut usize) -> Result<Self, TxError> {
        let value = shared::read_int_field(bytes, cursor).map_err(TxError::Serialization)?;
        if value < 0 {
            return Err(TxError::Serialization("negative output value".into()));
        }
        let script_pubkey = read_script(bytes, cursor)?;
        Ok(Self {
            value: value as Amount,
            script_pubkey,
        })
    }
}

fn read_hash(bytes: &[u8], cursor: &mut usize) -> Result<Hash256, TxError> {
    if *cursor + 32 > bytes.len() {
        return Err(TxError::Serialization("truncated hash field".into()));
    }
    let hash = Hash256::try_from(&bytes[*cursor..*cursor + 32])
        .map_err(|e| TxError::Serialization(e.to_string()))?;
    *cursor += 32;
    Ok(hash)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, TxError> {
    if *cursor + 4 > bytes.len() {
        return Err(TxError::Serialization("truncated u32 field".into()));
    }
    let value = u32::from_be_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    Ok(value)
}

fn read_script(bytes: &[u8], cursor: &mut usize) -> Result<Script, TxError> {
    let len = read_u32(bytes, cursor)? as usize;
    if *cursor + len > bytes.len() {
        return Err(TxError::Serialization("truncated script field".into()));
    }
    let (script, consumed) = Script::deserialize(&bytes[*cursor..*cursor + len])
        .map_err(|e| TxError::Serialization(e.to_string()))?;
    if consumed != len {
        return Err(TxError::Serialization(
            "script declared length does not match its own encoding".into(),
        ));
    }
    *cursor += len;
    Ok(script)
}

/// A transaction: zero or more spent outputs in, one or more new outputs out
/// (§3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// `NewCoinbaseTx`: one input with empty `prev_tx`/`vout = -1`/empty
    /// `script_sig`; one output paying `REWARD + fees` to `pubkey`'s P2PKH
    /// address (§4.2).
    #[must_use]
    pub fn new_coinbase(pubkey: &[u8], fees: u64) -> Self {
        let pkh = hash160(pubkey);
        Self {
            version: 1,
            inputs: vec![TxInput {
                prev_tx: Hash256::zero(),
                vout: COINBASE_VOUT,
                script_sig: Script::default(),
            }],
            outputs: vec![TxOutput {
                value: REWARD + fees,
                script_pubkey: ScriptBuilder::p2pkh_lock(pkh.as_bytes()),
            }],
            lock_time: 0,
        }
    }

    /// `NewTx` (§4.2 "Regular construction"): spends `selected` unspent
    /// outputs, paying `amount` to `recipient_pkh` and any surplus back to
    /// `change_pkh`. Output selection is the caller's policy (typically
    /// [`crate::utxo::UtxoStore::find_spendable`]); this only assembles the
    /// transaction and enforces that the gathered sum covers `amount +
    /// fee`. Inputs are left unsigned; sign each with
    /// [`Transaction::sign_input`].
    ///
    /// # Errors
    ///
    /// Returns [`TxError::ValueInvariant`] if the selected outputs do not
    /// cover `amount + fee`.
    pub fn new_spend(
        selected: &[(Hash256, UnspentOutput)],
        recipient_pkh: &[u8; 20],
        change_pkh: &[u8; 20],
        amount: Amount,
        fee: Amount,
    ) -> Result<Self, TxError> {
        let gathered: Amount = selected.iter().map(|(_, unspent)| unspent.output.value).sum();
        let required = amount.saturating_add(fee);
        if gathered < required {
            return Err(TxError::ValueInvariant {
                inputs: gathered,
                outputs: required,
            });
        }

        let inputs = selected
            .iter()
            .map(|(tx_id, unspent)| TxInput {
                prev_tx: *tx_id,
                vout: i64::from(unspent.vout_index),
                script_sig: Script::default(),
            })
            .collect();

        let mut outputs = vec![TxOutput {
            value: amount,
            script_pubkey: ScriptBuilder::p2pkh_lock(recipient_pkh),
        }];
        if gathered > required {
            outputs.push(TxOutput {
                value: gathered - required,
                script_pubkey: ScriptBuilder::p2pkh_lock(change_pkh),
            });
        }

        Ok(Self {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        })
    }

    /// True iff this is the distinguished first-of-block reward transaction.
    #[must_use]
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].vout == COINBASE_VOUT
            && self.inputs[0].prev_tx == Hash256::zero()
    }

    /// Hand-rolled, deterministic wire encoding (§4.2, §9): no general-purpose
    /// object encoder is used for this preimage.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            input.serialize_into(&mut out);
        }
        out.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            output.serialize_into(&mut out);
        }
        out.extend_from_slice(&self.lock_time.to_be_bytes());
        out
    }

    /// Inverse of [`Transaction::serialize`].
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Serialization`] on any malformed or truncated
    /// field.
    pub fn deserialize(bytes: &[u8]) -> Result<(Self, usize), TxError> {
        let mut cursor = 0usize;
        let version = read_u32(bytes, &mut cursor)?;
        let in_count = read_u32(bytes, &mut cursor)?;
        let mut inputs = Vec::with_capacity(in_count as usize);
        for _ in 0..in_count {
            inputs.push(TxInput::deserialize_from(bytes, &mut cursor)?);
        }
        let out_count = read_u32(bytes, &mut cursor)?;
        let mut outputs = Vec::with_capacity(out_count as usize);
        for _ in 0..out_count {
            outputs.push(TxOutput::deserialize_from(bytes, &mut cursor)?);
        }
        let lock_time = read_u32(bytes, &mut cursor)?;
        Ok((
            Self {
                version,
                inputs,
                outputs,
                lock_time,
            },
            cursor,
        ))
    }

    /// `tx.id`: the SHA-256 digest of [`Transaction::serialize`].
    #[must_use]
    pub fn id(&self) -> Hash256 {
        Hash256::sha256(&self.serialize())
    }

    /// Signs input `input_index` against `prev_tx` (the transaction whose
    /// output it spends) and installs the resulting `<signature> <pubkey>`
    /// unlocking script (§4.2).
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Crypto`] if signing fails, or
    /// [`TxError::PrevOutputNotFound`] if `input_index` is out of range.
    pub fn sign_input(
        &mut self,
        input_index: usize,
        keypair: &KeyPair,
        prev_tx: &Transaction,
    ) -> Result<(), TxError> {
        if input_index >= self.inputs.len() {
            return Err(TxError::PrevOutputNotFound {
                txid: prev_tx.id(),
                vout: input_index as i64,
            });
        }
        let preimage = prev_tx.serialize();
        let signature = keypair
            .sign(&preimage)
            .map_err(|e| TxError::Crypto(e.to_string()))?;
        self.inputs[input_index].script_sig = ScriptBuilder::standard_unlock(
            signature.as_bytes(),
            keypair.public_key.as_bytes(),
        );
        Ok(())
    }

    /// `GetFees`: sum of resolved input values minus sum of output values.
    /// Coinbase transactions have no fee.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::PrevOutputNotFound`] if an input's previous
    /// transaction or vout cannot be resolved in `prev_txs`.
    pub fn get_fees(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<u64, TxError> {
        if self.is_coinbase() {
            return Ok(0);
        }
        let input_total = self.resolve_input_total(prev_txs)?;
        let output_total: u64 = self.outputs.iter().map(|o| o.value).sum();
        Ok(input_total.saturating_sub(output_total))
    }

    fn resolve_input_total(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<u64, TxError> {
        let mut total = 0u64;
        for input in &self.inputs {
            let output = self.resolve_output(input, prev_txs)?;
            total += output.value;
        }
        Ok(total)
    }

    fn resolve_output<'a>(
        &self,
        input: &TxInput,
        prev_txs: &'a HashMap<Hash256, Transaction>,
    ) -> Result<&'a TxOutput, TxError> {
        let prev = prev_txs
            .get(&input.prev_tx)
            .ok_or(TxError::PrevOutputNotFound {
                txid: input.prev_tx,
                vout: input.vout,
            })?;
        if input.vout < 0 {
            return Err(TxError::PrevOutputNotFound {
                txid: input.prev_tx,
                vout: input.vout,
            });
        }
        prev.outputs
            .get(input.vout as usize)
            .ok_or(TxError::PrevOutputNotFound {
                txid: input.prev_tx,
                vout: input.vout,
            })
    }

    /// `CheckIfTxIsCorrect` (§4.2): structural coinbase check, or per-input
    /// script execution plus the value invariant for regular transactions.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidCoinbase`], [`TxError::Script`], or
    /// [`TxError::ValueInvariant`] according to which check fails.
    pub fn validate(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<(), TxError> {
        if self.is_coinbase() {
            if self.inputs.len() != 1 || !self.inputs[0].script_sig.is_empty() {
                return Err(TxError::InvalidCoinbase(
                    "coinbase must carry exactly one input with an empty script_sig".into(),
                ));
            }
            return Ok(());
        }

        for (index, input) in self.inputs.iter().enumerate() {
            let output = self.resolve_output(input, prev_txs)?;
            let ctx = ScriptContext {
                tx: self,
                input_index: index,
                prev_txs,
            };
            script::verify_input(&input.script_sig, &output.script_pubkey, &ctx).map_err(
                |source| TxError::Script { index, source },
            )?;
        }

        let input_total = self.resolve_input_total(prev_txs)?;
        let output_total: u64 = self.outputs.iter().map(|o| o.value).sum();
        if input_total < output_total {
            return Err(TxError::ValueInvariant {
                inputs: input_total,
                outputs: output_total,
            });
        }
        Ok(())
    }
}
