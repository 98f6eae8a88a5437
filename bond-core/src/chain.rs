//! The chain manager: the tip/height singleton and block acceptance rules
//! (C6, §4.6).

use crate::block::Block;
use crate::collab::BlockStore;
use crate::consts;
use crate::error::ChainError;
use crate::pow;
use crate::transaction::Transaction;
use shared::Hash256;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::utxo::UtxoStore;

/// Owns `BlockStore` and the derived UTXO index behind the `tip`/`height`
/// invariants (§3, §4.6). Generic over the persistence collaborator so the
/// in-memory default and a real key-value engine share one code path.
pub struct Chain<B: BlockStore> {
    store: B,
    utxo: Mutex<UtxoStore>,
    height: RwLock<u64>,
    write_lock: Mutex<()>,
}

impl<B: BlockStore> Chain<B> {
    /// Seeds `store` with `genesis` at height 0 and builds the UTXO index
    /// from it, backed by the default in-memory `UtxoBucketStore`.
    pub fn new(store: B, genesis: Block) -> Self {
        Self::with_utxo_store(store, genesis, UtxoStore::new())
    }

    /// Like [`Chain::new`], but drives the UTXO index through a
    /// caller-supplied [`UtxoStore`] (itself backed by any
    /// `UtxoBucketStore`, §4.8) rather than the in-memory default.
    pub fn with_utxo_store(store: B, genesis: Block, mut utxo: UtxoStore) -> Self {
        let id = genesis.id();
        utxo.apply_block(&genesis);
        store.put(&id, &genesis);
        store.set_tip(&id);
        Self {
            store,
            utxo: Mutex::new(utxo),
            height: RwLock::new(0),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn tip(&self) -> Hash256 {
        self.store.tip().expect("chain always has a tip once constructed")
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        *self.height.read().unwrap()
    }

    /// `GetLastBlock`.
    #[must_use]
    pub fn get_last_block(&self) -> Block {
        self.store
            .get(&self.tip())
            .expect("tip always resolves to a stored block")
    }

    /// `GetBlockByHash`: direct lookup plus a linear scan from tip to
    /// compute height (§4.6, §9.1 — the intended, non-buggy traversal).
    #[must_use]
    pub fn get_block_by_hash(&self, id: &Hash256) -> Option<(Block, u64)> {
        let block = self.store.get(id)?;
        let height = self.compute_height(id)?;
        Some((block, height))
    }

    /// Walks from `tip` toward genesis until the walked block's own hash
    /// matches `id`, returning `height - steps`. Never relies on a
    /// null-dereference exit condition (§9.1).
    fn compute_height(&self, id: &Hash256) -> Option<u64> {
        let total_height = self.height();
        let mut current = self.tip();
        let mut steps = 0u64;
        loop {
            if &current == id {
                return Some(total_height - steps);
            }
            if steps > total_height {
                return None;
            }
            let block = self.store.get(&current)?;
            current = block.header.hash_prev_block;
            steps += 1;
        }
    }

    /// `GetBlockByHeight`: walk from tip `height - n` steps toward genesis.
    #[must_use]
    pub fn get_block_by_height(&self, n: u64) -> Option<Block> {
        let steps = self.height().checked_sub(n)?;
        let mut current = self.tip();
        for _ in 0..steps {
            let block = self.store.get(&current)?;
            current = block.header.hash_prev_block;
        }
        self.store.get(&current)
    }

    /// `GetNBlocksNextToHeight`: bounded by `MaxBlockPerMsg`.
    #[must_use]
    pub fn get_n_blocks_next_to_height(&self, start: u64, max: u32) -> HashMap<u64, Block> {
        let max = max.min(consts::MAX_BLOCK_PER_MSG);
        let mut out = HashMap::new();
        for offset in 0..u64::from(max) {
            let h = start + offset;
            if h > self.height() {
                break;
            }
            if let Some(block) = self.get_block_by_height(h) {
                out.insert(h, block);
            }
        }
        out
    }

    /// A read-only cursor walking the chain backward from tip to genesis.
    #[must_use]
    pub fn explorer(&self) -> Explorer<'_, B> {
        Explorer {
            chain: self,
            cursor: Some(self.tip()),
        }
    }

    /// The `bits` the next block must carry: inherited from the tip except
    /// at an `EpochLength` boundary, where [`pow::get_new_bits`] retargets
    /// against the epoch's actual span (§4.4).
    #[must_use]
    pub fn expected_bits(&self) -> u32 {
        let last = self.get_last_block();
        let next_height = self.height() + 1;
        if next_height % consts::EPOCH_LENGTH != 0 {
            return last.header.bits;
        }
        let epoch_start_height = next_height.saturating_sub(consts::EPOCH_LENGTH);
        let epoch_start = self
            .get_block_by_height(epoch_start_height)
            .unwrap_or_else(|| last.clone());
        let actual_span = last.header.time - epoch_start.header.time;
        let expected_span = consts::EPOCH_LENGTH as i64 * consts::TARGET_BLOCK_TIME_SECS;
        let new_bits = pow::get_new_bits(last.header.bits, actual_span, expected_span);
        debug!(
            next_height,
            actual_span,
            expected_span,
            old_bits = last.header.bits,
            new_bits,
            "retargeting difficulty at epoch boundary"
        );
        new_bits
    }

    /// Resolves every previous transaction referenced by `transactions`'s
    /// inputs by scanning blocks from tip toward genesis (§4.2 step 2),
    /// stopping as soon as every reference is found.
    fn resolve_prev_txs(&self, transactions: &[Transaction]) -> HashMap<Hash256, Transaction> {
        let mut needed: HashSet<Hash256> = HashSet::new();
        for tx in transactions {
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                needed.insert(input.prev_tx);
            }
        }

        let mut resolved = HashMap::new();
        if needed.is_empty() {
            return resolved;
        }

        let mut current = self.tip();
        loop {
            let Some(scanned) = self.store.get(&current) else {
                break;
            };
            for tx in &scanned.transactions {
                if needed.contains(&tx.id()) {
                    resolved.insert(tx.id(), tx.clone());
                }
            }
            if resolved.len() == needed.len() {
                break;
            }
            let prev = scanned.header.hash_prev_block;
            if prev == consts::genesis_block_prevhash() {
                break;
            }
            current = prev;
        }
        resolved
    }

    /// `CheckNewBlock` (§4.6 step list).
    ///
    /// # Errors
    ///
    /// Returns the specific consensus [`ChainError`] variant for whichever
    /// check fails first.
    pub fn check_new_block(&self, block: &Block) -> Result<(), ChainError> {
        let id = block.id();
        let result = self.check_new_block_inner(block);
        if let Err(ref err) = result {
            warn!(block_id = %id, %err, "rejected candidate block");
        }
        result
    }

    fn check_new_block_inner(&self, block: &Block) -> Result<(), ChainError> {
        block.validate_structure()?;

        if block.header.bits != self.expected_bits() {
            return Err(ChainError::WrongBits);
        }
        if !pow::is_valid(&block.header) {
            return Err(ChainError::WrongPow);
        }

        let last = self.get_last_block();
        let now = current_unix_time();
        if !(last.header.time <= block.header.time && block.header.time <= now) {
            return Err(ChainError::WrongBlockTime);
        }

        let prev_txs = self.resolve_prev_txs(&block.transactions);
        block.check_transactions(&prev_txs)?;
        Ok(())
    }

    /// Sums `GetFees` over `transactions` against this chain's history, for
    /// candidate-block assembly (§4.7) and any other caller needing a fee
    /// total without a full block to check.
    ///
    /// # Errors
    ///
    /// Propagates [`ChainError::WrongScript`] if a referenced previous
    /// output cannot be resolved to a valid amount.
    pub fn compute_fees(&self, transactions: &[Transaction]) -> Result<u64, ChainError> {
        let prev_txs = self.resolve_prev_txs(transactions);
        let mut total = 0u64;
        for tx in transactions {
            if tx.is_coinbase() {
                continue;
            }
            total += tx.get_fees(&prev_txs)?;
        }
        Ok(total)
    }

    /// `AddBlock`: atomic under a single writer lock (§5). Does not call
    /// [`Chain::check_new_block`] itself — callers run that first so a
    /// rejected block never mutates state.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::BlockExists`] if `block.id` is already stored,
    /// or [`ChainError::NoNextToTip`] if it does not extend the tip.
    pub fn add_block(&self, block: Block) -> Result<(), ChainError> {
        let _guard = self.write_lock.lock().unwrap();
        let id = block.id();
        if self.store.contains(&id) {
            return Err(ChainError::BlockExists);
        }
        if block.header.hash_prev_block != self.tip() {
            return Err(ChainError::NoNextToTip);
        }

        self.store.put(&id, &block);
        self.utxo.lock().unwrap().apply_block(&block);
        self.store.set_tip(&id);
        let height = {
            let mut height = self.height.write().unwrap();
            *height += 1;
            *height
        };
        info!(block_id = %id, height, "accepted block, advanced tip");
        Ok(())
    }

    #[must_use]
    pub fn utxo_count_tx(&self) -> usize {
        self.utxo.lock().unwrap().count_tx()
    }

    /// A `Result`-returning counterpart to [`Chain::get_block_by_hash`] for
    /// callers (gossip intake, explorers) that want `NOT_FOUND` surfaced as
    /// an error rather than an `Option`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::NotFound`] if `id` is not stored.
    pub fn require_block(&self, id: &Hash256) -> Result<Block, ChainError> {
        self.store.get(id).ok_or(ChainError::NotFound)
    }
}

fn current_unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the unix epoch")
        .as_secs() as i64
}

/// Backward cursor from tip to genesis (§4.6).
pub struct Explorer<'a, B: BlockStore> {
    chain: &'a Chain<B>,
    cursor: Option<Hash256>,
}

impl<'a, B: BlockStore> Iterator for Explorer<'a, B> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let id = self.cursor.take()?;
        let block = self.chain.store.get(&id)?;
        if block.header.hash_prev_block != consts::genesis_block_prevhash() {
            self.cursor = Some(block.header.hash_prev_block);
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::InMemoryBlockStore;
    use crate::transaction::{Transaction, TxInput, TxOutput};
    use shared::KeyPair;
    use std::sync::atomic::AtomicBool;

    fn mined_block(prev: &Block, bits: u32, time: i64, reward_pubkey: &[u8]) -> Block {
        let coinbase = Transaction::new_coinbase(reward_pubkey, 0);
        let mut header = crate::block::BlockHeader {
            version: consts::VERSION,
            hash_prev_block: prev.id(),
            hash_merkle_root: crate::block::merkle_root(std::slice::from_ref(&coinbase)),
            time,
            bits,
            nonce: 0,
        };
        let cancel = AtomicBool::new(false);
        let nonce = pow::mine(&mut header, &cancel).unwrap();
        header.nonce = nonce;
        Block::new(header, vec![coinbase])
    }

    fn fresh_chain() -> (Chain<InMemoryBlockStore>, KeyPair, Block) {
        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(keypair.public_key.as_bytes(), 0);
        let chain = Chain::new(InMemoryBlockStore::new(), genesis.clone());
        (chain, keypair, genesis)
    }

    #[test]
    fn require_block_reports_not_found_for_an_unknown_hash() {
        let (chain, _keypair, _genesis) = fresh_chain();
        assert!(matches!(
            chain.require_block(&Hash256::zero()),
            Err(ChainError::NotFound)
        ));
    }

    #[test]
    fn genesis_chain_has_height_zero() {
        let (chain, _keypair, genesis) = fresh_chain();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip(), genesis.id());
        assert_eq!(chain.get_last_block().id(), genesis.id());
    }

    #[test]
    fn with_utxo_store_accepts_a_caller_supplied_bucket() {
        use crate::collab::InMemoryUtxoBucketStore;
        use crate::utxo::UtxoStore;

        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(keypair.public_key.as_bytes(), 0);
        let utxo = UtxoStore::with_bucket(Box::new(InMemoryUtxoBucketStore::new()));
        let chain = Chain::with_utxo_store(InMemoryBlockStore::new(), genesis.clone(), utxo);

        assert_eq!(chain.utxo_count_tx(), 1);
        assert_eq!(chain.tip(), genesis.id());
    }

    #[test]
    fn get_block_height_matches_tip_and_genesis_without_relying_on_a_null_exit() {
        let (chain, keypair, genesis) = fresh_chain();
        let second = mined_block(&genesis, 1, 1, keypair.public_key.as_bytes());
        chain.add_block(second.clone()).unwrap();

        let (found_genesis, genesis_height) = chain.get_block_by_hash(&genesis.id()).unwrap();
        assert_eq!(genesis_height, 0);
        assert_eq!(found_genesis.id(), genesis.id());

        let (found_tip, tip_height) = chain.get_block_by_hash(&second.id()).unwrap();
        assert_eq!(tip_height, 1);
        assert_eq!(found_tip.id(), second.id());
    }

    #[test]
    fn get_block_by_height_walks_back_from_tip() {
        let (chain, keypair, genesis) = fresh_chain();
        let second = mined_block(&genesis, 1, 1, keypair.public_key.as_bytes());
        chain.add_block(second.clone()).unwrap();

        assert_eq!(chain.get_block_by_height(0).unwrap().id(), genesis.id());
        assert_eq!(chain.get_block_by_height(1).unwrap().id(), second.id());
    }

    #[test]
    fn explorer_walks_backward_to_genesis() {
        let (chain, keypair, genesis) = fresh_chain();
        let second = mined_block(&genesis, 1, 1, keypair.public_key.as_bytes());
        chain.add_block(second.clone()).unwrap();

        let ids: Vec<Hash256> = chain.explorer().map(|b| b.id()).collect();
        assert_eq!(ids, vec![second.id(), genesis.id()]);
    }

    #[test]
    fn add_block_rejects_a_block_not_extending_the_tip() {
        let (chain, keypair, genesis) = fresh_chain();
        let orphan_parent = mined_block(&genesis, 1, 1, keypair.public_key.as_bytes());
        let orphan = mined_block(&orphan_parent, 1, 2, keypair.public_key.as_bytes());
        assert!(matches!(
            chain.add_block(orphan),
            Err(ChainError::NoNextToTip)
        ));
    }

    #[test]
    fn add_block_rejects_a_duplicate() {
        let (chain, keypair, genesis) = fresh_chain();
        let second = mined_block(&genesis, 1, 1, keypair.public_key.as_bytes());
        chain.add_block(second.clone()).unwrap();
        assert!(matches!(
            chain.add_block(second),
            Err(ChainError::BlockExists)
        ));
    }

    #[test]
    fn check_new_block_rejects_wrong_bits() {
        let (chain, keypair, genesis) = fresh_chain();
        let mut wrong = mined_block(&genesis, 2, 1, keypair.public_key.as_bytes());
        wrong.header.bits = 5;
        assert!(matches!(
            chain.check_new_block(&wrong),
            Err(ChainError::WrongBits)
        ));
    }

    #[test]
    fn check_new_block_accepts_a_well_formed_extension() {
        let (chain, keypair, genesis) = fresh_chain();
        let second = mined_block(&genesis, chain.expected_bits(), 1, keypair.public_key.as_bytes());
        assert!(chain.check_new_block(&second).is_ok());
    }

    #[test]
    fn check_new_block_rejects_overpaid_coinbase() {
        let (chain, keypair, genesis) = fresh_chain();
        let mut tx = Transaction::new_coinbase(keypair.public_key.as_bytes(), 0);
        tx.outputs[0].value += 1;
        let mut header = crate::block::BlockHeader {
            version: consts::VERSION,
            hash_prev_block: genesis.id(),
            hash_merkle_root: crate::block::merkle_root(std::slice::from_ref(&tx)),
            time: 1,
            bits: chain.expected_bits(),
            nonce: 0,
        };
        let cancel = AtomicBool::new(false);
        header.nonce = pow::mine(&mut header, &cancel).unwrap();
        let bad_block = Block::new(header, vec![tx]);
        assert!(matches!(
            chain.check_new_block(&bad_block),
            Err(ChainError::WrongScript(_))
        ));
    }

    #[test]
    fn add_block_updates_the_utxo_index() {
        let (chain, keypair, genesis) = fresh_chain();
        assert_eq!(chain.utxo_count_tx(), 1);
        let second = mined_block(&genesis, 1, 1, keypair.public_key.as_bytes());
        chain.add_block(second).unwrap();
        assert_eq!(chain.utxo_count_tx(), 2);
    }

    #[test]
    fn resolving_previous_transactions_lets_a_spend_validate_through_check_new_block() {
        let (chain, keypair, genesis) = fresh_chain();
        let genesis_coinbase = genesis.transactions[0].clone();

        let mut spend = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prev_tx: genesis_coinbase.id(),
                vout: 0,
                script_sig: crate::script::Script::default(),
            }],
            outputs: vec![TxOutput {
                value: genesis_coinbase.outputs[0].value,
                script_pubkey: crate::script::ScriptBuilder::p2pkh_lock(
                    shared::hash160(b"recipient").as_bytes(),
                ),
            }],
            lock_time: 0,
        };
        spend.sign_input(0, &keypair, &genesis_coinbase).unwrap();

        let reward_pubkey = keypair.public_key.as_bytes();
        let coinbase = Transaction::new_coinbase(reward_pubkey, 0);
        let transactions = vec![coinbase, spend];
        let mut header = crate::block::BlockHeader {
            version: consts::VERSION,
            hash_prev_block: genesis.id(),
            hash_merkle_root: crate::block::merkle_root(&transactions),
            time: 1,
            bits: chain.expected_bits(),
            nonce: 0,
        };
        let cancel = AtomicBool::new(false);
        header.nonce = pow::mine(&mut header, &cancel).unwrap();
        let block = Block::new(header, transactions);

        assert!(chain.check_new_block(&block).is_ok());
    }
}
