//! The mining coordinator: candidate assembly and the cancellable
//! proof-of-work loop (C7, §4.7).

use crate::block::{merkle_root, Block, BlockHeader};
use crate::chain::Chain;
use crate::collab::{is_node_able_to_mine, BlockStore, GossipSink, GossipSource};
use crate::consts;
use crate::error::ChainError;
use crate::pow;
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

fn current_unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the unix epoch")
        .as_secs() as i64
}

/// Assembles candidates against one [`Chain`] and drives [`pow::mine`]
/// against them. Holds its own candidate pool; the chain itself never
/// sees a transaction until it is mined into an accepted block.
pub struct MiningCoordinator<B: BlockStore> {
    chain: Arc<Chain<B>>,
    reward_pubkey: Vec<u8>,
    pending: Mutex<Vec<Transaction>>,
}

impl<B: BlockStore> MiningCoordinator<B> {
    #[must_use]
    pub fn new(chain: Arc<Chain<B>>, reward_pubkey: Vec<u8>) -> Self {
        Self {
            chain,
            reward_pubkey,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Adds a transaction to the candidate pool; picked up by the next
    /// candidate assembly, not the one currently being mined.
    pub fn submit_transaction(&self, tx: Transaction) {
        self.pending.lock().unwrap().push(tx);
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn take_pending(&self) -> Vec<Transaction> {
        std::mem::take(&mut self.pending.lock().unwrap())
    }

    /// Builds one candidate block against the current tip: a coinbase
    /// paying `REWARD + Σ fees` followed by the current pending pool
    /// (§4.7).
    ///
    /// # Errors
    ///
    /// Propagates [`ChainError::WrongScript`] if a pending transaction's
    /// fee cannot be resolved against chain history.
    pub fn build_candidate(&self) -> Result<Block, ChainError> {
        let pending = self.take_pending();
        let fees = self.chain.compute_fees(&pending)?;
        let coinbase = Transaction::new_coinbase(&self.reward_pubkey, fees);

        let mut transactions = Vec::with_capacity(pending.len() + 1);
        transactions.push(coinbase);
        transactions.extend(pending);

        let header = BlockHeader {
            version: consts::VERSION,
            hash_prev_block: self.chain.tip(),
            hash_merkle_root: merkle_root(&transactions),
            time: current_unix_time(),
            bits: self.chain.expected_bits(),
            nonce: 0,
        };
        Ok(Block::new(header, transactions))
    }

    /// Runs a single cancellable attempt: assemble a candidate, then mine
    /// it. Returns `Ok(None)` if `cancel` fires first, which is ordinary
    /// control flow for the caller's restart-on-extension loop, not an
    /// error.
    ///
    /// # Errors
    ///
    /// Propagates candidate-assembly errors.
    pub fn attempt(&self, cancel: &AtomicBool) -> Result<Option<Block>, ChainError> {
        let mut block = self.build_candidate()?;
        match pow::mine(&mut block.header, cancel) {
            Ok(nonce) => {
                block.header.nonce = nonce;
                Ok(Some(block))
            }
            Err(ChainError::MiningCancelled) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Runs one attempt to completion on the calling thread, without
    /// cancellation. Used by the CLI's one-shot mining path and by tests;
    /// the restart-on-extension loop in [`MiningCoordinator::spawn`] is
    /// what a long-running node actually uses.
    ///
    /// # Errors
    ///
    /// Propagates candidate-assembly errors.
    pub fn mine_one(&self) -> Result<Block, ChainError> {
        let cancel = AtomicBool::new(false);
        Ok(self.attempt(&cancel)?.expect("an uncancelled attempt always finds a nonce"))
    }

    fn publish(&self, block: Block, sink: &dyn GossipSink) {
        let id = block.id();
        let outcome = self
            .chain
            .check_new_block(&block)
            .and_then(|()| self.chain.add_block(block.clone()));
        match outcome {
            Ok(()) => {
                info!(block_id = %id, "mined block accepted");
                sink.announce(&block);
            }
            Err(err) => {
                warn!(block_id = %id, %err, "mined block rejected by the chain it was built against");
                sink.reject(&id, &err);
            }
        }
    }
}

impl<B: BlockStore + Send + Sync + 'static> MiningCoordinator<B> {
    /// Runs the restart-on-extension mining loop on a dedicated worker
    /// thread (§5 threading model): each iteration assembles a candidate
    /// against the current tip, mines it on a second thread, and cancels
    /// that attempt the moment `stop` fires, the tip moves (a peer's block
    /// won the race), or `gossip` delivers a competing block first.
    /// Publishes every block this coordinator mines through `sink`.
    pub fn spawn(
        coordinator: Arc<Self>,
        gossip: Arc<dyn GossipSource + Send + Sync>,
        sink: Arc<dyn GossipSink + Send + Sync>,
        stop: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                if !is_node_able_to_mine(coordinator.chain.height(), sink.as_ref()) {
                    thread::sleep(Duration::from_millis(50));
                    continue;
                }

                let tip_at_start = coordinator.chain.tip();
                let cancel = Arc::new(AtomicBool::new(false));
                let worker = {
                    let coordinator = Arc::clone(&coordinator);
                    let cancel = Arc::clone(&cancel);
                    thread::spawn(move || coordinator.attempt(&cancel))
                };

                loop {
                    if stop.load(Ordering::Relaxed) || coordinator.chain.tip() != tip_at_start {
                        cancel.store(true, Ordering::Relaxed);
                        break;
                    }
                    if let Some(external) = gossip.try_recv() {
                        cancel.store(true, Ordering::Relaxed);
                        coordinator.publish(external, sink.as_ref());
                        break;
                    }
                    if worker.is_finished() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }

                if let Ok(Ok(Some(block))) = worker.join() {
                    coordinator.publish(block, sink.as_ref());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryBlockStore, LoopbackGossip};
    use shared::KeyPair;

    fn chain_with_genesis() -> (Arc<Chain<InMemoryBlockStore>>, KeyPair) {
        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(keypair.public_key.as_bytes(), 0);
        let chain = Arc::new(Chain::new(InMemoryBlockStore::new(), genesis));
        (chain, keypair)
    }

    #[test]
    fn build_candidate_pays_reward_with_no_pending_fees() {
        let (chain, keypair) = chain_with_genesis();
        let coordinator = MiningCoordinator::new(chain, keypair.public_key.as_bytes().to_vec());
        let candidate = coordinator.build_candidate().unwrap();
        assert_eq!(candidate.transactions.len(), 1);
        assert_eq!(candidate.transactions[0].outputs[0].value, consts::REWARD);
    }

    #[test]
    fn mine_one_produces_a_block_that_extends_the_chain() {
        let (chain, keypair) = chain_with_genesis();
        let coordinator = MiningCoordinator::new(Arc::clone(&chain), keypair.public_key.as_bytes().to_vec());
        let block = coordinator.mine_one().unwrap();
        assert!(chain.check_new_block(&block).is_ok());
        chain.add_block(block).unwrap();
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn taking_pending_transactions_empties_the_pool() {
        let (chain, keypair) = chain_with_genesis();
        let coordinator = MiningCoordinator::new(chain, keypair.public_key.as_bytes().to_vec());
        let other = KeyPair::generate().unwrap();
        coordinator.submit_transaction(Transaction::new_coinbase(other.public_key.as_bytes(), 0));
        assert_eq!(coordinator.pending_count(), 1);
        let _ = coordinator.build_candidate().unwrap();
        assert_eq!(coordinator.pending_count(), 0);
    }

    #[test]
    fn spawned_mining_loop_stops_promptly_on_signal() {
        let (chain, keypair) = chain_with_genesis();
        let coordinator = Arc::new(MiningCoordinator::new(chain, keypair.public_key.as_bytes().to_vec()));
        let (_tx, gossip) = LoopbackGossip::new();
        let gossip: Arc<dyn GossipSource + Send + Sync> = Arc::new(gossip);
        let (_tx2, sink_gossip) = LoopbackGossip::new();
        let sink: Arc<dyn GossipSink + Send + Sync> = Arc::new(sink_gossip);
        let stop = Arc::new(AtomicBool::new(false));

        let handle = MiningCoordinator::spawn(coordinator, gossip, sink, Arc::clone(&stop));
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
