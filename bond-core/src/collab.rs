//! Collaborator boundaries (C8, §4.8): the persistence driver and the
//! gossip layer are external to this crate. The chain manager depends on
//! them only through these traits; the in-memory implementations here are
//! what the test suite exercises.

use crate::block::Block;
use crate::error::ChainError;
use crate::utxo::UnspentOutput;
use shared::Hash256;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Durable block storage, keyed by block id, plus the current tip pointer.
pub trait BlockStore {
    fn get(&self, id: &Hash256) -> Option<Block>;
    fn put(&self, id: &Hash256, block: &Block);
    fn tip(&self) -> Option<Hash256>;
    fn set_tip(&self, id: &Hash256);
    fn contains(&self, id: &Hash256) -> bool;
}

/// Durable UTXO bucket storage, keyed by tx id.
pub trait UtxoBucketStore {
    fn get(&self, tx_id: &Hash256) -> Option<Vec<UnspentOutput>>;
    fn put(&self, tx_id: &Hash256, outputs: &[UnspentOutput]);
    fn delete(&self, tx_id: &Hash256);

    /// A single pass over every bucket, each already paired with its
    /// outputs — a real backing store serves this as one scan rather than
    /// a key listing followed by a `get` per key (§4.8).
    fn iter(&self) -> Box<dyn Iterator<Item = (Hash256, Vec<UnspentOutput>)> + '_>;
}

/// A source of externally received candidate blocks (§5 gossip intake).
pub trait GossipSource {
    fn try_recv(&self) -> Option<Block>;
}

/// The sink the chain manager reports accept/reject decisions to, and the
/// window onto peer heights `IsNodeAbleToMine` reads (§4.7).
pub trait GossipSink {
    fn announce(&self, block: &Block);
    fn reject(&self, id: &Hash256, error: &ChainError);
    fn peer_heights(&self) -> Vec<u64>;
}

/// `HashMap`-backed [`BlockStore`], guarded by an `RwLock` per §5's
/// snapshot-isolated-reads-one-writer model.
#[derive(Default)]
pub struct InMemoryBlockStore {
    blocks: RwLock<HashMap<Hash256, Block>>,
    tip: RwLock<Option<Hash256>>,
}

impl InMemoryBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for InMemoryBlockStore {
    fn get(&self, id: &Hash256) -> Option<Block> {
        self.blocks.read().unwrap().get(id).cloned()
    }

    fn put(&self, id: &Hash256, block: &Block) {
        self.blocks.write().unwrap().insert(*id, block.clone());
    }

    fn tip(&self) -> Option<Hash256> {
        *self.tip.read().unwrap()
    }

    fn set_tip(&self, id: &Hash256) {
        *self.tip.write().unwrap() = Some(*id);
    }

    fn contains(&self, id: &Hash256) -> bool {
        self.blocks.read().unwrap().contains_key(id)
    }
}

/// `HashMap`-backed [`UtxoBucketStore`].
#[derive(Default)]
pub struct InMemoryUtxoBucketStore {
    buckets: RwLock<HashMap<Hash256, Vec<UnspentOutput>>>,
}

impl InMemoryUtxoBucketStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl UtxoBucketStore for InMemoryUtxoBucketStore {
    fn get(&self, tx_id: &Hash256) -> Option<Vec<UnspentOutput>> {
        self.buckets.read().unwrap().get(tx_id).cloned()
    }

    fn put(&self, tx_id: &Hash256, outputs: &[UnspentOutput]) {
        self.buckets
            .write()
            .unwrap()
            .insert(*tx_id, outputs.to_vec());
    }

    fn delete(&self, tx_id: &Hash256) {
        self.buckets.write().unwrap().remove(tx_id);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (Hash256, Vec<UnspentOutput>)> + '_> {
        let snapshot: Vec<_> = self
            .buckets
            .read()
            .unwrap()
            .iter()
            .map(|(id, outputs)| (*id, outputs.clone()))
            .collect();
        Box::new(snapshot.into_iter())
    }
}

/// A loopback `GossipSource`/`GossipSink` pair backed by an
/// `std::sync::mpsc` channel, provided only to exercise the collaborator
/// boundary in tests (§4.8).
pub struct LoopbackGossip {
    inbound: Mutex<std::sync::mpsc::Receiver<Block>>,
    announced: Mutex<Vec<Block>>,
    rejected: Mutex<Vec<(Hash256, String)>>,
    peer_heights: RwLock<Vec<u64>>,
}

impl LoopbackGossip {
    #[must_use]
    pub fn new() -> (std::sync::mpsc::Sender<Block>, Self) {
        let (tx, rx) = std::sync::mpsc::channel();
        (
            tx,
            Self {
                inbound: Mutex::new(rx),
                announced: Mutex::new(Vec::new()),
                rejected: Mutex::new(Vec::new()),
                peer_heights: RwLock::new(Vec::new()),
            },
        )
    }

    pub fn set_peer_heights(&self, heights: Vec<u64>) {
        *self.peer_heights.write().unwrap() = heights;
    }

    #[must_use]
    pub fn announced(&self) -> Vec<Block> {
        self.announced.lock().unwrap().clone()
    }
}

impl GossipSource for LoopbackGossip {
    fn try_recv(&self) -> Option<Block> {
        self.inbound.lock().unwrap().try_recv().ok()
    }
}

impl GossipSink for LoopbackGossip {
    fn announce(&self, block: &Block) {
        self.announced.lock().unwrap().push(block.clone());
    }

    fn reject(&self, id: &Hash256, error: &ChainError) {
        self.rejected.lock().unwrap().push((*id, error.to_string()));
    }

    fn peer_heights(&self) -> Vec<u64> {
        self.peer_heights.read().unwrap().clone()
    }
}

/// `IsNodeAbleToMine`: refrain from mining while any trusted peer reports a
/// strictly greater last-block height (§4.7).
#[must_use]
pub fn is_node_able_to_mine(local_height: u64, sink: &dyn GossipSink) -> bool {
    !sink.peer_heights().iter().any(|&h| h > local_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use shared::KeyPair;

    #[test]
    fn in_memory_block_store_round_trips() {
        let store = InMemoryBlockStore::new();
        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(keypair.public_key.as_bytes(), 0);
        let id = genesis.id();

        assert!(store.get(&id).is_none());
        store.put(&id, &genesis);
        store.set_tip(&id);

        assert!(store.contains(&id));
        assert_eq!(store.tip(), Some(id));
        assert_eq!(store.get(&id).unwrap().id(), id);
    }

    #[test]
    fn is_node_able_to_mine_respects_taller_peers() {
        let (_tx, gossip) = LoopbackGossip::new();
        assert!(is_node_able_to_mine(5, &gossip));
        gossip.set_peer_heights(vec![3, 9]);
        assert!(!is_node_able_to_mine(5, &gossip));
    }

    #[test]
    fn loopback_gossip_delivers_sent_blocks() {
        let (tx, gossip) = LoopbackGossip::new();
        let keypair = KeyPair::generate().unwrap();
        let genesis = Block::genesis(keypair.public_key.as_bytes(), 0);
        tx.send(genesis.clone()).unwrap();
        assert_eq!(gossip.try_recv().unwrap().id(), genesis.id());
    }
}
