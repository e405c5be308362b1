//! Block structure
//!
//! Blocks are immutable once mined: the constructor runs the PoW search
//! and seals the hash before the block is ever observable.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consensus::ProofOfWork;
use crate::crypto::{Hash, MerkleTree};
use crate::validation::Transaction;

/// One mined block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Unix seconds at mining time
    pub timestamp: i64,
    /// PoW output over the header pre-image
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
    /// Zero for genesis
    pub prev_hash: Hash,
    pub nonce: i64,
    /// 0 for genesis, parent height + 1 otherwise
    pub height: i64,
}

impl Block {
    /// Mine a new block extending `prev_hash` at `height`
    pub fn new(transactions: Vec<Transaction>, prev_hash: Hash, height: i64) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;

        let mut block = Self {
            timestamp,
            hash: Hash::zero(),
            transactions,
            prev_hash,
            nonce: 0,
            height,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run();
        block.nonce = nonce;
        block.hash = hash;
        block
    }

    /// Mine the genesis block around its coinbase
    pub fn genesis(coinbase: Transaction) -> Self {
        Self::new(vec![coinbase], Hash::zero(), 0)
    }

    /// Merkle root over the serialized transactions, in block order
    pub fn hash_transactions(&self) -> Hash {
        let leaves: Vec<Vec<u8>> = self.transactions.iter().map(|tx| tx.serialize()).collect();
        MerkleTree::new(&leaves).root()
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
