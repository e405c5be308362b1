//! Derived UTXO index
//!
//! One sled tree entry per transaction that still has unspent outputs:
//! key = tx id, value = the remaining outputs. The index is rebuilt by
//! a full chain scan (`reindex`) or advanced one block at a time
//! (`update`).

use sled::Batch;
use std::collections::HashMap;

use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::{BlockChain, ChainError};
use crate::validation::{TxOutput, TxOutputs};

/// Deletion batch size during reindex
const COLLECT_SIZE: usize = 100_000;

/// View over the chain's UTXO tree
pub struct UtxoSet<'a> {
    pub chain: &'a BlockChain,
}

impl<'a> UtxoSet<'a> {
    pub fn new(chain: &'a BlockChain) -> Self {
        Self { chain }
    }

    /// Drop the whole index and rebuild it from a full chain scan
    pub fn reindex(&self) -> Result<(), ChainError> {
        self.delete_all()?;

        let utxo = self.chain.find_utxo()?;
        let tree = self.chain.utxo_tree();

        let mut batch = Batch::default();
        for (txid_hex, outs) in utxo {
            let key = hex::decode(&txid_hex)
                .map_err(|_| ChainError::Corrupt("malformed tx id in scan".into()))?;
            batch.insert(key, outs.serialize());
        }
        tree.apply_batch(batch)?;
        self.chain.flush()
    }

    /// Remove every index entry, in bounded batches
    fn delete_all(&self) -> Result<(), ChainError> {
        let tree = self.chain.utxo_tree();

        loop {
            let mut batch = Batch::default();
            let mut collected = 0usize;
            for key in tree.iter().keys().take(COLLECT_SIZE) {
                batch.remove(key?);
                collected += 1;
            }
            if collected == 0 {
                break;
            }
            tree.apply_batch(batch)?;
        }

        Ok(())
    }

    /// Advance the index across one freshly stored block
    ///
    /// Spent outputs are dropped from their entries (the entry itself is
    /// deleted once empty) and every transaction's outputs are inserted.
    /// All writes land in a single atomic batch.
    pub fn update(&self, block: &Block) -> Result<(), ChainError> {
        let tree = self.chain.utxo_tree();

        // Staged view so that several inputs spending the same previous
        // transaction within this block observe each other's shrinkage.
        let mut staged: HashMap<Hash, Option<TxOutputs>> = HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let entry = match staged.get(&input.prev_txid) {
                        Some(Some(outs)) => outs.clone(),
                        Some(None) => {
                            return Err(ChainError::Corrupt(
                                "input spends an exhausted index entry".into(),
                            ))
                        }
                        None => {
                            let stored = tree.get(input.prev_txid.as_bytes())?.ok_or_else(|| {
                                ChainError::Corrupt("input spends an unknown index entry".into())
                            })?;
                            TxOutputs::deserialize(&stored)?
                        }
                    };

                    let remaining: Vec<TxOutput> = entry
                        .outputs
                        .iter()
                        .enumerate()
                        .filter(|(idx, _)| *idx as i64 != input.out)
                        .map(|(_, out)| out.clone())
                        .collect();

                    let next = if remaining.is_empty() {
                        None
                    } else {
                        Some(TxOutputs { outputs: remaining })
                    };
                    staged.insert(input.prev_txid, next);
                }
            }

            staged.insert(
                tx.id,
                Some(TxOutputs {
                    outputs: tx.outputs.clone(),
                }),
            );
        }

        let mut batch = Batch::default();
        for (txid, entry) in staged {
            match entry {
                Some(outs) => batch.insert(txid.as_bytes().as_slice(), outs.serialize()),
                None => batch.remove(txid.as_bytes().as_slice()),
            }
        }
        tree.apply_batch(batch)?;
        self.chain.flush()
    }

    /// Every indexed output locked to `pub_key_hash`
    pub fn find_unspent(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, ChainError> {
        let tree = self.chain.utxo_tree();
        let mut unspent = Vec::new();

        for item in tree.iter() {
            let (_, value) = item?;
            let outs = TxOutputs::deserialize(&value)?;
            for out in outs.outputs {
                if out.is_locked_with_key(pub_key_hash) {
                    unspent.push(out);
                }
            }
        }

        Ok(unspent)
    }

    /// Collect output references for a spend of `amount`
    ///
    /// The accumulated total is checked per output rather than per
    /// transaction, so the final transaction's references may overshoot
    /// slightly; callers only rely on `accumulated >= amount`.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<i64>>), ChainError> {
        let tree = self.chain.utxo_tree();
        let mut unspent_outs: HashMap<String, Vec<i64>> = HashMap::new();
        let mut accumulated = 0u64;

        for item in tree.iter() {
            let (key, value) = item?;
            let txid = hex::encode(&key);
            let outs = TxOutputs::deserialize(&value)?;

            for (out_idx, out) in outs.outputs.iter().enumerate() {
                if out.is_locked_with_key(pub_key_hash) && accumulated < amount {
                    accumulated += out.value;
                    unspent_outs.entry(txid.clone()).or_default().push(out_idx as i64);
                }
            }
        }

        Ok((accumulated, unspent_outs))
    }

    /// Number of transactions with at least one unspent output
    pub fn count_transactions(&self) -> Result<usize, ChainError> {
        Ok(self.chain.utxo_tree().len())
    }
}
