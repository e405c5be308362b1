//! Durable chain store
//!
//! Blocks live in a sled tree keyed by block hash; the `lh` metadata key
//! points at the best tip. Adopting a tip requires a strictly higher
//! height, so equal-height side chains stay stored but never win.

use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

use crate::consensus::Block;
use crate::constants;
use crate::crypto::{Hash, PrivateKey};
use crate::validation::{Transaction, TxError, TxOutputs};

const TIP_KEY: &[u8] = b"lh";
const BLOCKS_TREE: &str = "blocks";
const METADATA_TREE: &str = "metadata";
const UTXO_TREE: &str = "utxo";

const GENESIS_COINBASE_DATA: &str = "First transaction from genesis";

/// Chain store errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain store unavailable: {0}")]
    Db(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("blockchain already exists")]
    AlreadyExists,
    #[error("no existing blockchain found")]
    NoChain,
    #[error("invalid address")]
    InvalidAddress,
    #[error("block not found")]
    BlockNotFound,
    #[error("transaction not found")]
    TxNotFound,
    #[error("invalid transaction")]
    InvalidTransaction,
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("corrupt chain store: {0}")]
    Corrupt(String),
}

/// The block chain handle: a sled database plus the cached tip hash
pub struct BlockChain {
    last_hash: Mutex<Hash>,
    db: Db,
    blocks: Tree,
    metadata: Tree,
    utxo: Tree,
}

/// Open sled, retrying once when a crashed process left the store locked
fn open_db(path: &str) -> Result<Db, ChainError> {
    match sled::open(path) {
        Ok(db) => Ok(db),
        Err(sled::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
            log::warn!("chain store at {} is locked, retrying once", path);
            sled::open(path).map_err(ChainError::from)
        }
        Err(e) => Err(e.into()),
    }
}

/// An initialized store leaves sled's data file behind
fn store_exists(path: &str) -> bool {
    Path::new(path).join("db").exists()
}

impl BlockChain {
    fn from_db(db: Db, last_hash: Hash) -> Result<Self, ChainError> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let metadata = db.open_tree(METADATA_TREE)?;
        let utxo = db.open_tree(UTXO_TREE)?;
        Ok(Self {
            last_hash: Mutex::new(last_hash),
            db,
            blocks,
            metadata,
            utxo,
        })
    }

    /// Initialize a fresh chain for `node_id`, mining the genesis block
    /// with a coinbase paying `address`
    pub fn create(node_id: &str, address: &str) -> Result<Self, ChainError> {
        let path = constants::db_path(node_id);
        if store_exists(&path) {
            return Err(ChainError::AlreadyExists);
        }
        let db = open_db(&path)?;
        Self::bootstrap(db, address)
    }

    /// Open the existing chain for `node_id`
    pub fn open(node_id: &str) -> Result<Self, ChainError> {
        let path = constants::db_path(node_id);
        if !store_exists(&path) {
            return Err(ChainError::NoChain);
        }
        let db = open_db(&path)?;

        let metadata = db.open_tree(METADATA_TREE)?;
        let tip = metadata
            .get(TIP_KEY)?
            .ok_or_else(|| ChainError::Corrupt("missing tip pointer".into()))?;
        let last_hash = Hash::from_slice(&tip)
            .ok_or_else(|| ChainError::Corrupt("malformed tip pointer".into()))?;

        Self::from_db(db, last_hash)
    }

    /// A throwaway chain on a temporary sled store, for tests
    pub fn create_in_memory(address: &str) -> Result<Self, ChainError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::bootstrap(db, address)
    }

    fn bootstrap(db: Db, address: &str) -> Result<Self, ChainError> {
        let coinbase = Transaction::coinbase(address, GENESIS_COINBASE_DATA)
            .map_err(|_| ChainError::InvalidAddress)?;
        let genesis = Block::genesis(coinbase);
        log::info!("genesis block mined: {}", genesis.hash);

        let chain = Self::from_db(db, genesis.hash)?;
        chain.blocks.insert(genesis.hash.as_bytes(), genesis.serialize())?;
        chain.metadata.insert(TIP_KEY, genesis.hash.as_bytes().as_slice())?;
        chain.db.flush()?;
        Ok(chain)
    }

    /// Hash of the current best tip
    pub fn last_hash(&self) -> Hash {
        *self.last_hash.lock().unwrap()
    }

    /// Mine a block holding `transactions` on top of the current tip
    ///
    /// Every transaction must verify against the stored chain; a single
    /// failure aborts the attempt.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block, ChainError> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(ChainError::InvalidTransaction);
            }
        }

        let last_hash = self.read_tip()?;
        let last_block = self.get_block(&last_hash)?;

        let block = Block::new(transactions, last_hash, last_block.height + 1);

        self.blocks.insert(block.hash.as_bytes(), block.serialize())?;
        self.metadata.insert(TIP_KEY, block.hash.as_bytes().as_slice())?;
        self.db.flush()?;
        *self.last_hash.lock().unwrap() = block.hash;

        Ok(block)
    }

    /// Store a block received from a peer
    ///
    /// Duplicates are ignored. The block becomes the tip only when its
    /// height strictly exceeds the current tip's; otherwise it is kept
    /// as a side chain under its own hash.
    pub fn add_block(&self, block: &Block) -> Result<(), ChainError> {
        if self.blocks.contains_key(block.hash.as_bytes())? {
            return Ok(());
        }

        self.blocks.insert(block.hash.as_bytes(), block.serialize())?;

        let tip_hash = self.read_tip()?;
        let tip = self.get_block(&tip_hash)?;

        if block.height > tip.height {
            self.metadata.insert(TIP_KEY, block.hash.as_bytes().as_slice())?;
            *self.last_hash.lock().unwrap() = block.hash;
        }
        self.db.flush()?;

        Ok(())
    }

    /// Fetch a block by hash
    pub fn get_block(&self, hash: &Hash) -> Result<Block, ChainError> {
        let data = self
            .blocks
            .get(hash.as_bytes())?
            .ok_or(ChainError::BlockNotFound)?;
        Ok(Block::deserialize(&data)?)
    }

    /// Height of the best tip
    pub fn get_best_height(&self) -> Result<i64, ChainError> {
        let tip_hash = self.read_tip()?;
        Ok(self.get_block(&tip_hash)?.height)
    }

    /// All block hashes, tip first
    pub fn get_block_hashes(&self) -> Result<Vec<Hash>, ChainError> {
        let mut hashes = Vec::new();
        for block in self.iter() {
            hashes.push(block?.hash);
        }
        Ok(hashes)
    }

    /// Walk from the tip toward genesis
    ///
    /// Not safe to interleave with writes on the same handle; finish the
    /// walk before mining.
    pub fn iter(&self) -> ChainIterator {
        ChainIterator {
            current_hash: self.last_hash(),
            blocks: self.blocks.clone(),
        }
    }

    /// Scan the chain for the transaction with `id`
    pub fn find_transaction(&self, id: &Hash) -> Result<Transaction, ChainError> {
        for block in self.iter() {
            for tx in block?.transactions {
                if tx.id == *id {
                    return Ok(tx);
                }
            }
        }
        Err(ChainError::TxNotFound)
    }

    /// Resolve the previous transaction of every input
    fn resolve_prev_txs(&self, tx: &Transaction) -> Result<HashMap<String, Transaction>, ChainError> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            let prev_tx = self.find_transaction(&input.prev_txid)?;
            prev_txs.insert(prev_tx.id.to_hex(), prev_tx);
        }
        Ok(prev_txs)
    }

    /// Sign a transaction against the chain's view of its inputs
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        private_key: &PrivateKey,
    ) -> Result<(), ChainError> {
        let prev_txs = self.resolve_prev_txs(tx)?;
        tx.sign(private_key, &prev_txs)
            .map_err(|e| ChainError::Sign(e.to_string()))
    }

    /// Verify a transaction against the chain's view of its inputs
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.resolve_prev_txs(tx)?;
        match tx.verify(&prev_txs) {
            Ok(valid) => Ok(valid),
            Err(TxError::PrevTxNotFound) => Err(ChainError::TxNotFound),
            Err(e) => Err(ChainError::Sign(e.to_string())),
        }
    }

    /// Compute every unspent output by walking the whole chain
    ///
    /// Second-chance scan: an output is unspent iff no block closer to
    /// the tip spends its (txid, index) pair.
    pub fn find_utxo(&self) -> Result<HashMap<String, TxOutputs>, ChainError> {
        let mut utxo: HashMap<String, TxOutputs> = HashMap::new();
        let mut spent: HashMap<String, Vec<i64>> = HashMap::new();

        for block in self.iter() {
            let block = block?;
            for tx in &block.transactions {
                let txid = tx.id.to_hex();

                for (out_idx, out) in tx.outputs.iter().enumerate() {
                    let is_spent = spent
                        .get(&txid)
                        .map(|outs| outs.contains(&(out_idx as i64)))
                        .unwrap_or(false);
                    if is_spent {
                        continue;
                    }
                    utxo.entry(txid.clone()).or_default().outputs.push(out.clone());
                }

                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent
                            .entry(input.prev_txid.to_hex())
                            .or_default()
                            .push(input.out);
                    }
                }
            }
        }

        Ok(utxo)
    }

    /// Flush pending writes to disk; the shutdown path calls this before
    /// the process exits
    pub fn flush(&self) -> Result<(), ChainError> {
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn utxo_tree(&self) -> &Tree {
        &self.utxo
    }

    fn read_tip(&self) -> Result<Hash, ChainError> {
        let tip = self
            .metadata
            .get(TIP_KEY)?
            .ok_or_else(|| ChainError::Corrupt("missing tip pointer".into()))?;
        Hash::from_slice(&tip).ok_or_else(|| ChainError::Corrupt("malformed tip pointer".into()))
    }
}

/// Tip-to-genesis block walker
pub struct ChainIterator {
    current_hash: Hash,
    blocks: Tree,
}

impl Iterator for ChainIterator {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_zero() {
            return None;
        }

        let data = match self.blocks.get(self.current_hash.as_bytes()) {
            Ok(Some(data)) => data,
            Ok(None) => return Some(Err(ChainError::BlockNotFound)),
            Err(e) => return Some(Err(e.into())),
        };

        match Block::deserialize(&data) {
            Ok(block) => {
                self.current_hash = block.prev_hash;
                Some(Ok(block))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}
