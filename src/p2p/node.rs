//! Gossip node
//!
//! One whole TCP connection carries one message: the handler reads to
//! EOF, dispatches on the command, and replies over fresh connections.
//! All mutable node state sits behind mutexes on the `Node` value; none
//! of them is held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::consensus::Block;
use crate::constants::{PROTOCOL_VERSION, SEED_NODE};
use crate::crypto::Hash;
use crate::p2p::{
    Addr, BlockPayload, GetBlocks, GetData, Inv, Message, NetError, TxPayload, Version,
    KIND_BLOCK, KIND_TX,
};
use crate::storage::{BlockChain, ChainError, UtxoSet};
use crate::validation::Transaction;

/// A running gossip participant
pub struct Node {
    node_address: String,
    miner_address: String,
    chain: BlockChain,
    known_nodes: Mutex<Vec<String>>,
    blocks_in_transit: Mutex<Vec<Hash>>,
    mempool: Mutex<HashMap<String, Transaction>>,
}

impl Node {
    /// Node listening on `localhost:<node_id>` with the default seed
    pub fn new(node_id: &str, miner_address: String, chain: BlockChain) -> Self {
        Self::with_seed(node_id, miner_address, chain, SEED_NODE)
    }

    /// Node with an explicit seed address; tests use this to run
    /// several networks side by side
    pub fn with_seed(node_id: &str, miner_address: String, chain: BlockChain, seed: &str) -> Self {
        Self {
            node_address: format!("localhost:{}", node_id),
            miner_address,
            chain,
            known_nodes: Mutex::new(vec![seed.to_string()]),
            blocks_in_transit: Mutex::new(Vec::new()),
            mempool: Mutex::new(HashMap::new()),
        }
    }

    /// The chain this node serves
    pub fn chain(&self) -> &BlockChain {
        &self.chain
    }

    /// Bind, announce our version to the seed, and serve until ctrl-c
    pub async fn start(self: Arc<Self>) -> Result<(), NetError> {
        let listener = TcpListener::bind(&self.node_address).await?;
        log::info!("node listening on {}", self.node_address);

        let seed = { self.known_nodes.lock().unwrap()[0].clone() };
        if seed != self.node_address {
            self.send_version(&seed).await?;
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            log::debug!("connection from {}", peer);
                            let node = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = node.handle_connection(stream).await {
                                    log::error!("connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => log::error!("accept failed: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("shutdown signal received, closing chain store");
                    self.chain.flush()?;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read one whole request and dispatch it
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), NetError> {
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await?;
        drop(stream);

        let message = Message::from_bytes(&request)?;
        log::debug!("received {} command", message.command());

        match message {
            Message::Addr(payload) => self.handle_addr(payload).await,
            Message::Block(payload) => self.handle_block(payload).await,
            Message::GetBlocks(payload) => self.handle_get_blocks(payload).await,
            Message::GetData(payload) => self.handle_get_data(payload).await,
            Message::Inv(payload) => self.handle_inv(payload).await,
            Message::Tx(payload) => self.handle_tx(payload).await,
            Message::Version(payload) => self.handle_version(payload).await,
        }
    }

    /// Learn new peers, then ask everyone for their blocks
    async fn handle_addr(&self, payload: Addr) -> Result<(), NetError> {
        {
            let mut known = self.known_nodes.lock().unwrap();
            for addr in payload.addr_list {
                if !known.contains(&addr) {
                    known.push(addr);
                }
            }
            log::info!("{} known nodes", known.len());
        }
        self.request_blocks().await
    }

    /// Store a delivered block, then pull the next one in transit or,
    /// once drained, rebuild the UTXO index
    async fn handle_block(&self, payload: BlockPayload) -> Result<(), NetError> {
        let block = Block::deserialize(&payload.block).map_err(|_| NetError::Malformed)?;
        self.chain.add_block(&block)?;
        log::info!("added block {}", block.hash);

        let next = {
            let mut transit = self.blocks_in_transit.lock().unwrap();
            if transit.is_empty() {
                None
            } else {
                Some(transit.remove(0))
            }
        };

        match next {
            Some(hash) => self.send_get_data(&payload.addr_from, KIND_BLOCK, hash).await,
            None => {
                UtxoSet::new(&self.chain).reindex()?;
                Ok(())
            }
        }
    }

    /// Reply with our full hash list, tip first
    async fn handle_get_blocks(&self, payload: GetBlocks) -> Result<(), NetError> {
        let hashes = self.chain.get_block_hashes()?;
        self.send_inv(&payload.addr_from, KIND_BLOCK, hashes).await
    }

    /// Serve a single block or mempool transaction
    async fn handle_get_data(&self, payload: GetData) -> Result<(), NetError> {
        match payload.kind.as_str() {
            KIND_BLOCK => match self.chain.get_block(&payload.id) {
                Ok(block) => self.send_block(&payload.addr_from, &block).await,
                Err(ChainError::BlockNotFound) => Ok(()),
                Err(e) => Err(e.into()),
            },
            KIND_TX => {
                let tx = {
                    let pool = self.mempool.lock().unwrap();
                    pool.get(&payload.id.to_hex()).cloned()
                };
                match tx {
                    Some(tx) => self.send_tx(&payload.addr_from, &tx).await,
                    None => Ok(()),
                }
            }
            _ => Err(NetError::Malformed),
        }
    }

    /// Track announced blocks and pull the first; fetch unknown txs
    async fn handle_inv(&self, payload: Inv) -> Result<(), NetError> {
        log::info!("received inventory: {} {}", payload.items.len(), payload.kind);

        match payload.kind.as_str() {
            KIND_BLOCK => {
                let first = *payload.items.first().ok_or(NetError::Malformed)?;
                {
                    let mut transit = self.blocks_in_transit.lock().unwrap();
                    *transit = payload.items.clone();
                    transit.retain(|hash| *hash != first);
                }
                self.send_get_data(&payload.addr_from, KIND_BLOCK, first).await
            }
            KIND_TX => {
                let txid = *payload.items.first().ok_or(NetError::Malformed)?;
                let unknown = {
                    let pool = self.mempool.lock().unwrap();
                    !pool.contains_key(&txid.to_hex())
                };
                if unknown {
                    self.send_get_data(&payload.addr_from, KIND_TX, txid).await
                } else {
                    Ok(())
                }
            }
            _ => Err(NetError::Malformed),
        }
    }

    /// Pool the transaction; the seed floods it, a miner mines once the
    /// pool is deep enough
    async fn handle_tx(&self, payload: TxPayload) -> Result<(), NetError> {
        let tx = Transaction::deserialize(&payload.transaction).map_err(|_| NetError::Malformed)?;
        log::info!("received tx {}", tx.id);

        let pool_len = {
            let mut pool = self.mempool.lock().unwrap();
            pool.insert(tx.id.to_hex(), tx.clone());
            pool.len()
        };

        let (is_seed, peers) = {
            let known = self.known_nodes.lock().unwrap();
            (known[0] == self.node_address, known.clone())
        };

        if is_seed {
            for node in peers {
                if node != self.node_address && node != payload.addr_from {
                    self.send_inv(&node, KIND_TX, vec![tx.id]).await?;
                }
            }
        } else if pool_len >= 2 && !self.miner_address.is_empty() {
            self.mine_transactions().await?;
        }

        Ok(())
    }

    /// Pull from taller peers, push our version at shorter ones, and
    /// learn the sender
    async fn handle_version(&self, payload: Version) -> Result<(), NetError> {
        let best_height = self.chain.get_best_height()?;

        if best_height < payload.best_height {
            self.send_get_blocks(&payload.addr_from).await?;
        } else if best_height > payload.best_height {
            self.send_version(&payload.addr_from).await?;
        }

        let mut known = self.known_nodes.lock().unwrap();
        if !known.contains(&payload.addr_from) {
            known.push(payload.addr_from);
        }
        Ok(())
    }

    /// Mine the pooled transactions into blocks until the pool is empty
    /// or only invalid transactions remain
    async fn mine_transactions(&self) -> Result<(), NetError> {
        loop {
            let candidates: Vec<Transaction> = {
                let pool = self.mempool.lock().unwrap();
                pool.values()
                    .filter(|tx| matches!(self.chain.verify_transaction(tx), Ok(true)))
                    .cloned()
                    .collect()
            };

            if candidates.is_empty() {
                log::info!("no valid transactions to mine");
                return Ok(());
            }

            let coinbase = Transaction::coinbase(&self.miner_address, "")?;
            let mut txs = candidates;
            txs.push(coinbase);

            let block = self.chain.mine_block(txs)?;
            UtxoSet::new(&self.chain).reindex()?;
            log::info!("mined block {}", block.hash);

            {
                let mut pool = self.mempool.lock().unwrap();
                for tx in &block.transactions {
                    pool.remove(&tx.id.to_hex());
                }
            }

            let peers = { self.known_nodes.lock().unwrap().clone() };
            for node in peers {
                if node != self.node_address {
                    self.send_inv(&node, KIND_BLOCK, vec![block.hash]).await?;
                }
            }

            if self.mempool.lock().unwrap().is_empty() {
                return Ok(());
            }
        }
    }

    /// Ask every known peer for its block list
    async fn request_blocks(&self) -> Result<(), NetError> {
        let peers = { self.known_nodes.lock().unwrap().clone() };
        for node in peers {
            self.send_get_blocks(&node).await?;
        }
        Ok(())
    }

    async fn send_block(&self, addr: &str, block: &Block) -> Result<(), NetError> {
        let message = Message::Block(BlockPayload {
            addr_from: self.node_address.clone(),
            block: block.serialize(),
        });
        self.send_data(addr, &message.to_bytes()).await
    }

    async fn send_inv(&self, addr: &str, kind: &str, items: Vec<Hash>) -> Result<(), NetError> {
        let message = Message::Inv(Inv {
            addr_from: self.node_address.clone(),
            kind: kind.to_string(),
            items,
        });
        self.send_data(addr, &message.to_bytes()).await
    }

    async fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<(), NetError> {
        let message = Message::Tx(TxPayload {
            addr_from: self.node_address.clone(),
            transaction: tx.serialize(),
        });
        self.send_data(addr, &message.to_bytes()).await
    }

    async fn send_get_blocks(&self, addr: &str) -> Result<(), NetError> {
        let message = Message::GetBlocks(GetBlocks {
            addr_from: self.node_address.clone(),
        });
        self.send_data(addr, &message.to_bytes()).await
    }

    async fn send_get_data(&self, addr: &str, kind: &str, id: Hash) -> Result<(), NetError> {
        let message = Message::GetData(GetData {
            addr_from: self.node_address.clone(),
            kind: kind.to_string(),
            id,
        });
        self.send_data(addr, &message.to_bytes()).await
    }

    async fn send_version(&self, addr: &str) -> Result<(), NetError> {
        let message = Message::Version(Version {
            version: PROTOCOL_VERSION,
            best_height: self.chain.get_best_height()?,
            addr_from: self.node_address.clone(),
        });
        self.send_data(addr, &message.to_bytes()).await
    }

    /// Dial, write the whole message, close
    ///
    /// An unreachable peer is evicted from the membership list rather
    /// than failing the caller; it can be re-learned from a later
    /// `version` or `addr`.
    async fn send_data(&self, addr: &str, data: &[u8]) -> Result<(), NetError> {
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("{} is not available, evicting: {}", addr, e);
                let mut known = self.known_nodes.lock().unwrap();
                known.retain(|node| node != addr);
                return Ok(());
            }
        };

        stream.write_all(data).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// One-shot transaction submission, used by the CLI when it is not
/// running a server of its own
pub async fn send_transaction(addr: &str, tx: &Transaction) -> Result<(), NetError> {
    let message = Message::Tx(TxPayload {
        addr_from: String::new(),
        transaction: tx.serialize(),
    });

    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| NetError::PeerUnreachable(format!("{}: {}", addr, e)))?;
    stream.write_all(&message.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
