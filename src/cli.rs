//! Command-line surface
//!
//! Thin shell over the library: parse flags, check addresses, invoke
//! one core operation. Every subcommand requires the `NODE_ID`
//! environment variable, which doubles as the gossip listen port.

use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::consensus::ProofOfWork;
use crate::constants::SEED_NODE;
use crate::crypto::{address_to_pub_key_hash, validate_address};
use crate::p2p::{self, Node};
use crate::storage::{BlockChain, UtxoSet};
use crate::validation::Transaction;
use crate::wallet::Wallets;

#[derive(Parser)]
#[command(name = "cinder")]
#[command(about = "A small proof-of-work UTXO blockchain node", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get the balance of an address
    Getbalance {
        /// The wallet address to query
        #[arg(long)]
        address: String,
    },

    /// Create a chain whose genesis reward pays an address
    Createblockchain {
        /// Recipient of the genesis coinbase
        #[arg(long)]
        address: String,
    },

    /// Print every block from tip to genesis
    Printchain,

    /// Send an amount from one owned address to another address
    Send {
        /// The source wallet address
        #[arg(long)]
        from: String,
        /// The destination address
        #[arg(long)]
        to: String,
        /// The amount to send, must be greater than zero
        #[arg(long)]
        amount: u64,
        /// Mine the transaction immediately on this node
        #[arg(long, default_value = "false")]
        mine: bool,
    },

    /// Create a new wallet
    Createwallet,

    /// List the addresses in the wallet file
    Listaddresses,

    /// Rebuild the UTXO index from the chain
    Reindexutxo,

    /// Start the gossip server; --miner enables mining
    Startnode {
        /// Address receiving mining rewards
        #[arg(long)]
        miner: Option<String>,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Dispatch a parsed command
pub async fn run(cli: Cli) -> CliResult {
    let node_id = std::env::var("NODE_ID").map_err(|_| "NODE_ID env is not set")?;

    match cli.command {
        Commands::Getbalance { address } => get_balance(&address, &node_id),
        Commands::Createblockchain { address } => create_blockchain(&address, &node_id),
        Commands::Printchain => print_chain(&node_id),
        Commands::Send {
            from,
            to,
            amount,
            mine,
        } => send(&from, &to, amount, &node_id, mine).await,
        Commands::Createwallet => create_wallet(&node_id),
        Commands::Listaddresses => list_addresses(&node_id),
        Commands::Reindexutxo => reindex_utxo(&node_id),
        Commands::Startnode { miner } => start_node(&node_id, miner).await,
    }
}

fn get_balance(address: &str, node_id: &str) -> CliResult {
    let pub_key_hash = address_to_pub_key_hash(address).ok_or("invalid address")?;

    let chain = BlockChain::open(node_id)?;
    let utxo_set = UtxoSet::new(&chain);

    let balance: u64 = utxo_set
        .find_unspent(&pub_key_hash)?
        .iter()
        .map(|out| out.value)
        .sum();

    println!("Balance of {}: {}", address, balance);
    Ok(())
}

fn create_blockchain(address: &str, node_id: &str) -> CliResult {
    if !validate_address(address) {
        return Err("invalid address".into());
    }

    let chain = BlockChain::create(node_id, address)?;
    UtxoSet::new(&chain).reindex()?;

    println!("Blockchain created, genesis reward paid to {}", address);
    Ok(())
}

fn print_chain(node_id: &str) -> CliResult {
    let chain = BlockChain::open(node_id)?;

    for block in chain.iter() {
        let block = block?;

        println!("Height:    {}", block.height);
        println!("Prev hash: {}", block.prev_hash);
        println!("Hash:      {}", block.hash);
        println!("PoW:       {}", ProofOfWork::new(&block).validate());
        for tx in &block.transactions {
            println!("{}", tx);
        }
        println!();
    }

    Ok(())
}

async fn send(from: &str, to: &str, amount: u64, node_id: &str, mine: bool) -> CliResult {
    if !validate_address(from) || !validate_address(to) {
        return Err("invalid address".into());
    }
    if amount == 0 {
        return Err("amount must be greater than zero".into());
    }

    let chain = BlockChain::open(node_id)?;
    let utxo_set = UtxoSet::new(&chain);

    let wallets = Wallets::create(node_id)?;
    let wallet = wallets.get_wallet(from)?;

    let tx = Transaction::new_utxo(wallet, to, amount, &utxo_set)?;

    if mine {
        let coinbase = Transaction::coinbase(from, "")?;
        let block = chain.mine_block(vec![coinbase, tx])?;
        utxo_set.update(&block)?;
        println!("Mined block {}", block.hash);
    } else {
        p2p::send_transaction(SEED_NODE, &tx).await?;
        println!("Transaction sent to {}", SEED_NODE);
    }

    println!("Success");
    Ok(())
}

fn create_wallet(node_id: &str) -> CliResult {
    let mut wallets = Wallets::create(node_id)?;
    let address = wallets.add_wallet();
    wallets.save(node_id)?;

    println!("New address: {}", address);
    Ok(())
}

fn list_addresses(node_id: &str) -> CliResult {
    let wallets = Wallets::create(node_id)?;
    for address in wallets.all_addresses() {
        println!("{}", address);
    }
    Ok(())
}

fn reindex_utxo(node_id: &str) -> CliResult {
    let chain = BlockChain::open(node_id)?;
    let utxo_set = UtxoSet::new(&chain);
    utxo_set.reindex()?;

    let count = utxo_set.count_transactions()?;
    println!("Done, {} transactions in the UTXO set", count);
    Ok(())
}

async fn start_node(node_id: &str, miner: Option<String>) -> CliResult {
    println!("Starting node {}", node_id);

    let miner_address = match miner {
        Some(address) => {
            if !validate_address(&address) {
                return Err("invalid miner address".into());
            }
            println!("Mining is on, rewards go to {}", address);
            address
        }
        None => String::new(),
    };

    let chain = BlockChain::open(node_id)?;
    let node = Arc::new(Node::new(node_id, miner_address, chain));
    node.start().await?;
    Ok(())
}
