//! Multi-node gossip convergence over localhost TCP
//!
//! Each test runs its own network on dedicated ports with in-memory
//! chain stores; nodes converge through the real server loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use cinder::crypto::hash_pub_key;
use cinder::p2p::{self, Message, Node, Version};
use cinder::storage::{BlockChain, UtxoSet};
use cinder::validation::Transaction;
use cinder::wallet::Wallet;

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

fn balance_on(node: &Node, wallet: &Wallet) -> u64 {
    UtxoSet::new(node.chain())
        .find_unspent(&hash_pub_key(&wallet.public_key))
        .unwrap()
        .iter()
        .map(|out| out.value)
        .sum()
}

/// Write one raw message to a node, as any peer would
async fn inject(addr: &str, message: &Message) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&message.to_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
}

#[tokio::test]
async fn two_node_sync_converges() {
    let seed_addr = "localhost:4601";

    // Seed state: A mined genesis, then paid B 5 in a mined block
    let a = Wallet::generate();
    let b = Wallet::generate();
    let chain = BlockChain::create_in_memory(&a.address()).unwrap();
    let utxo_set = UtxoSet::new(&chain);
    utxo_set.reindex().unwrap();

    let tx = Transaction::new_utxo(&a, &b.address(), 5, &utxo_set).unwrap();
    let coinbase = Transaction::coinbase(&a.address(), "").unwrap();
    let block = chain.mine_block(vec![coinbase, tx]).unwrap();
    utxo_set.update(&block).unwrap();
    let seed_tip = chain.last_hash();

    let seed = Arc::new(Node::with_seed("4601", String::new(), chain, seed_addr));
    tokio::spawn(Arc::clone(&seed).start());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A fresh node with its own throwaway genesis joins and pulls
    let fresh_chain = BlockChain::create_in_memory(&Wallet::generate().address()).unwrap();
    UtxoSet::new(&fresh_chain).reindex().unwrap();
    let fresh = Arc::new(Node::with_seed("4602", String::new(), fresh_chain, seed_addr));
    tokio::spawn(Arc::clone(&fresh).start());

    assert!(
        wait_until(
            || fresh.chain().last_hash() == seed_tip
                && balance_on(&fresh, &a) == 35
                && balance_on(&fresh, &b) == 5,
            Duration::from_secs(20),
        )
        .await,
        "fresh node never converged on the seed tip"
    );

    assert_eq!(
        fresh.chain().get_best_height().unwrap(),
        seed.chain().get_best_height().unwrap()
    );
    assert_eq!(balance_on(&fresh, &a), balance_on(&seed, &a));
    assert_eq!(balance_on(&fresh, &b), balance_on(&seed, &b));
}

#[tokio::test]
async fn transaction_flood_triggers_mining_and_convergence() {
    let seed_addr = "localhost:4711";

    let a = Wallet::generate();
    let b = Wallet::generate();
    let c = Wallet::generate();
    let m = Wallet::generate();

    // Seed chain: genesis funds A, a second block funds C, so two
    // submitted transactions spend disjoint outputs
    let chain = BlockChain::create_in_memory(&a.address()).unwrap();
    let funding = Transaction::coinbase(&c.address(), "").unwrap();
    chain.mine_block(vec![funding]).unwrap();
    UtxoSet::new(&chain).reindex().unwrap();
    let seed_tip = chain.last_hash();

    let seed = Arc::new(Node::with_seed("4711", String::new(), chain, seed_addr));
    tokio::spawn(Arc::clone(&seed).start());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let plain_chain = BlockChain::create_in_memory(&Wallet::generate().address()).unwrap();
    let plain = Arc::new(Node::with_seed("4712", String::new(), plain_chain, seed_addr));
    tokio::spawn(Arc::clone(&plain).start());

    let miner_chain = BlockChain::create_in_memory(&Wallet::generate().address()).unwrap();
    let miner = Arc::new(Node::with_seed("4713", m.address(), miner_chain, seed_addr));
    tokio::spawn(Arc::clone(&miner).start());

    assert!(
        wait_until(
            || plain.chain().last_hash() == seed_tip && miner.chain().last_hash() == seed_tip,
            Duration::from_secs(20),
        )
        .await,
        "nodes never synced the seed chain"
    );

    // Introduce the plain node to the miner so mined-block inventory
    // reaches it directly
    inject(
        "localhost:4713",
        &Message::Version(Version {
            version: 1,
            best_height: 1,
            addr_from: "localhost:4712".to_string(),
        }),
    )
    .await;

    // A client submits two spends to the seed; it floods them, and the
    // miner mines once its pool holds both
    let seed_utxo = UtxoSet::new(seed.chain());
    let tx1 = Transaction::new_utxo(&a, &b.address(), 5, &seed_utxo).unwrap();
    let tx2 = Transaction::new_utxo(&c, &b.address(), 7, &seed_utxo).unwrap();
    p2p::send_transaction(seed_addr, &tx1).await.unwrap();
    p2p::send_transaction(seed_addr, &tx2).await.unwrap();

    assert!(
        wait_until(
            || {
                let tip = miner.chain().last_hash();
                miner.chain().get_best_height().unwrap_or(0) == 2
                    && seed.chain().last_hash() == tip
                    && plain.chain().last_hash() == tip
                    && [&seed, &plain, &miner]
                        .iter()
                        .all(|node| balance_on(node, &m) == 20 && balance_on(node, &b) == 12)
            },
            Duration::from_secs(30),
        )
        .await,
        "network never converged on the mined block"
    );

    // Reward reached the miner address, payments reached B, everywhere
    for node in [&seed, &plain, &miner] {
        assert_eq!(balance_on(node, &m), 20);
        assert_eq!(balance_on(node, &b), 12);
    }
}
