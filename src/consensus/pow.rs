//! Proof of work
//!
//! A block hash is valid when, read as a big-endian integer, it is
//! strictly below 2^(256 - difficulty). The hash pre-image binds the
//! previous hash, the transaction Merkle root, the nonce, and the
//! difficulty itself.

use crate::constants::DIFFICULTY;
use crate::consensus::Block;
use crate::crypto::{sha256, Hash};

/// Proof-of-work context for one block
pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: [u8; 32],
    difficulty: u32,
}

/// Big-endian bytes of 2^(256 - difficulty)
fn target_bytes(difficulty: u32) -> [u8; 32] {
    debug_assert!(difficulty > 0 && difficulty < 256);
    let bit = 256 - difficulty as usize;
    let mut target = [0u8; 32];
    target[31 - bit / 8] = 1 << (bit % 8);
    target
}

/// Strict big-endian comparison: hash < target
fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for i in 0..32 {
        if hash[i] < target[i] {
            return true;
        }
        if hash[i] > target[i] {
            return false;
        }
    }
    false
}

impl<'a> ProofOfWork<'a> {
    /// Context at the protocol difficulty
    pub fn new(block: &'a Block) -> Self {
        Self::with_difficulty(block, DIFFICULTY)
    }

    /// Context at an explicit difficulty
    pub fn with_difficulty(block: &'a Block, difficulty: u32) -> Self {
        Self {
            block,
            target: target_bytes(difficulty),
            difficulty,
        }
    }

    /// Hash pre-image for a candidate nonce
    pub fn init_data(&self, nonce: i64) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 32 + 8 + 8);
        data.extend_from_slice(self.block.prev_hash.as_bytes());
        data.extend_from_slice(self.block.hash_transactions().as_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&(self.difficulty as i64).to_be_bytes());
        data
    }

    /// Search nonces from zero until the target is met
    ///
    /// At the protocol difficulty a solution lands within milliseconds;
    /// the i64 bound only caps a pathological search.
    pub fn run(&self) -> (i64, Hash) {
        let mut hash = Hash::zero();
        let mut nonce: i64 = 0;

        while nonce < i64::MAX {
            hash = sha256(&self.init_data(nonce));
            if meets_target(hash.as_bytes(), &self.target) {
                break;
            }
            nonce += 1;
        }

        (nonce, hash)
    }

    /// Recompute the pre-image with the stored nonce and check the target
    pub fn validate(&self) -> bool {
        let hash = sha256(&self.init_data(self.block.nonce));
        meets_target(hash.as_bytes(), &self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::pub_key_hash_to_address;
    use crate::crypto::hash_pub_key;
    use crate::validation::Transaction;

    fn test_block() -> Block {
        let address = pub_key_hash_to_address(&hash_pub_key(&[3u8; 64]));
        let coinbase = Transaction::coinbase(&address, "pow test").unwrap();
        Block::new(vec![coinbase], Hash::zero(), 0)
    }

    #[test]
    fn test_target_bytes_difficulty_12() {
        // 2^244: bit 4 of byte 1
        let target = target_bytes(12);
        assert_eq!(target[1], 0x10);
        assert_eq!(target.iter().filter(|&&b| b != 0).count(), 1);
    }

    #[test]
    fn test_target_bytes_byte_aligned() {
        // 2^248 = 0x01 in the leading byte
        let target = target_bytes(8);
        assert_eq!(target[0], 0x01);
    }

    #[test]
    fn test_meets_target_strict() {
        let target = target_bytes(12);
        assert!(!meets_target(&target, &target));

        let mut below = target;
        below[1] = 0x0f;
        below[31] = 0xff;
        assert!(meets_target(&below, &target));

        let mut above = target;
        above[0] = 0x01;
        assert!(!meets_target(&above, &target));
    }

    #[test]
    fn test_mined_block_validates() {
        let block = test_block();
        let pow = ProofOfWork::new(&block);
        assert!(pow.validate());
    }

    #[test]
    fn test_validation_is_deterministic() {
        let block = test_block();
        let pow = ProofOfWork::new(&block);
        assert_eq!(pow.validate(), pow.validate());
    }

    #[test]
    fn test_mutated_nonce_fails() {
        let mut block = test_block();
        block.nonce += 1;
        // A nonce off by one either misses the target or hashes elsewhere
        let pow = ProofOfWork::new(&block);
        let recomputed = sha256(&pow.init_data(block.nonce));
        assert_ne!(recomputed, block.hash);
    }

    #[test]
    fn test_mutated_prev_hash_fails() {
        let mut block = test_block();
        block.prev_hash = sha256(b"another parent");
        let pow = ProofOfWork::new(&block);
        let recomputed = sha256(&pow.init_data(block.nonce));
        assert_ne!(recomputed, block.hash);
    }

    #[test]
    fn test_run_finds_valid_nonce_at_low_difficulty() {
        let address = pub_key_hash_to_address(&hash_pub_key(&[4u8; 64]));
        let coinbase = Transaction::coinbase(&address, "easy").unwrap();
        let block = Block {
            timestamp: 0,
            hash: Hash::zero(),
            transactions: vec![coinbase],
            prev_hash: Hash::zero(),
            nonce: 0,
            height: 0,
        };

        let pow = ProofOfWork::with_difficulty(&block, 4);
        let (nonce, hash) = pow.run();
        assert!(nonce >= 0);
        assert!(meets_target(hash.as_bytes(), &target_bytes(4)));
    }
}
