//! Transaction model and signature binding
//!
//! A transaction id is the SHA-256 of its serialization with the id
//! zeroed. Signatures commit to a trimmed copy whose inputs carry the
//! previous output's lock in place of the public key.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::constants::BLOCK_REWARD;
use crate::crypto::{
    address_to_pub_key_hash, hash_pub_key, sha256, verify_digest, Hash, KeyError, PrivateKey,
};
use crate::storage::UtxoSet;
use crate::wallet::Wallet;

/// Transaction construction and verification errors
#[derive(Debug, Error)]
pub enum TxError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("previous transaction not found")]
    PrevTxNotFound,
    #[error("chain store error: {0}")]
    Store(String),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// A reference to a previous output, plus the proof that unlocks it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output; zero for coinbase
    pub prev_txid: Hash,
    /// Output index in that transaction; -1 for coinbase
    pub out: i64,
    /// Raw r||s signature over the trimmed-copy id
    pub signature: Vec<u8>,
    /// Raw X||Y public key; arbitrary data bytes for coinbase
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// True if this input was created by the holder of `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(&self.pub_key) == pub_key_hash
    }
}

/// A value locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Create an output locked to an address
    pub fn new(value: u64, address: &str) -> Result<Self, TxError> {
        let pub_key_hash = address_to_pub_key_hash(address).ok_or(TxError::InvalidAddress)?;
        Ok(Self { value, pub_key_hash })
    }

    /// True if the output is spendable by the holder of `pub_key_hash`
    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// The UTXO-index record: the remaining outputs of one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutputs {
    pub outputs: Vec<TxOutput>,
}

impl TxOutputs {
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// A transfer of value between public key hashes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a coinbase transaction paying the block reward to `to`
    ///
    /// Empty `data` is replaced with 24 random bytes rendered as hex, so
    /// two rewards to the same address never collide on id.
    pub fn coinbase(to: &str, data: &str) -> Result<Self, TxError> {
        let data = if data.is_empty() {
            let mut random = [0u8; 24];
            rand::rngs::OsRng.fill_bytes(&mut random);
            hex::encode(random)
        } else {
            data.to_string()
        };

        let input = TxInput {
            prev_txid: Hash::zero(),
            out: -1,
            signature: Vec::new(),
            pub_key: data.into_bytes(),
        };
        let output = TxOutput::new(BLOCK_REWARD, to)?;

        let mut tx = Self {
            id: Hash::zero(),
            inputs: vec![input],
            outputs: vec![output],
        };
        tx.id = tx.hash();
        Ok(tx)
    }

    /// Build and sign a spend of `amount` from `wallet` to `to`
    ///
    /// Inputs are gathered from the UTXO index; overshoot comes back as a
    /// change output to the sender.
    pub fn new_utxo(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UtxoSet<'_>,
    ) -> Result<Self, TxError> {
        let pub_key_hash = hash_pub_key(&wallet.public_key);
        let (accumulated, valid_outputs) = utxo_set
            .find_spendable_outputs(&pub_key_hash, amount)
            .map_err(|e| TxError::Store(e.to_string()))?;

        if accumulated < amount {
            return Err(TxError::InsufficientFunds {
                have: accumulated,
                need: amount,
            });
        }

        let mut inputs = Vec::new();
        for (txid_hex, outs) in &valid_outputs {
            let prev_txid = Hash::from_hex(txid_hex).map_err(|_| TxError::PrevTxNotFound)?;
            for &out in outs {
                inputs.push(TxInput {
                    prev_txid,
                    out,
                    signature: Vec::new(),
                    pub_key: wallet.public_key.clone(),
                });
            }
        }

        let from = wallet.address();
        let mut outputs = vec![TxOutput::new(amount, to)?];
        if accumulated > amount {
            outputs.push(TxOutput::new(accumulated - amount, &from)?);
        }

        let mut tx = Self {
            id: Hash::zero(),
            inputs,
            outputs,
        };
        tx.id = tx.hash();
        utxo_set
            .chain
            .sign_transaction(&mut tx, &wallet.private_key())
            .map_err(|e| TxError::Store(e.to_string()))?;

        Ok(tx)
    }

    /// Exactly one input with a zero previous id and out index -1
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prev_txid.is_zero() && self.inputs[0].out == -1
    }

    /// Id of this transaction: SHA-256 of the serialization with the id
    /// field zeroed
    pub fn hash(&self) -> Hash {
        let mut copy = self.clone();
        copy.id = Hash::zero();
        sha256(&copy.serialize())
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap()
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Signing pre-image: same structure with every input's signature and
    /// public key cleared
    pub fn trimmed_copy(&self) -> Self {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_txid: input.prev_txid,
                out: input.out,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Self {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Sign every input against the previous transactions it spends
    ///
    /// For each input, the trimmed copy temporarily carries the spent
    /// output's lock as its public key; the copy's id under that state is
    /// what the signature commits to.
    pub fn sign(
        &mut self,
        private_key: &PrivateKey,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<(), TxError> {
        if self.is_coinbase() {
            return Ok(());
        }

        for input in &self.inputs {
            if !prev_txs.contains_key(&input.prev_txid.to_hex()) {
                return Err(TxError::PrevTxNotFound);
            }
        }

        let mut trimmed = self.trimmed_copy();

        for idx in 0..self.inputs.len() {
            let prev_tx = &prev_txs[&trimmed.inputs[idx].prev_txid.to_hex()];
            let out = usize::try_from(trimmed.inputs[idx].out)
                .map_err(|_| TxError::PrevTxNotFound)?;
            let lock = prev_tx
                .outputs
                .get(out)
                .ok_or(TxError::PrevTxNotFound)?
                .pub_key_hash
                .clone();

            trimmed.inputs[idx].signature = Vec::new();
            trimmed.inputs[idx].pub_key = lock;
            trimmed.id = trimmed.hash();
            trimmed.inputs[idx].pub_key = Vec::new();

            self.inputs[idx].signature = private_key.sign_digest(&trimmed.id)?;
        }

        Ok(())
    }

    /// Check every input signature; mirrors [`Transaction::sign`]
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool, TxError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        for input in &self.inputs {
            if !prev_txs.contains_key(&input.prev_txid.to_hex()) {
                return Err(TxError::PrevTxNotFound);
            }
        }

        let mut trimmed = self.trimmed_copy();

        for (idx, input) in self.inputs.iter().enumerate() {
            let prev_tx = &prev_txs[&input.prev_txid.to_hex()];
            let lock = match usize::try_from(input.out)
                .ok()
                .and_then(|out| prev_tx.outputs.get(out))
            {
                Some(output) => output.pub_key_hash.clone(),
                None => return Ok(false),
            };

            trimmed.inputs[idx].signature = Vec::new();
            trimmed.inputs[idx].pub_key = lock;
            trimmed.id = trimmed.hash();
            trimmed.inputs[idx].pub_key = Vec::new();

            if !verify_digest(&input.pub_key, &trimmed.id, &input.signature) {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "-- Transaction {}", self.id)?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "   Input {}:", i)?;
            writeln!(f, "     TXID:      {}", input.prev_txid)?;
            writeln!(f, "     Out:       {}", input.out)?;
            writeln!(f, "     Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "     PubKey:    {}", hex::encode(&input.pub_key))?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "   Output {}:", i)?;
            writeln!(f, "     Value:  {}", output.value)?;
            writeln!(f, "     Script: {}", hex::encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}
