//! Gossip wire protocol
//!
//! One message per TCP connection: a 12-byte ASCII command, zero padded,
//! followed by the bincode serialization of that command's payload.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::COMMAND_LENGTH;
use crate::crypto::Hash;

/// Networking errors
#[derive(Debug, Error)]
pub enum NetError {
    #[error("malformed message")]
    Malformed,
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Chain(#[from] crate::storage::ChainError),
    #[error(transparent)]
    Tx(#[from] crate::validation::TxError),
}

/// Propagate known peer addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub addr_list: Vec<String>,
}

/// Deliver one serialized block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

/// Ask a peer for its block hash list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocks {
    pub addr_from: String,
}

/// Fetch a single block or transaction by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetData {
    pub addr_from: String,
    pub kind: String,
    pub id: Hash,
}

/// Announce object ids a peer can fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inv {
    pub addr_from: String,
    pub kind: String,
    pub items: Vec<Hash>,
}

/// Deliver one serialized transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

/// Announce protocol version and tip height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: i64,
    pub best_height: i64,
    pub addr_from: String,
}

/// Inventory kind for blocks
pub const KIND_BLOCK: &str = "block";
/// Inventory kind for transactions
pub const KIND_TX: &str = "tx";

/// One wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Addr(Addr),
    Block(BlockPayload),
    GetBlocks(GetBlocks),
    GetData(GetData),
    Inv(Inv),
    Tx(TxPayload),
    Version(Version),
}

/// Zero-pad a command name to the fixed width
pub fn cmd_to_bytes(cmd: &str) -> Vec<u8> {
    let mut bytes = vec![0u8; COMMAND_LENGTH];
    bytes[..cmd.len()].copy_from_slice(cmd.as_bytes());
    bytes
}

/// Strip zero padding back off a command field
pub fn bytes_to_cmd(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

impl Message {
    /// The wire command for this message
    pub fn command(&self) -> &'static str {
        match self {
            Message::Addr(_) => "addr",
            Message::Block(_) => "block",
            Message::GetBlocks(_) => "getblocks",
            Message::GetData(_) => "getdata",
            Message::Inv(_) => "inv",
            Message::Tx(_) => "tx",
            Message::Version(_) => "version",
        }
    }

    /// Serialize as command field + payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = match self {
            Message::Addr(p) => bincode::serialize(p),
            Message::Block(p) => bincode::serialize(p),
            Message::GetBlocks(p) => bincode::serialize(p),
            Message::GetData(p) => bincode::serialize(p),
            Message::Inv(p) => bincode::serialize(p),
            Message::Tx(p) => bincode::serialize(p),
            Message::Version(p) => bincode::serialize(p),
        }
        .unwrap();

        let mut bytes = cmd_to_bytes(self.command());
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Parse a whole received request
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetError> {
        if bytes.len() < COMMAND_LENGTH {
            return Err(NetError::Malformed);
        }

        let command = bytes_to_cmd(&bytes[..COMMAND_LENGTH]);
        let payload = &bytes[COMMAND_LENGTH..];

        let message = match command.as_str() {
            "addr" => Message::Addr(decode(payload)?),
            "block" => Message::Block(decode(payload)?),
            "getblocks" => Message::GetBlocks(decode(payload)?),
            "getdata" => Message::GetData(decode(payload)?),
            "inv" => Message::Inv(decode(payload)?),
            "tx" => Message::Tx(decode(payload)?),
            "version" => Message::Version(decode(payload)?),
            _ => return Err(NetError::Malformed),
        };

        Ok(message)
    }
}

fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, NetError> {
    bincode::deserialize(payload).map_err(|_| NetError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[test]
    fn test_cmd_field_roundtrip() {
        let bytes = cmd_to_bytes("getblocks");
        assert_eq!(bytes.len(), COMMAND_LENGTH);
        assert_eq!(bytes_to_cmd(&bytes), "getblocks");
    }

    #[test]
    fn test_every_command_roundtrips() {
        let messages = vec![
            Message::Addr(Addr {
                addr_list: vec!["localhost:3000".into(), "localhost:3001".into()],
            }),
            Message::Block(BlockPayload {
                addr_from: "localhost:3001".into(),
                block: vec![1, 2, 3],
            }),
            Message::GetBlocks(GetBlocks {
                addr_from: "localhost:3001".into(),
            }),
            Message::GetData(GetData {
                addr_from: "localhost:3001".into(),
                kind: KIND_BLOCK.into(),
                id: sha256(b"block"),
            }),
            Message::Inv(Inv {
                addr_from: "localhost:3001".into(),
                kind: KIND_TX.into(),
                items: vec![sha256(b"a"), sha256(b"b")],
            }),
            Message::Tx(TxPayload {
                addr_from: "localhost:3001".into(),
                transaction: vec![9, 8, 7],
            }),
            Message::Version(Version {
                version: 1,
                best_height: 42,
                addr_from: "localhost:3001".into(),
            }),
        ];

        for message in messages {
            let bytes = message.to_bytes();
            assert_eq!(bytes_to_cmd(&bytes[..COMMAND_LENGTH]), message.command());
            let decoded = Message::from_bytes(&bytes).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_short_request_rejected() {
        assert!(matches!(
            Message::from_bytes(&[1, 2, 3]),
            Err(NetError::Malformed)
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut bytes = cmd_to_bytes("bogus");
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(NetError::Malformed)
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let message = Message::Version(Version {
            version: 1,
            best_height: 7,
            addr_from: "localhost:3001".into(),
        });
        let bytes = message.to_bytes();
        assert!(matches!(
            Message::from_bytes(&bytes[..bytes.len() - 3]),
            Err(NetError::Malformed)
        ));
    }
}
