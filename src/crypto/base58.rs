//! Base58Check address encoding
//!
//! Address = Base58(version || pub_key_hash || checksum4) with the
//! Bitcoin alphabet; checksum = first 4 bytes of double SHA-256 over
//! version || pub_key_hash.

use super::double_sha256;

/// Version byte prepended to every address payload
pub const ADDRESS_VERSION: u8 = 0x00;

/// Checksum width in bytes
pub const CHECKSUM_LENGTH: usize = 4;

/// Base58-encode arbitrary bytes
pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

/// Base58-decode a string
pub fn base58_decode(input: &str) -> Option<Vec<u8>> {
    bs58::decode(input).into_vec().ok()
}

/// Encode a 20-byte public key hash as an address
pub fn pub_key_hash_to_address(pub_key_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + CHECKSUM_LENGTH);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pub_key_hash);

    let checksum = double_sha256(&payload);
    payload.extend_from_slice(&checksum.0[..CHECKSUM_LENGTH]);

    base58_encode(&payload)
}

/// Decode an address back to its 20-byte public key hash
///
/// Returns `None` on malformed Base58, a short payload, or a checksum
/// mismatch.
pub fn address_to_pub_key_hash(address: &str) -> Option<Vec<u8>> {
    let payload = base58_decode(address)?;
    if payload.len() <= 1 + CHECKSUM_LENGTH {
        return None;
    }

    let (versioned, checksum) = payload.split_at(payload.len() - CHECKSUM_LENGTH);
    let expected = double_sha256(versioned);
    if checksum != &expected.0[..CHECKSUM_LENGTH] {
        return None;
    }

    Some(versioned[1..].to_vec())
}

/// True if the address round-trips through Base58Check
pub fn validate_address(address: &str) -> bool {
    address_to_pub_key_hash(address).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_pub_key;

    #[test]
    fn test_base58_roundtrip() {
        let data = b"some arbitrary payload".to_vec();
        let encoded = base58_encode(&data);
        assert_eq!(base58_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_address_roundtrip() {
        let pkh = hash_pub_key(&[42u8; 64]);
        let address = pub_key_hash_to_address(&pkh);
        assert_eq!(address_to_pub_key_hash(&address).unwrap(), pkh);
    }

    #[test]
    fn test_address_starts_with_one() {
        // Version byte 0x00 maps to a leading '1' in the Bitcoin alphabet
        let pkh = hash_pub_key(&[7u8; 64]);
        let address = pub_key_hash_to_address(&pkh);
        assert!(address.starts_with('1'));
    }

    #[test]
    fn test_validate_address() {
        let pkh = hash_pub_key(&[1u8; 64]);
        let address = pub_key_hash_to_address(&pkh);
        assert!(validate_address(&address));
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let pkh = hash_pub_key(&[1u8; 64]);
        let address = pub_key_hash_to_address(&pkh);

        let mut chars: Vec<char> = address.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let corrupted: String = chars.into_iter().collect();

        assert!(!validate_address(&corrupted));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(!validate_address(""));
        assert!(!validate_address("0OIl"));
        assert!(!validate_address("not-base58!!"));
        assert!(!validate_address("1111"));
    }
}
