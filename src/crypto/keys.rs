//! ECDSA key handling on NIST P-256
//!
//! Public keys travel as the raw 64-byte X||Y concatenation and
//! signatures as the raw r||s concatenation. Verification splits both
//! at half length, so shorter big-endian halves are accepted.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::{EncodedPoint, FieldBytes};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Hash;

/// Key and signature errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signing failed")]
    SigningFailed,
}

/// P-256 private key
#[derive(Clone, Serialize, Deserialize)]
pub struct PrivateKey(#[serde(with = "signing_key_serde")] SigningKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

mod signing_key_serde {
    use p256::ecdsa::SigningKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(key: &SigningKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(key.to_bytes().as_slice())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SigningKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        SigningKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        PrivateKey(SigningKey::random(&mut OsRng))
    }

    /// Create from 32 scalar bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        SigningKey::from_slice(bytes)
            .map(PrivateKey)
            .map_err(|_| KeyError::InvalidPrivateKey)
    }

    /// Export the 32 scalar bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().as_slice().to_vec()
    }

    /// Raw public key: 64-byte X||Y of the affine point
    pub fn public_key(&self) -> Vec<u8> {
        let point = self.0.verifying_key().to_encoded_point(false);
        let mut raw = Vec::with_capacity(64);
        raw.extend_from_slice(point.x().expect("identity point is unreachable").as_slice());
        raw.extend_from_slice(point.y().expect("identity point is unreachable").as_slice());
        raw
    }

    /// Sign a precomputed 32-byte digest; returns raw r||s (64 bytes)
    pub fn sign_digest(&self, digest: &Hash) -> Result<Vec<u8>, KeyError> {
        let signature: Signature = self
            .0
            .sign_prehash(digest.as_bytes())
            .map_err(|_| KeyError::SigningFailed)?;
        Ok(signature.to_bytes().as_slice().to_vec())
    }
}

/// Left-pad a big-endian half into a 32-byte scalar field
fn pad_scalar(bytes: &[u8]) -> Option<FieldBytes> {
    if bytes.len() > 32 {
        return None;
    }
    let mut arr = [0u8; 32];
    arr[32 - bytes.len()..].copy_from_slice(bytes);
    Some(FieldBytes::from(arr))
}

/// Verify a raw r||s signature over a digest with a raw X||Y public key
///
/// Both the signature and the key are split at half length, so halves
/// shorter than 32 bytes (stripped leading zeros) still verify.
pub fn verify_digest(pub_key: &[u8], digest: &Hash, signature: &[u8]) -> bool {
    if pub_key.is_empty() || signature.is_empty() {
        return false;
    }

    let (x_half, y_half) = pub_key.split_at(pub_key.len() / 2);
    let (x, y) = match (pad_scalar(x_half), pad_scalar(y_half)) {
        (Some(x), Some(y)) => (x, y),
        _ => return false,
    };
    let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
    let verifying_key = match VerifyingKey::from_encoded_point(&point) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let (r_half, s_half) = signature.split_at(signature.len() / 2);
    let (r, s) = match (pad_scalar(r_half), pad_scalar(s_half)) {
        (Some(r), Some(s)) => (r, s),
        _ => return false,
    };
    let signature = match Signature::from_scalars(r, s) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    verifying_key.verify_prehash(digest.as_bytes(), &signature).is_ok()
}
