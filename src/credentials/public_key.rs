//! Device-side public key encoding
//!
//! Devices do not store X.509 or PKCS#1 public keys. They keep a fixed-size
//! little-endian struct with Montgomery parameters precomputed so the verifier
//! never needs a bignum division:
//!
//! ```text
//! u32        modulus length in 32-bit words (64)
//! u32        n0inv = -1 / n[0] mod 2^32
//! [u8; 256]  modulus, little-endian
//! [u8; 256]  rr = R^2 mod n, R = 2^2048, little-endian
//! u32        public exponent
//! ```

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};

use super::key::{MODULUS_BITS, PUBLIC_EXPONENT};

/// Modulus size in bytes
pub const MODULUS_BYTES: usize = MODULUS_BITS / 8;

/// Modulus size in 32-bit words
pub const MODULUS_WORDS: usize = MODULUS_BYTES / 4;

/// Total encoded size (524 bytes)
pub const ENCODED_LEN: usize = 4 + 4 + MODULUS_BYTES + MODULUS_BYTES + 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublicKeyError {
    #[error("Expected {ENCODED_LEN} bytes, got {0}")]
    Length(usize),

    #[error("Unsupported modulus length of {0} words")]
    ModulusWords(u32),

    #[error("Modulus is not {MODULUS_BITS} bits")]
    ModulusSize,

    #[error("Invalid RSA public key: {0}")]
    Invalid(String),
}

/// Encode an RSA public key in the device layout.
pub fn encode(key: &RsaPublicKey) -> Result<Vec<u8>, PublicKeyError> {
    let n = key.n();
    if n.bits() != MODULUS_BITS {
        return Err(PublicKeyError::ModulusSize);
    }
    let e_bytes = key.e().to_bytes_le();
    if e_bytes.len() > 4 {
        return Err(PublicKeyError::Invalid("exponent exceeds 32 bits".to_string()));
    }
    let mut e_word = [0u8; 4];
    e_word[..e_bytes.len()].copy_from_slice(&e_bytes);
    let e = u32::from_le_bytes(e_word);

    let modulus = le_padded(n);
    let n0 = u32::from_le_bytes([modulus[0], modulus[1], modulus[2], modulus[3]]);
    let rr = (BigUint::from(1u32) << (2 * MODULUS_BITS)) % n;

    let mut out = Vec::with_capacity(ENCODED_LEN);
    out.extend_from_slice(&(MODULUS_WORDS as u32).to_le_bytes());
    out.extend_from_slice(&n0_inverse(n0).wrapping_neg().to_le_bytes());
    out.extend_from_slice(&modulus);
    out.extend_from_slice(&le_padded(&rr));
    out.extend_from_slice(&e.to_le_bytes());
    Ok(out)
}

/// Decode the device layout back into an RSA public key.
///
/// Only the modulus and exponent are used; the Montgomery fields are ignored.
pub fn decode(bytes: &[u8]) -> Result<RsaPublicKey, PublicKeyError> {
    if bytes.len() != ENCODED_LEN {
        return Err(PublicKeyError::Length(bytes.len()));
    }
    let words = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if words as usize != MODULUS_WORDS {
        return Err(PublicKeyError::ModulusWords(words));
    }
    let n = BigUint::from_bytes_le(&bytes[8..8 + MODULUS_BYTES]);
    let tail = &bytes[ENCODED_LEN - 4..];
    let e = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if e != PUBLIC_EXPONENT {
        return Err(PublicKeyError::Invalid(format!("unexpected exponent {}", e)));
    }
    RsaPublicKey::new(n, BigUint::from(e)).map_err(|e| PublicKeyError::Invalid(e.to_string()))
}

/// Short hex fingerprint used to identify a key in logs.
pub fn fingerprint(encoded: &[u8]) -> String {
    let digest = Sha256::digest(encoded);
    hex::encode(&digest[..8])
}

/// Multiplicative inverse of an odd `n0` modulo 2^32 (Newton iteration).
fn n0_inverse(n0: u32) -> u32 {
    // n0 * n0 == 1 mod 8, so the seed is good to 3 bits and each step doubles it
    let mut inv = n0;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    inv
}

fn le_padded(value: &BigUint) -> Vec<u8> {
    let mut bytes = value.to_bytes_le();
    bytes.resize(MODULUS_BYTES, 0);
    bytes
}
