//! Curve, cipher and signature helpers used across the protocol

use crate::{CryptoContext, Error, Result};
use aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use k256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field,
    },
    AffinePoint, ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of a per-item wrap key
pub const WRAP_KEY_LEN: usize = 16;

/// Per-item wrap key delivered through the OT layer
pub type WrapKey = [u8; WRAP_KEY_LEN];

/// AEAD tag overhead per encrypted item
pub const TAG_LEN: usize = 16;

const BLOCK_NONCE: [u8; 12] = [0u8; 12];

/// Fresh random scalar, returned as its canonical bytes
pub fn random_scalar_bytes() -> Zeroizing<[u8; 32]> {
    let scalar = Scalar::random(&mut OsRng);
    Zeroizing::new(scalar_to_bytes(&scalar))
}

/// Canonical big-endian encoding of a scalar
pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&scalar.to_bytes());
    out
}

/// Interpret 32 bytes as a scalar, reducing modulo the group order
pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&(*bytes).into())
}

/// Compressed SEC1 encoding of a point
pub fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Parse a SEC1 point, rejecting the identity
pub fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = k256::EncodedPoint::from_bytes(bytes)
        .map_err(|e| Error::Crypto(format!("invalid point encoding: {}", e)))?;
    let affine_opt = AffinePoint::from_encoded_point(&encoded);
    let affine: AffinePoint = Option::<AffinePoint>::from(affine_opt)
        .ok_or_else(|| Error::Crypto("point is not on the curve".into()))?;
    let point = ProjectivePoint::from(affine);
    if point == ProjectivePoint::IDENTITY {
        return Err(Error::Crypto("identity point".into()));
    }
    Ok(point)
}

/// Public commitment `s·G` to a release seed
pub fn seed_commitment(seed: &[u8; 32]) -> ProjectivePoint {
    ProjectivePoint::GENERATOR * scalar_from_bytes(seed)
}

/// Whether `seed` opens the commitment encoded in `commitment`
pub fn seed_opens(seed: &[u8; 32], commitment: &[u8]) -> bool {
    match decode_point(commitment) {
        Ok(point) => seed_commitment(seed) == point,
        Err(_) => false,
    }
}

/// Leaf digest binding an item's content to its index
pub fn item_leaf(ctx: &CryptoContext, index: u64, item: &[u8]) -> [u8; 32] {
    ctx.hash(b"item-leaf", &[&index.to_le_bytes(), item])
}

/// Commitment to the wrap key of item `index`
pub fn wrap_commitment(ctx: &CryptoContext, index: u64, wrap: &WrapKey) -> [u8; 32] {
    ctx.hash(b"wrap-commitment", &[&index.to_le_bytes(), wrap])
}

/// Per-block AEAD key: HMAC(seed, label ‖ index ‖ wrap)
pub fn block_key(
    ctx: &CryptoContext,
    seed: &[u8; 32],
    index: u64,
    wrap: &WrapKey,
) -> Result<Zeroizing<[u8; 32]>> {
    // the seed is re-encoded canonically so equal scalars give equal keys
    let canonical = Zeroizing::new(scalar_to_bytes(&scalar_from_bytes(seed)));
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(canonical.as_slice())
        .map_err(|e| Error::Crypto(e.to_string()))?;
    mac.update(ctx.domain_tag());
    mac.update(b"block-key");
    mac.update(&index.to_le_bytes());
    mac.update(wrap);

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

/// Encrypt one item under its block key
pub fn seal_block(key: &[u8; 32], item: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(&BLOCK_NONCE), item)
        .map_err(|e| Error::Crypto(format!("block encryption failed: {}", e)))
}

/// Decrypt one block; `None` if authentication fails
pub fn open_block(key: &[u8; 32], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher.decrypt(Nonce::from_slice(&BLOCK_NONCE), ciphertext).ok()
}

/// Compressed encoding of a verifying key
pub fn encode_verifying_key(key: &VerifyingKey) -> Vec<u8> {
    key.to_encoded_point(true).as_bytes().to_vec()
}

/// Parse a verifying key
pub fn decode_verifying_key(bytes: &[u8]) -> Result<VerifyingKey> {
    VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|e| Error::Crypto(format!("invalid verifying key: {}", e)))
}

/// ECDSA signature over a digest
pub fn sign_digest(key: &SigningKey, digest: &[u8; 32]) -> Vec<u8> {
    let signature: Signature = key.sign(digest);
    signature.to_bytes().to_vec()
}

/// Verify an ECDSA signature over a digest
pub fn verify_digest(key: &VerifyingKey, digest: &[u8; 32], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(signature) => key.verify(digest, &signature).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolConfig;

    #[test]
    fn test_point_roundtrip_rejects_identity() {
        let seed = random_scalar_bytes();
        let point = seed_commitment(&seed);
        let encoded = encode_point(&point);
        assert_eq!(encoded.len(), 33);
        assert_eq!(decode_point(&encoded).unwrap(), point);
        assert!(seed_opens(&seed, &encoded));

        assert!(decode_point(&[0u8]).is_err());
        assert!(decode_point(&[2u8; 10]).is_err());
    }

    #[test]
    fn test_block_seal_open() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let seed = random_scalar_bytes();
        let wrap = [7u8; WRAP_KEY_LEN];
        let key = block_key(&ctx, &seed, 3, &wrap).unwrap();

        let ciphertext = seal_block(&key, b"item three").unwrap();
        assert_eq!(ciphertext.len(), 10 + TAG_LEN);
        assert_eq!(open_block(&key, &ciphertext).unwrap(), b"item three");

        let other = block_key(&ctx, &seed, 4, &wrap).unwrap();
        assert!(open_block(&other, &ciphertext).is_none());
    }

    #[test]
    fn test_signature() {
        let key = SigningKey::random(&mut OsRng);
        let digest = [9u8; 32];
        let signature = sign_digest(&key, &digest);
        let verifying = decode_verifying_key(&encode_verifying_key(key.verifying_key())).unwrap();

        assert!(verify_digest(&verifying, &digest, &signature));
        assert!(!verify_digest(&verifying, &[8u8; 32], &signature));
        assert!(!verify_digest(&verifying, &digest, &signature[..10]));
    }
}
