//! Chou–Orlandi base OT
//!
//! Base oblivious transfer protocol from https://eprint.iacr.org/2015/267.pdf
//! over secp256k1. Roles are reversed with respect to the extension: the buyer
//! (extension receiver) is the base-OT sender and learns both keys of every
//! instance, the seller (extension sender) is the base-OT receiver and learns
//! one key per instance according to its secret Δ.

use super::OtKey;
use crate::context::{KAPPA, KAPPA_BYTES};
use crate::primitives::{decode_point, encode_point, random_scalar_bytes, scalar_from_bytes};
use crate::{CryptoContext, Error, Result};
use k256::ProjectivePoint;
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

fn derive_key(
    ctx: &CryptoContext,
    index: usize,
    sender: &[u8],
    receiver: &[u8],
    shared: &ProjectivePoint,
) -> OtKey {
    let hash = ctx.hash(
        b"base-ot-key",
        &[
            &(index as u64).to_le_bytes(),
            sender,
            receiver,
            &encode_point(shared),
        ],
    );
    let mut key = [0u8; 16];
    key.copy_from_slice(&hash[..16]);
    key
}

/// Both keys of every base OT instance (held by the buyer)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SenderKeys {
    pub(crate) zeros: Vec<OtKey>,
    pub(crate) ones: Vec<OtKey>,
}

/// Δ and the Δ-selected key of every instance (held by the seller)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ReceiverKeys {
    pub(crate) delta: [u8; KAPPA_BYTES],
    pub(crate) keys: Vec<OtKey>,
}

impl ReceiverKeys {
    /// Bit `i` of Δ
    pub(crate) fn delta_bit(&self, i: usize) -> bool {
        (self.delta[i / 8] >> (i % 8)) & 1 == 1
    }
}

/// Base-OT sender state between its message and the receiver's reply
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BaseOtSender {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: Vec<u8>,
}

impl BaseOtSender {
    /// Sample `a` and publish `A = a·G`
    pub fn new() -> Self {
        let secret = random_scalar_bytes();
        let public = encode_point(&(ProjectivePoint::GENERATOR * scalar_from_bytes(&secret)));
        Self {
            secret: *secret,
            public,
        }
    }

    /// Encoded `A`
    pub fn public(&self) -> &[u8] {
        &self.public
    }

    /// Derive `(k_i^0, k_i^1)` from the receiver's `B_i` points
    pub fn finish(&self, ctx: &CryptoContext, points: &[Vec<u8>]) -> Result<SenderKeys> {
        if points.len() != KAPPA {
            return Err(Error::Protocol(format!(
                "expected {} base OT points, got {}",
                KAPPA,
                points.len()
            )));
        }

        let a = scalar_from_bytes(&self.secret);
        let big_a = ProjectivePoint::GENERATOR * a;
        let mut zeros = Vec::with_capacity(KAPPA);
        let mut ones = Vec::with_capacity(KAPPA);

        for (i, encoded) in points.iter().enumerate() {
            let big_b = decode_point(encoded)
                .map_err(|e| Error::Protocol(format!("malformed base OT point {}: {}", i, e)))?;
            zeros.push(derive_key(ctx, i, &self.public, encoded, &(big_b * a)));
            ones.push(derive_key(ctx, i, &self.public, encoded, &((big_b - big_a) * a)));
        }

        Ok(SenderKeys { zeros, ones })
    }
}

impl Default for BaseOtSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver's reply: sample Δ, answer with `B_i = b_i·G + Δ_i·A`
pub fn respond(
    ctx: &CryptoContext,
    sender_public: &[u8],
) -> Result<(Vec<Vec<u8>>, ReceiverKeys)> {
    let big_a = decode_point(sender_public)
        .map_err(|e| Error::Protocol(format!("malformed base OT sender point: {}", e)))?;

    let mut delta = [0u8; KAPPA_BYTES];
    OsRng.fill_bytes(&mut delta);

    let mut points = Vec::with_capacity(KAPPA);
    let mut keys = Vec::with_capacity(KAPPA);

    for i in 0..KAPPA {
        let choice = (delta[i / 8] >> (i % 8)) & 1 == 1;
        let b_bytes: Zeroizing<[u8; 32]> = random_scalar_bytes();
        let b = scalar_from_bytes(&b_bytes);

        let big_b = if choice {
            ProjectivePoint::GENERATOR * b + big_a
        } else {
            ProjectivePoint::GENERATOR * b
        };
        let encoded = encode_point(&big_b);
        keys.push(derive_key(ctx, i, sender_public, &encoded, &(big_a * b)));
        points.push(encoded);
    }

    let receiver = ReceiverKeys { delta, keys };
    delta.zeroize();
    Ok((points, receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolConfig;

    #[test]
    fn test_base_ot_keys_agree_on_delta() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let sender = BaseOtSender::new();
        let (points, receiver) = respond(&ctx, sender.public()).unwrap();
        let keys = sender.finish(&ctx, &points).unwrap();

        assert_eq!(points.len(), KAPPA);
        for i in 0..KAPPA {
            let (chosen, other) = if receiver.delta_bit(i) {
                (&keys.ones[i], &keys.zeros[i])
            } else {
                (&keys.zeros[i], &keys.ones[i])
            };
            assert_eq!(&receiver.keys[i], chosen);
            assert_ne!(&receiver.keys[i], other);
        }
    }

    #[test]
    fn test_wrong_point_count_rejected() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let sender = BaseOtSender::new();
        let (mut points, _) = respond(&ctx, sender.public()).unwrap();
        points.pop();

        assert!(matches!(sender.finish(&ctx, &points), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_malformed_sender_point_rejected() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        assert!(matches!(respond(&ctx, &[1u8; 33]), Err(Error::Protocol(_))));
    }
}
