//! OT batch transfer engine
//!
//! The seller encrypts every item of `normalize(demand ∪ phantom)` under a
//! per-item block key derived from a fresh release seed and a per-item wrap
//! key. The buyer obtains the wrap keys of its demanded items through 1-of-N
//! OTs, signs a receipt over the delivered transcript, and only then receives
//! the seed that turns wrap keys into block keys.
//!
//! ```text
//! Buyer                                Seller
//!   | -- Request (OT columns) -------->  |
//!   | <------ Response (blocks, wraps) - |
//!   | -- Receipt (signed) ------------>  |
//!   | <------ Secret (seed, signed) ---- |
//! ```

mod buyer;
mod messages;
mod seller;

pub use buyer::{BuyerSession, BuyerState};
pub use messages::*;
pub use seller::{SellerSession, SellerState};

use crate::primitives::{decode_verifying_key, verify_digest};
use crate::{CryptoContext, Error, Result};

/// Session tweak binding one transfer's OT extension to the negotiation
pub(crate) fn transfer_tweak(
    ctx: &CryptoContext,
    nego_secret: &[u8; 32],
    nonce: &[u8; 32],
) -> [u8; 32] {
    ctx.hash(b"transfer-tweak", &[nego_secret, nonce])
}

/// Check the buyer's signature on a receipt against the key it embeds
pub fn verify_receipt_signature(ctx: &CryptoContext, receipt: &Receipt) -> Result<()> {
    let key = decode_verifying_key(&receipt.body.buyer_key)
        .map_err(|e| Error::Protocol(format!("receipt buyer key: {}", e)))?;
    if !verify_digest(&key, &receipt.digest(ctx), &receipt.signature) {
        return Err(Error::Protocol("receipt signature does not verify".into()));
    }
    Ok(())
}

/// Check a secret is bound to `receipt` and signed by the seller key it names
pub fn verify_secret_signature(
    ctx: &CryptoContext,
    receipt: &Receipt,
    secret: &Secret,
) -> Result<()> {
    if secret.receipt_digest != receipt.digest(ctx) {
        return Err(Error::Protocol("secret refers to a different receipt".into()));
    }
    let key = decode_verifying_key(&receipt.body.seller_key)
        .map_err(|e| Error::Protocol(format!("receipt seller key: {}", e)))?;
    if !verify_digest(&key, &secret.digest(ctx), &secret.signature) {
        return Err(Error::Protocol("secret signature does not verify".into()));
    }
    Ok(())
}
