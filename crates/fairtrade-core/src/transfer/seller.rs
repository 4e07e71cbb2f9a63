//! Seller side of a trade

use super::messages::{EncryptedBlock, Receipt, ReceiptBody, Request, Response, Secret};
use super::{transfer_tweak, verify_receipt_signature};
use crate::dataset::PublishedDataset;
use crate::nego::{NegoRequest, NegoResponse, Negotiator};
use crate::oblivious::selection::{mask_wraps, selection_bits};
use crate::oblivious::IknpSender;
use crate::primitives::{
    block_key, encode_point, encode_verifying_key, random_scalar_bytes, seal_block,
    seed_commitment, sign_digest, wrap_commitment, WrapKey,
};
use crate::types::{is_normalized, ranges_len, BuyerId, Role, SellerId};
use crate::{CryptoContext, Error, Result};
use rand::{rngs::OsRng, RngCore};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

#[cfg(feature = "multi-thread")]
use rayon::prelude::*;

/// Seller session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellerState {
    Init,
    Negotiated,
    ResponseSent,
    SecretReleased,
    Aborted,
}

/// Material held between the response and the receipt
struct Pending {
    seed: Zeroizing<[u8; 32]>,
    expected: ReceiptBody,
}

/// One seller's trade with one buyer
pub struct SellerSession<'c> {
    ctx: &'c CryptoContext,
    dataset: Arc<PublishedDataset>,
    seller_id: SellerId,
    buyer_id: BuyerId,
    nego: Negotiator,
    state: SellerState,
    pending: Option<Pending>,
}

impl<'c> SellerSession<'c> {
    /// Create a session over a shared, read-only dataset
    pub fn new(
        ctx: &'c CryptoContext,
        dataset: Arc<PublishedDataset>,
        seller_id: SellerId,
        buyer_id: BuyerId,
    ) -> Result<Self> {
        if seller_id == buyer_id {
            return Err(Error::Config("seller and buyer ids must differ".into()));
        }
        if dataset.item_size() > ctx.config().max_item_size {
            return Err(Error::Config(format!(
                "dataset item size {} exceeds the configured maximum {}",
                dataset.item_size(),
                ctx.config().max_item_size
            )));
        }

        let nego = Negotiator::with_signing_key(
            Role::Seller,
            seller_id,
            buyer_id,
            dataset.signing_key().clone(),
        );
        Ok(Self {
            ctx,
            dataset,
            seller_id,
            buyer_id,
            nego,
            state: SellerState::Init,
            pending: None,
        })
    }

    /// Open a published dataset directory and create a session over it
    pub fn open(
        ctx: &'c CryptoContext,
        dir: impl AsRef<Path>,
        seller_id: SellerId,
        buyer_id: BuyerId,
    ) -> Result<Self> {
        let dataset = PublishedDataset::open(ctx, dir)?;
        Self::new(ctx, Arc::new(dataset), seller_id, buyer_id)
    }

    pub fn state(&self) -> SellerState {
        self.state
    }

    pub fn dataset(&self) -> &PublishedDataset {
        &self.dataset
    }

    /// Negotiation secret, once both directions completed
    pub fn nego_secret(&self) -> Option<&[u8; 32]> {
        self.nego.secret()
    }

    fn check_negotiating(&self, operation: &'static str) -> Result<()> {
        match self.state {
            SellerState::Init => Ok(()),
            other => Err(Error::state(operation, other)),
        }
    }

    fn after_nego_step(&mut self) {
        if self.nego.is_negotiated() {
            self.state = SellerState::Negotiated;
            info!(buyer = %hex::encode(self.buyer_id), "Seller negotiated");
        }
    }

    /// Seller-initiated negotiation request
    pub fn get_nego_request(&mut self) -> Result<NegoRequest> {
        self.check_negotiating("get_nego_request")?;
        self.nego.request(self.ctx)
    }

    /// Answer the buyer-initiated negotiation request
    pub fn on_nego_request(&mut self, request: &NegoRequest) -> Result<NegoResponse> {
        self.check_negotiating("on_nego_request")?;
        let response = self.nego.respond(self.ctx, request)?;
        self.after_nego_step();
        Ok(response)
    }

    /// Complete the seller-initiated direction
    pub fn on_nego_response(&mut self, response: &NegoResponse) -> Result<()> {
        self.check_negotiating("on_nego_response")?;
        self.nego.on_response(self.ctx, response)?;
        self.after_nego_step();
        Ok(())
    }

    /// Encrypt every requested item and answer the buyer's OT queries
    #[instrument(skip_all, fields(seller = %hex::encode(self.seller_id)))]
    pub fn on_request(&mut self, request: &Request) -> Result<Response> {
        if self.state != SellerState::Negotiated {
            return Err(Error::state("on_request", self.state));
        }
        if request.seller_id != self.seller_id || request.buyer_id != self.buyer_id {
            return Err(Error::Protocol("request identity mismatch".into()));
        }
        self.check_ranges(request)?;

        let position_count = ranges_len(&request.ranges);
        if request.query_count == 0 || request.query_count > position_count {
            return Err(Error::Protocol(format!(
                "query count {} not in [1, {}]",
                request.query_count, position_count
            )));
        }
        let max_masked = self.ctx.config().max_masked_wraps;
        match request.query_count.checked_mul(position_count) {
            Some(masked) if masked <= max_masked => {}
            _ => {
                return Err(Error::Protocol(format!(
                    "{} queries over {} positions exceed {} masked wrap keys",
                    request.query_count, position_count, max_masked
                )))
            }
        }

        let positions = usize::try_from(position_count)
            .map_err(|_| Error::Protocol(format!("{} positions", position_count)))?;
        let queries = request.query_count as usize;
        let bits = selection_bits(position_count);
        let ot_count = queries
            .checked_mul(bits)
            .ok_or_else(|| Error::Protocol("OT count overflows".into()))?;

        let nego_secret = self
            .nego
            .secret()
            .ok_or_else(|| Error::Resource("negotiation secret erased".into()))?;
        let tweak = transfer_tweak(self.ctx, nego_secret, &request.nonce);
        let sender = IknpSender::new(self.nego.receiver_keys()?, tweak);
        sender.check_shape(&request.ot_columns, ot_count)?;
        let extended =
            match sender.extend(self.ctx, &request.ot_columns, &request.ot_check, ot_count) {
                Ok(extended) => extended,
                Err(e) => {
                    warn!(error = %e, "OT extension rejected, aborting trade");
                    self.abort();
                    return Err(e);
                }
            };

        let seed = random_scalar_bytes();
        let key_commitment = encode_point(&seed_commitment(&seed));

        let indices: Vec<u64> = request.ranges.iter().flat_map(|r| r.indices()).collect();
        let mut wraps: Zeroizing<Vec<WrapKey>> = Zeroizing::new(vec![[0u8; 16]; positions]);
        for wrap in wraps.iter_mut() {
            OsRng.fill_bytes(wrap);
        }

        let blocks = self.encrypt_blocks(&seed, &indices, &wraps)?;
        let masked_wraps = mask_wraps(
            self.ctx,
            &extended.zeros,
            &extended.ones,
            queries,
            bits,
            &wraps,
        );

        let response = Response {
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            request_digest: request.digest(self.ctx),
            bulletin_root: self.dataset.bulletin().root,
            key_commitment,
            blocks,
            masked_wraps,
        };

        let peer_key = self
            .nego
            .peer_key()
            .ok_or_else(|| Error::Resource("buyer verifying key unavailable".into()))?;
        let expected = ReceiptBody {
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            request_digest: response.request_digest,
            response_digest: response.digest(self.ctx),
            block_root: response.block_tree(self.ctx)?.root(),
            block_count: response.blocks.len() as u64,
            key_commitment: response.key_commitment.clone(),
            bulletin_root: response.bulletin_root,
            seller_key: encode_verifying_key(self.nego.verifying_key()),
            buyer_key: encode_verifying_key(peer_key),
        };

        info!(
            positions,
            queries,
            response_digest = %hex::encode(expected.response_digest),
            "Response built"
        );
        self.pending = Some(Pending { seed, expected });
        self.state = SellerState::ResponseSent;
        Ok(response)
    }

    fn check_ranges(&self, request: &Request) -> Result<()> {
        if request.ranges.is_empty() {
            return Err(Error::Protocol("request names no ranges".into()));
        }
        for range in &request.ranges {
            range
                .validate()
                .map_err(|e| Error::Protocol(format!("malformed range: {}", e)))?;
        }
        if !is_normalized(&request.ranges) {
            return Err(Error::Protocol("request ranges are not normalized".into()));
        }

        let total = ranges_len(&request.ranges);
        let max = self.ctx.config().max_request_items;
        if total > max {
            return Err(Error::Protocol(format!(
                "request covers {} items, limit is {}",
                total, max
            )));
        }
        if !self.dataset.bulletin().covers(&request.ranges) {
            return Err(Error::Data(format!(
                "requested ranges exceed the {} published items",
                self.dataset.len()
            )));
        }
        Ok(())
    }

    fn encrypt_blocks(
        &self,
        seed: &[u8; 32],
        indices: &[u64],
        wraps: &[WrapKey],
    ) -> Result<Vec<EncryptedBlock>> {
        let ctx = self.ctx;
        let dataset: &PublishedDataset = &self.dataset;
        let encrypt = |(&index, wrap): (&u64, &WrapKey)| -> Result<EncryptedBlock> {
            let item = dataset.item(index)?;
            let key = block_key(ctx, seed, index, wrap)?;
            Ok(EncryptedBlock {
                index,
                ciphertext: seal_block(&key, item)?,
                wrap_commitment: wrap_commitment(ctx, index, wrap),
            })
        };

        #[cfg(feature = "multi-thread")]
        let blocks: Result<Vec<EncryptedBlock>> =
            indices.par_iter().zip(wraps.par_iter()).map(encrypt).collect();
        #[cfg(not(feature = "multi-thread"))]
        let blocks: Result<Vec<EncryptedBlock>> =
            indices.iter().zip(wraps.iter()).map(encrypt).collect();

        debug!(count = indices.len(), "Blocks encrypted");
        blocks
    }

    /// Release the seed once the receipt matches the response sent
    #[instrument(skip_all, fields(seller = %hex::encode(self.seller_id)))]
    pub fn on_receipt(&mut self, receipt: &Receipt) -> Result<Secret> {
        if self.state != SellerState::ResponseSent {
            return Err(Error::state("on_receipt", self.state));
        }
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| Error::Resource("transfer material erased".into()))?;

        if let Some(field) = mismatched_field(&receipt.body, &pending.expected) {
            return Err(Error::Protocol(format!(
                "receipt does not match the response sent: {}",
                field
            )));
        }
        verify_receipt_signature(self.ctx, receipt)?;

        let receipt_digest = receipt.digest(self.ctx);
        let mut secret = Secret {
            receipt_digest,
            seed: *pending.seed,
            signature: Vec::new(),
        };
        secret.signature = sign_digest(self.nego.signing_key(), &secret.digest(self.ctx));

        info!(receipt = %hex::encode(receipt_digest), "Secret released");
        self.erase();
        self.state = SellerState::SecretReleased;
        Ok(secret)
    }

    /// Abandon the trade, erasing all key material
    pub fn abort(&mut self) {
        self.erase();
        self.state = SellerState::Aborted;
    }

    /// End the session, erasing all key material
    pub fn release(mut self) {
        self.erase();
        debug!(state = ?self.state, "Seller session released");
    }

    fn erase(&mut self) {
        self.pending = None;
        self.nego.erase();
    }

    #[cfg(test)]
    pub(crate) fn signing_key(&self) -> &k256::ecdsa::SigningKey {
        self.nego.signing_key()
    }

    #[cfg(test)]
    pub(crate) fn pending_seed(&self) -> Option<[u8; 32]> {
        self.pending.as_ref().map(|p| *p.seed)
    }
}

impl Drop for SellerSession<'_> {
    fn drop(&mut self) {
        self.erase();
    }
}

fn mismatched_field(got: &ReceiptBody, expected: &ReceiptBody) -> Option<&'static str> {
    if got.seller_id != expected.seller_id || got.buyer_id != expected.buyer_id {
        Some("identities")
    } else if got.request_digest != expected.request_digest {
        Some("request digest")
    } else if got.response_digest != expected.response_digest {
        Some("response digest")
    } else if got.block_root != expected.block_root || got.block_count != expected.block_count {
        Some("block commitment")
    } else if got.key_commitment != expected.key_commitment {
        Some("key commitment")
    } else if got.bulletin_root != expected.bulletin_root {
        Some("bulletin root")
    } else if got.seller_key != expected.seller_key {
        Some("seller key")
    } else if got.buyer_key != expected.buyer_key {
        Some("buyer key")
    } else {
        None
    }
}
