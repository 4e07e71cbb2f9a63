//! Buyer side of a trade

use super::messages::{Receipt, ReceiptBody, Request, Response, Secret};
use super::{transfer_tweak, verify_secret_signature};
use crate::claim::Claim;
use crate::dataset::{Bulletin, PublicParams};
use crate::nego::{NegoRequest, NegoResponse, Negotiator};
use crate::oblivious::selection::{choice_bits, receiver_pad, selection_bits, xor16};
use crate::oblivious::{IknpReceiver, OtKey};
use crate::primitives::{
    block_key, decode_point, encode_verifying_key, item_leaf, open_block, seed_opens,
    sign_digest, wrap_commitment, WrapKey, TAG_LEN,
};
use crate::types::{normalize_ranges, position_of, ranges_len, BuyerId, Range, Role, SellerId};
use crate::{CryptoContext, Error, Result};
use rand::{rngs::OsRng, RngCore};
use std::path::Path;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// Buyer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuyerState {
    Init,
    Negotiated,
    RequestSent,
    ResponseReceived,
    ReceiptSent,
    SecretVerified,
    SecretFailed,
    Decrypted,
    Aborted,
}

/// OT material held between the request and the response
struct Pending {
    request_digest: [u8; 32],
    /// Position of each query's item within the requested ranges
    positions: Vec<u64>,
    chosen: Zeroizing<Vec<OtKey>>,
    bits: usize,
}

/// Transcript held between the response and the secret
struct Delivered {
    response: Response,
    positions: Vec<u64>,
    /// Unmasked wrap key per query
    wraps: Zeroizing<Vec<WrapKey>>,
    receipt: Receipt,
}

/// Retained evidence of a secret that failed verification
struct Fraud {
    secret: Secret,
    /// Offending query; `None` when the seed does not open its commitment
    query: Option<usize>,
}

/// One buyer's trade with one seller
pub struct BuyerSession<'c> {
    ctx: &'c CryptoContext,
    bulletin: Bulletin,
    public: PublicParams,
    seller_id: SellerId,
    buyer_id: BuyerId,
    demand: Vec<Range>,
    ranges: Vec<Range>,
    /// Distinct demanded item indices, ascending
    queries: Vec<u64>,
    nego: Negotiator,
    state: BuyerState,
    pending: Option<Pending>,
    delivered: Option<Delivered>,
    plaintexts: Option<Zeroizing<Vec<Vec<u8>>>>,
    fraud: Option<Fraud>,
}

impl<'c> BuyerSession<'c> {
    /// Create a session for `demand`, hidden among `phantom` ranges
    #[instrument(skip_all, fields(demand = demand.len(), phantom = phantom.len()))]
    pub fn new(
        ctx: &'c CryptoContext,
        bulletin: Bulletin,
        public: PublicParams,
        seller_id: SellerId,
        buyer_id: BuyerId,
        demand: Vec<Range>,
        phantom: Vec<Range>,
    ) -> Result<Self> {
        if seller_id == buyer_id {
            return Err(Error::Config("seller and buyer ids must differ".into()));
        }
        if demand.is_empty() {
            return Err(Error::Config("demand must name at least one range".into()));
        }
        for range in demand.iter().chain(&phantom) {
            range.validate()?;
        }
        if bulletin.item_size as usize > ctx.config().max_item_size {
            return Err(Error::Config(format!(
                "bulletin item size {} exceeds the configured maximum {}",
                bulletin.item_size,
                ctx.config().max_item_size
            )));
        }
        public.verify_against(ctx, &bulletin)?;

        let all: Vec<Range> = demand.iter().chain(&phantom).copied().collect();
        let ranges = normalize_ranges(&all);
        if !bulletin.covers(&ranges) {
            return Err(Error::Config(format!(
                "requested ranges exceed the {} published items",
                bulletin.item_count
            )));
        }
        let total = ranges_len(&ranges);
        if total > ctx.config().max_request_items {
            return Err(Error::Config(format!(
                "demand and phantom cover {} items, limit is {}",
                total,
                ctx.config().max_request_items
            )));
        }

        let queries: Vec<u64> = normalize_ranges(&demand)
            .iter()
            .flat_map(|r| r.indices())
            .collect();
        let max_masked = ctx.config().max_masked_wraps;
        match (queries.len() as u64).checked_mul(total) {
            Some(masked) if masked <= max_masked => {}
            _ => {
                return Err(Error::Config(format!(
                    "{} demanded items over {} positions exceed {} masked wrap keys",
                    queries.len(),
                    total,
                    max_masked
                )))
            }
        }
        let seller_key = bulletin.verifying_key()?;
        debug!(positions = total, queries = queries.len(), "Buyer session created");

        Ok(Self {
            ctx,
            bulletin,
            public,
            seller_id,
            buyer_id,
            demand,
            ranges,
            queries,
            nego: Negotiator::new(Role::Buyer, buyer_id, seller_id).pin_peer_key(seller_key),
            state: BuyerState::Init,
            pending: None,
            delivered: None,
            plaintexts: None,
            fraud: None,
        })
    }

    /// Load the bulletin and public parameters from files and create a session
    pub fn open(
        ctx: &'c CryptoContext,
        bulletin_path: impl AsRef<Path>,
        public_path: impl AsRef<Path>,
        seller_id: SellerId,
        buyer_id: BuyerId,
        demand: Vec<Range>,
        phantom: Vec<Range>,
    ) -> Result<Self> {
        let bulletin = Bulletin::load(bulletin_path)?;
        let public = PublicParams::load(public_path)?;
        Self::new(ctx, bulletin, public, seller_id, buyer_id, demand, phantom)
    }

    pub fn state(&self) -> BuyerState {
        self.state
    }

    pub fn bulletin(&self) -> &Bulletin {
        &self.bulletin
    }

    /// Number of items `decrypt` emits (duplicates across demand ranges counted)
    pub fn demand_len(&self) -> u64 {
        self.demand.iter().map(|r| r.count).sum()
    }

    /// Normalized ranges the request covers
    pub fn requested_ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Negotiation secret, once both directions completed
    pub fn nego_secret(&self) -> Option<&[u8; 32]> {
        self.nego.secret()
    }

    fn check_negotiating(&self, operation: &'static str) -> Result<()> {
        match self.state {
            BuyerState::Init => Ok(()),
            other => Err(Error::state(operation, other)),
        }
    }

    fn after_nego_step(&mut self) {
        if self.nego.is_negotiated() {
            self.state = BuyerState::Negotiated;
            info!(seller = %hex::encode(self.seller_id), "Buyer negotiated");
        }
    }

    /// Buyer-initiated negotiation request, carrying the base OT
    pub fn get_nego_request(&mut self) -> Result<NegoRequest> {
        self.check_negotiating("get_nego_request")?;
        self.nego.request(self.ctx)
    }

    /// Answer the seller-initiated negotiation request
    pub fn on_nego_request(&mut self, request: &NegoRequest) -> Result<NegoResponse> {
        self.check_negotiating("on_nego_request")?;
        let response = self.nego.respond(self.ctx, request)?;
        self.after_nego_step();
        Ok(response)
    }

    /// Complete the buyer-initiated direction
    pub fn on_nego_response(&mut self, response: &NegoResponse) -> Result<()> {
        self.check_negotiating("on_nego_response")?;
        self.nego.on_response(self.ctx, response)?;
        self.after_nego_step();
        Ok(())
    }

    /// Encode one 1-of-N selection per demanded item
    #[instrument(skip_all, fields(buyer = %hex::encode(self.buyer_id)))]
    pub fn get_request(&mut self) -> Result<Request> {
        if self.state != BuyerState::Negotiated {
            return Err(Error::state("get_request", self.state));
        }

        let bits = selection_bits(ranges_len(&self.ranges));
        let positions = self
            .queries
            .iter()
            .map(|&index| {
                position_of(&self.ranges, index)
                    .ok_or_else(|| Error::Data(format!("item {} not in requested ranges", index)))
            })
            .collect::<Result<Vec<u64>>>()?;
        let choices: Vec<bool> = positions
            .iter()
            .flat_map(|&position| choice_bits(position, bits))
            .collect();

        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let nego_secret = self
            .nego
            .secret()
            .ok_or_else(|| Error::Resource("negotiation secret erased".into()))?;
        let tweak = transfer_tweak(self.ctx, nego_secret, &nonce);
        let (extension, chosen) =
            IknpReceiver::new(self.nego.sender_keys()?, tweak).extend(self.ctx, &choices)?;

        let request = Request {
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            ranges: self.ranges.clone(),
            query_count: self.queries.len() as u64,
            ot_columns: extension.columns,
            ot_check: extension.check,
            nonce,
        };
        let request_digest = request.digest(self.ctx);

        info!(
            ranges = request.ranges.len(),
            queries = request.query_count,
            digest = %hex::encode(request_digest),
            "Request sent"
        );
        self.pending = Some(Pending {
            request_digest,
            positions,
            chosen,
            bits,
        });
        self.state = BuyerState::RequestSent;
        Ok(request)
    }

    /// Check the response's structure and sign a receipt over it
    ///
    /// Messages for another trade are rejected with a protocol error and leave
    /// the session untouched. A structurally invalid response aborts the trade.
    #[instrument(skip_all, fields(buyer = %hex::encode(self.buyer_id)))]
    pub fn on_response(&mut self, response: &Response) -> Result<Receipt> {
        if self.state != BuyerState::RequestSent {
            return Err(Error::state("on_response", self.state));
        }
        let pending = self
            .pending
            .as_ref()
            .ok_or_else(|| Error::Resource("transfer material erased".into()))?;

        if response.seller_id != self.seller_id || response.buyer_id != self.buyer_id {
            return Err(Error::Protocol("response identity mismatch".into()));
        }
        if response.request_digest != pending.request_digest {
            return Err(Error::Protocol(
                "response answers a different request".into(),
            ));
        }

        let wraps = match self.validate_response(response, pending) {
            Ok(wraps) => wraps,
            Err(e) => {
                warn!(error = %e, "Response rejected, aborting trade");
                self.abort();
                return Err(e);
            }
        };
        self.state = BuyerState::ResponseReceived;

        let seller_key = self
            .nego
            .peer_key()
            .ok_or_else(|| Error::Resource("seller verifying key unavailable".into()))?;
        let body = ReceiptBody {
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            request_digest: response.request_digest,
            response_digest: response.digest(self.ctx),
            block_root: response.block_tree(self.ctx)?.root(),
            block_count: response.blocks.len() as u64,
            key_commitment: response.key_commitment.clone(),
            bulletin_root: response.bulletin_root,
            seller_key: encode_verifying_key(seller_key),
            buyer_key: encode_verifying_key(self.nego.verifying_key()),
        };
        let signature = sign_digest(self.nego.signing_key(), &body.digest(self.ctx));
        let receipt = Receipt { body, signature };

        info!(
            blocks = response.blocks.len(),
            receipt = %hex::encode(receipt.digest(self.ctx)),
            "Receipt signed"
        );
        let positions = self
            .pending
            .take()
            .map(|p| p.positions)
            .unwrap_or_default();
        self.delivered = Some(Delivered {
            response: response.clone(),
            positions,
            wraps,
            receipt: receipt.clone(),
        });
        self.state = BuyerState::ReceiptSent;
        Ok(receipt)
    }

    fn validate_response(
        &self,
        response: &Response,
        pending: &Pending,
    ) -> Result<Zeroizing<Vec<WrapKey>>> {
        if response.bulletin_root != self.bulletin.root {
            return Err(Error::Validation("response names a different bulletin".into()));
        }

        let positions = ranges_len(&self.ranges) as usize;
        if response.blocks.len() != positions {
            return Err(Error::Validation(format!(
                "expected {} blocks, got {}",
                positions,
                response.blocks.len()
            )));
        }
        let block_len = self.bulletin.item_size as usize + TAG_LEN;
        let indices = self.ranges.iter().flat_map(|r| r.indices());
        for (position, (block, index)) in response.blocks.iter().zip(indices).enumerate() {
            if block.index != index {
                return Err(Error::Validation(format!(
                    "block {} is for item {}, expected {}",
                    position, block.index, index
                )));
            }
            if block.ciphertext.len() != block_len {
                return Err(Error::Validation(format!(
                    "block {} has {} bytes, expected {}",
                    position,
                    block.ciphertext.len(),
                    block_len
                )));
            }
        }

        let expected_masked = self.queries.len() * positions;
        if response.masked_wraps.len() != expected_masked {
            return Err(Error::Validation(format!(
                "expected {} masked wrap keys, got {}",
                expected_masked,
                response.masked_wraps.len()
            )));
        }
        decode_point(&response.key_commitment)
            .map_err(|e| Error::Validation(format!("key commitment: {}", e)))?;

        let bits = pending.bits;
        let mut wraps = Zeroizing::new(Vec::with_capacity(self.queries.len()));
        for (q, &position) in pending.positions.iter().enumerate() {
            let keys = &pending.chosen[q * bits..(q + 1) * bits];
            let pad = receiver_pad(self.ctx, q as u64, position, keys);
            let masked = &response.masked_wraps[q * positions + position as usize];
            let wrap = xor16(masked, &pad);

            let block = &response.blocks[position as usize];
            if wrap_commitment(self.ctx, block.index, &wrap) != block.wrap_commitment {
                return Err(Error::Validation(format!(
                    "wrap key for item {} does not open its commitment",
                    block.index
                )));
            }
            wraps.push(wrap);
        }
        Ok(wraps)
    }

    /// Derive block keys from the released seed and check every demanded item
    /// against the bulletin
    #[instrument(skip_all, fields(buyer = %hex::encode(self.buyer_id)))]
    pub fn on_secret(&mut self, secret: &Secret) -> Result<()> {
        if self.state != BuyerState::ReceiptSent {
            return Err(Error::state("on_secret", self.state));
        }
        let delivered = self
            .delivered
            .as_ref()
            .ok_or_else(|| Error::Resource("transcript erased".into()))?;
        verify_secret_signature(self.ctx, &delivered.receipt, secret)?;

        if !seed_opens(&secret.seed, &delivered.response.key_commitment) {
            return Err(self.record_fraud(
                secret,
                None,
                "released seed does not open the key commitment".into(),
            ));
        }

        let mut plaintexts = Zeroizing::new(Vec::with_capacity(self.queries.len()));
        let mut failure = None;
        for (q, &position) in delivered.positions.iter().enumerate() {
            let block = &delivered.response.blocks[position as usize];
            let key = block_key(self.ctx, &secret.seed, block.index, &delivered.wraps[q])?;
            let plaintext = match open_block(&key, &block.ciphertext) {
                Some(plaintext) => plaintext,
                None => {
                    failure = Some((q, format!("block for item {} does not decrypt", block.index)));
                    break;
                }
            };
            let committed = self.public.leaf(block.index);
            if committed != Some(&item_leaf(self.ctx, block.index, &plaintext)) {
                failure = Some((
                    q,
                    format!("item {} does not match the bulletin", block.index),
                ));
                break;
            }
            plaintexts.push(plaintext);
        }

        if let Some((q, reason)) = failure {
            return Err(self.record_fraud(secret, Some(q), reason));
        }

        info!(items = plaintexts.len(), "Secret verified");
        self.plaintexts = Some(plaintexts);
        self.state = BuyerState::SecretVerified;
        Ok(())
    }

    fn record_fraud(&mut self, secret: &Secret, query: Option<usize>, reason: String) -> Error {
        warn!(reason = %reason, "Secret failed verification; claim available");
        self.fraud = Some(Fraud {
            secret: secret.clone(),
            query,
        });
        self.state = BuyerState::SecretFailed;
        Error::Secret(reason)
    }

    /// Verified plaintext of every demand range, in demand order
    pub fn decrypt(&mut self) -> Result<Vec<u8>> {
        if !matches!(self.state, BuyerState::SecretVerified | BuyerState::Decrypted) {
            return Err(Error::state("decrypt", self.state));
        }
        let plaintexts = self
            .plaintexts
            .as_ref()
            .ok_or_else(|| Error::Resource("plaintexts erased".into()))?;

        let item_size = self.bulletin.item_size as usize;
        let mut output = Vec::with_capacity(self.demand_len() as usize * item_size);
        for range in &self.demand {
            for index in range.indices() {
                let q = self
                    .queries
                    .binary_search(&index)
                    .map_err(|_| Error::Data(format!("item {} was not fetched", index)))?;
                output.extend_from_slice(&plaintexts[q]);
            }
        }

        self.state = BuyerState::Decrypted;
        Ok(output)
    }

    /// Write the verified plaintext to `path`
    pub fn decrypt_to(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let output = Zeroizing::new(self.decrypt()?);
        std::fs::write(path, output.as_slice())?;
        Ok(())
    }

    /// Package the failed transcript into a publicly verifiable claim
    #[instrument(skip_all, fields(buyer = %hex::encode(self.buyer_id)))]
    pub fn generate_claim(&self) -> Result<Claim> {
        if self.state != BuyerState::SecretFailed {
            return Err(Error::state("generate_claim", self.state));
        }
        let (delivered, fraud) = match (&self.delivered, &self.fraud) {
            (Some(delivered), Some(fraud)) => (delivered, fraud),
            _ => return Err(Error::Resource("fraud evidence erased".into())),
        };

        let claim = match fraud.query {
            None => Claim::for_commitment(&delivered.receipt, &fraud.secret),
            Some(q) => Claim::for_block(
                self.ctx,
                &delivered.receipt,
                &fraud.secret,
                &delivered.response,
                &self.public,
                delivered.positions[q],
                delivered.wraps[q],
            )?,
        };
        info!(block_evidence = claim.evidence.is_some(), "Claim generated");
        Ok(claim)
    }

    /// Abandon the trade, erasing all key material
    pub fn abort(&mut self) {
        self.erase();
        self.state = BuyerState::Aborted;
    }

    /// End the session, erasing all key material
    pub fn release(mut self) {
        self.erase();
        debug!(state = ?self.state, "Buyer session released");
    }

    fn erase(&mut self) {
        self.pending = None;
        self.delivered = None;
        self.plaintexts = None;
        self.fraud = None;
        self.nego.erase();
    }
}

impl Drop for BuyerSession<'_> {
    fn drop(&mut self) {
        self.erase();
    }
}
