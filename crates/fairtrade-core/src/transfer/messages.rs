//! Transfer message types

use crate::codec::{MessageKind, WireMessage};
use crate::merkle::MerkleTree;
use crate::oblivious::CorrelationCheck;
use crate::primitives::WrapKey;
use crate::types::{BuyerId, Range, SellerId};
use crate::{CryptoContext, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn ranges_bytes(ranges: &[Range]) -> Vec<u8> {
    ranges
        .iter()
        .flat_map(|r| r.start.to_le_bytes().into_iter().chain(r.count.to_le_bytes()))
        .collect()
}

/// Buyer's OT-encoded request over `normalize(demand ∪ phantom)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub seller_id: SellerId,
    pub buyer_id: BuyerId,
    /// Normalized ranges; demand and phantom items are not told apart
    pub ranges: Vec<Range>,
    /// Number of 1-of-N selections encoded in `ot_columns`
    pub query_count: u64,
    /// κ IKNP columns of `query_count · L` bits each, plus the check padding
    pub ot_columns: Vec<Vec<u8>>,
    /// Proof the columns encode one choice vector
    pub ot_check: CorrelationCheck,
    /// Buyer freshness nonce
    pub nonce: [u8; 32],
}

impl Request {
    pub fn digest(&self, ctx: &CryptoContext) -> [u8; 32] {
        let columns = self.ot_columns.concat();
        ctx.hash(
            b"request",
            &[
                &self.seller_id,
                &self.buyer_id,
                &ranges_bytes(&self.ranges),
                &self.query_count.to_le_bytes(),
                &(self.ot_columns.len() as u64).to_le_bytes(),
                &columns,
                &self.ot_check.x,
                &self.ot_check.t,
                &self.nonce,
            ],
        )
    }
}

impl WireMessage for Request {
    const KIND: MessageKind = MessageKind::Request;
}

/// One item encrypted under its block key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlock {
    /// Dataset index of the item
    pub index: u64,
    /// AEAD ciphertext, `item_size + TAG_LEN` bytes
    pub ciphertext: Vec<u8>,
    /// Commitment to the item's wrap key
    pub wrap_commitment: [u8; 32],
}

impl EncryptedBlock {
    /// Leaf of the block tree signed into a receipt
    pub fn leaf(&self, ctx: &CryptoContext) -> [u8; 32] {
        let ct_hash: [u8; 32] = Sha256::digest(&self.ciphertext).into();
        ctx.hash(
            b"block-leaf",
            &[&self.index.to_le_bytes(), &ct_hash, &self.wrap_commitment],
        )
    }
}

/// Seller's answer: every requested item encrypted, plus masked wrap keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub seller_id: SellerId,
    pub buyer_id: BuyerId,
    pub request_digest: [u8; 32],
    pub bulletin_root: [u8; 32],
    /// `K = s·G` for the release seed `s`
    pub key_commitment: Vec<u8>,
    /// One block per requested position, in range order
    pub blocks: Vec<EncryptedBlock>,
    /// `query_count × blocks.len()` wrap keys, row-major by query
    pub masked_wraps: Vec<WrapKey>,
}

impl Response {
    /// Merkle tree over the block leaves
    pub fn block_tree(&self, ctx: &CryptoContext) -> Result<MerkleTree> {
        MerkleTree::build(ctx, self.blocks.iter().map(|b| b.leaf(ctx)).collect())
    }

    pub fn digest(&self, ctx: &CryptoContext) -> [u8; 32] {
        let leaves: Vec<u8> = self.blocks.iter().flat_map(|b| b.leaf(ctx)).collect();
        let masked = self.masked_wraps.concat();
        ctx.hash(
            b"response",
            &[
                &self.seller_id,
                &self.buyer_id,
                &self.request_digest,
                &self.bulletin_root,
                &self.key_commitment,
                &(self.blocks.len() as u64).to_le_bytes(),
                &leaves,
                &masked,
            ],
        )
    }
}

impl WireMessage for Response {
    const KIND: MessageKind = MessageKind::Response;
}

/// Transcript commitments the buyer signs for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptBody {
    pub seller_id: SellerId,
    pub buyer_id: BuyerId,
    pub request_digest: [u8; 32],
    pub response_digest: [u8; 32],
    /// Merkle root over [`EncryptedBlock::leaf`]
    pub block_root: [u8; 32],
    pub block_count: u64,
    pub key_commitment: Vec<u8>,
    pub bulletin_root: [u8; 32],
    /// Seller's negotiated verifying key
    pub seller_key: Vec<u8>,
    /// Buyer's negotiated verifying key
    pub buyer_key: Vec<u8>,
}

impl ReceiptBody {
    pub fn digest(&self, ctx: &CryptoContext) -> [u8; 32] {
        ctx.hash(
            b"receipt",
            &[
                &self.seller_id,
                &self.buyer_id,
                &self.request_digest,
                &self.response_digest,
                &self.block_root,
                &self.block_count.to_le_bytes(),
                &self.key_commitment,
                &self.bulletin_root,
                &self.seller_key,
                &self.buyer_key,
            ],
        )
    }
}

/// Buyer-signed acknowledgment of the delivered transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub body: ReceiptBody,
    /// Buyer's signature over the body digest
    pub signature: Vec<u8>,
}

impl Receipt {
    pub fn digest(&self, ctx: &CryptoContext) -> [u8; 32] {
        self.body.digest(ctx)
    }
}

impl WireMessage for Receipt {
    const KIND: MessageKind = MessageKind::Receipt;
}

/// Seller's release of the seed opening `key_commitment`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub receipt_digest: [u8; 32],
    pub seed: [u8; 32],
    /// Seller's signature over [`Secret::digest`]
    pub signature: Vec<u8>,
}

impl Secret {
    pub fn digest(&self, ctx: &CryptoContext) -> [u8; 32] {
        ctx.hash(b"secret", &[&self.receipt_digest, &self.seed])
    }
}

impl WireMessage for Secret {
    const KIND: MessageKind = MessageKind::Secret;
}
