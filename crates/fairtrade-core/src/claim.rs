//! Claim generation and verification
//!
//! A claim packages the buyer-signed receipt, the seller-signed secret and,
//! when the seed itself opens its commitment, the evidence for one block
//! whose decryption contradicts the bulletin. Verification needs nothing but
//! the claim and the public bulletin, whose seller key anchors the secret's
//! signature.

use crate::codec::{MessageKind, WireMessage};
use crate::dataset::{Bulletin, PublicParams};
use crate::merkle::MerkleProof;
use crate::primitives::{block_key, item_leaf, open_block, seed_opens, wrap_commitment, WrapKey};
use crate::transfer::{
    verify_receipt_signature, verify_secret_signature, EncryptedBlock, Receipt, Response, Secret,
};
use crate::{CryptoContext, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of seller misbehaviour a claim demonstrates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FraudKind {
    /// The released seed is not the discrete log of the key commitment
    SecretDoesNotOpenCommitment,
    /// A delivered block fails authentication under its derived key
    UndecryptableBlock,
    /// A delivered block decrypts to something other than the committed item
    PlaintextMismatch,
}

/// Outcome of verifying a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Upheld(FraudKind),
    Rejected(String),
}

impl Verdict {
    pub fn is_upheld(&self) -> bool {
        matches!(self, Verdict::Upheld(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Upheld(kind) => write!(f, "upheld: {:?}", kind),
            Verdict::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// One offending block, tied to both the receipt and the bulletin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvidence {
    /// Position of the block in the response
    pub position: u64,
    /// Dataset index of the item
    pub item_index: u64,
    pub block: EncryptedBlock,
    /// Path from the block leaf to the receipt's block root
    pub block_proof: MerkleProof,
    /// Wrap key the buyer obtained for this block
    pub wrap_key: WrapKey,
    /// Bulletin leaf for `item_index`
    pub committed_leaf: [u8; 32],
    /// Path from `committed_leaf` to the bulletin root
    pub leaf_proof: MerkleProof,
}

/// Publicly verifiable fraud proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub receipt: Receipt,
    pub secret: Secret,
    pub evidence: Option<BlockEvidence>,
}

impl WireMessage for Claim {
    const KIND: MessageKind = MessageKind::Claim;
}

impl Claim {
    /// Claim against a seed that does not open the key commitment
    pub(crate) fn for_commitment(receipt: &Receipt, secret: &Secret) -> Self {
        Self {
            receipt: receipt.clone(),
            secret: secret.clone(),
            evidence: None,
        }
    }

    /// Claim against the block at `position`
    pub(crate) fn for_block(
        ctx: &CryptoContext,
        receipt: &Receipt,
        secret: &Secret,
        response: &Response,
        public: &PublicParams,
        position: u64,
        wrap_key: WrapKey,
    ) -> Result<Self> {
        let block = response
            .blocks
            .get(position as usize)
            .ok_or_else(|| Error::Data(format!("no block at position {}", position)))?;
        let committed_leaf = *public
            .leaf(block.index)
            .ok_or_else(|| Error::Data(format!("item {} not published", block.index)))?;

        let evidence = BlockEvidence {
            position,
            item_index: block.index,
            block: block.clone(),
            block_proof: response.block_tree(ctx)?.proof(position)?,
            wrap_key,
            committed_leaf,
            leaf_proof: public.proof(ctx, block.index)?,
        };

        Ok(Self {
            receipt: receipt.clone(),
            secret: secret.clone(),
            evidence: Some(evidence),
        })
    }

    /// Decide the claim from its contents and the public bulletin
    ///
    /// The secret must be signed under the seller key the bulletin publishes.
    pub fn verify(&self, ctx: &CryptoContext, bulletin: &Bulletin) -> Verdict {
        let body = &self.receipt.body;
        if body.bulletin_root != bulletin.root {
            return Verdict::Rejected("receipt names a different bulletin".into());
        }
        if body.seller_key != bulletin.seller_key {
            return Verdict::Rejected("receipt names a seller key the bulletin does not".into());
        }

        if let Err(e) = verify_receipt_signature(ctx, &self.receipt) {
            return Verdict::Rejected(e.to_string());
        }
        if let Err(e) = verify_secret_signature(ctx, &self.receipt, &self.secret) {
            return Verdict::Rejected(e.to_string());
        }

        if !seed_opens(&self.secret.seed, &body.key_commitment) {
            return Verdict::Upheld(FraudKind::SecretDoesNotOpenCommitment);
        }

        let evidence = match &self.evidence {
            Some(evidence) => evidence,
            None => {
                return Verdict::Rejected(
                    "secret opens its commitment and no block is disputed".into(),
                )
            }
        };
        match self.check_block(ctx, bulletin, evidence) {
            Ok(verdict) => verdict,
            Err(e) => Verdict::Rejected(e.to_string()),
        }
    }

    fn check_block(
        &self,
        ctx: &CryptoContext,
        bulletin: &Bulletin,
        evidence: &BlockEvidence,
    ) -> Result<Verdict> {
        let body = &self.receipt.body;
        let block = &evidence.block;

        if evidence.block_proof.index != evidence.position {
            return Err(Error::Validation("block proof is for another position".into()));
        }
        evidence
            .block_proof
            .verify(ctx, &block.leaf(ctx), body.block_count, &body.block_root)?;

        if block.index != evidence.item_index {
            return Err(Error::Validation("block is for another item".into()));
        }
        let commitment = wrap_commitment(ctx, evidence.item_index, &evidence.wrap_key);
        if commitment != block.wrap_commitment {
            return Err(Error::Validation(
                "wrap key does not open the block's commitment".into(),
            ));
        }

        if evidence.leaf_proof.index != evidence.item_index {
            return Err(Error::Validation("leaf proof is for another item".into()));
        }
        evidence.leaf_proof.verify(
            ctx,
            &evidence.committed_leaf,
            bulletin.item_count,
            &bulletin.root,
        )?;

        let key = block_key(ctx, &self.secret.seed, evidence.item_index, &evidence.wrap_key)?;
        let verdict = match open_block(&key, &block.ciphertext) {
            None => Verdict::Upheld(FraudKind::UndecryptableBlock),
            Some(plaintext) => {
                if item_leaf(ctx, evidence.item_index, &plaintext) != evidence.committed_leaf {
                    Verdict::Upheld(FraudKind::PlaintextMismatch)
                } else {
                    Verdict::Rejected("block decrypts to the committed item".into())
                }
            }
        };
        Ok(verdict)
    }
}
