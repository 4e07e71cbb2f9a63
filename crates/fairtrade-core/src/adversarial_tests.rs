//! Adversarial tests for the trade protocol
//!
//! These tests play a cheating seller or tamper with messages in flight and
//! check that every deviation is either rejected or turned into a claim that
//! a third party upholds.

use crate::claim::{Claim, FraudKind, Verdict};
use crate::codec::{decode, encode};
use crate::dataset::PublishedDataset;
use crate::primitives::{encode_point, encode_verifying_key, random_scalar_bytes, sign_digest};
use crate::transfer::{
    BuyerSession, BuyerState, Receipt, ReceiptBody, Response, Secret, SellerSession, SellerState,
};
use crate::types::{position_of, Range};
use crate::{CryptoContext, Error, ProtocolConfig};
use k256::ecdsa::SigningKey;
use k256::ProjectivePoint;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

const SELLER: [u8; 32] = [0x51; 32];
const BUYER: [u8; 32] = [0xb7; 32];
const ITEM_SIZE: usize = 16;

fn ctx() -> CryptoContext {
    CryptoContext::new(ProtocolConfig::default()).unwrap()
}

fn items() -> Vec<u8> {
    (0..64u64)
        .flat_map(|i| Sha256::digest(i.to_le_bytes())[..ITEM_SIZE].to_vec())
        .collect()
}

fn dataset(ctx: &CryptoContext) -> PublishedDataset {
    PublishedDataset::from_items(ctx, ITEM_SIZE, items()).unwrap()
}

fn demand() -> Vec<Range> {
    vec![Range::new(3, 2).unwrap(), Range::new(20, 1).unwrap()]
}

fn phantom() -> Vec<Range> {
    vec![Range::new(0, 40).unwrap()]
}

/// Negotiated sessions where the seller serves `served` but the buyer
/// trusts the commitment of `published`
fn negotiated<'c>(
    ctx: &'c CryptoContext,
    published: &PublishedDataset,
    served: PublishedDataset,
) -> (SellerSession<'c>, BuyerSession<'c>) {
    let mut seller = SellerSession::new(ctx, Arc::new(served), SELLER, BUYER).unwrap();
    let mut buyer = BuyerSession::new(
        ctx,
        published.bulletin().clone(),
        published.public_params().clone(),
        SELLER,
        BUYER,
        demand(),
        phantom(),
    )
    .unwrap();

    let response = seller.on_nego_request(&buyer.get_nego_request().unwrap()).unwrap();
    buyer.on_nego_response(&response).unwrap();
    let response = buyer.on_nego_request(&seller.get_nego_request().unwrap()).unwrap();
    seller.on_nego_response(&response).unwrap();

    (seller, buyer)
}

fn honest<'c>(
    ctx: &'c CryptoContext,
) -> (SellerSession<'c>, BuyerSession<'c>, PublishedDataset) {
    let published = dataset(ctx);
    let (seller, buyer) = negotiated(ctx, &published, published.clone());
    (seller, buyer, published)
}

fn through_receipt(
    seller: &mut SellerSession<'_>,
    buyer: &mut BuyerSession<'_>,
) -> (Response, Receipt) {
    let request = buyer.get_request().unwrap();
    let response = seller.on_request(&request).unwrap();
    let receipt = buyer.on_response(&response).unwrap();
    (response, receipt)
}

// ==================== Cheating Seller Tests ====================

#[test]
fn test_substituted_items_yield_upheld_claim() {
    let ctx = ctx();
    let published = dataset(&ctx);
    let mut served = published.clone();
    served.data_mut()[20 * ITEM_SIZE] ^= 0xff;

    let (mut seller, mut buyer) = negotiated(&ctx, &published, served);
    let (_, receipt) = through_receipt(&mut seller, &mut buyer);
    let secret = seller.on_receipt(&receipt).unwrap();

    let err = buyer.on_secret(&secret).unwrap_err();
    assert!(err.is_claimable(), "expected a secret error, got {}", err);
    assert_eq!(buyer.state(), BuyerState::SecretFailed);
    assert!(matches!(buyer.decrypt(), Err(Error::State { .. })));

    let claim = buyer.generate_claim().unwrap();
    let evidence = claim.evidence.as_ref().unwrap();
    assert_eq!(evidence.item_index, 20);

    // verification works on the decoded blob as well
    let claim: Claim = decode(&encode(&claim).unwrap()).unwrap();
    assert_eq!(
        claim.verify(&ctx, published.bulletin()),
        Verdict::Upheld(FraudKind::PlaintextMismatch)
    );
}

#[test]
fn test_seed_not_opening_commitment_yields_upheld_claim() {
    let ctx = ctx();
    let (mut seller, mut buyer, published) = honest(&ctx);
    let (_, receipt) = through_receipt(&mut seller, &mut buyer);

    let mut secret = seller.on_receipt(&receipt).unwrap();
    secret.seed = *random_scalar_bytes();
    secret.signature = sign_digest(seller.signing_key(), &secret.digest(&ctx));

    let err = buyer.on_secret(&secret).unwrap_err();
    assert!(matches!(err, Error::Secret(_)));

    let claim = buyer.generate_claim().unwrap();
    assert!(claim.evidence.is_none());
    assert_eq!(
        claim.verify(&ctx, published.bulletin()),
        Verdict::Upheld(FraudKind::SecretDoesNotOpenCommitment)
    );
}

#[test]
fn test_garbage_block_yields_undecryptable_claim() {
    let ctx = ctx();
    let (mut seller, mut buyer, published) = honest(&ctx);

    let request = buyer.get_request().unwrap();
    let mut response = seller.on_request(&request).unwrap();
    let position = position_of(buyer.requested_ranges(), 4).unwrap() as usize;
    response.blocks[position].ciphertext[0] ^= 1;

    // structure is intact, so the buyer signs for it
    let receipt = buyer.on_response(&response).unwrap();
    assert_eq!(buyer.state(), BuyerState::ReceiptSent);

    // a seller standing by its garbage releases the real seed anyway
    let mut secret = Secret {
        receipt_digest: receipt.digest(&ctx),
        seed: seller.pending_seed().unwrap(),
        signature: Vec::new(),
    };
    secret.signature = sign_digest(seller.signing_key(), &secret.digest(&ctx));

    assert!(matches!(buyer.on_secret(&secret), Err(Error::Secret(_))));
    let claim = buyer.generate_claim().unwrap();
    assert_eq!(
        claim.verify(&ctx, published.bulletin()),
        Verdict::Upheld(FraudKind::UndecryptableBlock)
    );
}

// ==================== Tampered Message Tests ====================

#[test]
fn test_unsigned_secret_is_not_claimable() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);
    let (_, receipt) = through_receipt(&mut seller, &mut buyer);
    let secret = seller.on_receipt(&receipt).unwrap();

    let mut forged = secret.clone();
    forged.seed = *random_scalar_bytes();
    assert!(matches!(buyer.on_secret(&forged), Err(Error::Protocol(_))));
    assert_eq!(buyer.state(), BuyerState::ReceiptSent);
    assert!(matches!(buyer.generate_claim(), Err(Error::State { .. })));

    let mut misbound = secret.clone();
    misbound.receipt_digest = [0u8; 32];
    assert!(matches!(buyer.on_secret(&misbound), Err(Error::Protocol(_))));

    buyer.on_secret(&secret).unwrap();
    assert_eq!(buyer.state(), BuyerState::SecretVerified);
}

#[test]
fn test_tampered_receipt_rejected() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);
    let (_, receipt) = through_receipt(&mut seller, &mut buyer);

    let mut wrong_count = receipt.clone();
    wrong_count.body.block_count += 1;
    assert!(matches!(seller.on_receipt(&wrong_count), Err(Error::Protocol(_))));

    let mut bad_signature = receipt.clone();
    bad_signature.signature[4] ^= 1;
    assert!(matches!(seller.on_receipt(&bad_signature), Err(Error::Protocol(_))));
    assert_eq!(seller.state(), SellerState::ResponseSent);

    seller.on_receipt(&receipt).unwrap();
    assert_eq!(seller.state(), SellerState::SecretReleased);
    assert!(matches!(seller.on_receipt(&receipt), Err(Error::State { .. })));
}

#[test]
fn test_receipt_over_modified_response_rejected() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);

    let request = buyer.get_request().unwrap();
    let mut response = seller.on_request(&request).unwrap();
    response.blocks[0].ciphertext[3] ^= 0x80;
    let receipt = buyer.on_response(&response).unwrap();

    let err = seller.on_receipt(&receipt).unwrap_err();
    assert!(matches!(err, Error::Protocol(ref m) if m.contains("response digest")));
}

#[test]
fn test_tampered_masked_wraps_abort_trade() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);

    let request = buyer.get_request().unwrap();
    let mut response = seller.on_request(&request).unwrap();
    for masked in response.masked_wraps.iter_mut() {
        masked[0] ^= 1;
    }

    assert!(matches!(buyer.on_response(&response), Err(Error::Validation(_))));
    assert_eq!(buyer.state(), BuyerState::Aborted);
    assert!(matches!(buyer.on_response(&response), Err(Error::State { .. })));
}

#[test]
fn test_truncated_response_aborts_trade() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);

    let request = buyer.get_request().unwrap();
    let mut response = seller.on_request(&request).unwrap();
    response.blocks.pop();

    let err = buyer.on_response(&response).unwrap_err();
    assert!(matches!(err, Error::Validation(ref m) if m.contains("blocks")));
    assert_eq!(buyer.state(), BuyerState::Aborted);
}

#[test]
fn test_response_to_other_request_leaves_buyer_waiting() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);

    let request = buyer.get_request().unwrap();
    let response = seller.on_request(&request).unwrap();

    let mut stale = response.clone();
    stale.request_digest = [7u8; 32];
    assert!(matches!(buyer.on_response(&stale), Err(Error::Protocol(_))));
    assert_eq!(buyer.state(), BuyerState::RequestSent);

    buyer.on_response(&response).unwrap();
    assert_eq!(buyer.state(), BuyerState::ReceiptSent);
}

#[test]
fn test_seller_rejects_malformed_requests() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);
    let request = buyer.get_request().unwrap();

    let mut unnormalized = request.clone();
    unnormalized.ranges = vec![Range::new(0, 20).unwrap(), Range::new(10, 30).unwrap()];
    assert!(matches!(seller.on_request(&unnormalized), Err(Error::Protocol(_))));

    let mut out_of_bounds = request.clone();
    out_of_bounds.ranges = vec![Range::new(40, 30).unwrap()];
    assert!(matches!(seller.on_request(&out_of_bounds), Err(Error::Data(_))));

    let mut no_queries = request.clone();
    no_queries.query_count = 0;
    assert!(matches!(seller.on_request(&no_queries), Err(Error::Protocol(_))));

    let mut short_columns = request.clone();
    short_columns.ot_columns.truncate(5);
    assert!(matches!(seller.on_request(&short_columns), Err(Error::Protocol(_))));

    let mut wrong_buyer = request.clone();
    wrong_buyer.buyer_id = [0u8; 32];
    assert!(matches!(seller.on_request(&wrong_buyer), Err(Error::Protocol(_))));

    assert_eq!(seller.state(), SellerState::Negotiated);
    seller.on_request(&request).unwrap();
}

#[test]
fn test_inconsistent_ot_columns_abort_seller() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);
    let request = buyer.get_request().unwrap();

    // one column encoding a choice vector the others do not
    let mut tampered = request.clone();
    tampered.ot_columns[7][0] ^= 1;
    let err = seller.on_request(&tampered).unwrap_err();
    assert!(matches!(err, Error::Protocol(ref m) if m.contains("correlation")));

    // no second attempt against the same Δ
    assert_eq!(seller.state(), SellerState::Aborted);
    assert!(seller.nego_secret().is_none());
    assert!(matches!(seller.on_request(&request), Err(Error::State { .. })));
}

#[test]
fn test_forged_correlation_check_aborts_seller() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);
    let mut request = buyer.get_request().unwrap();
    request.ot_check.t[3] ^= 0x10;

    assert!(matches!(seller.on_request(&request), Err(Error::Protocol(_))));
    assert_eq!(seller.state(), SellerState::Aborted);
}

#[test]
fn test_masked_wrap_limit_enforced_by_seller() {
    let ctx = ctx();
    let seller_ctx = CryptoContext::new(ProtocolConfig {
        max_masked_wraps: 100,
        ..Default::default()
    })
    .unwrap();
    let published = dataset(&ctx);

    let mut seller =
        SellerSession::new(&seller_ctx, Arc::new(published.clone()), SELLER, BUYER).unwrap();
    let mut buyer = BuyerSession::new(
        &ctx,
        published.bulletin().clone(),
        published.public_params().clone(),
        SELLER,
        BUYER,
        demand(),
        phantom(),
    )
    .unwrap();
    let response = seller.on_nego_request(&buyer.get_nego_request().unwrap()).unwrap();
    buyer.on_nego_response(&response).unwrap();
    let response = buyer.on_nego_request(&seller.get_nego_request().unwrap()).unwrap();
    seller.on_nego_response(&response).unwrap();

    // 3 queries over 40 positions
    let request = buyer.get_request().unwrap();
    let err = seller.on_request(&request).unwrap_err();
    assert!(matches!(err, Error::Protocol(ref m) if m.contains("masked wrap keys")));
    assert_eq!(seller.state(), SellerState::Negotiated);
}

#[test]
fn test_masked_wrap_limit_enforced_by_buyer() {
    let ctx = CryptoContext::new(ProtocolConfig {
        max_masked_wraps: 100,
        ..Default::default()
    })
    .unwrap();
    let published = dataset(&ctx);

    let oversized = BuyerSession::new(
        &ctx,
        published.bulletin().clone(),
        published.public_params().clone(),
        SELLER,
        BUYER,
        demand(),
        phantom(),
    );
    assert!(matches!(oversized, Err(Error::Config(ref m)) if m.contains("masked wrap keys")));

    // 3 queries over 25 positions fit
    let fitting = BuyerSession::new(
        &ctx,
        published.bulletin().clone(),
        published.public_params().clone(),
        SELLER,
        BUYER,
        demand(),
        vec![Range::new(0, 25).unwrap()],
    );
    assert!(fitting.is_ok());
}

#[test]
fn test_buyer_rejects_seller_without_bulletin_key() {
    let ctx = ctx();
    let published = dataset(&ctx);
    // same items, published under another key
    let impostor = PublishedDataset::from_items(&ctx, ITEM_SIZE, items()).unwrap();
    assert_eq!(impostor.bulletin().root, published.bulletin().root);

    let mut seller = SellerSession::new(&ctx, Arc::new(impostor), SELLER, BUYER).unwrap();
    let mut buyer = BuyerSession::new(
        &ctx,
        published.bulletin().clone(),
        published.public_params().clone(),
        SELLER,
        BUYER,
        demand(),
        phantom(),
    )
    .unwrap();

    let response = seller.on_nego_request(&buyer.get_nego_request().unwrap()).unwrap();
    let err = buyer.on_nego_response(&response).unwrap_err();
    assert!(matches!(err, Error::Protocol(ref m) if m.contains("verifying key")));
    assert_eq!(buyer.state(), BuyerState::Init);
}

// ==================== Claim Forgery Tests ====================

#[test]
fn test_claims_from_honest_trade_rejected() {
    let ctx = ctx();
    let (mut seller, mut buyer, published) = honest(&ctx);
    let (response, receipt) = through_receipt(&mut seller, &mut buyer);
    let secret = seller.on_receipt(&receipt).unwrap();
    buyer.on_secret(&secret).unwrap();
    assert!(matches!(buyer.generate_claim(), Err(Error::State { .. })));

    let bulletin = published.bulletin();
    let no_evidence = Claim::for_commitment(&receipt, &secret);
    assert!(matches!(no_evidence.verify(&ctx, bulletin), Verdict::Rejected(_)));

    // a real block with a made-up wrap key does not open the commitment
    let position = position_of(buyer.requested_ranges(), 3).unwrap();
    let forged = Claim::for_block(
        &ctx,
        &receipt,
        &secret,
        &response,
        published.public_params(),
        position,
        [0u8; 16],
    )
    .unwrap();
    let verdict = forged.verify(&ctx, bulletin);
    assert!(matches!(verdict, Verdict::Rejected(ref m) if m.contains("wrap key")));
    // verification is a pure function of the claim
    assert_eq!(forged.verify(&ctx, bulletin), verdict);

    let mut unsigned = no_evidence.clone();
    unsigned.receipt.signature[0] ^= 1;
    assert!(matches!(unsigned.verify(&ctx, bulletin), Verdict::Rejected(_)));

    let mut other_bulletin = bulletin.clone();
    other_bulletin.root = [0u8; 32];
    let tampered = Claim::for_commitment(&receipt, &secret);
    assert!(matches!(tampered.verify(&ctx, &other_bulletin), Verdict::Rejected(_)));
}

#[test]
fn test_wrong_seed_claim_needs_seller_signature() {
    let ctx = ctx();
    let (mut seller, mut buyer, published) = honest(&ctx);
    let (_, receipt) = through_receipt(&mut seller, &mut buyer);
    let mut secret = seller.on_receipt(&receipt).unwrap();

    // a buyer swapping the seed cannot produce the seller's signature
    secret.seed = *random_scalar_bytes();
    let claim = Claim::for_commitment(&receipt, &secret);
    assert!(matches!(
        claim.verify(&ctx, published.bulletin()),
        Verdict::Rejected(ref m) if m.contains("signature")
    ));
}

#[test]
fn test_claim_under_made_up_seller_key_rejected() {
    let ctx = ctx();
    let published = dataset(&ctx);
    let bulletin = published.bulletin();

    let fake_seller = SigningKey::random(&mut OsRng);
    let fake_buyer = SigningKey::random(&mut OsRng);
    let body = ReceiptBody {
        seller_id: SELLER,
        buyer_id: BUYER,
        request_digest: [1u8; 32],
        response_digest: [2u8; 32],
        block_root: [3u8; 32],
        block_count: 1,
        key_commitment: encode_point(&ProjectivePoint::GENERATOR),
        bulletin_root: bulletin.root,
        seller_key: encode_verifying_key(fake_seller.verifying_key()),
        buyer_key: encode_verifying_key(fake_buyer.verifying_key()),
    };
    let signature = sign_digest(&fake_buyer, &body.digest(&ctx));
    let receipt = Receipt { body, signature };
    let mut secret = Secret {
        receipt_digest: receipt.digest(&ctx),
        seed: [9u8; 32],
        signature: Vec::new(),
    };
    secret.signature = sign_digest(&fake_seller, &secret.digest(&ctx));
    let claim = Claim::for_commitment(&receipt, &secret);

    assert!(matches!(
        claim.verify(&ctx, bulletin),
        Verdict::Rejected(ref m) if m.contains("seller key")
    ));

    // the same transcript stands against a bulletin that does publish the key
    let mut owned = bulletin.clone();
    owned.seller_key = encode_verifying_key(fake_seller.verifying_key());
    assert_eq!(
        claim.verify(&ctx, &owned),
        Verdict::Upheld(FraudKind::SecretDoesNotOpenCommitment)
    );
}

// ==================== Lifecycle Tests ====================

#[test]
fn test_aborted_sessions_refuse_everything() {
    let ctx = ctx();
    let (mut seller, mut buyer, _) = honest(&ctx);
    buyer.abort();
    seller.abort();

    assert_eq!(buyer.state(), BuyerState::Aborted);
    assert!(matches!(buyer.get_request(), Err(Error::State { .. })));
    assert!(buyer.nego_secret().is_none());
    assert!(matches!(seller.get_nego_request(), Err(Error::State { .. })));
    assert!(seller.nego_secret().is_none());
}

#[test]
fn test_transfer_before_negotiation_rejected() {
    let ctx = ctx();
    let published = dataset(&ctx);
    let mut buyer = BuyerSession::new(
        &ctx,
        published.bulletin().clone(),
        published.public_params().clone(),
        SELLER,
        BUYER,
        demand(),
        phantom(),
    )
    .unwrap();
    buyer.get_nego_request().unwrap();

    assert!(matches!(buyer.get_request(), Err(Error::State { .. })));
    assert_eq!(buyer.state(), BuyerState::Init);
}
