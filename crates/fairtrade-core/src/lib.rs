//! # Fairtrade Core
//!
//! Session protocol and batch oblivious-transfer exchange engine for fair
//! data trading between a seller and a buyer.
//!
//! This crate provides:
//! - Negotiation of a pair-bound session secret (both directions)
//! - OT batch transfer hiding demanded ranges among phantom ranges
//! - Receipt/secret exchange anchoring payment to key release
//! - Publicly verifiable claims when a released secret is fraudulent
//!
//! ## Protocol Overview
//!
//! The seller publishes a [`dataset::Bulletin`] committing to an array of
//! fixed-size items. A buyer fetches the items of its demand ranges with
//! 1-of-N oblivious transfers over `normalize(demand ∪ phantom)`, so the
//! seller learns how many items were bought but not which. Every item is
//! delivered encrypted; the key material is only released after the buyer
//! signs a receipt over the exact transcript, and the buyer checks every
//! decrypted item against the bulletin.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fairtrade_core::{BuyerSession, CryptoContext, ProtocolConfig, SellerSession};
//!
//! let ctx = CryptoContext::new(ProtocolConfig::default())?;
//! let mut seller = SellerSession::new(&ctx, dataset, seller_id, buyer_id)?;
//! let mut buyer =
//!     BuyerSession::new(&ctx, bulletin, public, seller_id, buyer_id, demand, phantom)?;
//!
//! let resp = seller.on_nego_request(&buyer.get_nego_request()?)?;
//! buyer.on_nego_response(&resp)?;
//! let resp = buyer.on_nego_request(&seller.get_nego_request()?)?;
//! seller.on_nego_response(&resp)?;
//!
//! let response = seller.on_request(&buyer.get_request()?)?;
//! let secret = seller.on_receipt(&buyer.on_response(&response)?)?;
//! buyer.on_secret(&secret)?;
//! let plaintext = buyer.decrypt()?;
//! ```

pub mod claim;
pub mod codec;
pub mod context;
pub mod dataset;
pub mod error;
pub mod merkle;
pub mod nego;
pub mod oblivious;
pub mod primitives;
pub mod transfer;
pub mod types;

#[cfg(test)]
mod adversarial_tests;

pub use claim::{BlockEvidence, Claim, FraudKind, Verdict};
pub use codec::{decode, encode, peek_kind, MessageKind, WireMessage};
pub use context::{CryptoContext, ProtocolConfig};
pub use dataset::{Bulletin, PublicParams, PublishedDataset};
pub use error::{Error, Result};
pub use nego::{NegoRequest, NegoResponse};
pub use transfer::{
    BuyerSession, BuyerState, EncryptedBlock, Receipt, ReceiptBody, Request, Response, Secret,
    SellerSession, SellerState,
};
pub use types::{BuyerId, Range, Role, SellerId};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
