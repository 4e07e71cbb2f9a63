//! Negotiation message types

use crate::codec::{MessageKind, WireMessage};
use crate::types::Role;
use crate::CryptoContext;
use serde::{Deserialize, Serialize};

/// One half of a key agreement, sent by the initiator of a direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegoRequest {
    /// Sender identity
    pub from: [u8; 32],
    /// Intended receiver identity
    pub to: [u8; 32],
    /// Role of the sender
    pub role: Role,
    /// Sender's ECDSA verifying key (SEC1 compressed)
    pub verifying_key: Vec<u8>,
    /// Ephemeral ECDH point
    pub ephemeral: Vec<u8>,
    /// Base-OT sender point `A`; only present when the buyer initiates
    pub base_ot: Vec<u8>,
    /// Signature over [`NegoRequest::digest`]
    pub signature: Vec<u8>,
}

impl NegoRequest {
    /// Digest of every field except the signature
    pub fn digest(&self, ctx: &CryptoContext) -> [u8; 32] {
        ctx.hash(
            b"nego-request",
            &[
                &self.from,
                &self.to,
                &[role_byte(self.role)],
                &self.verifying_key,
                &self.ephemeral,
                &self.base_ot,
            ],
        )
    }
}

impl WireMessage for NegoRequest {
    const KIND: MessageKind = MessageKind::NegoRequest;
}

/// Answer to a [`NegoRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegoResponse {
    /// Sender identity
    pub from: [u8; 32],
    /// Intended receiver identity
    pub to: [u8; 32],
    /// Role of the sender
    pub role: Role,
    /// Digest of the request being answered
    pub request_digest: [u8; 32],
    /// Sender's ECDSA verifying key (SEC1 compressed)
    pub verifying_key: Vec<u8>,
    /// Ephemeral ECDH point
    pub ephemeral: Vec<u8>,
    /// Base-OT receiver points `B_i`; only present when the seller answers
    pub base_ot: Vec<Vec<u8>>,
    /// Signature over [`NegoResponse::digest`]
    pub signature: Vec<u8>,
}

impl NegoResponse {
    /// Digest of every field except the signature
    pub fn digest(&self, ctx: &CryptoContext) -> [u8; 32] {
        let points = self.base_ot.concat();
        ctx.hash(
            b"nego-response",
            &[
                &self.from,
                &self.to,
                &[role_byte(self.role)],
                &self.request_digest,
                &self.verifying_key,
                &self.ephemeral,
                &(self.base_ot.len() as u64).to_le_bytes(),
                &points,
            ],
        )
    }
}

impl WireMessage for NegoResponse {
    const KIND: MessageKind = MessageKind::NegoResponse;
}

fn role_byte(role: Role) -> u8 {
    match role {
        Role::Seller => 0,
        Role::Buyer => 1,
    }
}
