//! Negotiation engine
//!
//! Establishes a pair-bound secret before any transfer. Each side is both
//! requester and responder: the two directions run independently and the
//! session is negotiated once both complete. The buyer-initiated direction
//! also carries the κ base OTs the transfer engine extends later.

mod messages;

pub use messages::{NegoRequest, NegoResponse};

use crate::oblivious::base_ot::{self, BaseOtSender, ReceiverKeys, SenderKeys};
use crate::primitives::{
    decode_point, decode_verifying_key, encode_point, encode_verifying_key, random_scalar_bytes,
    scalar_from_bytes, sign_digest, verify_digest,
};
use crate::types::Role;
use crate::{CryptoContext, Error, Result};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::ProjectivePoint;
use merlin::Transcript;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

/// Progress of one negotiation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionState {
    Init,
    RequestSent,
    Negotiated,
}

enum Outbound {
    Init,
    RequestSent {
        digest: [u8; 32],
        ephemeral: Zeroizing<[u8; 32]>,
        base_ot: Option<BaseOtSender>,
    },
    Negotiated {
        shared: Zeroizing<Vec<u8>>,
    },
}

enum Inbound {
    Init,
    Negotiated { shared: Zeroizing<Vec<u8>> },
}

enum BaseKeys {
    None,
    Sender(SenderKeys),
    Receiver(ReceiverKeys),
}

/// Both directions of the key agreement for one party
pub struct Negotiator {
    role: Role,
    self_id: [u8; 32],
    peer_id: [u8; 32],
    signing_key: SigningKey,
    peer_key: Option<VerifyingKey>,
    outbound: Outbound,
    inbound: Inbound,
    base: BaseKeys,
    secret: Option<Zeroizing<[u8; 32]>>,
}

impl Negotiator {
    /// Fresh negotiator with an ephemeral signing key
    pub fn new(role: Role, self_id: [u8; 32], peer_id: [u8; 32]) -> Self {
        Self::with_signing_key(role, self_id, peer_id, SigningKey::random(&mut OsRng))
    }

    /// Negotiator signing under a long-term key
    pub fn with_signing_key(
        role: Role,
        self_id: [u8; 32],
        peer_id: [u8; 32],
        signing_key: SigningKey,
    ) -> Self {
        Self {
            role,
            self_id,
            peer_id,
            signing_key,
            peer_key: None,
            outbound: Outbound::Init,
            inbound: Inbound::Init,
            base: BaseKeys::None,
            secret: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn outbound_state(&self) -> DirectionState {
        match self.outbound {
            Outbound::Init => DirectionState::Init,
            Outbound::RequestSent { .. } => DirectionState::RequestSent,
            Outbound::Negotiated { .. } => DirectionState::Negotiated,
        }
    }

    pub fn inbound_state(&self) -> DirectionState {
        match self.inbound {
            Inbound::Init => DirectionState::Init,
            Inbound::Negotiated { .. } => DirectionState::Negotiated,
        }
    }

    /// Both directions completed
    pub fn is_negotiated(&self) -> bool {
        self.secret.is_some()
    }

    /// Negotiation secret, once both directions completed
    pub fn secret(&self) -> Option<&[u8; 32]> {
        self.secret.as_deref()
    }

    /// This party's session verifying key
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The peer's session verifying key, once announced or pinned
    pub fn peer_key(&self) -> Option<&VerifyingKey> {
        self.peer_key.as_ref()
    }

    /// Only accept peer messages signed under `key`
    pub fn pin_peer_key(mut self, key: VerifyingKey) -> Self {
        self.peer_key = Some(key);
        self
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub(crate) fn sender_keys(&self) -> Result<&SenderKeys> {
        match &self.base {
            BaseKeys::Sender(keys) => Ok(keys),
            _ => Err(Error::Resource("base OT sender keys unavailable".into())),
        }
    }

    pub(crate) fn receiver_keys(&self) -> Result<&ReceiverKeys> {
        match &self.base {
            BaseKeys::Receiver(keys) => Ok(keys),
            _ => Err(Error::Resource("base OT receiver keys unavailable".into())),
        }
    }

    /// Start the outbound direction
    #[instrument(skip_all, fields(role = ?self.role))]
    pub fn request(&mut self, ctx: &CryptoContext) -> Result<NegoRequest> {
        if !matches!(self.outbound, Outbound::Init) {
            return Err(Error::state("get_nego_request", self.outbound_state()));
        }

        let ephemeral = random_scalar_bytes();
        let point = ProjectivePoint::GENERATOR * scalar_from_bytes(&ephemeral);

        let base_ot = match self.role {
            Role::Buyer => Some(BaseOtSender::new()),
            Role::Seller => None,
        };

        let mut request = NegoRequest {
            from: self.self_id,
            to: self.peer_id,
            role: self.role,
            verifying_key: encode_verifying_key(self.verifying_key()),
            ephemeral: encode_point(&point),
            base_ot: base_ot
                .as_ref()
                .map(|s| s.public().to_vec())
                .unwrap_or_default(),
            signature: Vec::new(),
        };
        let digest = request.digest(ctx);
        request.signature = sign_digest(&self.signing_key, &digest);

        debug!(digest = %hex::encode(digest), "Negotiation request created");
        self.outbound = Outbound::RequestSent {
            digest,
            ephemeral,
            base_ot,
        };
        Ok(request)
    }

    /// Answer the peer's request, completing the inbound direction
    #[instrument(skip_all, fields(role = ?self.role))]
    pub fn respond(
        &mut self,
        ctx: &CryptoContext,
        request: &NegoRequest,
    ) -> Result<NegoResponse> {
        if !matches!(self.inbound, Inbound::Init) {
            return Err(Error::state("on_nego_request", self.inbound_state()));
        }
        if request.from != self.peer_id || request.to != self.self_id {
            return Err(Error::Protocol("identity mismatch".into()));
        }
        if request.role != self.role.peer() {
            return Err(Error::Protocol(format!(
                "identity mismatch: request claims role {:?}",
                request.role
            )));
        }

        let peer_key = decode_verifying_key(&request.verifying_key)
            .map_err(|e| Error::Protocol(format!("malformed request: {}", e)))?;
        let digest = request.digest(ctx);
        if !verify_digest(&peer_key, &digest, &request.signature) {
            return Err(Error::Protocol("malformed request: bad signature".into()));
        }
        self.check_peer_key(&peer_key)?;

        let peer_point = decode_point(&request.ephemeral)
            .map_err(|e| Error::Protocol(format!("malformed request: {}", e)))?;

        let (points, receiver) = match self.role {
            Role::Seller => {
                if request.base_ot.is_empty() {
                    return Err(Error::Protocol(
                        "malformed request: missing base OT point".into(),
                    ));
                }
                let (points, keys) = base_ot::respond(ctx, &request.base_ot)?;
                (points, Some(keys))
            }
            Role::Buyer => {
                if !request.base_ot.is_empty() {
                    return Err(Error::Protocol(
                        "malformed request: unexpected base OT point".into(),
                    ));
                }
                (Vec::new(), None)
            }
        };

        let ephemeral = random_scalar_bytes();
        let scalar = scalar_from_bytes(&ephemeral);
        let shared = Zeroizing::new(encode_point(&(peer_point * scalar)));

        let mut response = NegoResponse {
            from: self.self_id,
            to: self.peer_id,
            role: self.role,
            request_digest: digest,
            verifying_key: encode_verifying_key(self.verifying_key()),
            ephemeral: encode_point(&(ProjectivePoint::GENERATOR * scalar)),
            base_ot: points,
            signature: Vec::new(),
        };
        response.signature = sign_digest(&self.signing_key, &response.digest(ctx));

        if let Some(keys) = receiver {
            self.base = BaseKeys::Receiver(keys);
        }
        self.peer_key = Some(peer_key);
        self.inbound = Inbound::Negotiated { shared };
        self.try_finish(ctx);
        Ok(response)
    }

    /// Complete the outbound direction with the peer's answer
    #[instrument(skip_all, fields(role = ?self.role))]
    pub fn on_response(&mut self, ctx: &CryptoContext, response: &NegoResponse) -> Result<()> {
        let (digest, ephemeral) = match &self.outbound {
            Outbound::RequestSent {
                digest, ephemeral, ..
            } => (*digest, scalar_from_bytes(ephemeral)),
            _ => return Err(Error::state("on_nego_response", self.outbound_state())),
        };

        if response.from != self.peer_id
            || response.to != self.self_id
            || response.role != self.role.peer()
        {
            return Err(Error::Protocol("identity mismatch".into()));
        }
        if !bool::from(response.request_digest[..].ct_eq(&digest[..])) {
            return Err(Error::Protocol(
                "response does not match the request sent".into(),
            ));
        }

        let peer_key = decode_verifying_key(&response.verifying_key)
            .map_err(|e| Error::Protocol(format!("malformed response: {}", e)))?;
        if !verify_digest(&peer_key, &response.digest(ctx), &response.signature) {
            return Err(Error::Protocol("malformed response: bad signature".into()));
        }
        self.check_peer_key(&peer_key)?;

        let peer_point = decode_point(&response.ephemeral)
            .map_err(|e| Error::Protocol(format!("malformed response: {}", e)))?;
        let shared = Zeroizing::new(encode_point(&(peer_point * ephemeral)));

        let sender_keys = match (&self.outbound, self.role) {
            (Outbound::RequestSent { base_ot: Some(sender), .. }, Role::Buyer) => {
                Some(sender.finish(ctx, &response.base_ot)?)
            }
            _ => {
                if !response.base_ot.is_empty() {
                    return Err(Error::Protocol(
                        "malformed response: unexpected base OT points".into(),
                    ));
                }
                None
            }
        };

        if let Some(keys) = sender_keys {
            self.base = BaseKeys::Sender(keys);
        }
        self.peer_key = Some(peer_key);
        self.outbound = Outbound::Negotiated { shared };
        self.try_finish(ctx);
        Ok(())
    }

    fn check_peer_key(&self, key: &VerifyingKey) -> Result<()> {
        match &self.peer_key {
            Some(known) if known != key => Err(Error::Protocol(
                "peer announced a different verifying key".into(),
            )),
            _ => Ok(()),
        }
    }

    fn try_finish(&mut self, ctx: &CryptoContext) {
        let (out_shared, in_shared) = match (&self.outbound, &self.inbound) {
            (Outbound::Negotiated { shared: o }, Inbound::Negotiated { shared: i }) => (o, i),
            _ => return,
        };

        let (seller_id, buyer_id, buyer_dh, seller_dh) = match self.role {
            Role::Seller => (&self.self_id, &self.peer_id, in_shared, out_shared),
            Role::Buyer => (&self.peer_id, &self.self_id, out_shared, in_shared),
        };

        let mut transcript = Transcript::new(b"fairtrade-nego");
        transcript.append_message(b"domain", ctx.domain_tag());
        transcript.append_message(b"seller", seller_id);
        transcript.append_message(b"buyer", buyer_id);
        transcript.append_message(b"buyer-initiated", buyer_dh);
        transcript.append_message(b"seller-initiated", seller_dh);

        let mut secret = Zeroizing::new([0u8; 32]);
        transcript.challenge_bytes(b"nego-secret", secret.as_mut_slice());
        self.secret = Some(secret);

        info!(role = ?self.role, "Negotiation complete");
    }

    /// Drop all derived key material
    pub(crate) fn erase(&mut self) {
        self.outbound = Outbound::Init;
        self.inbound = Inbound::Init;
        self.base = BaseKeys::None;
        self.secret = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProtocolConfig;

    const SELLER: [u8; 32] = [0xaa; 32];
    const BUYER: [u8; 32] = [0xbb; 32];

    fn pair() -> (Negotiator, Negotiator) {
        (
            Negotiator::new(Role::Seller, SELLER, BUYER),
            Negotiator::new(Role::Buyer, BUYER, SELLER),
        )
    }

    fn negotiate(ctx: &CryptoContext, seller: &mut Negotiator, buyer: &mut Negotiator) {
        let buyer_req = buyer.request(ctx).unwrap();
        let seller_resp = seller.respond(ctx, &buyer_req).unwrap();
        buyer.on_response(ctx, &seller_resp).unwrap();

        let seller_req = seller.request(ctx).unwrap();
        let buyer_resp = buyer.respond(ctx, &seller_req).unwrap();
        seller.on_response(ctx, &buyer_resp).unwrap();
    }

    #[test]
    fn test_negotiation_symmetry() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let (mut seller, mut buyer) = pair();
        negotiate(&ctx, &mut seller, &mut buyer);

        assert!(seller.is_negotiated());
        assert!(buyer.is_negotiated());
        assert_eq!(seller.secret().unwrap(), buyer.secret().unwrap());
        assert_eq!(seller.peer_key().unwrap(), buyer.verifying_key());
        assert!(seller.receiver_keys().is_ok());
        assert!(buyer.sender_keys().is_ok());
    }

    #[test]
    fn test_direction_order_does_not_matter() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let (mut seller, mut buyer) = pair();

        let seller_req = seller.request(&ctx).unwrap();
        let buyer_req = buyer.request(&ctx).unwrap();
        assert_eq!(seller.outbound_state(), DirectionState::RequestSent);

        let buyer_resp = buyer.respond(&ctx, &seller_req).unwrap();
        let seller_resp = seller.respond(&ctx, &buyer_req).unwrap();
        assert!(!seller.is_negotiated());

        seller.on_response(&ctx, &buyer_resp).unwrap();
        buyer.on_response(&ctx, &seller_resp).unwrap();
        assert_eq!(seller.secret(), buyer.secret());
    }

    #[test]
    fn test_independent_sessions_get_distinct_secrets() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let (mut s1, mut b1) = pair();
        let (mut s2, mut b2) = pair();
        negotiate(&ctx, &mut s1, &mut b1);
        negotiate(&ctx, &mut s2, &mut b2);
        assert_ne!(s1.secret(), s2.secret());
    }

    #[test]
    fn test_identity_mismatch_rejected() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let mut seller = Negotiator::new(Role::Seller, SELLER, BUYER);
        let mut stranger = Negotiator::new(Role::Buyer, [0xcc; 32], SELLER);

        let request = stranger.request(&ctx).unwrap();
        let err = seller.respond(&ctx, &request).unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("identity mismatch")));
        assert_eq!(seller.inbound_state(), DirectionState::Init);
    }

    #[test]
    fn test_tampered_request_rejected() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let (mut seller, mut buyer) = pair();

        let request = buyer.request(&ctx).unwrap();
        let mut tampered = request.clone();
        tampered.ephemeral = encode_point(&ProjectivePoint::GENERATOR);
        let err = seller.respond(&ctx, &tampered).unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("bad signature")));

        let response = seller.respond(&ctx, &request).unwrap();
        buyer.on_response(&ctx, &response).unwrap();
        assert_eq!(buyer.outbound_state(), DirectionState::Negotiated);
    }

    #[test]
    fn test_replayed_response_rejected() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let (mut seller, mut buyer) = pair();

        // answer to an earlier request from the same buyer identity
        let mut earlier = Negotiator::new(Role::Buyer, BUYER, SELLER);
        let old_request = earlier.request(&ctx).unwrap();
        let old_response = Negotiator::new(Role::Seller, SELLER, BUYER)
            .respond(&ctx, &old_request)
            .unwrap();

        let request = buyer.request(&ctx).unwrap();
        let err = buyer.on_response(&ctx, &old_response).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(buyer.outbound_state(), DirectionState::RequestSent);

        let response = seller.respond(&ctx, &request).unwrap();
        buyer.on_response(&ctx, &response).unwrap();
        assert_eq!(buyer.outbound_state(), DirectionState::Negotiated);
    }

    #[test]
    fn test_out_of_order_operations() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let (mut seller, mut buyer) = pair();

        let request = buyer.request(&ctx).unwrap();
        assert!(matches!(buyer.request(&ctx), Err(Error::State { .. })));

        let response = seller.respond(&ctx, &request).unwrap();
        assert!(matches!(seller.respond(&ctx, &request), Err(Error::State { .. })));

        let mut idle = Negotiator::new(Role::Buyer, BUYER, SELLER);
        assert!(matches!(idle.on_response(&ctx, &response), Err(Error::State { .. })));
    }

    #[test]
    fn test_pinned_key_rejects_impostor() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let long_term = SigningKey::random(&mut OsRng);
        let mut seller =
            Negotiator::with_signing_key(Role::Seller, SELLER, BUYER, long_term.clone());
        let mut impostor = Negotiator::new(Role::Seller, SELLER, BUYER);
        let mut buyer = Negotiator::new(Role::Buyer, BUYER, SELLER)
            .pin_peer_key(*long_term.verifying_key());

        let request = buyer.request(&ctx).unwrap();
        let forged = impostor.respond(&ctx, &request).unwrap();
        let err = buyer.on_response(&ctx, &forged).unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("verifying key")));
        assert_eq!(buyer.outbound_state(), DirectionState::RequestSent);

        let response = seller.respond(&ctx, &request).unwrap();
        buyer.on_response(&ctx, &response).unwrap();
        assert_eq!(buyer.peer_key(), Some(long_term.verifying_key()));
    }

    #[test]
    fn test_key_change_between_directions_rejected() {
        let ctx = CryptoContext::new(ProtocolConfig::default()).unwrap();
        let (mut seller, mut buyer) = pair();

        let request = buyer.request(&ctx).unwrap();
        let response = seller.respond(&ctx, &request).unwrap();
        buyer.on_response(&ctx, &response).unwrap();

        // a second buyer identity-twin with a different signing key
        let mut twin = Negotiator::new(Role::Buyer, BUYER, SELLER);
        let seller_req = seller.request(&ctx).unwrap();
        let forged = twin.respond(&ctx, &seller_req).unwrap();
        let err = seller.on_response(&ctx, &forged).unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m.contains("verifying key")));
        assert!(!seller.is_negotiated());
    }
}
