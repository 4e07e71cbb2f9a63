//! Oblivious Transfer (OT) primitives
//!
//! This module provides the OT layers of the batch transfer engine:
//! - Chou–Orlandi base OT (run once during negotiation)
//! - IKNP OT extension with the KOS consistency check (one batch per request)
//! - Naor–Pinkas 1-of-N selection built on the extended OTs

pub mod base_ot;
pub mod iknp;
pub mod selection;

pub use base_ot::{BaseOtSender, ReceiverKeys, SenderKeys};
pub use iknp::{CorrelationCheck, ExtendedKeys, Extension, IknpReceiver, IknpSender};

/// Key delivered by one OT instance
pub type OtKey = [u8; 16];
