//! Protocol configuration and the explicit crypto context
//!
//! A [`CryptoContext`] is built once at process start and handed by reference
//! to every session constructor. It fixes the domain separation shared by all
//! hashes, PRGs and transcripts, so two parties only interoperate when they
//! agree on the configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// OT security parameter (number of base OTs)
pub const KAPPA: usize = 128;

/// Bytes for κ bits
pub const KAPPA_BYTES: usize = KAPPA / 8;

/// Tunable protocol parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Domain label mixed into every hash
    pub domain: String,
    /// Upper bound on |demand ∪ phantom| items in one request
    pub max_request_items: u64,
    /// Upper bound on the size of one published item
    pub max_item_size: usize,
    /// Upper bound on `queries × positions` masked wrap keys in one response
    pub max_masked_wraps: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            domain: "fairtrade/otbatch/v1".into(),
            max_request_items: 1 << 20,
            max_item_size: 1 << 20,
            max_masked_wraps: 1 << 22,
        }
    }
}

impl ProtocolConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: ProtocolConfig = serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check parameter sanity
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::Config("domain label must not be empty".into()));
        }
        if self.max_request_items == 0 {
            return Err(Error::Config("max_request_items must be positive".into()));
        }
        if self.max_item_size == 0 {
            return Err(Error::Config("max_item_size must be positive".into()));
        }
        if self.max_masked_wraps == 0 {
            return Err(Error::Config("max_masked_wraps must be positive".into()));
        }
        Ok(())
    }
}

/// Process-wide cryptographic context
#[derive(Debug, Clone)]
pub struct CryptoContext {
    config: ProtocolConfig,
    domain_tag: [u8; 32],
}

impl CryptoContext {
    /// Validate the configuration and derive the domain tag
    pub fn new(config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        let domain_tag = Sha256::digest(config.domain.as_bytes()).into();
        Ok(Self { config, domain_tag })
    }

    /// Active configuration
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Domain tag, also fed into merlin transcripts
    pub fn domain_tag(&self) -> &[u8; 32] {
        &self.domain_tag
    }

    /// Domain-separated hash over length-prefixed parts
    pub fn hash(&self, label: &[u8], parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.domain_tag);
        hasher.update((label.len() as u64).to_le_bytes());
        hasher.update(label);
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.finalize().into()
    }
}
