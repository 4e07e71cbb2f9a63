//! Published dataset, bulletin commitment and public parameters
//!
//! The seller holds a [`PublishedDataset`]: an ordered array of fixed-size
//! items plus the [`Bulletin`] committing to them. The buyer only needs the
//! bulletin and the [`PublicParams`] (per-item leaf digests) to verify what it
//! decrypts.
//!
//! The bulletin also publishes the seller's long-term verifying key. The
//! seller signs its negotiation messages and released secrets with the
//! matching signing key, so a claim can be pinned to the bulletin's owner.
//!
//! On disk a published directory contains `items.bin`, `bulletin.json`,
//! `public.bin` and the seller's signing key in `seller.key`.

use crate::merkle::{MerkleProof, MerkleTree};
use crate::primitives::{decode_verifying_key, encode_verifying_key, item_leaf};
use crate::types::Range;
use crate::{CryptoContext, Error, Result};
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

/// File holding the raw item array
pub const ITEMS_FILE: &str = "items.bin";
/// File holding the bulletin
pub const BULLETIN_FILE: &str = "bulletin.json";
/// File holding the public parameters
pub const PUBLIC_FILE: &str = "public.bin";
/// File holding the seller's signing key (hex)
pub const KEY_FILE: &str = "seller.key";

/// Seller's published, content-binding commitment over the dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bulletin {
    /// Number of items
    pub item_count: u64,
    /// Size of every item in bytes
    pub item_size: u32,
    /// Merkle root over the item leaves
    #[serde(with = "hex_root")]
    pub root: [u8; 32],
    /// Seller's long-term ECDSA verifying key (SEC1 compressed)
    #[serde(with = "hex::serde")]
    pub seller_key: Vec<u8>,
}

impl Bulletin {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("invalid bulletin {}: {}", path.display(), e)))
    }

    /// Save as a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Decoded seller verifying key
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        decode_verifying_key(&self.seller_key)
            .map_err(|e| Error::Config(format!("bulletin seller key: {}", e)))
    }

    /// Whether every range lies inside the item array
    pub fn covers(&self, ranges: &[Range]) -> bool {
        ranges.iter().all(|r| r.end() <= self.item_count)
    }
}

mod hex_root {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(root: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(root))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid root length"))
    }
}

/// Per-item leaf digests; reproduce the bulletin root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicParams {
    leaves: Vec<[u8; 32]>,
}

impl PublicParams {
    /// Wrap a list of leaf digests
    pub fn new(leaves: Vec<[u8; 32]>) -> Self {
        Self { leaves }
    }

    /// Load from a binary file of concatenated 32-byte digests
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        if bytes.is_empty() || bytes.len() % 32 != 0 {
            return Err(Error::Config(format!(
                "{} has length {}, not a positive multiple of 32",
                path.display(),
                bytes.len()
            )));
        }
        let leaves = bytes
            .chunks_exact(32)
            .map(|chunk| {
                let mut leaf = [0u8; 32];
                leaf.copy_from_slice(chunk);
                leaf
            })
            .collect();
        Ok(Self { leaves })
    }

    /// Save as concatenated digests
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.leaves.concat())?;
        Ok(())
    }

    /// Leaf digest for item `index`
    pub fn leaf(&self, index: u64) -> Option<&[u8; 32]> {
        self.leaves.get(usize::try_from(index).ok()?)
    }

    /// Number of items
    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    /// Whether there are no leaves
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Build the Merkle tree over the leaves
    pub fn tree(&self, ctx: &CryptoContext) -> Result<MerkleTree> {
        MerkleTree::build(ctx, self.leaves.clone())
    }

    /// Check the leaves reproduce `bulletin`
    pub fn verify_against(&self, ctx: &CryptoContext, bulletin: &Bulletin) -> Result<()> {
        if self.len() != bulletin.item_count {
            return Err(Error::Config(format!(
                "public params list {} items, bulletin {}",
                self.len(),
                bulletin.item_count
            )));
        }
        if self.tree(ctx)?.root() != bulletin.root {
            return Err(Error::Config(
                "public params do not reproduce the bulletin root".into(),
            ));
        }
        Ok(())
    }

    /// Proof that leaf `index` is committed by the bulletin
    pub fn proof(&self, ctx: &CryptoContext, index: u64) -> Result<MerkleProof> {
        self.tree(ctx)?.proof(index)
    }
}

/// Seller-side dataset: items, their commitment and the seller's signing key
#[derive(Debug, Clone)]
pub struct PublishedDataset {
    item_size: usize,
    data: Vec<u8>,
    public: PublicParams,
    bulletin: Bulletin,
    signing_key: SigningKey,
}

impl PublishedDataset {
    /// Build from a flat byte array of `item_size`-byte items under a fresh
    /// seller key
    pub fn from_items(ctx: &CryptoContext, item_size: usize, data: Vec<u8>) -> Result<Self> {
        Self::with_signing_key(ctx, SigningKey::random(&mut OsRng), item_size, data)
    }

    /// Build from a flat byte array, published under `signing_key`
    #[instrument(skip(ctx, signing_key, data), fields(len = data.len()))]
    pub fn with_signing_key(
        ctx: &CryptoContext,
        signing_key: SigningKey,
        item_size: usize,
        data: Vec<u8>,
    ) -> Result<Self> {
        if item_size == 0 || item_size > ctx.config().max_item_size {
            return Err(Error::Config(format!(
                "item size {} not in [1, {}]",
                item_size,
                ctx.config().max_item_size
            )));
        }
        if data.is_empty() || data.len() % item_size != 0 {
            return Err(Error::Config(format!(
                "dataset length {} is not a positive multiple of item size {}",
                data.len(),
                item_size
            )));
        }
        let item_size_u32 = u32::try_from(item_size)
            .map_err(|_| Error::Config(format!("item size {} too large", item_size)))?;

        let leaves: Vec<[u8; 32]> = data
            .chunks_exact(item_size)
            .enumerate()
            .map(|(i, item)| item_leaf(ctx, i as u64, item))
            .collect();
        let item_count = leaves.len() as u64;
        let root = MerkleTree::build(ctx, leaves.clone())?.root();

        debug!(item_count, root = hex::encode(root), "Dataset committed");

        Ok(Self {
            item_size,
            data,
            public: PublicParams::new(leaves),
            bulletin: Bulletin {
                item_count,
                item_size: item_size_u32,
                root,
                seller_key: encode_verifying_key(signing_key.verifying_key()),
            },
            signing_key,
        })
    }

    /// Open a published directory, re-deriving and checking the commitment
    pub fn open(ctx: &CryptoContext, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let bulletin = Bulletin::load(dir.join(BULLETIN_FILE))?;
        let items_path = dir.join(ITEMS_FILE);
        let data = std::fs::read(&items_path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", items_path.display(), e)))?;
        let signing_key = load_signing_key(&dir.join(KEY_FILE))?;

        let dataset = Self::with_signing_key(ctx, signing_key, bulletin.item_size as usize, data)?;
        if dataset.bulletin != bulletin {
            return Err(Error::Config(format!(
                "{} does not match the items in {}",
                BULLETIN_FILE,
                dir.display()
            )));
        }
        Ok(dataset)
    }

    /// Write the published directory
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(ITEMS_FILE), &self.data)?;
        let key = Zeroizing::new(hex::encode(self.signing_key.to_bytes()));
        std::fs::write(dir.join(KEY_FILE), key.as_bytes())?;
        self.bulletin.save(dir.join(BULLETIN_FILE))?;
        self.public.save(dir.join(PUBLIC_FILE))?;
        Ok(())
    }

    /// Item at `index`
    pub fn item(&self, index: u64) -> Result<&[u8]> {
        if index >= self.len() {
            return Err(Error::Data(format!(
                "item {} out of bounds ({} items)",
                index,
                self.len()
            )));
        }
        let start = index as usize * self.item_size;
        Ok(&self.data[start..start + self.item_size])
    }

    /// Number of items
    pub fn len(&self) -> u64 {
        self.bulletin.item_count
    }

    /// Whether the dataset is empty (never true once constructed)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one item
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Published commitment
    pub fn bulletin(&self) -> &Bulletin {
        &self.bulletin
    }

    /// Per-item leaf digests
    pub fn public_params(&self) -> &PublicParams {
        &self.public
    }

    /// Seller's long-term signing key
    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    #[cfg(test)]
    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let text = Zeroizing::new(
        std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?,
    );
    let bytes = Zeroizing::new(
        hex::decode(text.trim())
            .map_err(|e| Error::Config(format!("invalid key {}: {}", path.display(), e)))?,
    );
    SigningKey::from_slice(&bytes)
        .map_err(|e| Error::Config(format!("invalid key {}: {}", path.display(), e)))
}
