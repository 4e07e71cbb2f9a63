//! Binary SHA-256 Merkle tree
//!
//! Used both for the bulletin commitment over published items and for the
//! block commitment a receipt signs over. An odd node at any level is paired
//! with itself.

use crate::{CryptoContext, Error, Result};
use serde::{Deserialize, Serialize};

fn parent_hash(ctx: &CryptoContext, left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    ctx.hash(b"merkle-node", &[left, right])
}

/// Number of sibling hashes on a path for a tree with `leaves` leaves
pub fn depth(leaves: u64) -> usize {
    let mut depth = 0;
    let mut width = leaves;
    while width > 1 {
        width = (width + 1) / 2;
        depth += 1;
    }
    depth
}

/// Authentication path for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Leaf position
    pub index: u64,
    /// Sibling hashes from the leaf level upwards
    pub siblings: Vec<[u8; 32]>,
}

impl MerkleProof {
    /// Verify `leaf` sits at `self.index` in a tree of `leaf_count` leaves with `root`
    pub fn verify(
        &self,
        ctx: &CryptoContext,
        leaf: &[u8; 32],
        leaf_count: u64,
        root: &[u8; 32],
    ) -> Result<()> {
        if self.index >= leaf_count {
            return Err(Error::Validation(format!(
                "leaf index {} not in [0, {})",
                self.index, leaf_count
            )));
        }
        if self.siblings.len() != depth(leaf_count) {
            return Err(Error::Validation(format!(
                "path length {} does not match depth {}",
                self.siblings.len(),
                depth(leaf_count)
            )));
        }

        let mut acc = *leaf;
        let mut idx = self.index;
        for sibling in &self.siblings {
            acc = if idx & 1 == 0 {
                parent_hash(ctx, &acc, sibling)
            } else {
                parent_hash(ctx, sibling, &acc)
            };
            idx >>= 1;
        }

        if &acc != root {
            return Err(Error::Validation("merkle path mismatch".into()));
        }
        Ok(())
    }
}

/// Fully materialized tree
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Build a tree over already-hashed leaves
    pub fn build(ctx: &CryptoContext, leaves: Vec<[u8; 32]>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::Config("merkle tree needs at least one leaf".into()));
        }

        let mut levels = vec![leaves];
        while levels[levels.len() - 1].len() > 1 {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    parent_hash(ctx, &pair[0], right)
                })
                .collect();
            levels.push(next);
        }
        Ok(Self { levels })
    }

    /// Root hash
    pub fn root(&self) -> [u8; 32] {
        self.levels[self.levels.len() - 1][0]
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> u64 {
        self.levels[0].len() as u64
    }

    /// Leaf hashes
    pub fn leaves(&self) -> &[[u8; 32]] {
        &self.levels[0]
    }

    /// Authentication path for leaf `index`
    pub fn proof(&self, index: u64) -> Result<MerkleProof> {
        if index >= self.leaf_count() {
            return Err(Error::Data(format!(
                "leaf {} out of bounds ({} leaves)",
                index,
                self.leaf_count()
            )));
        }

        let mut siblings = Vec::with_capacity(self.levels.len() - 1);
        let mut idx = index as usize;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            siblings.push(*level.get(sibling).unwrap_or(&level[idx]));
            idx >>= 1;
        }
        Ok(MerkleProof { index, siblings })
    }
}
