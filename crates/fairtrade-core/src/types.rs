//! Core types shared by seller and buyer sessions

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a participant identifier in bytes
pub const ID_LEN: usize = 32;

/// Seller identifier (e.g. hash of the seller's ledger address)
pub type SellerId = [u8; ID_LEN];

/// Buyer identifier (e.g. hash of the buyer's ledger address)
pub type BuyerId = [u8; ID_LEN];

/// Side of the trade a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Seller,
    Buyer,
}

impl Role {
    /// The counterpart role
    pub fn peer(self) -> Role {
        match self {
            Role::Seller => Role::Buyer,
            Role::Buyer => Role::Seller,
        }
    }
}

/// Contiguous interval `[start, start + count)` into the published item array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    /// First item index
    pub start: u64,
    /// Number of items, always positive
    pub count: u64,
}

impl Range {
    /// Create a validated range
    pub fn new(start: u64, count: u64) -> Result<Self> {
        let range = Self { start, count };
        range.validate()?;
        Ok(range)
    }

    /// Check the structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::Config(format!(
                "range starting at {} has zero count",
                self.start
            )));
        }
        if self.start.checked_add(self.count).is_none() {
            return Err(Error::Config(format!(
                "range {}+{} overflows",
                self.start, self.count
            )));
        }
        Ok(())
    }

    /// One past the last index
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    /// Whether `index` falls inside the range
    pub fn contains(&self, index: u64) -> bool {
        index >= self.start && index < self.end()
    }

    /// Iterate the item indices of the range
    pub fn indices(&self) -> std::ops::Range<u64> {
        self.start..self.end()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.count)
    }
}

impl FromStr for Range {
    type Err = Error;

    /// Parse `start:count`
    fn from_str(s: &str) -> Result<Self> {
        let (start, count) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("range '{}' is not start:count", s)))?;
        let start = start
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("range start '{}': {}", start, e)))?;
        let count = count
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("range count '{}': {}", count, e)))?;
        Range::new(start, count)
    }
}

/// Sort and merge overlapping or adjacent ranges.
///
/// The result is the canonical encoding of a set of item indices: two
/// selections covering the same items normalize to the same list, whatever
/// ranges were used to describe them.
pub fn normalize_ranges(ranges: &[Range]) -> Vec<Range> {
    let mut sorted = ranges.to_vec();
    sorted.sort();

    let mut merged: Vec<Range> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start <= last.end() => {
                let end = last.end().max(range.end());
                last.count = end - last.start;
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Total number of indices covered, counting overlaps multiple times
pub fn ranges_len(ranges: &[Range]) -> u64 {
    ranges.iter().map(|r| r.count).sum()
}

/// Whether the list is already in canonical form
pub fn is_normalized(ranges: &[Range]) -> bool {
    ranges.iter().all(|r| r.count > 0)
        && ranges.windows(2).all(|w| w[0].end() < w[1].start)
}

/// Position of `index` within the concatenation of normalized `ranges`
pub fn position_of(ranges: &[Range], index: u64) -> Option<u64> {
    let mut offset = 0;
    for range in ranges {
        if range.contains(index) {
            return Some(offset + (index - range.start));
        }
        offset += range.count;
    }
    None
}
