//! 1-of-N selection from extended 1-of-2 OTs (Naor–Pinkas)
//!
//! Query `q` picks position `σ_q` among `N` positions using `L = ⌈log₂ N⌉`
//! consecutive extended OTs whose choice bits spell out `σ_q`. The pad for
//! position `j` hashes the OT keys selected by the bits of `j`; only the pad
//! at `σ_q` is computable by the receiver.

use super::OtKey;
use crate::primitives::WrapKey;
use crate::CryptoContext;

#[cfg(feature = "multi-thread")]
use rayon::prelude::*;

/// Number of extended OTs per query for `n` positions
pub fn selection_bits(n: u64) -> usize {
    let mut bits = 0;
    while bits < 64 && (1u64 << bits) < n {
        bits += 1;
    }
    bits.max(1)
}

/// Choice bits for `position`, least significant first
pub fn choice_bits(position: u64, bits: usize) -> impl Iterator<Item = bool> {
    (0..bits).map(move |l| (position >> l) & 1 == 1)
}

fn pad<'k>(
    ctx: &CryptoContext,
    query: u64,
    position: u64,
    keys: impl Iterator<Item = &'k OtKey>,
) -> OtKey {
    let query = query.to_le_bytes();
    let position = position.to_le_bytes();
    let mut parts: Vec<&[u8]> = vec![query.as_slice(), position.as_slice()];
    parts.extend(keys.map(|k| k.as_slice()));

    let hash = ctx.hash(b"selection-pad", &parts);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[..16]);
    out
}

/// Receiver's pad for its chosen position, from its `bits` chosen keys
pub fn receiver_pad(ctx: &CryptoContext, query: u64, position: u64, keys: &[OtKey]) -> OtKey {
    pad(ctx, query, position, keys.iter())
}

/// Sender's pad for an arbitrary position of `query`
pub fn sender_pad(
    ctx: &CryptoContext,
    query: u64,
    position: u64,
    zeros: &[OtKey],
    ones: &[OtKey],
) -> OtKey {
    let keys = choice_bits(position, zeros.len())
        .zip(zeros.iter().zip(ones))
        .map(|(b, (k0, k1))| if b { k1 } else { k0 });
    pad(ctx, query, position, keys)
}

/// Mask every wrap key once per query.
///
/// Returns `queries × wraps.len()` entries, row-major by query. `zeros` and
/// `ones` hold `queries × bits` extended OT keys.
pub fn mask_wraps(
    ctx: &CryptoContext,
    zeros: &[OtKey],
    ones: &[OtKey],
    queries: usize,
    bits: usize,
    wraps: &[WrapKey],
) -> Vec<WrapKey> {
    let row = |q: usize| -> Vec<WrapKey> {
        let z = &zeros[q * bits..(q + 1) * bits];
        let o = &ones[q * bits..(q + 1) * bits];
        wraps
            .iter()
            .enumerate()
            .map(|(j, wrap)| {
                let pad = sender_pad(ctx, q as u64, j as u64, z, o);
                xor16(wrap, &pad)
            })
            .collect()
    };

    #[cfg(feature = "multi-thread")]
    let rows: Vec<Vec<WrapKey>> = (0..queries).into_par_iter().map(row).collect();
    #[cfg(not(feature = "multi-thread"))]
    let rows: Vec<Vec<WrapKey>> = (0..queries).map(row).collect();

    rows.concat()
}

/// XOR two 16-byte blocks
pub fn xor16(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}
