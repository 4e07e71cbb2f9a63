//! IKNP OT extension with the KOS consistency check
//!
//! OT extension protocol from https://www.iacr.org/archive/crypto2003/27290145/27290145.pdf
//! producing random 1-of-2 OTs from the κ base OTs established during
//! negotiation.
//!
//! With `t_i = G(k_i^0)` the receiver sends `u_i = t_i ⊕ G(k_i^1) ⊕ r`. The
//! sender computes `q_i = G(k_i^{Δ_i}) ⊕ Δ_i·u_i`, so that row-wise
//! `Q_j = T_j ⊕ r_j·Δ`. Key `b` of OT `j` is `H(j ‖ Q_j ⊕ b·Δ)`; the receiver
//! can only compute `H(j ‖ T_j)`, the key matching its choice bit.
//!
//! A receiver using different choice vectors across columns would learn bits
//! of Δ. Following KOS (https://eprint.iacr.org/2015/546.pdf, Fig. 10) the
//! receiver extends [`CHECK_PADDING`] extra random OTs and sends
//! `x = Σ χ_j·r_j` and `t = Σ χ_j·T_j` over GF(2^128), with the `χ_j` drawn
//! from the columns (Fiat–Shamir). The sender accepts only if
//! `Σ χ_j·Q_j = t ⊕ x·Δ`.

use super::base_ot::{ReceiverKeys, SenderKeys};
use super::OtKey;
use crate::context::{KAPPA, KAPPA_BYTES};
use crate::{CryptoContext, Error, Result};
use rand::rngs::OsRng;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type Row = [u8; KAPPA_BYTES];

/// Random OTs appended to every extension to mask the choices in the check
pub const CHECK_PADDING: usize = KAPPA + 64;

/// Receiver's answer to the consistency challenge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationCheck {
    /// `Σ χ_j·r_j`
    pub x: [u8; KAPPA_BYTES],
    /// `Σ χ_j·T_j`
    pub t: [u8; KAPPA_BYTES],
}

fn bit(bytes: &[u8], j: usize) -> bool {
    (bytes[j / 8] >> (j % 8)) & 1 == 1
}

fn column_len(count: usize) -> usize {
    (count + 7) / 8
}

/// Column length in bytes for `count` OTs plus the check padding
pub fn extended_column_len(count: usize) -> usize {
    column_len(count + CHECK_PADDING)
}

/// Expand a base key into one column of `count` bits
fn prg(
    ctx: &CryptoContext,
    key: &OtKey,
    session: &[u8; 32],
    column: usize,
    count: usize,
) -> Vec<u8> {
    let seed = Zeroizing::new(ctx.hash(
        b"iknp-prg",
        &[key, session, &(column as u64).to_le_bytes()],
    ));
    let mut rng = ChaCha20Rng::from_seed(*seed);
    let mut out = vec![0u8; column_len(count)];
    rng.fill_bytes(&mut out);
    out
}

/// Transpose κ columns of `count` bits into `count` rows of κ bits
fn transpose(columns: &[Vec<u8>], count: usize) -> Vec<Row> {
    let mut rows = vec![[0u8; KAPPA_BYTES]; count];
    for (i, column) in columns.iter().enumerate() {
        for (j, row) in rows.iter_mut().enumerate() {
            if bit(column, j) {
                row[i / 8] |= 1 << (i % 8);
            }
        }
    }
    rows
}

fn row_key(ctx: &CryptoContext, session: &[u8; 32], j: usize, row: &Row) -> OtKey {
    let hash = ctx.hash(b"iknp-row", &[session, &(j as u64).to_le_bytes(), row]);
    let mut key = [0u8; 16];
    key.copy_from_slice(&hash[..16]);
    key
}

/// Multiplication in GF(2^128) modulo `x^128 + x^7 + x^2 + x + 1`
fn gf128_mul(a: u128, b: u128) -> u128 {
    let (mut a, mut b) = (a, b);
    let mut acc = 0u128;
    for _ in 0..128 {
        if b & 1 == 1 {
            acc ^= a;
        }
        b >>= 1;
        let carry = a >> 127;
        a <<= 1;
        if carry == 1 {
            a ^= 0x87;
        }
    }
    acc
}

/// Challenge generator seeded by the session and every column sent
fn challenges(ctx: &CryptoContext, session: &[u8; 32], columns: &[Vec<u8>]) -> ChaCha20Rng {
    let mut parts: Vec<&[u8]> = Vec::with_capacity(columns.len() + 1);
    parts.push(session);
    parts.extend(columns.iter().map(|c| c.as_slice()));
    ChaCha20Rng::from_seed(ctx.hash(b"iknp-check", &parts))
}

fn next_challenge(rng: &mut ChaCha20Rng) -> u128 {
    let mut chi = [0u8; 16];
    rng.fill_bytes(&mut chi);
    u128::from_le_bytes(chi)
}

/// Extension receiver (buyer side)
pub struct IknpReceiver<'a> {
    base: &'a SenderKeys,
    session: [u8; 32],
}

/// Columns and consistency proof sent to the extension sender
pub struct Extension {
    pub columns: Vec<Vec<u8>>,
    pub check: CorrelationCheck,
}

impl<'a> IknpReceiver<'a> {
    /// Bind the base keys to a per-transfer session tweak
    pub fn new(base: &'a SenderKeys, session: [u8; 32]) -> Self {
        Self { base, session }
    }

    /// Encode `choices`; returns the message to send and the chosen keys
    pub fn extend(
        &self,
        ctx: &CryptoContext,
        choices: &[bool],
    ) -> Result<(Extension, Zeroizing<Vec<OtKey>>)> {
        let count = choices.len();
        if count == 0 {
            return Err(Error::Validation("OT extension needs at least one choice".into()));
        }
        let total = count + CHECK_PADDING;

        let mut packed = Zeroizing::new(vec![0u8; column_len(total)]);
        for (j, &choice) in choices.iter().enumerate() {
            if choice {
                packed[j / 8] |= 1 << (j % 8);
            }
        }
        for j in count..total {
            if OsRng.next_u32() & 1 == 1 {
                packed[j / 8] |= 1 << (j % 8);
            }
        }

        let mut t_columns = Zeroizing::new(Vec::with_capacity(KAPPA));
        let mut u_columns = Vec::with_capacity(KAPPA);
        for i in 0..KAPPA {
            let t = prg(ctx, &self.base.zeros[i], &self.session, i, total);
            let g1 = prg(ctx, &self.base.ones[i], &self.session, i, total);
            let u: Vec<u8> = t
                .iter()
                .zip(&g1)
                .zip(packed.iter())
                .map(|((t, g), r)| t ^ g ^ r)
                .collect();
            t_columns.push(t);
            u_columns.push(u);
        }

        let rows = Zeroizing::new(transpose(&t_columns, total));

        let mut rng = challenges(ctx, &self.session, &u_columns);
        let (mut x, mut t) = (0u128, 0u128);
        for (j, row) in rows.iter().enumerate() {
            let chi = next_challenge(&mut rng);
            if bit(&packed, j) {
                x ^= chi;
            }
            t ^= gf128_mul(chi, u128::from_le_bytes(*row));
        }
        let check = CorrelationCheck {
            x: x.to_le_bytes(),
            t: t.to_le_bytes(),
        };

        let keys = rows[..count]
            .iter()
            .enumerate()
            .map(|(j, row)| row_key(ctx, &self.session, j, row))
            .collect();
        let extension = Extension {
            columns: u_columns,
            check,
        };
        Ok((extension, Zeroizing::new(keys)))
    }
}

/// Extension sender (seller side)
pub struct IknpSender<'a> {
    base: &'a ReceiverKeys,
    session: [u8; 32],
}

/// Both keys of every extended OT
pub struct ExtendedKeys {
    pub zeros: Zeroizing<Vec<OtKey>>,
    pub ones: Zeroizing<Vec<OtKey>>,
}

impl<'a> IknpSender<'a> {
    /// Bind the base keys to a per-transfer session tweak
    pub fn new(base: &'a ReceiverKeys, session: [u8; 32]) -> Self {
        Self { base, session }
    }

    /// Check `columns` has the shape of an extension of `count` OTs
    pub fn check_shape(&self, columns: &[Vec<u8>], count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::Protocol("OT extension with zero instances".into()));
        }
        if columns.len() != KAPPA {
            return Err(Error::Protocol(format!(
                "expected {} OT columns, got {}",
                KAPPA,
                columns.len()
            )));
        }
        let expected = extended_column_len(count);
        if let Some(bad) = columns.iter().position(|c| c.len() != expected) {
            return Err(Error::Protocol(format!(
                "OT column {} has {} bytes, expected {}",
                bad,
                columns[bad].len(),
                expected
            )));
        }
        Ok(())
    }

    /// Derive both keys for each of the `count` OTs encoded in `columns`
    ///
    /// Fails with a protocol error when the receiver's choices differ across
    /// columns.
    pub fn extend(
        &self,
        ctx: &CryptoContext,
        columns: &[Vec<u8>],
        check: &CorrelationCheck,
        count: usize,
    ) -> Result<ExtendedKeys> {
        self.check_shape(columns, count)?;
        let total = count + CHECK_PADDING;

        let mut q_columns = Zeroizing::new(Vec::with_capacity(KAPPA));
        for (i, u) in columns.iter().enumerate() {
            let mut q = prg(ctx, &self.base.keys[i], &self.session, i, total);
            if self.base.delta_bit(i) {
                for (q, u) in q.iter_mut().zip(u) {
                    *q ^= u;
                }
            }
            q_columns.push(q);
        }

        let rows = Zeroizing::new(transpose(&q_columns, total));

        let mut rng = challenges(ctx, &self.session, columns);
        let mut q = 0u128;
        for row in rows.iter() {
            q ^= gf128_mul(next_challenge(&mut rng), u128::from_le_bytes(*row));
        }
        let delta = u128::from_le_bytes(self.base.delta);
        let expected = u128::from_le_bytes(check.t)
            ^ gf128_mul(u128::from_le_bytes(check.x), delta);
        if !bool::from(q.to_le_bytes()[..].ct_eq(&expected.to_le_bytes()[..])) {
            return Err(Error::Protocol("OT correlation check failed".into()));
        }

        let mut zeros = Vec::with_capacity(count);
        let mut ones = Vec::with_capacity(count);
        for (j, row) in rows[..count].iter().enumerate() {
            let mut flipped = *row;
            for (f, d) in flipped.iter_mut().zip(&self.base.delta) {
                *f ^= d;
            }
            zeros.push(row_key(ctx, &self.session, j, row));
            ones.push(row_key(ctx, &self.session, j, &flipped));
        }

        Ok(ExtendedKeys {
            zeros: Zeroizing::new(zeros),
            ones: Zeroizing::new(ones),
        })
    }
}
