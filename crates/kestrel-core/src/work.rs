//! Proof-of-work arithmetic: compact targets and cumulative chain work.
//!
//! A compact target packs a 256-bit number into 32 bits as
//! `exponent(8) | sign(1) | mantissa(23)`, value `mantissa * 256^(exponent - 3)`.
//! The work a block proves is `2^256 / (target + 1)`; a chain's work sum is
//! the total over all of its blocks.

use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Expand a compact target. Negative targets (sign bit set with a nonzero
/// mantissa) carry no meaning for work and decode as zero.
pub fn compact_to_target(compact: u32) -> BigUint {
    let mantissa = compact & 0x007f_ffff;
    let negative = compact & 0x0080_0000 != 0;
    let exponent = compact >> 24;

    if negative && mantissa != 0 {
        return BigUint::zero();
    }
    if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3)) as usize
    }
}

/// Work represented by a block with the given compact target.
pub fn calc_work(bits: u32) -> BigUint {
    let target = compact_to_target(bits);
    if target.is_zero() {
        return BigUint::zero();
    }
    (BigUint::one() << 256usize) / (target + 1u32)
}
