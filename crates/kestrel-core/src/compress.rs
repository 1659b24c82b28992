//! Domain-specific compression for persisted outputs.
//!
//! Two codecs live here:
//!
//! - **VLQ**: a base-128 variable-length integer, most significant group
//!   first, where every continuation group is stored minus one. The encoding
//!   is canonical and order-preserving: for all `a < b`,
//!   `vlq(a) < vlq(b)` byte-wise, and smaller values use fewer bytes.
//! - **Compressed txout**: `vlq(compress_amount(amount)) || compressed script`.
//!   Amounts drop trailing decimal zeros; pay-to-pubkey-hash,
//!   pay-to-script-hash and pay-to-pubkey scripts shrink to 21 or 33 bytes;
//!   every other script is stored as `vlq(len + 6) || script`.

use secp256k1::PublicKey;

use crate::constants::MAX_MONEY;
use crate::error::ChainError;

/// Largest VLQ encoding of a `u32`, the widest integer that keys use.
pub const MAX_U32_VLQ_SIZE: usize = 5;

/// Number of script-size codes reserved for the special script shapes.
const NUM_SPECIAL_SCRIPTS: u64 = 6;

const CST_PAY_TO_PUBKEY_HASH: u64 = 0;
const CST_PAY_TO_SCRIPT_HASH: u64 = 1;
const CST_PAY_TO_PUBKEY_COMP2: u64 = 2;
const CST_PAY_TO_PUBKEY_COMP3: u64 = 3;
const CST_PAY_TO_PUBKEY_UNCOMP4: u64 = 4;
const CST_PAY_TO_PUBKEY_UNCOMP5: u64 = 5;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_DATA_20: u8 = 0x14;
const OP_DATA_33: u8 = 0x21;
const OP_DATA_65: u8 = 0x41;

// --- VLQ ---

/// Number of bytes `n` occupies once VLQ-encoded.
pub fn serialize_size_vlq(mut n: u64) -> usize {
    let mut size = 1;
    while n > 0x7f {
        size += 1;
        n = (n >> 7) - 1;
    }
    size
}

/// Write `n` into the front of `target`, returning the bytes written.
///
/// # Panics
///
/// If `target` is shorter than [`serialize_size_vlq`]`(n)`.
pub fn put_vlq(target: &mut [u8], mut n: u64) -> usize {
    let mut offset = 0;
    loop {
        let high_bit = if offset == 0 { 0x00 } else { 0x80 };
        target[offset] = (n & 0x7f) as u8 | high_bit;
        if n <= 0x7f {
            break;
        }
        n = (n >> 7) - 1;
        offset += 1;
    }
    target[..=offset].reverse();
    offset + 1
}

/// Append the VLQ encoding of `n` to `buf`.
pub fn append_vlq(buf: &mut Vec<u8>, n: u64) {
    let start = buf.len();
    buf.resize(start + serialize_size_vlq(n), 0);
    put_vlq(&mut buf[start..], n);
}

/// Decode a VLQ from the front of `serialized`, returning the value and the
/// number of bytes consumed.
pub fn deserialize_vlq(serialized: &[u8]) -> Result<(u64, usize), ChainError> {
    let mut n: u64 = 0;
    for (i, &byte) in serialized.iter().enumerate() {
        if n > (u64::MAX >> 7) {
            return Err(ChainError::Deserialize("vlq overflows 64 bits".into()));
        }
        n = (n << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((n, i + 1));
        }
        n = n
            .checked_add(1)
            .ok_or_else(|| ChainError::Deserialize("vlq overflows 64 bits".into()))?;
    }
    Err(ChainError::Deserialize("unexpected end of data in vlq".into()))
}

// --- Amounts ---

/// Compress an amount by factoring out trailing decimal zeros.
///
/// Defined for amounts up to [`MAX_MONEY`]; larger amounts are an
/// [`ChainError::Assert`] since no valid output carries one.
pub fn compress_amount(amount: u64) -> Result<u64, ChainError> {
    if amount > MAX_MONEY as u64 {
        return Err(ChainError::Assert(format!(
            "amount {amount} exceeds the maximum of {MAX_MONEY}"
        )));
    }
    if amount == 0 {
        return Ok(0);
    }
    let mut amount = amount;
    let mut exponent = 0u64;
    while amount % 10 == 0 && exponent < 9 {
        amount /= 10;
        exponent += 1;
    }
    if exponent < 9 {
        let last_digit = amount % 10;
        amount /= 10;
        return Ok(1 + 10 * (9 * amount + last_digit - 1) + exponent);
    }
    Ok(10 + 10 * (amount - 1))
}

/// Inverse of [`compress_amount`].
pub fn decompress_amount(amount: u64) -> Result<u64, ChainError> {
    if amount == 0 {
        return Ok(0);
    }
    let overflow = || ChainError::Deserialize(format!("compressed amount {amount} overflows"));
    let mut x = amount - 1;
    let exponent = x % 10;
    x /= 10;
    let mut n = if exponent < 9 {
        let last_digit = x % 9 + 1;
        x /= 9;
        x.checked_mul(10)
            .and_then(|v| v.checked_add(last_digit))
            .ok_or_else(overflow)?
    } else {
        x + 1
    };
    for _ in 0..exponent {
        n = n.checked_mul(10).ok_or_else(overflow)?;
    }
    Ok(n)
}

// --- Scripts ---

fn is_pubkey_hash(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == OP_DATA_20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_script_hash(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == OP_DATA_20 && script[22] == OP_EQUAL
}

/// Returns the serialized public key when `script` is a pay-to-pubkey
/// script that can be compressed losslessly.
fn pubkey_of(script: &[u8]) -> Option<&[u8]> {
    if script.len() == 35
        && script[0] == OP_DATA_33
        && script[34] == OP_CHECKSIG
        && matches!(script[1], 0x02 | 0x03)
    {
        return Some(&script[1..34]);
    }
    // Uncompressed keys are rebuilt from x alone, which only works for
    // points actually on the curve.
    if script.len() == 67 && script[0] == OP_DATA_65 && script[66] == OP_CHECKSIG && script[1] == 0x04 {
        let key = &script[1..66];
        if PublicKey::from_slice(key).is_ok() {
            return Some(key);
        }
    }
    None
}

/// Number of bytes `script` occupies once compressed.
pub fn compressed_script_size(script: &[u8]) -> usize {
    if is_pubkey_hash(script) || is_script_hash(script) {
        return 21;
    }
    if pubkey_of(script).is_some() {
        return 33;
    }
    serialize_size_vlq(script.len() as u64 + NUM_SPECIAL_SCRIPTS) + script.len()
}

/// Append the compressed form of `script` to `buf`.
pub fn put_compressed_script(buf: &mut Vec<u8>, script: &[u8]) {
    if is_pubkey_hash(script) {
        buf.push(CST_PAY_TO_PUBKEY_HASH as u8);
        buf.extend_from_slice(&script[3..23]);
        return;
    }
    if is_script_hash(script) {
        buf.push(CST_PAY_TO_SCRIPT_HASH as u8);
        buf.extend_from_slice(&script[2..22]);
        return;
    }
    if let Some(key) = pubkey_of(script) {
        match key[0] {
            0x02 | 0x03 => buf.push(key[0]),
            // Uncompressed: keep the parity of y in the code.
            _ => buf.push((key[64] & 0x01) | CST_PAY_TO_PUBKEY_UNCOMP4 as u8),
        }
        buf.extend_from_slice(&key[1..33]);
        return;
    }
    append_vlq(buf, script.len() as u64 + NUM_SPECIAL_SCRIPTS);
    buf.extend_from_slice(script);
}

/// Total size (code included) of the compressed script at the front of
/// `serialized`.
pub fn decode_compressed_script_size(serialized: &[u8]) -> Result<usize, ChainError> {
    let (code, read) = deserialize_vlq(serialized)?;
    match code {
        CST_PAY_TO_PUBKEY_HASH | CST_PAY_TO_SCRIPT_HASH => Ok(21),
        CST_PAY_TO_PUBKEY_COMP2..=CST_PAY_TO_PUBKEY_UNCOMP5 => Ok(33),
        _ => usize::try_from(code - NUM_SPECIAL_SCRIPTS)
            .ok()
            .and_then(|len| len.checked_add(read))
            .ok_or_else(|| ChainError::Deserialize(format!("script size code {code} too large"))),
    }
}

/// Rebuild the full script from its compressed form. `compressed` must
/// hold at least [`decode_compressed_script_size`] bytes.
pub fn decompress_script(compressed: &[u8]) -> Result<Vec<u8>, ChainError> {
    let (code, read) = deserialize_vlq(compressed)?;
    let body = &compressed[read..];
    let take = |len: usize| {
        body.get(..len)
            .ok_or_else(|| ChainError::Deserialize("unexpected end of data in script".into()))
    };

    let script = match code {
        CST_PAY_TO_PUBKEY_HASH => {
            let mut script = Vec::with_capacity(25);
            script.extend_from_slice(&[OP_DUP, OP_HASH160, OP_DATA_20]);
            script.extend_from_slice(take(20)?);
            script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            script
        }
        CST_PAY_TO_SCRIPT_HASH => {
            let mut script = Vec::with_capacity(23);
            script.extend_from_slice(&[OP_HASH160, OP_DATA_20]);
            script.extend_from_slice(take(20)?);
            script.push(OP_EQUAL);
            script
        }
        CST_PAY_TO_PUBKEY_COMP2 | CST_PAY_TO_PUBKEY_COMP3 => {
            let mut script = Vec::with_capacity(35);
            script.extend_from_slice(&[OP_DATA_33, code as u8]);
            script.extend_from_slice(take(32)?);
            script.push(OP_CHECKSIG);
            script
        }
        CST_PAY_TO_PUBKEY_UNCOMP4 | CST_PAY_TO_PUBKEY_UNCOMP5 => {
            let mut compressed_key = [0u8; 33];
            compressed_key[0] = (code - 2) as u8;
            compressed_key[1..].copy_from_slice(take(32)?);
            let key = PublicKey::from_slice(&compressed_key).map_err(|e| {
                ChainError::Deserialize(format!("invalid compressed public key: {e}"))
            })?;
            let mut script = Vec::with_capacity(67);
            script.push(OP_DATA_65);
            script.extend_from_slice(&key.serialize_uncompressed());
            script.push(OP_CHECKSIG);
            script
        }
        _ => {
            let len = usize::try_from(code - NUM_SPECIAL_SCRIPTS)
                .map_err(|_| ChainError::Deserialize(format!("script size code {code} too large")))?;
            take(len)?.to_vec()
        }
    };
    Ok(script)
}

// --- Outputs ---

fn compress_output_amount(amount: i64) -> Result<u64, ChainError> {
    let amount = u64::try_from(amount)
        .map_err(|_| ChainError::Assert(format!("negative output amount {amount}")))?;
    compress_amount(amount)
}

/// Size of [`put_compressed_txout`]'s output.
pub fn compressed_txout_size(amount: i64, script: &[u8]) -> Result<usize, ChainError> {
    Ok(serialize_size_vlq(compress_output_amount(amount)?) + compressed_script_size(script))
}

/// Append `vlq(compressed amount) || compressed script` to `buf`. Nothing is
/// written when the amount is outside `0..=MAX_MONEY`.
pub fn put_compressed_txout(buf: &mut Vec<u8>, amount: i64, script: &[u8]) -> Result<(), ChainError> {
    append_vlq(buf, compress_output_amount(amount)?);
    put_compressed_script(buf, script);
    Ok(())
}

/// Decode a compressed output from the front of `serialized`, returning
/// `(amount, script, bytes consumed)`.
pub fn decode_compressed_txout(serialized: &[u8]) -> Result<(i64, Vec<u8>, usize), ChainError> {
    let (compressed_amount, mut offset) = deserialize_vlq(serialized)?;
    if offset >= serialized.len() {
        return Err(ChainError::Deserialize(
            "unexpected end of data after compressed amount".into(),
        ));
    }

    let script_size = decode_compressed_script_size(&serialized[offset..])?;
    if serialized.len() - offset < script_size {
        return Err(ChainError::Deserialize(
            "unexpected end of data after script size".into(),
        ));
    }

    let amount = decompress_amount(compressed_amount)?;
    if amount > MAX_MONEY as u64 {
        return Err(ChainError::Deserialize(format!(
            "compressed amount {compressed_amount} decodes to {amount}, above the maximum"
        )));
    }
    let script = decompress_script(&serialized[offset..offset + script_size])?;
    offset += script_size;
    Ok((amount as i64, script, offset))
}
