//! Integer encodings shared by the stream framing and the portable codec.
//!
//! - fixed: zig-zag then big-endian 8 bytes (time range header)
//! - varint: zig-zag then LEB128 for `i64`, plain LEB128 for `u64`
//! - bytes: uvarint length followed by the payload
//! - int64 arrays: one of six [`MarshalType`]s, lossless

use crate::error::CodecError;
use bytes::{Buf, BufMut};

/// How an array of `i64` is laid out inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalType {
    ZstdNearestDelta2 = 1,
    DeltaConst = 2,
    Const = 3,
    ZstdNearestDelta = 4,
    NearestDelta2 = 5,
    NearestDelta = 6,
}

impl MarshalType {
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(MarshalType::ZstdNearestDelta2),
            2 => Ok(MarshalType::DeltaConst),
            3 => Ok(MarshalType::Const),
            4 => Ok(MarshalType::ZstdNearestDelta),
            5 => Ok(MarshalType::NearestDelta2),
            6 => Ok(MarshalType::NearestDelta),
            v => Err(CodecError::UnknownMarshalType(v)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Arrays at least this long are tried with zstd.
const MIN_COMPRESSIBLE_ITEMS: usize = 128;

#[inline]
pub fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Appends `v` as zig-zag big-endian 8 bytes.
pub fn put_fixed_i64(dst: &mut impl BufMut, v: i64) {
    dst.put_u64(zigzag_encode(v));
}

/// Reads an `i64` written by [`put_fixed_i64`].
pub fn get_fixed_i64(src: &mut &[u8], what: &'static str) -> Result<i64, CodecError> {
    if src.len() < 8 {
        return Err(CodecError::Truncated(what));
    }
    Ok(zigzag_decode(src.get_u64()))
}

pub fn put_var_u64(dst: &mut impl BufMut, mut v: u64) {
    while v >= 0x80 {
        dst.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    dst.put_u8(v as u8);
}

pub fn put_var_i64(dst: &mut impl BufMut, v: i64) {
    put_var_u64(dst, zigzag_encode(v));
}

/// Decodes a LEB128 varint, rejecting encodings that overflow 64 bits.
pub fn get_var_u64(src: &mut &[u8], what: &'static str) -> Result<u64, CodecError> {
    let mut result = 0u64;
    let mut shift = 0u32;

    loop {
        if src.is_empty() {
            return Err(CodecError::Truncated(what));
        }
        let byte = src[0];
        src.advance(1);

        // The tenth byte may only carry the top bit of the value.
        if shift == 63 && byte > 1 {
            return Err(CodecError::BadVarint(what));
        }
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::BadVarint(what));
        }
    }
}

pub fn get_var_i64(src: &mut &[u8], what: &'static str) -> Result<i64, CodecError> {
    get_var_u64(src, what).map(zigzag_decode)
}

pub fn put_bytes(dst: &mut impl BufMut, b: &[u8]) {
    put_var_u64(dst, b.len() as u64);
    dst.put_slice(b);
}

/// Reads a length-prefixed byte string, borrowing it from `src`.
pub fn get_bytes<'a>(src: &mut &'a [u8], what: &'static str) -> Result<&'a [u8], CodecError> {
    let len = get_var_u64(src, what)?;
    if len > src.len() as u64 {
        return Err(CodecError::Truncated(what));
    }
    let (head, tail) = src.split_at(len as usize);
    *src = tail;
    Ok(head)
}

/// Appends `items_count` values decoded from `src` to `dst`.
pub fn unmarshal_i64_array(
    dst: &mut Vec<i64>,
    src: &[u8],
    mt: MarshalType,
    first_value: i64,
    items_count: usize,
) -> Result<(), CodecError> {
    match mt {
        MarshalType::ZstdNearestDelta => {
            let plain = decompress(src, items_count)?;
            unmarshal_nearest_delta(dst, &plain, first_value, items_count)
        }
        MarshalType::ZstdNearestDelta2 => {
            let plain = decompress(src, items_count)?;
            unmarshal_nearest_delta2(dst, &plain, first_value, items_count)
        }
        MarshalType::NearestDelta => unmarshal_nearest_delta(dst, src, first_value, items_count),
        MarshalType::NearestDelta2 => unmarshal_nearest_delta2(dst, src, first_value, items_count),
        MarshalType::Const => {
            if !src.is_empty() {
                return Err(CodecError::TrailingBytes(src.len()));
            }
            dst.resize(dst.len() + items_count, first_value);
            Ok(())
        }
        MarshalType::DeltaConst => {
            let mut src = src;
            let delta = get_var_i64(&mut src, "delta const")?;
            if !src.is_empty() {
                return Err(CodecError::TrailingBytes(src.len()));
            }
            dst.reserve(items_count);
            let mut v = first_value;
            for _ in 0..items_count {
                dst.push(v);
                v = v.wrapping_add(delta);
            }
            Ok(())
        }
    }
}

/// Decompresses a delta payload of `items_count` values.
///
/// Every delta takes at most 10 varint bytes, which bounds the output.
fn decompress(src: &[u8], items_count: usize) -> Result<Vec<u8>, CodecError> {
    let capacity = items_count.saturating_mul(10);
    zstd::bulk::decompress(src, capacity).map_err(|e| CodecError::Decompress(e.to_string()))
}

fn unmarshal_nearest_delta(
    dst: &mut Vec<i64>,
    src: &[u8],
    first_value: i64,
    items_count: usize,
) -> Result<(), CodecError> {
    if items_count == 0 {
        return Err(CodecError::TooFewItems {
            mt: MarshalType::NearestDelta,
            min: 1,
            got: 0,
        });
    }
    let mut src = src;
    dst.reserve(items_count);
    let mut v = first_value;
    dst.push(v);
    for _ in 1..items_count {
        let d = get_var_i64(&mut src, "nearest delta")?;
        v = v.wrapping_add(d);
        dst.push(v);
    }
    if !src.is_empty() {
        return Err(CodecError::TrailingBytes(src.len()));
    }
    Ok(())
}

fn unmarshal_nearest_delta2(
    dst: &mut Vec<i64>,
    src: &[u8],
    first_value: i64,
    items_count: usize,
) -> Result<(), CodecError> {
    if items_count < 2 {
        return Err(CodecError::TooFewItems {
            mt: MarshalType::NearestDelta2,
            min: 2,
            got: items_count,
        });
    }
    let mut src = src;
    dst.reserve(items_count);
    let mut v = first_value;
    let mut d1 = get_var_i64(&mut src, "nearest delta2")?;
    dst.push(v);
    v = v.wrapping_add(d1);
    dst.push(v);
    for _ in 2..items_count {
        let d2 = get_var_i64(&mut src, "nearest delta2")?;
        d1 = d1.wrapping_add(d2);
        v = v.wrapping_add(d1);
        dst.push(v);
    }
    if !src.is_empty() {
        return Err(CodecError::TrailingBytes(src.len()));
    }
    Ok(())
}

/// Appends the encoding of `a` to `dst`.
///
/// Returns the chosen marshal type and the first value, which the caller
/// stores in the block header. `a` must not be empty.
pub fn marshal_i64_array(dst: &mut Vec<u8>, a: &[i64]) -> Result<(MarshalType, i64), CodecError> {
    let first = *a.first().ok_or(CodecError::EmptyBlock)?;

    if a.iter().all(|&v| v == first) {
        return Ok((MarshalType::Const, first));
    }
    if is_delta_const(a) {
        put_var_i64(dst, a[1].wrapping_sub(a[0]));
        return Ok((MarshalType::DeltaConst, first));
    }

    let start = dst.len();
    let plain_type = if is_gauge(a) {
        marshal_nearest_delta(dst, a);
        MarshalType::NearestDelta
    } else {
        marshal_nearest_delta2(dst, a);
        MarshalType::NearestDelta2
    };
    if a.len() < MIN_COMPRESSIBLE_ITEMS {
        return Ok((plain_type, first));
    }

    let plain_len = dst.len() - start;
    let compressed = match zstd::encode_all(&dst[start..], compress_level(a.len())) {
        Ok(c) => c,
        Err(_) => return Ok((plain_type, first)),
    };
    // Keep the plain form unless zstd saves at least 10%.
    if compressed.len() as f64 >= 0.9 * plain_len as f64 {
        return Ok((plain_type, first));
    }
    dst.truncate(start);
    dst.extend_from_slice(&compressed);
    let mt = match plain_type {
        MarshalType::NearestDelta => MarshalType::ZstdNearestDelta,
        _ => MarshalType::ZstdNearestDelta2,
    };
    Ok((mt, first))
}

fn marshal_nearest_delta(dst: &mut Vec<u8>, a: &[i64]) {
    for w in a.windows(2) {
        put_var_i64(dst, w[1].wrapping_sub(w[0]));
    }
}

fn marshal_nearest_delta2(dst: &mut Vec<u8>, a: &[i64]) {
    let mut d1 = a[1].wrapping_sub(a[0]);
    put_var_i64(dst, d1);
    for w in a[1..].windows(2) {
        let d = w[1].wrapping_sub(w[0]);
        put_var_i64(dst, d.wrapping_sub(d1));
        d1 = d;
    }
}

fn is_delta_const(a: &[i64]) -> bool {
    if a.len() < 2 {
        return false;
    }
    let d = a[1].wrapping_sub(a[0]);
    a.windows(2).all(|w| w[1].wrapping_sub(w[0]) == d)
}

/// Counters only grow, apart from a few resets to a small value.
fn is_gauge(a: &[i64]) -> bool {
    if a.len() < 2 {
        return false;
    }
    let mut prev = a[0];
    if prev < 0 {
        return true;
    }
    let mut resets = 0;
    for &v in &a[1..] {
        if v < prev {
            if v < 0 || v > (prev >> 3) {
                return true;
            }
            resets += 1;
        }
        prev = v;
    }
    resets > 2
}

fn compress_level(items_count: usize) -> i32 {
    match items_count {
        n if n <= 1 << 6 => 1,
        n if n <= 1 << 8 => 2,
        n if n <= 1 << 10 => 3,
        n if n <= 1 << 12 => 4,
        _ => 5,
    }
}
