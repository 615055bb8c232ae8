//! Decoded blocks and the portable block codec.
//!
//! Portable block layout:
//!
//! ```text
//! varint  min_timestamp       first timestamp
//! varint  first_value         first value mantissa
//! uvarint rows_count          1..=MAX_ROWS_COUNT
//! varint  scale               decimal exponent, i16 range
//! u8      timestamps_marshal_type
//! u8      values_marshal_type
//! bytes   timestamps_data     uvarint length + payload
//! bytes   values_data         uvarint length + payload
//! ```
//!
//! Values are decimal mantissas: `value = mantissa * 10^scale`. Three
//! mantissas are reserved for `+Inf`, `-Inf` and the staleness marker.

use crate::encoding::{
    get_bytes, get_var_i64, get_var_u64, marshal_i64_array, put_bytes, put_var_i64, put_var_u64,
    unmarshal_i64_array, MarshalType,
};
use crate::error::CodecError;
use crate::metric_name::MetricName;
use bytes::Buf;
use serde::{Deserialize, Serialize};

/// Rows a storage block holds at most.
pub const MAX_ROWS_PER_BLOCK: usize = 8 * 1024;

/// Upper bound accepted for `rows_count` in a portable block.
pub const MAX_ROWS_COUNT: usize = 2 * MAX_ROWS_PER_BLOCK;

/// Upper bound for each of the timestamps and values payloads.
pub const MAX_DATA_SIZE: usize = 2 * 8 * MAX_ROWS_PER_BLOCK;

const V_INF_POS: i64 = i64::MAX;
const V_INF_NEG: i64 = i64::MIN;
const V_STALE_NAN: i64 = i64::MAX - 1;
const V_MAX: i64 = i64::MAX - 2;
const V_MIN: i64 = i64::MIN + 1;

/// Bit pattern of the NaN that marks a series as stale.
pub const STALE_NAN_BITS: u64 = 0x7ff0000000000002;

pub fn is_stale_nan(v: f64) -> bool {
    v.to_bits() == STALE_NAN_BITS
}

/// Inclusive range of millisecond timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl TimeRange {
    pub fn new(min_timestamp: i64, max_timestamp: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    /// Range that keeps every row.
    pub fn unbounded() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    #[inline]
    pub fn contains(&self, ts: i64) -> bool {
        self.min_timestamp <= ts && ts <= self.max_timestamp
    }
}

/// A decoded block handed to the parse callback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub metric_name: MetricName,
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl Block {
    pub fn rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn reset(&mut self) {
        self.metric_name.reset();
        self.timestamps.clear();
        self.values.clear();
    }
}

/// Decodes the two payloads of a native record.
///
/// Implementations are shared by all workers. Per-worker state lives in
/// `Scratch`, which is pooled with the work unit.
pub trait NativeCodec: Send + Sync + 'static {
    type Scratch: Default + Send + 'static;

    fn unmarshal_metric_name(&self, src: &[u8], dst: &mut MetricName) -> Result<(), CodecError>;

    /// Decodes a block and appends the rows inside `tr`.
    fn append_rows_in_range(
        &self,
        src: &[u8],
        tr: TimeRange,
        scratch: &mut Self::Scratch,
        timestamps: &mut Vec<i64>,
        values: &mut Vec<f64>,
    ) -> Result<(), CodecError>;

    /// Prepares `scratch` for reuse by another record.
    fn reset_scratch(&self, scratch: &mut Self::Scratch) {
        *scratch = Self::Scratch::default();
    }
}

/// Codec for blocks written by [`PortableBlock::marshal`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableCodec;

impl NativeCodec for PortableCodec {
    type Scratch = PortableBlock;

    fn unmarshal_metric_name(&self, src: &[u8], dst: &mut MetricName) -> Result<(), CodecError> {
        dst.unmarshal(src)
    }

    fn append_rows_in_range(
        &self,
        src: &[u8],
        tr: TimeRange,
        scratch: &mut PortableBlock,
        timestamps: &mut Vec<i64>,
        values: &mut Vec<f64>,
    ) -> Result<(), CodecError> {
        let tail = scratch.unmarshal(src)?;
        if !tail.is_empty() {
            return Err(CodecError::TrailingBytes(tail.len()));
        }
        scratch.append_rows_in_range(tr, timestamps, values);
        Ok(())
    }

    fn reset_scratch(&self, scratch: &mut PortableBlock) {
        scratch.reset();
    }
}

/// Timestamps and value mantissas of one series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortableBlock {
    pub timestamps: Vec<i64>,
    pub values: Vec<i64>,
    pub scale: i16,
}

impl PortableBlock {
    pub fn new(timestamps: Vec<i64>, values: Vec<i64>, scale: i16) -> Self {
        Self {
            timestamps,
            values,
            scale,
        }
    }

    pub fn rows(&self) -> usize {
        self.timestamps.len()
    }

    pub fn reset(&mut self) {
        self.timestamps.clear();
        self.values.clear();
        self.scale = 0;
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.timestamps.len() != self.values.len() {
            return Err(CodecError::LengthMismatch {
                timestamps: self.timestamps.len(),
                values: self.values.len(),
            });
        }
        if self.timestamps.is_empty() {
            return Err(CodecError::EmptyBlock);
        }
        if self.timestamps.len() > MAX_ROWS_COUNT {
            return Err(CodecError::BadRowsCount {
                got: self.timestamps.len() as u64,
                max: MAX_ROWS_COUNT as u64,
            });
        }

        let mut ts_data = Vec::new();
        let (ts_type, min_timestamp) = marshal_i64_array(&mut ts_data, &self.timestamps)?;
        let mut values_data = Vec::new();
        let (values_type, first_value) = marshal_i64_array(&mut values_data, &self.values)?;

        put_var_i64(dst, min_timestamp);
        put_var_i64(dst, first_value);
        put_var_u64(dst, self.timestamps.len() as u64);
        put_var_i64(dst, i64::from(self.scale));
        dst.push(ts_type.to_u8());
        dst.push(values_type.to_u8());
        put_bytes(dst, &ts_data);
        put_bytes(dst, &values_data);
        Ok(())
    }

    /// Decodes a block from the head of `src` and returns the rest.
    pub fn unmarshal<'a>(&mut self, src: &'a [u8]) -> Result<&'a [u8], CodecError> {
        let mut src = src;
        let min_timestamp = get_var_i64(&mut src, "min timestamp")?;
        let first_value = get_var_i64(&mut src, "first value")?;
        let rows_count = get_var_u64(&mut src, "rows count")?;
        if rows_count == 0 || rows_count > MAX_ROWS_COUNT as u64 {
            return Err(CodecError::BadRowsCount {
                got: rows_count,
                max: MAX_ROWS_COUNT as u64,
            });
        }
        let rows_count = rows_count as usize;
        let scale = get_var_i64(&mut src, "scale")?;
        let scale = i16::try_from(scale).map_err(|_| CodecError::BadScale(scale))?;

        if src.len() < 2 {
            return Err(CodecError::Truncated("marshal types"));
        }
        let ts_type = MarshalType::from_u8(src.get_u8())?;
        let values_type = MarshalType::from_u8(src.get_u8())?;

        let ts_data = get_bytes(&mut src, "timestamps data")?;
        check_data_size("timestamps", ts_data)?;
        let values_data = get_bytes(&mut src, "values data")?;
        check_data_size("values", values_data)?;

        self.timestamps.clear();
        self.values.clear();
        self.scale = scale;
        unmarshal_i64_array(&mut self.timestamps, ts_data, ts_type, min_timestamp, rows_count)?;
        unmarshal_i64_array(&mut self.values, values_data, values_type, first_value, rows_count)?;
        Ok(src)
    }

    /// Appends rows with timestamps inside `tr`, converting mantissas to floats.
    pub fn append_rows_in_range(&self, tr: TimeRange, timestamps: &mut Vec<i64>, values: &mut Vec<f64>) {
        for (&ts, &v) in self.timestamps.iter().zip(&self.values) {
            if tr.contains(ts) {
                timestamps.push(ts);
                values.push(decimal_to_float(v, self.scale));
            }
        }
    }
}

fn check_data_size(what: &'static str, data: &[u8]) -> Result<(), CodecError> {
    if data.len() > MAX_DATA_SIZE {
        return Err(CodecError::DataTooBig {
            what,
            size: data.len(),
            max: MAX_DATA_SIZE,
        });
    }
    Ok(())
}

/// Exact powers of ten representable in an f64.
const POW10: [f64; 23] = [
    1e0, 1e1, 1e2, 1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9, 1e10, 1e11, 1e12, 1e13, 1e14, 1e15, 1e16,
    1e17, 1e18, 1e19, 1e20, 1e21, 1e22,
];

fn pow10(e: i32) -> f64 {
    match POW10.get(e as usize) {
        Some(&p) => p,
        None => 10f64.powi(e),
    }
}

/// Converts a decimal mantissa to a float.
pub fn decimal_to_float(v: i64, scale: i16) -> f64 {
    if v > V_MAX || v < V_MIN {
        return match v {
            V_INF_POS => f64::INFINITY,
            V_INF_NEG => f64::NEG_INFINITY,
            V_STALE_NAN => f64::from_bits(STALE_NAN_BITS),
            _ => f64::NAN,
        };
    }
    let scale = i32::from(scale);
    if scale == 0 {
        v as f64
    } else if scale < 0 {
        v as f64 / pow10(-scale)
    } else {
        v as f64 * pow10(scale)
    }
}
