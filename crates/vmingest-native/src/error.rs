use crate::encoding::MarshalType;
use std::io;
use thiserror::Error;

/// Error returned by a block callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Errors decoding metric names and native blocks.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),
    #[error("invalid varint while reading {0}")]
    BadVarint(&'static str),
    #[error("unknown marshal type: {0}")]
    UnknownMarshalType(u8),
    #[error("unexpected {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("rows count must be in 1..={max}; got {got}")]
    BadRowsCount { got: u64, max: u64 },
    #[error("scale {0} does not fit into i16")]
    BadScale(i64),
    #[error("too big {what} data: {size} bytes; cannot exceed {max}")]
    DataTooBig {
        what: &'static str,
        size: usize,
        max: usize,
    },
    #[error("cannot unmarshal tag value: {0}")]
    BadTagValue(&'static str),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("timestamps and values count mismatch: {timestamps} vs {values}")]
    LengthMismatch { timestamps: usize, values: usize },
    #[error("block must contain at least one row")]
    EmptyBlock,
    #[error("{mt:?} needs at least {min} items; got {got}")]
    TooFewItems {
        mt: MarshalType,
        min: usize,
        got: usize,
    },
}

/// Failure of a single record inside an otherwise readable stream.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("cannot unmarshal metric name from {size} bytes: {source}")]
    MetricName { size: usize, source: CodecError },
    #[error("cannot unmarshal native block from {size} bytes: {source}")]
    Block { size: usize, source: CodecError },
    #[error("callback failed: {0}")]
    Callback(CallbackError),
    #[error("unmarshal worker panicked")]
    WorkerPanicked,
}

impl ProcessError {
    /// True when the record itself was malformed, as opposed to rejected
    /// by the callback.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, ProcessError::MetricName { .. } | ProcessError::Block { .. })
    }
}

/// Errors returned by [`StreamParser::parse`](crate::StreamParser::parse).
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read time range: {0}")]
    ReadTimeRange(#[source] io::Error),
    #[error("cannot read {field}: {source}")]
    ReadField {
        field: &'static str,
        source: io::Error,
    },
    #[error("too big {field} size; got {size}; shouldn't exceed {max}")]
    FieldTooBig {
        field: &'static str,
        size: u32,
        max: u32,
    },
    #[error("error when processing native block: {0}")]
    Process(#[from] ProcessError),
}

/// Invalid parser configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid field: {0}")]
    InvalidField(String),
    #[error("I/O error: {0}")]
    IoError(String),
}
