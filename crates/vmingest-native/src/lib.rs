//! Native bulk-import stream decoding.
//!
//! A native stream carries a time range followed by length-prefixed pairs of
//! (metric name, block). [`StreamParser`] frames the stream on the calling
//! thread and decodes records on a shared [`WorkerPool`], handing each
//! decoded [`Block`] to a callback.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use vmingest_native::{
//!     Block, MetricName, NativeWriter, ParserConfig, PortableBlock, StreamParser, TimeRange,
//! };
//!
//! let mut writer = NativeWriter::new(Vec::new(), TimeRange::new(0, 100)).unwrap();
//! let block = PortableBlock::new(vec![50, 150], vec![1, 2], 0);
//! writer.write_block(&MetricName::new("up"), &block).unwrap();
//! let stream = writer.into_inner();
//!
//! let parser = StreamParser::new(ParserConfig::default()).unwrap();
//! let rows = Arc::new(AtomicUsize::new(0));
//! let seen = rows.clone();
//! parser
//!     .parse(&stream[..], false, move |block: &Block| {
//!         seen.fetch_add(block.rows(), Ordering::Relaxed);
//!         Ok::<(), std::io::Error>(())
//!     })
//!     .unwrap();
//!
//! // The row at ts=150 is outside the stream's time range.
//! assert_eq!(rows.load(Ordering::Relaxed), 1);
//! ```

pub mod block;
pub mod config;
pub mod encoding;
pub mod error;
pub mod export;
pub mod limiter;
pub mod metric_name;
pub mod parser;
pub mod workers;

pub use block::{Block, NativeCodec, PortableBlock, PortableCodec, TimeRange};
pub use config::{ParserConfig, MAX_FIELD_SIZE};
pub use error::{CallbackError, CodecError, ConfigError, ParseError, ProcessError};
pub use export::{write_record, write_time_range, NativeWriter};
pub use limiter::{ConcurrencyLimiter, LimitedReader, LimiterError, ReadTicket};
pub use metric_name::{MetricName, Tag};
pub use parser::StreamParser;
pub use workers::{UnmarshalWork, WorkerPool};
