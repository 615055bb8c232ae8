//! Native stream parser.
//!
//! Stream layout (integers big-endian):
//!
//! ```text
//! [0..8)    min timestamp, zig-zag i64
//! [8..16)   max timestamp, zig-zag i64
//! repeated until EOF:
//!   u32 L1, L1 bytes metric name
//!   u32 L2, L2 bytes native block
//! ```
//!
//! The reading thread only frames records. Each record goes to the
//! [`WorkerPool`] as a pooled work unit that decodes it, drops rows outside
//! the stream's time range and runs the callback. `parse` returns once every
//! unit it scheduled has finished.

use crate::block::{Block, NativeCodec, PortableCodec, TimeRange};
use crate::config::{ParserConfig, MAX_FIELD_SIZE};
use crate::encoding::zigzag_decode;
use crate::error::{CallbackError, ConfigError, ParseError, ProcessError};
use crate::limiter::{ConcurrencyLimiter, LimitedReader, ReadTicket};
use crate::workers::{UnmarshalWork, WorkerPool};
use bytes::Buf;
use flate2::read::MultiGzDecoder;
use parking_lot::{Condvar, Mutex};
use std::io::{self, BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use vmingest_observe::{Counter, Histogram, IngestEvt, IngestKind, Meter, NoopMeter, VizEvent};

const PROTOCOL: &str = "native";
const NATIVE: &[(&str, &str)] = &[("type", "native")];
const DURATION_BUCKETS: &[f64] = &[0.001, 0.01, 0.1, 1.0, 10.0, 60.0];

type SharedCallback = Arc<dyn Fn(&Block) -> Result<(), CallbackError> + Send + Sync>;

struct ParserMetrics {
    read_calls: Box<dyn Counter>,
    read_errors: Box<dyn Counter>,
    rows_read: Box<dyn Counter>,
    blocks_read: Box<dyn Counter>,
    parse_errors: Box<dyn Counter>,
    process_errors: Box<dyn Counter>,
    parse_duration: Box<dyn Histogram>,
}

impl ParserMetrics {
    fn new(meter: &dyn Meter) -> Self {
        Self {
            read_calls: meter.counter("vm_protoparser_read_calls_total", NATIVE),
            read_errors: meter.counter("vm_protoparser_read_errors_total", NATIVE),
            rows_read: meter.counter("vm_protoparser_rows_read_total", NATIVE),
            blocks_read: meter.counter("vm_protoparser_blocks_read_total", NATIVE),
            parse_errors: meter.counter("vm_protoparser_parse_errors_total", NATIVE),
            process_errors: meter.counter("vm_protoparser_process_errors_total", NATIVE),
            parse_duration: meter.histo(
                "vm_protoparser_parse_duration_seconds",
                DURATION_BUCKETS,
                NATIVE,
            ),
        }
    }
}

/// State shared by one `parse` call and the units it scheduled.
#[derive(Default)]
struct StreamContext {
    pending: Mutex<usize>,
    idle: Condvar,
    err: Mutex<Option<ProcessError>>,
    blocks: AtomicU64,
    rows: AtomicU64,
}

impl StreamContext {
    fn add(&self) {
        *self.pending.lock() += 1;
    }

    fn done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    /// Keeps the first error only.
    fn set_error(&self, err: ProcessError) {
        let mut slot = self.err.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take_error(&self) -> Option<ProcessError> {
        self.err.lock().take()
    }
}

/// Marks a unit finished even if its callback panics.
struct DoneGuard<'a>(&'a StreamContext);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.set_error(ProcessError::WorkerPanicked);
        }
        self.0.done();
    }
}

struct Shared<C: NativeCodec> {
    codec: C,
    free: Mutex<Vec<Box<NativeWork<C>>>>,
    metrics: ParserMetrics,
}

impl<C: NativeCodec> Shared<C> {
    fn get_work(&self) -> Box<NativeWork<C>> {
        self.free.lock().pop().unwrap_or_default()
    }

    fn put_work(&self, mut uw: Box<NativeWork<C>>) {
        uw.reset(&self.codec);
        self.free.lock().push(uw);
    }
}

/// One framed record on its way through the worker pool.
///
/// The `Option` fields are only set between scheduling and completion, so
/// idle units in the free list hold no references back into the parser.
struct NativeWork<C: NativeCodec> {
    shared: Option<Arc<Shared<C>>>,
    ctx: Option<Arc<StreamContext>>,
    callback: Option<SharedCallback>,
    tr: TimeRange,
    metric_name_buf: Vec<u8>,
    block_buf: Vec<u8>,
    block: Block,
    scratch: C::Scratch,
}

impl<C: NativeCodec> Default for NativeWork<C> {
    fn default() -> Self {
        Self {
            shared: None,
            ctx: None,
            callback: None,
            tr: TimeRange::default(),
            metric_name_buf: Vec::new(),
            block_buf: Vec::new(),
            block: Block::default(),
            scratch: C::Scratch::default(),
        }
    }
}

impl<C: NativeCodec> NativeWork<C> {
    fn reset(&mut self, codec: &C) {
        self.shared = None;
        self.ctx = None;
        self.callback = None;
        self.tr = TimeRange::default();
        self.metric_name_buf.clear();
        self.block_buf.clear();
        self.block.reset();
        codec.reset_scratch(&mut self.scratch);
    }

    fn decode(&mut self, codec: &C) -> Result<(), ProcessError> {
        codec
            .unmarshal_metric_name(&self.metric_name_buf, &mut self.block.metric_name)
            .map_err(|source| ProcessError::MetricName {
                size: self.metric_name_buf.len(),
                source,
            })?;

        self.block.timestamps.clear();
        self.block.values.clear();
        codec
            .append_rows_in_range(
                &self.block_buf,
                self.tr,
                &mut self.scratch,
                &mut self.block.timestamps,
                &mut self.block.values,
            )
            .map_err(|source| ProcessError::Block {
                size: self.block_buf.len(),
                source,
            })
    }
}

impl<C: NativeCodec> UnmarshalWork for NativeWork<C> {
    fn unmarshal(mut self: Box<Self>) {
        // Scheduled units always carry all three.
        let (Some(shared), Some(ctx), Some(callback)) =
            (self.shared.take(), self.ctx.take(), self.callback.take())
        else {
            return;
        };
        let _done = DoneGuard(&ctx);

        let result = match self.decode(&shared.codec) {
            Ok(()) => {
                let rows = self.block.rows() as u64;
                shared.metrics.rows_read.inc(rows);
                shared.metrics.blocks_read.inc(1);
                ctx.rows.fetch_add(rows, Ordering::Relaxed);
                ctx.blocks.fetch_add(1, Ordering::Relaxed);
                callback(&self.block).map_err(ProcessError::Callback)
            }
            Err(err) => {
                shared.metrics.parse_errors.inc(1);
                Err(err)
            }
        };
        if let Err(err) = result {
            shared.metrics.process_errors.inc(1);
            ctx.set_error(err);
        }

        drop(callback);
        shared.put_work(self);
    }
}

/// Concurrent parser for native bulk-import streams.
///
/// Cheap to share: one instance serves any number of concurrent `parse`
/// calls, which share its worker pool, read limiter and unit free list.
pub struct StreamParser<C: NativeCodec = PortableCodec> {
    shared: Arc<Shared<C>>,
    workers: Arc<WorkerPool>,
    limiter: Arc<ConcurrencyLimiter>,
    meter: Arc<dyn Meter>,
    read_buffer_size: usize,
}

impl StreamParser<PortableCodec> {
    pub fn new(config: ParserConfig) -> Result<Self, ConfigError> {
        Self::with_codec(config, PortableCodec, Arc::new(NoopMeter))
    }

    pub fn with_meter(config: ParserConfig, meter: Arc<dyn Meter>) -> Result<Self, ConfigError> {
        Self::with_codec(config, PortableCodec, meter)
    }
}

impl<C: NativeCodec> StreamParser<C> {
    /// Validates `config`, then starts the worker pool and the read limiter.
    pub fn with_codec(
        config: ParserConfig,
        codec: C,
        meter: Arc<dyn Meter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let workers = WorkerPool::new(config.workers, config.queue_capacity)
            .map_err(|e| ConfigError::IoError(format!("cannot start unmarshal workers: {}", e)))?;
        let limiter = ConcurrencyLimiter::with_meter(
            config.max_concurrent_inserts,
            config.max_queue_duration(),
            meter.as_ref(),
        );
        Ok(Self::from_parts(
            codec,
            Arc::new(workers),
            Arc::new(limiter),
            meter,
            config.read_buffer_size,
        ))
    }

    /// Builds a parser on a worker pool and limiter shared with other parsers.
    pub fn from_parts(
        codec: C,
        workers: Arc<WorkerPool>,
        limiter: Arc<ConcurrencyLimiter>,
        meter: Arc<dyn Meter>,
        read_buffer_size: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            codec,
            free: Mutex::new(Vec::new()),
            metrics: ParserMetrics::new(meter.as_ref()),
        });
        Self {
            shared,
            workers,
            limiter,
            meter,
            read_buffer_size,
        }
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// Work units parked in the free list.
    pub fn idle_units(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Parses a native stream, calling `callback` once per record.
    ///
    /// Callbacks run on the worker threads, concurrently and in no
    /// particular order. The [`Block`] is only borrowed for the call.
    ///
    /// A framing error (read failure, truncated record, oversized field)
    /// stops reading. A record that fails to decode, or whose callback fails,
    /// does not: the stream is read to the end and the first such error is
    /// returned. Either way `parse` only returns after every scheduled
    /// record has finished.
    pub fn parse<R, F, E>(&self, reader: R, is_gzip: bool, callback: F) -> Result<(), ParseError>
    where
        R: Read,
        F: Fn(&Block) -> Result<(), E> + Send + Sync + 'static,
        E: Into<CallbackError>,
    {
        let start = Instant::now();
        let callback: SharedCallback = Arc::new(move |block: &Block| callback(block).map_err(Into::into));
        let ticket = ReadTicket::new(self.limiter.clone());
        let reader = LimitedReader::new(reader, &ticket);
        let res = if is_gzip {
            self.parse_stream(MultiGzDecoder::new(reader), &ticket, callback)
        } else {
            self.parse_stream(reader, &ticket, callback)
        };
        self.shared
            .metrics
            .parse_duration
            .observe(start.elapsed().as_secs_f64());
        res
    }

    fn parse_stream<S: Read>(
        &self,
        src: S,
        ticket: &ReadTicket,
        callback: SharedCallback,
    ) -> Result<(), ParseError> {
        let mut br = BufReader::with_capacity(self.read_buffer_size, src);

        let mut header = [0u8; 16];
        if let Err(err) = br.read_exact(&mut header) {
            self.shared.metrics.read_errors.inc(1);
            self.note_timeout(&err);
            self.emit(IngestKind::Aborted { blocks: 0 });
            return Err(ParseError::ReadTimeRange(err));
        }
        let tr = decode_time_range(&header);

        let ctx = Arc::new(StreamContext::default());
        let mut size_buf = [0u8; 4];
        let outcome = loop {
            let mut uw = self.shared.get_work();
            match self.read_record(&mut br, &mut uw, &mut size_buf) {
                Ok(true) => {}
                Ok(false) => {
                    self.shared.put_work(uw);
                    break Ok(());
                }
                Err(err) => {
                    self.shared.put_work(uw);
                    break Err(err);
                }
            }
            self.shared.metrics.read_calls.inc(1);

            uw.tr = tr;
            uw.shared = Some(self.shared.clone());
            uw.ctx = Some(ctx.clone());
            uw.callback = Some(callback.clone());
            ctx.add();
            self.workers.schedule(uw);
            ticket.dec_concurrency();
        };

        ctx.wait();
        let blocks = ctx.blocks.load(Ordering::Relaxed);
        let rows = ctx.rows.load(Ordering::Relaxed);

        if let Err(err) = outcome {
            tracing::warn!("native stream aborted after {} blocks: {}", blocks, err);
            self.emit(IngestKind::Aborted { blocks });
            return Err(err);
        }

        let err = ctx.take_error();
        tracing::debug!(
            "native stream done: {} blocks, {} rows, time range [{}, {}]",
            blocks,
            rows,
            tr.min_timestamp,
            tr.max_timestamp
        );
        self.emit(IngestKind::Finished {
            blocks,
            rows,
            failed: err.is_some(),
        });
        match err {
            Some(err) => Err(ParseError::Process(err)),
            None => Ok(()),
        }
    }

    /// Reads the next record into `uw`. Returns `false` at a clean end of stream.
    fn read_record<S: Read>(
        &self,
        br: &mut S,
        uw: &mut NativeWork<C>,
        size_buf: &mut [u8; 4],
    ) -> Result<bool, ParseError> {
        match read_full(br, size_buf) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(source) => return Err(self.read_error("metricName size", source)),
        }
        let size = u32::from_be_bytes(*size_buf);
        self.read_payload(br, size, &mut uw.metric_name_buf, "metricName")?;

        match read_full(br, size_buf) {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.read_error("native block size", io::ErrorKind::UnexpectedEof.into()))
            }
            Err(source) => return Err(self.read_error("native block size", source)),
        }
        let size = u32::from_be_bytes(*size_buf);
        self.read_payload(br, size, &mut uw.block_buf, "native block")?;
        Ok(true)
    }

    fn read_payload<S: Read>(
        &self,
        br: &mut S,
        size: u32,
        dst: &mut Vec<u8>,
        field: &'static str,
    ) -> Result<(), ParseError> {
        if size > MAX_FIELD_SIZE {
            self.shared.metrics.read_errors.inc(1);
            return Err(ParseError::FieldTooBig {
                field,
                size,
                max: MAX_FIELD_SIZE,
            });
        }
        dst.clear();
        dst.resize(size as usize, 0);
        br.read_exact(dst)
            .map_err(|source| self.read_error(field, source))
    }

    fn read_error(&self, field: &'static str, source: io::Error) -> ParseError {
        self.shared.metrics.read_errors.inc(1);
        self.note_timeout(&source);
        ParseError::ReadField { field, source }
    }

    fn note_timeout(&self, err: &io::Error) {
        if err.kind() == io::ErrorKind::TimedOut {
            self.emit(IngestKind::ConcurrencyTimeout {
                waited_ms: self.limiter.max_queue_duration().as_millis() as u64,
            });
        }
    }

    fn emit(&self, kind: IngestKind) {
        self.meter.emit(VizEvent::Ingest(IngestEvt {
            protocol: PROTOCOL,
            kind,
        }));
    }
}

fn decode_time_range(header: &[u8; 16]) -> TimeRange {
    let mut src = &header[..];
    let min_timestamp = zigzag_decode(src.get_u64());
    let max_timestamp = zigzag_decode(src.get_u64());
    TimeRange::new(min_timestamp, max_timestamp)
}

/// Fills `buf` completely.
///
/// Returns `Ok(false)` if the reader was already at EOF, and an
/// `UnexpectedEof` error if it ended part way through `buf`.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("unexpected EOF after {} of {} bytes", filled, buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::put_fixed_i64;
    use std::time::Duration;

    /// Hands out the input one byte per read call.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.0[0];
            self.0 = &self.0[1..];
            Ok(1)
        }
    }

    #[test]
    fn test_read_full_clean_eof() {
        let mut buf = [0u8; 4];
        assert!(!read_full(&mut &b""[..], &mut buf).unwrap());
    }

    #[test]
    fn test_read_full_short_reads() {
        let mut buf = [0u8; 4];
        assert!(read_full(&mut Trickle(&[1, 2, 3, 4, 5]), &mut buf).unwrap());
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_read_full_partial_is_error() {
        let mut buf = [0u8; 4];
        let err = read_full(&mut Trickle(&[1, 2]), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().contains("2 of 4"));
    }

    #[test]
    fn test_decode_time_range() {
        let mut header = Vec::new();
        put_fixed_i64(&mut header, -5);
        put_fixed_i64(&mut header, 1_700_000_000_000);
        let header: [u8; 16] = header.try_into().unwrap();
        assert_eq!(
            decode_time_range(&header),
            TimeRange::new(-5, 1_700_000_000_000)
        );
    }

    #[test]
    fn test_context_keeps_first_error() {
        let ctx = StreamContext::default();
        ctx.set_error(ProcessError::WorkerPanicked);
        ctx.set_error(ProcessError::Callback("second".into()));
        assert!(matches!(
            ctx.take_error(),
            Some(ProcessError::WorkerPanicked)
        ));
        assert!(ctx.take_error().is_none());
    }

    #[test]
    fn test_context_wait_blocks_until_done() {
        let ctx = Arc::new(StreamContext::default());
        for _ in 0..4 {
            ctx.add();
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(20));
                    ctx.done();
                })
            })
            .collect();

        ctx.wait();
        assert_eq!(*ctx.pending.lock(), 0);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_done_guard_records_panic() {
        let ctx = Arc::new(StreamContext::default());
        ctx.add();
        let result = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let _done = DoneGuard(&ctx);
                panic!("callback blew up");
            })
            .join()
        };
        assert!(result.is_err());
        ctx.wait();
        assert!(matches!(
            ctx.take_error(),
            Some(ProcessError::WorkerPanicked)
        ));
    }

    #[test]
    fn test_units_are_reset_before_reuse() {
        let parser = StreamParser::new(ParserConfig {
            workers: 1,
            ..ParserConfig::default()
        })
        .unwrap();

        let mut uw = parser.shared.get_work();
        uw.metric_name_buf.extend_from_slice(b"junk");
        uw.block_buf.extend_from_slice(b"junk");
        uw.block.timestamps.push(1);
        uw.tr = TimeRange::new(1, 2);
        parser.shared.put_work(uw);
        assert_eq!(parser.idle_units(), 1);

        let uw = parser.shared.get_work();
        assert!(uw.metric_name_buf.is_empty());
        assert!(uw.block_buf.is_empty());
        assert_eq!(uw.block, Block::default());
        assert_eq!(uw.tr, TimeRange::default());
        assert!(uw.shared.is_none() && uw.ctx.is_none() && uw.callback.is_none());
    }
}
