//! Writers for the native stream format.
//!
//! The inverse of [`StreamParser`](crate::StreamParser): used to produce
//! export files and test fixtures.

use crate::block::{PortableBlock, TimeRange};
use crate::config::MAX_FIELD_SIZE;
use crate::encoding::put_fixed_i64;
use crate::metric_name::MetricName;
use bytes::BytesMut;
use std::io::{self, Write};

/// Writes the 16-byte stream header.
pub fn write_time_range<W: Write>(w: &mut W, tr: TimeRange) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(16);
    put_fixed_i64(&mut buf, tr.min_timestamp);
    put_fixed_i64(&mut buf, tr.max_timestamp);
    w.write_all(&buf)
}

/// Writes one record from already marshaled metric name and block bytes.
pub fn write_record<W: Write>(w: &mut W, metric_name: &[u8], block: &[u8]) -> io::Result<()> {
    write_field(w, "metricName", metric_name)?;
    write_field(w, "native block", block)
}

fn write_field<W: Write>(w: &mut W, field: &str, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FIELD_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "too big {} size: {} bytes; cannot exceed {}",
                field,
                data.len(),
                MAX_FIELD_SIZE
            ),
        ));
    }
    w.write_all(&(data.len() as u32).to_be_bytes())?;
    w.write_all(data)
}

/// Streams series into the native format, reusing its marshal buffers.
///
/// # Examples
///
/// ```
/// use vmingest_native::{MetricName, NativeWriter, PortableBlock, TimeRange};
///
/// let mut writer = NativeWriter::new(Vec::new(), TimeRange::new(0, 1000)).unwrap();
/// let name = MetricName::new("up").with_tag("job", "api");
/// let block = PortableBlock::new(vec![10, 20], vec![1, 1], 0);
/// writer.write_block(&name, &block).unwrap();
/// let stream = writer.into_inner();
/// assert!(stream.len() > 16);
/// ```
#[derive(Debug)]
pub struct NativeWriter<W: Write> {
    w: W,
    name_buf: Vec<u8>,
    block_buf: Vec<u8>,
    records: u64,
}

impl<W: Write> NativeWriter<W> {
    /// Writes the header and returns a writer positioned at the first record.
    pub fn new(mut w: W, tr: TimeRange) -> io::Result<Self> {
        write_time_range(&mut w, tr)?;
        Ok(Self {
            w,
            name_buf: Vec::new(),
            block_buf: Vec::new(),
            records: 0,
        })
    }

    pub fn write_block(&mut self, metric_name: &MetricName, block: &PortableBlock) -> io::Result<()> {
        self.name_buf.clear();
        metric_name.marshal(&mut self.name_buf);
        self.block_buf.clear();
        block
            .marshal(&mut self.block_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        write_record(&mut self.w, &self.name_buf, &self.block_buf)?;
        self.records += 1;
        Ok(())
    }

    /// Writes a record whose payloads were marshaled elsewhere.
    pub fn write_raw(&mut self, metric_name: &[u8], block: &[u8]) -> io::Result<()> {
        write_record(&mut self.w, metric_name, block)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut out = Vec::new();
        write_time_range(&mut out, TimeRange::new(1, -1)).unwrap();
        assert_eq!(
            out,
            [0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_record_layout() {
        let mut out = Vec::new();
        write_record(&mut out, b"ab", b"xyz").unwrap();
        assert_eq!(out, b"\x00\x00\x00\x02ab\x00\x00\x00\x03xyz");
    }

    #[test]
    fn test_oversized_field_rejected() {
        let mut out = Vec::new();
        let big = vec![0u8; MAX_FIELD_SIZE as usize + 1];
        let err = write_record(&mut out, &big, b"").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(out.is_empty());
    }

    #[test]
    fn test_writer_counts_records() {
        let mut writer = NativeWriter::new(Vec::new(), TimeRange::unbounded()).unwrap();
        let block = PortableBlock::new(vec![1], vec![1], 0);
        writer.write_block(&MetricName::new("a"), &block).unwrap();
        writer.write_block(&MetricName::new("b"), &block).unwrap();
        assert_eq!(writer.records(), 2);

        let err = writer
            .write_block(&MetricName::new("c"), &PortableBlock::default())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(writer.records(), 2);
    }
}
