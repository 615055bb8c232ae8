//! Canonical metric name encoding.
//!
//! A marshaled name is the metric group followed by `key, value` pairs, each
//! part escaped and terminated by [`TAG_SEPARATOR`]:
//!
//! ```text
//! group 0x01 key1 0x01 value1 0x01 key2 0x01 value2 0x01 ...
//! ```
//!
//! Inside a part, `0x00`, `0x01` and `0x02` are written as `0x00 '0'`,
//! `0x00 '1'` and `0x00 '2'`.

use crate::error::CodecError;
use std::fmt;

const ESCAPE_CHAR: u8 = 0;
const TAG_SEPARATOR: u8 = 1;
const KV_SEPARATOR: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A metric group plus its label pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricName {
    pub metric_group: Vec<u8>,
    pub tags: Vec<Tag>,
}

impl MetricName {
    pub fn new(metric_group: impl Into<Vec<u8>>) -> Self {
        Self {
            metric_group: metric_group.into(),
            tags: Vec::new(),
        }
    }

    pub fn add_tag(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.tags.push(Tag {
            key: key.into(),
            value: value.into(),
        });
    }

    /// Builder form of [`add_tag`](Self::add_tag).
    pub fn with_tag(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.add_tag(key, value);
        self
    }

    pub fn tag_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_slice())
    }

    /// Sorts tags by key so equal label sets marshal to equal bytes.
    pub fn sort_tags(&mut self) {
        self.tags.sort();
    }

    pub fn reset(&mut self) {
        self.metric_group.clear();
        self.tags.clear();
    }

    pub fn marshal(&self, dst: &mut Vec<u8>) {
        marshal_tag_value(dst, &self.metric_group);
        for tag in &self.tags {
            marshal_tag_value(dst, &tag.key);
            marshal_tag_value(dst, &tag.value);
        }
    }

    /// Decodes `src` into `self`, reusing the existing buffers.
    pub fn unmarshal(&mut self, src: &[u8]) -> Result<(), CodecError> {
        let mut src = src;
        self.metric_group.clear();
        unmarshal_tag_value(&mut self.metric_group, &mut src)?;

        let mut n = 0;
        while !src.is_empty() {
            if n == self.tags.len() {
                self.tags.push(Tag::default());
            }
            let tag = &mut self.tags[n];
            tag.key.clear();
            tag.value.clear();
            unmarshal_tag_value(&mut tag.key, &mut src)?;
            unmarshal_tag_value(&mut tag.value, &mut src)?;
            n += 1;
        }
        self.tags.truncate(n);
        Ok(())
    }
}

/// Prometheus text form, e.g. `http_requests_total{job="api",code="200"}`.
impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.metric_group))?;
        if self.tags.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(
                f,
                "{}={:?}",
                String::from_utf8_lossy(&tag.key),
                String::from_utf8_lossy(&tag.value)
            )?;
        }
        f.write_str("}")
    }
}

fn marshal_tag_value(dst: &mut Vec<u8>, src: &[u8]) {
    for &b in src {
        match b {
            ESCAPE_CHAR => dst.extend_from_slice(&[ESCAPE_CHAR, b'0']),
            TAG_SEPARATOR => dst.extend_from_slice(&[ESCAPE_CHAR, b'1']),
            KV_SEPARATOR => dst.extend_from_slice(&[ESCAPE_CHAR, b'2']),
            _ => dst.push(b),
        }
    }
    dst.push(TAG_SEPARATOR);
}

fn unmarshal_tag_value(dst: &mut Vec<u8>, src: &mut &[u8]) -> Result<(), CodecError> {
    let end = src
        .iter()
        .position(|&b| b == TAG_SEPARATOR)
        .ok_or(CodecError::BadTagValue("cannot find the end of tag value"))?;
    let mut part = &src[..end];
    *src = &src[end + 1..];

    while let Some(pos) = part.iter().position(|&b| b == ESCAPE_CHAR) {
        dst.extend_from_slice(&part[..pos]);
        let escaped = *part
            .get(pos + 1)
            .ok_or(CodecError::BadTagValue("missing escaped char"))?;
        dst.push(match escaped {
            b'0' => ESCAPE_CHAR,
            b'1' => TAG_SEPARATOR,
            b'2' => KV_SEPARATOR,
            _ => return Err(CodecError::BadTagValue("unsupported escaped char")),
        });
        part = &part[pos + 2..];
    }
    dst.extend_from_slice(part);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_layout() {
        let mn = MetricName::new("up").with_tag("job", "api");
        let mut buf = Vec::new();
        mn.marshal(&mut buf);
        assert_eq!(buf, b"up\x01job\x01api\x01");
    }

    #[test]
    fn test_special_bytes_are_escaped() {
        let mn = MetricName::new(b"a\x00b".to_vec()).with_tag(b"k\x01".to_vec(), b"\x02v".to_vec());
        let mut buf = Vec::new();
        mn.marshal(&mut buf);
        assert_eq!(buf, b"a\x000b\x01k\x001\x01\x002v\x01");

        let mut decoded = MetricName::default();
        decoded.unmarshal(&buf).unwrap();
        assert_eq!(decoded, mn);
    }

    #[test]
    fn test_unmarshal_reuses_and_truncates_tags() {
        let long = MetricName::new("m").with_tag("a", "1").with_tag("b", "2");
        let short = MetricName::new("n").with_tag("c", "3");

        let mut buf = Vec::new();
        long.marshal(&mut buf);
        let mut decoded = MetricName::default();
        decoded.unmarshal(&buf).unwrap();
        assert_eq!(decoded, long);

        buf.clear();
        short.marshal(&mut buf);
        decoded.unmarshal(&buf).unwrap();
        assert_eq!(decoded, short);
    }

    #[test]
    fn test_unmarshal_errors() {
        let mut mn = MetricName::default();

        let err = mn.unmarshal(b"no_separator").unwrap_err();
        assert!(err.to_string().contains("cannot find the end of tag value"));

        let err = mn.unmarshal(b"m\x01key_without_value").unwrap_err();
        assert!(err.to_string().contains("cannot find the end of tag value"));

        let err = mn.unmarshal(b"bad\x00x\x01").unwrap_err();
        assert!(err.to_string().contains("unsupported escaped char"));

        let err = mn.unmarshal(b"bad\x00").unwrap_err();
        assert!(err.to_string().contains("cannot find the end of tag value"));
    }

    #[test]
    fn test_missing_escaped_char() {
        let mut dst = Vec::new();
        let mut src: &[u8] = b"x\x00\x01";
        let err = unmarshal_tag_value(&mut dst, &mut src).unwrap_err();
        assert!(err.to_string().contains("missing escaped char"));
    }

    #[test]
    fn test_display_and_lookup() {
        let mut mn = MetricName::new("http_requests_total")
            .with_tag("job", "api")
            .with_tag("code", "200");
        assert_eq!(mn.tag_value(b"code"), Some(&b"200"[..]));
        assert_eq!(mn.tag_value(b"missing"), None);

        mn.sort_tags();
        assert_eq!(
            mn.to_string(),
            r#"http_requests_total{code="200",job="api"}"#
        );
        assert_eq!(MetricName::new("up").to_string(), "up");
    }
}
