//! Per-entry metadata records
//!
//! Metadata is stored as line-oriented `key=value` text so entries can be
//! inspected with a pager:
//!
//! ```text
//! uri=s3://bucket/ocean_surface_small.nc
//! size=48213
//! cached_at=2026-10-17T09:12:44.120Z
//! last_validated=2026-10-17T11:02:10.003Z
//! etag="9b2cf535f27731c974343645a3985328"
//! ```
//!
//! `uri`, `size` and `cached_at` are required. `last_validated` defaults to
//! `cached_at` and `etag` is optional. Unknown keys are ignored.
//!
//! `uri` and `etag` are stored with `%`, LF and CR percent-escaped
//! (`%25`, `%0A`, `%0D`) so any value survives the line format.

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::key::CacheKey;

/// Errors from decoding a metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("metadata is not valid UTF-8")]
    InvalidUtf8,

    #[error("missing required key: {0}")]
    MissingKey(&'static str),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("malformed line {line}: {content:?}")]
    MalformedLine { line: usize, content: String },
}

/// A cached object's persisted metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Key derived from `source_uri`
    pub key: CacheKey,
    /// Remote object URI
    pub source_uri: String,
    /// Blob size in bytes
    pub size_bytes: u64,
    /// When the blob was admitted
    pub cached_at: DateTime<Utc>,
    /// Last time the entry was served or refreshed
    pub last_validated_at: DateTime<Utc>,
    /// Source-provided fingerprint (e.g. an ETag)
    pub integrity_token: Option<String>,
}

impl CacheEntry {
    /// Create an entry admitted at `now`.
    pub fn new(
        source_uri: &str,
        size_bytes: u64,
        integrity_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: CacheKey::derive(source_uri),
            source_uri: source_uri.to_string(),
            size_bytes,
            cached_at: now,
            last_validated_at: now,
            integrity_token: integrity_token.map(str::to_string),
        }
    }

    /// Whether the entry is older than `ttl` at `now`.
    pub fn is_expired(&self, ttl: Option<chrono::Duration>, now: DateTime<Utc>) -> bool {
        match ttl {
            Some(ttl) => now.signed_duration_since(self.cached_at) > ttl,
            None => false,
        }
    }

    /// Encode to the on-disk text form.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        push_line(&mut out, "uri", &escape(&self.source_uri));
        push_line(&mut out, "size", &self.size_bytes.to_string());
        push_line(&mut out, "cached_at", &format_time(self.cached_at));
        push_line(&mut out, "last_validated", &format_time(self.last_validated_at));
        if let Some(ref etag) = self.integrity_token {
            push_line(&mut out, "etag", &escape(etag));
        }
        out
    }

    /// Decode from the on-disk text form.
    ///
    /// The key is re-derived from `uri`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)?;

        let mut uri = None;
        let mut size = None;
        let mut cached_at = None;
        let mut last_validated = None;
        let mut etag = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let (k, v) = line.split_once('=').ok_or_else(|| ParseError::MalformedLine {
                line: idx + 1,
                content: line.to_string(),
            })?;
            match k.trim() {
                "uri" => uri = Some(unescape(v)),
                "size" => size = Some(parse_size(v)?),
                "cached_at" => cached_at = Some(parse_time("cached_at", v)?),
                "last_validated" => last_validated = Some(parse_time("last_validated", v)?),
                "etag" => etag = Some(unescape(v)),
                _ => {}
            }
        }

        let source_uri = uri.ok_or(ParseError::MissingKey("uri"))?;
        let size_bytes = size.ok_or(ParseError::MissingKey("size"))?;
        let cached_at = cached_at.ok_or(ParseError::MissingKey("cached_at"))?;

        Ok(Self {
            key: CacheKey::derive(&source_uri),
            source_uri,
            size_bytes,
            cached_at,
            last_validated_at: last_validated.unwrap_or(cached_at),
            integrity_token: etag.filter(|e| !e.is_empty()),
        })
    }
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`]. Other `%` sequences are kept literally.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = match tail.get(1..3).map(str::to_ascii_uppercase).as_deref() {
            Some("25") => Some('%'),
            Some("0A") => Some('\n'),
            Some("0D") => Some('\r'),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(key: &'static str, value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ParseError::InvalidValue {
            key,
            value: value.to_string(),
        })
}

fn parse_size(value: &str) -> Result<u64, ParseError> {
    value.trim().parse().map_err(|_| ParseError::InvalidValue {
        key: "size",
        value: value.to_string(),
    })
}
