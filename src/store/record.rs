//! Cache Records
//!
//! Defines the records held by every collection of the durable object store:
//! a key, a payload, the write time and an optional time-to-live.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

// =============================================================================
// Payload
// =============================================================================

/// Resource-specific content of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// JSON-shaped metadata (listings, lyrics responses, snapshots)
    Json { value: Value },
    /// Raw bytes plus an optional precomputed renderable form
    Binary {
        #[serde(with = "base64_bytes")]
        bytes: Bytes,
        content_type: Option<String>,
        data_uri: Option<String>,
    },
}

impl Payload {
    /// Wrap a JSON value
    pub fn json(value: Value) -> Self {
        Payload::Json { value }
    }

    /// Get the JSON value if this is a JSON payload
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json { value } => Some(value),
            Payload::Binary { .. } => None,
        }
    }

    /// Take the JSON value if this is a JSON payload
    pub fn into_json(self) -> Option<Value> {
        match self {
            Payload::Json { value } => Some(value),
            Payload::Binary { .. } => None,
        }
    }

    /// Whether this payload carries raw bytes
    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary { .. })
    }

    /// Approximate stored size in bytes
    pub fn size_bytes(&self) -> u64 {
        match self {
            Payload::Json { value } => value.to_string().len() as u64,
            Payload::Binary {
                bytes, data_uri, ..
            } => bytes.len() as u64 + data_uri.as_ref().map_or(0, |d| d.len() as u64),
        }
    }
}

/// Encode bytes as a `data:` URI
pub fn to_data_uri(content_type: Option<&str>, bytes: &[u8]) -> String {
    let mime = content_type.unwrap_or("application/octet-stream");
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

mod base64_bytes {
    use super::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Freshness
// =============================================================================

/// Validity of a record at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Within its time-to-live
    Fresh,
    /// Past its time-to-live; usable only as a stale fallback
    Stale,
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale)
    }
}

// =============================================================================
// Record
// =============================================================================

/// A single cache record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Key, unique within its collection
    pub key: String,
    /// Cached content
    pub payload: Payload,
    /// Write time
    pub cached_at: DateTime<Utc>,
    /// Time-to-live in milliseconds (None = never expires)
    pub ttl_ms: Option<u64>,
    /// Where binary content was downloaded from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl Record {
    /// Create a JSON record written now
    pub fn json(key: impl Into<String>, value: Value, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            payload: Payload::json(value),
            cached_at: Utc::now(),
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
            source_url: None,
        }
    }

    /// Create a binary record written now; binary records always keep their source URL
    pub fn binary(
        key: impl Into<String>,
        bytes: Bytes,
        content_type: Option<String>,
        source_url: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        let data_uri = Some(to_data_uri(content_type.as_deref(), &bytes));
        Self {
            key: key.into(),
            payload: Payload::Binary {
                bytes,
                content_type,
                data_uri,
            },
            cached_at: Utc::now(),
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
            source_url: Some(source_url.into()),
        }
    }

    /// Override the write time
    pub fn cached_at(mut self, at: DateTime<Utc>) -> Self {
        self.cached_at = at;
        self
    }

    /// Get the time-to-live
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    /// Age of the record at `now` (zero if written in the future)
    pub fn age_at(&self, now: DateTime<Utc>) -> ChronoDuration {
        let age = now.signed_duration_since(self.cached_at);
        if age < ChronoDuration::zero() {
            ChronoDuration::zero()
        } else {
            age
        }
    }

    /// Freshness at `now` against the record's own TTL
    pub fn freshness_at(&self, now: DateTime<Utc>) -> Freshness {
        self.freshness_with(self.ttl(), now)
    }

    /// Freshness at `now` against an explicit TTL; `now - cached_at <= ttl` is fresh
    pub fn freshness_with(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> Freshness {
        match ttl {
            None => Freshness::Fresh,
            Some(ttl) => {
                let age_ms = self.age_at(now).num_milliseconds().max(0) as u128;
                if age_ms <= ttl.as_millis() {
                    Freshness::Fresh
                } else {
                    Freshness::Stale
                }
            }
        }
    }

    /// Check the binary-source invariant
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.key.is_empty() {
            return Err("empty key".to_string());
        }
        if self.payload.is_binary() && self.source_url.is_none() {
            return Err("binary payload without source url".to_string());
        }
        Ok(())
    }

    /// Renderable form of a binary payload, re-derived from the bytes if needed
    pub fn renderable(&self) -> Option<String> {
        match &self.payload {
            Payload::Binary {
                bytes,
                content_type,
                data_uri,
            } => data_uri
                .clone()
                .or_else(|| (!bytes.is_empty()).then(|| to_data_uri(content_type.as_deref(), bytes)))
                .or_else(|| self.source_url.clone()),
            Payload::Json { .. } => None,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.cached_at.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn test_ttl_boundary() {
        let t0 = Utc::now();
        let record = Record::json("music_list", json!({"data": []}), Some(DAY)).cached_at(t0);
        let epsilon = ChronoDuration::milliseconds(1);
        let ttl = ChronoDuration::days(1);

        assert_eq!(record.freshness_at(t0 + ttl - epsilon), Freshness::Fresh);
        assert_eq!(record.freshness_at(t0 + ttl), Freshness::Fresh);
        assert_eq!(record.freshness_at(t0 + ttl + epsilon), Freshness::Stale);
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let record = Record::json("h", json!({}), None)
            .cached_at(Utc::now() - ChronoDuration::days(4000));
        assert_eq!(record.freshness_at(Utc::now()), Freshness::Fresh);
    }

    #[test]
    fn test_binary_keeps_source_url() {
        let record = Record::binary(
            "track.mp3",
            Bytes::from_static(b"\x89PNG"),
            Some("image/png".into()),
            "http://host/cover.png",
            Some(DAY),
        );
        assert!(record.validate().is_ok());
        assert_eq!(record.source_url.as_deref(), Some("http://host/cover.png"));
        assert!(record.renderable().unwrap().starts_with("data:image/png;base64,"));

        let mut broken = record.clone();
        broken.source_url = None;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_renderable_rederived_from_bytes() {
        let mut record = Record::binary(
            "t",
            Bytes::from_static(b"abc"),
            None,
            "http://host/c.jpg",
            None,
        );
        if let Payload::Binary { data_uri, .. } = &mut record.payload {
            *data_uri = None;
        }
        assert_eq!(
            record.renderable().as_deref(),
            Some("data:application/octet-stream;base64,YWJj")
        );

        if let Payload::Binary { bytes, .. } = &mut record.payload {
            *bytes = Bytes::new();
        }
        assert_eq!(record.renderable().as_deref(), Some("http://host/c.jpg"));
    }

    #[test]
    fn test_binary_payload_serde() {
        let record = Record::binary("k", Bytes::from_static(b"xyz"), None, "u", None);
        let encoded = serde_json::to_string(&record).unwrap();
        assert!(encoded.contains("eHl6"));
        let decoded: Record = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
