//! One cached value: gzip-compressed JSON plus its storage time and TTL.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::CacheError;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    payload: Arc<[u8]>,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn encode<T: Serialize + ?Sized>(
        value: &T,
        stored_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        let json = serde_json::to_vec(value).map_err(|e| CacheError::Encode(e.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;
        Ok(Self {
            payload: compressed.into(),
            stored_at,
            ttl,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        let mut json = Vec::new();
        GzDecoder::new(&self.payload[..])
            .read_to_end(&mut json)
            .map_err(|e| CacheError::Decode(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| CacheError::Decode(e.to_string()))
    }

    /// Expired strictly after `stored_at + ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
            .map_or(false, |expires_at| now > expires_at)
    }

    pub fn compressed_len(&self) -> usize {
        self.payload.len()
    }

    pub(super) fn to_stored(&self) -> StoredEntry {
        StoredEntry {
            stored_at: self.stored_at,
            ttl_ms: Some(u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)),
            ttl_secs: None,
            payload: STANDARD.encode(&self.payload),
        }
    }

    pub(super) fn from_stored(stored: StoredEntry) -> Result<Self, CacheError> {
        let payload = STANDARD
            .decode(stored.payload.as_bytes())
            .map_err(|e| CacheError::Decode(e.to_string()))?;
        Ok(Self {
            payload: payload.into(),
            stored_at: stored.stored_at,
            ttl: stored
                .ttl_ms
                .map(Duration::from_millis)
                .or(stored.ttl_secs.map(Duration::from_secs))
                .unwrap_or(Duration::ZERO),
        })
    }
}

/// On-disk form of an entry. Unknown fields are ignored on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(super) struct StoredEntry {
    pub stored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Written by older builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    pub payload: String,
}
