//! Core feed record model and the required-field contract for phishfeed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "phishfeed-core";

/// Keys every feed item must carry before it is allowed anywhere near the store.
pub const REQUIRED_FIELDS: [&str; 12] = [
    "id",
    "url",
    "brand",
    "confidence",
    "status",
    "discoveredAt",
    "createdAt",
    "updatedAt",
    "ip",
    "asn",
    "metadata",
    "tld",
];

/// Raw JSON object for one feed item, as found inside a shard's `data` array.
pub type Candidate = Map<String, Value>;

/// One phishing report from the feed.
///
/// Key presence is the whole contract. Values are kept exactly as the feed sent
/// them, so a `null` brand or a string confidence is stored rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub id: i64,
    pub url: Value,
    pub brand: Value,
    pub confidence: Value,
    pub status: Value,
    pub discovered_at: Value,
    pub created_at: Value,
    pub updated_at: Value,
    pub ip: Value,
    pub asn: Value,
    pub metadata: Value,
    pub tld: Value,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("record {id} is missing required fields: {}", .fields.join(", "))]
    MissingFields { id: String, fields: Vec<&'static str> },
}

/// Returns the required keys absent from `candidate`, in contract order.
pub fn missing_fields(candidate: &Candidate) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| !candidate.contains_key(*field))
        .collect()
}

pub fn is_valid(candidate: &Candidate) -> bool {
    missing_fields(candidate).is_empty()
}

/// Display form of a candidate's id for log lines, tolerant of a missing id.
pub fn candidate_label(candidate: &Candidate) -> String {
    match candidate.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unknown id".to_string(),
    }
}

impl FeedRecord {
    /// Checks that every required key is present, then takes the values as-is.
    /// `id` is the integer id the shard decoder already extracted.
    pub fn from_candidate(id: i64, mut candidate: Candidate) -> Result<Self, ValidationError> {
        let missing = missing_fields(&candidate);
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields {
                id: candidate_label(&candidate),
                fields: missing,
            });
        }
        let mut take = |key: &str| candidate.remove(key).unwrap_or(Value::Null);
        Ok(Self {
            id,
            url: take("url"),
            brand: take("brand"),
            confidence: take("confidence"),
            status: take("status"),
            discovered_at: take("discoveredAt"),
            created_at: take("createdAt"),
            updated_at: take("updatedAt"),
            ip: take("ip"),
            asn: take("asn"),
            metadata: take("metadata"),
            tld: take("tld"),
        })
    }

    pub fn is_exempt(&self, exempt_brand: &str) -> bool {
        self.brand.as_str() == Some(exempt_brand)
    }

    /// JSON text persisted for an opaque column.
    pub fn json_text(value: &Value) -> String {
        value.to_string()
    }
}

/// Whether a failed operation is worth repeating after a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_io_error(err: &std::io::Error) -> RetryDisposition {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::Interrupted
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}
