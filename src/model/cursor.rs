use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// What the primary cursor value indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    Timestamp,
    BlockNumber,
    PageToken,
    Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPrimary {
    pub kind: CursorKind,
    pub value: Value,
}

impl CursorPrimary {
    pub fn timestamp(ms: i64) -> Self {
        Self {
            kind: CursorKind::Timestamp,
            value: Value::from(ms),
        }
    }

    pub fn block_number(height: u64) -> Self {
        Self {
            kind: CursorKind::BlockNumber,
            value: Value::from(height),
        }
    }

    pub fn page_token(token: &str) -> Self {
        Self {
            kind: CursorKind::PageToken,
            value: Value::from(token),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.value.as_u64()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value.as_i64()
    }
}

/// Resumable position for one (source, operation type) stream.
///
/// A cursor authored by one provider may be replayed on another provider of
/// the same chain only after that provider's replay window has been applied;
/// `metadata` keeps provider-private fields alongside the shared envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub primary: CursorPrimary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transaction_id: Option<String>,
    pub total_fetched: u64,
    pub provider_name: String,
    pub updated_at: DateTime<Utc>,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Cursor {
    pub fn new(primary: CursorPrimary, provider_name: &str) -> Self {
        Self {
            primary,
            last_transaction_id: None,
            total_fetched: 0,
            provider_name: provider_name.to_string(),
            updated_at: Utc::now(),
            is_complete: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Cursor map keyed by operation type, as persisted on an import session.
pub type CursorMap = BTreeMap<String, Cursor>;
