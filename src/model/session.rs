use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cursor::CursorMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Started)
    }
}

/// One run of an import with its parameters, status, and per-operation
/// cursors. Status transitions `started → {completed, failed, cancelled}`
/// and is terminal thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: String,
    pub source_id: String,
    pub source_type: String,
    pub status: SessionStatus,
    pub import_params: Value,
    #[serde(default)]
    pub cursors: CursorMap,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub verification_metadata: Value,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportSession {
    pub fn new(source_id: &str, source_type: &str, import_params: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            source_type: source_type.to_string(),
            status: SessionStatus::Started,
            import_params,
            cursors: CursorMap::new(),
            verification_metadata: Value::Null,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}
