//! Streaming importers: one per source kind.
//!
//! An importer is a pull-based producer of batches, each carrying the raw
//! records, their normalized forms, a durable cursor, and the operation type
//! the batch belongs to. The orchestrator checkpoints the cursor after
//! persisting each batch, so an interrupted import resumes at the last
//! batch boundary.

pub mod blockchain;
pub mod csv;
pub mod exchange;
pub mod xpub;

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::cursor::CursorMap;
use crate::model::{Cursor, NormalizedRecord, RawRecord};

// ── Parameters ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Import inputs. Which fields matter depends on the source: blockchain
/// importers need `address`, xpub importers derive `addresses`, CSV
/// importers read `csv_directories`, exchange importers need `credentials`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub csv_directories: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until_ms: Option<i64>,
    /// Prior cursor state keyed by operation type, for resume.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub cursors: CursorMap,
}

/// The parameter fields that identify "the same import" for session
/// shortcutting; cursors are resume state, not identity.
pub fn params_identity(params: &ImportParams) -> serde_json::Value {
    serde_json::json!({
        "address": params.address,
        "addresses": params.addresses,
        "csv_directories": params.csv_directories,
        "since_ms": params.since_ms,
        "until_ms": params.until_ms,
    })
}

// ── Batches ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ImportStats {
    pub fetched: usize,
    pub invalid: usize,
    pub deduplicated: usize,
}

/// One unit of importer output. `raw_records` and `normalized_records` are
/// index-aligned.
#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub raw_records: Vec<RawRecord>,
    pub normalized_records: Vec<NormalizedRecord>,
    pub cursor: Cursor,
    pub operation_type: String,
    pub is_complete: bool,
    pub stats: ImportStats,
}

pub type ImportStream = Pin<Box<dyn Stream<Item = Result<ImportBatch>> + Send>>;

// ── Importer contract ───────────────────────────────────────────────

#[async_trait]
pub trait Importer: Send + Sync {
    /// Stable identifier of the source this importer reads (chain name,
    /// exchange name, csv source label).
    fn source_id(&self) -> &str;

    fn validate_params(&self, params: &ImportParams) -> Result<()>;

    /// Produce the batch stream. Implementations honor `cancel` at every
    /// batch boundary and resume from `params.cursors` when present.
    fn import_streaming(&self, params: ImportParams, cancel: CancelToken) -> ImportStream;
}
