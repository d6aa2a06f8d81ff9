use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::fingerprint::transaction_fingerprint;

/// One provider response item, exactly as received, plus envelope. Immutable
/// after insert; the normalized form is derived from it and re-validated as
/// schemas evolve, but the raw payload is the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub provider_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,
    pub fingerprint: String,
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Failed,
    Pending,
}

/// Direction hint carried on a normalized movement, before fund-flow
/// analysis decides the user-perspective direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementDirection {
    In,
    Out,
    Neutral,
}

/// An asset delta observed in a normalized record. `contract_address` is
/// absent for native-currency movements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMovement {
    pub asset_symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    pub amount: Decimal,
    pub direction: MovementDirection,
    /// True when the provider typed this as a token transfer rather than a
    /// native-currency movement.
    #[serde(default)]
    pub is_token: bool,
    #[serde(default)]
    pub possible_spam: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFee {
    pub asset_symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    pub amount: Decimal,
    /// Address that paid the fee, when the provider reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default)]
    pub is_network: bool,
}

/// Provider-specific record that has passed schema validation. Required
/// fields are uniform; source-kind extensions ride in `extensions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub external_id: String,
    pub provider_name: String,
    pub timestamp_ms: i64,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub movements: Vec<NormalizedMovement>,
    #[serde(default)]
    pub fees: Vec<NormalizedFee>,
    /// Operation type this record was fetched under (`native`,
    /// `token_transfers`, `ledger`, ...).
    pub operation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,
    /// Provider-declared hint (`swap`, `stake`, method name) used by
    /// classification; never trusted for direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_type_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extensions: Value,
}

impl NormalizedRecord {
    pub fn fingerprint(&self, source: &str) -> String {
        transaction_fingerprint(source, &self.external_id)
    }
}
