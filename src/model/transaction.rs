use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::asset::AssetId;
use super::price::PriceRecord;

// ── Status & operation taxonomy ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    Trade,
    Transfer,
    Staking,
    Fee,
    Reward,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Buy,
    Sell,
    Swap,
    Deposit,
    Withdrawal,
    Stake,
    Unstake,
    Reward,
    Fee,
    Transfer,
    Airdrop,
    Mint,
    Burn,
}

/// What the transaction did, from the user's accounting perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub category: OperationCategory,
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(category: OperationCategory, kind: OperationKind) -> Self {
        Self { category, kind }
    }
}

// ── Movements & fees ────────────────────────────────────────────────

/// One credit or debit of one asset within a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMovement {
    pub asset_id: AssetId,
    pub asset_symbol: String,
    pub gross_amount: Decimal,
    pub net_amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_at_tx_time: Option<PriceRecord>,
}

impl AssetMovement {
    pub fn new(asset_id: AssetId, symbol: &str, amount: Decimal) -> Self {
        Self {
            asset_id,
            asset_symbol: symbol.to_uppercase(),
            gross_amount: amount,
            net_amount: amount,
            price_at_tx_time: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Movements {
    pub inflows: Vec<AssetMovement>,
    pub outflows: Vec<AssetMovement>,
}

impl Movements {
    pub fn is_empty(&self) -> bool {
        self.inflows.is_empty() && self.outflows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeScope {
    /// Charged by the platform (exchange commission, protocol fee).
    Platform,
    /// Paid to the chain (gas, miner fee).
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSettlement {
    /// Deducted from a tracked balance.
    Balance,
    /// Settled outside the tracked balances.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub asset_id: AssetId,
    pub asset_symbol: String,
    pub amount: Decimal,
    pub scope: FeeScope,
    pub settlement: FeeSettlement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_at_tx_time: Option<PriceRecord>,
}

// ── Notes ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSeverity {
    Info,
    Warning,
    Error,
}

/// A warning attached to a transaction (scam suspected, dust, ambiguous
/// classification). Notes never remove data; they flag it for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note_type: String,
    pub severity: NoteSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl Note {
    pub fn new(note_type: &str, severity: NoteSeverity, message: impl Into<String>) -> Self {
        Self {
            note_type: note_type.to_string(),
            severity,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

// ── Canonical transaction ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    pub transaction_hash: String,
    pub is_confirmed: bool,
}

/// The accounting-grade form of a transaction, produced by the processor and
/// enriched in place by the price engine and link matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub source: String,
    pub external_id: String,
    pub fingerprint: String,
    pub datetime: DateTime<Utc>,
    pub timestamp_ms: i64,
    pub status: TransactionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub movements: Movements,
    pub fees: Vec<Fee>,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<BlockchainInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

impl Transaction {
    /// True when the transaction carries no accounting impact at all.
    pub fn is_zero_impact(&self) -> bool {
        self.movements.is_empty() && self.fees.is_empty()
    }

    /// All movements, inflows first, as mutable references. Enrichment stages
    /// walk this to fill `price_at_tx_time`.
    pub fn movements_mut(&mut self) -> impl Iterator<Item = &mut AssetMovement> {
        self.movements
            .inflows
            .iter_mut()
            .chain(self.movements.outflows.iter_mut())
    }
}
