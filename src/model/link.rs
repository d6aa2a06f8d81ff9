use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Suggested,
    Confirmed,
    Rejected,
}

impl LinkStatus {
    /// Confirmed and rejected are terminal; re-running the matcher never
    /// moves a link out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Confirmed | LinkStatus::Rejected)
    }
}

/// Criteria that produced a suggested link, kept for review display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCriteria {
    pub asset_match: String,
    pub amount_similarity: Decimal,
    pub timing_factor: Decimal,
    pub gap_hours: Decimal,
}

/// A directed pairing of a withdrawal on one source with a deposit on
/// another. Direction is source → target by timestamp; the source amount is
/// never smaller than the target amount (fees are lost in transit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub fingerprint: String,
    pub source_transaction_id: String,
    pub target_transaction_id: String,
    pub asset_symbol: String,
    pub source_amount: Decimal,
    pub target_amount: Decimal,
    pub link_type: String,
    pub confidence_score: Decimal,
    pub match_criteria: MatchCriteria,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
}
