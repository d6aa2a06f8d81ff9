//! Cross-source transaction linking: pair a withdrawal on one source with
//! the deposit it became on another.
//!
//! The matcher only ever produces suggestions; confirming or rejecting is a
//! user decision (or an override replay). A link whose status is terminal is
//! never touched by re-running the matcher.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::model::{
    Link, LinkStatus, Transaction, link_fingerprint,
    link::MatchCriteria,
};

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Largest fraction of the source amount that may be lost in transit
    /// (network fees, exchange skim).
    pub max_loss: Decimal,
    /// Largest fraction the target may exceed the source by (rounding,
    /// airdropped dust on arrival).
    pub max_gain: Decimal,
    /// Transfer window: the deposit must land within this many hours.
    pub max_gap_hours: i64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_loss: Decimal::new(5, 2),     // 0.05
            max_gain: Decimal::new(1, 3),     // 0.001
            max_gap_hours: 72,
        }
    }
}

/// Suggestions below this confidence are discarded outright.
const MIN_CONFIDENCE: Decimal = Decimal::from_parts(6, 0, 0, false, 1); // 0.6

/// At or above this confidence a suggestion is flagged high-confidence.
pub const HIGH_CONFIDENCE: Decimal = Decimal::from_parts(95, 0, 0, false, 2); // 0.95

// ── Matcher ─────────────────────────────────────────────────────────

pub struct LinkMatcher {
    config: MatcherConfig,
}

#[derive(Debug)]
struct Candidate<'a> {
    target: &'a Transaction,
    target_amount: Decimal,
    confidence: Decimal,
    criteria: MatchCriteria,
    gap_ms: i64,
    amount_delta: Decimal,
}

impl LinkMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Propose links for a transaction set. Transactions already linked (as
    /// source or target of `existing`) are not re-matched.
    pub fn run(&self, transactions: &[Transaction], existing: &[Link]) -> Vec<Link> {
        let taken: HashSet<&str> = existing
            .iter()
            .filter(|l| l.status != LinkStatus::Rejected)
            .flat_map(|l| {
                [
                    l.source_transaction_id.as_str(),
                    l.target_transaction_id.as_str(),
                ]
            })
            .collect();

        let mut links = Vec::new();
        let mut used_targets: HashSet<String> = HashSet::new();
        for source_tx in transactions {
            if taken.contains(source_tx.id.as_str()) {
                continue;
            }
            for outflow in &source_tx.movements.outflows {
                let Some(best) = self.best_candidate(source_tx, outflow.net_amount, &outflow.asset_symbol, transactions, &taken)
                else {
                    continue;
                };
                // One deposit covers one withdrawal per run.
                if !used_targets.insert(best.target.id.clone()) {
                    continue;
                }
                let fingerprint = link_fingerprint(
                    &source_tx.fingerprint,
                    &best.target.fingerprint,
                    &outflow.asset_symbol,
                );
                debug!(
                    source = %source_tx.id,
                    target = %best.target.id,
                    asset = %outflow.asset_symbol,
                    confidence = %best.confidence,
                    "link suggested"
                );
                links.push(Link {
                    id: format!("ln_{}", &fingerprint[..24]),
                    fingerprint,
                    source_transaction_id: source_tx.id.clone(),
                    target_transaction_id: best.target.id.clone(),
                    asset_symbol: outflow.asset_symbol.clone(),
                    source_amount: outflow.net_amount,
                    target_amount: best.target_amount,
                    link_type: "transfer".to_string(),
                    confidence_score: best.confidence,
                    match_criteria: best.criteria,
                    status: LinkStatus::Suggested,
                    reviewed_by: None,
                    reviewed_at: None,
                });
            }
        }
        links
    }

    /// Search inflow transactions on other sources for the best match.
    fn best_candidate<'a>(
        &self,
        source_tx: &Transaction,
        source_amount: Decimal,
        asset_symbol: &str,
        transactions: &'a [Transaction],
        taken: &HashSet<&str>,
    ) -> Option<Candidate<'a>> {
        if source_amount <= Decimal::ZERO {
            return None;
        }
        let lower = source_amount * (Decimal::ONE - self.config.max_loss);
        let upper = source_amount * (Decimal::ONE + self.config.max_gain);
        let max_gap_ms = self.config.max_gap_hours * 3_600_000;

        let mut best: Option<Candidate<'a>> = None;
        for target in transactions {
            if target.source == source_tx.source || taken.contains(target.id.as_str()) {
                continue;
            }
            let gap_ms = target.timestamp_ms - source_tx.timestamp_ms;
            if gap_ms <= 0 || gap_ms > max_gap_ms {
                continue;
            }
            for inflow in &target.movements.inflows {
                if !inflow.asset_symbol.eq_ignore_ascii_case(asset_symbol) {
                    continue;
                }
                if inflow.net_amount < lower || inflow.net_amount > upper {
                    continue;
                }
                let candidate = self.score(
                    source_amount,
                    inflow.net_amount,
                    gap_ms,
                    max_gap_ms,
                    inflow.asset_symbol == asset_symbol,
                    target,
                );
                if candidate.confidence < MIN_CONFIDENCE {
                    continue;
                }
                best = match best.take() {
                    None => Some(candidate),
                    Some(current) => Some(pick_better(current, candidate)),
                };
            }
        }
        best
    }

    /// Confidence is a weighted product of asset match, amount similarity,
    /// and timing.
    fn score<'a>(
        &self,
        source_amount: Decimal,
        target_amount: Decimal,
        gap_ms: i64,
        max_gap_ms: i64,
        exact_symbol: bool,
        target: &'a Transaction,
    ) -> Candidate<'a> {
        let asset_match = if exact_symbol {
            Decimal::ONE
        } else {
            Decimal::new(9, 1) // 0.9 for case-normalized match
        };
        let loss = (source_amount - target_amount).abs();
        let amount_similarity = Decimal::ONE - loss / source_amount;
        let gap_hours = Decimal::from_i64(gap_ms).unwrap_or_default()
            / Decimal::from_i64(3_600_000).unwrap_or(Decimal::ONE);
        let max_gap_hours = Decimal::from(self.config.max_gap_hours);
        let timing_factor = Decimal::ONE - (gap_hours / max_gap_hours);
        let confidence =
            (asset_match * amount_similarity * timing_factor).clamp(Decimal::ZERO, Decimal::ONE);

        Candidate {
            target,
            target_amount,
            confidence,
            criteria: MatchCriteria {
                asset_match: if exact_symbol { "exact" } else { "normalized" }.to_string(),
                amount_similarity,
                timing_factor,
                gap_hours,
            },
            gap_ms,
            amount_delta: loss,
        }
    }
}

/// Tie-break: higher confidence, then earlier target, then smaller delta.
fn pick_better<'a>(a: Candidate<'a>, b: Candidate<'a>) -> Candidate<'a> {
    if b.confidence != a.confidence {
        return if b.confidence > a.confidence { b } else { a };
    }
    if b.gap_ms != a.gap_ms {
        return if b.gap_ms < a.gap_ms { b } else { a };
    }
    if b.amount_delta < a.amount_delta { b } else { a }
}

// ── Gap analysis ────────────────────────────────────────────────────

/// Read-only coverage report grouped by asset.
#[derive(Debug, Default, serde::Serialize)]
pub struct GapReport {
    /// Inflows with no corresponding outflow anywhere: funds appeared.
    pub uncovered_inflows: BTreeMap<String, Vec<String>>,
    /// Outflows never matched to an inflow: funds left and vanished.
    pub unmatched_outflows: BTreeMap<String, Vec<String>>,
}

pub fn gap_report(transactions: &[Transaction], links: &[Link]) -> GapReport {
    let linked_targets: HashSet<&str> = links
        .iter()
        .filter(|l| l.status != LinkStatus::Rejected)
        .map(|l| l.target_transaction_id.as_str())
        .collect();
    let linked_sources: HashSet<&str> = links
        .iter()
        .filter(|l| l.status != LinkStatus::Rejected)
        .map(|l| l.source_transaction_id.as_str())
        .collect();

    let mut report = GapReport::default();
    for tx in transactions {
        // Deposits from nowhere: inflow transfer transactions not covered by
        // a link. Trades exchange value internally and are not gaps.
        if tx.operation.category == crate::model::OperationCategory::Transfer {
            for inflow in &tx.movements.inflows {
                if !linked_targets.contains(tx.id.as_str()) {
                    report
                        .uncovered_inflows
                        .entry(inflow.asset_symbol.clone())
                        .or_default()
                        .push(tx.id.clone());
                }
            }
            for outflow in &tx.movements.outflows {
                if !linked_sources.contains(tx.id.as_str()) {
                    report
                        .unmatched_outflows
                        .entry(outflow.asset_symbol.clone())
                        .or_default()
                        .push(tx.id.clone());
                }
            }
        }
    }
    report
}
