//! Append-only override log and deterministic replay.
//!
//! User decisions (confirm/reject a link, set a manual price) are appended
//! as JSON lines keyed by transaction fingerprints — never database ids —
//! so they survive re-ingestion. Replay runs after the matcher and the
//! enrichment engine, applies events in `created_at` order (ties broken by
//! id), and is idempotent. Events whose fingerprints are not in the current
//! data set are preserved and reported, never discarded.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::price::SOURCE_MANUAL;
use crate::model::{LinkStatus, PriceGranularity, PriceRecord};
use crate::store::IngestionStore;

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum OverridePayload {
    /// Confirm the link between two transactions for one asset.
    Link {
        source_fingerprint: String,
        target_fingerprint: String,
        asset_symbol: String,
    },
    /// Reject that link.
    Unlink {
        source_fingerprint: String,
        target_fingerprint: String,
        asset_symbol: String,
    },
    /// Pin a manual price on one movement.
    Price {
        transaction_fingerprint: String,
        asset_symbol: String,
        price: Decimal,
        currency: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEvent {
    pub id: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: OverridePayload,
}

impl OverrideEvent {
    pub fn new(actor: &str, payload: OverridePayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            created_at: Utc::now(),
            payload,
        }
    }
}

// ── Log ─────────────────────────────────────────────────────────────

pub struct OverrideLog {
    path: PathBuf,
}

impl OverrideLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn append(&self, event: &OverrideEvent) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Load all events in deterministic replay order: `created_at`, then id
    /// lexicographically. Unparseable lines are an error — a corrupt log
    /// must not be silently half-applied.
    pub fn load(&self) -> Result<Vec<OverrideEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: OverrideEvent = serde_json::from_str(line).map_err(|e| {
                Error::Validation(format!(
                    "override log line {}: {e}",
                    line_num + 1
                ))
            })?;
            events.push(event);
        }
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

// ── Replay ──────────────────────────────────────────────────────────

#[derive(Debug, Default, serde::Serialize)]
pub struct ReplayReport {
    pub applied: usize,
    pub noop: usize,
    /// Events whose fingerprints are not present in the current data set;
    /// kept for the next replay.
    pub unresolved: usize,
}

/// Apply all overrides against the store. Safe to run repeatedly.
pub async fn replay(log: &OverrideLog, store: &IngestionStore) -> Result<ReplayReport> {
    let events = log.load()?;
    let mut report = ReplayReport::default();

    for event in events {
        match apply_one(&event, store).await? {
            Applied::Changed => report.applied += 1,
            Applied::Noop => report.noop += 1,
            Applied::Unresolved => {
                debug!(id = %event.id, "override target not in current data set");
                report.unresolved += 1;
            }
        }
    }
    if report.unresolved > 0 {
        warn!(
            unresolved = report.unresolved,
            "overrides preserved for transactions not currently ingested"
        );
    }
    Ok(report)
}

enum Applied {
    Changed,
    Noop,
    Unresolved,
}

async fn apply_one(event: &OverrideEvent, store: &IngestionStore) -> Result<Applied> {
    match &event.payload {
        OverridePayload::Link {
            source_fingerprint,
            target_fingerprint,
            asset_symbol,
        } => {
            apply_link_status(
                event,
                store,
                source_fingerprint,
                target_fingerprint,
                asset_symbol,
                LinkStatus::Confirmed,
            )
            .await
        }
        OverridePayload::Unlink {
            source_fingerprint,
            target_fingerprint,
            asset_symbol,
        } => {
            apply_link_status(
                event,
                store,
                source_fingerprint,
                target_fingerprint,
                asset_symbol,
                LinkStatus::Rejected,
            )
            .await
        }
        OverridePayload::Price {
            transaction_fingerprint,
            asset_symbol,
            price,
            currency,
        } => {
            let Some(mut tx) = store
                .get_transaction_by_fingerprint(transaction_fingerprint)
                .await?
            else {
                return Ok(Applied::Unresolved);
            };
            let mut changed = false;
            let mut found = false;
            for movement in tx.movements_mut() {
                if !movement.asset_symbol.eq_ignore_ascii_case(asset_symbol) {
                    continue;
                }
                found = true;
                let already = movement
                    .price_at_tx_time
                    .as_ref()
                    .map(|p| p.source == SOURCE_MANUAL && p.price == *price)
                    .unwrap_or(false);
                if already {
                    continue;
                }
                // Manual prices take precedence over every derived source.
                let Some(record) = PriceRecord::new(
                    *price,
                    currency,
                    SOURCE_MANUAL,
                    PriceGranularity::Exact,
                    event.created_at,
                ) else {
                    return Err(Error::Validation(format!(
                        "override {} carries non-positive price",
                        event.id
                    )));
                };
                movement.price_at_tx_time = Some(record);
                changed = true;
            }
            if !found {
                return Ok(Applied::Unresolved);
            }
            if changed {
                store.save_transactions(std::slice::from_ref(&tx)).await?;
                Ok(Applied::Changed)
            } else {
                Ok(Applied::Noop)
            }
        }
    }
}

async fn apply_link_status(
    event: &OverrideEvent,
    store: &IngestionStore,
    source_fingerprint: &str,
    target_fingerprint: &str,
    asset_symbol: &str,
    status: LinkStatus,
) -> Result<Applied> {
    let fingerprint =
        crate::model::link_fingerprint(source_fingerprint, target_fingerprint, asset_symbol);
    let Some(link) = store.get_link(&fingerprint).await? else {
        return Ok(Applied::Unresolved);
    };
    if link.status == status {
        return Ok(Applied::Noop);
    }
    // Replay order is created_at order, so a later decision overrides an
    // earlier one deterministically.
    store
        .update_link_status(&fingerprint, status, &event.actor)
        .await?;
    Ok(Applied::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn log_in_tempdir() -> (tempfile::TempDir, OverrideLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = OverrideLog::new(&dir.path().join("overrides.jsonl"));
        (dir, log)
    }

    #[test]
    fn append_then_load_round_trips_in_order() {
        let (_dir, log) = log_in_tempdir();
        let mut first = OverrideEvent::new(
            "alice",
            OverridePayload::Price {
                transaction_fingerprint: "fp1".to_string(),
                asset_symbol: "BTC".to_string(),
                price: dec!(50000),
                currency: "USD".to_string(),
            },
        );
        let mut second = first.clone();
        second.id = "zzz".to_string();
        first.id = "aaa".to_string();
        // Same timestamp: id breaks the tie.
        second.created_at = first.created_at;

        log.append(&second).unwrap();
        log.append(&first).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "aaa");
        assert_eq!(loaded[1].id, "zzz");
    }

    #[test]
    fn corrupt_line_is_an_error() {
        let (_dir, log) = log_in_tempdir();
        std::fs::write(&log.path, "not json\n").unwrap();
        assert!(matches!(log.load(), Err(Error::Validation(_))));
    }

    #[test]
    fn missing_file_loads_empty() {
        let (_dir, log) = log_in_tempdir();
        assert!(log.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn price_override_applies_once_and_is_idempotent() {
        let store = IngestionStore::open_in_memory().unwrap();
        let tx = crate::process::exchange::process_records(
            "kraken",
            &[ledger_record("L1", dec!(1))],
        )
        .unwrap()
        .remove(0);
        let fp = tx.fingerprint.clone();
        store.save_transactions(&[tx]).await.unwrap();

        let (_dir, log) = log_in_tempdir();
        log.append(&OverrideEvent::new(
            "alice",
            OverridePayload::Price {
                transaction_fingerprint: fp.clone(),
                asset_symbol: "BTC".to_string(),
                price: dec!(48000),
                currency: "USD".to_string(),
            },
        ))
        .unwrap();

        let first = replay(&log, &store).await.unwrap();
        assert_eq!(first.applied, 1);
        let second = replay(&log, &store).await.unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.noop, 1);

        let stored = store.get_transaction_by_fingerprint(&fp).await.unwrap().unwrap();
        let price = stored.movements.inflows[0].price_at_tx_time.as_ref().unwrap();
        assert_eq!(price.price, dec!(48000));
        assert_eq!(price.source, SOURCE_MANUAL);
    }

    #[tokio::test]
    async fn unresolved_overrides_are_preserved() {
        let store = IngestionStore::open_in_memory().unwrap();
        let (_dir, log) = log_in_tempdir();
        log.append(&OverrideEvent::new(
            "alice",
            OverridePayload::Price {
                transaction_fingerprint: "no-such-fingerprint".to_string(),
                asset_symbol: "BTC".to_string(),
                price: dec!(1),
                currency: "USD".to_string(),
            },
        ))
        .unwrap();

        let report = replay(&log, &store).await.unwrap();
        assert_eq!(report.unresolved, 1);
        // Still in the log for next time.
        assert_eq!(log.load().unwrap().len(), 1);
    }

    fn ledger_record(id: &str, amount: Decimal) -> crate::model::NormalizedRecord {
        use crate::model::record::{MovementDirection, NormalizedMovement};
        crate::model::NormalizedRecord {
            external_id: id.to_string(),
            provider_name: "csv:kraken".to_string(),
            timestamp_ms: 1_700_000_000_000,
            status: crate::model::RecordStatus::Success,
            from: None,
            to: None,
            movements: vec![NormalizedMovement {
                asset_symbol: "BTC".to_string(),
                contract_address: None,
                amount,
                direction: MovementDirection::In,
                is_token: false,
                possible_spam: false,
                counterparty: None,
            }],
            fees: Vec::new(),
            operation_type: "ledger".to_string(),
            transaction_hash: None,
            block_height: None,
            source_address: None,
            transaction_type_hint: Some("deposit".to_string()),
            extensions: serde_json::Value::Null,
        }
    }
}
