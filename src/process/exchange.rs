//! Exchange record processing: order-leg correlation, fee deduplication and
//! allocation, and row-type classification.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::record::{MovementDirection, NormalizedRecord};
use crate::model::transaction::Movements;
use crate::model::{
    AssetId, AssetMovement, Fee, FeeScope, FeeSettlement, Note, NoteSeverity, Operation,
    OperationCategory, OperationKind, Transaction, TransactionStatus, transaction_fingerprint,
};

use super::classify::classify;

/// Correlate and transform one source's exchange records. Trade rows sharing
/// an order id collapse into one transaction; ledger rows map one-to-one.
pub fn process_records(
    exchange: &str,
    records: &[NormalizedRecord],
) -> Result<Vec<Transaction>> {
    let mut orders: BTreeMap<String, Vec<&NormalizedRecord>> = BTreeMap::new();
    let mut singles: Vec<&NormalizedRecord> = Vec::new();

    for record in records {
        match order_id(record) {
            Some(order) => orders.entry(order).or_default().push(record),
            None => singles.push(record),
        }
    }

    let mut out = Vec::new();
    for (order, legs) in orders {
        out.push(correlate_order(exchange, &order, &legs)?);
    }
    for record in singles {
        out.push(ledger_row(exchange, record)?);
    }
    Ok(out)
}

fn order_id(record: &NormalizedRecord) -> Option<String> {
    record
        .extensions
        .get("order_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

// ── Order correlation ───────────────────────────────────────────────

/// Merge the legs of one order into a single trade transaction. Fees are
/// deduplicated across legs (an order-level fee repeated on every leg counts
/// once) then allocated across inflow assets.
fn correlate_order(
    exchange: &str,
    order: &str,
    legs: &[&NormalizedRecord],
) -> Result<Transaction> {
    let first = legs
        .first()
        .ok_or_else(|| Error::Internal("empty order group".to_string()))?;

    let mut inflows: BTreeMap<String, AssetMovement> = BTreeMap::new();
    let mut outflows: BTreeMap<String, AssetMovement> = BTreeMap::new();
    // Exact (asset, amount) duplicates across legs collapse.
    let mut fee_candidates: Vec<(String, Decimal)> = Vec::new();
    // Per-asset fiat value of inflow legs, for fee allocation weight.
    let mut inflow_value: BTreeMap<String, Decimal> = BTreeMap::new();

    for leg in legs {
        let leg_price = leg.extensions.get("price").and_then(|v| match v {
            Value::String(s) => s.parse::<Decimal>().ok(),
            Value::Number(n) => n.as_f64().and_then(|f| Decimal::try_from(f).ok()),
            _ => None,
        });
        for movement in &leg.movements {
            let symbol = movement.asset_symbol.to_uppercase();
            let target = match movement.direction {
                MovementDirection::In => &mut inflows,
                MovementDirection::Out => &mut outflows,
                MovementDirection::Neutral => continue,
            };
            let entry = target.entry(symbol.clone()).or_insert_with(|| {
                AssetMovement::new(
                    AssetId::exchange(exchange, &symbol),
                    &symbol,
                    Decimal::ZERO,
                )
            });
            entry.gross_amount += movement.amount;
            entry.net_amount += movement.amount;

            if movement.direction == MovementDirection::In {
                if let Some(price) = leg_price {
                    *inflow_value.entry(symbol).or_default() += movement.amount * price;
                }
            }
        }
        for fee in &leg.fees {
            let pair = (fee.asset_symbol.to_uppercase(), fee.amount);
            if !fee_candidates.contains(&pair) {
                fee_candidates.push(pair);
            }
        }
    }

    let movements = Movements {
        inflows: inflows.into_values().collect(),
        outflows: outflows.into_values().collect(),
    };
    let fees = allocate_fees(exchange, fee_candidates, &movements, &inflow_value);

    let hint = first.transaction_type_hint.clone();
    let (operation, note) = classify(&movements, hint.as_deref());

    let mut tx = base_transaction(exchange, order, first)?;
    tx.movements = movements;
    tx.fees = fees;
    tx.operation = operation;
    if let Some(note) = note {
        tx.notes.push(note);
    }
    Ok(tx)
}

/// Allocate collected platform fees. A single fee against several inflow
/// assets splits proportionally by fiat-value weight when per-leg values are
/// known, otherwise evenly by asset count.
fn allocate_fees(
    exchange: &str,
    candidates: Vec<(String, Decimal)>,
    movements: &Movements,
    inflow_value: &BTreeMap<String, Decimal>,
) -> Vec<Fee> {
    let total_by_asset: BTreeMap<String, Decimal> =
        candidates
            .into_iter()
            .fold(BTreeMap::new(), |mut acc, (asset, amount)| {
                *acc.entry(asset).or_default() += amount;
                acc
            });

    // Fee slices are emitted in inflow order so the lot matcher can map
    // each share to the asset whose basis it raises.
    let mut fees = Vec::new();
    for (asset, total) in total_by_asset {
        if movements.inflows.len() <= 1 {
            fees.push(platform_fee(exchange, &asset, total));
            continue;
        }
        let total_value: Decimal = inflow_value.values().copied().sum();
        for inflow in &movements.inflows {
            // Multiply before dividing so exact ratios stay exact.
            let share = if total_value > Decimal::ZERO {
                let value = inflow_value
                    .get(&inflow.asset_symbol)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                total * value / total_value
            } else {
                total / Decimal::from(movements.inflows.len() as i64)
            };
            if share.is_zero() {
                continue;
            }
            fees.push(platform_fee(exchange, &asset, share));
        }
    }
    fees
}

fn platform_fee(exchange: &str, asset: &str, amount: Decimal) -> Fee {
    Fee {
        asset_id: AssetId::exchange(exchange, asset),
        asset_symbol: asset.to_uppercase(),
        amount,
        scope: FeeScope::Platform,
        settlement: FeeSettlement::Balance,
        price_at_tx_time: None,
    }
}

// ── Ledger rows ─────────────────────────────────────────────────────

fn ledger_row(exchange: &str, record: &NormalizedRecord) -> Result<Transaction> {
    let mut tx = base_transaction(exchange, &record.external_id, record)?;

    let mut movements = Movements::default();
    for movement in &record.movements {
        let symbol = movement.asset_symbol.to_uppercase();
        let m = AssetMovement::new(AssetId::exchange(exchange, &symbol), &symbol, movement.amount);
        match movement.direction {
            MovementDirection::In => movements.inflows.push(m),
            MovementDirection::Out => movements.outflows.push(m),
            MovementDirection::Neutral => {}
        }
    }
    let fees: Vec<Fee> = record
        .fees
        .iter()
        .map(|f| Fee {
            asset_id: AssetId::exchange(exchange, &f.asset_symbol),
            asset_symbol: f.asset_symbol.to_uppercase(),
            amount: f.amount,
            scope: FeeScope::Platform,
            settlement: FeeSettlement::Balance,
            price_at_tx_time: None,
        })
        .collect();

    // A ledger entry whose amount equals its fee is a fee-only operation:
    // keep that classification, but flag it for downstream re-verification.
    let fee_only = !fees.is_empty()
        && movements.inflows.is_empty()
        && movements
            .outflows
            .iter()
            .zip(&fees)
            .all(|(m, f)| m.asset_symbol == f.asset_symbol && m.net_amount == f.amount);

    if fee_only {
        movements.outflows.clear();
        tx.operation = Operation::new(OperationCategory::Fee, OperationKind::Fee);
        tx.notes.push(Note::new(
            "FEE_ONLY_LEDGER_ROW",
            NoteSeverity::Info,
            "ledger amount equals fee; recorded as fee-only operation",
        ));
    } else {
        let (operation, note) = classify(&movements, record.transaction_type_hint.as_deref());
        tx.operation = operation;
        if let Some(note) = note {
            tx.notes.push(note);
        }
    }
    tx.movements = movements;
    tx.fees = fees;
    Ok(tx)
}

// ── Shared scaffolding ──────────────────────────────────────────────

fn base_transaction(
    exchange: &str,
    external_id: &str,
    record: &NormalizedRecord,
) -> Result<Transaction> {
    let fingerprint = transaction_fingerprint(exchange, external_id);
    let datetime = chrono::DateTime::from_timestamp_millis(record.timestamp_ms)
        .ok_or_else(|| Error::Validation(format!("timestamp {} out of range", record.timestamp_ms)))?;

    // Blockchain metadata rides along only when a non-empty hash is present.
    let blockchain = record.transaction_hash.as_deref().filter(|h| !h.is_empty()).map(|hash| {
        crate::model::transaction::BlockchainInfo {
            name: record
                .extensions
                .get("network")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            block_height: record.block_height,
            transaction_hash: hash.to_string(),
            is_confirmed: true,
        }
    });

    Ok(Transaction {
        id: format!("tx_{}", &fingerprint[..24]),
        source: exchange.to_string(),
        external_id: external_id.to_string(),
        fingerprint,
        datetime,
        timestamp_ms: record.timestamp_ms,
        status: match record.status {
            crate::model::RecordStatus::Success => TransactionStatus::Success,
            crate::model::RecordStatus::Failed => TransactionStatus::Failed,
            crate::model::RecordStatus::Pending => TransactionStatus::Pending,
        },
        from: None,
        to: None,
        movements: Movements::default(),
        fees: Vec::new(),
        operation: Operation::new(OperationCategory::Other, OperationKind::Transfer),
        blockchain,
        notes: Vec::new(),
    })
}
