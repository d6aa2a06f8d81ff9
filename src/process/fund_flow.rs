//! Fund-flow analysis: classify each asset movement in a transaction group
//! from the user's perspective.

use std::collections::{BTreeMap, HashSet};

use rust_decimal::Decimal;

use crate::error::{Error, Result};
use crate::model::record::{MovementDirection, NormalizedRecord};
use crate::model::transaction::Movements;
use crate::model::{AssetId, AssetMovement, Fee, FeeScope, FeeSettlement};

/// Aggregated flow for one transaction group.
#[derive(Debug, Default)]
pub struct FundFlow {
    pub movements: Movements,
    pub fees: Vec<Fee>,
    /// True when the user initiated the transaction (there are outflows, or
    /// the user is the sender).
    pub user_initiated: bool,
}

/// Key under which movements of the same asset merge.
fn asset_key(symbol: &str, contract: &Option<String>) -> String {
    match contract {
        Some(c) => format!("c:{}", c.to_lowercase()),
        None => format!("s:{}", symbol.to_uppercase()),
    }
}

/// Resolve the canonical asset id for a movement observed on `chain`.
///
/// Native-currency movements resolve to `blockchain:<chain>:native`; a
/// secondary native currency (no contract, not the chain's primary symbol)
/// resolves by lower-cased symbol. A token-typed movement without a contract
/// address is a hard error, never coerced.
pub fn resolve_asset_id(
    chain: &str,
    native_symbol: &str,
    symbol: &str,
    contract: &Option<String>,
    is_token: bool,
) -> Result<AssetId> {
    match contract {
        Some(c) if !c.is_empty() => Ok(AssetId::token(chain, c)),
        _ if is_token => Err(Error::Validation(format!(
            "token movement {symbol} on {chain} lacks a contract address"
        ))),
        _ if symbol.eq_ignore_ascii_case(native_symbol) => Ok(AssetId::native(chain)),
        _ => Ok(AssetId::token(chain, symbol)),
    }
}

/// Analyze one group of normalized records sharing a transaction hash.
///
/// `user_addresses` must be lower-cased. Direction comes from the observed
/// balance-change hint relative to the queried address; records whose
/// source address is outside the set are ignored (they describe someone
/// else's view of the transaction).
pub fn analyze(
    chain: &str,
    native_symbol: &str,
    records: &[&NormalizedRecord],
    user_addresses: &HashSet<String>,
) -> Result<FundFlow> {
    let mut inflows: BTreeMap<String, AssetMovement> = BTreeMap::new();
    let mut outflows: BTreeMap<String, AssetMovement> = BTreeMap::new();
    let mut fees: Vec<Fee> = Vec::new();
    let mut fee_seen: HashSet<String> = HashSet::new();
    let mut user_initiated = false;

    for record in records {
        let relevant = record
            .source_address
            .as_deref()
            .map(|a| user_addresses.contains(&a.to_lowercase()))
            // Records without a source address (exchange rows) are always
            // the user's own view.
            .unwrap_or(true);
        if !relevant {
            continue;
        }

        if record
            .from
            .as_deref()
            .map(|f| user_addresses.contains(&f.to_lowercase()))
            .unwrap_or(false)
        {
            user_initiated = true;
        }

        for movement in &record.movements {
            let asset_id = resolve_asset_id(
                chain,
                native_symbol,
                &movement.asset_symbol,
                &movement.contract_address,
                movement.is_token,
            )?;
            let target = match movement.direction {
                MovementDirection::In => &mut inflows,
                MovementDirection::Out => &mut outflows,
                MovementDirection::Neutral => continue,
            };
            let entry = target
                .entry(asset_key(&movement.asset_symbol, &movement.contract_address))
                .or_insert_with(|| {
                    AssetMovement::new(asset_id, &movement.asset_symbol, Decimal::ZERO)
                });
            entry.gross_amount += movement.amount;
            entry.net_amount += movement.amount;
        }

        // Fees dedup across records of the group: several observations of
        // the same hash report the same gas payment.
        for fee in &record.fees {
            let payer_is_user = fee
                .payer
                .as_deref()
                .map(|p| user_addresses.contains(&p.to_lowercase()))
                // No payer reported: attribute by initiation below.
                .unwrap_or(true);
            if !payer_is_user {
                continue;
            }
            let key = format!(
                "{}:{}",
                asset_key(&fee.asset_symbol, &fee.contract_address),
                fee.amount
            );
            if !fee_seen.insert(key) {
                continue;
            }
            let asset_id = resolve_asset_id(
                chain,
                native_symbol,
                &fee.asset_symbol,
                &fee.contract_address,
                false,
            )?;
            fees.push(Fee {
                asset_id,
                asset_symbol: fee.asset_symbol.to_uppercase(),
                amount: fee.amount,
                scope: if fee.is_network {
                    FeeScope::Network
                } else {
                    FeeScope::Platform
                },
                settlement: FeeSettlement::Balance,
                price_at_tx_time: None,
            });
        }
    }

    user_initiated = user_initiated || !outflows.is_empty();

    // Fees are charged to the user only when the user initiated; an inbound
    // transfer's gas was paid by the sender.
    if !user_initiated {
        fees.clear();
    }

    Ok(FundFlow {
        movements: Movements {
            inflows: inflows.into_values().collect(),
            outflows: outflows.into_values().collect(),
        },
        fees,
        user_initiated,
    })
}
