//! `prices` commands: view movement prices, set manual overrides.

use rust_decimal::Decimal;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::overrides::{OverrideEvent, OverrideLog, OverridePayload, replay};

use super::Context;

pub async fn view(ctx: &Context, missing_only: bool) -> Result<Value> {
    let transactions = ctx.store.load_transactions(None).await?;
    let mut rows = Vec::new();
    let mut missing = 0usize;

    for tx in &transactions {
        for (side, movements) in [
            ("in", &tx.movements.inflows),
            ("out", &tx.movements.outflows),
        ] {
            for movement in movements {
                let priced = movement.price_at_tx_time.is_some();
                if !priced {
                    missing += 1;
                }
                if missing_only && priced {
                    continue;
                }
                rows.push(json!({
                    "transaction": tx.id,
                    "fingerprint": tx.fingerprint,
                    "source": tx.source,
                    "side": side,
                    "asset": movement.asset_symbol,
                    "amount": movement.net_amount.to_string(),
                    "price": movement.price_at_tx_time.as_ref().map(|p| p.price.to_string()),
                    "currency": movement.price_at_tx_time.as_ref().map(|p| p.currency.clone()),
                    "price_source": movement.price_at_tx_time.as_ref().map(|p| p.source.clone()),
                }));
            }
        }
    }

    Ok(json!({
        "count": rows.len(),
        "missing": missing,
        "movements": rows,
    }))
}

pub async fn set(
    ctx: &Context,
    fingerprint: String,
    asset: String,
    price: String,
    currency: String,
) -> Result<Value> {
    let price: Decimal = price
        .parse()
        .map_err(|e| Error::InvalidArgs(format!("unparseable price: {e}")))?;
    if price <= Decimal::ZERO {
        return Err(Error::InvalidArgs("price must be positive".to_string()));
    }

    let actor = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    let log = OverrideLog::new(&ctx.paths.overrides_log);
    log.append(&OverrideEvent::new(
        &actor,
        OverridePayload::Price {
            transaction_fingerprint: fingerprint.clone(),
            asset_symbol: asset.to_uppercase(),
            price,
            currency: currency.to_uppercase(),
        },
    ))?;
    let report = replay(&log, &ctx.store).await?;
    Ok(json!({
        "fingerprint": fingerprint,
        "asset": asset.to_uppercase(),
        "price": price.to_string(),
        "replay": report,
    }))
}
