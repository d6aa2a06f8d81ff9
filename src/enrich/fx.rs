//! Stage 2: normalize non-USD fiat prices to USD with historical FX rates.
//!
//! FX providers register under the `fx` pool; ordering in the registry puts
//! central-bank daily sources ahead of general-purpose fallbacks.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::Transaction;
use crate::providers::{ProviderRequest, ProviderResponse};

use super::derived::is_fiat_symbol;
use super::{PriceEnrichmentEngine, StageResult};

/// Registry pool name FX providers enroll under.
pub const FX_POOL: &str = "fx";

pub(super) async fn run(
    engine: &PriceEnrichmentEngine,
    transactions: &mut [Transaction],
    cancel: &CancelToken,
) -> Result<StageResult> {
    let mut result = StageResult::default();
    let total = transactions.len();

    for (i, tx) in transactions.iter_mut().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        result.processed += 1;
        engine.progress("fx-rates", i + 1, total);

        let timestamp_ms = tx.timestamp_ms;
        let datetime = tx.datetime;
        for movement in tx.movements_mut() {
            let needs_fx = movement
                .price_at_tx_time
                .as_ref()
                .map(|p| !p.is_usd() && is_fiat_symbol(&p.currency))
                .unwrap_or(false);
            if !needs_fx {
                continue;
            }
            let currency = movement
                .price_at_tx_time
                .as_ref()
                .map(|p| p.currency.clone())
                .unwrap_or_default();

            let Some(manager) = engine.manager() else {
                result.skipped += 1;
                continue;
            };
            let response = manager
                .execute_with_failover(
                    FX_POOL,
                    ProviderRequest::Price {
                        asset_symbol: currency.clone(),
                        currency: "USD".to_string(),
                        timestamp_ms,
                    },
                    cancel,
                )
                .await;

            match response {
                Ok(ProviderResponse::Price(Some(quote))) => {
                    if let Some(price) = movement.price_at_tx_time.as_mut() {
                        price.price *= quote.price;
                        price.currency = "USD".to_string();
                        price.fx_rate_to_usd = Some(quote.price);
                        price.fx_source = Some(quote.source.clone());
                        price.fx_timestamp = Some(datetime);
                        result.movements_updated += 1;
                        result.prices_fetched += 1;
                    }
                }
                Ok(_) => {
                    result.failures += 1;
                    result
                        .errors
                        .push(format!("fx_unavailable: {currency} at {timestamp_ms}"));
                }
                Err(e) => {
                    result.failures += 1;
                    result.errors.push(format!("fx_unavailable: {currency}: {e}"));
                }
            }
        }
    }
    Ok(result)
}
