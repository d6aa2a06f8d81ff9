//! Stage 3: market prices from the provider pool, cache-first, with
//! stablecoin-quote conversion and early abort on persistent failure.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::{PriceGranularity, PriceRecord, Transaction};
use crate::providers::{PriceQuote, ProviderRequest, ProviderResponse};

use super::derived::is_fiat_symbol;
use super::{PriceEnrichmentEngine, StageResult};

/// Registry pool name market price providers enroll under.
pub const MARKET_POOL: &str = "market";

/// Stablecoins a provider may quote in instead of USD.
pub const STABLECOINS: &[&str] = &["USDT", "USDC", "DAI", "BUSD", "TUSD"];

fn is_stablecoin(symbol: &str) -> bool {
    STABLECOINS.iter().any(|s| s.eq_ignore_ascii_case(symbol))
}

pub(super) async fn run(
    engine: &PriceEnrichmentEngine,
    transactions: &mut [Transaction],
    cancel: &CancelToken,
) -> Result<StageResult> {
    let mut result = StageResult::default();
    let mut consecutive_failures = 0u32;
    let max_failures = engine.config().max_consecutive_failures;
    let currency = engine.config().currency.clone();
    let total = transactions.len();
    let mut aborted = false;

    'outer: for (i, tx) in transactions.iter_mut().enumerate() {
        engine.progress("market-prices", i + 1, total);
        let timestamp_ms = tx.timestamp_ms;

        for movement in tx.movements_mut() {
            // Mid-stage cancellation: the current movement was completed
            // before the check; exit cleanly with partial results.
            if cancel.is_cancelled() {
                break 'outer;
            }
            if movement.price_at_tx_time.is_some()
                || is_fiat_symbol(&movement.asset_symbol)
                || engine.filtered_out(&movement.asset_symbol)
            {
                result.skipped += 1;
                continue;
            }
            result.processed += 1;

            // Day-bucketed cache first.
            if let Some(cached) = engine
                .price_store()
                .get(&movement.asset_symbol, &currency, timestamp_ms)
                .await?
            {
                movement.price_at_tx_time = Some(cached);
                result.movements_updated += 1;
                consecutive_failures = 0;
                continue;
            }

            match fetch_quote(engine, &movement.asset_symbol, &currency, timestamp_ms, cancel)
                .await
            {
                Ok(record) => {
                    engine
                        .price_store()
                        .put(&movement.asset_symbol, timestamp_ms, &record)
                        .await?;
                    movement.price_at_tx_time = Some(record);
                    result.movements_updated += 1;
                    result.prices_fetched += 1;
                    consecutive_failures = 0;
                }
                Err(e) => {
                    result.failures += 1;
                    result
                        .errors
                        .push(format!("{}: {e}", movement.asset_symbol));
                    consecutive_failures += 1;
                    if consecutive_failures >= max_failures {
                        warn!(
                            failures = consecutive_failures,
                            "aborting market stage early: provider unavailability"
                        );
                        aborted = true;
                        break 'outer;
                    }
                }
            }
        }
    }

    if aborted {
        // Everything not reached is recorded as failed, not silently
        // skipped.
        result.errors.push("provider unavailability".to_string());
        let remaining: usize = transactions
            .iter()
            .flat_map(|t| t.movements.inflows.iter().chain(&t.movements.outflows))
            .filter(|m| m.price_at_tx_time.is_none() && !is_fiat_symbol(&m.asset_symbol))
            .count();
        result.failures += remaining;
    }
    Ok(result)
}

/// One provider round trip, including stablecoin-quote conversion.
async fn fetch_quote(
    engine: &PriceEnrichmentEngine,
    asset_symbol: &str,
    currency: &str,
    timestamp_ms: i64,
    cancel: &CancelToken,
) -> crate::error::Result<PriceRecord> {
    use crate::error::Error;

    let Some(manager) = engine.manager() else {
        return Err(Error::ProviderUnavailable(
            "no market price providers configured".to_string(),
        ));
    };

    let quote = match manager
        .execute_with_failover(
            MARKET_POOL,
            ProviderRequest::Price {
                asset_symbol: asset_symbol.to_string(),
                currency: currency.to_string(),
                timestamp_ms,
            },
            cancel,
        )
        .await?
    {
        ProviderResponse::Price(Some(quote)) => quote,
        _ => {
            return Err(Error::NotFound(format!(
                "no {currency} price for {asset_symbol}"
            )));
        }
    };

    let granularity = if quote.exact {
        PriceGranularity::Exact
    } else {
        PriceGranularity::Interpolated
    };

    // Quote already in the requested currency.
    if quote.currency.eq_ignore_ascii_case(currency) {
        return PriceRecord::new(quote.price, currency, &quote.source, granularity, Utc::now())
            .ok_or_else(|| Error::Validation(format!("non-positive price for {asset_symbol}")));
    }

    // Stablecoin-denominated quote: convert, unless the requested asset is
    // itself a stablecoin (no recursion).
    if is_stablecoin(&quote.currency) && !is_stablecoin(asset_symbol) {
        return convert_stablecoin_quote(manager, quote, currency, timestamp_ms, granularity, cancel)
            .await;
    }

    Err(Error::Validation(format!(
        "provider quoted {asset_symbol} in {} instead of {currency}",
        quote.currency
    )))
}

async fn convert_stablecoin_quote(
    manager: &std::sync::Arc<crate::providers::ProviderManager>,
    quote: PriceQuote,
    currency: &str,
    timestamp_ms: i64,
    granularity: PriceGranularity,
    cancel: &CancelToken,
) -> crate::error::Result<PriceRecord> {
    use crate::error::Error;

    let coin = quote.currency.to_lowercase();
    let rate_response = manager
        .execute_with_failover(
            MARKET_POOL,
            ProviderRequest::Price {
                asset_symbol: quote.currency.clone(),
                currency: currency.to_string(),
                timestamp_ms,
            },
            cancel,
        )
        .await;

    let (price, source): (Decimal, String) = match rate_response {
        Ok(ProviderResponse::Price(Some(rate))) => (
            quote.price * rate.price,
            format!("{}+{coin}-rate", quote.source),
        ),
        // Rate unavailable: assume 1:1 parity and say so in the provenance.
        _ => (
            quote.price,
            format!("{}+assumed-{coin}-parity", quote.source),
        ),
    };

    PriceRecord::new(price, currency, &source, granularity, Utc::now())
        .ok_or_else(|| Error::Validation("non-positive converted price".to_string()))
}
