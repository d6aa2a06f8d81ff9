//! Stage 1: derive a crypto leg's unit price from the fiat leg of the same
//! trade. No network involved.

use chrono::Utc;
use rust_decimal::Decimal;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::price::SOURCE_DERIVED_TRADE;
use crate::model::{PriceGranularity, PriceRecord, Transaction};

use super::{PriceEnrichmentEngine, StageResult};

/// Fiat symbols recognized on exchange legs (exchange asset ids do not use
/// the `fiat:` namespace).
pub const FIAT_SYMBOLS: &[&str] = &["USD", "EUR", "GBP", "CHF", "JPY", "CAD", "AUD"];

pub fn is_fiat_symbol(symbol: &str) -> bool {
    FIAT_SYMBOLS.iter().any(|f| f.eq_ignore_ascii_case(symbol))
}

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
        engine.progress("derived-trade", i + 1, total);

        if tx.operation.category != crate::model::OperationCategory::Trade {
            result.skipped += 1;
            continue;
        }

        // A derivation needs exactly one fiat leg against exactly one crypto
        // leg; anything else is ambiguous and left for the market stage.
        let fingerprint = tx.fingerprint.clone();
        let derive = |crypto: &mut Vec<crate::model::AssetMovement>,
                      fiat: &Vec<crate::model::AssetMovement>,
                      updated: &mut usize| {
            let fiat_legs: Vec<&crate::model::AssetMovement> = fiat
                .iter()
                .filter(|m| is_fiat_symbol(&m.asset_symbol))
                .collect();
            let crypto_legs: Vec<&mut crate::model::AssetMovement> = crypto
                .iter_mut()
                .filter(|m| !is_fiat_symbol(&m.asset_symbol))
                .collect();
            if fiat_legs.len() != 1 || crypto_legs.len() != 1 {
                return;
            }
            let fiat_leg = fiat_legs[0];
            for crypto_leg in crypto_legs {
                if crypto_leg.price_at_tx_time.is_some()
                    || crypto_leg.net_amount.abs() == Decimal::ZERO
                {
                    continue;
                }
                let unit_price = fiat_leg.net_amount.abs() / crypto_leg.net_amount.abs();
                if let Some(mut record) = PriceRecord::new(
                    unit_price,
                    &fiat_leg.asset_symbol,
                    SOURCE_DERIVED_TRADE,
                    PriceGranularity::Exact,
                    Utc::now(),
                ) {
                    record.provenance =
                        Some(format!("{fingerprint}:{}", fiat_leg.asset_symbol));
                    crypto_leg.price_at_tx_time = Some(record);
                    *updated += 1;
                }
            }
        };

        let mut updated = 0usize;
        // Buy shape: crypto in, fiat out. Sell shape: crypto out, fiat in.
        let outflows_snapshot = tx.movements.outflows.clone();
        derive(&mut tx.movements.inflows, &outflows_snapshot, &mut updated);
        let inflows_snapshot = tx.movements.inflows.clone();
        derive(&mut tx.movements.outflows, &inflows_snapshot, &mut updated);

        result.movements_updated += updated;
        if updated == 0 {
            result.skipped += 1;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transaction::Movements;
    use crate::model::{
        AssetId, AssetMovement, Operation, OperationCategory, OperationKind, TransactionStatus,
    };
    use crate::store::PriceStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn engine() -> PriceEnrichmentEngine {
        PriceEnrichmentEngine::new(
            None,
            Arc::new(PriceStore::open_in_memory().unwrap()),
            Default::default(),
        )
    }

    fn trade(inflows: &[(&str, Decimal)], outflows: &[(&str, Decimal)]) -> Transaction {
        let build = |list: &[(&str, Decimal)]| {
            list.iter()
                .map(|(sym, amt)| AssetMovement::new(AssetId::exchange("kraken", sym), sym, *amt))
                .collect::<Vec<_>>()
        };
        Transaction {
            id: "t1".to_string(),
            source: "kraken".to_string(),
            external_id: "t1".to_string(),
            fingerprint: crate::model::transaction_fingerprint("kraken", "t1"),
            datetime: chrono::Utc::now(),
            timestamp_ms: 1_700_000_000_000,
            status: TransactionStatus::Success,
            from: None,
            to: None,
            movements: Movements {
                inflows: build(inflows),
                outflows: build(outflows),
            },
            fees: Vec::new(),
            operation: Operation::new(OperationCategory::Trade, OperationKind::Buy),
            blockchain: None,
            notes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn buy_derives_price_from_fiat_outflow() {
        let mut txs = vec![trade(&[("BTC", dec!(1))], &[("USD", dec!(50000))])];
        let result = run(&engine(), &mut txs, &CancelToken::new()).await.unwrap();

        assert_eq!(result.movements_updated, 1);
        let price = txs[0].movements.inflows[0].price_at_tx_time.as_ref().unwrap();
        assert_eq!(price.price, dec!(50000));
        assert_eq!(price.currency, "USD");
        assert_eq!(price.source, SOURCE_DERIVED_TRADE);
        assert_eq!(price.granularity, PriceGranularity::Exact);
        assert!(price.provenance.as_ref().unwrap().ends_with(":USD"));
    }

    #[tokio::test]
    async fn sell_derives_price_from_fiat_inflow() {
        let mut txs = vec![trade(&[("EUR", dec!(45000))], &[("BTC", dec!(1.5))])];
        run(&engine(), &mut txs, &CancelToken::new()).await.unwrap();
        let price = txs[0].movements.outflows[0].price_at_tx_time.as_ref().unwrap();
        assert_eq!(price.price, dec!(30000));
        assert_eq!(price.currency, "EUR");
    }

    #[tokio::test]
    async fn crypto_to_crypto_swap_is_skipped() {
        let mut txs = vec![trade(&[("ETH", dec!(20))], &[("BTC", dec!(1))])];
        let result = run(&engine(), &mut txs, &CancelToken::new()).await.unwrap();
        assert_eq!(result.movements_updated, 0);
        assert!(txs[0].movements.inflows[0].price_at_tx_time.is_none());
    }

    #[tokio::test]
    async fn existing_price_is_not_overwritten() {
        let mut tx = trade(&[("BTC", dec!(1))], &[("USD", dec!(50000))]);
        tx.movements.inflows[0].price_at_tx_time = PriceRecord::new(
            dec!(49000),
            "USD",
            "manual",
            PriceGranularity::Exact,
            chrono::Utc::now(),
        );
        let mut txs = vec![tx];
        let result = run(&engine(), &mut txs, &CancelToken::new()).await.unwrap();
        assert_eq!(result.movements_updated, 0);
        assert_eq!(
            txs[0].movements.inflows[0].price_at_tx_time.as_ref().unwrap().price,
            dec!(49000)
        );
    }
}
