//! Stage 4: propagate prices across confirmed links.
//!
//! A confirmed link asserts the target deposit is the same funds as the
//! source withdrawal, so the source's price applies. Suggested and rejected
//! links are ignored.

use std::collections::HashMap;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::model::price::SOURCE_LINK_PROPAGATED;
use crate::model::{Link, LinkStatus, PriceRecord, Transaction};

use super::{PriceEnrichmentEngine, StageResult};

pub(super) async fn run(
    engine: &PriceEnrichmentEngine,
    transactions: &mut [Transaction],
    links: &[Link],
    cancel: &CancelToken,
) -> Result<StageResult> {
    let mut result = StageResult::default();

    let index: HashMap<String, usize> = transactions
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.clone(), i))
        .collect();

    // Collect (target index, asset, price) first; applying in a second pass
    // keeps the borrow story simple.
    let mut pending: Vec<(usize, String, PriceRecord)> = Vec::new();
    let total = links.len();

    for (i, link) in links.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        engine.progress("link-propagation", i + 1, total);
        result.processed += 1;

        if link.status != LinkStatus::Confirmed {
            result.skipped += 1;
            continue;
        }
        let (Some(&src_idx), Some(&dst_idx)) = (
            index.get(&link.source_transaction_id),
            index.get(&link.target_transaction_id),
        ) else {
            result.skipped += 1;
            continue;
        };

        let source_tx = &transactions[src_idx];
        let source_price = source_tx
            .movements
            .outflows
            .iter()
            .filter(|m| m.asset_symbol.eq_ignore_ascii_case(&link.asset_symbol))
            .find_map(|m| m.price_at_tx_time.clone());
        let Some(source_price) = source_price else {
            result.skipped += 1;
            continue;
        };

        let mut record = source_price.clone();
        record.source = SOURCE_LINK_PROPAGATED.to_string();
        record.provenance = Some(format!(
            "{}:{}",
            source_tx.fingerprint, link.asset_symbol
        ));
        pending.push((dst_idx, link.asset_symbol.clone(), record));
    }

    for (dst_idx, asset, record) in pending {
        let target = &mut transactions[dst_idx];
        for inflow in &mut target.movements.inflows {
            if inflow.asset_symbol.eq_ignore_ascii_case(&asset)
                && inflow.price_at_tx_time.is_none()
            {
                inflow.price_at_tx_time = Some(record.clone());
                result.movements_updated += 1;
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::link::MatchCriteria;
    use crate::model::transaction::Movements;
    use crate::model::{
        AssetId, AssetMovement, Operation, OperationCategory, OperationKind, PriceGranularity,
        TransactionStatus, link_fingerprint,
    };
    use crate::store::PriceStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn engine() -> PriceEnrichmentEngine {
        PriceEnrichmentEngine::new(
            None,
            Arc::new(PriceStore::open_in_memory().unwrap()),
            Default::default(),
        )
    }

    fn tx_with(
        id: &str,
        source: &str,
        inflows: &[(&str, Decimal)],
        outflows: &[(&str, Decimal)],
    ) -> Transaction {
        let build = |list: &[(&str, Decimal)]| {
            list.iter()
                .map(|(sym, amt)| AssetMovement::new(AssetId::exchange(source, sym), sym, *amt))
                .collect::<Vec<_>>()
        };
        Transaction {
            id: id.to_string(),
            source: source.to_string(),
            external_id: id.to_string(),
            fingerprint: crate::model::transaction_fingerprint(source, id),
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
            operation: Operation::new(OperationCategory::Transfer, OperationKind::Transfer),
            blockchain: None,
            notes: Vec::new(),
        }
    }

    fn link(source: &Transaction, target: &Transaction, asset: &str, status: LinkStatus) -> Link {
        let fp = link_fingerprint(&source.fingerprint, &target.fingerprint, asset);
        Link {
            id: format!("ln_{}", &fp[..24]),
            fingerprint: fp,
            source_transaction_id: source.id.clone(),
            target_transaction_id: target.id.clone(),
            asset_symbol: asset.to_string(),
            source_amount: dec!(1),
            target_amount: dec!(0.999),
            link_type: "transfer".to_string(),
            confidence_score: dec!(0.95),
            match_criteria: MatchCriteria {
                asset_match: "exact".to_string(),
                amount_similarity: dec!(0.999),
                timing_factor: dec!(0.99),
                gap_hours: dec!(1),
            },
            status,
            reviewed_by: None,
            reviewed_at: None,
        }
    }

    fn priced(mut tx: Transaction, price: Decimal) -> Transaction {
        tx.movements.outflows[0].price_at_tx_time = crate::model::PriceRecord::new(
            price,
            "USD",
            "derived-trade",
            PriceGranularity::Exact,
            chrono::Utc::now(),
        );
        tx
    }

    #[tokio::test]
    async fn confirmed_link_copies_price_to_target() {
        let withdrawal = priced(
            tx_with("w1", "kraken", &[], &[("BTC", dec!(1))]),
            dec!(50000),
        );
        let deposit = tx_with("d1", "bitcoin", &[("BTC", dec!(0.999))], &[]);
        let l = link(&withdrawal, &deposit, "BTC", LinkStatus::Confirmed);

        let mut txs = vec![withdrawal, deposit];
        let result = run(&engine(), &mut txs, &[l], &CancelToken::new()).await.unwrap();

        assert_eq!(result.movements_updated, 1);
        let price = txs[1].movements.inflows[0].price_at_tx_time.as_ref().unwrap();
        assert_eq!(price.price, dec!(50000));
        assert_eq!(price.currency, "USD");
        assert_eq!(price.source, SOURCE_LINK_PROPAGATED);
        assert_eq!(price.granularity, PriceGranularity::Exact);
    }

    #[tokio::test]
    async fn suggested_link_is_ignored() {
        let withdrawal = priced(
            tx_with("w1", "kraken", &[], &[("BTC", dec!(1))]),
            dec!(50000),
        );
        let deposit = tx_with("d1", "bitcoin", &[("BTC", dec!(0.999))], &[]);
        let l = link(&withdrawal, &deposit, "BTC", LinkStatus::Suggested);

        let mut txs = vec![withdrawal, deposit];
        run(&engine(), &mut txs, &[l], &CancelToken::new()).await.unwrap();
        assert!(txs[1].movements.inflows[0].price_at_tx_time.is_none());
    }

    #[tokio::test]
    async fn unpriced_source_is_skipped() {
        let withdrawal = tx_with("w1", "kraken", &[], &[("BTC", dec!(1))]);
        let deposit = tx_with("d1", "bitcoin", &[("BTC", dec!(0.999))], &[]);
        let l = link(&withdrawal, &deposit, "BTC", LinkStatus::Confirmed);

        let mut txs = vec![withdrawal, deposit];
        let result = run(&engine(), &mut txs, &[l], &CancelToken::new()).await.unwrap();
        assert_eq!(result.movements_updated, 0);
        assert_eq!(result.skipped, 1);
    }
}
