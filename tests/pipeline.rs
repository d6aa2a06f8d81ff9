//! End-to-end pipeline tests: CSV + mock blockchain provider through
//! import, processing, linking, enrichment, and override replay.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;

use exitbook::cancel::CancelToken;
use exitbook::enrich::{EnrichConfig, PriceEnrichmentEngine};
use exitbook::http::rate_limit::RateLimitConfig;
use exitbook::import::blockchain::BlockchainImporter;
use exitbook::import::csv::CsvImporter;
use exitbook::import::ImportParams;
use exitbook::links::MatcherConfig;
use exitbook::metadata::TokenMetadataService;
use exitbook::model::{LinkStatus, PriceGranularity};
use exitbook::orchestrator::Orchestrator;
use exitbook::overrides::{OverrideEvent, OverrideLog, OverridePayload};
use exitbook::process::SourceKind;
use exitbook::providers::{
    ApiClient, ManagerConfig, Page, PageRequest, PriceQuote, ProviderError, ProviderManager,
    ProviderMetadata, ProviderOp, ProviderRequest, ProviderResponse, Registry, ReplayWindow,
};
use exitbook::store::{IngestionStore, PriceStore, TokenStore};

// Trade at T0, withdrawal ten minutes later, deposit an hour after that.
const T0: i64 = 1_700_000_000;

// ── Mock providers ──────────────────────────────────────────────────

/// Blockchain indexer serving one deposit for any address.
struct DepositProvider;

#[async_trait]
impl ApiClient for DepositProvider {
    fn name(&self) -> &str {
        "mockchain"
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        _cancel: &CancelToken,
    ) -> Result<Page, ProviderError> {
        use exitbook::model::record::{MovementDirection, NormalizedMovement};
        use exitbook::model::{Cursor, CursorPrimary, NormalizedRecord, RecordStatus};

        let record = NormalizedRecord {
            external_id: "0xdeposit".to_string(),
            provider_name: "mockchain".to_string(),
            timestamp_ms: (T0 + 4_200) * 1000,
            status: RecordStatus::Success,
            from: Some("bc1sender".to_string()),
            to: Some(request.address.clone()),
            movements: vec![NormalizedMovement {
                asset_symbol: "BTC".to_string(),
                contract_address: None,
                amount: dec!(0.9995),
                direction: MovementDirection::In,
                is_token: false,
                possible_spam: false,
                counterparty: Some("bc1sender".to_string()),
            }],
            fees: Vec::new(),
            operation_type: request.operation_type.clone(),
            transaction_hash: Some("0xdeposit".to_string()),
            block_height: Some(820_000),
            source_address: Some(request.address.clone()),
            transaction_type_hint: None,
            extensions: serde_json::Value::Null,
        };
        let mut cursor = Cursor::new(CursorPrimary::block_number(820_000), "mockchain");
        cursor.is_complete = true;
        cursor.total_fetched = 1;
        Ok(Page {
            raw: vec![serde_json::json!({"hash": "0xdeposit"})],
            normalized: vec![record],
            next_cursor: cursor,
            is_complete: true,
        })
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
        _cancel: &CancelToken,
    ) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::new(
            "mockchain",
            request.operation_name(),
            exitbook::providers::ProviderErrorKind::NotSupported,
            "streaming only",
        ))
    }
}

/// Market price provider with a fixed quote table.
struct QuoteProvider {
    name: String,
    quotes: Vec<(String, PriceQuote)>,
}

#[async_trait]
impl ApiClient for QuoteProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(
        &self,
        _request: &PageRequest,
        _cancel: &CancelToken,
    ) -> Result<Page, ProviderError> {
        Err(ProviderError::new(
            &self.name,
            "fetch_page",
            exitbook::providers::ProviderErrorKind::NotSupported,
            "prices only",
        ))
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
        _cancel: &CancelToken,
    ) -> Result<ProviderResponse, ProviderError> {
        match request {
            ProviderRequest::Price { asset_symbol, .. } => {
                let quote = self
                    .quotes
                    .iter()
                    .find(|(symbol, _)| symbol.eq_ignore_ascii_case(asset_symbol))
                    .map(|(_, q)| q.clone());
                Ok(ProviderResponse::Price(quote))
            }
            other => Err(ProviderError::new(
                &self.name,
                other.operation_name(),
                exitbook::providers::ProviderErrorKind::NotSupported,
                "prices only",
            )),
        }
    }
}

fn metadata(name: &str, chain: &str, ops: Vec<ProviderOp>) -> ProviderMetadata {
    ProviderMetadata {
        name: name.to_string(),
        supported_chains: vec![chain.to_string()],
        operations: ops,
        rate_limit: RateLimitConfig::per_second(1000),
        timeout: Duration::from_secs(5),
        priority: 0,
        api_key_env: None,
        replay_window: ReplayWindow::default(),
    }
}

fn build_manager(quotes: Vec<(String, PriceQuote)>) -> Arc<ProviderManager> {
    let mut registry = Registry::new();
    let chain_client: Arc<dyn ApiClient> = Arc::new(DepositProvider);
    registry
        .register(
            metadata("mockchain", "bitcoin", vec![ProviderOp::GetAddressTransactions]),
            Arc::new(move |_| Ok(chain_client.clone())),
        )
        .unwrap();
    let market_client: Arc<dyn ApiClient> = Arc::new(QuoteProvider {
        name: "mockpx".to_string(),
        quotes,
    });
    registry
        .register(
            metadata("mockpx", "market", vec![ProviderOp::FetchPrice]),
            Arc::new(move |_| Ok(market_client.clone())),
        )
        .unwrap();
    Arc::new(ProviderManager::new(Arc::new(registry), ManagerConfig::default()))
}

// ── Fixtures ────────────────────────────────────────────────────────

fn write_kraken_csvs(dir: &Path) {
    let trades = format!(
        "txid,ordertxid,pair,time,type,ordertype,price,cost,fee,vol\n\
         T1,O1,BTC/USD,{T0},buy,limit,50000,50000,75,1.0\n"
    );
    let ledger = format!(
        "txid,refid,time,type,subtype,aclass,asset,amount,fee\n\
         W1,R1,{},withdrawal,,currency,BTC,-1.0,0.0005\n",
        T0 + 600
    );
    std::fs::File::create(dir.join("trades.csv"))
        .unwrap()
        .write_all(trades.as_bytes())
        .unwrap();
    std::fs::File::create(dir.join("ledger.csv"))
        .unwrap()
        .write_all(ledger.as_bytes())
        .unwrap();
}

struct Pipeline {
    orchestrator: Orchestrator,
    store: Arc<IngestionStore>,
    _tmp: tempfile::TempDir,
}

fn build_pipeline(quotes: Vec<(String, PriceQuote)>) -> Pipeline {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(IngestionStore::open_in_memory().unwrap());
    let price_store = Arc::new(PriceStore::open_in_memory().unwrap());
    let metadata_service = Arc::new(TokenMetadataService::new(Arc::new(
        TokenStore::open_in_memory().unwrap(),
    )));
    let manager = build_manager(quotes);
    let orchestrator = Orchestrator::new(
        store.clone(),
        price_store,
        metadata_service,
        Some(manager),
        OverrideLog::new(&tmp.path().join("overrides.jsonl")),
    );
    Pipeline {
        orchestrator,
        store,
        _tmp: tmp,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn csv_and_chain_import_link_and_propagate() {
    let csv_dir = tempfile::tempdir().unwrap();
    write_kraken_csvs(csv_dir.path());

    // No market quotes: propagation, not the market stage, must price the
    // deposit.
    let p = build_pipeline(Vec::new());
    let cancel = CancelToken::new();

    // Import + process the exchange CSV.
    let kraken = CsvImporter::new("kraken");
    let kraken_params = ImportParams {
        csv_directories: vec![csv_dir.path().to_path_buf()],
        ..Default::default()
    };
    let import = p
        .orchestrator
        .run_import(&kraken, "csv", kraken_params.clone(), &cancel)
        .await
        .unwrap();
    assert_eq!(import.batches, 2);
    assert_eq!(import.records_inserted, 2);

    let kraken_kind = SourceKind::Exchange {
        name: "kraken".to_string(),
    };
    let processed = p
        .orchestrator
        .run_process(&kraken_kind, "kraken", &[], &cancel)
        .await
        .unwrap();
    assert_eq!(processed.transactions.len(), 2);

    // Import + process the on-chain deposit.
    let manager = build_manager(Vec::new());
    let bitcoin = BlockchainImporter::new("bitcoin", manager).with_operations(&["native"]);
    let chain_params = ImportParams {
        address: Some("bc1user".to_string()),
        ..Default::default()
    };
    p.orchestrator
        .run_import(&bitcoin, "blockchain", chain_params, &cancel)
        .await
        .unwrap();
    let chain_kind = SourceKind::Blockchain {
        chain: "bitcoin".to_string(),
        native_symbol: "BTC".to_string(),
    };
    let chain_report = p
        .orchestrator
        .run_process(&chain_kind, "bitcoin", &["bc1user".to_string()], &cancel)
        .await
        .unwrap();
    assert_eq!(chain_report.transactions.len(), 1);

    // The withdrawal and deposit should link with high confidence.
    let suggested = p.orchestrator.run_links().await.unwrap();
    assert_eq!(suggested, 1);
    let links = p.store.load_links(Some(LinkStatus::Suggested)).await.unwrap();
    let link = &links[0];
    assert_eq!(link.asset_symbol, "BTC");
    assert!(link.confidence_score >= dec!(0.95));

    // Pin the withdrawal's price manually, confirm the link.
    let transactions = p.store.load_transactions(None).await.unwrap();
    let withdrawal = transactions
        .iter()
        .find(|t| t.id == link.source_transaction_id)
        .unwrap();
    p.orchestrator
        .override_log()
        .append(&OverrideEvent::new(
            "tester",
            OverridePayload::Price {
                transaction_fingerprint: withdrawal.fingerprint.clone(),
                asset_symbol: "BTC".to_string(),
                price: dec!(50000),
                currency: "USD".to_string(),
            },
        ))
        .unwrap();
    p.orchestrator.run_overrides().await.unwrap();
    p.store
        .update_link_status(&link.id, LinkStatus::Confirmed, "tester")
        .await
        .unwrap();

    // Enrich: stage 1 prices the trade leg, stage 4 propagates across the
    // confirmed link.
    let report = p.orchestrator.run_enrich(&cancel).await.unwrap();
    assert_eq!(report.derived.movements_updated, 1);
    assert_eq!(report.propagated.movements_updated, 1);

    let transactions = p.store.load_transactions(None).await.unwrap();
    let trade = transactions.iter().find(|t| t.external_id == "O1").unwrap();
    let trade_price = trade.movements.inflows[0].price_at_tx_time.as_ref().unwrap();
    assert_eq!(trade_price.price, dec!(50000));
    assert_eq!(trade_price.source, "derived-trade");

    let deposit = transactions
        .iter()
        .find(|t| t.external_id == "0xdeposit")
        .unwrap();
    let deposit_price = deposit.movements.inflows[0].price_at_tx_time.as_ref().unwrap();
    assert_eq!(deposit_price.price, dec!(50000));
    assert_eq!(deposit_price.currency, "USD");
    assert_eq!(deposit_price.source, "link-propagated");

    // Confirmed links survive a matcher re-run.
    let again = p.orchestrator.run_links().await.unwrap();
    assert_eq!(again, 0);
    let confirmed = p.store.load_links(Some(LinkStatus::Confirmed)).await.unwrap();
    assert_eq!(confirmed.len(), 1);

    // import → process → import → process is idempotent: the identical
    // completed import short-circuits and the canonical set is unchanged.
    let rerun = p
        .orchestrator
        .run_import(&kraken, "csv", kraken_params, &cancel)
        .await
        .unwrap();
    assert!(rerun.shortcut);
    let reprocessed = p
        .orchestrator
        .run_process(&kraken_kind, "kraken", &[], &cancel)
        .await
        .unwrap();
    assert!(reprocessed.transactions.is_empty());
    assert_eq!(p.store.load_transactions(None).await.unwrap().len(), 3);

    // enrich → enrich is a no-op for already-priced movements.
    let second = p.orchestrator.run_enrich(&cancel).await.unwrap();
    assert_eq!(second.derived.movements_updated, 0);
    assert_eq!(second.market.prices_fetched, 0);
    assert_eq!(second.propagated.movements_updated, 0);
}

#[tokio::test]
async fn market_stage_converts_stablecoin_quotes() {
    use exitbook::model::transaction::Movements;
    use exitbook::model::{
        AssetId, AssetMovement, Operation, OperationCategory, OperationKind, Transaction,
        TransactionStatus,
    };

    // Provider quotes BTC in USDT; a USDT/USD rate of 0.99 is available.
    let manager = build_manager(vec![
        (
            "BTC".to_string(),
            PriceQuote {
                asset_symbol: "BTC".to_string(),
                currency: "USDT".to_string(),
                price: dec!(50000),
                source: "mockpx".to_string(),
                exact: true,
            },
        ),
        (
            "USDT".to_string(),
            PriceQuote {
                asset_symbol: "USDT".to_string(),
                currency: "USD".to_string(),
                price: dec!(0.99),
                source: "mockpx".to_string(),
                exact: true,
            },
        ),
    ]);

    let fingerprint = exitbook::model::transaction_fingerprint("bitcoin", "0xbtc");
    let mut transactions = vec![Transaction {
        id: "tx1".to_string(),
        source: "bitcoin".to_string(),
        external_id: "0xbtc".to_string(),
        fingerprint,
        datetime: chrono::Utc::now(),
        timestamp_ms: T0 * 1000,
        status: TransactionStatus::Success,
        from: None,
        to: None,
        movements: Movements {
            inflows: vec![AssetMovement::new(
                AssetId::native("bitcoin"),
                "BTC",
                dec!(1),
            )],
            outflows: vec![],
        },
        fees: Vec::new(),
        operation: Operation::new(OperationCategory::Transfer, OperationKind::Deposit),
        blockchain: None,
        notes: Vec::new(),
    }];

    let engine = PriceEnrichmentEngine::new(
        Some(manager),
        Arc::new(PriceStore::open_in_memory().unwrap()),
        EnrichConfig::default(),
    );
    let report = engine
        .enrich(&mut transactions, &[], &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.market.movements_updated, 1);

    let price = transactions[0].movements.inflows[0]
        .price_at_tx_time
        .as_ref()
        .unwrap();
    assert_eq!(price.price, dec!(49500.00));
    assert_eq!(price.currency, "USD");
    assert_eq!(price.source, "mockpx+usdt-rate");
    assert_eq!(price.granularity, PriceGranularity::Exact);
}

#[tokio::test]
async fn empty_source_pipeline_is_a_clean_success() {
    let csv_dir = tempfile::tempdir().unwrap();
    let p = build_pipeline(Vec::new());
    let cancel = CancelToken::new();

    let kraken = CsvImporter::new("kraken");
    let params = ImportParams {
        csv_directories: vec![csv_dir.path().to_path_buf()],
        ..Default::default()
    };
    let summary = p
        .orchestrator
        .run_import(&kraken, "csv", params, &cancel)
        .await
        .unwrap();
    assert_eq!(summary.records_inserted, 0);

    let report = p
        .orchestrator
        .run_process(
            &SourceKind::Exchange {
                name: "kraken".to_string(),
            },
            "kraken",
            &[],
            &cancel,
        )
        .await
        .unwrap();
    assert!(report.transactions.is_empty());
    assert_eq!(p.orchestrator.run_links().await.unwrap(), 0);
}

#[tokio::test]
async fn link_matcher_uses_configured_windows() {
    // Defaults documented: 5% loss, 0.1% gain, 72 hours.
    let config = MatcherConfig::default();
    assert_eq!(config.max_loss, dec!(0.05));
    assert_eq!(config.max_gain, dec!(0.001));
    assert_eq!(config.max_gap_hours, 72);
}
