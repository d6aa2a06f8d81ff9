//! Command implementations behind the CLI surface. Each command returns the
//! data payload for the response envelope; `main` handles formatting and
//! exit codes.

pub mod export;
pub mod import;
pub mod links;
pub mod prices;
pub mod view;

use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::cancel::CancelToken;
use crate::config::DataPaths;
use crate::enrich::EnrichConfig;
use crate::error::{Error, Result};
use crate::metadata::TokenMetadataService;
use crate::orchestrator::Orchestrator;
use crate::overrides::OverrideLog;
use crate::providers::{ManagerConfig, ProviderManager, Registry};
use crate::store::{IngestionStore, PriceStore, TokenStore};

/// Shared command state: resolved paths, open stores, provider manager,
/// orchestrator.
pub struct Context {
    pub paths: DataPaths,
    pub store: Arc<IngestionStore>,
    pub price_store: Arc<PriceStore>,
    pub metadata: Arc<TokenMetadataService>,
    pub registry: Arc<Registry>,
    pub manager: Arc<ProviderManager>,
    pub cancel: CancelToken,
}

impl Context {
    /// Open everything under the data directory. Adapters are enrolled into
    /// `registry` by the embedding application before the context is built;
    /// the CLI itself ships none (CSV imports need no providers).
    pub fn new(data_dir: Option<&Path>, registry: Registry) -> Result<Self> {
        let paths = DataPaths::resolve(data_dir)
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        let store = Arc::new(IngestionStore::open(&paths.ingestion_db)?);
        let price_store = Arc::new(PriceStore::open(&paths.prices_db)?);
        let tokens = Arc::new(TokenStore::open(&paths.tokens_db)?);
        let registry = Arc::new(registry);
        let manager = Arc::new(ProviderManager::new(
            registry.clone(),
            ManagerConfig::default(),
        ));
        Ok(Self {
            paths,
            store,
            price_store,
            metadata: Arc::new(TokenMetadataService::new(tokens)),
            registry,
            manager,
            cancel: CancelToken::new(),
        })
    }

    pub fn orchestrator(&self, enrich: EnrichConfig) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.price_store.clone(),
            self.metadata.clone(),
            Some(self.manager.clone()),
            OverrideLog::new(&self.paths.overrides_log),
        )
        .with_enrich_config(enrich)
    }
}

/// `enrich prices` command.
pub async fn enrich_prices(ctx: &Context, asset: Option<String>) -> Result<Value> {
    let orchestrator = ctx.orchestrator(EnrichConfig {
        asset_filter: asset,
        ..Default::default()
    });
    let report = orchestrator.run_enrich(&ctx.cancel).await?;
    let overrides = orchestrator.run_overrides().await?;
    Ok(json!({
        "enrichment": report,
        "overrides": overrides,
    }))
}

/// `verify` command: recompute per-asset net totals from the canonical set
/// and, when a provider can report balances, compare. Discrepancies are
/// reported, never fatal.
pub async fn verify(
    ctx: &Context,
    source: Option<String>,
    address: Option<String>,
) -> Result<Value> {
    use crate::model::transaction::FeeSettlement;
    use crate::providers::{ProviderRequest, ProviderResponse};
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    let transactions = ctx.store.load_transactions(source.as_deref()).await?;
    let mut computed: BTreeMap<String, Decimal> = BTreeMap::new();
    for tx in &transactions {
        for m in &tx.movements.inflows {
            *computed.entry(m.asset_symbol.clone()).or_default() += m.net_amount;
        }
        for m in &tx.movements.outflows {
            *computed.entry(m.asset_symbol.clone()).or_default() -= m.net_amount;
        }
        for fee in &tx.fees {
            if fee.settlement == FeeSettlement::Balance {
                *computed.entry(fee.asset_symbol.clone()).or_default() -= fee.amount;
            }
        }
    }

    let mut reported: BTreeMap<String, Decimal> = BTreeMap::new();
    let mut discrepancies = Vec::new();
    if let (Some(source), Some(address)) = (source.as_deref(), address.as_deref()) {
        let response = ctx
            .manager
            .execute_with_failover(
                source,
                ProviderRequest::AddressBalances {
                    address: address.to_string(),
                },
                &ctx.cancel,
            )
            .await;
        match response {
            Ok(ProviderResponse::Balances(balances)) => {
                for balance in balances {
                    reported.insert(balance.asset_symbol.to_uppercase(), balance.amount);
                }
                for (asset, computed_amount) in &computed {
                    let reported_amount =
                        reported.get(asset).copied().unwrap_or(Decimal::ZERO);
                    if *computed_amount != reported_amount {
                        discrepancies.push(json!({
                            "asset": asset,
                            "computed": computed_amount.to_string(),
                            "reported": reported_amount.to_string(),
                        }));
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "balance verification unavailable");
            }
        }
    }

    let computed_json: BTreeMap<String, String> = computed
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    let reported_json: BTreeMap<String, String> = reported
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    Ok(json!({
        "computed": computed_json,
        "reported": reported_json,
        "discrepancies": discrepancies,
    }))
}

/// `providers list` command.
pub async fn providers_list(ctx: &Context) -> Result<Value> {
    let mut providers = Vec::new();
    for (chain, meta) in ctx.registry.catalog() {
        let health = ctx.manager.health_of(&chain, &meta.name).await;
        providers.push(json!({
            "chain": chain,
            "name": meta.name,
            "priority": meta.priority,
            "operations": meta.operations.len(),
            "api_key_env": meta.api_key_env,
            "circuit": health
                .map(|(circuit, _)| format!("{circuit:?}").to_lowercase())
                .unwrap_or_else(|| "closed".to_string()),
        }));
    }
    let disabled: Vec<Value> = ctx
        .registry
        .skipped()
        .iter()
        .map(|(chain, name)| json!({ "chain": chain, "name": name, "reason": "missing api key" }))
        .collect();
    Ok(json!({ "providers": providers, "disabled": disabled }))
}
