//! Price enrichment engine: four sequential stages over the canonical
//! transaction set.
//!
//! 1. Derived trade — infer a crypto leg's price from the fiat leg of the
//!    same trade; no network.
//! 2. FX — normalize non-USD fiat prices to USD with historical rates.
//! 3. Market — fetch missing prices from the market provider pool, with the
//!    day-bucketed price cache in front and stablecoin-quote conversion.
//! 4. Link propagation — copy prices across confirmed links.
//!
//! Progress is emitted as a typed event stream; the core never touches UI
//! types. Cancellation before a stage skips it; mid-stage cancellation
//! finishes the current movement and exits.

mod derived;
mod fx;
mod market;
mod propagate;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::model::{Link, Transaction};
use crate::providers::ProviderManager;
use crate::store::PriceStore;

pub use market::STABLECOINS;

// ── Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum EnrichEvent {
    ProvidersInitializing,
    StageStarted { stage: &'static str },
    StageProgress { stage: &'static str, processed: usize, total: usize },
    StageCompleted { stage: &'static str, result: StageResult },
    StageFailed { stage: &'static str, error: String },
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StageResult {
    pub processed: usize,
    pub prices_fetched: usize,
    pub movements_updated: usize,
    pub skipped: usize,
    pub failures: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct EnrichReport {
    pub derived: StageResult,
    pub fx: StageResult,
    pub market: StageResult,
    pub propagated: StageResult,
}

// ── Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// Target quote currency; always USD in practice.
    pub currency: String,
    /// Consecutive market-stage failures before the stage aborts early.
    pub max_consecutive_failures: u32,
    /// Restrict enrichment to one asset symbol.
    pub asset_filter: Option<String>,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            max_consecutive_failures: 5,
            asset_filter: None,
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

pub struct PriceEnrichmentEngine {
    manager: Option<Arc<ProviderManager>>,
    price_store: Arc<PriceStore>,
    config: EnrichConfig,
    events: Option<mpsc::UnboundedSender<EnrichEvent>>,
}

impl PriceEnrichmentEngine {
    pub fn new(
        manager: Option<Arc<ProviderManager>>,
        price_store: Arc<PriceStore>,
        config: EnrichConfig,
    ) -> Self {
        Self {
            manager,
            price_store,
            config,
            events: None,
        }
    }

    /// Attach an event sink; returns the receiving half.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EnrichEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    fn emit(&self, event: EnrichEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    /// Run all four stages in order, mutating `transactions` in place.
    pub async fn enrich(
        &self,
        transactions: &mut [Transaction],
        links: &[Link],
        cancel: &CancelToken,
    ) -> Result<EnrichReport> {
        self.emit(EnrichEvent::ProvidersInitializing);
        let mut report = EnrichReport::default();

        self.stage_start("derived-trade", cancel)?;
        report.derived =
            self.stage_finish("derived-trade", derived::run(self, transactions, cancel).await)?;

        self.stage_start("fx-rates", cancel)?;
        report.fx = self.stage_finish("fx-rates", fx::run(self, transactions, cancel).await)?;

        self.stage_start("market-prices", cancel)?;
        report.market =
            self.stage_finish("market-prices", market::run(self, transactions, cancel).await)?;

        self.stage_start("link-propagation", cancel)?;
        report.propagated = self.stage_finish(
            "link-propagation",
            propagate::run(self, transactions, links, cancel).await,
        )?;

        info!(
            derived = report.derived.movements_updated,
            fx = report.fx.movements_updated,
            market = report.market.movements_updated,
            propagated = report.propagated.movements_updated,
            "enrichment complete"
        );
        Ok(report)
    }

    /// Cancellation before a stage starts skips the stage entirely.
    fn stage_start(&self, stage: &'static str, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.emit(EnrichEvent::StageStarted { stage });
        Ok(())
    }

    fn stage_finish(
        &self,
        stage: &'static str,
        outcome: Result<StageResult>,
    ) -> Result<StageResult> {
        match outcome {
            Ok(result) => {
                self.emit(EnrichEvent::StageCompleted {
                    stage,
                    result: result.clone(),
                });
                Ok(result)
            }
            Err(err) => {
                self.emit(EnrichEvent::StageFailed {
                    stage,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    pub(crate) fn manager(&self) -> Option<&Arc<ProviderManager>> {
        self.manager.as_ref()
    }

    pub(crate) fn price_store(&self) -> &PriceStore {
        &self.price_store
    }

    pub(crate) fn config(&self) -> &EnrichConfig {
        &self.config
    }

    pub(crate) fn progress(&self, stage: &'static str, processed: usize, total: usize) {
        self.emit(EnrichEvent::StageProgress {
            stage,
            processed,
            total,
        });
    }

    /// True when an asset filter excludes this symbol.
    pub(crate) fn filtered_out(&self, symbol: &str) -> bool {
        self.config
            .asset_filter
            .as_deref()
            .map(|f| !f.eq_ignore_ascii_case(symbol))
            .unwrap_or(false)
    }
}
