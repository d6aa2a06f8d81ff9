//! End-to-end pipeline composition: import → store → process → link →
//! enrich → replay overrides.
//!
//! Each stage is transactional with respect to its own writes; a failure
//! surfaces a structured error and leaves persisted state resumable. An
//! interrupted import resumes from the session cursors, and raw records
//! already stored (by fingerprint) are never duplicated.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::enrich::{EnrichConfig, EnrichReport, PriceEnrichmentEngine};
use crate::error::{Error, Result};
use crate::import::{ImportParams, Importer, params_identity};
use crate::links::{LinkMatcher, MatcherConfig};
use crate::metadata::TokenMetadataService;
use crate::model::{ImportSession, SessionStatus};
use crate::overrides::{OverrideLog, ReplayReport, replay};
use crate::process::{ProcessReport, Processor, SourceKind};
use crate::providers::ProviderManager;
use crate::store::{IngestionStore, LoadFilter, PriceStore};

pub struct Orchestrator {
    store: Arc<IngestionStore>,
    price_store: Arc<PriceStore>,
    metadata: Arc<TokenMetadataService>,
    manager: Option<Arc<ProviderManager>>,
    overrides: OverrideLog,
    matcher_config: MatcherConfig,
    enrich_config: EnrichConfig,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct ImportSummary {
    pub session_id: String,
    pub batches: usize,
    pub records_inserted: usize,
    pub records_duplicate: usize,
    pub invalid_rows: usize,
    /// True when an identical completed import allowed skipping the run.
    pub shortcut: bool,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct PipelineSummary {
    pub import: ImportSummary,
    pub transactions: usize,
    pub zero_impact_dropped: usize,
    pub links_suggested: usize,
    pub enrich: EnrichReport,
    pub overrides: ReplayReport,
}

impl Orchestrator {
    pub fn new(
        store: Arc<IngestionStore>,
        price_store: Arc<PriceStore>,
        metadata: Arc<TokenMetadataService>,
        manager: Option<Arc<ProviderManager>>,
        overrides: OverrideLog,
    ) -> Self {
        Self {
            store,
            price_store,
            metadata,
            manager,
            overrides,
            matcher_config: MatcherConfig::default(),
            enrich_config: EnrichConfig::default(),
        }
    }

    pub fn with_enrich_config(mut self, config: EnrichConfig) -> Self {
        self.enrich_config = config;
        self
    }

    // ── Import ──────────────────────────────────────────────────────

    pub async fn run_import(
        &self,
        importer: &dyn Importer,
        source_type: &str,
        mut params: ImportParams,
        cancel: &CancelToken,
    ) -> Result<ImportSummary> {
        importer.validate_params(&params)?;
        let source_id = importer.source_id().to_string();
        let identity = params_identity(&params);

        // An identical import that already completed short-circuits the run
        // unless the caller supplied explicit cursors to resume from.
        if params.cursors.is_empty() {
            if let Some(done) = self
                .store
                .find_completed_with_matching_params(&source_id, source_type, &identity)
                .await?
            {
                info!(source = %source_id, session = %done.id, "identical import already completed; skipping");
                return Ok(ImportSummary {
                    session_id: done.id,
                    shortcut: true,
                    ..Default::default()
                });
            }
            // Resume a prior interrupted run's cursors.
            if let Some(open) = self
                .store
                .list_sessions(Some(&source_id))
                .await?
                .into_iter()
                .find(|s| {
                    s.status != SessionStatus::Completed
                        && s.source_type == source_type
                        && s.import_params == identity
                        && !s.cursors.is_empty()
                })
            {
                info!(source = %source_id, session = %open.id, "resuming cursors from interrupted session");
                params.cursors = open.cursors;
            }
        }

        let session = ImportSession::new(&source_id, source_type, identity);
        self.store.create_session(&session).await?;
        let mut summary = ImportSummary {
            session_id: session.id.clone(),
            ..Default::default()
        };

        let mut stream = importer.import_streaming(params, cancel.clone());
        while let Some(item) = stream.next().await {
            match item {
                Ok(batch) => {
                    let inserted = self
                        .store
                        .save_batch(
                            &session.id,
                            &source_id,
                            &batch.raw_records,
                            &batch.normalized_records,
                        )
                        .await?;
                    self.store
                        .update_cursor(&session.id, &batch.operation_type, &batch.cursor)
                        .await?;
                    summary.batches += 1;
                    summary.records_inserted += inserted;
                    summary.records_duplicate += batch.raw_records.len() - inserted;
                    summary.invalid_rows += batch.stats.invalid;
                }
                Err(Error::Cancelled) => {
                    self.store
                        .finalize(&session.id, SessionStatus::Cancelled, None, None)
                        .await?;
                    return Err(Error::Cancelled);
                }
                Err(err) => {
                    self.store
                        .finalize(&session.id, SessionStatus::Failed, Some(&err.to_string()), None)
                        .await?;
                    return Err(err);
                }
            }
        }

        self.store
            .finalize(
                &session.id,
                SessionStatus::Completed,
                None,
                Some(&json!({
                    "batches": summary.batches,
                    "records_inserted": summary.records_inserted,
                })),
            )
            .await?;
        info!(
            source = %source_id,
            session = %summary.session_id,
            inserted = summary.records_inserted,
            "import completed"
        );
        Ok(summary)
    }

    // ── Process ─────────────────────────────────────────────────────

    pub async fn run_process(
        &self,
        kind: &SourceKind,
        source_id: &str,
        user_addresses: &[String],
        cancel: &CancelToken,
    ) -> Result<ProcessReport> {
        let stored = self
            .store
            .load_records(&LoadFilter {
                source_id: Some(source_id.to_string()),
                processed: Some(false),
                ..Default::default()
            })
            .await?;
        if stored.is_empty() {
            return Ok(ProcessReport::default());
        }

        let records: Vec<_> = stored.iter().map(|s| s.normalized.clone()).collect();
        let processor = Processor::new(self.metadata.clone(), self.manager.clone());
        let report = processor.process(kind, &records, user_addresses, cancel).await?;

        self.store.save_transactions(&report.transactions).await?;
        let fingerprints: Vec<String> = stored.iter().map(|s| s.fingerprint.clone()).collect();
        self.store.mark_processed(&fingerprints).await?;
        info!(
            source = source_id,
            transactions = report.transactions.len(),
            dropped = report.zero_impact_dropped,
            "processing completed"
        );
        Ok(report)
    }

    // ── Links ───────────────────────────────────────────────────────

    /// Run the matcher over the whole canonical set. Existing terminal links
    /// are never touched; re-runs only add new suggestions.
    pub async fn run_links(&self) -> Result<usize> {
        let transactions = self.store.load_transactions(None).await?;
        let existing = self.store.load_links(None).await?;
        let matcher = LinkMatcher::new(self.matcher_config.clone());
        let suggestions = matcher.run(&transactions, &existing);

        let mut created = 0usize;
        for link in &suggestions {
            if self.store.upsert_link(link).await? {
                created += 1;
            }
        }
        info!(suggested = created, "link matching completed");
        Ok(created)
    }

    // ── Enrichment ──────────────────────────────────────────────────

    pub async fn run_enrich(&self, cancel: &CancelToken) -> Result<EnrichReport> {
        let mut transactions = self.store.load_transactions(None).await?;
        let links = self.store.load_links(None).await?;

        let engine = PriceEnrichmentEngine::new(
            self.manager.clone(),
            self.price_store.clone(),
            self.enrich_config.clone(),
        );
        let report = engine.enrich(&mut transactions, &links, cancel).await?;
        self.store.save_transactions(&transactions).await?;
        Ok(report)
    }

    // ── Overrides ───────────────────────────────────────────────────

    pub async fn run_overrides(&self) -> Result<ReplayReport> {
        replay(&self.overrides, &self.store).await
    }

    pub fn override_log(&self) -> &OverrideLog {
        &self.overrides
    }

    pub fn store(&self) -> &Arc<IngestionStore> {
        &self.store
    }

    // ── Full pipeline ───────────────────────────────────────────────

    pub async fn run_pipeline(
        &self,
        importer: &dyn Importer,
        kind: &SourceKind,
        source_type: &str,
        params: ImportParams,
        cancel: &CancelToken,
    ) -> Result<PipelineSummary> {
        let user_addresses: Vec<String> = params
            .address
            .iter()
            .cloned()
            .chain(params.addresses.iter().cloned())
            .collect();

        let import = self
            .run_import(importer, source_type, params, cancel)
            .await?;
        let source_id = importer.source_id();
        let process = self
            .run_process(kind, source_id, &user_addresses, cancel)
            .await?;
        let links_suggested = self.run_links().await?;
        let enrich = match self.run_enrich(cancel).await {
            Ok(report) => report,
            Err(Error::Cancelled) => {
                warn!("enrichment cancelled; partial prices are persisted");
                return Err(Error::Cancelled);
            }
            Err(e) => return Err(e),
        };
        let overrides = self.run_overrides().await?;

        Ok(PipelineSummary {
            import,
            transactions: process.transactions.len(),
            zero_impact_dropped: process.zero_impact_dropped,
            links_suggested,
            enrich,
            overrides,
        })
    }
}
