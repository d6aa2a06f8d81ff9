//! Processor: normalized records → canonical transactions.
//!
//! Blockchain records are grouped by transaction hash (a hash typically has
//! several observations: native transfer, token transfers, internal calls),
//! run through fund-flow analysis, fee attribution, classification, asset
//! identity resolution, token metadata enrichment, and scam detection.
//! Exchange records are correlated by order id. Processing is strict: a
//! group that fails to produce a canonical transaction fails the whole batch
//! with every failure enumerated — silent drops would corrupt the portfolio.

pub mod classify;
pub mod exchange;
pub mod fund_flow;
pub mod scam;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::metadata::TokenMetadataService;
use crate::model::record::NormalizedRecord;
use crate::model::transaction::BlockchainInfo;
use crate::model::{
    Note, NoteSeverity, Transaction, TransactionStatus, transaction_fingerprint,
};

// ── Source kinds ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SourceKind {
    Blockchain { chain: String, native_symbol: String },
    Exchange { name: String },
}

/// Native currency symbols for known chains; unknown chains fall back to
/// the upper-cased chain name.
pub fn native_symbol_for(chain: &str) -> String {
    match chain.to_lowercase().as_str() {
        "ethereum" | "arbitrum" | "optimism" | "base" => "ETH".to_string(),
        "bitcoin" => "BTC".to_string(),
        "polygon" => "POL".to_string(),
        "solana" => "SOL".to_string(),
        "cardano" => "ADA".to_string(),
        "avalanche" => "AVAX".to_string(),
        other => other.to_uppercase(),
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ProcessReport {
    pub transactions: Vec<Transaction>,
    pub zero_impact_dropped: usize,
}

/// One group's failure, surfaced in the strict-mode batch error.
#[derive(Debug)]
pub struct GroupFailure {
    pub group_id: String,
    pub reason: String,
}

// ── Processor ───────────────────────────────────────────────────────

pub struct Processor {
    metadata: Arc<TokenMetadataService>,
    manager: Option<Arc<crate::providers::ProviderManager>>,
}

impl Processor {
    pub fn new(
        metadata: Arc<TokenMetadataService>,
        manager: Option<Arc<crate::providers::ProviderManager>>,
    ) -> Self {
        Self { metadata, manager }
    }

    /// Transform a batch of normalized records. `user_addresses` are the
    /// addresses the import was scoped to (blockchain sources).
    pub async fn process(
        &self,
        kind: &SourceKind,
        records: &[NormalizedRecord],
        user_addresses: &[String],
        cancel: &CancelToken,
    ) -> Result<ProcessReport> {
        match kind {
            SourceKind::Exchange { name } => self.process_exchange(name, records),
            SourceKind::Blockchain {
                chain,
                native_symbol,
            } => {
                self.process_blockchain(chain, native_symbol, records, user_addresses, cancel)
                    .await
            }
        }
    }

    fn process_exchange(
        &self,
        exchange: &str,
        records: &[NormalizedRecord],
    ) -> Result<ProcessReport> {
        let transactions = exchange::process_records(exchange, records)?;
        let (kept, dropped) = filter_zero_impact(transactions);
        info!(exchange, transactions = kept.len(), dropped, "exchange records processed");
        Ok(ProcessReport {
            transactions: kept,
            zero_impact_dropped: dropped,
        })
    }

    async fn process_blockchain(
        &self,
        chain: &str,
        native_symbol: &str,
        records: &[NormalizedRecord],
        user_addresses: &[String],
        cancel: &CancelToken,
    ) -> Result<ProcessReport> {
        let addresses: HashSet<String> =
            user_addresses.iter().map(|a| a.to_lowercase()).collect();

        // 1. Group by transaction hash; a record without a hash stands alone.
        let mut groups: BTreeMap<String, Vec<&NormalizedRecord>> = BTreeMap::new();
        for record in records {
            let key = record
                .transaction_hash
                .clone()
                .unwrap_or_else(|| record.external_id.clone());
            groups.entry(key).or_default().push(record);
        }

        // 2. Token metadata for every contract in the batch, one round trip.
        // Unknown contracts are fetched through the provider manager when one
        // is wired in; otherwise the cached metadata is all there is.
        let contracts: Vec<String> = records
            .iter()
            .flat_map(|r| r.movements.iter())
            .filter_map(|m| m.contract_address.as_ref())
            .map(|c| c.to_lowercase())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let token_meta = match &self.manager {
            Some(manager) => {
                let manager = manager.clone();
                let chain_name = chain.to_string();
                let fetch_cancel = cancel.clone();
                self.metadata
                    .resolve(&contracts, move |missing| {
                        let manager = manager.clone();
                        let chain = chain_name.clone();
                        let cancel = fetch_cancel.clone();
                        async move {
                            use crate::providers::{ProviderRequest, ProviderResponse};
                            let response = manager
                                .execute_with_failover(
                                    &chain,
                                    ProviderRequest::TokenMetadata { contracts: missing },
                                    &cancel,
                                )
                                .await?;
                            match response {
                                ProviderResponse::TokenMetadata(infos) => Ok(infos),
                                _ => Ok(Vec::new()),
                            }
                        }
                    })
                    .await?
            }
            None => self.metadata.get_by_contracts(&contracts).await?,
        };

        let mut transactions = Vec::new();
        let mut failures: Vec<GroupFailure> = Vec::new();

        for (hash, group) in &groups {
            cancel.check()?;
            match self.process_group(chain, native_symbol, hash, group, &addresses, &token_meta) {
                Ok(Some(tx)) => transactions.push(tx),
                Ok(None) => {}
                Err(err) => failures.push(GroupFailure {
                    group_id: hash.clone(),
                    reason: err.to_string(),
                }),
            }
        }

        // 9. Strict mode: every failure is enumerated, nothing is dropped
        // silently.
        if !failures.is_empty() {
            let detail: Vec<String> = failures
                .iter()
                .map(|f| format!("{}: {}", f.group_id, f.reason))
                .collect();
            return Err(Error::Validation(format!(
                "{} of {} transaction groups failed processing: [{}]",
                failures.len(),
                groups.len(),
                detail.join("; ")
            )));
        }

        let produced = transactions.len();
        let (kept, dropped) = filter_zero_impact(transactions);
        debug!(
            chain,
            groups = groups.len(),
            transactions = produced,
            dropped,
            "blockchain records processed"
        );
        Ok(ProcessReport {
            transactions: kept,
            zero_impact_dropped: dropped,
        })
    }

    fn process_group(
        &self,
        chain: &str,
        native_symbol: &str,
        hash: &str,
        group: &[&NormalizedRecord],
        addresses: &HashSet<String>,
        token_meta: &std::collections::HashMap<String, crate::providers::TokenInfo>,
    ) -> Result<Option<Transaction>> {
        let primary = group
            .first()
            .ok_or_else(|| Error::Internal("empty transaction group".to_string()))?;

        // Apply authoritative token metadata to movement symbols before
        // asset identity resolution.
        let mut enriched: Vec<NormalizedRecord> = group.iter().map(|r| (*r).clone()).collect();
        let mut spam_symbols: Vec<String> = Vec::new();
        for record in &mut enriched {
            for movement in &mut record.movements {
                if let Some(contract) = &movement.contract_address {
                    if let Some(meta) = token_meta.get(&contract.to_lowercase()) {
                        if let Some(symbol) = &meta.symbol {
                            movement.asset_symbol = symbol.to_uppercase();
                        }
                        if meta.possible_spam {
                            spam_symbols.push(movement.asset_symbol.clone());
                        }
                    }
                }
                if movement.possible_spam {
                    spam_symbols.push(movement.asset_symbol.clone());
                }
            }
        }
        let enriched_refs: Vec<&NormalizedRecord> = enriched.iter().collect();

        // 2–3. Fund flow and fee attribution.
        let flow = fund_flow::analyze(chain, native_symbol, &enriched_refs, addresses)?;

        // 8. Zero-impact groups (unsolicited zero-value transfers) drop.
        if flow.movements.is_empty() && flow.fees.is_empty() {
            return Ok(None);
        }

        // 4. Classification from shape + hints.
        let hint = group
            .iter()
            .find_map(|r| r.transaction_type_hint.as_deref());
        let (operation, ambiguity_note) = classify::classify(&flow.movements, hint);

        let fingerprint = transaction_fingerprint(chain, hash);
        let datetime = chrono::DateTime::from_timestamp_millis(primary.timestamp_ms)
            .ok_or_else(|| {
                Error::Validation(format!("timestamp {} out of range", primary.timestamp_ms))
            })?;

        let mut notes: Vec<Note> = Vec::new();
        if let Some(note) = ambiguity_note {
            notes.push(note);
        }
        // 7. Scam detection annotates, never drops.
        if let Some(note) = scam::detect(&flow.movements, &spam_symbols) {
            notes.push(note);
        }
        if primary.status == crate::model::RecordStatus::Failed {
            notes.push(Note::new(
                "FAILED_ON_CHAIN",
                NoteSeverity::Info,
                "transaction reverted; only the fee left the wallet",
            ));
        }

        let block_height = group.iter().find_map(|r| r.block_height);
        Ok(Some(Transaction {
            id: format!("tx_{}", &fingerprint[..24]),
            source: chain.to_string(),
            external_id: hash.to_string(),
            fingerprint,
            datetime,
            timestamp_ms: primary.timestamp_ms,
            status: match primary.status {
                crate::model::RecordStatus::Success => TransactionStatus::Success,
                crate::model::RecordStatus::Failed => TransactionStatus::Failed,
                crate::model::RecordStatus::Pending => TransactionStatus::Pending,
            },
            from: primary.from.as_deref().map(str::to_lowercase),
            to: primary.to.as_deref().map(str::to_lowercase),
            movements: flow.movements,
            fees: flow.fees,
            operation,
            blockchain: Some(BlockchainInfo {
                name: chain.to_string(),
                block_height,
                transaction_hash: hash.to_string(),
                is_confirmed: primary.status != crate::model::RecordStatus::Pending,
            }),
            notes,
        }))
    }
}

fn filter_zero_impact(transactions: Vec<Transaction>) -> (Vec<Transaction>, usize) {
    let before = transactions.len();
    let kept: Vec<Transaction> = transactions
        .into_iter()
        .filter(|t| !t.is_zero_impact())
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}
