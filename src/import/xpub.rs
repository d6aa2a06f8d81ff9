//! Extended-public-key importer: gap-scans derived addresses, then streams
//! history for the active set.
//!
//! Derivation itself is a capability of the wallet adapter (receive and
//! change branches, sequential indexes); the importer owns the scan policy:
//! walk each branch until `address_gap` consecutive addresses have no
//! activity, then import only the addresses that do, deduplicating records
//! that appear under several addresses (a sweep hits both branches).

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::providers::{ProviderManager, ProviderRequest, ProviderResponse};

use super::blockchain::BlockchainImporter;
use super::{ImportBatch, ImportParams, ImportStream, Importer};

/// Consecutive empty addresses that end a branch scan.
pub const DEFAULT_ADDRESS_GAP: u32 = 20;

/// Derives addresses from an extended public key. Implemented by wallet
/// adapters; the scan logic is chain-agnostic.
pub trait AddressDeriver: Send + Sync {
    /// Derive the address at (branch, index). Branch 0 is the receive path,
    /// branch 1 the change path.
    fn derive(&self, branch: u32, index: u32) -> Result<String>;

    fn branches(&self) -> u32 {
        2
    }
}

pub struct XpubImporter {
    chain: String,
    manager: Arc<ProviderManager>,
    deriver: Arc<dyn AddressDeriver>,
    address_gap: u32,
}

impl XpubImporter {
    pub fn new(
        chain: &str,
        manager: Arc<ProviderManager>,
        deriver: Arc<dyn AddressDeriver>,
    ) -> Self {
        Self {
            chain: chain.to_lowercase(),
            manager,
            deriver,
            address_gap: DEFAULT_ADDRESS_GAP,
        }
    }

    pub fn with_address_gap(mut self, gap: u32) -> Self {
        self.address_gap = gap.max(1);
        self
    }

    /// Walk one branch until `address_gap` consecutive empties. Returns the
    /// active addresses and the number scanned.
    async fn scan_branch(
        &self,
        branch: u32,
        cancel: &CancelToken,
    ) -> Result<(Vec<String>, u32)> {
        let mut active = Vec::new();
        let mut consecutive_empty = 0u32;
        let mut index = 0u32;

        while consecutive_empty < self.address_gap {
            cancel.check()?;
            let address = self.deriver.derive(branch, index)?;
            let response = self
                .manager
                .execute_with_failover(
                    &self.chain,
                    ProviderRequest::HasAddressTransactions {
                        address: address.clone(),
                    },
                    cancel,
                )
                .await?;
            let has_activity = matches!(response, ProviderResponse::HasTransactions(true));
            if has_activity {
                debug!(chain = %self.chain, branch, index, "active address");
                active.push(address);
                consecutive_empty = 0;
            } else {
                consecutive_empty += 1;
            }
            index += 1;
        }
        Ok((active, index))
    }

    /// Gap-scan all branches.
    pub async fn gap_scan(&self, cancel: &CancelToken) -> Result<GapScanResult> {
        let mut active = Vec::new();
        let mut scanned = 0u32;
        for branch in 0..self.deriver.branches() {
            let (branch_active, branch_scanned) = self.scan_branch(branch, cancel).await?;
            active.extend(branch_active);
            scanned += branch_scanned;
        }
        info!(
            chain = %self.chain,
            scanned,
            active = active.len(),
            "gap scan complete"
        );
        Ok(GapScanResult { active, scanned })
    }
}

#[derive(Debug, Clone)]
pub struct GapScanResult {
    pub active: Vec<String>,
    pub scanned: u32,
}

#[async_trait::async_trait]
impl Importer for XpubImporter {
    fn source_id(&self) -> &str {
        &self.chain
    }

    fn validate_params(&self, params: &ImportParams) -> Result<()> {
        if params.address.as_deref().unwrap_or("").is_empty() {
            return Err(Error::InvalidArgs(
                "xpub import requires --address <extended public key>".to_string(),
            ));
        }
        Ok(())
    }

    fn import_streaming(&self, params: ImportParams, cancel: CancelToken) -> ImportStream {
        let chain = self.chain.clone();
        let manager = self.manager.clone();
        let deriver = self.deriver.clone();
        let address_gap = self.address_gap;
        let validation = self.validate_params(&params);

        Box::pin(try_stream! {
            validation?;
            let scanner = XpubImporter {
                chain: chain.clone(),
                manager: manager.clone(),
                deriver,
                address_gap,
            };
            let scan = scanner.gap_scan(&cancel).await?;

            // Stream each active address sequentially, deduplicating by
            // external id across addresses.
            let mut seen: HashSet<String> = HashSet::new();
            for address in scan.active {
                cancel.check()?;
                let importer =
                    BlockchainImporter::new(&chain, manager.clone()).with_operations(&["native"]);
                let address_params = ImportParams {
                    address: Some(address.clone()),
                    since_ms: params.since_ms,
                    until_ms: params.until_ms,
                    ..Default::default()
                };
                let mut inner = importer.import_streaming(address_params, cancel.clone());
                while let Some(item) = inner.next().await {
                    let mut batch: ImportBatch = item?;
                    let mut kept_raw = Vec::new();
                    let mut kept_norm = Vec::new();
                    for (raw, norm) in batch
                        .raw_records
                        .into_iter()
                        .zip(batch.normalized_records.into_iter())
                    {
                        if seen.insert(norm.external_id.clone()) {
                            kept_raw.push(raw);
                            kept_norm.push(norm);
                        } else {
                            batch.stats.deduplicated += 1;
                        }
                    }
                    batch.raw_records = kept_raw;
                    batch.normalized_records = kept_norm;
                    batch
                        .cursor
                        .metadata
                        .insert("address".to_string(), serde_json::Value::from(address.clone()));
                    yield batch;
                }
            }
        })
    }
}
