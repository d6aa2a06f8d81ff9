//! Blockchain importer: streams address history from the provider manager,
//! one batch per provider page, with operation types fanned out concurrently.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::model::{RawRecord, transaction_fingerprint};
use crate::providers::{ProviderManager, StreamRequest};

use super::{ImportBatch, ImportParams, ImportStats, ImportStream, Importer};

/// Operation types a chain importer drives by default.
pub const DEFAULT_OPERATIONS: &[&str] = &["native", "token_transfers", "internal"];

/// Concurrent operation-type fan-out bound.
const OPERATION_FANOUT: usize = 3;

pub struct BlockchainImporter {
    chain: String,
    manager: Arc<ProviderManager>,
    operation_types: Vec<String>,
    page_size: u32,
}

impl BlockchainImporter {
    pub fn new(chain: &str, manager: Arc<ProviderManager>) -> Self {
        Self {
            chain: chain.to_lowercase(),
            manager,
            operation_types: DEFAULT_OPERATIONS.iter().map(|s| s.to_string()).collect(),
            page_size: 100,
        }
    }

    pub fn with_operations(mut self, operation_types: &[&str]) -> Self {
        self.operation_types = operation_types.iter().map(|s| s.to_string()).collect();
        self
    }

    /// One stream per operation type; each batch is tagged with its
    /// operation and carries its own cursor.
    fn operation_stream(
        &self,
        address: String,
        operation_type: String,
        params: &ImportParams,
        cancel: CancelToken,
    ) -> ImportStream {
        let manager = self.manager.clone();
        let chain = self.chain.clone();
        let cursor = params.cursors.get(&operation_type).cloned();
        let request = StreamRequest {
            address: address.clone(),
            operation_type: operation_type.clone(),
            since_ms: params.since_ms,
            until_ms: params.until_ms,
            cursor,
            page_size: self.page_size,
        };
        let source = chain.clone();

        let stream = manager
            .execute_streaming(chain, request, cancel)
            .map(move |item| {
                item.map(|batch| {
                    let received_at = Utc::now();
                    let raw_records: Vec<RawRecord> = batch
                        .raw
                        .iter()
                        .zip(batch.normalized.iter())
                        .map(|(raw, record)| RawRecord {
                            provider_name: batch.stats.provider.clone(),
                            source_address: Some(address.clone()),
                            fingerprint: transaction_fingerprint(&source, &record.external_id),
                            received_at,
                            payload: raw.clone(),
                        })
                        .collect();
                    ImportBatch {
                        raw_records,
                        normalized_records: batch.normalized,
                        cursor: batch.cursor,
                        operation_type: operation_type.clone(),
                        is_complete: batch.is_complete,
                        stats: ImportStats {
                            fetched: batch.stats.fetched,
                            invalid: 0,
                            deduplicated: batch.stats.deduplicated,
                        },
                    }
                })
            });
        Box::pin(stream)
    }
}

#[async_trait::async_trait]
impl Importer for BlockchainImporter {
    fn source_id(&self) -> &str {
        &self.chain
    }

    fn validate_params(&self, params: &ImportParams) -> Result<()> {
        if params.address.as_deref().unwrap_or("").is_empty() {
            return Err(Error::InvalidArgs(format!(
                "importing from {} requires --address",
                self.chain
            )));
        }
        if let (Some(since), Some(until)) = (params.since_ms, params.until_ms) {
            if since > until {
                return Err(Error::InvalidArgs("--since is after --until".to_string()));
            }
        }
        Ok(())
    }

    fn import_streaming(&self, params: ImportParams, cancel: CancelToken) -> ImportStream {
        if let Err(err) = self.validate_params(&params) {
            return Box::pin(futures::stream::once(async move { Err(err) }));
        }
        let address = params.address.clone().unwrap_or_default().to_lowercase();

        // Skip operation types whose cursor already says complete, unless
        // the caller rewound it.
        let operations: Vec<String> = self
            .operation_types
            .iter()
            .filter(|op| {
                let done = params
                    .cursors
                    .get(op.as_str())
                    .map(|c| c.is_complete)
                    .unwrap_or(false);
                if done {
                    debug!(chain = %self.chain, operation = %op, "cursor complete; skipping");
                }
                !done
            })
            .cloned()
            .collect();

        let streams: Vec<ImportStream> = operations
            .into_iter()
            .map(|op| self.operation_stream(address.clone(), op, &params, cancel.clone()))
            .collect();

        // Bounded fan-out across operation types; batches within one
        // operation stay in producer order.
        Box::pin(futures::stream::iter(streams).flatten_unordered(Some(OPERATION_FANOUT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::rate_limit::{ManualClock, RateLimitConfig};
    use crate::providers::api::ProviderOp;
    use crate::providers::mock::{MockProvider, mock_page};
    use crate::providers::registry::{ProviderMetadata, Registry, ReplayWindow};
    use crate::providers::{ApiClient, ManagerConfig};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn test_manager(provider: Arc<MockProvider>) -> Arc<ProviderManager> {
        let mut registry = Registry::new();
        let client: Arc<dyn ApiClient> = provider;
        registry
            .register(
                ProviderMetadata {
                    name: "mock".to_string(),
                    supported_chains: vec!["testchain".to_string()],
                    operations: vec![ProviderOp::GetAddressTransactions],
                    rate_limit: RateLimitConfig::per_second(100),
                    timeout: Duration::from_secs(5),
                    priority: 0,
                    api_key_env: None,
                    replay_window: ReplayWindow::default(),
                },
                Arc::new(move |_| Ok(client.clone())),
            )
            .unwrap();
        Arc::new(ProviderManager::with_clock(
            Arc::new(registry),
            ManagerConfig::default(),
            Arc::new(ManualClock::new()),
        ))
    }

    #[tokio::test]
    async fn emits_batches_tagged_by_operation() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_page("native", Ok(mock_page("native", &["n1"], 10, true)));
        provider.push_page(
            "token_transfers",
            Ok(mock_page("token_transfers", &["t1", "t2"], 10, true)),
        );

        let importer = BlockchainImporter::new("testchain", test_manager(provider))
            .with_operations(&["native", "token_transfers"]);
        let params = ImportParams {
            address: Some("0xABC".to_string()),
            ..Default::default()
        };

        let batches: Vec<ImportBatch> = importer
            .import_streaming(params, CancelToken::new())
            .map(|b| b.unwrap())
            .collect()
            .await;

        assert_eq!(batches.len(), 2);
        let mut ops: Vec<&str> = batches.iter().map(|b| b.operation_type.as_str()).collect();
        ops.sort();
        assert_eq!(ops, vec!["native", "token_transfers"]);
        for batch in &batches {
            assert_eq!(batch.raw_records.len(), batch.normalized_records.len());
            assert!(batch.is_complete);
            for (raw, norm) in batch.raw_records.iter().zip(&batch.normalized_records) {
                assert_eq!(
                    raw.fingerprint,
                    transaction_fingerprint("testchain", &norm.external_id)
                );
                assert_eq!(raw.source_address.as_deref(), Some("0xabc"));
            }
        }
    }

    #[tokio::test]
    async fn completed_cursor_skips_operation() {
        let provider = Arc::new(MockProvider::new("mock"));
        provider.push_page("native", Ok(mock_page("native", &["n1"], 10, true)));

        let importer =
            BlockchainImporter::new("testchain", test_manager(provider.clone()))
                .with_operations(&["native", "token_transfers"]);

        let mut cursors = BTreeMap::new();
        let mut done = crate::model::Cursor::new(
            crate::model::cursor::CursorPrimary::block_number(99),
            "mock",
        );
        done.is_complete = true;
        cursors.insert("token_transfers".to_string(), done);

        let params = ImportParams {
            address: Some("0xabc".to_string()),
            cursors,
            ..Default::default()
        };

        let batches: Vec<ImportBatch> = importer
            .import_streaming(params, CancelToken::new())
            .map(|b| b.unwrap())
            .collect()
            .await;

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].operation_type, "native");
    }

    #[tokio::test]
    async fn missing_address_is_invalid() {
        let provider = Arc::new(MockProvider::new("mock"));
        let importer = BlockchainImporter::new("testchain", test_manager(provider));
        let result: Vec<_> = importer
            .import_streaming(ImportParams::default(), CancelToken::new())
            .collect()
            .await;
        assert_eq!(result.len(), 1);
        assert!(matches!(result[0], Err(Error::InvalidArgs(_))));
    }
}
