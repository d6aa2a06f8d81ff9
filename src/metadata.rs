//! Token metadata service: cache-first contract → {symbol, decimals, spam}
//! resolution with background refresh.
//!
//! Lookups hit a small in-memory LRU, then the token database. Entries older
//! than the staleness threshold are still served, but a refresh is kicked
//! off in the background; callers never block on freshness.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::providers::TokenInfo;
use crate::store::TokenStore;

/// Entries older than this are refreshed on next touch.
pub const STALENESS: Duration = Duration::from_secs(7 * 24 * 3600);

const HOT_CACHE_CAP: usize = 4096;

pub struct TokenMetadataService {
    store: Arc<TokenStore>,
    hot: Mutex<LruCache<String, TokenInfo>>,
}

impl TokenMetadataService {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self {
            store,
            hot: Mutex::new(LruCache::new(
                NonZeroUsize::new(HOT_CACHE_CAP).expect("non-zero capacity"),
            )),
        }
    }

    pub fn is_stale(info: &TokenInfo) -> bool {
        let age = Utc::now().signed_duration_since(info.refreshed_at);
        age.num_seconds() > STALENESS.as_secs() as i64
    }

    pub async fn get_by_contract(&self, contract: &str) -> Result<Option<TokenInfo>> {
        let key = contract.to_lowercase();
        if let Some(hit) = self.hot.lock().await.get(&key) {
            return Ok(Some(hit.clone()));
        }
        let loaded = self.store.get(&key).await?;
        if let Some(info) = &loaded {
            self.hot.lock().await.put(key, info.clone());
        }
        Ok(loaded)
    }

    /// Batch lookup; one pass over the hot cache, one round-trip to the
    /// store for the rest. Missing contracts are absent from the result.
    pub async fn get_by_contracts(
        &self,
        contracts: &[String],
    ) -> Result<HashMap<String, TokenInfo>> {
        let mut out = HashMap::new();
        let mut misses = Vec::new();
        {
            let mut hot = self.hot.lock().await;
            for contract in contracts {
                let key = contract.to_lowercase();
                match hot.get(&key) {
                    Some(info) => {
                        out.insert(key, info.clone());
                    }
                    None => misses.push(key),
                }
            }
        }
        if !misses.is_empty() {
            for info in self.store.get_many(&misses).await? {
                self.hot
                    .lock()
                    .await
                    .put(info.contract_address.clone(), info.clone());
                out.insert(info.contract_address.clone(), info);
            }
        }
        Ok(out)
    }

    /// Merge-save to the store and refresh the hot cache.
    pub async fn save(&self, info: &TokenInfo) -> Result<()> {
        self.store.save(info).await?;
        if let Some(merged) = self.store.get(&info.contract_address).await? {
            self.hot
                .lock()
                .await
                .put(merged.contract_address.clone(), merged);
        }
        Ok(())
    }

    pub async fn contracts_for_symbol(&self, symbol: &str) -> Result<Vec<String>> {
        self.store.contracts_for_symbol(symbol).await
    }

    /// Resolve metadata for a set of contracts. Fresh cache entries are
    /// served directly; missing contracts are fetched through `fetch` now;
    /// stale entries are served as-is and refreshed in the background.
    pub async fn resolve<F, Fut>(
        self: &Arc<Self>,
        contracts: &[String],
        fetch: F,
    ) -> Result<HashMap<String, TokenInfo>>
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Vec<TokenInfo>>> + Send + 'static,
    {
        let mut resolved = self.get_by_contracts(contracts).await?;

        let mut missing = Vec::new();
        let mut stale = Vec::new();
        for contract in contracts {
            let key = contract.to_lowercase();
            match resolved.get(&key) {
                None => missing.push(key),
                Some(info) if Self::is_stale(info) => stale.push(key),
                Some(_) => {}
            }
        }

        if !missing.is_empty() {
            debug!(count = missing.len(), "fetching unknown token metadata");
            match fetch(missing.clone()).await {
                Ok(fetched) => {
                    for info in fetched {
                        self.save(&info).await?;
                        resolved.insert(info.contract_address.to_lowercase(), info);
                    }
                }
                Err(e) => {
                    // Metadata is an enrichment; movements keep their
                    // provider-reported symbols when the lookup fails.
                    warn!(error = %e, "token metadata fetch failed");
                }
            }
        }

        if !stale.is_empty() {
            self.refresh_in_background(stale, fetch);
        }

        Ok(resolved)
    }

    /// Fire-and-forget refresh of stale entries.
    pub fn refresh_in_background<F, Fut>(self: &Arc<Self>, contracts: Vec<String>, fetch: F)
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Vec<TokenInfo>>> + Send + 'static,
    {
        let service = self.clone();
        tokio::spawn(async move {
            debug!(count = contracts.len(), "background token metadata refresh");
            match fetch(contracts).await {
                Ok(fetched) => {
                    for info in fetched {
                        if let Err(e) = service.save(&info).await {
                            warn!(error = %e, "saving refreshed token metadata failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "background token metadata refresh failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(contract: &str, symbol: &str, age_days: i64) -> TokenInfo {
        TokenInfo {
            contract_address: contract.to_string(),
            symbol: Some(symbol.to_string()),
            name: None,
            decimals: Some(18),
            possible_spam: false,
            refreshed_at: Utc::now() - chrono::Duration::days(age_days),
        }
    }

    fn service() -> Arc<TokenMetadataService> {
        Arc::new(TokenMetadataService::new(Arc::new(
            TokenStore::open_in_memory().unwrap(),
        )))
    }

    #[tokio::test]
    async fn resolve_fetches_unknown_contracts_once() {
        let svc = service();
        svc.save(&info("0xknown", "AAA", 0)).await.unwrap();

        let resolved = svc
            .resolve(
                &["0xknown".to_string(), "0xnew".to_string()],
                |contracts| async move {
                    Ok(contracts
                        .into_iter()
                        .map(|c| info(&c, "BBB", 0))
                        .collect())
                },
            )
            .await
            .unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["0xknown"].symbol.as_deref(), Some("AAA"));
        assert_eq!(resolved["0xnew"].symbol.as_deref(), Some("BBB"));
        // Fetched entry was persisted.
        assert!(svc.get_by_contract("0xnew").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_entries_are_served_without_blocking() {
        let svc = service();
        svc.save(&info("0xold", "OLD", 30)).await.unwrap();

        let resolved = svc
            .resolve(&["0xold".to_string()], |contracts| async move {
                Ok(contracts.into_iter().map(|c| info(&c, "NEW", 0)).collect())
            })
            .await
            .unwrap();
        // Served immediately with the stale symbol.
        assert_eq!(resolved["0xold"].symbol.as_deref(), Some("OLD"));
    }

    #[tokio::test]
    async fn fetch_failure_is_not_fatal() {
        let svc = service();
        let resolved = svc
            .resolve(&["0xmiss".to_string()], |_| async {
                Err(crate::error::Error::Network("down".to_string()))
            })
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn staleness_threshold() {
        assert!(!TokenMetadataService::is_stale(&info("0x", "X", 6)));
        assert!(TokenMetadataService::is_stale(&info("0x", "X", 8)));
    }
}
