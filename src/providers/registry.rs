//! Provider registry: the static catalog of provider capabilities and the
//! factories that build typed clients.
//!
//! Population happens once at startup through explicit [`Registry::register`]
//! calls in a deterministic order; lookups afterwards are pure. A provider
//! that requires an API key is enrolled only when its environment variable is
//! present — a missing key disables the provider, it never fails the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::http::rate_limit::RateLimitConfig;

use super::api::{ApiClient, ProviderOp};

// ── Metadata ────────────────────────────────────────────────────────

/// Conservative cursor rewind applied when a cursor written by another
/// provider is replayed here. Zero means precise pagination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    /// Rewind for block-number cursors, in blocks.
    pub blocks: u64,
    /// Rewind for timestamp cursors, in milliseconds.
    pub millis: i64,
}

#[derive(Debug, Clone)]
pub struct ProviderMetadata {
    pub name: String,
    /// Chains this provider serves; a multi-chain provider registers the
    /// same implementation against each.
    pub supported_chains: Vec<String>,
    pub operations: Vec<ProviderOp>,
    pub rate_limit: RateLimitConfig,
    pub timeout: Duration,
    /// Stable preference order within a chain; lower is preferred.
    pub priority: u32,
    /// Environment variable holding the API key, when one is required.
    pub api_key_env: Option<String>,
    pub replay_window: ReplayWindow,
}

impl ProviderMetadata {
    pub fn supports(&self, op: ProviderOp) -> bool {
        self.operations.contains(&op)
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Context handed to a factory when the provider is enrolled.
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub metadata: ProviderMetadata,
}

pub type Factory =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn ApiClient>> + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredProvider {
    pub metadata: ProviderMetadata,
    pub client: Arc<dyn ApiClient>,
}

/// Catalog of enrolled providers, keyed by `(chain, provider name)`.
#[derive(Default)]
pub struct Registry {
    providers: HashMap<(String, String), RegisteredProvider>,
    /// Providers skipped at registration (missing key), for diagnostics.
    skipped: Vec<(String, String)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a provider for each chain it supports. A required-but-missing
    /// API key skips enrollment with a warning; a factory error is surfaced.
    pub fn register(&mut self, metadata: ProviderMetadata, factory: Factory) -> Result<()> {
        let api_key = match &metadata.api_key_env {
            Some(env_var) => match std::env::var(env_var) {
                Ok(key) if !key.is_empty() => Some(key),
                _ => {
                    warn!(
                        provider = %metadata.name,
                        env_var = %env_var,
                        "api key not set; provider disabled"
                    );
                    for chain in &metadata.supported_chains {
                        self.skipped.push((chain.clone(), metadata.name.clone()));
                    }
                    return Ok(());
                }
            },
            None => None,
        };

        let config = ProviderConfig {
            api_key,
            metadata: metadata.clone(),
        };
        let client = factory(&config)?;

        for chain in &metadata.supported_chains {
            let key = (chain.to_lowercase(), metadata.name.clone());
            if self.providers.contains_key(&key) {
                return Err(Error::ConflictingState(format!(
                    "provider {} already registered for chain {}",
                    metadata.name, chain
                )));
            }
            info!(provider = %metadata.name, chain = %chain, "provider registered");
            self.providers.insert(key, RegisteredProvider {
                metadata: metadata.clone(),
                client: client.clone(),
            });
        }
        Ok(())
    }

    /// Providers for a chain supporting `op`, in stable preference order.
    pub fn providers_for(&self, chain: &str, op: ProviderOp) -> Vec<RegisteredProvider> {
        let chain = chain.to_lowercase();
        let mut out: Vec<RegisteredProvider> = self
            .providers
            .iter()
            .filter(|((c, _), p)| *c == chain && p.metadata.supports(op))
            .map(|(_, p)| p.clone())
            .collect();
        out.sort_by(|a, b| {
            a.metadata
                .priority
                .cmp(&b.metadata.priority)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        out
    }

    pub fn get(&self, chain: &str, name: &str) -> Option<&RegisteredProvider> {
        self.providers
            .get(&(chain.to_lowercase(), name.to_string()))
    }

    pub fn chains(&self) -> Vec<String> {
        let mut chains: Vec<String> =
            self.providers.keys().map(|(c, _)| c.clone()).collect();
        chains.sort();
        chains.dedup();
        chains
    }

    /// All enrolled providers, `(chain, metadata)`, sorted for display.
    pub fn catalog(&self) -> Vec<(String, ProviderMetadata)> {
        let mut out: Vec<(String, ProviderMetadata)> = self
            .providers
            .iter()
            .map(|((chain, _), p)| (chain.clone(), p.metadata.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        out
    }

    /// Providers skipped for missing API keys, `(chain, name)`.
    pub fn skipped(&self) -> &[(String, String)] {
        &self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;

    fn meta(name: &str, chains: &[&str], priority: u32, env: Option<&str>) -> ProviderMetadata {
        ProviderMetadata {
            name: name.to_string(),
            supported_chains: chains.iter().map(|c| c.to_string()).collect(),
            operations: vec![ProviderOp::GetAddressTransactions, ProviderOp::FetchPrice],
            rate_limit: RateLimitConfig::per_second(10),
            timeout: Duration::from_secs(10),
            priority,
            api_key_env: env.map(String::from),
            replay_window: ReplayWindow::default(),
        }
    }

    fn mock_factory(name: &str) -> Factory {
        let name = name.to_string();
        Arc::new(move |_config| Ok(Arc::new(MockProvider::new(&name)) as Arc<dyn ApiClient>))
    }

    #[test]
    fn registers_against_all_supported_chains() {
        let mut registry = Registry::new();
        registry
            .register(meta("multi", &["ethereum", "polygon"], 0, None), mock_factory("multi"))
            .unwrap();

        assert!(registry.get("ethereum", "multi").is_some());
        assert!(registry.get("polygon", "multi").is_some());
        assert_eq!(registry.chains(), vec!["ethereum", "polygon"]);
    }

    #[test]
    fn missing_api_key_skips_enrollment() {
        let mut registry = Registry::new();
        registry
            .register(
                meta("keyed", &["ethereum"], 0, Some("EXITBOOK_TEST_NO_SUCH_KEY")),
                mock_factory("keyed"),
            )
            .unwrap();

        assert!(registry.get("ethereum", "keyed").is_none());
        assert_eq!(registry.skipped(), &[("ethereum".to_string(), "keyed".to_string())]);
    }

    #[test]
    fn lookup_orders_by_priority_then_name() {
        let mut registry = Registry::new();
        registry
            .register(meta("bravo", &["ethereum"], 1, None), mock_factory("bravo"))
            .unwrap();
        registry
            .register(meta("alpha", &["ethereum"], 0, None), mock_factory("alpha"))
            .unwrap();
        registry
            .register(meta("charlie", &["ethereum"], 1, None), mock_factory("charlie"))
            .unwrap();

        let names: Vec<String> = registry
            .providers_for("ethereum", ProviderOp::GetAddressTransactions)
            .iter()
            .map(|p| p.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(meta("dup", &["ethereum"], 0, None), mock_factory("dup"))
            .unwrap();
        assert!(
            registry
                .register(meta("dup", &["ethereum"], 0, None), mock_factory("dup"))
                .is_err()
        );
    }
}
