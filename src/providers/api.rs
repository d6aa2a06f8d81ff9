//! Provider capability interface.
//!
//! Concrete adapters (Blockfrost, Alchemy, exchange APIs, ...) live outside
//! the core and implement [`ApiClient`]; the registry holds their factories
//! and the manager drives them. The interface is deliberately small: one
//! paged streaming entry point plus a handful of point operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::http::{HttpError, HttpErrorKind};
use crate::model::{Cursor, NormalizedRecord};

// ── Operations catalog ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOp {
    GetAddressTransactions,
    GetAddressBalances,
    GetTokenTransactions,
    GetTokenMetadata,
    HasAddressTransactions,
    FetchPrice,
    FetchHistoricalRange,
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Network,
    Timeout,
    RateLimited,
    Auth,
    InvalidParameter,
    Parse,
    NotSupported,
    Upstream,
}

/// A failure from one provider call, carrying enough context for the manager
/// to decide between failover and hard failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}/{operation}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub operation: String,
    pub kind: ProviderErrorKind,
    pub retriable: bool,
    pub status_code: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        provider: &str,
        operation: &str,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let retriable = !matches!(
            kind,
            ProviderErrorKind::Auth
                | ProviderErrorKind::InvalidParameter
                | ProviderErrorKind::NotSupported
        );
        Self {
            provider: provider.to_string(),
            operation: operation.to_string(),
            kind,
            retriable,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn from_http(provider: &str, operation: &str, err: HttpError) -> Self {
        let kind = match err.kind {
            HttpErrorKind::RateLimit => ProviderErrorKind::RateLimited,
            HttpErrorKind::Timeout => ProviderErrorKind::Timeout,
            HttpErrorKind::Server => ProviderErrorKind::Upstream,
            HttpErrorKind::Client if err.status == Some(401) || err.status == Some(403) => {
                ProviderErrorKind::Auth
            }
            HttpErrorKind::Client => ProviderErrorKind::InvalidParameter,
            HttpErrorKind::Unknown => ProviderErrorKind::Network,
        };
        let mut out = Self::new(provider, operation, kind, err.message);
        out.status_code = err.status;
        out
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimited
    }
}

// ── Requests & responses ────────────────────────────────────────────

/// One page request within a streaming operation.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub address: String,
    /// Operation-type tag (`native`, `token_transfers`, `internal`, ...).
    pub operation_type: String,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub cursor: Option<Cursor>,
    pub page_size: u32,
}

/// One page of streamed data. `next_cursor` is self-contained: replaying it
/// on any provider of the same chain (after its replay window) yields
/// strictly non-overlapping data.
#[derive(Debug, Clone)]
pub struct Page {
    pub raw: Vec<Value>,
    pub normalized: Vec<NormalizedRecord>,
    pub next_cursor: Cursor,
    pub is_complete: bool,
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub asset_symbol: String,
    pub contract_address: Option<String>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo {
    pub contract_address: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub decimals: Option<u8>,
    pub possible_spam: bool,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub asset_symbol: String,
    /// Currency the provider actually quoted in; may be a stablecoin even
    /// when USD was requested.
    pub currency: String,
    pub price: Decimal,
    /// Provider that produced the quote.
    pub source: String,
    pub exact: bool,
}

/// Point (non-streaming) operations.
#[derive(Debug, Clone)]
pub enum ProviderRequest {
    AddressBalances {
        address: String,
    },
    HasAddressTransactions {
        address: String,
    },
    TokenMetadata {
        contracts: Vec<String>,
    },
    Price {
        asset_symbol: String,
        currency: String,
        timestamp_ms: i64,
    },
}

impl ProviderRequest {
    pub fn operation(&self) -> ProviderOp {
        match self {
            ProviderRequest::AddressBalances { .. } => ProviderOp::GetAddressBalances,
            ProviderRequest::HasAddressTransactions { .. } => ProviderOp::HasAddressTransactions,
            ProviderRequest::TokenMetadata { .. } => ProviderOp::GetTokenMetadata,
            ProviderRequest::Price { .. } => ProviderOp::FetchPrice,
        }
    }

    pub fn operation_name(&self) -> &'static str {
        match self {
            ProviderRequest::AddressBalances { .. } => "get_address_balances",
            ProviderRequest::HasAddressTransactions { .. } => "has_address_transactions",
            ProviderRequest::TokenMetadata { .. } => "get_token_metadata",
            ProviderRequest::Price { .. } => "fetch_price",
        }
    }

    /// Cache key for the manager's read-through cache. Price lookups bucket
    /// the timestamp to a day so nearby requests share an entry.
    pub fn cache_key(&self) -> Option<String> {
        match self {
            ProviderRequest::AddressBalances { .. } => None,
            ProviderRequest::HasAddressTransactions { address } => {
                Some(format!("has_txs:{address}"))
            }
            ProviderRequest::TokenMetadata { contracts } => {
                let mut sorted: Vec<&str> = contracts.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                Some(format!("token_meta:{}", sorted.join(",")))
            }
            ProviderRequest::Price {
                asset_symbol,
                currency,
                timestamp_ms,
            } => {
                let day = timestamp_ms / 86_400_000;
                Some(format!("price:{asset_symbol}:{currency}:{day}"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProviderResponse {
    Balances(Vec<Balance>),
    HasTransactions(bool),
    TokenMetadata(Vec<TokenInfo>),
    Price(Option<PriceQuote>),
}

// ── Client trait ────────────────────────────────────────────────────

/// A typed client for one provider. Implementations wrap an [`HttpClient`]
/// and translate between the provider's wire format and the normalized
/// model.
///
/// [`HttpClient`]: crate::http::HttpClient
#[async_trait]
pub trait ApiClient: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch one page of a streaming operation.
    async fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancelToken,
    ) -> Result<Page, ProviderError>;

    /// Execute a point operation.
    async fn execute(
        &self,
        request: &ProviderRequest,
        cancel: &CancelToken,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Widen a cursor authored by another provider so resuming here cannot
    /// skip data (reorg / indexing-lag tolerance). Providers with precise
    /// pagination return the cursor unchanged.
    fn apply_replay_window(&self, cursor: &Cursor) -> Cursor {
        cursor.clone()
    }
}
