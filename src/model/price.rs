use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceGranularity {
    /// Price at (or very near) the transaction's timestamp.
    Exact,
    /// Interpolated between surrounding observations.
    Interpolated,
    /// Daily close / central-bank daily rate.
    Daily,
}

/// A fiat price attached to a movement or fee.
///
/// `source` records provenance: a market provider name, `derived-trade`,
/// `link-propagated`, `manual`, or a composite like `coingecko+usdt-rate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub price: Decimal,
    pub currency: String,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub granularity: PriceGranularity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_rate_to_usd: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fx_timestamp: Option<DateTime<Utc>>,
    /// For derived-trade and link-propagated prices: the movement this price
    /// was derived from, as `<transaction fingerprint>:<asset symbol>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl PriceRecord {
    /// A price from a named source. Returns `None` for non-positive prices,
    /// which are never valid.
    pub fn new(
        price: Decimal,
        currency: &str,
        source: &str,
        granularity: PriceGranularity,
        fetched_at: DateTime<Utc>,
    ) -> Option<Self> {
        if price <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            price,
            currency: currency.to_uppercase(),
            source: source.to_string(),
            fetched_at,
            granularity,
            fx_rate_to_usd: None,
            fx_source: None,
            fx_timestamp: None,
            provenance: None,
        })
    }

    pub fn is_usd(&self) -> bool {
        self.currency == "USD"
    }
}

pub const SOURCE_DERIVED_TRADE: &str = "derived-trade";
pub const SOURCE_LINK_PROPAGATED: &str = "link-propagated";
pub const SOURCE_MANUAL: &str = "manual";

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_non_positive_prices() {
        let now = Utc::now();
        assert!(PriceRecord::new(dec!(0), "USD", "x", PriceGranularity::Exact, now).is_none());
        assert!(PriceRecord::new(dec!(-1), "USD", "x", PriceGranularity::Exact, now).is_none());
        assert!(PriceRecord::new(dec!(0.01), "usd", "x", PriceGranularity::Exact, now).is_some());
    }
}
