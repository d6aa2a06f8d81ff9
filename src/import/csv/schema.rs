//! Declared schemas for supported CSV export file types.
//!
//! Each file type names its required header set; a file is matched to a type
//! by its header row, and every data row is deserialized under that type's
//! schema. Rows that fail validation are skipped and counted, never fatal.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Generic ledger export: one row per balance-affecting entry.
    Ledger,
    /// Trade export: one row per fill, legs share an order id.
    Trades,
}

impl FileKind {
    pub fn operation_type(&self) -> &'static str {
        match self {
            FileKind::Ledger => "ledger",
            FileKind::Trades => "trades",
        }
    }

    pub fn required_headers(&self) -> &'static [&'static str] {
        match self {
            FileKind::Ledger => &["txid", "time", "type", "asset", "amount", "fee"],
            FileKind::Trades => &[
                "txid", "ordertxid", "pair", "time", "type", "price", "cost", "fee", "vol",
            ],
        }
    }

    /// Match a header row against the declared schemas. The header must
    /// contain every required column of exactly one type; `Trades` is
    /// checked first since its header is a superset-shaped cousin of
    /// `Ledger`.
    pub fn detect(headers: &[String]) -> Result<FileKind> {
        let lower: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
        let has_all = |kind: FileKind| {
            kind.required_headers()
                .iter()
                .all(|required| lower.iter().any(|h| h == required))
        };
        if has_all(FileKind::Trades) {
            Ok(FileKind::Trades)
        } else if has_all(FileKind::Ledger) {
            Ok(FileKind::Ledger)
        } else {
            Err(Error::Validation(format!(
                "csv header {lower:?} does not match any declared schema"
            )))
        }
    }
}

// ── Row schemas ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerRow {
    pub txid: String,
    #[serde(default)]
    pub refid: String,
    pub time: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub subtype: String,
    pub asset: String,
    pub amount: Decimal,
    pub fee: Decimal,
    #[serde(default)]
    pub balance: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradesRow {
    pub txid: String,
    pub ordertxid: String,
    pub pair: String,
    pub time: String,
    #[serde(rename = "type")]
    pub side: String,
    #[serde(default)]
    pub ordertype: String,
    pub price: Decimal,
    pub cost: Decimal,
    pub fee: Decimal,
    pub vol: Decimal,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub txhash: Option<String>,
}

/// Parse an export timestamp: unix seconds (fractional allowed) or RFC 3339
/// / `YYYY-MM-DD HH:MM:SS` forms, to epoch milliseconds.
pub fn parse_time_ms(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return Ok((secs * 1000.0) as i64);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc().timestamp_millis());
    }
    Err(Error::Validation(format!("unparseable timestamp {raw:?}")))
}

/// Split a trade pair like `BTC/USD` (or `XBTUSD` with a known quote) into
/// base and quote symbols.
pub fn split_pair(pair: &str) -> Result<(String, String)> {
    if let Some((base, quote)) = pair.split_once('/') {
        if base.is_empty() || quote.is_empty() {
            return Err(Error::Validation(format!("malformed pair {pair:?}")));
        }
        return Ok((base.to_uppercase(), quote.to_uppercase()));
    }
    let upper = pair.to_uppercase();
    for quote in ["USDT", "USDC", "USD", "EUR", "GBP", "BTC", "ETH"] {
        if let Some(base) = upper.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok((base.to_string(), quote.to_string()));
            }
        }
    }
    Err(Error::Validation(format!("cannot split trade pair {pair:?}")))
}
