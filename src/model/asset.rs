use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical asset identity.
///
/// Rendered as one of:
/// - `blockchain:<chain>:native`
/// - `blockchain:<chain>:<contractAddressOrSymbol>` (lower-cased)
/// - `exchange:<name>:<symbol>`
/// - `fiat:<iso>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AssetId {
    /// The chain's primary native currency.
    Native { chain: String },
    /// A token on a chain, identified by contract address, or by lower-cased
    /// symbol for secondary native currencies without a contract.
    Token { chain: String, reference: String },
    /// An asset held on a centralized exchange.
    Exchange { exchange: String, symbol: String },
    /// A fiat currency by ISO 4217 code.
    Fiat { currency: String },
}

impl AssetId {
    pub fn native(chain: &str) -> Self {
        AssetId::Native {
            chain: chain.to_lowercase(),
        }
    }

    /// Token identity from a contract address or secondary-native symbol.
    pub fn token(chain: &str, reference: &str) -> Self {
        AssetId::Token {
            chain: chain.to_lowercase(),
            reference: reference.to_lowercase(),
        }
    }

    pub fn exchange(exchange: &str, symbol: &str) -> Self {
        AssetId::Exchange {
            exchange: exchange.to_lowercase(),
            symbol: symbol.to_uppercase(),
        }
    }

    pub fn fiat(currency: &str) -> Self {
        AssetId::Fiat {
            currency: currency.to_uppercase(),
        }
    }

    pub fn is_fiat(&self) -> bool {
        matches!(self, AssetId::Fiat { .. })
    }

    /// The chain this asset lives on, if it is a blockchain asset.
    pub fn chain(&self) -> Option<&str> {
        match self {
            AssetId::Native { chain } | AssetId::Token { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetId::Native { chain } => write!(f, "blockchain:{chain}:native"),
            AssetId::Token { chain, reference } => write!(f, "blockchain:{chain}:{reference}"),
            AssetId::Exchange { exchange, symbol } => write!(f, "exchange:{exchange}:{symbol}"),
            AssetId::Fiat { currency } => write!(f, "fiat:{currency}"),
        }
    }
}

impl FromStr for AssetId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        match kind {
            "blockchain" => {
                let chain = parts.next().ok_or_else(|| format!("missing chain in {s:?}"))?;
                let reference = parts
                    .next()
                    .ok_or_else(|| format!("missing asset reference in {s:?}"))?;
                if chain.is_empty() || reference.is_empty() {
                    return Err(format!("empty segment in asset id {s:?}"));
                }
                if reference == "native" {
                    Ok(AssetId::native(chain))
                } else {
                    Ok(AssetId::token(chain, reference))
                }
            }
            "exchange" => {
                let exchange = parts
                    .next()
                    .ok_or_else(|| format!("missing exchange in {s:?}"))?;
                let symbol = parts.next().ok_or_else(|| format!("missing symbol in {s:?}"))?;
                if exchange.is_empty() || symbol.is_empty() {
                    return Err(format!("empty segment in asset id {s:?}"));
                }
                Ok(AssetId::exchange(exchange, symbol))
            }
            "fiat" => {
                let currency = parts
                    .next()
                    .ok_or_else(|| format!("missing currency in {s:?}"))?;
                if currency.is_empty() || parts.next().is_some() {
                    return Err(format!("malformed fiat asset id {s:?}"));
                }
                Ok(AssetId::fiat(currency))
            }
            _ => Err(format!("unknown asset id namespace in {s:?}")),
        }
    }
}

impl TryFrom<String> for AssetId {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AssetId> for String {
    fn from(id: AssetId) -> String {
        id.to_string()
    }
}
