//! Scam-token heuristics.
//!
//! The detector combines the provider-declared spam flag with a table of
//! symbol patterns. The table is data, not logic: rules are matched against
//! the upper-cased symbol and each carries its own reason string.

use crate::model::transaction::Movements;
use crate::model::{Note, NoteSeverity};

/// One pattern rule. `Contains` matches a substring; `UrlLike` matches
/// symbols that smuggle a domain in.
enum Rule {
    Contains(&'static str, &'static str),
    UrlLike(&'static str),
}

/// Symbol pattern table. Extend by adding rows.
const RULES: &[Rule] = &[
    Rule::UrlLike("symbol embeds a URL"),
    Rule::Contains("CLAIM", "claim-bait symbol"),
    Rule::Contains("AIRDROP", "airdrop-bait symbol"),
    Rule::Contains("REWARD", "reward-bait symbol"),
    Rule::Contains("VISIT", "visit-bait symbol"),
    Rule::Contains("BONUS", "bonus-bait symbol"),
    Rule::Contains("GIFT", "gift-bait symbol"),
    Rule::Contains("VOUCHER", "voucher-bait symbol"),
];

fn symbol_reason(symbol: &str) -> Option<&'static str> {
    let upper = symbol.to_uppercase();
    for rule in RULES {
        match rule {
            Rule::Contains(needle, reason) if upper.contains(needle) => return Some(reason),
            Rule::UrlLike(reason) => {
                let lower = symbol.to_lowercase();
                if lower.contains("http")
                    || lower.contains("www.")
                    || lower.contains(".com")
                    || lower.contains(".io")
                    || lower.contains(".xyz")
                {
                    return Some(reason);
                }
            }
            _ => {}
        }
    }
    None
}

/// Scan a transaction's movements; returns a `SCAM_TOKEN` warning note when
/// any movement looks like spam. The transaction itself is never dropped.
pub fn detect(movements: &Movements, provider_spam_symbols: &[String]) -> Option<Note> {
    let mut suspects: Vec<String> = Vec::new();
    for m in movements.inflows.iter().chain(&movements.outflows) {
        let provider_flagged = provider_spam_symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&m.asset_symbol));
        let reason = if provider_flagged {
            Some("provider flagged as possible spam")
        } else {
            symbol_reason(&m.asset_symbol)
        };
        if let Some(reason) = reason {
            suspects.push(format!("{} ({reason})", m.asset_symbol));
        }
    }
    if suspects.is_empty() {
        return None;
    }
    let mut note = Note::new(
        "SCAM_TOKEN",
        NoteSeverity::Warning,
        format!("suspected scam token(s): {}", suspects.join(", ")),
    );
    note.metadata = serde_json::json!({ "symbols": suspects });
    Some(note)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetId, AssetMovement};
    use rust_decimal_macros::dec;

    fn movements_with(symbol: &str) -> Movements {
        Movements {
            inflows: vec![AssetMovement::new(
                AssetId::token("ethereum", "0xbad"),
                symbol,
                dec!(1000),
            )],
            outflows: vec![],
        }
    }

    #[test]
    fn url_symbols_are_flagged() {
        assert!(detect(&movements_with("Visit www.evil.com"), &[]).is_some());
        assert!(detect(&movements_with("claim-eth.io"), &[]).is_some());
    }

    #[test]
    fn bait_words_are_flagged() {
        let note = detect(&movements_with("AIRDROP2024"), &[]).unwrap();
        assert_eq!(note.note_type, "SCAM_TOKEN");
        assert_eq!(note.severity, NoteSeverity::Warning);
    }

    #[test]
    fn provider_spam_flag_is_honored() {
        assert!(detect(&movements_with("INNOCENT"), &["innocent".to_string()]).is_some());
    }

    #[test]
    fn ordinary_symbols_pass() {
        assert!(detect(&movements_with("ETH"), &[]).is_none());
        assert!(detect(&movements_with("USDC"), &[]).is_none());
    }
}
