use sha2::{Digest, Sha256};

/// Deterministic fingerprint for a transaction: `sha256(source ":" external_id)`.
///
/// Stable across runs and platforms; the ingestion store keys raw records by
/// it, and the override log references transactions through it so user
/// decisions survive re-ingestion.
pub fn transaction_fingerprint(source: &str, external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(external_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint for a link between two transactions, independent of the order
/// the endpoints are supplied in.
pub fn link_fingerprint(fp_a: &str, fp_b: &str, asset_symbol: &str) -> String {
    let (lo, hi) = if fp_a <= fp_b { (fp_a, fp_b) } else { (fp_b, fp_a) };
    let mut hasher = Sha256::new();
    hasher.update(b"link:");
    hasher.update(lo.as_bytes());
    hasher.update(b":");
    hasher.update(hi.as_bytes());
    hasher.update(b":");
    hasher.update(asset_symbol.to_uppercase().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_fingerprint_is_deterministic() {
        let a = transaction_fingerprint("kraken", "TX-123");
        let b = transaction_fingerprint("kraken", "TX-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn distinct_inputs_hash_differently() {
        assert_ne!(
            transaction_fingerprint("kraken", "TX-123"),
            transaction_fingerprint("kraken", "TX-124")
        );
        assert_ne!(
            transaction_fingerprint("kraken", "TX-123"),
            transaction_fingerprint("coinbase", "TX-123")
        );
    }

    #[test]
    fn link_fingerprint_ignores_endpoint_order() {
        let fp_a = transaction_fingerprint("kraken", "w1");
        let fp_b = transaction_fingerprint("bitcoin", "d1");
        assert_eq!(
            link_fingerprint(&fp_a, &fp_b, "BTC"),
            link_fingerprint(&fp_b, &fp_a, "btc")
        );
    }
}
