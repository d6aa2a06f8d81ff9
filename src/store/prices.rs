//! Price store: day-bucketed market price cache in its own database.
//!
//! The enrichment engine's market stage keys lookups by
//! `(asset symbol, currency, day)`; a hit skips the provider pool entirely,
//! which is what makes `enrich → enrich` a no-op for already-priced
//! movements.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{PriceGranularity, PriceRecord};

use super::Db;

pub struct PriceStore {
    db: Db,
}

impl PriceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = super::open_conn(path)?;
        migrate(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = super::open_conn_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn get(
        &self,
        asset_symbol: &str,
        currency: &str,
        timestamp_ms: i64,
    ) -> Result<Option<PriceRecord>> {
        let conn = self.db.lock().await;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT price, source, granularity, fetched_at FROM prices
                 WHERE asset_symbol = ?1 AND currency = ?2 AND day = ?3",
                params![
                    asset_symbol.to_uppercase(),
                    currency.to_uppercase(),
                    day_bucket(timestamp_ms)
                ],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .optional()?;
        let Some((price, source, granularity, fetched_at)) = row else {
            return Ok(None);
        };
        let price: Decimal = price
            .parse()
            .map_err(|e| Error::Internal(format!("stored price unparseable: {e}")))?;
        let fetched_at: DateTime<Utc> = fetched_at.parse().unwrap_or_else(|_| Utc::now());
        Ok(PriceRecord::new(
            price,
            currency,
            &source,
            parse_granularity(&granularity),
            fetched_at,
        ))
    }

    pub async fn put(
        &self,
        asset_symbol: &str,
        timestamp_ms: i64,
        record: &PriceRecord,
    ) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO prices (asset_symbol, currency, day, price, source, granularity, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(asset_symbol, currency, day) DO UPDATE SET
                 price = excluded.price,
                 source = excluded.source,
                 granularity = excluded.granularity,
                 fetched_at = excluded.fetched_at",
            params![
                asset_symbol.to_uppercase(),
                record.currency,
                day_bucket(timestamp_ms),
                record.price.to_string(),
                record.source,
                granularity_str(record.granularity),
                record.fetched_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn day_bucket(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(86_400_000)
}

fn granularity_str(g: PriceGranularity) -> &'static str {
    match g {
        PriceGranularity::Exact => "exact",
        PriceGranularity::Interpolated => "interpolated",
        PriceGranularity::Daily => "daily",
    }
}

fn parse_granularity(s: &str) -> PriceGranularity {
    match s {
        "interpolated" => PriceGranularity::Interpolated,
        "daily" => PriceGranularity::Daily,
        _ => PriceGranularity::Exact,
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS prices (
            asset_symbol TEXT NOT NULL,
            currency     TEXT NOT NULL,
            day          INTEGER NOT NULL,
            price        TEXT NOT NULL,
            source       TEXT NOT NULL,
            granularity  TEXT NOT NULL,
            fetched_at   TEXT NOT NULL,
            PRIMARY KEY (asset_symbol, currency, day)
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn same_day_lookups_share_an_entry() {
        let store = PriceStore::open_in_memory().unwrap();
        let record = PriceRecord::new(
            dec!(50000),
            "USD",
            "coingecko",
            PriceGranularity::Exact,
            Utc::now(),
        )
        .unwrap();
        let noon = 1_700_000_000_000i64;
        store.put("BTC", noon, &record).await.unwrap();

        // Any timestamp within the same UTC day hits.
        let later_same_day = noon + 3_600_000;
        let hit = store.get("btc", "usd", later_same_day).await.unwrap().unwrap();
        assert_eq!(hit.price, dec!(50000));
        assert_eq!(hit.source, "coingecko");

        let next_day = noon + 86_400_000;
        assert!(store.get("BTC", "USD", next_day).await.unwrap().is_none());
    }
}
