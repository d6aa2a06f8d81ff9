//! Token metadata repository: contract-keyed rows plus a symbol reverse
//! index, in its own database.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::providers::TokenInfo;

use super::Db;

pub struct TokenStore {
    db: Db,
}

impl TokenStore {
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

    pub async fn get(&self, contract: &str) -> Result<Option<TokenInfo>> {
        let conn = self.db.lock().await;
        get_in(&conn, contract)
    }

    pub async fn get_many(&self, contracts: &[String]) -> Result<Vec<TokenInfo>> {
        let conn = self.db.lock().await;
        let mut out = Vec::new();
        for contract in contracts {
            if let Some(info) = get_in(&conn, contract)? {
                out.push(info);
            }
        }
        Ok(out)
    }

    /// Merge-save: fields already known are kept when the incoming row omits
    /// them, so a partial provider response never erases data.
    pub async fn save(&self, info: &TokenInfo) -> Result<()> {
        let conn = self.db.lock().await;
        let contract = info.contract_address.to_lowercase();
        let existing = get_in(&conn, &contract)?;
        let merged = match existing {
            Some(prev) => TokenInfo {
                contract_address: contract.clone(),
                symbol: info.symbol.clone().or(prev.symbol),
                name: info.name.clone().or(prev.name),
                decimals: info.decimals.or(prev.decimals),
                possible_spam: info.possible_spam || prev.possible_spam,
                refreshed_at: info.refreshed_at,
            },
            None => TokenInfo {
                contract_address: contract.clone(),
                ..info.clone()
            },
        };
        conn.execute(
            "INSERT INTO token_metadata
                 (contract, symbol, name, decimals, possible_spam, refreshed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(contract) DO UPDATE SET
                 symbol = excluded.symbol,
                 name = excluded.name,
                 decimals = excluded.decimals,
                 possible_spam = excluded.possible_spam,
                 refreshed_at = excluded.refreshed_at",
            params![
                contract,
                merged.symbol,
                merged.name,
                merged.decimals.map(|d| d as i64),
                merged.possible_spam as i64,
                merged.refreshed_at.to_rfc3339(),
            ],
        )?;
        if let Some(symbol) = &merged.symbol {
            conn.execute(
                "INSERT OR IGNORE INTO symbol_index (symbol, contract) VALUES (?1, ?2)",
                params![symbol.to_uppercase(), contract],
            )?;
        }
        Ok(())
    }

    /// Reverse lookup. Symbol collisions are real (forks, scam clones), so
    /// the result is a list.
    pub async fn contracts_for_symbol(&self, symbol: &str) -> Result<Vec<String>> {
        let conn = self.db.lock().await;
        let mut stmt =
            conn.prepare("SELECT contract FROM symbol_index WHERE symbol = ?1 ORDER BY contract")?;
        let rows = stmt.query_map([symbol.to_uppercase()], |row| row.get::<_, String>(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(crate::error::Error::from)
    }
}

fn get_in(conn: &Connection, contract: &str) -> Result<Option<TokenInfo>> {
    let row: Option<(Option<String>, Option<String>, Option<i64>, i64, String)> = conn
        .query_row(
            "SELECT symbol, name, decimals, possible_spam, refreshed_at
             FROM token_metadata WHERE contract = ?1",
            [contract.to_lowercase()],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            },
        )
        .optional()?;
    Ok(row.map(|(symbol, name, decimals, possible_spam, refreshed_at)| TokenInfo {
        contract_address: contract.to_lowercase(),
        symbol,
        name,
        decimals: decimals.map(|d| d as u8),
        possible_spam: possible_spam != 0,
        refreshed_at: refreshed_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    }))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS token_metadata (
            contract      TEXT PRIMARY KEY,
            symbol        TEXT,
            name          TEXT,
            decimals      INTEGER,
            possible_spam INTEGER NOT NULL DEFAULT 0,
            refreshed_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS symbol_index (
            symbol   TEXT NOT NULL,
            contract TEXT NOT NULL,
            PRIMARY KEY (symbol, contract)
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(contract: &str, symbol: Option<&str>, decimals: Option<u8>) -> TokenInfo {
        TokenInfo {
            contract_address: contract.to_string(),
            symbol: symbol.map(String::from),
            name: None,
            decimals,
            possible_spam: false,
            refreshed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn merge_save_never_discards_known_fields() {
        let store = TokenStore::open_in_memory().unwrap();
        store.save(&info("0xAbC", Some("USDC"), Some(6))).await.unwrap();
        // A later partial response without decimals keeps the known value.
        store.save(&info("0xabc", Some("USDC"), None)).await.unwrap();

        let loaded = store.get("0xABC").await.unwrap().unwrap();
        assert_eq!(loaded.symbol.as_deref(), Some("USDC"));
        assert_eq!(loaded.decimals, Some(6));
    }

    #[tokio::test]
    async fn symbol_collisions_return_all_contracts() {
        let store = TokenStore::open_in_memory().unwrap();
        store.save(&info("0xaaa", Some("WETH"), Some(18))).await.unwrap();
        store.save(&info("0xbbb", Some("WETH"), Some(18))).await.unwrap();

        let contracts = store.contracts_for_symbol("weth").await.unwrap();
        assert_eq!(contracts, vec!["0xaaa", "0xbbb"]);
    }
}
