//! Ingestion store: import sessions, raw + normalized records, canonical
//! transactions, and links.
//!
//! Raw records are append-only and keyed by fingerprint; saving a batch is
//! atomic and idempotent (duplicate fingerprints keep the existing row).
//! Cursor checkpoints merge into the owning session's cursor map so
//! multi-operation imports coexist.

use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::cursor::CursorMap;
use crate::model::{
    Cursor, ImportSession, Link, LinkStatus, NormalizedRecord, RawRecord, SessionStatus,
    Transaction,
};

use super::Db;

#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    pub source_id: Option<String>,
    pub provider_name: Option<String>,
    pub processed: Option<bool>,
}

/// A persisted raw+normalized record pair.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub fingerprint: String,
    pub source_id: String,
    pub raw: RawRecord,
    pub normalized: NormalizedRecord,
    pub processed: bool,
}

pub struct IngestionStore {
    db: Db,
}

impl IngestionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = super::open_conn(path)?;
        migrate(&conn)?;
        Ok(Self {
            db: std::sync::Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = super::open_conn_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            db: std::sync::Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    // ── Sessions ────────────────────────────────────────────────────

    pub async fn create_session(&self, session: &ImportSession) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO import_sessions
                 (id, source_id, source_type, status, params_json, cursors_json,
                  verification_json, started_at, completed_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL)",
            params![
                session.id,
                session.source_id,
                session.source_type,
                status_str(session.status),
                session.import_params.to_string(),
                serde_json::to_string(&session.cursors)?,
                session.verification_metadata.to_string(),
                session.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<ImportSession>> {
        let conn = self.db.lock().await;
        conn.query_row(
            "SELECT id, source_id, source_type, status, params_json, cursors_json,
                    verification_json, started_at, completed_at, error
             FROM import_sessions WHERE id = ?1",
            [session_id],
            row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    pub async fn list_sessions(&self, source_id: Option<&str>) -> Result<Vec<ImportSession>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, source_id, source_type, status, params_json, cursors_json,
                    verification_json, started_at, completed_at, error
             FROM import_sessions
             WHERE (?1 IS NULL OR source_id = ?1)
             ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([source_id], row_to_session)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Error::from)
    }

    /// Merge one operation's cursor into the session's cursor map.
    /// Checkpoints for one `(session, operation)` are serialized by the
    /// store's single-writer lock.
    pub async fn update_cursor(
        &self,
        session_id: &str,
        operation_type: &str,
        cursor: &Cursor,
    ) -> Result<()> {
        let conn = self.db.lock().await;
        let cursors_json: String = conn
            .query_row(
                "SELECT cursors_json FROM import_sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        let mut cursors: CursorMap = serde_json::from_str(&cursors_json)?;
        cursors.insert(operation_type.to_string(), cursor.clone());
        conn.execute(
            "UPDATE import_sessions SET cursors_json = ?2 WHERE id = ?1",
            params![session_id, serde_json::to_string(&cursors)?],
        )?;
        debug!(session_id, operation_type, "cursor checkpoint");
        Ok(())
    }

    /// Terminal transition; rejects updates to an already-terminal session.
    pub async fn finalize(
        &self,
        session_id: &str,
        status: SessionStatus,
        error: Option<&str>,
        verification: Option<&Value>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidArgs(
                "finalize requires a terminal status".to_string(),
            ));
        }
        let conn = self.db.lock().await;
        let current: String = conn
            .query_row(
                "SELECT status FROM import_sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        if current != "started" {
            return Err(Error::ConflictingState(format!(
                "session {session_id} already finalized as {current}"
            )));
        }
        conn.execute(
            "UPDATE import_sessions
             SET status = ?2, completed_at = ?3, error = ?4,
                 verification_json = COALESCE(?5, verification_json)
             WHERE id = ?1",
            params![
                session_id,
                status_str(status),
                Utc::now().to_rfc3339(),
                error,
                verification.map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Shortcut lookup: has an identical import already completed?
    pub async fn find_completed_with_matching_params(
        &self,
        source_id: &str,
        source_type: &str,
        params_identity: &Value,
    ) -> Result<Option<ImportSession>> {
        let sessions = self.list_sessions(Some(source_id)).await?;
        let wanted = params_identity.to_string();
        Ok(sessions.into_iter().find(|s| {
            s.status == SessionStatus::Completed
                && s.source_type == source_type
                && s.import_params.to_string() == wanted
        }))
    }

    // ── Raw + normalized records ────────────────────────────────────

    /// Atomic batch insert; a duplicate fingerprint keeps the existing row.
    /// Returns the number of newly inserted records.
    pub async fn save_batch(
        &self,
        session_id: &str,
        source_id: &str,
        raw_records: &[RawRecord],
        normalized: &[NormalizedRecord],
    ) -> Result<usize> {
        if raw_records.len() != normalized.len() {
            return Err(Error::Internal(
                "raw and normalized records must be index-aligned".to_string(),
            ));
        }
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        for (raw, norm) in raw_records.iter().zip(normalized) {
            let changed = tx.execute(
                "INSERT INTO external_transactions
                     (fingerprint, session_id, source_id, provider_name, source_address,
                      raw_json, normalized_json, received_at, processed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
                 ON CONFLICT(fingerprint) DO NOTHING",
                params![
                    raw.fingerprint,
                    session_id,
                    source_id,
                    raw.provider_name,
                    raw.source_address,
                    raw.payload.to_string(),
                    serde_json::to_string(norm)?,
                    raw.received_at.to_rfc3339(),
                ],
            )?;
            if changed > 0 {
                inserted += 1;
            } else {
                // Normalized form may be re-validated under a newer schema;
                // the raw payload is never touched.
                tx.execute(
                    "UPDATE external_transactions SET normalized_json = ?2
                     WHERE fingerprint = ?1",
                    params![raw.fingerprint, serde_json::to_string(norm)?],
                )?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub async fn mark_processed(&self, fingerprints: &[String]) -> Result<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        for fp in fingerprints {
            tx.execute(
                "UPDATE external_transactions SET processed = 1 WHERE fingerprint = ?1",
                [fp],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn load_records(&self, filter: &LoadFilter) -> Result<Vec<StoredRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT fingerprint, source_id, provider_name, source_address,
                    raw_json, normalized_json, received_at, processed
             FROM external_transactions
             WHERE (?1 IS NULL OR source_id = ?1)
               AND (?2 IS NULL OR provider_name = ?2)
               AND (?3 IS NULL OR processed = ?3)
             ORDER BY rowid",
        )?;
        let rows = stmt.query_map(
            params![
                filter.source_id.as_deref(),
                filter.provider_name.as_deref(),
                filter.processed.map(|p| p as i64),
            ],
            |row| {
                let fingerprint: String = row.get(0)?;
                let source_id: String = row.get(1)?;
                let provider_name: String = row.get(2)?;
                let source_address: Option<String> = row.get(3)?;
                let raw_json: String = row.get(4)?;
                let normalized_json: String = row.get(5)?;
                let received_at: String = row.get(6)?;
                let processed: i64 = row.get(7)?;
                Ok((
                    fingerprint,
                    source_id,
                    provider_name,
                    source_address,
                    raw_json,
                    normalized_json,
                    received_at,
                    processed,
                ))
            },
        )?;

        let mut out = Vec::new();
        for row in rows {
            let (fingerprint, source_id, provider_name, source_address, raw_json, normalized_json, received_at, processed) =
                row?;
            out.push(StoredRecord {
                raw: RawRecord {
                    provider_name,
                    source_address,
                    fingerprint: fingerprint.clone(),
                    received_at: received_at
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    payload: serde_json::from_str(&raw_json)?,
                },
                normalized: serde_json::from_str(&normalized_json)?,
                fingerprint,
                source_id,
                processed: processed != 0,
            });
        }
        Ok(out)
    }

    // ── Canonical transactions ──────────────────────────────────────

    /// Upsert canonical transactions by fingerprint and rebuild the movement
    /// index rows for each.
    pub async fn save_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        for t in transactions {
            save_transaction_in(&tx, t)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn load_transactions(&self, source_id: Option<&str>) -> Result<Vec<Transaction>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT tx_json FROM transactions
             WHERE (?1 IS NULL OR source_id = ?1)
             ORDER BY timestamp_ms, id",
        )?;
        let rows = stmt.query_map([source_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub async fn get_transaction_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Transaction>> {
        let conn = self.db.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT tx_json FROM transactions WHERE fingerprint = ?1",
                [fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(j) => Some(serde_json::from_str(&j)?),
            None => None,
        })
    }

    // ── Links ───────────────────────────────────────────────────────

    /// Insert or refresh a link. A link whose stored status is terminal is
    /// never overwritten.
    pub async fn upsert_link(&self, link: &Link) -> Result<bool> {
        let conn = self.db.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM transaction_links WHERE fingerprint = ?1",
                [&link.fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(status) = existing {
            if status == "confirmed" || status == "rejected" {
                return Ok(false);
            }
        }
        conn.execute(
            "INSERT INTO transaction_links
                 (id, fingerprint, link_json, status)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(fingerprint) DO UPDATE SET
                 link_json = excluded.link_json,
                 status = excluded.status",
            params![
                link.id,
                link.fingerprint,
                serde_json::to_string(link)?,
                link_status_str(link.status),
            ],
        )?;
        Ok(true)
    }

    pub async fn load_links(&self, status: Option<LinkStatus>) -> Result<Vec<Link>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT link_json FROM transaction_links
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id",
        )?;
        let rows = stmt.query_map([status.map(link_status_str)], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub async fn get_link(&self, id_or_fingerprint: &str) -> Result<Option<Link>> {
        let conn = self.db.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT link_json FROM transaction_links
                 WHERE id = ?1 OR fingerprint = ?1",
                [id_or_fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(j) => Some(serde_json::from_str(&j)?),
            None => None,
        })
    }

    /// Persist a reviewed status. Repeating the same decision is a no-op; a
    /// later decision replaces an earlier one (the terminal-status guard
    /// binds the matcher, not the reviewer).
    pub async fn update_link_status(
        &self,
        id_or_fingerprint: &str,
        status: LinkStatus,
        reviewed_by: &str,
    ) -> Result<Link> {
        let mut link = self
            .get_link(id_or_fingerprint)
            .await?
            .ok_or_else(|| Error::NotFound(format!("link {id_or_fingerprint}")))?;
        if link.status == status {
            return Ok(link);
        }
        link.status = status;
        link.reviewed_by = Some(reviewed_by.to_string());
        link.reviewed_at = Some(Utc::now());

        let conn = self.db.lock().await;
        conn.execute(
            "UPDATE transaction_links SET link_json = ?2, status = ?3 WHERE id = ?1",
            params![link.id, serde_json::to_string(&link)?, link_status_str(status)],
        )?;
        Ok(link)
    }
}

// ── Row plumbing ────────────────────────────────────────────────────

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS import_sessions (
            id                 TEXT PRIMARY KEY,
            source_id          TEXT NOT NULL,
            source_type        TEXT NOT NULL,
            status             TEXT NOT NULL,
            params_json        TEXT NOT NULL,
            cursors_json       TEXT NOT NULL,
            verification_json  TEXT,
            started_at         TEXT NOT NULL,
            completed_at       TEXT,
            error              TEXT
        );

        CREATE TABLE IF NOT EXISTS external_transactions (
            fingerprint      TEXT PRIMARY KEY,
            session_id       TEXT NOT NULL REFERENCES import_sessions(id),
            source_id        TEXT NOT NULL,
            provider_name    TEXT NOT NULL,
            source_address   TEXT,
            raw_json         TEXT NOT NULL,
            normalized_json  TEXT NOT NULL,
            received_at      TEXT NOT NULL,
            processed        INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_ext_source
            ON external_transactions(source_id, processed);

        CREATE TABLE IF NOT EXISTS transactions (
            id            TEXT PRIMARY KEY,
            fingerprint   TEXT UNIQUE NOT NULL,
            source_id     TEXT NOT NULL,
            external_id   TEXT NOT NULL,
            timestamp_ms  INTEGER NOT NULL,
            status        TEXT NOT NULL,
            tx_json       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tx_source ON transactions(source_id, timestamp_ms);

        CREATE TABLE IF NOT EXISTS transaction_movements (
            transaction_id  TEXT NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
            side            TEXT NOT NULL,
            idx             INTEGER NOT NULL,
            asset_id        TEXT NOT NULL,
            asset_symbol    TEXT NOT NULL,
            amount          TEXT NOT NULL,
            priced          INTEGER NOT NULL DEFAULT 0,
            price_source    TEXT,
            PRIMARY KEY (transaction_id, side, idx)
        );

        CREATE TABLE IF NOT EXISTS transaction_links (
            id          TEXT PRIMARY KEY,
            fingerprint TEXT UNIQUE NOT NULL,
            link_json   TEXT NOT NULL,
            status      TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn save_transaction_in(tx: &rusqlite::Transaction<'_>, t: &Transaction) -> Result<()> {
    tx.execute(
        "INSERT INTO transactions
             (id, fingerprint, source_id, external_id, timestamp_ms, status, tx_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(fingerprint) DO UPDATE SET
             timestamp_ms = excluded.timestamp_ms,
             status = excluded.status,
             tx_json = excluded.tx_json",
        params![
            t.id,
            t.fingerprint,
            t.source,
            t.external_id,
            t.timestamp_ms,
            format!("{:?}", t.status).to_lowercase(),
            serde_json::to_string(t)?,
        ],
    )?;
    // The movement index mirrors the canonical JSON for fast price queries.
    let canonical_id: String = tx.query_row(
        "SELECT id FROM transactions WHERE fingerprint = ?1",
        [&t.fingerprint],
        |row| row.get(0),
    )?;
    tx.execute(
        "DELETE FROM transaction_movements WHERE transaction_id = ?1",
        [&canonical_id],
    )?;
    for (side, movements) in [("in", &t.movements.inflows), ("out", &t.movements.outflows)] {
        for (idx, m) in movements.iter().enumerate() {
            tx.execute(
                "INSERT INTO transaction_movements
                     (transaction_id, side, idx, asset_id, asset_symbol, amount, priced, price_source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    canonical_id,
                    side,
                    idx as i64,
                    m.asset_id.to_string(),
                    m.asset_symbol,
                    m.net_amount.to_string(),
                    m.price_at_tx_time.is_some() as i64,
                    m.price_at_tx_time.as_ref().map(|p| p.source.clone()),
                ],
            )?;
        }
    }
    Ok(())
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Started => "started",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
        SessionStatus::Cancelled => "cancelled",
    }
}

fn link_status_str(status: LinkStatus) -> &'static str {
    match status {
        LinkStatus::Suggested => "suggested",
        LinkStatus::Confirmed => "confirmed",
        LinkStatus::Rejected => "rejected",
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportSession> {
    let status: String = row.get(3)?;
    let params_json: String = row.get(4)?;
    let cursors_json: String = row.get(5)?;
    let verification_json: Option<String> = row.get(6)?;
    let started_at: String = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    Ok(ImportSession {
        id: row.get(0)?,
        source_id: row.get(1)?,
        source_type: row.get(2)?,
        status: match status.as_str() {
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "cancelled" => SessionStatus::Cancelled,
            _ => SessionStatus::Started,
        },
        import_params: serde_json::from_str(&params_json).unwrap_or(Value::Null),
        cursors: serde_json::from_str(&cursors_json).unwrap_or_default(),
        verification_metadata: verification_json
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or(Value::Null),
        started_at: started_at.parse().unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at.and_then(|s| s.parse().ok()),
        error: row.get(9)?,
    })
}
