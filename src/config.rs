//! Data-directory and database-path resolution.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolved locations for the on-disk state. Three sqlite databases plus the
/// append-only override log live under one data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub ingestion_db: PathBuf,
    pub prices_db: PathBuf,
    pub tokens_db: PathBuf,
    pub overrides_log: PathBuf,
}

impl DataPaths {
    /// Resolution order: explicit flag, `EXITBOOK_DATA_DIR`, then the
    /// platform data dir.
    pub fn resolve(flag: Option<&Path>) -> Result<Self> {
        let root = match flag {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os("EXITBOOK_DATA_DIR") {
                Some(dir) => PathBuf::from(dir),
                None => dirs::data_dir()
                    .context("no platform data directory available; pass --data-dir")?
                    .join("exitbook"),
            },
        };
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating data directory {}", root.display()))?;
        Ok(Self {
            ingestion_db: root.join("ingestion.db"),
            prices_db: root.join("prices.db"),
            tokens_db: root.join("tokens.db"),
            overrides_log: root.join("overrides.jsonl"),
            root,
        })
    }
}
