//! `import` and `process` commands.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::enrich::EnrichConfig;
use crate::error::{Error, Result};
use crate::import::csv::CsvImporter;
use crate::import::exchange::ExchangeImporter;
use crate::import::blockchain::BlockchainImporter;
use crate::import::{Credentials, ImportParams, Importer};
use crate::process::{SourceKind, native_symbol_for};

use super::Context;

pub struct ImportArgs {
    pub source: String,
    pub address: Option<String>,
    pub csv_dirs: Vec<PathBuf>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub full: bool,
}

/// Pick the importer and source kind from the arguments: CSV directories
/// force the CSV path; an address selects the blockchain importer; exchange
/// credentials in the environment select the exchange API importer.
fn resolve_source(
    ctx: &Context,
    args: &ImportArgs,
) -> Result<(Box<dyn Importer>, SourceKind, &'static str, ImportParams)> {
    let params = ImportParams {
        address: args.address.clone(),
        csv_directories: args.csv_dirs.clone(),
        since_ms: args.since,
        until_ms: args.until,
        credentials: credentials_from_env(&args.source),
        ..Default::default()
    };

    if !args.csv_dirs.is_empty() {
        return Ok((
            Box::new(CsvImporter::new(&args.source)),
            SourceKind::Exchange {
                name: args.source.to_lowercase(),
            },
            "csv",
            params,
        ));
    }
    if args.address.is_some() {
        let chain = args.source.to_lowercase();
        return Ok((
            Box::new(BlockchainImporter::new(&chain, ctx.manager.clone())),
            SourceKind::Blockchain {
                native_symbol: native_symbol_for(&chain),
                chain,
            },
            "blockchain",
            params,
        ));
    }
    if params.credentials.is_some() {
        return Ok((
            Box::new(ExchangeImporter::new(&args.source, ctx.manager.clone())),
            SourceKind::Exchange {
                name: args.source.to_lowercase(),
            },
            "exchange",
            params,
        ));
    }
    Err(Error::InvalidArgs(
        "import needs --address, --csv-dir, or exchange API credentials in the environment"
            .to_string(),
    ))
}

/// Credentials from `<SOURCE>_API_KEY` / `<SOURCE>_API_SECRET` /
/// `<SOURCE>_API_PASSPHRASE`.
fn credentials_from_env(source: &str) -> Option<Credentials> {
    let prefix = source.to_uppercase().replace('-', "_");
    let api_key = std::env::var(format!("{prefix}_API_KEY")).ok()?;
    let api_secret = std::env::var(format!("{prefix}_API_SECRET")).ok()?;
    Some(Credentials {
        api_key,
        api_secret,
        passphrase: std::env::var(format!("{prefix}_API_PASSPHRASE")).ok(),
    })
}

pub async fn run(ctx: &Context, args: ImportArgs) -> Result<Value> {
    let (importer, kind, source_type, params) = resolve_source(ctx, &args)?;
    let orchestrator = ctx.orchestrator(EnrichConfig::default());

    if args.full {
        let summary = orchestrator
            .run_pipeline(importer.as_ref(), &kind, source_type, params, &ctx.cancel)
            .await?;
        return Ok(serde_json::to_value(summary)?);
    }

    let summary = orchestrator
        .run_import(importer.as_ref(), source_type, params, &ctx.cancel)
        .await?;
    Ok(serde_json::to_value(summary)?)
}

pub async fn process(ctx: &Context, source: String, addresses: Vec<String>) -> Result<Value> {
    let source = source.to_lowercase();
    // The source kind is recorded on the import sessions.
    let sessions = ctx.store.list_sessions(Some(&source)).await?;
    let source_type = sessions
        .first()
        .map(|s| s.source_type.clone())
        .ok_or_else(|| Error::NotFound(format!("no import sessions for source {source}")))?;
    let kind = match source_type.as_str() {
        "blockchain" => SourceKind::Blockchain {
            native_symbol: native_symbol_for(&source),
            chain: source.clone(),
        },
        _ => SourceKind::Exchange {
            name: source.clone(),
        },
    };

    // Fall back to addresses recorded in session params when none are given.
    let addresses = if addresses.is_empty() {
        sessions
            .iter()
            .filter_map(|s| s.import_params.get("address"))
            .filter_map(Value::as_str)
            .map(String::from)
            .collect()
    } else {
        addresses
    };

    let orchestrator = ctx.orchestrator(EnrichConfig::default());
    let report = orchestrator
        .run_process(&kind, &source, &addresses, &ctx.cancel)
        .await?;
    Ok(json!({
        "transactions": report.transactions.len(),
        "zero_impact_dropped": report.zero_impact_dropped,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_dirs_force_csv_source() {
        let registry = crate::providers::Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(Some(dir.path()), registry).unwrap();
        let args = ImportArgs {
            source: "kraken".to_string(),
            address: None,
            csv_dirs: vec![dir.path().to_path_buf()],
            since: None,
            until: None,
            full: false,
        };
        let (_, kind, source_type, _) = resolve_source(&ctx, &args).unwrap();
        assert!(matches!(kind, SourceKind::Exchange { .. }));
        assert_eq!(source_type, "csv");
    }

    #[test]
    fn bare_source_without_inputs_is_invalid() {
        let registry = crate::providers::Registry::new();
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(Some(dir.path()), registry).unwrap();
        let args = ImportArgs {
            source: "nowhere".to_string(),
            address: None,
            csv_dirs: vec![],
            since: None,
            until: None,
            full: false,
        };
        assert!(matches!(
            resolve_source(&ctx, &args),
            Err(Error::InvalidArgs(_))
        ));
    }
}
