//! `export` command: canonical transactions as JSON or flattened CSV.

use std::path::PathBuf;

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::model::Transaction;

use super::Context;

pub async fn run(
    ctx: &Context,
    format: String,
    source: Option<String>,
    output: Option<PathBuf>,
) -> Result<Value> {
    let transactions = ctx.store.load_transactions(source.as_deref()).await?;

    let content = match format.as_str() {
        "json" => serde_json::to_string_pretty(&transactions)?,
        "csv" => to_csv(&transactions)?,
        other => {
            return Err(Error::InvalidArgs(format!(
                "unknown export format {other:?} (json|csv)"
            )));
        }
    };

    match output {
        Some(path) => {
            std::fs::write(&path, content)?;
            Ok(json!({
                "exported": transactions.len(),
                "format": format,
                "path": path.display().to_string(),
            }))
        }
        None => {
            println!("{content}");
            Ok(json!({ "exported": transactions.len(), "format": format }))
        }
    }
}

/// One CSV row per movement, with the owning transaction's identity columns
/// repeated.
fn to_csv(transactions: &[Transaction]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "transaction_id",
            "source",
            "external_id",
            "datetime",
            "operation_category",
            "operation_kind",
            "side",
            "asset_id",
            "asset_symbol",
            "amount",
            "price",
            "price_currency",
            "price_source",
        ])
        .map_err(|e| Error::Internal(format!("csv: {e}")))?;

    for tx in transactions {
        for (side, movements) in [
            ("in", &tx.movements.inflows),
            ("out", &tx.movements.outflows),
        ] {
            for m in movements {
                writer
                    .write_record([
                        tx.id.as_str(),
                        tx.source.as_str(),
                        tx.external_id.as_str(),
                        &tx.datetime.to_rfc3339(),
                        &format!("{:?}", tx.operation.category).to_lowercase(),
                        &format!("{:?}", tx.operation.kind).to_lowercase(),
                        side,
                        &m.asset_id.to_string(),
                        m.asset_symbol.as_str(),
                        &m.net_amount.to_string(),
                        &m.price_at_tx_time
                            .as_ref()
                            .map(|p| p.price.to_string())
                            .unwrap_or_default(),
                        m.price_at_tx_time
                            .as_ref()
                            .map(|p| p.currency.as_str())
                            .unwrap_or(""),
                        m.price_at_tx_time
                            .as_ref()
                            .map(|p| p.source.as_str())
                            .unwrap_or(""),
                    ])
                    .map_err(|e| Error::Internal(format!("csv: {e}")))?;
            }
        }
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Internal(format!("csv: {e}")))?;
    String::from_utf8(bytes).map_err(|e| Error::Internal(format!("csv utf8: {e}")))
}
