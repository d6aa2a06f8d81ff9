//! `links` commands: view, match, confirm, reject.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::{Value, json};

use crate::enrich::EnrichConfig;
use crate::error::{Error, Result};
use crate::links::{HIGH_CONFIDENCE, gap_report};
use crate::model::{Link, LinkStatus};
use crate::overrides::{OverrideEvent, OverrideLog, OverridePayload};

use super::Context;

pub struct ViewArgs {
    pub status: Option<String>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub limit: Option<usize>,
    pub verbose: bool,
}

pub async fn view(ctx: &Context, args: ViewArgs) -> Result<Value> {
    if args.status.as_deref() == Some("gaps") {
        let transactions = ctx.store.load_transactions(None).await?;
        let links = ctx.store.load_links(None).await?;
        return Ok(serde_json::to_value(gap_report(&transactions, &links))?);
    }

    let status = match args.status.as_deref() {
        None => None,
        Some("suggested") => Some(LinkStatus::Suggested),
        Some("confirmed") => Some(LinkStatus::Confirmed),
        Some("rejected") => Some(LinkStatus::Rejected),
        Some(other) => {
            return Err(Error::InvalidArgs(format!(
                "unknown status filter {other:?} (suggested|confirmed|rejected|gaps)"
            )));
        }
    };

    let min = args.min_confidence.and_then(Decimal::from_f64);
    let max = args.max_confidence.and_then(Decimal::from_f64);
    let mut links = ctx.store.load_links(status).await?;
    links.retain(|l| {
        min.map(|m| l.confidence_score >= m).unwrap_or(true)
            && max.map(|m| l.confidence_score <= m).unwrap_or(true)
    });
    links.sort_by(|a, b| b.confidence_score.cmp(&a.confidence_score));
    if let Some(limit) = args.limit {
        links.truncate(limit);
    }

    let rows: Vec<Value> = links.iter().map(|l| link_row(l, args.verbose)).collect();
    Ok(json!({ "count": rows.len(), "links": rows }))
}

fn link_row(link: &Link, verbose: bool) -> Value {
    let mut row = json!({
        "id": link.id,
        "asset": link.asset_symbol,
        "source_transaction": link.source_transaction_id,
        "target_transaction": link.target_transaction_id,
        "source_amount": link.source_amount.to_string(),
        "target_amount": link.target_amount.to_string(),
        "confidence": link.confidence_score.to_string(),
        "status": format!("{:?}", link.status).to_lowercase(),
        "review": if link.confidence_score >= HIGH_CONFIDENCE {
            "high-confidence"
        } else {
            "needs-review"
        },
    });
    if verbose {
        row["criteria"] = serde_json::to_value(&link.match_criteria).unwrap_or(Value::Null);
        row["fingerprint"] = json!(link.fingerprint);
        row["reviewed_by"] = json!(link.reviewed_by);
    }
    row
}

pub async fn run_matcher(ctx: &Context) -> Result<Value> {
    let orchestrator = ctx.orchestrator(EnrichConfig::default());
    let suggested = orchestrator.run_links().await?;
    Ok(json!({ "suggested": suggested }))
}

/// Confirm or reject a link: persists the status and appends a
/// fingerprint-keyed override so the decision survives re-ingestion.
pub async fn review(ctx: &Context, id: &str, confirm: bool) -> Result<Value> {
    let status = if confirm {
        LinkStatus::Confirmed
    } else {
        LinkStatus::Rejected
    };
    let actor = whoami();
    let link = ctx.store.update_link_status(id, status, &actor).await?;

    let (source_fp, target_fp) = transaction_fingerprints(ctx, &link).await?;
    let payload = if confirm {
        OverridePayload::Link {
            source_fingerprint: source_fp,
            target_fingerprint: target_fp,
            asset_symbol: link.asset_symbol.clone(),
        }
    } else {
        OverridePayload::Unlink {
            source_fingerprint: source_fp,
            target_fingerprint: target_fp,
            asset_symbol: link.asset_symbol.clone(),
        }
    };
    OverrideLog::new(&ctx.paths.overrides_log).append(&OverrideEvent::new(&actor, payload))?;

    Ok(json!({
        "id": link.id,
        "status": format!("{:?}", link.status).to_lowercase(),
        "reviewed_by": link.reviewed_by,
    }))
}

async fn transaction_fingerprints(ctx: &Context, link: &Link) -> Result<(String, String)> {
    let transactions = ctx.store.load_transactions(None).await?;
    let find = |id: &str| {
        transactions
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.fingerprint.clone())
            .ok_or_else(|| Error::NotFound(format!("transaction {id}")))
    };
    Ok((
        find(&link.source_transaction_id)?,
        find(&link.target_transaction_id)?,
    ))
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".to_string())
}
