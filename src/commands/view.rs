//! `view` commands: sessions, transactions, links.

use serde_json::{Value, json};

use crate::error::Result;

use super::Context;

pub async fn sessions(ctx: &Context, source: Option<String>) -> Result<Value> {
    let sessions = ctx.store.list_sessions(source.as_deref()).await?;
    let rows: Vec<Value> = sessions
        .iter()
        .map(|s| {
            let cursors: Vec<Value> = s
                .cursors
                .iter()
                .map(|(op, c)| {
                    json!({
                        "operation": op,
                        "kind": format!("{:?}", c.primary.kind).to_lowercase(),
                        "value": c.primary.value,
                        "provider": c.provider_name,
                        "total_fetched": c.total_fetched,
                        "is_complete": c.is_complete,
                    })
                })
                .collect();
            json!({
                "id": s.id,
                "source": s.source_id,
                "type": s.source_type,
                "status": format!("{:?}", s.status).to_lowercase(),
                "started_at": s.started_at.to_rfc3339(),
                "completed_at": s.completed_at.map(|t| t.to_rfc3339()),
                "error": s.error,
                "cursors": cursors,
            })
        })
        .collect();
    Ok(json!({ "count": rows.len(), "sessions": rows }))
}

pub async fn transactions(
    ctx: &Context,
    source: Option<String>,
    limit: Option<usize>,
) -> Result<Value> {
    let mut transactions = ctx.store.load_transactions(source.as_deref()).await?;
    if let Some(limit) = limit {
        transactions.truncate(limit);
    }
    let rows: Vec<Value> = transactions
        .iter()
        .map(|t| {
            json!({
                "id": t.id,
                "source": t.source,
                "datetime": t.datetime.to_rfc3339(),
                "operation": format!(
                    "{:?}/{:?}",
                    t.operation.category, t.operation.kind
                )
                .to_lowercase(),
                "inflows": t.movements.inflows.len(),
                "outflows": t.movements.outflows.len(),
                "fees": t.fees.len(),
                "notes": t.notes.iter().map(|n| n.note_type.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();
    Ok(json!({ "count": rows.len(), "transactions": rows }))
}

pub async fn links(ctx: &Context) -> Result<Value> {
    super::links::view(
        ctx,
        super::links::ViewArgs {
            status: None,
            min_confidence: None,
            max_confidence: None,
            limit: None,
            verbose: false,
        },
    )
    .await
}
