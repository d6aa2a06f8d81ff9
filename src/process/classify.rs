//! Rule-based operation classification from fund-flow shape and provider
//! hints.
//!
//! Classification never infers direction from absence of data: an ambiguous
//! shape defaults to `transfer` and the transaction is annotated for review.

use crate::model::transaction::Movements;
use crate::model::{Note, NoteSeverity, Operation, OperationCategory, OperationKind};

/// Classify one transaction group. Returns the operation and an optional
/// ambiguity note.
pub fn classify(movements: &Movements, hint: Option<&str>) -> (Operation, Option<Note>) {
    let hint = hint.map(|h| h.to_lowercase()).unwrap_or_default();
    let has_in = !movements.inflows.is_empty();
    let has_out = !movements.outflows.is_empty();

    // Explicit hints win when they agree with the observed shape.
    if hint_contains(&hint, &["stake", "delegate", "bond"]) && !hint.contains("unstake") {
        return (
            Operation::new(OperationCategory::Staking, OperationKind::Stake),
            None,
        );
    }
    if hint_contains(&hint, &["unstake", "undelegate", "unbond", "withdraw_rewards"]) {
        return (
            Operation::new(OperationCategory::Staking, OperationKind::Unstake),
            None,
        );
    }
    if hint_contains(&hint, &["interest", "reward", "staking_income"]) {
        return (
            Operation::new(OperationCategory::Staking, OperationKind::Reward),
            None,
        );
    }
    if hint_contains(&hint, &["airdrop"]) {
        return (
            Operation::new(OperationCategory::Reward, OperationKind::Airdrop),
            None,
        );
    }

    // Different assets in and out is an exchange of value.
    if has_in && has_out {
        let in_assets: Vec<&str> = movements
            .inflows
            .iter()
            .map(|m| m.asset_symbol.as_str())
            .collect();
        let distinct_exchange = movements
            .outflows
            .iter()
            .any(|out| !in_assets.contains(&out.asset_symbol.as_str()));
        if distinct_exchange {
            let kind = if hint_contains(&hint, &["buy"]) {
                OperationKind::Buy
            } else if hint_contains(&hint, &["sell"]) {
                OperationKind::Sell
            } else {
                OperationKind::Swap
            };
            return (Operation::new(OperationCategory::Trade, kind), None);
        }
        // Same asset both ways (self-transfer shape): fall through to
        // transfer below.
    }

    if hint_contains(&hint, &["swap", "trade"]) && has_in && has_out {
        return (
            Operation::new(OperationCategory::Trade, OperationKind::Swap),
            None,
        );
    }

    if hint_contains(&hint, &["deposit", "fiat_deposit"]) || (has_in && !has_out) {
        return (
            Operation::new(OperationCategory::Transfer, OperationKind::Deposit),
            None,
        );
    }
    if hint_contains(&hint, &["withdrawal", "withdraw"]) || (has_out && !has_in) {
        return (
            Operation::new(OperationCategory::Transfer, OperationKind::Withdrawal),
            None,
        );
    }

    // Nothing matched: default to transfer with a note rather than guess.
    let note = Note::new(
        "AMBIGUOUS_CLASSIFICATION",
        NoteSeverity::Info,
        format!("could not classify from shape (hint: {hint:?}); defaulted to transfer"),
    );
    (
        Operation::new(OperationCategory::Transfer, OperationKind::Transfer),
        Some(note),
    )
}

fn hint_contains(hint: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| hint.contains(n))
}
