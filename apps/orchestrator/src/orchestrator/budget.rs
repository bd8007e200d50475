use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetBuckets {
    pub runtime_minutes: i64,
    pub token_budget: i64,
}

pub fn run_budget_cents(balance_cents: i64, max_run_cents: i64) -> i64 {
    balance_cents.min(max_run_cents).max(0)
}

/// Converts a cent budget into wall-clock minutes and a token allowance.
/// Each bucket is floored and then clamped to at least 1.
pub fn budget_buckets(
    budget_cents: i64,
    runtime_minutes_per_usd: f64,
    tokens_per_usd: f64,
) -> BudgetBuckets {
    let usd = budget_cents as f64 / 100.0;
    BudgetBuckets {
        runtime_minutes: floor_bucket(usd * runtime_minutes_per_usd),
        token_budget: floor_bucket(usd * tokens_per_usd),
    }
}

fn floor_bucket(value: f64) -> i64 {
    if !value.is_finite() {
        return 1;
    }
    (value.floor() as i64).max(1)
}

/// Unreported spend is charged as the full budget; reported spend is clamped to `[0, budget]`.
pub fn charged_cents(spent_cents: Option<i64>, budget_cents: i64) -> i64 {
    match spent_cents {
        None => budget_cents,
        Some(spent) if spent < 0 => 0,
        Some(spent) => spent.min(budget_cents),
    }
}

pub fn usd_to_cents(usd: f64) -> i64 {
    (usd * 100.0).round() as i64
}
