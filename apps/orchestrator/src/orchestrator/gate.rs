use super::types::GateReason;

/// Resource state and limits the admission gate is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateInput {
    pub has_current_run: bool,
    pub balance_cents: i64,
    pub min_run_cents: i64,
    pub global_active_runs: u64,
    pub global_max_concurrent_runs: u64,
    pub global_daily_spend_cents: i64,
    pub global_max_daily_spend_cents: i64,
    pub project_daily_spend_cents: i64,
    pub project_max_daily_spend_cents: i64,
    pub max_run_cents: i64,
}

/// First failing check wins; later checks are never evaluated.
pub fn evaluate_gate(input: &GateInput) -> GateReason {
    if input.has_current_run {
        return GateReason::AlreadyRunning;
    }
    if input.balance_cents < input.min_run_cents {
        return GateReason::InsufficientBalance;
    }
    if input.global_active_runs >= input.global_max_concurrent_runs {
        return GateReason::GlobalConcurrency;
    }

    let proposed_run_cents = input.balance_cents.min(input.max_run_cents);
    if input
        .global_daily_spend_cents
        .saturating_add(proposed_run_cents)
        > input.global_max_daily_spend_cents
    {
        return GateReason::GlobalDailyCap;
    }
    if input
        .project_daily_spend_cents
        .saturating_add(proposed_run_cents)
        > input.project_max_daily_spend_cents
    {
        return GateReason::ProjectDailyCap;
    }

    GateReason::Ok
}
