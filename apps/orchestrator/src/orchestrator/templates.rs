//! Automation files synced into every project repository before dispatch.

pub const WORKFLOW_FILE_NAME: &str = "gitcorps-agent.yml";
pub const WORKFLOW_FILE_PATH: &str = ".github/workflows/gitcorps-agent.yml";
pub const RUNNER_FILE_PATH: &str = "tools/gitcorps_runner.sh";

pub fn workflow_yaml(workflow_ref: &str) -> String {
    format!(
        r#"name: GitCorps Agent Run

on:
  workflow_dispatch:
    inputs:
      projectId:
        description: Project id
        required: true
        type: string
      runId:
        description: Run id
        required: true
        type: string
      budgetCents:
        description: Budget for this run (cents)
        required: true
        type: string
      runtimeMinutes:
        description: Wall-clock allowance for this run
        required: true
        type: string
      tokenBudget:
        description: Model token allowance for this run
        required: true
        type: string
      runToken:
        description: Short-lived run token
        required: true
        type: string
      backendBaseUrl:
        description: Orchestrator base URL
        required: true
        type: string
      agentRuntime:
        description: Agent runtime adapter id
        required: true
        type: string

jobs:
  run-agent:
    runs-on: ubuntu-latest
    timeout-minutes: ${{{{ fromJSON(inputs.runtimeMinutes) }}}}
    env:
      PROJECT_ID: ${{{{ inputs.projectId }}}}
      RUN_ID: ${{{{ inputs.runId }}}}
      BUDGET_CENTS: ${{{{ inputs.budgetCents }}}}
      RUNTIME_MINUTES: ${{{{ inputs.runtimeMinutes }}}}
      TOKEN_BUDGET: ${{{{ inputs.tokenBudget }}}}
      RUN_TOKEN: ${{{{ inputs.runToken }}}}
      BACKEND_BASE_URL: ${{{{ inputs.backendBaseUrl }}}}
      AGENT_RUNTIME: ${{{{ inputs.agentRuntime }}}}
      AGENT_COMMAND: ${{{{ vars.AGENT_COMMAND }}}}
    steps:
      - name: Checkout
        uses: actions/checkout@v4
        with:
          ref: {workflow_ref}

      - name: Execute agent runner
        run: sh {RUNNER_FILE_PATH}

      - name: Commit agent changes
        if: success()
        run: |
          if git diff --quiet && git diff --cached --quiet; then
            echo "No changes to commit"
            exit 0
          fi
          git config user.name "gitcorps-agent"
          git config user.email "agent@gitcorps.local"
          git add -A
          git commit -m "chore(agent): run $RUN_ID"
          git push origin {workflow_ref}
"#
    )
}

/// POSIX shell runner: reports `runStarted`, heartbeats in the background, runs the
/// agent command and always reports `runFinished`.
pub fn runner_script() -> String {
    r#"#!/bin/sh
set -u

: "${BACKEND_BASE_URL:?BACKEND_BASE_URL is required}"
: "${RUN_TOKEN:?RUN_TOKEN is required}"
: "${PROJECT_ID:?PROJECT_ID is required}"
: "${RUN_ID:?RUN_ID is required}"

SUMMARY_FILE="${SUMMARY_FILE:-RUN_SUMMARY.md}"
HEARTBEAT_SECONDS="${HEARTBEAT_SECONDS:-60}"

json_escape() {
  printf '%s' "$1" | awk '
    BEGIN {
      for (i = 1; i < 32; i++) esc[sprintf("%c", i)] = sprintf("\\u%04x", i)
      esc["\t"] = "\\t"
      esc["\r"] = "\\r"
      esc["\\"] = "\\\\"
      esc["\""] = "\\\""
      sep = ""
    }
    {
      out = ""
      n = length($0)
      for (i = 1; i <= n; i++) {
        c = substr($0, i, 1)
        out = out ((c in esc) ? esc[c] : c)
      }
      printf "%s%s", sep, out
      sep = "\\n"
    }'
}

post() {
  curl -fsS -X POST "$BACKEND_BASE_URL/$1" \
    -H "Authorization: Bearer $RUN_TOKEN" \
    -H "Content-Type: application/json" \
    -d "$2"
}

ids="\"projectId\":\"$PROJECT_ID\",\"runId\":\"$RUN_ID\""

post runStarted "{$ids}" || exit 1

(
  while true; do
    sleep "$HEARTBEAT_SECONDS"
    post runHeartbeat "{$ids,\"phase\":\"agent\",\"message\":\"agent running\"}" >/dev/null 2>&1 || true
  done
) &
heartbeat_pid=$!

status="failed"
if [ -n "${AGENT_COMMAND:-}" ]; then
  if sh -c "$AGENT_COMMAND"; then
    status="succeeded"
  fi
else
  echo "AGENT_COMMAND is not set" > "$SUMMARY_FILE"
fi

kill "$heartbeat_pid" 2>/dev/null || true

summary=""
if [ -f "$SUMMARY_FILE" ]; then
  summary=$(json_escape "$(cat "$SUMMARY_FILE")")
fi
if [ -z "$summary" ]; then
  summary="Run finished without summary."
fi

spent="${SPENT_CENTS:-}"
if [ -n "$spent" ]; then
  spent_field=",\"spentCents\":$spent"
else
  spent_field=""
fi

post runFinished "{$ids,\"status\":\"$status\",\"summaryMd\":\"$summary\"$spent_field}"
"#
    .to_string()
}
