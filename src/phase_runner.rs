use std::path::Path;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::budget::{check_issue_budget, BudgetStatus};
use crate::checkpoint;
use crate::config::BudgetConfig;
use crate::error::CadreError;
use crate::external::{AgentContext, AgentLauncher, AgentOutcome, GateCoordinator, NotificationManager};
use crate::log_info;
use crate::types::{GateResult, IssueCheckpoint, PhaseResult};

/// Launch the agent and, on failure, dispatch `agent-failed`. Never
/// returns an `Err` — `AgentLauncher::launch` itself never throws (spec
/// §6); the outcome's `success` flag carries the verdict so callers decide
/// how to react (ordinary phase failure vs. a retryable task attempt).
async fn launch_or_notify<A: AgentLauncher, N: NotificationManager>(
    agent: &A,
    ctx: &AgentContext,
    notifier: &N,
    issue_number: u64,
    phase: u32,
) -> AgentOutcome {
    let outcome = agent.launch(ctx).await;
    if !outcome.success {
        let message = outcome.error.clone().unwrap_or_else(|| "agent invocation failed".to_string());
        let _ = notifier
            .notify("agent-failed", &format!("issue {} phase {}: {}", issue_number, phase, message))
            .await;
    }
    outcome
}

async fn notify_if_ambiguous<N: NotificationManager>(notifier: &N, issue_number: u64, phase: u32, warnings: &[String]) {
    if !warnings.is_empty() {
        let _ = notifier
            .notify(
                "ambiguity-detected",
                &format!("issue {} phase {}: {:?}", issue_number, phase, warnings),
            )
            .await;
    }
}

/// The phase this run is driving, independent of `config::PhaseDef` so
/// `phase_runner` doesn't need to know about config parsing.
pub struct PhaseSpec<'a> {
    pub number: u32,
    pub name: &'a str,
    pub gated: bool,
}

/// Run exactly one phase for one issue (spec §4.5): start the phase,
/// invoke the agent, record token usage and check budget, optionally
/// evaluate a quality gate with exactly one retry on failure, then mark the
/// phase complete and return its `PhaseResult`.
///
/// An ordinary failure — the agent invocation itself not succeeding, or the
/// gate still failing after the one allowed retry — is reported as
/// `Ok(PhaseResult { success: false, .. })`, never retried further here
/// (spec §4.5 steps 2 and 4). `Err` is reserved for `CadreError::
/// BudgetExceeded` and a shutdown signal, which propagate unchanged; the
/// caller (pipeline.rs) is responsible for those branches.
#[allow(clippy::too_many_arguments)]
pub async fn run_phase<A: AgentLauncher, G: GateCoordinator, N: NotificationManager>(
    checkpoint: &mut IssueCheckpoint,
    agent: &A,
    gate: &G,
    notifier: &N,
    budget_config: &BudgetConfig,
    issue_number: u64,
    spec: &PhaseSpec<'_>,
    worktree_path: &Path,
    prompt: String,
    cancel: &CancellationToken,
) -> Result<PhaseResult, CadreError> {
    if cancel.is_cancelled() {
        return Err(CadreError::ShutdownRequested);
    }

    checkpoint::start_phase(checkpoint, spec.number);
    let started_at = Instant::now();
    let mut total_tokens = 0u64;

    let first = run_one_attempt(
        checkpoint, agent, notifier, budget_config, issue_number, spec, worktree_path, &prompt, cancel,
    )
    .await?;
    total_tokens += first.tokens;
    if !first.outcome.success {
        return Ok(failure_result(spec, started_at, total_tokens, None, first.error_message()));
    }
    // First invocation's output produced this phase's artifact.
    checkpoint::complete_phase(checkpoint, spec.number, None);

    if !spec.gated {
        return Ok(success_result(spec, started_at, total_tokens, None, first.outcome.raw_output));
    }

    let gate_result = evaluate_gate(gate, notifier, issue_number, spec.number).await?;
    checkpoint::record_gate_result(checkpoint, spec.number, gate_result.clone());

    if gate_result.is_success() {
        return Ok(success_result(spec, started_at, total_tokens, Some(gate_result), first.outcome.raw_output));
    }

    log_info!(
        "[{}][phase {}] gate failed, retrying once: {:?}",
        issue_number,
        spec.number,
        gate_result.errors
    );

    let second = run_one_attempt(
        checkpoint, agent, notifier, budget_config, issue_number, spec, worktree_path, &prompt, cancel,
    )
    .await?;
    total_tokens += second.tokens;
    if !second.outcome.success {
        return Ok(failure_result(spec, started_at, total_tokens, Some(gate_result), second.error_message()));
    }
    // The retry's output re-produced this phase's artifact.
    checkpoint::complete_phase(checkpoint, spec.number, None);

    let retry_gate_result = evaluate_gate(gate, notifier, issue_number, spec.number).await?;
    checkpoint::record_gate_result(checkpoint, spec.number, retry_gate_result.clone());

    if retry_gate_result.is_success() {
        return Ok(success_result(
            spec,
            started_at,
            total_tokens,
            Some(retry_gate_result),
            second.outcome.raw_output,
        ));
    }

    Ok(failure_result(
        spec,
        started_at,
        total_tokens,
        Some(retry_gate_result),
        "gate validation failed after retry".to_string(),
    ))
}

struct AttemptRecord {
    outcome: AgentOutcome,
    tokens: u64,
}

impl AttemptRecord {
    fn error_message(&self) -> String {
        self.outcome
            .error
            .clone()
            .unwrap_or_else(|| "agent invocation failed".to_string())
    }
}

/// Launch the agent once, record its tokens, and check the per-issue
/// budget. Returns `Err` only for cancellation or budget exhaustion; an
/// ordinary agent failure comes back inside the `AttemptRecord`'s outcome.
#[allow(clippy::too_many_arguments)]
async fn run_one_attempt<A: AgentLauncher, N: NotificationManager>(
    checkpoint: &mut IssueCheckpoint,
    agent: &A,
    notifier: &N,
    budget_config: &BudgetConfig,
    issue_number: u64,
    spec: &PhaseSpec<'_>,
    worktree_path: &Path,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<AttemptRecord, CadreError> {
    if cancel.is_cancelled() {
        return Err(CadreError::ShutdownRequested);
    }

    let ctx = AgentContext {
        issue_number,
        phase: spec.number,
        task_id: None,
        worktree_path: worktree_path.to_path_buf(),
        prompt: prompt.to_string(),
    };

    let outcome = launch_or_notify(agent, &ctx, notifier, issue_number, spec.number).await;
    let tokens = outcome.tokens_used;
    checkpoint::record_token_usage(checkpoint, "agent", spec.number, tokens);

    if check_issue_budget(checkpoint.token_usage.total, budget_config) == BudgetStatus::Exceeded {
        return Err(CadreError::BudgetExceeded {
            issue_number,
            spent: checkpoint.token_usage.total,
            cap: budget_config.per_issue_token_cap.unwrap_or(u64::MAX),
        });
    }

    Ok(AttemptRecord { outcome, tokens })
}

async fn evaluate_gate<G: GateCoordinator, N: NotificationManager>(
    gate: &G,
    notifier: &N,
    issue_number: u64,
    phase: u32,
) -> Result<GateResult, CadreError> {
    let result = gate.evaluate(issue_number, phase, "").await?;
    notify_if_ambiguous(notifier, issue_number, phase, &result.warnings).await;
    Ok(result)
}

fn success_result(
    spec: &PhaseSpec<'_>,
    started_at: Instant,
    tokens: u64,
    gate_result: Option<GateResult>,
    raw_output: String,
) -> PhaseResult {
    PhaseResult {
        phase: spec.number,
        phase_name: spec.name.to_string(),
        success: true,
        duration: started_at.elapsed(),
        token_usage: tokens,
        output_path: None,
        error: None,
        gate_result,
        raw_output: Some(raw_output),
    }
}

fn failure_result(
    spec: &PhaseSpec<'_>,
    started_at: Instant,
    tokens: u64,
    gate_result: Option<GateResult>,
    error: String,
) -> PhaseResult {
    PhaseResult {
        phase: spec.number,
        phase_name: spec.name.to_string(),
        success: false,
        duration: started_at.elapsed(),
        token_usage: tokens,
        output_path: None,
        error: Some(error),
        gate_result,
        raw_output: None,
    }
}
