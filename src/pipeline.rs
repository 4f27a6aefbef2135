use std::path::Path;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::{BudgetConfig, PhaseDef};
use crate::error::CadreError;
use crate::external::{AgentLauncher, GateCoordinator, NotificationManager, ResultParser};
use crate::phase3::{run_phase3, Phase3Config};
use crate::phase_runner::{run_phase, PhaseSpec};
use crate::types::{IssueCheckpoint, IssueResult, IssueStatus, PhaseResult};

/// The fixed position (1-indexed) of the implementation phase, which alone
/// is driven by the phase-3 task-queue executor rather than the plain
/// single-agent phase runner (spec §4.6/§4.7).
const IMPLEMENTATION_PHASE_NUMBER: u32 = 3;

/// Drive every configured phase for one issue in order, skipping phases
/// already completed on resume, dispatching lifecycle notifications between
/// phases, and classifying a mid-pipeline failure into one of the four
/// branches the spec names: budget-exceeded, critical failure, non-critical
/// failure (left `code-complete` for a follow-up pass), or an unexpected
/// exception (always treated as a hard failure).
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline<A: AgentLauncher, G: GateCoordinator, R: ResultParser, N: NotificationManager>(
    checkpoint: &mut IssueCheckpoint,
    agent: &A,
    gate: &G,
    parser: &R,
    notifier: &N,
    budget_config: &BudgetConfig,
    issue_number: u64,
    issue_title: &str,
    worktree_path: &Path,
    phases: &[PhaseDef],
    phase3_config: &Phase3Config,
    cancel: &CancellationToken,
) -> IssueResult {
    let started_at = Instant::now();
    let (resume_phase, _) = checkpoint.resume_point();

    let mut results: Vec<PhaseResult> = Vec::new();
    let mut total_tokens = 0u64;
    let mut final_status = IssueStatus::InProgress;
    let mut error: Option<String> = None;

    for (idx, phase_def) in phases.iter().enumerate() {
        let phase_number = (idx + 1) as u32;
        if phase_number < resume_phase || checkpoint.is_phase_completed(phase_number) {
            let _ = notifier
                .notify("phase-skipped", &format!("issue {} phase {}", issue_number, phase_number))
                .await;
            continue;
        }

        let _ = notifier
            .notify("phase-started", &format!("issue {} phase {}", issue_number, phase_number))
            .await;

        let outcome = if phase_number == IMPLEMENTATION_PHASE_NUMBER {
            run_implementation_phase(
                checkpoint, agent, gate, parser, notifier, budget_config, issue_number, worktree_path, &results,
                phase3_config, cancel,
            )
            .await
        } else {
            let spec = PhaseSpec {
                number: phase_number,
                name: &phase_def.name,
                gated: phase_def.gated,
            };
            let prompt = format!("[issue {}] {}: {}", issue_number, phase_def.name, issue_title);
            run_phase(checkpoint, agent, gate, notifier, budget_config, issue_number, &spec, worktree_path, prompt, cancel)
                .await
        };

        match outcome {
            Ok(phase_result) if phase_result.success => {
                total_tokens += phase_result.token_usage;
                let _ = notifier
                    .notify(
                        "phase-completed",
                        &format!("issue {} phase {} ({}ms)", issue_number, phase_number, phase_result.duration.as_millis()),
                    )
                    .await;
                results.push(phase_result);
            }
            // An ordinary phase failure (agent invocation, or gate failure
            // surviving its one retry) still produced a `PhaseResult` — it
            // belongs in `phases` like any other, and its tokens still
            // count, before the issue is classified failed/code-complete.
            Ok(phase_result) => {
                total_tokens += phase_result.token_usage;
                let message = phase_result.error.clone().unwrap_or_else(|| "phase failed".to_string());
                let _ = notifier
                    .notify("phase-failed", &format!("issue {} phase {}: {}", issue_number, phase_number, message))
                    .await;
                final_status = if phase_def.critical {
                    IssueStatus::Failed
                } else {
                    IssueStatus::CodeComplete
                };
                error = Some(message);
                results.push(phase_result);
                break;
            }
            Err(err) => {
                let _ = notifier
                    .notify("phase-failed", &format!("issue {} phase {}: {}", issue_number, phase_number, err))
                    .await;
                final_status = classify_failure(&err, phase_def.critical);
                error = Some(err.to_string());
                break;
            }
        }
    }

    if error.is_none() {
        final_status = IssueStatus::Completed;
    }

    IssueResult {
        issue_number,
        issue_title: issue_title.to_string(),
        success: matches!(final_status, IssueStatus::Completed),
        phases: results,
        pr: None,
        total_duration: started_at.elapsed(),
        token_usage: total_tokens,
        error,
        final_status,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_implementation_phase<A: AgentLauncher, G: GateCoordinator, R: ResultParser, N: NotificationManager>(
    checkpoint: &mut IssueCheckpoint,
    agent: &A,
    gate: &G,
    parser: &R,
    notifier: &N,
    budget_config: &BudgetConfig,
    issue_number: u64,
    worktree_path: &Path,
    prior_results: &[PhaseResult],
    phase3_config: &Phase3Config,
    cancel: &CancellationToken,
) -> Result<PhaseResult, CadreError> {
    let plan_output = prior_results
        .iter()
        .rev()
        .find_map(|r| r.raw_output.clone())
        .unwrap_or_default();

    let parsed = parser.parse(&plan_output)?;

    run_phase3(
        checkpoint,
        agent,
        gate,
        notifier,
        budget_config,
        issue_number,
        worktree_path,
        parsed.tasks,
        phase3_config,
        cancel,
    )
    .await
}

/// The spec's 4-way failure classification: budget exhaustion and shutdown
/// are their own branches; an unexpected/uncategorized (`Unknown`) error is
/// always a hard failure regardless of phase criticality; everything else
/// follows the phase's configured `critical` flag.
fn classify_failure(err: &CadreError, phase_critical: bool) -> IssueStatus {
    if err.is_budget_exceeded() {
        return IssueStatus::BudgetExceeded;
    }
    if err.is_shutdown() {
        return IssueStatus::Blocked;
    }
    match err {
        CadreError::Unknown(_) => IssueStatus::Failed,
        _ if phase_critical => IssueStatus::Failed,
        _ => IssueStatus::CodeComplete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::{AlwaysPassGate, MockAgentLauncher, MockNotificationManager};
    use crate::types::ImplementationTask;

    struct StubParser;
    impl ResultParser for StubParser {
        fn parse(&self, _raw_output: &str) -> Result<crate::external::ParsedResult, CadreError> {
            Ok(crate::external::ParsedResult {
                success: true,
                summary: "parsed".to_string(),
                tasks: vec![ImplementationTask {
                    id: "t1".to_string(),
                    name: "t1".to_string(),
                    description: "do it".to_string(),
                    files: vec!["a.rs".to_string()],
                    dependencies: vec![],
                    complexity: None,
                    acceptance_criteria: vec![],
                    non_testable: true,
                }],
                follow_up_notes: vec![],
            })
        }
    }

    fn phases() -> Vec<PhaseDef> {
        vec![
            PhaseDef::new("scope", true, true),
            PhaseDef::new("plan", true, true),
            PhaseDef::new("implement", true, true),
            PhaseDef::new("review", false, false),
        ]
    }

    fn phase3_config() -> Phase3Config {
        Phase3Config {
            phase_number: 3,
            max_parallel_agents: 2,
            max_retries_per_task: 2,
            build_check_max_retries: 1,
            max_whole_pr_review_retries: 1,
            diff_truncate_bytes: 1024,
            whole_pr_review: false,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    fn budget() -> BudgetConfig {
        BudgetConfig {
            fleet_token_cap: None,
            per_issue_token_cap: Some(1_000_000),
            warn_threshold_pct: 80,
            halt_threshold_pct: 100,
        }
    }

    #[tokio::test]
    async fn happy_path_completes_all_phases() {
        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = MockAgentLauncher { tokens_per_call: 100 };
        let gate = AlwaysPassGate;
        let parser = StubParser;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();

        let result = run_pipeline(
            &mut checkpoint,
            &agent,
            &gate,
            &parser,
            &notifier,
            &budget(),
            1,
            "Add widget",
            Path::new("/tmp/issue-1"),
            &phases(),
            &phase3_config(),
            &cancel,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.final_status, IssueStatus::Completed);
        assert_eq!(result.phases.len(), 4);
    }

    #[tokio::test]
    async fn resumes_from_completed_phases() {
        let mut checkpoint = IssueCheckpoint::new(1);
        checkpoint.completed_phases.insert(1);
        checkpoint.completed_phases.insert(2);
        let agent = MockAgentLauncher { tokens_per_call: 10 };
        let gate = AlwaysPassGate;
        let parser = StubParser;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();

        let result = run_pipeline(
            &mut checkpoint,
            &agent,
            &gate,
            &parser,
            &notifier,
            &budget(),
            1,
            "Add widget",
            Path::new("/tmp/issue-1"),
            &phases(),
            &phase3_config(),
            &cancel,
        )
        .await;

        assert!(result.success);
        // Only phases 3 and 4 should have actually run.
        assert_eq!(result.phases.len(), 2);
        let events = notifier.events.lock().unwrap();
        assert_eq!(events.iter().filter(|(event, _)| event == "phase-skipped").count(), 2);
    }

    #[tokio::test]
    async fn budget_exceeded_classified_distinctly() {
        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = MockAgentLauncher { tokens_per_call: 2_000_000 };
        let gate = AlwaysPassGate;
        let parser = StubParser;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();

        let result = run_pipeline(
            &mut checkpoint,
            &agent,
            &gate,
            &parser,
            &notifier,
            &budget(),
            1,
            "Add widget",
            Path::new("/tmp/issue-1"),
            &phases(),
            &phase3_config(),
            &cancel,
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.final_status, IssueStatus::BudgetExceeded);
    }

    #[test]
    fn non_critical_failure_leaves_issue_code_complete() {
        let err = CadreError::NonFatalPhase {
            phase: 4,
            message: "lint warnings".to_string(),
        };
        assert_eq!(classify_failure(&err, false), IssueStatus::CodeComplete);
    }

    #[test]
    fn critical_failure_marks_issue_failed() {
        let err = CadreError::FatalPhase {
            phase: 1,
            message: "scope rejected".to_string(),
        };
        assert_eq!(classify_failure(&err, true), IssueStatus::Failed);
    }

    #[test]
    fn unknown_error_always_fails_regardless_of_criticality() {
        let err = CadreError::Unknown("mystery panic".to_string());
        assert_eq!(classify_failure(&err, false), IssueStatus::Failed);
    }
}
