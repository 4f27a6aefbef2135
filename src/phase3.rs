use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::budget::{check_issue_budget, BudgetStatus};
use crate::checkpoint;
use crate::config::BudgetConfig;
use crate::error::CadreError;
use crate::external::{AgentContext, AgentLauncher, GateCoordinator, NotificationManager};
use crate::log_warn;
use crate::retry::{self, RetryPolicy};
use crate::task_queue::{select_non_overlapping_batch, TaskQueue};
use crate::types::{GateStatus, ImplementationTask, IssueCheckpoint, PhaseResult};

/// Implementation-phase tuning (spec §4.6). `diff_truncate_bytes` applies to
/// both the per-task diff review and the optional whole-PR review, per the
/// truncation-symmetry decision recorded in `DESIGN.md`.
pub struct Phase3Config {
    pub phase_number: u32,
    pub max_parallel_agents: usize,
    pub max_retries_per_task: u32,
    pub build_check_max_retries: u32,
    pub max_whole_pr_review_retries: u32,
    pub diff_truncate_bytes: usize,
    pub whole_pr_review: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Phase3Config {
    pub fn from_execution(exec: &crate::config::ExecutionConfig, phase_number: u32) -> Self {
        Self {
            phase_number,
            max_parallel_agents: exec.max_parallel_agents as usize,
            max_retries_per_task: exec.max_retries_per_task,
            build_check_max_retries: exec.build_check_max_retries,
            max_whole_pr_review_retries: exec.max_whole_pr_review_retries,
            diff_truncate_bytes: exec.diff_truncate_bytes,
            whole_pr_review: exec.whole_pr_review,
            base_delay_ms: exec.base_delay_ms,
            max_delay_ms: exec.max_delay_ms,
        }
    }
}

const TRUNCATION_MARKER: &str = "\n...[truncated]...\n";

/// Truncate `text` to at most `max_bytes` (on a char boundary), appending a
/// marker so a reviewer can tell truncation happened. Applied identically to
/// per-task diffs and the whole-PR diff.
fn truncate_diff(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}

/// `AgentLauncher::launch` never throws (spec §6) — it reports failure via
/// `AgentOutcome.success`. Phase 3's per-task retry loop wraps every
/// sub-step in the retry executor, so a failed launch is turned back into
/// an `Err` here purely to feed that retry machinery; this is local to
/// phase 3's task-attempt pipeline and distinct from `phase_runner.rs`'s
/// ordinary-phase-failure handling, which never wraps agent failure in `Err`.
async fn launch_or_notify<A: AgentLauncher, N: NotificationManager>(
    agent: &A,
    ctx: &AgentContext,
    notifier: &N,
    issue_number: u64,
    phase: u32,
) -> Result<crate::external::AgentOutcome, CadreError> {
    let outcome = agent.launch(ctx).await;
    if !outcome.success {
        let message = outcome.error.clone().unwrap_or_else(|| "agent invocation failed".to_string());
        let _ = notifier
            .notify("agent-failed", &format!("issue {} phase {}: {}", issue_number, phase, message))
            .await;
        return Err(CadreError::NonFatalPhase { phase, message });
    }
    Ok(outcome)
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

fn check_budget(total: u64, budget_config: &BudgetConfig, issue_number: u64) -> Result<(), CadreError> {
    if check_issue_budget(total, budget_config) == BudgetStatus::Exceeded {
        return Err(CadreError::BudgetExceeded {
            issue_number,
            spent: total,
            cap: budget_config.per_issue_token_cap.unwrap_or(u64::MAX),
        });
    }
    Ok(())
}

/// Outcome of one task's full retry-wrapped sub-pipeline, produced inside the
/// concurrent batch and applied to the checkpoint/queue sequentially once the
/// whole batch has resolved (neither can tolerate concurrent `&mut` access).
enum TaskOutcome {
    Completed { diff: String },
    Blocked { error: String },
}

struct TaskRunRecord {
    task_id: String,
    token_events: Vec<(&'static str, u64)>,
    retries: Vec<(u32, String)>,
    outcome: Result<TaskOutcome, CadreError>,
}

/// Drive the phase-3 task queue to completion (spec §4.6): for each ready,
/// non-overlapping batch of tasks, run a code-writer agent, check budget,
/// optionally run a build-check-and-fix loop, run a test-writer agent
/// (unless the task is marked non-testable), then review the resulting diff
/// (truncated per `Phase3Config::diff_truncate_bytes`) and apply a
/// fix-surgeon pass if the review reports issues. Each task's sub-pipeline
/// runs under the retry executor with `max_retries_per_task` attempts; on
/// exhaustion the task is marked blocked (not the whole phase aborted) and
/// the loop continues with whatever else is ready. Every batch's tasks run
/// concurrently, bounded by `max_parallel_agents` (spec §5).
pub async fn run_phase3<A: AgentLauncher, G: GateCoordinator, N: NotificationManager>(
    checkpoint: &mut IssueCheckpoint,
    agent: &A,
    gate: &G,
    notifier: &N,
    budget_config: &BudgetConfig,
    issue_number: u64,
    worktree_path: &Path,
    proposed_tasks: Vec<ImplementationTask>,
    config: &Phase3Config,
    cancel: &CancellationToken,
) -> Result<PhaseResult, CadreError> {
    let started_at = Instant::now();
    let mut queue = TaskQueue::new(proposed_tasks)?;
    queue.restore_state(&checkpoint.completed_tasks, &checkpoint.blocked_tasks);

    let mut total_tokens = 0u64;
    let mut combined_diff = String::new();
    let budget_tokens = AtomicU64::new(checkpoint.token_usage.total);

    loop {
        if cancel.is_cancelled() {
            return Err(CadreError::ShutdownRequested);
        }

        if queue.is_complete() {
            break;
        }

        if queue.is_deadlocked() {
            log_warn!(
                "[{}][phase {}] task queue deadlocked — remaining tasks depend on blocked siblings",
                issue_number,
                config.phase_number
            );
            for task_id in queue.pending_ids() {
                queue.mark_blocked(&task_id);
                checkpoint::block_task(checkpoint, &task_id);
                let _ = notifier
                    .notify(
                        "task-blocked",
                        &format!(
                            "issue {} phase {} task {}: unreachable — depends on a blocked sibling",
                            issue_number, config.phase_number, task_id
                        ),
                    )
                    .await;
            }
            break;
        }

        let ready = queue.get_ready();
        let mut batch_ids: Vec<String> = select_non_overlapping_batch(&ready, config.max_parallel_agents)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();

        if batch_ids.is_empty() {
            // Ready tasks exist but all overlap with each other; process one
            // at a time next round. Avoid spinning by forcing the first.
            match ready.first() {
                Some(first) => batch_ids.push(first.id.clone()),
                None => continue,
            }
        }

        // Transition every batch member to `running` before the concurrent
        // region starts — these are sequential `&mut` mutations, cheap, and
        // must happen before any `.await` point that could interleave them.
        for task_id in &batch_ids {
            queue.start(task_id);
            checkpoint::start_task(checkpoint, task_id);
        }

        let tasks: Vec<ImplementationTask> = batch_ids
            .iter()
            .map(|id| queue.task(id).cloned().expect("batch task id came from the queue"))
            .collect();

        let records = join_all(tasks.into_iter().map(|task| {
            run_task_concurrently(
                agent,
                gate,
                notifier,
                budget_config,
                issue_number,
                worktree_path,
                task,
                config,
                cancel,
                &budget_tokens,
            )
        }))
        .await;

        let mut propagate: Option<CadreError> = None;
        for record in records {
            let result = apply_task_record(
                checkpoint,
                &mut queue,
                &mut combined_diff,
                &mut total_tokens,
                notifier,
                issue_number,
                config.phase_number,
                record,
            )
            .await;
            if let Err(err) = result {
                if propagate.is_none() {
                    propagate = Some(err);
                }
            }
        }
        if let Some(err) = propagate {
            return Err(err);
        }
    }

    let counts = queue.get_counts();
    if counts.completed == 0 && counts.blocked > 0 {
        return Err(CadreError::FatalPhase {
            phase: config.phase_number,
            message: "all implementation sessions blocked".to_string(),
        });
    }

    let gate_result = if config.whole_pr_review {
        Some(run_whole_pr_review(checkpoint, agent, gate, notifier, issue_number, worktree_path, &combined_diff, config).await?)
    } else {
        None
    };

    if let Some(ref result) = gate_result {
        if let Some(GateStatus::Fail) = result.status {
            return Err(CadreError::GateFailure {
                phase: config.phase_number,
                errors: result.errors.clone(),
            });
        }
    }

    checkpoint::complete_phase(checkpoint, config.phase_number, None);

    Ok(PhaseResult {
        phase: config.phase_number,
        phase_name: "implement".to_string(),
        success: true,
        duration: started_at.elapsed(),
        token_usage: total_tokens,
        output_path: None,
        error: None,
        gate_result,
        raw_output: None,
    })
}

/// Runs one task's sub-pipeline under the retry executor, touching nothing
/// but shared/read-only state and the batch-wide token counter — this is the
/// piece that runs concurrently with its siblings, so it must never take
/// `&mut IssueCheckpoint`/`&mut TaskQueue`. Checkpoint and queue mutation
/// happens afterward, sequentially, in `apply_task_record`.
#[allow(clippy::too_many_arguments)]
async fn run_task_concurrently<A: AgentLauncher, G: GateCoordinator, N: NotificationManager>(
    agent: &A,
    gate: &G,
    notifier: &N,
    budget_config: &BudgetConfig,
    issue_number: u64,
    worktree_path: &Path,
    task: ImplementationTask,
    config: &Phase3Config,
    cancel: &CancellationToken,
    budget_tokens: &AtomicU64,
) -> TaskRunRecord {
    let task_id = task.id.clone();

    if cancel.is_cancelled() {
        return TaskRunRecord {
            task_id,
            token_events: Vec::new(),
            retries: Vec::new(),
            outcome: Err(CadreError::ShutdownRequested),
        };
    }

    let policy = RetryPolicy {
        max_attempts: config.max_retries_per_task.max(1),
        base_delay_ms: config.base_delay_ms,
        max_delay_ms: config.max_delay_ms,
    };

    let mut task_diff = String::new();
    let mut token_events: Vec<(&'static str, u64)> = Vec::new();
    let mut retries: Vec<(u32, String)> = Vec::new();

    let outcome = retry::execute(
        policy,
        cancel,
        |_attempt| {
            run_task_attempt(
                agent,
                gate,
                notifier,
                budget_config,
                issue_number,
                worktree_path,
                &task,
                config,
                budget_tokens,
                &mut task_diff,
                &mut token_events,
            )
        },
        |attempt, err| {
            log_warn!(
                "[{}][phase {}][task {}] attempt {} failed: {}",
                issue_number,
                config.phase_number,
                task_id,
                attempt,
                err
            );
            retries.push((attempt, err.to_string()));
        },
        |_err| None,
    )
    .await;

    let outcome = match outcome {
        Ok(result) => {
            let _ = result.attempts;
            Ok(TaskOutcome::Completed { diff: task_diff })
        }
        Err(err) if err.is_budget_exceeded() || err.is_shutdown() => Err(err),
        Err(err) => Ok(TaskOutcome::Blocked { error: err.to_string() }),
    };

    TaskRunRecord {
        task_id,
        token_events,
        retries,
        outcome,
    }
}

/// Applies one task's concurrent result to the checkpoint and queue, and
/// dispatches the notifications that depend on the outcome (`task-retry` for
/// every failed attempt, `task-blocked` on exhaustion). Runs strictly after
/// the batch's `join_all` resolves, so `&mut` access here never overlaps
/// another task's.
#[allow(clippy::too_many_arguments)]
async fn apply_task_record<N: NotificationManager>(
    checkpoint: &mut IssueCheckpoint,
    queue: &mut TaskQueue,
    combined_diff: &mut String,
    total_tokens: &mut u64,
    notifier: &N,
    issue_number: u64,
    phase_number: u32,
    record: TaskRunRecord,
) -> Result<(), CadreError> {
    for (agent_name, tokens) in &record.token_events {
        checkpoint::record_token_usage(checkpoint, agent_name, phase_number, *tokens);
        *total_tokens += tokens;
    }

    for (attempt, err) in &record.retries {
        checkpoint::fail_task(checkpoint, &record.task_id, err, *attempt);
        let _ = notifier
            .notify(
                "task-retry",
                &format!(
                    "issue {} phase {} task {} attempt {}: {}",
                    issue_number, phase_number, record.task_id, attempt, err
                ),
            )
            .await;
    }

    match record.outcome {
        Ok(TaskOutcome::Completed { diff }) => {
            combined_diff.push_str(&diff);
            queue.complete(&record.task_id);
            checkpoint::complete_task(checkpoint, &record.task_id);
            Ok(())
        }
        Ok(TaskOutcome::Blocked { error }) => {
            log_warn!(
                "[{}][phase {}][task {}] exhausted retries, marking blocked: {}",
                issue_number,
                phase_number,
                record.task_id,
                error
            );
            queue.mark_blocked(&record.task_id);
            checkpoint::block_task(checkpoint, &record.task_id);
            let _ = notifier
                .notify(
                    "task-blocked",
                    &format!("issue {} phase {} task {}: {}", issue_number, phase_number, record.task_id, error),
                )
                .await;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// One full attempt of a task's sub-pipeline: code-writer, optional
/// build-check-and-fix loop, test-writer (unless non-testable), diff review,
/// and a single fix-surgeon pass on review failure. Takes only shared/
/// read-only collaborators plus a batch-wide atomic token counter so it can
/// run concurrently with sibling tasks' attempts.
#[allow(clippy::too_many_arguments)]
async fn run_task_attempt<A: AgentLauncher, G: GateCoordinator, N: NotificationManager>(
    agent: &A,
    gate: &G,
    notifier: &N,
    budget_config: &BudgetConfig,
    issue_number: u64,
    worktree_path: &Path,
    task: &ImplementationTask,
    config: &Phase3Config,
    budget_tokens: &AtomicU64,
    task_diff: &mut String,
    token_events: &mut Vec<(&'static str, u64)>,
) -> Result<(), CadreError> {
    let task_id = task.id.as_str();

    let code_ctx = AgentContext {
        issue_number,
        phase: config.phase_number,
        task_id: Some(task_id.to_string()),
        worktree_path: worktree_path.to_path_buf(),
        prompt: format!("implement task {}: {}", task.name, task.description),
    };
    let outcome = launch_or_notify(agent, &code_ctx, notifier, issue_number, config.phase_number).await?;
    budget_tokens.fetch_add(outcome.tokens_used, Ordering::SeqCst);
    token_events.push(("code-writer", outcome.tokens_used));
    check_budget(budget_tokens.load(Ordering::SeqCst), budget_config, issue_number)?;

    let mut build_attempts = 0;
    loop {
        let build_result = gate.evaluate(issue_number, config.phase_number, "").await?;
        notify_if_ambiguous(notifier, issue_number, config.phase_number, &build_result.warnings).await;
        if build_result.is_success() || build_attempts >= config.build_check_max_retries {
            break;
        }
        build_attempts += 1;
        let fix_ctx = AgentContext {
            issue_number,
            phase: config.phase_number,
            task_id: Some(task_id.to_string()),
            worktree_path: worktree_path.to_path_buf(),
            prompt: format!("fix build errors for task {}: {:?}", task_id, build_result.errors),
        };
        let fix_outcome = launch_or_notify(agent, &fix_ctx, notifier, issue_number, config.phase_number).await?;
        budget_tokens.fetch_add(fix_outcome.tokens_used, Ordering::SeqCst);
        token_events.push(("fix-surgeon", fix_outcome.tokens_used));
        check_budget(budget_tokens.load(Ordering::SeqCst), budget_config, issue_number)?;
    }

    if !task.non_testable {
        let test_ctx = AgentContext {
            issue_number,
            phase: config.phase_number,
            task_id: Some(task_id.to_string()),
            worktree_path: worktree_path.to_path_buf(),
            prompt: format!("write tests for task {}", task.name),
        };
        let test_outcome = launch_or_notify(agent, &test_ctx, notifier, issue_number, config.phase_number).await?;
        budget_tokens.fetch_add(test_outcome.tokens_used, Ordering::SeqCst);
        token_events.push(("test-writer", test_outcome.tokens_used));
        check_budget(budget_tokens.load(Ordering::SeqCst), budget_config, issue_number)?;
    }

    *task_diff = truncate_diff(&outcome.raw_output, config.diff_truncate_bytes);

    let review = gate.evaluate(issue_number, config.phase_number, task_diff).await?;
    notify_if_ambiguous(notifier, issue_number, config.phase_number, &review.warnings).await;
    if let Some(GateStatus::Fail) = review.status {
        let fix_ctx = AgentContext {
            issue_number,
            phase: config.phase_number,
            task_id: Some(task_id.to_string()),
            worktree_path: worktree_path.to_path_buf(),
            prompt: format!("address review feedback for task {}: {:?}", task_id, review.errors),
        };
        let fix_outcome = launch_or_notify(agent, &fix_ctx, notifier, issue_number, config.phase_number).await?;
        budget_tokens.fetch_add(fix_outcome.tokens_used, Ordering::SeqCst);
        token_events.push(("fix-surgeon", fix_outcome.tokens_used));
        check_budget(budget_tokens.load(Ordering::SeqCst), budget_config, issue_number)?;
        return Err(CadreError::NonFatalPhase {
            phase: config.phase_number,
            message: format!("task {} failed review: {:?}", task_id, review.errors),
        });
    }

    Ok(())
}

/// Runs the optional whole-PR review against the combined, truncated diff,
/// up to `max_whole_pr_review_retries` times: on `needs-fixes` invoke
/// fix-surgeon once and re-evaluate.
async fn run_whole_pr_review<A: AgentLauncher, G: GateCoordinator, N: NotificationManager>(
    checkpoint: &mut IssueCheckpoint,
    agent: &A,
    gate: &G,
    notifier: &N,
    issue_number: u64,
    worktree_path: &Path,
    combined_diff: &str,
    config: &Phase3Config,
) -> Result<crate::types::GateResult, CadreError> {
    let truncated = truncate_diff(combined_diff, config.diff_truncate_bytes);

    let mut result = gate.evaluate(issue_number, config.phase_number, &truncated).await?;
    notify_if_ambiguous(notifier, issue_number, config.phase_number, &result.warnings).await;
    let mut attempts = 0;
    while let Some(GateStatus::Fail) = result.status {
        if attempts >= config.max_whole_pr_review_retries {
            break;
        }
        attempts += 1;
        let fix_ctx = AgentContext {
            issue_number,
            phase: config.phase_number,
            task_id: None,
            worktree_path: worktree_path.to_path_buf(),
            prompt: format!("address whole-PR review feedback: {:?}", result.errors),
        };
        let fix_outcome = launch_or_notify(agent, &fix_ctx, notifier, issue_number, config.phase_number).await?;
        checkpoint::record_token_usage(checkpoint, "fix-surgeon", config.phase_number, fix_outcome.tokens_used);
        result = gate.evaluate(issue_number, config.phase_number, &truncated).await?;
        notify_if_ambiguous(notifier, issue_number, config.phase_number, &result.warnings).await;
    }

    checkpoint::record_gate_result(checkpoint, config.phase_number, result.clone());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::mocks::{AlwaysPassGate, MockAgentLauncher, MockNotificationManager};
    use std::sync::atomic::{AtomicU32, Ordering as StdOrdering};

    fn task(id: &str, files: &[&str], deps: &[&str], non_testable: bool) -> ImplementationTask {
        ImplementationTask {
            id: id.to_string(),
            name: id.to_string(),
            description: "do the thing".to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            complexity: None,
            acceptance_criteria: vec![],
            non_testable,
        }
    }

    fn config() -> Phase3Config {
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
    async fn completes_all_independent_tasks() {
        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = MockAgentLauncher { tokens_per_call: 10 };
        let gate = AlwaysPassGate;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();
        let tasks = vec![task("a", &["a.rs"], &[], false), task("b", &["b.rs"], &[], true)];

        let result = run_phase3(
            &mut checkpoint,
            &agent,
            &gate,
            &notifier,
            &budget(),
            1,
            Path::new("/tmp/issue-1"),
            tasks,
            &config(),
            &cancel,
        )
        .await
        .unwrap();

        assert!(result.success);
        assert!(checkpoint.is_task_completed("a"));
        assert!(checkpoint.is_task_completed("b"));
    }

    #[tokio::test]
    async fn respects_task_dependencies() {
        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = MockAgentLauncher { tokens_per_call: 10 };
        let gate = AlwaysPassGate;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();
        let tasks = vec![task("a", &["a.rs"], &[], true), task("b", &["b.rs"], &["a"], true)];

        let result = run_phase3(
            &mut checkpoint,
            &agent,
            &gate,
            &notifier,
            &budget(),
            1,
            Path::new("/tmp/issue-1"),
            tasks,
            &config(),
            &cancel,
        )
        .await
        .unwrap();

        assert!(result.success);
        assert!(checkpoint.is_task_completed("a"));
        assert!(checkpoint.is_task_completed("b"));
    }

    #[tokio::test]
    async fn independent_tasks_in_one_batch_run_concurrently() {
        use tokio::sync::Barrier;

        /// Every call waits at a shared barrier before returning — this only
        /// resolves if both of the batch's tasks have their code-writer
        /// calls in flight at the same time.
        struct BarrierAgent {
            barrier: std::sync::Arc<Barrier>,
        }
        impl AgentLauncher for BarrierAgent {
            async fn launch(&self, ctx: &AgentContext) -> crate::external::AgentOutcome {
                self.barrier.wait().await;
                crate::external::AgentOutcome::ok(
                    format!("output for {:?}", ctx.task_id),
                    5,
                    Some("deadbeef".to_string()),
                )
            }
        }

        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = BarrierAgent {
            barrier: std::sync::Arc::new(Barrier::new(2)),
        };
        let gate = AlwaysPassGate;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();
        let tasks = vec![task("a", &["a.rs"], &[], true), task("b", &["b.rs"], &[], true)];

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            run_phase3(
                &mut checkpoint,
                &agent,
                &gate,
                &notifier,
                &budget(),
                1,
                Path::new("/tmp/issue-1"),
                tasks,
                &config(),
                &cancel,
            ),
        )
        .await
        .expect("batch must not deadlock waiting for a sequential sibling")
        .unwrap();

        assert!(result.success);
        assert!(checkpoint.is_task_completed("a"));
        assert!(checkpoint.is_task_completed("b"));
    }

    #[tokio::test]
    async fn budget_exceeded_aborts_mid_phase() {
        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = MockAgentLauncher { tokens_per_call: 2_000_000 };
        let gate = AlwaysPassGate;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();
        let tasks = vec![task("a", &["a.rs"], &[], true)];

        let result = run_phase3(
            &mut checkpoint,
            &agent,
            &gate,
            &notifier,
            &budget(),
            1,
            Path::new("/tmp/issue-1"),
            tasks,
            &config(),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(CadreError::BudgetExceeded { .. })));
    }

    struct AlwaysFailGate;
    impl GateCoordinator for AlwaysFailGate {
        async fn evaluate(&self, _issue_number: u64, _phase: u32, _diff: &str) -> Result<crate::types::GateResult, CadreError> {
            Ok(crate::types::GateResult {
                status: Some(GateStatus::Fail),
                warnings: vec![],
                errors: vec!["review rejected the diff".to_string()],
            })
        }
    }

    #[tokio::test]
    async fn task_blocked_after_exhausting_retries_does_not_abort_phase() {
        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = MockAgentLauncher { tokens_per_call: 10 };
        let gate = AlwaysFailGate;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();
        let tasks = vec![task("a", &["a.rs"], &[], true), task("b", &["b.rs"], &[], true)];

        let mut cfg = config();
        cfg.max_retries_per_task = 1;
        cfg.build_check_max_retries = 0;

        let result = run_phase3(
            &mut checkpoint,
            &agent,
            &gate,
            &notifier,
            &budget(),
            1,
            Path::new("/tmp/issue-1"),
            tasks,
            &cfg,
            &cancel,
        )
        .await;

        // Every task fails its review every attempt and every task blocks;
        // zero tasks complete, so the phase reports "all sessions blocked".
        assert!(matches!(result, Err(CadreError::FatalPhase { .. })));
        assert!(checkpoint.blocked_tasks.contains("a"));
        assert!(checkpoint.blocked_tasks.contains("b"));
        let events = notifier.events.lock().unwrap();
        assert!(events.iter().any(|(event, _)| event == "task-blocked"));
    }

    #[tokio::test]
    async fn one_blocked_task_does_not_block_sibling_completion() {
        let mut checkpoint = IssueCheckpoint::new(1);
        let calls = AtomicU32::new(0);

        /// Every task succeeds except "b", whose code-writer invocation
        /// always errors — it should exhaust retries and block, while "a"
        /// completes normally.
        struct FailsTaskB<'a> {
            calls: &'a AtomicU32,
        }
        impl<'a> AgentLauncher for FailsTaskB<'a> {
            async fn launch(&self, ctx: &AgentContext) -> crate::external::AgentOutcome {
                self.calls.fetch_add(1, StdOrdering::SeqCst);
                if ctx.task_id.as_deref() == Some("b") {
                    return crate::external::AgentOutcome::failed("code-writer rejected task b".to_string(), 0);
                }
                crate::external::AgentOutcome::ok(
                    format!("output for {:?}", ctx.task_id),
                    10,
                    Some("deadbeef".to_string()),
                )
            }
        }

        let agent = FailsTaskB { calls: &calls };
        let gate = AlwaysPassGate;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();
        let tasks = vec![task("a", &["a.rs"], &[], true), task("b", &["b.rs"], &[], true)];

        let mut cfg = config();
        cfg.max_retries_per_task = 1;
        cfg.build_check_max_retries = 0;

        let result = run_phase3(
            &mut checkpoint,
            &agent,
            &gate,
            &notifier,
            &budget(),
            1,
            Path::new("/tmp/issue-1"),
            tasks,
            &cfg,
            &cancel,
        )
        .await
        .unwrap();

        assert!(result.success);
        assert!(checkpoint.is_task_completed("a"));
        assert!(checkpoint.blocked_tasks.contains("b"));
        assert!(!checkpoint.is_task_completed("b"));
    }

    /// Task "b" depends on "a"; "a" exhausts its retries and blocks, leaving
    /// "b" unreachable (its dependency will never complete). The queue
    /// detects the deadlock and the loop must mark "b" blocked too rather
    /// than silently dropping it — it should never be offered as "ready"
    /// again on a later resume.
    #[tokio::test]
    async fn deadlocked_dependent_task_is_marked_blocked_not_silently_dropped() {
        struct FailsTaskA;
        impl AgentLauncher for FailsTaskA {
            async fn launch(&self, _ctx: &AgentContext) -> crate::external::AgentOutcome {
                crate::external::AgentOutcome::failed("code-writer rejected task a".to_string(), 0)
            }
        }

        let mut checkpoint = IssueCheckpoint::new(1);
        let agent = FailsTaskA;
        let gate = AlwaysPassGate;
        let notifier = MockNotificationManager::default();
        let cancel = CancellationToken::new();
        let tasks = vec![task("a", &["a.rs"], &[], true), task("b", &["b.rs"], &["a"], true)];

        let mut cfg = config();
        cfg.max_retries_per_task = 1;
        cfg.build_check_max_retries = 0;

        let result = run_phase3(
            &mut checkpoint,
            &agent,
            &gate,
            &notifier,
            &budget(),
            1,
            Path::new("/tmp/issue-1"),
            tasks,
            &cfg,
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(CadreError::FatalPhase { .. })));
        assert!(checkpoint.blocked_tasks.contains("a"));
        assert!(
            checkpoint.blocked_tasks.contains("b"),
            "the deadlocked dependent must be recorded blocked, not dropped"
        );
        assert!(!checkpoint.completed_tasks.contains("b"));
    }

    #[test]
    fn truncate_diff_appends_marker_past_cap() {
        let text = "a".repeat(100);
        let truncated = truncate_diff(&text, 10);
        assert!(truncated.starts_with("aaaaaaaaaa"));
        assert!(truncated.ends_with("[truncated]...\n"));
    }

    #[test]
    fn truncate_diff_leaves_short_text_untouched() {
        let text = "short diff";
        assert_eq!(truncate_diff(text, 1024), text);
    }
}
