//! Fleet orchestrator (spec §4.8): drives a configured set of issues to
//! completion, bounding per-wave concurrency with a semaphore and tolerating
//! partial per-issue failure. Grounded on the teacher's
//! `scheduler.rs::run_scheduler` loop — a `JoinSet` of in-flight work raced
//! against cancellation via `tokio::select!`, with an explicit drain path on
//! shutdown — generalized from one flat worklist to dependency-ordered waves
//! of semaphore-bounded issue pipelines.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::budget::{check_fleet_budget, BudgetStatus};
use crate::checkpoint;
use crate::config::CadreConfig;
use crate::coordinator::{spawn_coordinator, CoordinatorHandle};
use crate::external::{AgentLauncher, GateCoordinator, NotificationManager, ResultParser, WorktreeManager};
use crate::phase3::Phase3Config;
use crate::pipeline::run_pipeline;
use crate::report;
use crate::shutdown;
use crate::types::{FleetResult, IssueResult, IssueStatus};
use crate::{log_error, log_info, log_warn};

const IMPLEMENTATION_PHASE_NUMBER: u32 = 3;

/// One issue to schedule into the fleet. Where these come from (an issue
/// tracker query, a CLI `--target` filter) is out of scope for this crate —
/// the caller assembles the list.
#[derive(Debug, Clone)]
pub struct IssueSpec {
    pub issue_number: u64,
    pub title: String,
    pub dependencies: Vec<u64>,
}

/// Drive every issue in `issues` through the configured pipeline and return
/// the aggregate `FleetResult`. Never panics on a single issue's failure —
/// each issue pipeline runs in its own task and a panic there is caught by
/// `JoinSet` and logged, not propagated.
#[allow(clippy::too_many_arguments)]
pub async fn run_fleet<W, A, G, R, N>(
    issues: Vec<IssueSpec>,
    worktrees: Arc<W>,
    agent: Arc<A>,
    gate: Arc<G>,
    parser: Arc<R>,
    notifier: Arc<N>,
    config: &CadreConfig,
    state_dir: PathBuf,
    cancel: CancellationToken,
) -> FleetResult
where
    W: WorktreeManager + 'static,
    A: AgentLauncher + 'static,
    G: GateCoordinator + 'static,
    R: ResultParser + 'static,
    N: NotificationManager + 'static,
{
    let started_at = Instant::now();
    let fleet_checkpoint = checkpoint::load_fleet_checkpoint(&state_dir, &config.project.name);
    let (coordinator, coordinator_task) = spawn_coordinator(fleet_checkpoint, state_dir.clone());

    log_info!("fleet started: {} issues queued", issues.len());
    let _ = notifier
        .notify("fleet-started", &format!("{} issues queued", issues.len()))
        .await;

    // Must complete strictly before the first `provision` call (spec §4.8
    // point 2) — a single shared warm-up, not a per-issue step.
    if let Err(err) = worktrees.prefetch().await {
        log_warn!("worktree prefetch failed: {}", err);
    }

    let snapshot = coordinator
        .get_snapshot()
        .await
        .unwrap_or_else(|e| {
            log_error!("failed to read fleet checkpoint snapshot: {}", e);
            crate::types::FleetCheckpoint::new(&config.project.name)
        });

    let active: Vec<IssueSpec> = issues
        .into_iter()
        .filter(|spec| !snapshot.is_issue_completed(spec.issue_number))
        .collect();

    let waves: Vec<Vec<IssueSpec>> = if config.dependency_waves.enabled {
        resolve_waves(active)
    } else {
        vec![active]
    };

    let mut issue_results: Vec<IssueResult> = Vec::new();
    let mut failed_issue_numbers: HashSet<u64> = HashSet::new();
    let mut halt = false;

    for wave in waves {
        if cancel.is_cancelled() || halt {
            break;
        }

        let mut runnable = Vec::new();
        for spec in wave {
            let blocking_dep = spec.dependencies.iter().find(|d| failed_issue_numbers.contains(d)).copied();
            if let Some(dep) = blocking_dep {
                log_warn!("issue {} skipped: upstream dependency {} failed", spec.issue_number, dep);
                let _ = coordinator
                    .set_issue_status(spec.issue_number, &spec.title, IssueStatus::DepFailed)
                    .await;
                failed_issue_numbers.insert(spec.issue_number);
                issue_results.push(dependency_skip_result(&spec, dep));
            } else {
                runnable.push(spec);
            }
        }

        if runnable.is_empty() {
            continue;
        }

        let semaphore = Arc::new(Semaphore::new(config.execution.max_parallel_issues.max(1) as usize));
        let mut join_set: JoinSet<IssueResult> = JoinSet::new();

        for spec in runnable {
            let permit_source = Arc::clone(&semaphore);
            let worktrees = Arc::clone(&worktrees);
            let agent = Arc::clone(&agent);
            let gate = Arc::clone(&gate);
            let parser = Arc::clone(&parser);
            let notifier = Arc::clone(&notifier);
            let coordinator = coordinator.clone();
            let config = config.clone();
            let state_dir = state_dir.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                process_issue(spec, worktrees, agent, gate, parser, notifier, coordinator, config, state_dir, cancel).await
            });
        }

        loop {
            tokio::select! {
                next = join_set.join_next() => {
                    match next {
                        Some(Ok(result)) => {
                            if !result.success {
                                failed_issue_numbers.insert(result.issue_number);
                            }
                            issue_results.push(result);
                        }
                        Some(Err(join_err)) => {
                            log_error!("issue pipeline task panicked: {}", join_err);
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    drain_join_set(&mut join_set, &mut issue_results, &mut failed_issue_numbers).await;
                    break;
                }
            }
        }

        let snapshot = coordinator.get_snapshot().await.unwrap_or_else(|e| {
            log_error!("failed to read fleet checkpoint snapshot: {}", e);
            crate::types::FleetCheckpoint::new(&config.project.name)
        });
        if check_fleet_budget(snapshot.token_usage.total, &config.budget) == BudgetStatus::Exceeded {
            halt = true;
        }
    }

    let final_snapshot = coordinator.get_snapshot().await.unwrap_or_else(|e| {
        log_error!("failed to read final fleet checkpoint snapshot: {}", e);
        crate::types::FleetCheckpoint::new(&config.project.name)
    });
    drop(coordinator);
    let _ = coordinator_task.await;

    let result = build_fleet_result(issue_results, started_at.elapsed(), final_snapshot.token_usage.total);

    log_info!(
        "fleet completed: {}/{} issues succeeded",
        result.issues.iter().filter(|i| i.success).count(),
        result.issues.len()
    );
    let _ = notifier
        .notify(
            "fleet-completed",
            &format!(
                "{}/{} issues succeeded",
                result.issues.iter().filter(|i| i.success).count(),
                result.issues.len()
            ),
        )
        .await;

    if let Some(path) = report::write_report(&state_dir, &result, Utc::now()) {
        log_info!("run report written to {}", path.display());
    }

    result
}

/// Drain every still-in-flight task after cancellation is observed, so each
/// issue pipeline's own result (recorded up to its last suspension point)
/// is still captured rather than discarded.
async fn drain_join_set(
    join_set: &mut JoinSet<IssueResult>,
    issue_results: &mut Vec<IssueResult>,
    failed_issue_numbers: &mut HashSet<u64>,
) {
    while let Some(next) = join_set.join_next().await {
        match next {
            Ok(result) => {
                if !result.success {
                    failed_issue_numbers.insert(result.issue_number);
                }
                issue_results.push(result);
            }
            Err(join_err) => {
                log_error!("issue pipeline task panicked during drain: {}", join_err);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_issue<W, A, G, R, N>(
    spec: IssueSpec,
    worktrees: Arc<W>,
    agent: Arc<A>,
    gate: Arc<G>,
    parser: Arc<R>,
    notifier: Arc<N>,
    coordinator: CoordinatorHandle,
    config: CadreConfig,
    state_dir: PathBuf,
    cancel: CancellationToken,
) -> IssueResult
where
    W: WorktreeManager,
    A: AgentLauncher,
    G: GateCoordinator,
    R: ResultParser,
    N: NotificationManager,
{
    let resume = checkpoint::issue_checkpoint_path(&state_dir, spec.issue_number).exists();
    shutdown::mark_issue_in_progress(spec.issue_number);
    let _ = coordinator
        .set_issue_status(spec.issue_number, &spec.title, IssueStatus::InProgress)
        .await;
    let _ = notifier
        .notify("issue-started", &format!("issue {} ({})", spec.issue_number, spec.title))
        .await;

    let worktree = match worktrees.provision(spec.issue_number, &spec.title, resume).await {
        Ok(w) => w,
        Err(err) => {
            shutdown::mark_issue_done(spec.issue_number);
            log_warn!("issue {} worktree provisioning failed: {}", spec.issue_number, err);
            let _ = coordinator
                .set_issue_status(spec.issue_number, &spec.title, IssueStatus::Failed)
                .await;
            let _ = coordinator.set_error(spec.issue_number, Some(err.to_string())).await;
            let _ = notifier
                .notify("issue-failed", &format!("issue {} ({}): {}", spec.issue_number, spec.title, err))
                .await;
            return IssueResult {
                issue_number: spec.issue_number,
                issue_title: spec.title,
                success: false,
                phases: Vec::new(),
                pr: None,
                total_duration: Duration::ZERO,
                token_usage: 0,
                error: Some(err.to_string()),
                final_status: IssueStatus::Failed,
            };
        }
    };

    let _ = coordinator
        .set_worktree_info(spec.issue_number, worktree.path.clone(), &worktree.branch_name)
        .await;

    let mut issue_checkpoint = checkpoint::load_issue_checkpoint(&state_dir, spec.issue_number);
    checkpoint::set_worktree_info(
        &mut issue_checkpoint,
        worktree.path.clone(),
        worktree.branch_name.clone(),
        worktree.base_commit.clone(),
    );

    let phase3_config = Phase3Config::from_execution(&config.execution, IMPLEMENTATION_PHASE_NUMBER);

    let result = run_pipeline(
        &mut issue_checkpoint,
        agent.as_ref(),
        gate.as_ref(),
        parser.as_ref(),
        notifier.as_ref(),
        &config.budget,
        spec.issue_number,
        &spec.title,
        &worktree.path,
        &config.phases,
        &phase3_config,
        &cancel,
    )
    .await;

    if let Err(e) = checkpoint::save_issue_checkpoint(&state_dir, &issue_checkpoint) {
        log_warn!("failed to persist issue {} checkpoint: {}", spec.issue_number, e);
    }

    let _ = coordinator.record_token_usage(spec.issue_number, result.token_usage).await;
    let _ = coordinator
        .set_issue_status(spec.issue_number, &spec.title, result.final_status)
        .await;
    if let Some(err) = &result.error {
        let _ = coordinator.set_error(spec.issue_number, Some(err.clone())).await;
    }
    if let Some(&last_phase) = issue_checkpoint.completed_phases.iter().max() {
        let _ = coordinator.set_last_phase(spec.issue_number, last_phase).await;
    }

    if result.success {
        let _ = notifier
            .notify("issue-completed", &format!("issue {} ({})", spec.issue_number, spec.title))
            .await;
    } else {
        let _ = notifier
            .notify(
                "issue-failed",
                &format!(
                    "issue {} ({}): {}",
                    spec.issue_number,
                    spec.title,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
            )
            .await;
    }

    if let Ok(snapshot) = coordinator.get_snapshot().await {
        match check_fleet_budget(snapshot.token_usage.total, &config.budget) {
            BudgetStatus::Warn => {
                let _ = notifier
                    .notify("budget-warning", &format!("fleet token usage at {} tokens", snapshot.token_usage.total))
                    .await;
            }
            BudgetStatus::Exceeded => {
                let _ = notifier
                    .notify("budget-exceeded", &format!("fleet token usage at {} tokens", snapshot.token_usage.total))
                    .await;
            }
            BudgetStatus::Ok => {}
        }
    }

    shutdown::mark_issue_done(spec.issue_number);
    result
}

fn dependency_skip_result(spec: &IssueSpec, dependency: u64) -> IssueResult {
    IssueResult {
        issue_number: spec.issue_number,
        issue_title: spec.title.clone(),
        success: false,
        phases: Vec::new(),
        pr: None,
        total_duration: Duration::ZERO,
        token_usage: 0,
        error: Some(format!("depends on failed issue {}", dependency)),
        final_status: IssueStatus::DepFailed,
    }
}

/// Layer issues into waves via Kahn's algorithm: a wave contains every
/// issue whose dependencies are all either already resolved (completed in
/// an earlier run, so absent from this active set) or in an earlier wave.
/// A dependency cycle (or a dependency on an issue that never appears)
/// can't be layered — the remainder is dumped into one final wave, and
/// the per-issue dep-* skip above catches genuinely-failed predecessors;
/// an unresolvable cycle simply runs all its members concurrently.
fn resolve_waves(specs: Vec<IssueSpec>) -> Vec<Vec<IssueSpec>> {
    let mut remaining: HashMap<u64, IssueSpec> = specs.into_iter().map(|s| (s.issue_number, s)).collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<u64>, Vec<u64>) = remaining
            .keys()
            .copied()
            .partition(|id| remaining[id].dependencies.iter().all(|d| !remaining.contains_key(d)));

        if ready.is_empty() {
            let mut leftover: Vec<IssueSpec> = blocked.into_iter().filter_map(|id| remaining.remove(&id)).collect();
            leftover.sort_by_key(|s| s.issue_number);
            waves.push(leftover);
            break;
        }

        let mut wave: Vec<IssueSpec> = ready.into_iter().filter_map(|id| remaining.remove(&id)).collect();
        wave.sort_by_key(|s| s.issue_number);
        waves.push(wave);
    }

    waves
}

fn build_fleet_result(issues: Vec<IssueResult>, total_duration: Duration, token_usage: u64) -> FleetResult {
    let mut prs_created = Vec::new();
    let mut failed_issues = Vec::new();
    let mut code_done_no_pr = Vec::new();

    for issue in &issues {
        if let Some(pr) = &issue.pr {
            prs_created.push(pr.clone());
        }
        match issue.final_status {
            IssueStatus::Failed => failed_issues.push(issue.issue_number),
            IssueStatus::CodeComplete => code_done_no_pr.push(issue.issue_number),
            _ => {}
        }
    }

    let success = issues.iter().all(|i| !matches!(i.final_status, IssueStatus::Failed) && !i.final_status.is_dependency_skip());

    FleetResult {
        success,
        issues,
        prs_created,
        failed_issues,
        code_done_no_pr,
        total_duration,
        token_usage,
    }
}
