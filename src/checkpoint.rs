use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::types::{
    FailedTask, FleetCheckpoint, GateResult, IssueCheckpoint, IssueStatus, IssueSummary,
};
use crate::{log_debug, log_warn};

/// Layout helpers for the persisted state tree (spec §6):
///
/// ```text
/// {state_dir}/
///   fleet-checkpoint.json
///   fleet-checkpoint.backup.json
///   issues/
///     {issue_number}/
///       checkpoint.json
///       checkpoint.backup.json
///       progress.jsonl
///   reports/
///     run-report-{iso-ts}.json
/// ```
pub fn issue_dir(state_dir: &Path, issue_number: u64) -> PathBuf {
    state_dir.join("issues").join(issue_number.to_string())
}

pub fn issue_checkpoint_path(state_dir: &Path, issue_number: u64) -> PathBuf {
    issue_dir(state_dir, issue_number).join("checkpoint.json")
}

pub fn issue_checkpoint_backup_path(state_dir: &Path, issue_number: u64) -> PathBuf {
    issue_dir(state_dir, issue_number).join("checkpoint.backup.json")
}

pub fn issue_progress_log_path(state_dir: &Path, issue_number: u64) -> PathBuf {
    issue_dir(state_dir, issue_number).join("progress.jsonl")
}

pub fn fleet_checkpoint_path(state_dir: &Path) -> PathBuf {
    state_dir.join("fleet-checkpoint.json")
}

pub fn fleet_checkpoint_backup_path(state_dir: &Path) -> PathBuf {
    state_dir.join("fleet-checkpoint.backup.json")
}

pub fn reports_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("reports")
}

/// Atomically write `value` as JSON to `path`: write to a sibling temp file,
/// fsync it, then rename over the destination. Before overwriting, the
/// existing file (if any) is copied to `backup_path` on a best-effort basis
/// — a failed backup copy never blocks the write itself.
fn atomic_write_json<T: Serialize>(path: &Path, backup_path: &Path, value: &T) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;

    if path.exists() {
        if let Err(e) = std::fs::copy(path, backup_path) {
            log_warn!(
                "failed to back up {} to {}: {} (continuing)",
                path.display(),
                backup_path.display(),
                e
            );
        }
    }

    let contents = serde_json::to_vec_pretty(value)
        .map_err(|e| format!("failed to serialize {}: {}", path.display(), e))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| format!("failed to create temp file in {}: {}", parent.display(), e))?;
    temp_file
        .write_all(&contents)
        .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
    temp_file
        .as_file()
        .sync_all()
        .map_err(|e| format!("failed to sync {}: {}", path.display(), e))?;
    temp_file
        .persist(path)
        .map_err(|e| format!("failed to persist {}: {}", path.display(), e))?;

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&contents).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
}

/// Load a per-issue checkpoint, falling back to the sibling backup if the
/// primary file is corrupt, and finally to a fresh checkpoint if both are
/// unreadable. Never errors — a freshly started issue has no checkpoint at
/// all, and that is not a failure condition. On a successful load (primary
/// or backup), `resumeCount` is incremented and the result persisted before
/// being returned (spec §4.1), so a second load without any intervening
/// mutation still observes the bumped count.
pub fn load_issue_checkpoint(state_dir: &Path, issue_number: u64) -> IssueCheckpoint {
    let path = issue_checkpoint_path(state_dir, issue_number);
    let backup_path = issue_checkpoint_backup_path(state_dir, issue_number);

    if !path.exists() {
        return IssueCheckpoint::new(issue_number);
    }

    let checkpoint = match read_json::<IssueCheckpoint>(&path) {
        Ok(mut checkpoint) => {
            checkpoint.resume_count += 1;
            Some(checkpoint)
        }
        Err(primary_err) => {
            log_warn!(
                "issue {} checkpoint corrupt ({}), trying backup",
                issue_number,
                primary_err
            );
            match read_json::<IssueCheckpoint>(&backup_path) {
                Ok(mut checkpoint) => {
                    checkpoint.resume_count += 1;
                    Some(checkpoint)
                }
                Err(backup_err) => {
                    log_warn!(
                        "issue {} backup checkpoint also corrupt ({}), starting fresh",
                        issue_number,
                        backup_err
                    );
                    None
                }
            }
        }
    };

    match checkpoint {
        Some(checkpoint) => {
            if let Err(e) = save_issue_checkpoint(state_dir, &checkpoint) {
                log_warn!("failed to persist bumped resume_count for issue {}: {}", issue_number, e);
            }
            checkpoint
        }
        None => IssueCheckpoint::new(issue_number),
    }
}

pub fn save_issue_checkpoint(state_dir: &Path, checkpoint: &IssueCheckpoint) -> Result<(), String> {
    let path = issue_checkpoint_path(state_dir, checkpoint.issue_number);
    let backup_path = issue_checkpoint_backup_path(state_dir, checkpoint.issue_number);
    atomic_write_json(&path, &backup_path, checkpoint)
}

#[derive(Serialize)]
struct ProgressEvent<'a> {
    timestamp: chrono::DateTime<Utc>,
    issue_number: u64,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<&'a str>,
}

/// Append one line to the issue's append-only `progress.jsonl` log. Failures
/// are logged but never propagated — the JSON checkpoint is the durable
/// source of truth; this log is a supplementary audit trail.
pub fn append_progress_event(
    state_dir: &Path,
    issue_number: u64,
    event: &str,
    phase: Option<u32>,
    task_id: Option<&str>,
    detail: Option<&str>,
) {
    let path = issue_progress_log_path(state_dir, issue_number);
    let record = ProgressEvent {
        timestamp: Utc::now(),
        issue_number,
        event,
        phase,
        task_id,
        detail,
    };

    let line = match serde_json::to_string(&record) {
        Ok(l) => l,
        Err(e) => {
            log_warn!("failed to serialize progress event: {}", e);
            return;
        }
    };

    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().append(true).create(true).open(&path)?;
        writeln!(file, "{}", line)
    })();

    if let Err(e) = result {
        log_warn!("failed to append progress event to {}: {}", path.display(), e);
    }
}

// --- Per-issue checkpoint mutators ---
//
// An issue's checkpoint is owned exclusively by its pipeline instance — no
// cross-pipeline mutation occurs, so these operate directly on `&mut
// IssueCheckpoint` without an actor (contrast `coordinator.rs`, which
// arbitrates the fleet checkpoint shared across all pipelines).

pub fn start_phase(checkpoint: &mut IssueCheckpoint, phase: u32) {
    checkpoint.current_phase = phase;
    checkpoint.current_task = None;
    checkpoint.last_checkpoint = Utc::now();
    log_debug!("[{}][phase {}] started", checkpoint.issue_number, phase);
}

pub fn complete_phase(checkpoint: &mut IssueCheckpoint, phase: u32, output_path: Option<PathBuf>) {
    checkpoint.completed_phases.insert(phase);
    checkpoint.phase_outputs.extend(output_path.map(|p| (phase, p)));
    checkpoint.last_checkpoint = Utc::now();
}

pub fn start_task(checkpoint: &mut IssueCheckpoint, task_id: &str) {
    checkpoint.current_task = Some(task_id.to_string());
    checkpoint.last_checkpoint = Utc::now();
}

pub fn complete_task(checkpoint: &mut IssueCheckpoint, task_id: &str) {
    checkpoint.completed_tasks.insert(task_id.to_string());
    checkpoint.blocked_tasks.remove(task_id);
    if checkpoint.current_task.as_deref() == Some(task_id) {
        checkpoint.current_task = None;
    }
    checkpoint.last_checkpoint = Utc::now();
}

pub fn fail_task(checkpoint: &mut IssueCheckpoint, task_id: &str, error: &str, attempts: u32) {
    checkpoint.failed_tasks.push(FailedTask {
        task_id: task_id.to_string(),
        error: error.to_string(),
        attempts,
        last_attempt: Utc::now(),
    });
    checkpoint.last_checkpoint = Utc::now();
}

pub fn block_task(checkpoint: &mut IssueCheckpoint, task_id: &str) {
    checkpoint.blocked_tasks.insert(task_id.to_string());
    if checkpoint.current_task.as_deref() == Some(task_id) {
        checkpoint.current_task = None;
    }
    checkpoint.last_checkpoint = Utc::now();
}

pub fn record_token_usage(checkpoint: &mut IssueCheckpoint, agent: &str, phase: u32, tokens: u64) {
    checkpoint.token_usage.total += tokens;
    *checkpoint.token_usage.by_phase.entry(phase).or_insert(0) += tokens;
    *checkpoint
        .token_usage
        .by_agent
        .entry(agent.to_string())
        .or_insert(0) += tokens;
    checkpoint.last_checkpoint = Utc::now();
}

pub fn record_gate_result(checkpoint: &mut IssueCheckpoint, phase: u32, result: GateResult) {
    checkpoint.gate_results.insert(phase, result);
    checkpoint.last_checkpoint = Utc::now();
}

pub fn set_worktree_info(
    checkpoint: &mut IssueCheckpoint,
    worktree_path: PathBuf,
    branch_name: String,
    base_commit: String,
) {
    checkpoint.worktree_path = Some(worktree_path);
    checkpoint.branch_name = Some(branch_name);
    checkpoint.base_commit = Some(base_commit);
    checkpoint.last_checkpoint = Utc::now();
}

/// Retracts exactly the listed phase IDs: removes each from
/// `completed_phases` and deletes its `phase_outputs`/`gate_results` entry,
/// then clears all task progress — `completed_tasks`, `failed_tasks`,
/// `blocked_tasks`, and `current_task` (spec §4.1). This is the only
/// operation that retracts state; used by the CLI's `reset` subcommand
/// (§10.4) when a prior run is superseded, e.g. a review-response pass.
pub fn reset_phases(checkpoint: &mut IssueCheckpoint, phase_ids: &[u32]) {
    for phase in phase_ids {
        checkpoint.completed_phases.remove(phase);
        checkpoint.phase_outputs.remove(phase);
        checkpoint.gate_results.remove(phase);
    }
    if let Some(&lowest) = phase_ids.iter().min() {
        if checkpoint.current_phase >= lowest {
            checkpoint.current_phase = lowest.saturating_sub(1);
        }
    }
    checkpoint.current_task = None;
    checkpoint.completed_tasks.clear();
    checkpoint.failed_tasks.clear();
    checkpoint.blocked_tasks.clear();
    checkpoint.last_checkpoint = Utc::now();
}

// --- Fleet checkpoint load/save ---
//
// Mutation of the fleet checkpoint always goes through the single-writer
// actor in `coordinator.rs`; the functions here are the pure load/save/
// mutate-in-place building blocks it calls.

/// Analogous to `load_issue_checkpoint`: on a successful load, `resumeCount`
/// is incremented and persisted before the checkpoint is returned.
pub fn load_fleet_checkpoint(state_dir: &Path, project_name: &str) -> FleetCheckpoint {
    let path = fleet_checkpoint_path(state_dir);
    let backup_path = fleet_checkpoint_backup_path(state_dir);

    if !path.exists() {
        return FleetCheckpoint::new(project_name);
    }

    let checkpoint = match read_json::<FleetCheckpoint>(&path) {
        Ok(mut checkpoint) => {
            checkpoint.resume_count += 1;
            Some(checkpoint)
        }
        Err(primary_err) => {
            log_warn!("fleet checkpoint corrupt ({}), trying backup", primary_err);
            match read_json::<FleetCheckpoint>(&backup_path) {
                Ok(mut checkpoint) => {
                    checkpoint.resume_count += 1;
                    Some(checkpoint)
                }
                Err(backup_err) => {
                    log_warn!(
                        "fleet backup checkpoint also corrupt ({}), starting fresh",
                        backup_err
                    );
                    None
                }
            }
        }
    };

    match checkpoint {
        Some(checkpoint) => {
            if let Err(e) = save_fleet_checkpoint(state_dir, &checkpoint) {
                log_warn!("failed to persist bumped fleet resume_count: {}", e);
            }
            checkpoint
        }
        None => FleetCheckpoint::new(project_name),
    }
}

pub fn save_fleet_checkpoint(state_dir: &Path, checkpoint: &FleetCheckpoint) -> Result<(), String> {
    let path = fleet_checkpoint_path(state_dir);
    let backup_path = fleet_checkpoint_backup_path(state_dir);
    atomic_write_json(&path, &backup_path, checkpoint)
}

pub fn set_issue_status(
    checkpoint: &mut FleetCheckpoint,
    issue_number: u64,
    issue_title: &str,
    status: IssueStatus,
) {
    let entry = checkpoint
        .issues
        .entry(issue_number)
        .or_insert_with(|| IssueSummary {
            status,
            issue_title: issue_title.to_string(),
            worktree_path: None,
            branch_name: None,
            last_phase: None,
            error: None,
            updated_at: Utc::now(),
        });
    entry.status = status;
    entry.updated_at = Utc::now();
    checkpoint.last_checkpoint = Utc::now();
}

pub fn record_fleet_token_usage(checkpoint: &mut FleetCheckpoint, issue_number: u64, tokens: u64) {
    checkpoint.token_usage.total += tokens;
    *checkpoint.token_usage.by_issue.entry(issue_number).or_insert(0) += tokens;
    checkpoint.last_checkpoint = Utc::now();
}

pub fn prune_issue(checkpoint: &mut FleetCheckpoint, issue_number: u64) {
    checkpoint.issues.remove(&issue_number);
    checkpoint.token_usage.by_issue.remove(&issue_number);
    checkpoint.last_checkpoint = Utc::now();
}
