use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Per-issue status (used inside the pipeline for local bookkeeping) ---

/// Scheduling-level status recorded for an issue in the fleet checkpoint.
///
/// `Completed` and `BudgetExceeded` are terminal-for-scheduling: the fleet
/// orchestrator will not retry the issue within the run. `CodeComplete` is
/// explicitly NOT terminal — a follow-up pass could still create a PR.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IssueStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Blocked,
    BudgetExceeded,
    CodeComplete,
    DepFailed,
    DepMergeConflict,
    DepBuildBroken,
    DepBlocked,
}

impl IssueStatus {
    /// True only for `Completed` or `BudgetExceeded` — explicitly NOT for
    /// `CodeComplete`, which may still need a follow-up pass.
    pub fn is_terminal_for_scheduling(&self) -> bool {
        matches!(self, IssueStatus::Completed | IssueStatus::BudgetExceeded)
    }

    /// True for any of the `dep-*` family produced by a failed dependency wave.
    pub fn is_dependency_skip(&self) -> bool {
        matches!(
            self,
            IssueStatus::DepFailed
                | IssueStatus::DepMergeConflict
                | IssueStatus::DepBuildBroken
                | IssueStatus::DepBlocked
        )
    }
}

/// Implementation-task lifecycle state tracked by the phase-3 task queue.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Completed,
    Blocked,
}

/// Outcome of a post-phase quality gate. `Warn` is informational and does
/// not fail the phase; `Fail` triggers exactly one retry of the phase.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct GateResult {
    pub status: Option<GateStatus>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        Self {
            status: Some(GateStatus::Pass),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// `warn` is treated as success by the phase runner.
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(GateStatus::Pass) | Some(GateStatus::Warn))
    }
}

/// A single phase or task attempt that exhausted its retries.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FailedTask {
    pub task_id: String,
    pub error: String,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

/// `{total, byPhase, byAgent}` accumulator embedded in a per-issue checkpoint.
///
/// Invariant: `total == sum(by_phase.values()) == sum(by_agent.values())`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TokenUsage {
    pub total: u64,
    #[serde(default)]
    pub by_phase: HashMap<u32, u64>,
    #[serde(default)]
    pub by_agent: HashMap<String, u64>,
}

/// `{total, byIssue}` accumulator embedded in the fleet checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct FleetTokenUsage {
    pub total: u64,
    #[serde(default)]
    pub by_issue: HashMap<u64, u64>,
}

/// A single token-consumption observation reported by an agent invocation.
/// Accumulation is pure addition; never subtracted.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUsageEvent {
    pub agent: String,
    pub phase: u32,
    pub issue_number: u64,
    pub tokens: u64,
}

/// Durable per-issue progress record. Mutated by exactly one pipeline at a
/// time; persisted after every transition (see `checkpoint.rs`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IssueCheckpoint {
    pub issue_number: u64,
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    #[serde(default)]
    pub resume_count: u32,
    #[serde(default)]
    pub current_phase: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default)]
    pub completed_phases: BTreeSet<u32>,
    #[serde(default)]
    pub completed_tasks: BTreeSet<String>,
    #[serde(default)]
    pub blocked_tasks: BTreeSet<String>,
    #[serde(default)]
    pub failed_tasks: Vec<FailedTask>,
    #[serde(default)]
    pub phase_outputs: HashMap<u32, PathBuf>,
    #[serde(default)]
    pub gate_results: HashMap<u32, GateResult>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_exceeded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
}

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

impl IssueCheckpoint {
    pub fn new(issue_number: u64) -> Self {
        let now = Utc::now();
        Self {
            issue_number,
            version: CHECKPOINT_SCHEMA_VERSION,
            started_at: now,
            last_checkpoint: now,
            resume_count: 0,
            current_phase: 0,
            current_task: None,
            completed_phases: BTreeSet::new(),
            completed_tasks: BTreeSet::new(),
            blocked_tasks: BTreeSet::new(),
            failed_tasks: Vec::new(),
            phase_outputs: HashMap::new(),
            gate_results: HashMap::new(),
            token_usage: TokenUsage::default(),
            budget_exceeded: None,
            worktree_path: None,
            branch_name: None,
            base_commit: None,
        }
    }

    /// `{phase, task}` — phase = 1 if nothing completed yet, else
    /// `max(completedPhases) + 1`.
    pub fn resume_point(&self) -> (u32, Option<String>) {
        let phase = self.completed_phases.iter().max().map_or(1, |p| p + 1);
        (phase, self.current_task.clone())
    }

    pub fn is_phase_completed(&self, phase: u32) -> bool {
        self.completed_phases.contains(&phase)
    }

    pub fn is_task_completed(&self, task_id: &str) -> bool {
        self.completed_tasks.contains(task_id)
    }

    pub fn is_task_blocked(&self, task_id: &str) -> bool {
        self.blocked_tasks.contains(task_id)
    }
}

/// Per-issue summary tracked inside the fleet checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IssueSummary {
    pub status: IssueStatus,
    pub issue_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_phase: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Durable fleet-wide progress record. Mutated only under the coordinator's
/// single logical writer (see `coordinator.rs`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FleetCheckpoint {
    pub project_name: String,
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    #[serde(default)]
    pub resume_count: u32,
    #[serde(default)]
    pub issues: HashMap<u64, IssueSummary>,
    #[serde(default)]
    pub token_usage: FleetTokenUsage,
}

impl FleetCheckpoint {
    pub fn new(project_name: &str) -> Self {
        let now = Utc::now();
        Self {
            project_name: project_name.to_string(),
            version: CHECKPOINT_SCHEMA_VERSION,
            started_at: now,
            last_checkpoint: now,
            resume_count: 0,
            issues: HashMap::new(),
            token_usage: FleetTokenUsage::default(),
        }
    }

    /// True only for `Completed` or `BudgetExceeded`.
    pub fn is_issue_completed(&self, issue_number: u64) -> bool {
        self.issues
            .get(&issue_number)
            .map(|s| s.status.is_terminal_for_scheduling())
            .unwrap_or(false)
    }
}

// --- Implementation task model (phase-3, transient) ---

/// One unit of implementation work inside phase 3. Transient — parsed from
/// phase-2 output and discarded at the end of the phase-3 execution.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImplementationTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Non-testable tasks skip the test-writer agent invocation (§4.6 step 5).
    #[serde(default)]
    pub non_testable: bool,
}

// --- Phase / issue / fleet results ---

pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Result of running exactly one phase for one issue (§4.5).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseResult {
    pub phase: u32,
    pub phase_name: String,
    pub success: bool,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub token_usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<GateResult>,
    /// The agent's raw textual output for this phase, kept only for the
    /// next phase to parse (e.g. phase 3 parsing phase 2's proposed task
    /// list) — never persisted in a run report.
    #[serde(skip, default)]
    pub raw_output: Option<String>,
}

/// Output of an issue pipeline run (§4.7).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IssueResult {
    pub issue_number: u64,
    pub issue_title: String,
    pub success: bool,
    #[serde(default)]
    pub phases: Vec<PhaseResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr: Option<String>,
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    #[serde(default)]
    pub token_usage: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub final_status: IssueStatus,
}

/// Aggregate fleet-wide outcome (§4.8 point 5).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FleetResult {
    pub success: bool,
    #[serde(default)]
    pub issues: Vec<IssueResult>,
    #[serde(default)]
    pub prs_created: Vec<String>,
    #[serde(default)]
    pub failed_issues: Vec<u64>,
    #[serde(default)]
    pub code_done_no_pr: Vec<u64>,
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    #[serde(default)]
    pub token_usage: u64,
}

impl FleetResult {
    pub fn completion_percentage(&self) -> f64 {
        if self.issues.is_empty() {
            return 100.0;
        }
        let done = self.issues.iter().filter(|i| i.success).count();
        (done as f64 / self.issues.len() as f64) * 100.0
    }
}
