use std::path::PathBuf;

use crate::error::CadreError;
use crate::types::{GateResult, ImplementationTask};

/// Context handed to an agent invocation: which issue/phase/task it's
/// working on and where its working copy lives.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub issue_number: u64,
    pub phase: u32,
    pub task_id: Option<String>,
    pub worktree_path: PathBuf,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub raw_output: String,
    pub tokens_used: u64,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn ok(raw_output: String, tokens_used: u64, commit_sha: Option<String>) -> Self {
        Self {
            success: true,
            raw_output,
            tokens_used,
            commit_sha,
            error: None,
        }
    }

    pub fn failed(error: String, tokens_used: u64) -> Self {
        Self {
            success: false,
            raw_output: String::new(),
            tokens_used,
            commit_sha: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub issue_number: u64,
    pub path: PathBuf,
    pub branch_name: String,
    pub base_commit: String,
}

#[derive(Debug, Clone)]
pub struct ParsedResult {
    pub success: bool,
    pub summary: String,
    pub tasks: Vec<ImplementationTask>,
    pub follow_up_notes: Vec<String>,
}

/// Launches an external agent process against a prepared worktree and
/// returns its raw output. Production implementations shell out to a CLI
/// tool (the concern this crate's spec places out of scope); only test
/// doubles live in this crate.
///
/// Never throws (spec §6): a launch that could not be carried out — the
/// process failed to start, timed out, exited non-zero — is encoded as
/// `AgentOutcome { success: false, error: Some(..), .. }`, not as an `Err`.
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, ctx: &AgentContext) -> impl std::future::Future<Output = AgentOutcome> + Send;
}

/// Manages per-issue isolated working copies (git worktrees or equivalent).
/// Out of scope for this crate's implementation (spec §1/§6) — contract
/// only.
pub trait WorktreeManager: Send + Sync {
    /// Warm any shared state (e.g. a `git fetch` of the remote) once per
    /// fleet run, strictly before the first `provision` call (spec §4.8
    /// point 2).
    fn prefetch(&self) -> impl std::future::Future<Output = Result<(), CadreError>> + Send;

    /// Provision (or, if `resume` is true, re-attach to) the working copy
    /// for one issue. Implementations raise `CadreError::RemoteBranchMissing`
    /// when `resume` is true and the expected remote branch no longer
    /// exists — the fleet orchestrator treats that as a per-issue skip, not
    /// a fleet failure.
    fn provision(
        &self,
        issue_number: u64,
        title: &str,
        resume: bool,
    ) -> impl std::future::Future<Output = Result<WorktreeInfo, CadreError>> + Send;

    fn remove(
        &self,
        issue_number: u64,
    ) -> impl std::future::Future<Output = Result<(), CadreError>> + Send;

    fn list(&self) -> impl std::future::Future<Output = Vec<WorktreeInfo>> + Send;
}

/// Talks to the code-hosting platform (branch existence, PR creation).
pub trait PlatformProvider: Send + Sync {
    fn branch_exists(
        &self,
        branch_name: &str,
    ) -> impl std::future::Future<Output = Result<bool, CadreError>> + Send;

    fn create_pr(
        &self,
        issue_number: u64,
        branch_name: &str,
        title: &str,
        body: &str,
    ) -> impl std::future::Future<Output = Result<String, CadreError>> + Send;
}

/// Parses an agent's raw output into a structured result. Agent-output
/// parsing is an explicit non-goal of this crate (spec §1) — the trait
/// contract exists so `phase3.rs` can call through it without depending on
/// any particular agent's output format.
pub trait ResultParser: Send + Sync {
    fn parse(&self, raw_output: &str) -> Result<ParsedResult, CadreError>;
}

/// Evaluates a post-phase quality gate (tests, lint, build) and returns its
/// verdict. Gate execution itself (what commands run) is out of scope; only
/// the result shape is defined here. `diff` carries the (already-truncated)
/// change under review so a code-reviewer agent has something to look at;
/// callers with nothing to review yet (e.g. a pre-diff build check) pass `""`.
pub trait GateCoordinator: Send + Sync {
    fn evaluate(
        &self,
        issue_number: u64,
        phase: u32,
        diff: &str,
    ) -> impl std::future::Future<Output = Result<GateResult, CadreError>> + Send;
}

/// Dispatches fleet lifecycle events (started, issue completed, interrupted)
/// to an external notification sink (Slack, email, etc.).
pub trait NotificationManager: Send + Sync {
    fn notify(
        &self,
        event: &str,
        detail: &str,
    ) -> impl std::future::Future<Output = Result<(), CadreError>> + Send;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockAgentLauncher {
        pub tokens_per_call: u64,
    }

    impl AgentLauncher for MockAgentLauncher {
        async fn launch(&self, ctx: &AgentContext) -> AgentOutcome {
            AgentOutcome::ok(
                format!("agent output for issue {} phase {}", ctx.issue_number, ctx.phase),
                self.tokens_per_call,
                Some("deadbeef".to_string()),
            )
        }
    }

    #[derive(Default)]
    pub struct MockNotificationManager {
        pub events: Mutex<Vec<(String, String)>>,
    }

    impl NotificationManager for MockNotificationManager {
        async fn notify(&self, event: &str, detail: &str) -> Result<(), CadreError> {
            self.events
                .lock()
                .unwrap()
                .push((event.to_string(), detail.to_string()));
            Ok(())
        }
    }

    pub struct AlwaysPassGate;

    impl GateCoordinator for AlwaysPassGate {
        async fn evaluate(&self, _issue_number: u64, _phase: u32, _diff: &str) -> Result<GateResult, CadreError> {
            Ok(GateResult::pass())
        }
    }

    #[derive(Default)]
    pub struct MockWorktreeManager {
        pub prefetch_calls: Mutex<u32>,
        pub provisioned: Mutex<Vec<u64>>,
        pub missing_remote_for: std::collections::HashSet<u64>,
    }

    impl WorktreeManager for MockWorktreeManager {
        async fn prefetch(&self) -> Result<(), CadreError> {
            *self.prefetch_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn provision(&self, issue_number: u64, _title: &str, resume: bool) -> Result<WorktreeInfo, CadreError> {
            if resume && self.missing_remote_for.contains(&issue_number) {
                return Err(CadreError::RemoteBranchMissing {
                    issue_number,
                    branch: format!("cadre/issue-{}", issue_number),
                });
            }
            self.provisioned.lock().unwrap().push(issue_number);
            Ok(WorktreeInfo {
                issue_number,
                path: PathBuf::from(format!("/tmp/cadre-issue-{}", issue_number)),
                branch_name: format!("cadre/issue-{}", issue_number),
                base_commit: "deadbeef".to_string(),
            })
        }

        async fn remove(&self, _issue_number: u64) -> Result<(), CadreError> {
            Ok(())
        }

        async fn list(&self) -> Vec<WorktreeInfo> {
            Vec::new()
        }
    }
}
