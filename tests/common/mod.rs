//! Shared black-box fixtures for the integration tests below. These are
//! deliberately separate from `cadre::external::mocks` (which only exists
//! under the lib's own `#[cfg(test)]` and isn't linked into integration test
//! binaries) — the same out-of-scope-collaborator situation a real
//! downstream project wiring this crate would be in.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use cadre::config::{CadreConfig, PhaseDef};
use cadre::error::CadreError;
use cadre::external::{
    AgentContext, AgentLauncher, AgentOutcome, GateCoordinator, NotificationManager, ParsedResult,
    ResultParser, WorktreeInfo, WorktreeManager,
};
use cadre::types::{GateResult, GateStatus, ImplementationTask};

#[derive(Default)]
pub struct FakeWorktreeManager {
    pub prefetch_calls: Mutex<u32>,
    pub provisioned: Mutex<Vec<u64>>,
    pub missing_remote_for: HashSet<u64>,
}

impl WorktreeManager for FakeWorktreeManager {
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

/// Always succeeds, reporting a fixed token count per call. Good enough for
/// tests that only care about scheduling/checkpoint behavior, not agent
/// content.
pub struct FakeAgentLauncher {
    pub tokens_per_call: u64,
    pub fail_phases: HashSet<u32>,
}

impl Default for FakeAgentLauncher {
    fn default() -> Self {
        Self {
            tokens_per_call: 10,
            fail_phases: HashSet::new(),
        }
    }
}

impl AgentLauncher for FakeAgentLauncher {
    async fn launch(&self, ctx: &AgentContext) -> AgentOutcome {
        if self.fail_phases.contains(&ctx.phase) {
            return AgentOutcome::failed(format!("agent failed for phase {}", ctx.phase), self.tokens_per_call);
        }
        AgentOutcome::ok(
            format!("output issue={} phase={}", ctx.issue_number, ctx.phase),
            self.tokens_per_call,
            Some("deadbeef".to_string()),
        )
    }
}

#[derive(Default)]
pub struct FakeNotificationManager {
    pub events: Mutex<Vec<(String, String)>>,
}

impl NotificationManager for FakeNotificationManager {
    async fn notify(&self, event: &str, detail: &str) -> Result<(), CadreError> {
        self.events.lock().unwrap().push((event.to_string(), detail.to_string()));
        Ok(())
    }
}

/// A gate that returns `Fail` the first N times it's asked about a given
/// phase, then `Pass` forever after — used to drive the gate-retry scenario.
#[derive(Default)]
pub struct ScriptedGate {
    pub fail_times: HashMap<u32, u32>,
    calls: Mutex<HashMap<u32, u32>>,
}

impl ScriptedGate {
    pub fn fail_once(phase: u32) -> Self {
        let mut fail_times = HashMap::new();
        fail_times.insert(phase, 1);
        Self {
            fail_times,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn call_count(&self, phase: u32) -> u32 {
        *self.calls.lock().unwrap().get(&phase).unwrap_or(&0)
    }
}

impl GateCoordinator for ScriptedGate {
    async fn evaluate(&self, _issue_number: u64, phase: u32, _diff: &str) -> Result<GateResult, CadreError> {
        let mut calls = self.calls.lock().unwrap();
        let count = calls.entry(phase).or_insert(0);
        *count += 1;
        let already_failed = *count - 1;

        let budget = self.fail_times.get(&phase).copied().unwrap_or(0);
        if already_failed < budget {
            return Ok(GateResult {
                status: Some(GateStatus::Fail),
                warnings: Vec::new(),
                errors: vec!["lint errors present".to_string()],
            });
        }
        Ok(GateResult::pass())
    }
}

pub struct AlwaysPassGate;

impl GateCoordinator for AlwaysPassGate {
    async fn evaluate(&self, _issue_number: u64, _phase: u32, _diff: &str) -> Result<GateResult, CadreError> {
        Ok(GateResult::pass())
    }
}

#[derive(Default)]
pub struct EmptyResultParser;

impl ResultParser for EmptyResultParser {
    fn parse(&self, _raw_output: &str) -> Result<ParsedResult, CadreError> {
        Ok(ParsedResult {
            success: true,
            summary: "no tasks".to_string(),
            tasks: Vec::new(),
            follow_up_notes: Vec::new(),
        })
    }
}

/// Hands back a fixed set of implementation tasks regardless of the agent's
/// raw output, for phase-3-focused tests.
pub struct FixedTaskParser(pub Vec<ImplementationTask>);

impl ResultParser for FixedTaskParser {
    fn parse(&self, _raw_output: &str) -> Result<ParsedResult, CadreError> {
        Ok(ParsedResult {
            success: true,
            summary: "fixed plan".to_string(),
            tasks: self.0.clone(),
            follow_up_notes: Vec::new(),
        })
    }
}

pub fn task(id: &str, files: &[&str], deps: &[&str]) -> ImplementationTask {
    ImplementationTask {
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        files: files.iter().map(|s| s.to_string()).collect(),
        dependencies: deps.iter().map(|s| s.to_string()).collect(),
        complexity: None,
        acceptance_criteria: Vec::new(),
        non_testable: true,
    }
}

pub fn test_config() -> CadreConfig {
    let mut config = CadreConfig::default();
    config.phases = vec![
        PhaseDef::new("scope", true, true),
        PhaseDef::new("plan", true, true),
        PhaseDef::new("implement", true, true),
        PhaseDef::new("review", false, false),
    ];
    config.execution.max_parallel_issues = 2;
    config.execution.max_parallel_agents = 2;
    config.execution.base_delay_ms = 1;
    config.execution.max_delay_ms = 4;
    config
}
