use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use cadre::checkpoint;
use cadre::config::{self, CadreConfig};
use cadre::error::CadreError;
use cadre::external::{
    AgentContext, AgentLauncher, AgentOutcome, GateCoordinator, NotificationManager, ParsedResult,
    ResultParser, WorktreeInfo, WorktreeManager,
};
use cadre::fleet::{run_fleet, IssueSpec};
use cadre::log::parse_log_level;
use cadre::shutdown;
use cadre::types::{GateResult, IssueStatus};
use cadre::{log_info, log_warn};

#[derive(Parser)]
#[command(name = "cadre", about = "Fleet orchestration engine for automated multi-phase software-change workflows")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/cadre.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a cadre.toml and state directory
    Init,
    /// Run the fleet pipeline over a set of issues
    Run {
        /// Target specific issue numbers (repeatable)
        #[arg(long = "target", action = clap::ArgAction::Append)]
        targets: Vec<u64>,
        /// Filter issues by platform-provider attribute (requires a
        /// configured PlatformProvider, which is out of this crate's scope)
        #[arg(long, conflicts_with = "targets")]
        only: Option<String>,
        /// Maximum number of issues to process this run
        #[arg(long, default_value = "100")]
        cap: usize,
    },
    /// Show fleet checkpoint status
    Status,
    /// Reset a per-issue checkpoint from a given phase onward
    Reset {
        /// Issue number to reset
        issue: u64,
        /// Phase number (and every phase after it) to discard
        #[arg(long)]
        from_phase: u32,
    },
    /// List active worktrees (requires a configured WorktreeManager)
    Worktrees,
    /// Print the configured agent launcher setup
    Agents,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => cadre::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = shutdown::install_signal_handlers() {
        log_warn!("failed to install signal handlers: {}", e);
    }

    let root = &cli.root;
    let config_base = cli
        .config
        .as_ref()
        .and_then(|p| p.parent())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| root.to_path_buf());

    let result = match cli.command {
        Commands::Init => handle_init(root),
        Commands::Run { targets, only, cap } => handle_run(root, cli.config.as_deref(), &config_base, targets, only, cap).await,
        Commands::Status => handle_status(root, cli.config.as_deref(), &config_base),
        Commands::Reset { issue, from_phase } => handle_reset(root, cli.config.as_deref(), &config_base, issue, from_phase),
        Commands::Worktrees => handle_worktrees(),
        Commands::Agents => handle_agents(root, cli.config.as_deref(), &config_base),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn state_dir(config_base: &Path, config: &CadreConfig) -> PathBuf {
    config_base.join(&config.project.state_dir)
}

fn handle_init(root: &Path) -> Result<(), String> {
    let config_path = root.join("cadre.toml");
    if !config_path.exists() {
        let contents = r#"[project]
name = "cadre"
state_dir = ".cadre"

[budget]
# fleet_token_cap = 2000000
# per_issue_token_cap = 200000
warn_threshold_pct = 80
halt_threshold_pct = 100

[execution]
max_parallel_issues = 2
max_parallel_agents = 2
max_retries = 2
base_delay_ms = 1000
max_delay_ms = 30000
agent_timeout_secs = 1800
drain_window_secs = 30
max_retries_per_task = 2
build_check_max_retries = 2
max_whole_pr_review_retries = 1
diff_truncate_bytes = 200000
whole_pr_review = true

[[phases]]
name = "scope"
critical = true
gated = true

[[phases]]
name = "plan"
critical = true
gated = true

[[phases]]
name = "implement"
critical = true
gated = true

[[phases]]
name = "review"
critical = false
gated = false

[dependency_waves]
enabled = false
"#;
        std::fs::write(&config_path, contents).map_err(|e| format!("failed to write {}: {}", config_path.display(), e))?;
    }

    let config = config::load_config(root)?;
    let dir = state_dir(root, &config);
    std::fs::create_dir_all(checkpoint::reports_dir(&dir)).map_err(|e| format!("failed to create {}: {}", dir.display(), e))?;
    std::fs::create_dir_all(dir.join("issues")).map_err(|e| format!("failed to create {}: {}", dir.join("issues").display(), e))?;

    let gitignore_path = root.join(".gitignore");
    let entry = format!("{}/", config.project.state_dir);
    let existing = if gitignore_path.exists() {
        std::fs::read_to_string(&gitignore_path).map_err(|e| format!("failed to read .gitignore: {}", e))?
    } else {
        String::new()
    };
    if !existing.lines().any(|line| line.trim() == entry) {
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&entry);
        contents.push('\n');
        std::fs::write(&gitignore_path, contents).map_err(|e| format!("failed to write .gitignore: {}", e))?;
    }

    println!("Initialized cadre in {}", root.display());
    println!("  Created: cadre.toml, {}/", config.project.state_dir);
    println!("  Updated: .gitignore");
    Ok(())
}

async fn handle_run(
    root: &Path,
    config_path: Option<&Path>,
    config_base: &Path,
    targets: Vec<u64>,
    only: Option<String>,
    cap: usize,
) -> Result<(), String> {
    let config = config::load_config_from(config_path, config_base)?;
    let dir = state_dir(root, &config);

    let issues: Vec<IssueSpec> = if !targets.is_empty() {
        targets
            .into_iter()
            .map(|n| IssueSpec {
                issue_number: n,
                title: format!("issue-{}", n),
                dependencies: Vec::new(),
            })
            .collect()
    } else if only.is_some() {
        return Err(
            "--only requires a configured PlatformProvider to resolve issues by attribute, which is out of this crate's scope; pass --target instead"
                .to_string(),
        );
    } else {
        return Err("no issues specified; pass --target <issue-number> one or more times".to_string());
    };
    let issues: Vec<IssueSpec> = issues.into_iter().take(cap).collect();

    let cancel = CancellationToken::new();
    let notifier = Arc::new(LoggingNotificationManager);

    let fleet_fut = run_fleet(
        issues,
        Arc::new(UnwiredWorktreeManager),
        Arc::new(UnwiredAgentLauncher),
        Arc::new(AlwaysPassGate),
        Arc::new(EmptyResultParser),
        Arc::clone(&notifier),
        &config,
        dir,
        cancel.clone(),
    );
    tokio::pin!(fleet_fut);

    let signal = tokio::select! {
        result = &mut fleet_fut => {
            print_summary(&result);
            std::process::exit(if result.success { 0 } else { 1 });
        }
        signal = shutdown::watch_for_shutdown(cancel.clone()) => signal,
    };

    shutdown::notify_interrupted(notifier.as_ref(), signal, &shutdown::in_progress_issues()).await;
    let drain_window = Duration::from_secs(config.execution.drain_window_secs);
    match shutdown::drain_or_timeout(drain_window, fleet_fut).await {
        Some(result) => print_summary(&result),
        None => log_warn!("drain window elapsed before in-flight issues settled"),
    }
    std::process::exit(signal.exit_code());
}

fn print_summary(result: &cadre::types::FleetResult) {
    let completed = result.issues.iter().filter(|i| i.final_status == IssueStatus::Completed).count();
    let failed = result.failed_issues.len();
    let code_complete = result.code_done_no_pr.len();
    println!(
        "{}/{} completed, {} failed, {} code-complete (no PR), {} tokens used",
        completed,
        result.issues.len(),
        failed,
        code_complete,
        result.token_usage
    );
    for pr in &result.prs_created {
        println!("  PR: {}", pr);
    }
    for issue in &result.issues {
        if let Some(err) = &issue.error {
            println!("  issue {}: {}", issue.issue_number, err);
        }
    }
}

fn handle_status(root: &Path, config_path: Option<&Path>, config_base: &Path) -> Result<(), String> {
    let config = config::load_config_from(config_path, config_base)?;
    let dir = state_dir(root, &config);
    let fleet = checkpoint::load_fleet_checkpoint(&dir, &config.project.name);

    println!("Project: {}", fleet.project_name);
    println!("Started: {}", fleet.started_at);
    println!("Resume count: {}", fleet.resume_count);
    println!(
        "Token usage: {} total across {} issue(s)",
        fleet.token_usage.total,
        fleet.token_usage.by_issue.len()
    );
    println!("Issues:");
    let mut numbers: Vec<&u64> = fleet.issues.keys().collect();
    numbers.sort();
    for number in numbers {
        let summary = &fleet.issues[number];
        println!("  #{} [{:?}] {}", number, summary.status, summary.issue_title);
        if let Some(err) = &summary.error {
            println!("      error: {}", err);
        }
    }
    Ok(())
}

fn handle_reset(root: &Path, config_path: Option<&Path>, config_base: &Path, issue: u64, from_phase: u32) -> Result<(), String> {
    let config = config::load_config_from(config_path, config_base)?;
    let dir = state_dir(root, &config);

    let phase_ids: Vec<u32> = (from_phase..=config.phases.len() as u32).collect();
    let mut issue_checkpoint = checkpoint::load_issue_checkpoint(&dir, issue);
    checkpoint::reset_phases(&mut issue_checkpoint, &phase_ids);
    checkpoint::save_issue_checkpoint(&dir, &issue_checkpoint)?;

    println!("Reset issue {} from phase {} onward", issue, from_phase);
    Ok(())
}

fn handle_worktrees() -> Result<(), String> {
    println!("No WorktreeManager collaborator is wired into this build.");
    println!("Working-copy provisioning is an external collaborator out of this crate's scope (spec §1/§6).");
    Ok(())
}

fn handle_agents(_root: &Path, config_path: Option<&Path>, config_base: &Path) -> Result<(), String> {
    let config = config::load_config_from(config_path, config_base)?;
    println!("Configured phases (in order):");
    for phase in &config.phases {
        println!(
            "  {} (critical={}, gated={})",
            phase.name, phase.critical, phase.gated
        );
    }
    println!(
        "max_parallel_agents = {}, agent_timeout_secs = {}",
        config.execution.max_parallel_agents, config.execution.agent_timeout_secs
    );
    println!("No AgentLauncher collaborator is wired into this build (the agent runtime is out of this crate's scope per spec §1/§6).");
    Ok(())
}

/// Logs every dispatched event via the ambient logger rather than a real
/// external sink (Slack, email, ...) — a reasonable default `Notification-
/// Manager` for a binary with no notification provider configured.
struct LoggingNotificationManager;

impl NotificationManager for LoggingNotificationManager {
    async fn notify(&self, event: &str, detail: &str) -> Result<(), CadreError> {
        log_info!("[{}] {}", event, detail);
        Ok(())
    }
}

/// Default gate: passes every phase. A project wiring a real `Gate-
/// Coordinator` (lint, tests, build checks) replaces this.
struct AlwaysPassGate;

impl GateCoordinator for AlwaysPassGate {
    async fn evaluate(&self, _issue_number: u64, _phase: u32, _diff: &str) -> Result<GateResult, CadreError> {
        Ok(GateResult::pass())
    }
}

/// Default parser: agent-output parsing is an explicit non-goal of this
/// crate (spec §1) — without a real `ResultParser` wired in, phase 3 sees
/// no implementation tasks and completes trivially.
struct EmptyResultParser;

impl ResultParser for EmptyResultParser {
    fn parse(&self, _raw_output: &str) -> Result<ParsedResult, CadreError> {
        Ok(ParsedResult {
            success: true,
            summary: String::new(),
            tasks: Vec::new(),
            follow_up_notes: Vec::new(),
        })
    }
}

/// Working-copy provisioning is out of this crate's scope (spec §1/§6);
/// this default fails every issue immediately with a clear message rather
/// than silently pretending to provision a working copy.
struct UnwiredWorktreeManager;

impl WorktreeManager for UnwiredWorktreeManager {
    async fn prefetch(&self) -> Result<(), CadreError> {
        Ok(())
    }

    async fn provision(&self, _issue_number: u64, _title: &str, _resume: bool) -> Result<WorktreeInfo, CadreError> {
        Err(CadreError::Validation(
            "no WorktreeManager wired; working-copy provisioning is an external collaborator out of this crate's scope".to_string(),
        ))
    }

    async fn remove(&self, _issue_number: u64) -> Result<(), CadreError> {
        Ok(())
    }

    async fn list(&self) -> Vec<WorktreeInfo> {
        Vec::new()
    }
}

/// The agent runtime is out of this crate's scope (spec §1/§6); this
/// default never actually runs since `UnwiredWorktreeManager` fails every
/// issue before any agent would be invoked, but is provided so the fleet's
/// generic bounds are satisfiable without a real agent process launcher.
struct UnwiredAgentLauncher;

impl AgentLauncher for UnwiredAgentLauncher {
    async fn launch(&self, _ctx: &AgentContext) -> AgentOutcome {
        AgentOutcome::failed(
            "no AgentLauncher wired; the agent runtime is an external collaborator out of this crate's scope".to_string(),
            0,
        )
    }
}
