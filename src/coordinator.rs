use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use crate::checkpoint;
use crate::log_error;
use crate::types::{FleetCheckpoint, IssueStatus};

// --- Command enum ---
//
// The fleet checkpoint is the one piece of shared mutable state every
// concurrently-running issue pipeline touches (spec §5: "the fleet
// checkpoint has a single logical writer"). Each pipeline holds a
// `CoordinatorHandle` and sends commands rather than mutating the checkpoint
// directly, so writes are serialized through this actor's single receive
// loop regardless of how many pipelines run in parallel.

pub enum CoordinatorCommand {
    GetSnapshot {
        reply: oneshot::Sender<FleetCheckpoint>,
    },
    SetIssueStatus {
        issue_number: u64,
        issue_title: String,
        status: IssueStatus,
        reply: oneshot::Sender<Result<(), String>>,
    },
    RecordTokenUsage {
        issue_number: u64,
        tokens: u64,
        reply: oneshot::Sender<Result<(), String>>,
    },
    SetWorktreeInfo {
        issue_number: u64,
        worktree_path: PathBuf,
        branch_name: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    SetLastPhase {
        issue_number: u64,
        phase: u32,
        reply: oneshot::Sender<Result<(), String>>,
    },
    SetError {
        issue_number: u64,
        error: Option<String>,
        reply: oneshot::Sender<Result<(), String>>,
    },
    IsIssueCompleted {
        issue_number: u64,
        reply: oneshot::Sender<bool>,
    },
    PruneIssue {
        issue_number: u64,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

// --- CoordinatorHandle ---

#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    async fn send_command<T>(
        &self,
        command: CoordinatorCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, String> {
        self.sender
            .send(command)
            .await
            .map_err(|_| "coordinator shut down".to_string())?;
        rx.await
            .map_err(|_| "coordinator dropped reply".to_string())
    }

    pub async fn get_snapshot(&self) -> Result<FleetCheckpoint, String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::GetSnapshot { reply }, rx).await
    }

    pub async fn set_issue_status(
        &self,
        issue_number: u64,
        issue_title: &str,
        status: IssueStatus,
    ) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::SetIssueStatus {
                issue_number,
                issue_title: issue_title.to_string(),
                status,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn record_token_usage(&self, issue_number: u64, tokens: u64) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::RecordTokenUsage {
                issue_number,
                tokens,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn set_worktree_info(
        &self,
        issue_number: u64,
        worktree_path: PathBuf,
        branch_name: &str,
    ) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::SetWorktreeInfo {
                issue_number,
                worktree_path,
                branch_name: branch_name.to_string(),
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn set_last_phase(&self, issue_number: u64, phase: u32) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::SetLastPhase {
                issue_number,
                phase,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn set_error(&self, issue_number: u64, error: Option<String>) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::SetError {
                issue_number,
                error,
                reply,
            },
            rx,
        )
        .await?
    }

    pub async fn is_issue_completed(&self, issue_number: u64) -> Result<bool, String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::IsIssueCompleted { issue_number, reply }, rx)
            .await
    }

    pub async fn prune_issue(&self, issue_number: u64) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.send_command(CoordinatorCommand::PruneIssue { issue_number, reply }, rx)
            .await?
    }
}

// --- Actor implementation ---

const CHANNEL_CAPACITY: usize = 64;

struct CoordinatorState {
    fleet: FleetCheckpoint,
    state_dir: PathBuf,
}

impl CoordinatorState {
    fn save(&self) -> Result<(), String> {
        checkpoint::save_fleet_checkpoint(&self.state_dir, &self.fleet)
    }
}

async fn run_coordinator(
    mut rx: mpsc::Receiver<CoordinatorCommand>,
    fleet: FleetCheckpoint,
    state_dir: PathBuf,
) {
    let mut state = CoordinatorState { fleet, state_dir };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            CoordinatorCommand::GetSnapshot { reply } => {
                let _ = reply.send(state.fleet.clone());
            }
            CoordinatorCommand::SetIssueStatus {
                issue_number,
                issue_title,
                status,
                reply,
            } => {
                checkpoint::set_issue_status(&mut state.fleet, issue_number, &issue_title, status);
                let result = state.save();
                let _ = reply.send(result);
            }
            CoordinatorCommand::RecordTokenUsage {
                issue_number,
                tokens,
                reply,
            } => {
                checkpoint::record_fleet_token_usage(&mut state.fleet, issue_number, tokens);
                let result = state.save();
                let _ = reply.send(result);
            }
            CoordinatorCommand::SetWorktreeInfo {
                issue_number,
                worktree_path,
                branch_name,
                reply,
            } => {
                let result = match state.fleet.issues.get_mut(&issue_number) {
                    Some(summary) => {
                        summary.worktree_path = Some(worktree_path);
                        summary.branch_name = Some(branch_name);
                        summary.updated_at = chrono::Utc::now();
                        state.save()
                    }
                    None => Err(format!("issue {} not tracked in fleet checkpoint", issue_number)),
                };
                let _ = reply.send(result);
            }
            CoordinatorCommand::SetLastPhase {
                issue_number,
                phase,
                reply,
            } => {
                let result = match state.fleet.issues.get_mut(&issue_number) {
                    Some(summary) => {
                        summary.last_phase = Some(phase);
                        summary.updated_at = chrono::Utc::now();
                        state.save()
                    }
                    None => Err(format!("issue {} not tracked in fleet checkpoint", issue_number)),
                };
                let _ = reply.send(result);
            }
            CoordinatorCommand::SetError {
                issue_number,
                error,
                reply,
            } => {
                let result = match state.fleet.issues.get_mut(&issue_number) {
                    Some(summary) => {
                        summary.error = error;
                        summary.updated_at = chrono::Utc::now();
                        state.save()
                    }
                    None => Err(format!("issue {} not tracked in fleet checkpoint", issue_number)),
                };
                let _ = reply.send(result);
            }
            CoordinatorCommand::IsIssueCompleted { issue_number, reply } => {
                let _ = reply.send(state.fleet.is_issue_completed(issue_number));
            }
            CoordinatorCommand::PruneIssue { issue_number, reply } => {
                checkpoint::prune_issue(&mut state.fleet, issue_number);
                let result = state.save();
                let _ = reply.send(result);
            }
        }
    }

    if let Err(e) = state.save() {
        log_error!("failed to save fleet checkpoint on coordinator shutdown: {}", e);
    }
}

// --- Spawn ---

pub fn spawn_coordinator(
    fleet: FleetCheckpoint,
    state_dir: PathBuf,
) -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let task_handle = tokio::spawn(run_coordinator(rx, fleet, state_dir));

    (CoordinatorHandle { sender: tx }, task_handle)
}
