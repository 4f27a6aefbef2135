use thiserror::Error;

/// Unified error taxonomy for CADRE's orchestration core (spec §7).
///
/// `is_retryable` and `is_fatal` drive the retry executor and the issue
/// pipeline's failure branching respectively; a variant can be neither (e.g.
/// `BudgetExceeded`, which is handled as its own branch, not retried and not
/// treated as an ordinary fatal failure).
#[derive(Error, Debug)]
pub enum CadreError {
    #[error("token budget exceeded for issue {issue_number}: {spent}/{cap} tokens")]
    BudgetExceeded {
        issue_number: u64,
        spent: u64,
        cap: u64,
    },

    #[error("remote branch missing for issue {issue_number}: {branch}")]
    RemoteBranchMissing { issue_number: u64, branch: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("phase {phase} failed (fatal): {message}")]
    FatalPhase { phase: u32, message: String },

    #[error("phase {phase} failed (non-fatal): {message}")]
    NonFatalPhase { phase: u32, message: String },

    #[error("dependency wave failed: issue {issue_number} depends on failed issue {dependency}")]
    DependencyWaveFailure { issue_number: u64, dependency: u64 },

    #[error("gate failed for phase {phase}: {errors:?}")]
    GateFailure { phase: u32, errors: Vec<String> },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("{0}")]
    Unknown(String),
}

impl CadreError {
    /// Whether the retry executor (`retry.rs`) should attempt another
    /// pass after this error. Budget exhaustion and shutdown are never
    /// retried; validation and dependency-wave failures are structural and
    /// won't resolve themselves on a second attempt either.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CadreError::NonFatalPhase { .. } | CadreError::GateFailure { .. } | CadreError::Io(_)
        )
    }

    /// Whether the issue pipeline should treat this as a critical failure
    /// that halts the issue outright, as opposed to leaving it in
    /// `code-complete` for a later pass.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CadreError::FatalPhase { .. }
                | CadreError::DependencyWaveFailure { .. }
                | CadreError::Validation(_)
                | CadreError::RemoteBranchMissing { .. }
                | CadreError::ShutdownRequested
        )
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, CadreError::BudgetExceeded { .. })
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, CadreError::ShutdownRequested)
    }
}
