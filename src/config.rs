use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CadreConfig {
    pub project: ProjectConfig,
    pub budget: BudgetConfig,
    pub execution: ExecutionConfig,
    pub phases: Vec<PhaseDef>,
    pub dependency_waves: DependencyWavesConfig,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub state_dir: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "cadre".to_string(),
            state_dir: ".cadre".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub fleet_token_cap: Option<u64>,
    pub per_issue_token_cap: Option<u64>,
    pub warn_threshold_pct: u8,
    pub halt_threshold_pct: u8,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            fleet_token_cap: None,
            per_issue_token_cap: None,
            warn_threshold_pct: 80,
            halt_threshold_pct: 100,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_parallel_issues: u32,
    pub max_parallel_agents: u32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub agent_timeout_secs: u64,
    pub drain_window_secs: u64,
    pub max_retries_per_task: u32,
    pub build_check_max_retries: u32,
    pub max_whole_pr_review_retries: u32,
    pub diff_truncate_bytes: usize,
    pub whole_pr_review: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_issues: 1,
            max_parallel_agents: 1,
            max_retries: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            agent_timeout_secs: 1_800,
            drain_window_secs: 30,
            max_retries_per_task: 2,
            build_check_max_retries: 2,
            max_whole_pr_review_retries: 1,
            diff_truncate_bytes: 200_000,
            whole_pr_review: true,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseDef {
    pub name: String,
    #[serde(default)]
    pub critical: bool,
    #[serde(default = "default_gated")]
    pub gated: bool,
}

fn default_gated() -> bool {
    true
}

impl PhaseDef {
    pub fn new(name: &str, critical: bool, gated: bool) -> Self {
        Self {
            name: name.to_string(),
            critical,
            gated,
        }
    }
}

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DependencyWavesConfig {
    pub enabled: bool,
}

/// The built-in four-phase pipeline (scope, plan, implement, review) used
/// when a project supplies no `[[phases]]` table of its own.
pub fn default_phases() -> Vec<PhaseDef> {
    vec![
        PhaseDef::new("scope", true, true),
        PhaseDef::new("plan", true, true),
        PhaseDef::new("implement", true, true),
        PhaseDef::new("review", false, false),
    ]
}

pub fn validate(config: &CadreConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.max_parallel_issues < 1 {
        errors.push("execution.max_parallel_issues must be >= 1".to_string());
    }

    if config.execution.max_parallel_agents < 1 {
        errors.push("execution.max_parallel_agents must be >= 1".to_string());
    }

    if config.execution.base_delay_ms > config.execution.max_delay_ms {
        errors.push(
            "execution.base_delay_ms must not exceed execution.max_delay_ms".to_string(),
        );
    }

    if config.budget.warn_threshold_pct > config.budget.halt_threshold_pct {
        errors.push(
            "budget.warn_threshold_pct must not exceed budget.halt_threshold_pct".to_string(),
        );
    }

    if config.budget.halt_threshold_pct == 0 {
        errors.push("budget.halt_threshold_pct must be > 0".to_string());
    }

    if config.phases.is_empty() {
        errors.push("phases: must have at least one phase".to_string());
    }

    let mut seen_names = HashSet::new();
    for phase in &config.phases {
        if !seen_names.insert(&phase.name) {
            errors.push(format!("phases: duplicate phase name '{}'", phase.name));
        }
    }

    if let Some(last) = config.phases.last() {
        if last.gated {
            errors.push(format!(
                "phases: terminal phase '{}' must have gated=false",
                last.name
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{project_root}/cadre.toml`.
///
/// When `config_path` is `Some`, the file MUST exist — returns an error if
/// missing. When `config_path` is `None`, delegates to `load_config`
/// (returns defaults if missing).
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<CadreConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(project_root),
    }
}

/// Load config from a specific file path. Errors if the file does not exist.
fn load_config_at(path: &Path) -> Result<CadreConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let mut config: CadreConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    populate_default_phases(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

pub fn load_config(project_root: &Path) -> Result<CadreConfig, String> {
    let config_path = project_root.join("cadre.toml");

    if !config_path.exists() {
        let mut config = CadreConfig::default();
        populate_default_phases(&mut config);
        return Ok(config);
    }

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path.display(), e))?;

    let mut config: CadreConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", config_path.display(), e))?;

    populate_default_phases(&mut config);

    validate(&config).map_err(|errors| {
        format!(
            "Config validation failed:\n{}",
            errors
                .iter()
                .map(|e| format!("  - {}", e))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })?;

    Ok(config)
}

fn populate_default_phases(config: &mut CadreConfig) {
    if config.phases.is_empty() {
        config.phases = default_phases();
    }
}
