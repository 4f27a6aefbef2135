//! Run report persistence (spec §4.8 point 7).
//!
//! After a fleet run completes, the orchestrator builds a summary of what
//! happened and writes it to `{state_dir}/reports/run-report-<timestamp>.json`.
//! Each report is a new, uniquely-named file — unlike the fleet checkpoint,
//! there is nothing to overwrite and so no backup-copy step. Writing still
//! goes through a temp-file-then-rename so a reader never observes a
//! half-written report. Failures here are logged and swallowed: a report
//! that didn't make it to disk is not a reason to fail a fleet run that
//! otherwise succeeded.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::log_warn;
use crate::types::FleetResult;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: FleetResult,
}

impl RunReport {
    pub fn new(result: FleetResult, generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at,
            result,
        }
    }
}

fn report_file_name(generated_at: DateTime<Utc>) -> String {
    format!(
        "run-report-{}.json",
        generated_at.format("%Y%m%dT%H%M%S%.3fZ")
    )
}

pub fn report_path(state_dir: &Path, generated_at: DateTime<Utc>) -> PathBuf {
    crate::checkpoint::reports_dir(state_dir).join(report_file_name(generated_at))
}

/// Build and write a run report. Best-effort: on any failure this logs a
/// warning and returns `None` rather than propagating an error, matching
/// the spec's "failures here log a warning but do not fail the fleet".
pub fn write_report(state_dir: &Path, result: &FleetResult, generated_at: DateTime<Utc>) -> Option<PathBuf> {
    let report = RunReport::new(result.clone(), generated_at);
    match try_write_report(state_dir, &report) {
        Ok(path) => Some(path),
        Err(err) => {
            log_warn!("failed to write run report: {}", err);
            None
        }
    }
}

fn try_write_report(state_dir: &Path, report: &RunReport) -> Result<PathBuf, String> {
    let dir = crate::checkpoint::reports_dir(state_dir);
    std::fs::create_dir_all(&dir).map_err(|e| format!("create {}: {}", dir.display(), e))?;

    let path = report_path(state_dir, report.generated_at);
    let json = serde_json::to_vec_pretty(report).map_err(|e| format!("serialize report: {}", e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| format!("create temp file in {}: {}", dir.display(), e))?;
    std::io::Write::write_all(&mut tmp, &json).map_err(|e| format!("write temp file: {}", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| format!("sync temp file: {}", e))?;
    tmp.persist(&path)
        .map_err(|e| format!("persist {}: {}", path.display(), e))?;

    Ok(path)
}
