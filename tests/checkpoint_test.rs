//! Black-box tests for `cadre::checkpoint`'s persisted-state layout,
//! atomic writes, corruption fallback, and the `reset` subcommand's
//! `reset_phases` behavior (spec §6, §10.4).

use std::fs;

use cadre::checkpoint::{
    fleet_checkpoint_backup_path, fleet_checkpoint_path, issue_checkpoint_backup_path,
    issue_checkpoint_path, issue_progress_log_path, load_fleet_checkpoint, load_issue_checkpoint,
    reset_phases, save_fleet_checkpoint, save_issue_checkpoint,
};
use cadre::types::{FleetCheckpoint, GateResult, IssueCheckpoint};

#[test]
fn save_then_load_round_trips_an_issue_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = IssueCheckpoint::new(42);
    checkpoint.completed_phases.insert(1);
    checkpoint.completed_phases.insert(2);
    checkpoint.current_phase = 3;
    save_issue_checkpoint(dir.path(), &checkpoint).unwrap();

    assert!(issue_checkpoint_path(dir.path(), 42).exists());
    let reloaded = load_issue_checkpoint(dir.path(), 42);
    assert_eq!(reloaded.completed_phases, checkpoint.completed_phases);
    assert_eq!(reloaded.current_phase, 3);
    // Loading increments resume_count since this is treated as a resume.
    assert_eq!(reloaded.resume_count, checkpoint.resume_count + 1);
}

#[test]
fn consecutive_loads_each_persist_a_bumped_resume_count() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = IssueCheckpoint::new(13);
    save_issue_checkpoint(dir.path(), &checkpoint).unwrap();

    // Two no-mutation loads in a row must each persist the bump, so a
    // third, independent load observes both prior increments (spec §8
    // resume-idempotence property).
    let first = load_issue_checkpoint(dir.path(), 13);
    assert_eq!(first.resume_count, 1);
    let second = load_issue_checkpoint(dir.path(), 13);
    assert_eq!(second.resume_count, 2);
}

#[test]
fn loading_a_nonexistent_checkpoint_starts_fresh_without_erroring() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = load_issue_checkpoint(dir.path(), 7);
    assert_eq!(checkpoint.issue_number, 7);
    assert_eq!(checkpoint.resume_count, 0);
    assert!(checkpoint.completed_phases.is_empty());
}

#[test]
fn a_second_save_backs_up_the_first_before_overwriting() {
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = IssueCheckpoint::new(1);
    save_issue_checkpoint(dir.path(), &checkpoint).unwrap();
    checkpoint.current_phase = 2;
    save_issue_checkpoint(dir.path(), &checkpoint).unwrap();

    let backup_path = issue_checkpoint_backup_path(dir.path(), 1);
    assert!(backup_path.exists());
    let backup: IssueCheckpoint = serde_json::from_str(&fs::read_to_string(&backup_path).unwrap()).unwrap();
    assert_eq!(backup.current_phase, 0, "backup holds the state before the second save");
}

#[test]
fn corrupt_primary_checkpoint_falls_back_to_the_backup() {
    let dir = tempfile::tempdir().unwrap();
    let mut checkpoint = IssueCheckpoint::new(5);
    checkpoint.current_phase = 1;
    save_issue_checkpoint(dir.path(), &checkpoint).unwrap();
    checkpoint.current_phase = 2;
    save_issue_checkpoint(dir.path(), &checkpoint).unwrap();

    // Corrupt only the primary file; the backup (phase 1) should still load.
    fs::write(issue_checkpoint_path(dir.path(), 5), b"not json").unwrap();

    let reloaded = load_issue_checkpoint(dir.path(), 5);
    assert_eq!(reloaded.current_phase, 1);
}

#[test]
fn corrupt_primary_and_backup_starts_fresh_rather_than_erroring() {
    let dir = tempfile::tempdir().unwrap();
    let issue_dir = dir.path().join("issues").join("3");
    fs::create_dir_all(&issue_dir).unwrap();
    fs::write(issue_checkpoint_path(dir.path(), 3), b"garbage").unwrap();
    fs::write(issue_checkpoint_backup_path(dir.path(), 3), b"also garbage").unwrap();

    let reloaded = load_issue_checkpoint(dir.path(), 3);
    assert_eq!(reloaded.issue_number, 3);
    assert_eq!(reloaded.resume_count, 0);
}

#[test]
fn reset_phases_clears_the_target_phase_onward_but_keeps_earlier_phases() {
    let mut checkpoint = IssueCheckpoint::new(1);
    checkpoint.completed_phases.insert(1);
    checkpoint.completed_phases.insert(2);
    checkpoint.completed_phases.insert(3);
    checkpoint.gate_results.insert(2, GateResult::pass());
    checkpoint.gate_results.insert(3, GateResult::pass());
    checkpoint.current_phase = 3;
    checkpoint.completed_tasks.insert("t1".to_string());
    checkpoint.blocked_tasks.insert("t2".to_string());
    checkpoint.current_task = Some("t1".to_string());

    reset_phases(&mut checkpoint, &[2, 3]);

    assert!(checkpoint.completed_phases.contains(&1));
    assert!(!checkpoint.completed_phases.contains(&2));
    assert!(!checkpoint.completed_phases.contains(&3));
    assert!(!checkpoint.gate_results.contains_key(&2));
    assert_eq!(checkpoint.current_phase, 1);
    // resetPhases clears all task progress, not just the phase sets (§4.1).
    assert!(checkpoint.completed_tasks.is_empty());
    assert!(checkpoint.blocked_tasks.is_empty());
    assert!(checkpoint.current_task.is_none());
}

#[test]
fn fleet_checkpoint_round_trips_and_backs_up_like_the_issue_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut fleet = FleetCheckpoint::new("demo-project");
    save_fleet_checkpoint(dir.path(), &fleet).unwrap();
    fleet.resume_count += 5;
    save_fleet_checkpoint(dir.path(), &fleet).unwrap();

    assert!(fleet_checkpoint_path(dir.path()).exists());
    assert!(fleet_checkpoint_backup_path(dir.path()).exists());

    let reloaded = load_fleet_checkpoint(dir.path(), "demo-project");
    assert_eq!(reloaded.project_name, "demo-project");
    assert_eq!(reloaded.resume_count, fleet.resume_count + 1);
}

#[test]
fn issue_dir_layout_matches_the_documented_tree() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint = IssueCheckpoint::new(9);
    save_issue_checkpoint(dir.path(), &checkpoint).unwrap();

    assert_eq!(
        issue_checkpoint_path(dir.path(), 9),
        dir.path().join("issues").join("9").join("checkpoint.json")
    );
    assert_eq!(
        issue_progress_log_path(dir.path(), 9),
        dir.path().join("issues").join("9").join("progress.jsonl")
    );
}
