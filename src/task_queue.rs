use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::CadreError;
use crate::types::{ImplementationTask, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub blocked: usize,
}

/// Dependency-ordered queue of phase-3 implementation tasks (spec §4.4).
/// Built once per phase-3 run from the tasks an agent proposed; acyclicity
/// is checked at construction so every later `get_ready` call can assume the
/// dependency graph is a DAG.
pub struct TaskQueue {
    tasks: HashMap<String, ImplementationTask>,
    status: HashMap<String, TaskStatus>,
    /// Preserves the order tasks were proposed in, for deterministic
    /// iteration (`get_ready`, `select_non_overlapping_batch`).
    order: Vec<String>,
}

impl TaskQueue {
    pub fn new(tasks: Vec<ImplementationTask>) -> Result<Self, CadreError> {
        if let Some(cycle) = detect_cycles(&tasks) {
            return Err(CadreError::Validation(format!(
                "task dependency cycle detected: {}",
                cycle.join(" -> ")
            )));
        }

        let order = tasks.iter().map(|t| t.id.clone()).collect();
        let status = tasks.iter().map(|t| (t.id.clone(), TaskStatus::Pending)).collect();
        let tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();

        Ok(Self { tasks, status, order })
    }

    /// Re-applies a previously-persisted completed/blocked set on resume, so
    /// tasks already finished in an earlier run are not re-offered by
    /// `get_ready`.
    pub fn restore_state(&mut self, completed: &BTreeSet<String>, blocked: &BTreeSet<String>) {
        for id in completed {
            if self.status.contains_key(id) {
                self.status.insert(id.clone(), TaskStatus::Completed);
            }
        }
        for id in blocked {
            if self.status.contains_key(id) {
                self.status.insert(id.clone(), TaskStatus::Blocked);
            }
        }
    }

    fn is_satisfied(&self, task: &ImplementationTask) -> bool {
        task.dependencies
            .iter()
            .all(|dep| matches!(self.status.get(dep), Some(TaskStatus::Completed)))
    }

    /// Tasks whose dependencies are all completed and that are themselves
    /// still pending, in the order they were originally proposed.
    pub fn get_ready(&self) -> Vec<&ImplementationTask> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|task| {
                matches!(self.status.get(&task.id), Some(TaskStatus::Pending)) && self.is_satisfied(task)
            })
            .collect()
    }

    pub fn start(&mut self, task_id: &str) {
        self.status.insert(task_id.to_string(), TaskStatus::Running);
    }

    pub fn complete(&mut self, task_id: &str) {
        self.status.insert(task_id.to_string(), TaskStatus::Completed);
    }

    pub fn mark_blocked(&mut self, task_id: &str) {
        self.status.insert(task_id.to_string(), TaskStatus::Blocked);
    }

    /// Every task is either completed or blocked — nothing pending, ready,
    /// or running remains.
    pub fn is_complete(&self) -> bool {
        self.status
            .values()
            .all(|s| matches!(s, TaskStatus::Completed | TaskStatus::Blocked))
    }

    /// True when nothing is ready, nothing is running, and the queue isn't
    /// complete — a deadlock caused by a task depending on a blocked
    /// sibling. The caller should mark the remaining pending tasks blocked
    /// and terminate the phase-3 loop rather than spin forever.
    pub fn is_deadlocked(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        let running = self.status.values().any(|s| matches!(s, TaskStatus::Running));
        !running && self.get_ready().is_empty()
    }

    pub fn get_counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for status in self.status.values() {
            match status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    pub fn task(&self, task_id: &str) -> Option<&ImplementationTask> {
        self.tasks.get(task_id)
    }

    /// Task IDs still `Pending`, in proposal order — used to mark every
    /// unreachable task blocked once `is_deadlocked` reports no further
    /// progress is possible.
    pub fn pending_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| matches!(self.status.get(*id), Some(TaskStatus::Pending)))
            .cloned()
            .collect()
    }
}

/// Greedily select the largest input-order-preserving subset of `ready`
/// whose `files` sets are pairwise disjoint, capped at `max_batch`. Two
/// tasks that touch the same file can never run concurrently (spec §4.4) —
/// the first one encountered wins; later overlapping tasks are deferred to
/// a subsequent batch.
pub fn select_non_overlapping_batch<'a>(
    ready: &[&'a ImplementationTask],
    max_batch: usize,
) -> Vec<&'a ImplementationTask> {
    let mut claimed_files: HashSet<&str> = HashSet::new();
    let mut batch = Vec::new();

    for task in ready {
        if batch.len() >= max_batch {
            break;
        }
        let overlaps = task.files.iter().any(|f| claimed_files.contains(f.as_str()));
        if overlaps {
            continue;
        }
        for f in &task.files {
            claimed_files.insert(f.as_str());
        }
        batch.push(*task);
    }

    batch
}

/// Three-color DFS cycle detection over the task dependency graph. Returns
/// the cycle path (including the repeated start node) if one exists.
fn detect_cycles(tasks: &[ImplementationTask]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let by_id: HashMap<&str, &ImplementationTask> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut color: HashMap<&str, Color> = tasks.iter().map(|t| (t.id.as_str(), Color::White)).collect();
    let mut path: Vec<String> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a ImplementationTask>,
        color: &mut HashMap<&'a str, Color>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        color.insert(id, Color::Gray);
        path.push(id.to_string());

        if let Some(task) = by_id.get(id) {
            for dep in &task.dependencies {
                match color.get(dep.as_str()) {
                    Some(Color::Gray) => {
                        let mut cycle = path.clone();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Some(Color::White) => {
                        if let Some(cycle) = visit(dep.as_str(), by_id, color, path) {
                            return Some(cycle);
                        }
                    }
                    _ => {}
                }
            }
        }

        path.pop();
        color.insert(id, Color::Black);
        None
    }

    for task in tasks {
        if matches!(color.get(task.id.as_str()), Some(Color::White)) {
            if let Some(cycle) = visit(task.id.as_str(), &by_id, &mut color, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}
