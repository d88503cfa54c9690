//! Dependency graph checks over a project's tasks.
//!
//! Dependencies live on the task row (`depends_on`), so these are pure
//! functions over a loaded task list plus a thin store wrapper.

use super::Database;
use crate::error::ScheduleError;
use crate::types::{Task, TaskStatus};
use anyhow::Result;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Find one dependency cycle, returned as a closed path (`A -> B -> A`).
///
/// Tasks are visited in id order so the reported cycle is deterministic.
pub fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut ids: Vec<&str> = by_id.keys().copied().collect();
    ids.sort_unstable();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Some(cycle);
            }
            None => {}
        }

        let task: &'a Task = by_id.get(id).copied()?;
        marks.insert(id, Mark::Visiting);
        path.push(id);

        for dep in &task.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                continue;
            }
            if let Some(cycle) = visit(dep.as_str(), by_id, marks, path) {
                return Some(cycle);
            }
        }

        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    for id in ids {
        if let Some(cycle) = visit(id, &by_id, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

/// Tasks that depend on ids absent from the list, with the missing ids.
pub fn unknown_dependencies(tasks: &[Task]) -> Vec<(String, Vec<String>)> {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut out: Vec<(String, Vec<String>)> = tasks
        .iter()
        .filter_map(|t| {
            let missing: Vec<String> = t
                .depends_on
                .iter()
                .filter(|d| !known.contains(d.as_str()))
                .cloned()
                .collect();
            (!missing.is_empty()).then(|| (t.id.clone(), missing))
        })
        .collect();
    out.sort();
    out
}

/// Failed with no retries left.
pub fn is_permanently_failed(task: &Task) -> bool {
    task.status == TaskStatus::Failed && task.retries_exhausted()
}

/// Non-completed tasks whose transitive dependencies include a permanently
/// failed task. Such tasks can never become ready without an operator.
pub fn blocked_by_failure(tasks: &[Task]) -> HashSet<String> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut memo: HashMap<&str, bool> = HashMap::new();

    fn poisoned<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        memo: &mut HashMap<&'a str, bool>,
        stack: &mut HashSet<&'a str>,
    ) -> bool {
        if let Some(&hit) = memo.get(id) {
            return hit;
        }
        let Some(task): Option<&'a Task> = by_id.get(id).copied() else {
            return false;
        };
        // Cycles are rejected at start; guard anyway so this never recurses forever
        if !stack.insert(id) {
            return false;
        }
        let hit = task.depends_on.iter().any(|dep| {
            by_id
                .get(dep.as_str())
                .is_some_and(|d| is_permanently_failed(d))
                || poisoned(dep.as_str(), by_id, memo, stack)
        });
        stack.remove(id);
        memo.insert(id, hit);
        hit
    }

    let mut stack = HashSet::new();
    let mut blocked = HashSet::new();
    for task in tasks {
        if task.status != TaskStatus::Completed && poisoned(task.id.as_str(), &by_id, &mut memo, &mut stack) {
            blocked.insert(task.id.clone());
        }
    }
    blocked
}

/// True when every dependency of `task` is completed.
pub fn dependencies_met(task: &Task, status_of: &HashMap<String, TaskStatus>) -> bool {
    task.depends_on
        .iter()
        .all(|dep| status_of.get(dep) == Some(&TaskStatus::Completed))
}

impl Database {
    /// Reject a project whose dependency graph is unusable.
    pub fn validate_dependencies(&self, project: &str) -> Result<()> {
        let tasks = self.list_tasks(Some(project))?;

        if tasks.is_empty() {
            return Err(ScheduleError::EmptyProject {
                project: project.to_string(),
            }
            .into());
        }

        if let Some((task, missing)) = unknown_dependencies(&tasks).into_iter().next() {
            return Err(ScheduleError::UnknownDependency { task, missing }.into());
        }

        if let Some(cycle) = find_cycle(&tasks) {
            return Err(ScheduleError::DependencyCycle { cycle }.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str], status: TaskStatus) -> Task {
        Task {
            id: id.into(),
            project: "p".into(),
            title: None,
            spec_file: format!("{}.md", id),
            spec_hash: "h".into(),
            status,
            node: None,
            pid: None,
            attempt: if status == TaskStatus::Failed { 2 } else { 0 },
            max_retries: 2,
            started_at: None,
            completed_at: None,
            collected_at: None,
            heartbeat_at: None,
            kill_requested_at: None,
            error: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            modifies: vec!["f".into()],
            exclusive: false,
            priority: 100,
            executor: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn finds_two_node_cycle() {
        let tasks = vec![
            task("A", &["B"], TaskStatus::Pending),
            task("B", &["A"], TaskStatus::Pending),
        ];
        assert_eq!(find_cycle(&tasks), Some(vec!["A".into(), "B".into(), "A".into()]));
    }

    #[test]
    fn finds_self_loop() {
        let tasks = vec![task("A", &["A"], TaskStatus::Pending)];
        assert_eq!(find_cycle(&tasks), Some(vec!["A".into(), "A".into()]));
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let tasks = vec![
            task("A", &[], TaskStatus::Pending),
            task("B", &["A"], TaskStatus::Pending),
            task("C", &["A"], TaskStatus::Pending),
            task("D", &["B", "C"], TaskStatus::Pending),
        ];
        assert_eq!(find_cycle(&tasks), None);
    }

    #[test]
    fn reports_unknown_dependencies() {
        let tasks = vec![task("A", &["Z", "B"], TaskStatus::Pending), task("B", &[], TaskStatus::Pending)];
        assert_eq!(unknown_dependencies(&tasks), vec![("A".into(), vec!["Z".into()])]);
    }

    #[test]
    fn blocked_propagates_transitively() {
        let tasks = vec![
            task("A", &[], TaskStatus::Failed),
            task("B", &["A"], TaskStatus::Pending),
            task("C", &["B"], TaskStatus::Pending),
            task("D", &[], TaskStatus::Pending),
        ];
        let blocked = blocked_by_failure(&tasks);
        assert!(blocked.contains("B"));
        assert!(blocked.contains("C"));
        assert!(!blocked.contains("D"));
        assert!(!blocked.contains("A"));
    }

    #[test]
    fn retryable_failure_does_not_block() {
        let mut a = task("A", &[], TaskStatus::Failed);
        a.attempt = 1;
        let tasks = vec![a, task("B", &["A"], TaskStatus::Pending)];
        assert!(blocked_by_failure(&tasks).is_empty());
    }
}
