//! Working copy of the task graph owned by the scheduler.
//!
//! Nodes live in an arena and are addressed by index. Only tasks that still
//! have to run are kept; an edge from an already successful parent counts as
//! satisfied and is dropped when the graph is built.

use std::collections::{BTreeSet, HashMap};
use weft_core::model::{Status, Task, TaskEdge, TaskId};

#[derive(Debug, Default)]
pub struct WorkingGraph {
    ids: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    children: Vec<Vec<usize>>,
    indegree: Vec<usize>,
    live: Vec<bool>,
    ready: BTreeSet<usize>,
    remaining: usize,
}

impl WorkingGraph {
    pub fn build(tasks: &[Task], edges: &[TaskEdge]) -> Self {
        let mut graph = Self::default();
        for task in tasks.iter().filter(|t| t.status != Status::Successful) {
            graph.index.insert(task.id, graph.ids.len());
            graph.ids.push(task.id);
        }
        let n = graph.ids.len();
        graph.children = vec![Vec::new(); n];
        graph.indegree = vec![0; n];
        graph.live = vec![true; n];
        graph.remaining = n;

        for edge in edges {
            if let (Some(&p), Some(&c)) = (graph.index.get(&edge.parent), graph.index.get(&edge.child)) {
                graph.children[p].push(c);
                graph.indegree[c] += 1;
            }
        }
        graph.ready = (0..n).filter(|&i| graph.indegree[i] == 0).collect();
        graph
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.get(&id).is_some_and(|&i| self.live[i])
    }

    /// Tasks whose parents have all succeeded and that have not been handed
    /// to a backend yet, in insertion order.
    pub fn ready(&self) -> Vec<TaskId> {
        self.ready.iter().map(|&i| self.ids[i]).collect()
    }

    /// Takes a task out of the ready set once it is in flight. The node stays
    /// in the graph until it is completed or pruned.
    pub fn mark_submitted(&mut self, id: TaskId) -> bool {
        match self.index.get(&id) {
            Some(&i) if self.live[i] => self.ready.remove(&i),
            _ => false,
        }
    }

    /// Removes a successful task and returns the children it unblocked.
    pub fn complete(&mut self, id: TaskId) -> Vec<TaskId> {
        let Some(i) = self.take(id) else {
            return Vec::new();
        };
        let mut unblocked = Vec::new();
        for c in std::mem::take(&mut self.children[i]) {
            if !self.live[c] {
                continue;
            }
            self.indegree[c] -= 1;
            if self.indegree[c] == 0 {
                self.ready.insert(c);
                unblocked.push(self.ids[c]);
            }
        }
        unblocked
    }

    /// Removes a permanently failed task together with every descendant,
    /// which can no longer run. Returns the descendants.
    pub fn prune(&mut self, id: TaskId) -> Vec<TaskId> {
        let Some(i) = self.take(id) else {
            return Vec::new();
        };
        let mut stack = std::mem::take(&mut self.children[i]);
        let mut pruned = Vec::new();
        while let Some(c) = stack.pop() {
            if !self.live[c] {
                continue;
            }
            self.live[c] = false;
            self.ready.remove(&c);
            self.remaining -= 1;
            pruned.push(self.ids[c]);
            stack.extend(std::mem::take(&mut self.children[c]));
        }
        pruned.sort();
        pruned
    }

    fn take(&mut self, id: TaskId) -> Option<usize> {
        let &i = self.index.get(&id)?;
        if !self.live[i] {
            return None;
        }
        self.live[i] = false;
        self.ready.remove(&i);
        self.remaining -= 1;
        Some(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use std::path::PathBuf;
    use weft_core::model::{Resources, StageId, TagSet};

    fn task(id: u64, status: Status) -> Task {
        Task {
            id: TaskId(id),
            stage_id: StageId(1),
            tags: TagSet::from_pairs([("n", id.to_string())]),
            command: String::new(),
            resources: Resources::default(),
            status,
            noop: false,
            succeed_on_failure: false,
            output_dir: PathBuf::new(),
            output_files: vec![],
            input_files: vec![],
            created_on: Local::now(),
            finished_on: None,
        }
    }

    fn edge(p: u64, c: u64) -> TaskEdge {
        TaskEdge {
            parent: TaskId(p),
            child: TaskId(c),
        }
    }

    // 1 -> 2 -> 4, 1 -> 3 -> 4
    fn diamond() -> WorkingGraph {
        let tasks: Vec<Task> = (1..=4).map(|i| task(i, Status::NoAttempt)).collect();
        WorkingGraph::build(&tasks, &[edge(1, 2), edge(1, 3), edge(2, 4), edge(3, 4)])
    }

    #[test]
    fn test_ready_only_after_all_parents_complete() {
        let mut g = diamond();
        assert_eq!(g.ready(), vec![TaskId(1)]);
        assert_eq!(g.complete(TaskId(1)), vec![TaskId(2), TaskId(3)]);
        assert!(g.complete(TaskId(2)).is_empty());
        assert_eq!(g.ready(), vec![TaskId(3)]);
        assert_eq!(g.complete(TaskId(3)), vec![TaskId(4)]);
        g.complete(TaskId(4));
        assert!(g.is_empty());
    }

    #[test]
    fn test_successful_tasks_are_excluded() {
        let tasks = vec![task(1, Status::Successful), task(2, Status::NoAttempt)];
        let g = WorkingGraph::build(&tasks, &[edge(1, 2)]);
        assert_eq!(g.len(), 1);
        assert!(!g.contains(TaskId(1)));
        assert_eq!(g.ready(), vec![TaskId(2)]);
    }

    #[test]
    fn test_prune_removes_descendants() {
        let mut g = diamond();
        g.complete(TaskId(1));
        assert_eq!(g.prune(TaskId(2)), vec![TaskId(4)]);
        assert_eq!(g.ready(), vec![TaskId(3)]);
        assert!(g.complete(TaskId(3)).is_empty());
        assert!(g.is_empty());
    }

    #[test]
    fn test_submitted_tasks_leave_ready_set() {
        let mut g = diamond();
        g.complete(TaskId(1));
        assert!(g.mark_submitted(TaskId(2)));
        assert_eq!(g.ready(), vec![TaskId(3)]);
        assert!(!g.mark_submitted(TaskId(2)));
        assert!(g.contains(TaskId(2)));
        assert_eq!(g.len(), 3);

        // Not ready yet: parents 2 and 3 are still running.
        assert!(!g.mark_submitted(TaskId(4)));
        assert!(g.mark_submitted(TaskId(3)));
        assert!(g.ready().is_empty());

        assert!(g.complete(TaskId(2)).is_empty());
        assert_eq!(g.complete(TaskId(3)), vec![TaskId(4)]);
        assert_eq!(g.ready(), vec![TaskId(4)]);
    }

    #[test]
    fn test_prune_of_submitted_task_removes_it() {
        let mut g = diamond();
        g.mark_submitted(TaskId(1));
        assert_eq!(g.prune(TaskId(1)), vec![TaskId(2), TaskId(3), TaskId(4)]);
        assert!(g.is_empty());
        assert!(!g.mark_submitted(TaskId(1)));
    }

    #[test]
    fn test_complete_twice_is_noop() {
        let mut g = diamond();
        g.complete(TaskId(1));
        assert!(g.complete(TaskId(1)).is_empty());
        assert_eq!(g.len(), 3);
    }
}
