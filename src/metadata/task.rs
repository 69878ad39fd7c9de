//! Task manager for recursive subtree mutations (spec §4.9, component C9).
//!
//! Grounded on the teacher's `backup/prune.rs` batch-and-accumulate shape:
//! a task holds a cursor, processes one bounded batch per `execute` call,
//! and folds results into running counters until its cursor is exhausted.

use std::collections::VecDeque;

use crate::metadata::inode::InodeId;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub changed: u64,
    pub not_changed: u64,
    pub not_permitted: u64,
}

impl TaskCounts {
    pub fn add(&mut self, other: TaskCounts) {
        self.changed += other.changed;
        self.not_changed += other.not_changed;
        self.not_permitted += other.not_permitted;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    SetGoal(u8),
    SetTrashtime(u32),
    SetEattr { set: u16, clear: u16 },
}

/// A traversal cursor: the remaining work queue for one task. New
/// directories discovered mid-batch enqueue follow-up work rather than
/// recursing, so a batch boundary is always a safe yield point (spec §5:
/// "task-manager batch exhaustion" is an explicit suspension point).
#[derive(Debug)]
pub struct Task {
    pub id: u64,
    pub kind: TaskKind,
    pub batch_size: usize,
    queue: VecDeque<InodeId>,
    pub counts: TaskCounts,
    pub cancelled: bool,
}

impl Task {
    pub fn new(id: u64, kind: TaskKind, root: InodeId) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(root);
        Task {
            id,
            kind,
            batch_size: DEFAULT_BATCH_SIZE,
            queue,
            counts: TaskCounts::default(),
            cancelled: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cancelled || self.queue.is_empty()
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Drains up to `batch_size` inodes from the queue. `visit` applies the
    /// task's mutation to one inode and returns whether it changed,
    /// unchanged-because-already-set, or forbidden by a permission check;
    /// it also returns any child inodes to enqueue for later batches.
    pub fn execute(&mut self, visit: &mut dyn FnMut(InodeId, TaskKind) -> (TaskOutcome, Vec<InodeId>)) -> TaskCounts {
        if self.cancelled {
            return TaskCounts::default();
        }
        let mut batch_counts = TaskCounts::default();
        for _ in 0..self.batch_size {
            let inode = match self.queue.pop_front() {
                Some(i) => i,
                None => break,
            };
            let (outcome, children) = visit(inode, self.kind);
            match outcome {
                TaskOutcome::Changed => batch_counts.changed += 1,
                TaskOutcome::NotChanged => batch_counts.not_changed += 1,
                TaskOutcome::NotPermitted => batch_counts.not_permitted += 1,
            }
            self.queue.extend(children);
        }
        self.counts.add(batch_counts);
        batch_counts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Changed,
    /// Includes the `fs_repair`-equivalent "already at the target value"
    /// case (spec §9 open question b).
    NotChanged,
    NotPermitted,
}

/// Drives every live task under a round-robin fairness policy, interleaving
/// batches with regular request handling (spec §4.9, §5).
#[derive(Default)]
pub struct TaskManager {
    tasks: VecDeque<Task>,
    next_id: u64,
}

impl TaskManager {
    pub fn submit(&mut self, kind: TaskKind, root: InodeId) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.push_back(Task::new(id, kind, root));
        id
    }

    /// Runs one batch of the oldest unfinished task, removing it once
    /// exhausted and returning its id plus final counts when it completes.
    pub fn run_one_batch(&mut self, visit: &mut dyn FnMut(InodeId, TaskKind) -> (TaskOutcome, Vec<InodeId>)) -> Option<(u64, Option<TaskCounts>)> {
        let task = self.tasks.front_mut()?;
        task.execute(visit);
        if task.is_finished() {
            let task = self.tasks.pop_front().unwrap();
            Some((task.id, Some(task.counts)))
        } else {
            let id = task.id;
            let task = self.tasks.pop_front().unwrap();
            self.tasks.push_back(task);
            Some((id, None))
        }
    }

    pub fn cancel(&mut self, id: u64) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
            task.cancel();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_drains_up_to_batch_size_and_enqueues_children() {
        let mut task = Task::new(0, TaskKind::SetGoal(2), InodeId(1));
        task.batch_size = 2;
        let counts = task.execute(&mut |inode, _| {
            if inode == InodeId(1) {
                (TaskOutcome::Changed, vec![InodeId(2), InodeId(3)])
            } else {
                (TaskOutcome::Changed, vec![])
            }
        });
        assert_eq!(counts.changed, 2); // root + first child, batch_size=2
        assert!(!task.is_finished());
    }

    #[test]
    fn cancelled_task_stops_producing_batches_without_reverting_counts() {
        let mut task = Task::new(0, TaskKind::SetTrashtime(0), InodeId(1));
        task.execute(&mut |_, _| (TaskOutcome::Changed, vec![]));
        let before = task.counts;
        task.cancel();
        let batch = task.execute(&mut |_, _| (TaskOutcome::Changed, vec![InodeId(9)]));
        assert_eq!(batch, TaskCounts::default());
        assert_eq!(task.counts, before);
    }

    #[test]
    fn manager_completes_task_once_queue_drains() {
        let mut mgr = TaskManager::default();
        let id = mgr.submit(TaskKind::SetGoal(1), InodeId(1));
        let result = mgr.run_one_batch(&mut |_, _| (TaskOutcome::Changed, vec![]));
        assert_eq!(result, Some((id, Some(TaskCounts { changed: 1, not_changed: 0, not_permitted: 0 }))));
        assert_eq!(mgr.pending_count(), 0);
    }
}
