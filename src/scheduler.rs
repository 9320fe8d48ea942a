//! One-shot Scheduler
//!
//! Tasks are due at a frame of the environment's block clock and run at the
//! first block boundary at or after that frame. Scheduling is sample-accurate
//! to the block, not to the frame.

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    /// Handle for cancelling a scheduled task
    pub struct TaskId;
}

struct Scheduled<T> {
    due: u64,
    seq: u64,
    task: T,
}

/// Pending one-shot tasks ordered by due frame
pub struct Scheduler<T> {
    tasks: SlotMap<TaskId, Scheduled<T>>,
    next_seq: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            tasks: SlotMap::with_key(),
            next_seq: 0,
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once the clock reaches frame `due`
    pub fn schedule_at(&mut self, due: u64, task: T) -> TaskId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(Scheduled { due, seq, task })
    }

    /// Drop a pending task. Returns it if it had not run yet.
    pub fn cancel(&mut self, id: TaskId) -> Option<T> {
        self.tasks.remove(id).map(|s| s.task)
    }

    pub fn clear_all(&mut self) {
        self.tasks.clear();
    }

    /// Remove and return every task due at or before `now`, earliest first.
    /// Tasks due on the same frame keep their scheduling order.
    pub fn take_due(&mut self, now: u64) -> Vec<T> {
        let mut due: Vec<(u64, u64, TaskId)> = self
            .tasks
            .iter()
            .filter(|(_, s)| s.due <= now)
            .map(|(id, s)| (s.due, s.seq, id))
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|(_, _, id)| self.tasks.remove(id).map(|s| s.task))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl<T> std::fmt::Debug for Scheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.tasks.len())
            .finish()
    }
}
