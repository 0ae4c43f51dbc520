//! Task lookup table
//!
//! Maps task ids to their control blocks so `cancel` and status queries can
//! find a task from any thread. Terminal tasks stay visible for a while so a
//! late cancel is a no-op instead of an unknown id.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::generation::task::TaskControl;
use crate::lock_unpoisoned;
use crate::types::TaskId;

pub struct TaskTable {
    tasks: DashMap<TaskId, Arc<TaskControl>>,
    /// Insertion order, used to evict the oldest terminal records
    order: Mutex<VecDeque<TaskId>>,
    retain_terminal: usize,
}

impl TaskTable {
    pub fn new(retain_terminal: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            retain_terminal,
        }
    }

    pub fn insert(&self, control: Arc<TaskControl>) {
        let id = control.task_id().clone();
        self.tasks.insert(id.clone(), control);
        lock_unpoisoned(&self.order).push_back(id);
        self.prune();
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Arc<TaskControl>> {
        self.tasks.get(task_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, task_id: &TaskId) {
        self.tasks.remove(task_id);
        lock_unpoisoned(&self.order).retain(|id| id != task_id);
    }

    /// Tasks that have not reached a terminal state
    pub fn live(&self) -> Vec<Arc<TaskControl>> {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Evict terminal records from the front of the insertion order until at
    /// most `retain_terminal` of them remain. Live tasks are never evicted.
    fn prune(&self) {
        let mut order = lock_unpoisoned(&self.order);
        let mut terminal = order
            .iter()
            .filter(|id| self.is_terminal(id))
            .count();

        let mut index = 0;
        while terminal > self.retain_terminal && index < order.len() {
            if self.is_terminal(&order[index]) {
                if let Some(id) = order.remove(index) {
                    self.tasks.remove(&id);
                }
                terminal -= 1;
            } else {
                index += 1;
            }
        }
    }

    fn is_terminal(&self, task_id: &TaskId) -> bool {
        self.tasks
            .get(task_id)
            .map_or(true, |entry| entry.value().state().is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::task::TaskState;
    use crate::types::SessionId;

    fn control(task: &str, session: &str) -> Arc<TaskControl> {
        Arc::new(TaskControl::new(TaskId::from(task), SessionId::from(session)))
    }

    #[test]
    fn test_insert_and_lookup() {
        let table = TaskTable::new(8);
        table.insert(control("t1", "s1"));
        assert!(table.get(&TaskId::from("t1")).is_some());
        assert!(table.get(&TaskId::from("t2")).is_none());
        let state = table.get(&TaskId::from("t1")).map(|c| c.state());
        assert_eq!(state, Some(TaskState::Pending));
    }

    #[test]
    fn test_prune_keeps_live_tasks() {
        let table = TaskTable::new(1);
        let live = control("live", "s");
        table.insert(Arc::clone(&live));

        for i in 0..4 {
            let done = control(&format!("done-{i}"), "s");
            done.finish(TaskState::Completed);
            table.insert(done);
        }

        assert!(table.get(&TaskId::from("live")).is_some());
        // only the newest terminal record survives
        assert!(table.get(&TaskId::from("done-3")).is_some());
        assert!(table.get(&TaskId::from("done-0")).is_none());
        assert_eq!(table.len(), 2);
        assert_eq!(table.live().len(), 1);
    }
}
