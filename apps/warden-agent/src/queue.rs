//! Scheduled-action queue: a min-heap keyed by start time, with
//! insertion order as the tie-break. Restored from the state store at
//! startup and persisted back on every mutation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use warden_protocol::Action;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Key {
    start_millis: i64,
    seq: u64,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.start_millis, self.seq).cmp(&(other.start_millis, other.seq))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: Key,
    action: Action,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Entry {}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct ActionQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl ActionQueue {
    pub fn new(actions: Vec<Action>) -> Self {
        let mut queue = Self::default();
        for action in actions {
            queue.add(action);
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn add(&mut self, action: Action) {
        let start_millis = action
            .start_time
            .map(|t| t.timestamp_millis())
            .unwrap_or(i64::MIN);
        let key = Key {
            start_millis,
            seq: self.seq,
        };
        self.seq += 1;
        self.heap.push(Reverse(Entry { key, action }));
    }

    /// Remove every entry with the given action id, wherever it sits.
    /// Returns how many were removed.
    pub fn cancel(&mut self, action_id: &str) -> usize {
        let before = self.heap.len();
        let retained: Vec<Reverse<Entry>> = std::mem::take(&mut self.heap)
            .into_iter()
            .filter(|Reverse(e)| e.action.id != action_id)
            .collect();
        self.heap = retained.into();
        before - self.heap.len()
    }

    /// Pop every action whose start time has passed, in timestamp order,
    /// ties broken by insertion order.
    pub fn dequeue_due(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        let now_millis = now.timestamp_millis();
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.key.start_millis > now_millis {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            due.push(entry.action);
        }
        due
    }

    /// Deterministic snapshot for the state store: execution order.
    pub fn actions(&self) -> Vec<Action> {
        let mut entries: Vec<&Entry> = self.heap.iter().map(|Reverse(e)| e).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.iter().map(|e| e.action.clone()).collect()
    }
}

/// Thread-safe queue shared by the dispatcher, the scheduler tick, and
/// the cancel handler. Also remembers recently cancelled action ids so a
/// cancel processed before its target arrives still suppresses it.
pub struct SharedQueue {
    inner: std::sync::Mutex<ActionQueue>,
    cancelled: std::sync::Mutex<CancelledSet>,
}

const CANCELLED_CAPACITY: usize = 1024;

#[derive(Default)]
struct CancelledSet {
    order: std::collections::VecDeque<String>,
    ids: std::collections::HashSet<String>,
}

impl CancelledSet {
    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > CANCELLED_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }
}

impl SharedQueue {
    pub fn new(restored: Vec<Action>) -> Self {
        Self {
            inner: std::sync::Mutex::new(ActionQueue::new(restored)),
            cancelled: std::sync::Mutex::new(CancelledSet::default()),
        }
    }

    pub fn add(&self, action: Action) {
        self.inner.lock().expect("queue lock").add(action);
    }

    /// Remove queued entries for `action_id` and remember the id so a
    /// later delivery of the same action is suppressed too.
    pub fn cancel(&self, action_id: &str) -> usize {
        let removed = self.inner.lock().expect("queue lock").cancel(action_id);
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .insert(action_id.to_string());
        removed
    }

    pub fn was_cancelled(&self, action_id: &str) -> bool {
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .ids
            .contains(action_id)
    }

    pub fn dequeue_due(&self, now: DateTime<Utc>) -> Vec<Action> {
        self.inner.lock().expect("queue lock").dequeue_due(now)
    }

    pub fn snapshot(&self) -> Vec<Action> {
        self.inner.lock().expect("queue lock").actions()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("queue lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(id: &str, start: &str) -> Action {
        serde_json::from_value(json!({
            "id": id,
            "type": "POLICY_CHANGE",
            "start_time": start,
            "data": {"policy": {}}
        }))
        .unwrap()
    }

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn dequeue_returns_due_in_order() {
        let mut q = ActionQueue::default();
        q.add(at("late", "2024-03-01T12:00:00Z"));
        q.add(at("early", "2024-03-01T10:00:00Z"));
        q.add(at("mid", "2024-03-01T11:00:00Z"));

        let due = q.dequeue_due(ts("2024-03-01T11:30:00Z"));
        let ids: Vec<&str> = due.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut q = ActionQueue::default();
        q.add(at("first", "2024-03-01T10:00:00Z"));
        q.add(at("second", "2024-03-01T10:00:00Z"));
        let due = q.dequeue_due(ts("2024-03-01T10:00:00Z"));
        let ids: Vec<&str> = due.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn cancel_removes_all_matches() {
        let mut q = ActionQueue::default();
        q.add(at("x", "2024-03-01T10:00:00Z"));
        q.add(at("y", "2024-03-01T11:00:00Z"));
        q.add(at("x", "2024-03-01T12:00:00Z"));
        assert_eq!(q.cancel("x"), 2);
        assert_eq!(q.cancel("x"), 0);
        assert_eq!(q.len(), 1);
        assert_eq!(q.actions()[0].id, "y");
    }

    #[test]
    fn shared_queue_remembers_cancelled_ids() {
        let q = SharedQueue::new(vec![at("x", "2030-01-01T00:00:00Z")]);
        assert_eq!(q.cancel("x"), 1);
        // The id stays suppressed even though nothing is queued anymore.
        assert_eq!(q.cancel("y"), 0);
        assert!(q.was_cancelled("x"));
        assert!(q.was_cancelled("y"));
        assert!(!q.was_cancelled("z"));
    }

    #[test]
    fn snapshot_is_execution_ordered() {
        let mut q = ActionQueue::default();
        q.add(at("b", "2024-03-01T11:00:00Z"));
        q.add(at("a", "2024-03-01T10:00:00Z"));
        let ids: Vec<String> = q.actions().iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        // Snapshot does not drain the queue.
        assert_eq!(q.len(), 2);
    }
}
