//! Priority run queues.
//!
//! One FIFO per priority level plus a bitmask of non-empty levels. The running thread is not in
//! any queue; it is re-queued when it is preempted or its quantum runs out.

use std::collections::VecDeque;

use crate::object::ObjectId;
use crate::thread::PRIORITY_COUNT;

#[derive(Debug, Clone)]
pub struct Scheduler {
    queues: Vec<VecDeque<ObjectId>>,
    ready_mask: u64,
    current: Option<ObjectId>,
    quantum: u64,
    /// Instructions the current thread has used from its quantum.
    slice_used: u64,
}

impl Scheduler {
    pub fn new(quantum: u64) -> Self {
        Self {
            queues: vec![VecDeque::new(); PRIORITY_COUNT],
            ready_mask: 0,
            current: None,
            quantum: quantum.max(1),
            slice_used: 0,
        }
    }

    pub fn quantum(&self) -> u64 {
        self.quantum
    }

    pub fn current(&self) -> Option<ObjectId> {
        self.current
    }

    pub(crate) fn set_current(&mut self, thread: Option<ObjectId>) {
        if self.current != thread {
            self.slice_used = 0;
        }
        self.current = thread;
    }

    pub fn slice_used(&self) -> u64 {
        self.slice_used
    }

    pub(crate) fn set_slice_used(&mut self, used: u64) {
        self.slice_used = used.min(self.quantum);
    }

    pub fn slice_remaining(&self) -> u64 {
        self.quantum - self.slice_used
    }

    /// Charge `executed` instructions to the current thread. Returns true once the quantum is
    /// used up.
    pub(crate) fn charge(&mut self, executed: u64) -> bool {
        self.slice_used = self.slice_used.saturating_add(executed).min(self.quantum);
        self.slice_used >= self.quantum
    }

    /// Give up what is left of the current quantum.
    pub(crate) fn forfeit_slice(&mut self) {
        self.slice_used = self.quantum;
    }

    pub(crate) fn restart_slice(&mut self) {
        self.slice_used = 0;
    }

    /// Append `thread` to the tail of its priority queue.
    pub(crate) fn enqueue(&mut self, thread: ObjectId, priority: u8) {
        let p = usize::from(priority).min(PRIORITY_COUNT - 1);
        self.queues[p].push_back(thread);
        self.ready_mask |= 1 << p;
    }

    /// Put `thread` at the head of its priority queue so it runs next at that level.
    pub(crate) fn enqueue_front(&mut self, thread: ObjectId, priority: u8) {
        let p = usize::from(priority).min(PRIORITY_COUNT - 1);
        self.queues[p].push_front(thread);
        self.ready_mask |= 1 << p;
    }

    /// Remove `thread` from the queue for `priority`. Returns whether it was queued.
    pub(crate) fn remove(&mut self, thread: ObjectId, priority: u8) -> bool {
        let p = usize::from(priority).min(PRIORITY_COUNT - 1);
        let q = &mut self.queues[p];
        let Some(pos) = q.iter().position(|&t| t == thread) else {
            return false;
        };
        q.remove(pos);
        if q.is_empty() {
            self.ready_mask &= !(1 << p);
        }
        true
    }

    pub fn highest_ready_priority(&self) -> Option<u8> {
        (self.ready_mask != 0).then(|| (63 - self.ready_mask.leading_zeros()) as u8)
    }

    /// Pop the head of the most urgent non-empty queue.
    pub(crate) fn pop_highest(&mut self) -> Option<ObjectId> {
        let p = usize::from(self.highest_ready_priority()?);
        let q = &mut self.queues[p];
        let thread = q.pop_front();
        if q.is_empty() {
            self.ready_mask &= !(1 << p);
        }
        thread
    }

    pub fn is_queued(&self, thread: ObjectId) -> bool {
        self.queues.iter().any(|q| q.contains(&thread))
    }

    /// Ready threads from most to least urgent, queue order within a level.
    pub fn ready(&self) -> impl Iterator<Item = (u8, ObjectId)> + '_ {
        self.queues
            .iter()
            .enumerate()
            .rev()
            .flat_map(|(p, q)| q.iter().map(move |&t| (p as u8, t)))
    }

    pub(crate) fn clear(&mut self) {
        for q in &mut self.queues {
            q.clear();
        }
        self.ready_mask = 0;
        self.current = None;
        self.slice_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_level_wins() {
        let mut s = Scheduler::new(100);
        s.enqueue(ObjectId(1), 5);
        s.enqueue(ObjectId(2), 10);
        s.enqueue(ObjectId(3), 10);
        assert_eq!(s.highest_ready_priority(), Some(10));
        assert_eq!(s.pop_highest(), Some(ObjectId(2)));
        assert_eq!(s.pop_highest(), Some(ObjectId(3)));
        assert_eq!(s.pop_highest(), Some(ObjectId(1)));
        assert_eq!(s.pop_highest(), None);
    }

    #[test]
    fn remove_clears_empty_level() {
        let mut s = Scheduler::new(100);
        s.enqueue(ObjectId(1), 63);
        assert!(s.remove(ObjectId(1), 63));
        assert!(!s.remove(ObjectId(1), 63));
        assert_eq!(s.highest_ready_priority(), None);
    }

    #[test]
    fn quantum_accounting() {
        let mut s = Scheduler::new(10);
        s.set_current(Some(ObjectId(1)));
        assert!(!s.charge(4));
        assert_eq!(s.slice_remaining(), 6);
        assert!(s.charge(6));
        s.set_current(Some(ObjectId(2)));
        assert_eq!(s.slice_remaining(), 10);
    }

    #[test]
    fn ready_lists_most_urgent_first() {
        let mut s = Scheduler::new(1);
        s.enqueue(ObjectId(1), 0);
        s.enqueue(ObjectId(2), 20);
        s.enqueue_front(ObjectId(3), 20);
        let order: Vec<_> = s.ready().map(|(_, t)| t).collect();
        assert_eq!(order, vec![ObjectId(3), ObjectId(2), ObjectId(1)]);
    }
}
