/// Per-process message queue — a bounded FIFO mailbox processes use to
/// pass values to each other without shared mutable state, matching the
/// cooperative (never truly parallel) concurrency model.

use std::collections::VecDeque;

use crate::value::Value;

const MAX_QUEUE_LEN: usize = 256;

pub struct Message {
    pub from_process_id: u32,
    pub kind: u16,
    pub value: Value,
}

pub struct MessageQueue {
    queue: VecDeque<Message>,
}

impl MessageQueue {
    pub fn new() -> Self {
        MessageQueue { queue: VecDeque::new() }
    }

    pub fn send(&mut self, from_process_id: u32, kind: u16, value: Value) -> bool {
        if self.queue.len() >= MAX_QUEUE_LEN {
            return false;
        }
        self.queue.push_back(Message { from_process_id, kind, value });
        true
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    pub fn peek(&self) -> Option<&Message> {
        self.queue.front()
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn has_kind(&self, kind: u16) -> bool {
        self.queue.iter().any(|m| m.kind == kind)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = MessageQueue::new();
        q.send(1, 0, Value::Int(1));
        q.send(1, 0, Value::Int(2));
        assert_eq!(q.pop().unwrap().value, Value::Int(1));
        assert_eq!(q.pop().unwrap().value, Value::Int(2));
        assert!(q.pop().is_none());
    }

    #[test]
    fn has_kind_scans_without_consuming() {
        let mut q = MessageQueue::new();
        q.send(1, 7, Value::Nil);
        assert!(q.has_kind(7));
        assert!(!q.has_kind(8));
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn clear_empties_the_queue() {
        let mut q = MessageQueue::new();
        q.send(1, 0, Value::Nil);
        q.clear();
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn send_rejects_once_bound_is_reached() {
        let mut q = MessageQueue::new();
        for _ in 0..MAX_QUEUE_LEN {
            assert!(q.send(1, 0, Value::Nil));
        }
        assert!(!q.send(1, 0, Value::Nil));
    }
}
