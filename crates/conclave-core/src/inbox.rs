//! Per-agent Inbox (§4.C): an ordered FIFO of pending messages per agent
//! id, safe for concurrent push from multiple turn executors and a single
//! scheduler drain.

use std::collections::{HashMap, VecDeque};

use conclave_llm::ChatMessage;
use parking_lot::Mutex;

#[derive(Default)]
pub struct Inbox {
    lanes: Mutex<HashMap<String, VecDeque<ChatMessage>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to `id`'s queue.
    pub fn push(&self, id: &str, msg: ChatMessage) {
        self.lanes.lock().entry(id.to_string()).or_default().push_back(msg);
    }

    pub fn size(&self, id: &str) -> usize {
        self.lanes.lock().get(id).map(VecDeque::len).unwrap_or(0)
    }

    pub fn has_work(&self, id: &str) -> bool {
        self.size(id) > 0
    }

    pub fn has_any_work(&self) -> bool {
        self.lanes.lock().values().any(|q| !q.is_empty())
    }

    /// Atomically drain and return every currently-queued message for `id`,
    /// in FIFO order.
    pub fn next_prompt_for(&self, id: &str) -> Vec<ChatMessage> {
        let mut lanes = self.lanes.lock();
        match lanes.get_mut(id) {
            Some(queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// All agent ids that currently have any queued work, in no particular
    /// order — used by the scheduler to decide whether to leave Idle.
    pub fn ids_with_work(&self) -> Vec<String> {
        self.lanes
            .lock()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_is_preserved() {
        let inbox = Inbox::new();
        inbox.push("alice", ChatMessage::user("m1"));
        inbox.push("alice", ChatMessage::user("m2"));
        inbox.push("alice", ChatMessage::user("m3"));

        let drained = inbox.next_prompt_for("alice");
        let contents: Vec<_> = drained.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn next_prompt_for_drains_atomically() {
        let inbox = Inbox::new();
        inbox.push("bob", ChatMessage::user("hi"));
        assert!(inbox.has_work("bob"));
        let drained = inbox.next_prompt_for("bob");
        assert_eq!(drained.len(), 1);
        assert!(!inbox.has_work("bob"));
        assert!(inbox.next_prompt_for("bob").is_empty());
    }

    #[test]
    fn unknown_agent_has_no_work() {
        let inbox = Inbox::new();
        assert!(!inbox.has_work("ghost"));
        assert!(!inbox.has_any_work());
    }
}
