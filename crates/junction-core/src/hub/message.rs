//! Messages exchanged between roles and the bounded log that keeps the
//! most recent ones.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::roles::RoleKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Broadcast,
    Query,
    Vote,
    Decision,
    Status,
}

/// One routed message. Transient: only the bounded [`MessageLog`] keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub from: RoleKey,
    pub to: RoleKey,
    pub kind: MessageKind,
    pub payload: Value,
    /// Roles already handling upstream requests, sender included.
    pub chain: Vec<RoleKey>,
}

impl Message {
    pub fn new(from: RoleKey, to: RoleKey, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            from,
            to,
            kind,
            payload,
            chain: vec![from],
        }
    }

    /// Text carried by the payload: a bare string, or the `text`/`prompt`
    /// field of an object.
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Value::String(s) => Some(s),
            Value::Object(map) => map
                .get("text")
                .or_else(|| map.get("prompt"))
                .and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Ring buffer of recent messages; the oldest entry is evicted first.
#[derive(Debug)]
pub struct MessageLog {
    capacity: usize,
    entries: VecDeque<Message>,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1_024)),
        }
    }

    pub fn push(&mut self, message: Message) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn recent(&self, limit: usize) -> Vec<Message> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u64) -> Message {
        Message::new(
            RoleKey::Junction,
            RoleKey::Analyst,
            MessageKind::Request,
            json!({ "n": n }),
        )
    }

    #[test]
    fn log_evicts_oldest_first() {
        let mut log = MessageLog::new(2);
        log.push(msg(1));
        log.push(msg(2));
        log.push(msg(3));
        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent[0].payload["n"], 3);
        assert_eq!(recent[1].payload["n"], 2);
    }

    #[test]
    fn zero_capacity_log_keeps_nothing() {
        let mut log = MessageLog::new(0);
        log.push(msg(1));
        assert!(log.is_empty());
    }

    #[test]
    fn text_reads_string_or_text_field() {
        let plain = Message::new(
            RoleKey::Junction,
            RoleKey::Critic,
            MessageKind::Query,
            json!("hello"),
        );
        assert_eq!(plain.text(), Some("hello"));

        let obj = Message::new(
            RoleKey::Junction,
            RoleKey::Critic,
            MessageKind::Query,
            json!({ "prompt": "why?" }),
        );
        assert_eq!(obj.text(), Some("why?"));
        assert_eq!(msg(1).text(), None);
    }

    #[test]
    fn new_message_chain_starts_with_sender() {
        assert_eq!(msg(1).chain, vec![RoleKey::Junction]);
    }
}
