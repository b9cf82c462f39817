//! LISTEN/NOTIFY support.

use std::collections::VecDeque;

/// A message delivered by `NOTIFY` on a channel this session listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Backend process that sent the notification.
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// Notifications received but not yet handed to the caller, oldest first.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    pending: VecDeque<Notification>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, notification: Notification) {
        self.pending.push_back(notification);
    }

    pub fn pop(&mut self) -> Option<Notification> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Quote an identifier such as a channel name: `my"chan` → `"my""chan"`.
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal: `it's` → `'it''s'`.
///
/// Backslashes get the `E''` form so the result does not depend on
/// `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(channel: &str, payload: &str) -> Notification {
        Notification {
            process_id: 42,
            channel: channel.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = NotificationQueue::new();
        queue.push(note("a", "1"));
        queue.push(note("b", "2"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().channel, "a");
        assert_eq!(queue.pop().unwrap().channel, "b");
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_identifier("events"), "\"events\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(r"a\b"), r"E'a\\b'");
    }
}
