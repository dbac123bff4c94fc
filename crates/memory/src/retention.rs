//! Message retention.
//!
//! A prefix-sliding window bounded by `max_messages`. When the first
//! stored message is a system prompt it is pinned: the window slides
//! over everything after it.

use tiller_domain::{Message, Role};

#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    pub max_messages: Option<usize>,
    /// Advisory; backends may no-op.
    pub compression_threshold: Option<usize>,
}

impl RetentionPolicy {
    pub fn new(max_messages: Option<usize>) -> Self {
        Self {
            max_messages,
            compression_threshold: None,
        }
    }

    /// Apply the window in place.
    pub fn apply(&self, messages: &mut Vec<Message>) {
        let Some(max) = self.max_messages else {
            return;
        };
        if max == 0 || messages.len() <= max {
            return;
        }

        let pin_system = messages
            .first()
            .is_some_and(|m| matches!(m.role, Role::System));

        if pin_system {
            // Keep the system message plus the newest (max - 1) others.
            let keep_tail = max.saturating_sub(1);
            let tail_start = messages.len() - keep_tail;
            let mut kept = Vec::with_capacity(max);
            kept.push(messages[0].clone());
            kept.extend_from_slice(&messages[tail_start..]);
            *messages = kept;
        } else {
            let tail_start = messages.len() - max;
            messages.drain(..tail_start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(n: usize) -> Vec<Message> {
        (0..n).map(|i| Message::user(format!("m{i}"))).collect()
    }

    #[test]
    fn unbounded_is_noop() {
        let mut m = msgs(10);
        RetentionPolicy::new(None).apply(&mut m);
        assert_eq!(m.len(), 10);
    }

    #[test]
    fn window_keeps_newest() {
        let mut m = msgs(10);
        RetentionPolicy::new(Some(3)).apply(&mut m);
        assert_eq!(m.len(), 3);
        assert_eq!(m[0].text_content(), "m7");
        assert_eq!(m[2].text_content(), "m9");
    }

    #[test]
    fn system_message_is_pinned() {
        let mut m = vec![Message::system("rules")];
        m.extend(msgs(9));
        RetentionPolicy::new(Some(4)).apply(&mut m);
        assert_eq!(m.len(), 4);
        assert_eq!(m[0].text_content(), "rules");
        assert_eq!(m[1].text_content(), "m6");
        assert_eq!(m[3].text_content(), "m8");
    }

    #[test]
    fn within_window_untouched() {
        let mut m = msgs(3);
        RetentionPolicy::new(Some(5)).apply(&mut m);
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn non_leading_system_is_not_pinned() {
        let mut m = msgs(5);
        m.insert(2, Message::system("late"));
        RetentionPolicy::new(Some(2)).apply(&mut m);
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].text_content(), "m3");
    }
}
