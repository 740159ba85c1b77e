use std::collections::VecDeque;

/// Outbound lines waiting for a usable channel.
///
/// Stateful `SET <KEY> ...` lines coalesce: a newer line for the same key
/// replaces every older queued one, so a reconnect flush only carries the
/// latest intent per control. When full, the oldest line is dropped.
#[derive(Debug)]
pub struct CommandQueue {
    lines: VecDeque<String>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Queue a line. Blank lines are ignored and `false` is returned.
    pub fn enqueue(&mut self, line: &str) -> bool {
        let text = line.trim();
        if text.is_empty() {
            return false;
        }

        if let Some(key) = coalesce_key(text) {
            let before = self.lines.len();
            self.lines.retain(|existing| coalesce_key(existing).as_deref() != Some(key.as_str()));
            if self.lines.len() != before {
                tracing::debug!("Coalesced queued {} command", key);
            }
        }

        if self.lines.len() >= self.capacity {
            if let Some(dropped) = self.lines.pop_front() {
                tracing::warn!("Command queue full, dropping oldest line: {}", dropped);
            }
        }
        self.lines.push_back(text.to_string());
        true
    }

    /// Take every queued line, oldest first
    pub fn drain(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
}

/// `SET <KEY>` (key upper-cased) for stateful set commands that carry a value;
/// tube edits are keyed per tube number
fn coalesce_key(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next()?;
    if !verb.eq_ignore_ascii_case("SET") {
        return None;
    }
    let key = tokens.next()?;
    if !key.chars().all(|c| c.is_ascii_alphabetic() || c == '_') {
        return None;
    }
    let value = tokens.next()?;
    let key = key.to_ascii_uppercase();
    if key == "TUBE" {
        // tube records coalesce per number
        return Some(format!("SET TUBE {}", value));
    }
    Some(format!("SET {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_coalesces_to_latest() {
        let mut queue = CommandQueue::new(48);
        queue.enqueue("SET VOL 10");
        queue.enqueue("GET STATE");
        queue.enqueue("set vol 20");

        let lines = queue.drain();
        assert_eq!(lines, vec!["GET STATE".to_string(), "set vol 20".to_string()]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_different_keys_are_kept() {
        let mut queue = CommandQueue::new(48);
        queue.enqueue("SET VOL 10");
        queue.enqueue("SET BAL 2");
        queue.enqueue("SET TUBE 1 ACT=Y HOUR=1 MIN=1");
        queue.enqueue("SET TUBE 2 ACT=N HOUR=1 MIN=1");
        queue.enqueue("SET TUBE 1 ACT=N HOUR=1 MIN=1");

        let lines: Vec<&str> = queue.iter().collect();
        assert_eq!(
            lines,
            vec![
                "SET VOL 10",
                "SET BAL 2",
                "SET TUBE 2 ACT=N HOUR=1 MIN=1",
                "SET TUBE 1 ACT=N HOUR=1 MIN=1",
            ]
        );
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut queue = CommandQueue::new(3);
        queue.enqueue("GET TUBE 1");
        queue.enqueue("GET TUBE 2");
        queue.enqueue("GET TUBE 3");
        queue.enqueue("GET TUBE 4");

        let lines: Vec<&str> = queue.iter().collect();
        assert_eq!(lines, vec!["GET TUBE 2", "GET TUBE 3", "GET TUBE 4"]);
    }

    #[test]
    fn test_blank_lines_rejected() {
        let mut queue = CommandQueue::new(4);
        assert!(!queue.enqueue("   "));
        assert!(queue.enqueue("  GET STATE  "));
        assert_eq!(queue.iter().next(), Some("GET STATE"));
    }

    #[test]
    fn test_coalesce_key() {
        assert_eq!(coalesce_key("SET MUTE 1").as_deref(), Some("SET MUTE"));
        assert_eq!(coalesce_key("SET MUTE"), None);
        assert_eq!(
            coalesce_key("SET TUBE 3 ACT=Y HOUR=1 MIN=0").as_deref(),
            Some("SET TUBE 3")
        );
        assert_eq!(coalesce_key("ADD TUBE NUM=1"), None);
    }
}
