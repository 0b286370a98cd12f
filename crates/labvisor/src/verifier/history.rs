//! Command reconstruction from raw terminal keystrokes.

use std::collections::VecDeque;

pub const DEFAULT_HISTORY: usize = 100;

/// Longest command kept. Input past this on one line is dropped.
pub const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Start,
    /// CSI (`ESC [`) or SS3 (`ESC O`): runs until a final byte.
    Sequence,
}

/// Rolling window of the most recent complete commands.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    line: Vec<u8>,
    escape: Escape,
    capacity: usize,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY)),
            line: Vec::new(),
            escape: Escape::None,
            capacity: capacity.max(1),
        }
    }

    /// Feed raw input. CR or LF completes the line being typed.
    pub fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            match self.escape {
                Escape::Start => {
                    self.escape = if byte == b'[' || byte == b'O' {
                        Escape::Sequence
                    } else {
                        Escape::None
                    };
                    continue;
                }
                Escape::Sequence => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.escape = Escape::None;
                    }
                    continue;
                }
                Escape::None => {}
            }

            match byte {
                b'\r' | b'\n' => self.commit(),
                0x1b => self.escape = Escape::Start,
                // Backspace / DEL: drop one whole UTF-8 character.
                0x08 | 0x7f => {
                    while let Some(last) = self.line.pop() {
                        if last & 0xc0 != 0x80 {
                            break;
                        }
                    }
                }
                // Ctrl-C and Ctrl-U abandon the line.
                0x03 | 0x15 => self.line.clear(),
                b if b < 0x20 && b != b'\t' => {}
                _ if self.line.len() >= MAX_LINE_BYTES => {}
                b'\t' => self.line.push(b' '),
                b => self.line.push(b),
            }
        }
    }

    fn commit(&mut self) {
        let text = String::from_utf8_lossy(&self.line).trim().to_string();
        self.line.clear();
        if text.is_empty() {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(text);
    }

    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(input: &[u8]) -> Vec<String> {
        let mut h = CommandHistory::default();
        h.feed(input);
        h.commands().map(str::to_string).collect()
    }

    #[test]
    fn overlong_lines_are_truncated() {
        let mut h = CommandHistory::default();
        h.feed(&vec![b'a'; 8 * MAX_LINE_BYTES]);
        assert_eq!(h.line.len(), MAX_LINE_BYTES);
        h.feed(b"\rid\r");
        let commands: Vec<_> = h.commands().collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].len(), MAX_LINE_BYTES);
        assert_eq!(commands[1], "id");
        assert!(h.line.is_empty());
    }

    #[test]
    fn splits_on_cr_and_lf() {
        assert_eq!(history(b"ls -la\rwhoami\nid\r\n"), vec!["ls -la", "whoami", "id"]);
    }

    #[test]
    fn partial_line_is_not_a_command() {
        let mut h = CommandHistory::default();
        h.feed(b"nmap -sV ");
        assert!(h.is_empty());
        h.feed(b"10.0.0.1\r");
        assert_eq!(h.commands().collect::<Vec<_>>(), vec!["nmap -sV 10.0.0.1"]);
    }

    #[test]
    fn editing_keys_are_applied() {
        assert_eq!(history(b"catt\x7f /etc/passwd\r"), vec!["cat /etc/passwd"]);
        assert_eq!(history("é\x7fe\r".as_bytes()), vec!["e"]);
        assert_eq!(history(b"rm -rf /\x03echo ok\r"), vec!["echo ok"]);
        // Arrow keys and other escape sequences are dropped.
        assert_eq!(history(b"\x1b[Als\x1bOD -l\r"), vec!["ls -l"]);
    }

    #[test]
    fn oldest_entries_are_evicted() {
        let mut h = CommandHistory::new(3);
        for i in 0..5 {
            h.feed(format!("cmd{i}\n").as_bytes());
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.commands().collect::<Vec<_>>(), vec!["cmd2", "cmd3", "cmd4"]);
    }
}
