//! Command buffer
//!
//! FIFO of pending commands. The head is the command currently matched
//! against incoming output. Operations that change the head report it so
//! the owner can begin executing the new head exactly once.

use std::collections::VecDeque;

use super::Command;

/// Whether an operation produced a new head that must be started
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadChange {
    Started,
    Unchanged,
}

pub struct CommandBuffer {
    queue: VecDeque<Command>,
    /// Head of an empty buffer
    sentinel: Command,
}

impl CommandBuffer {
    pub fn new(sentinel: Command) -> Self {
        Self {
            queue: VecDeque::new(),
            sentinel,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Current command, or the sentinel when nothing is pending
    pub fn head(&self) -> &Command {
        self.queue.front().unwrap_or(&self.sentinel)
    }

    pub fn head_mut(&mut self) -> &mut Command {
        match self.queue.front_mut() {
            Some(command) => command,
            None => &mut self.sentinel,
        }
    }

    pub fn push(&mut self, command: Command) -> HeadChange {
        let was_empty = self.queue.is_empty();
        self.queue.push_back(command);
        if was_empty {
            HeadChange::Started
        } else {
            HeadChange::Unchanged
        }
    }

    /// Replace the head with `commands`, in order.
    ///
    /// The old head is dropped and `commands[0]` becomes the head without
    /// the buffer ever being empty in between.
    pub fn substitute_current(&mut self, commands: Vec<Command>) -> HeadChange {
        if self.queue.is_empty() {
            let mut change = HeadChange::Unchanged;
            for command in commands {
                if self.push(command) == HeadChange::Started {
                    change = HeadChange::Started;
                }
            }
            return change;
        }

        self.queue.pop_front();
        for command in commands.into_iter().rev() {
            self.queue.push_front(command);
        }
        if self.queue.is_empty() {
            HeadChange::Unchanged
        } else {
            HeadChange::Started
        }
    }

    /// Pop the head
    pub fn shift(&mut self) -> (Option<Command>, HeadChange) {
        let old = self.queue.pop_front();
        let change = if old.is_some() && !self.queue.is_empty() {
            HeadChange::Started
        } else {
            HeadChange::Unchanged
        };
        (old, change)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::prompt::PromptRules;
    use crate::command::{create_command_from_text, CommandKind, Scope};

    fn command(text: &str) -> Command {
        create_command_from_text(text, Scope::default(), &PromptRules::default()).unwrap()
    }

    fn buffer() -> CommandBuffer {
        CommandBuffer::new(Command::end_of_session(&PromptRules::default()))
    }

    #[test]
    fn test_empty_head_is_sentinel() {
        let buf = buffer();
        assert!(buf.is_empty());
        assert_eq!(buf.head().kind(), &CommandKind::EndOfSession);
    }

    #[test]
    fn test_push_starts_only_first() {
        let mut buf = buffer();
        assert_eq!(buf.push(command("a")), HeadChange::Started);
        assert_eq!(buf.push(command("b")), HeadChange::Unchanged);
        assert_eq!(buf.head().text(), "a");
    }

    #[test]
    fn test_shift_starts_next() {
        let mut buf = buffer();
        let _ = buf.push(command("a"));
        let _ = buf.push(command("b"));
        let (old, change) = buf.shift();
        assert_eq!(old.unwrap().text(), "a");
        assert_eq!(change, HeadChange::Started);
        assert_eq!(buf.head().text(), "b");

        let (old, change) = buf.shift();
        assert_eq!(old.unwrap().text(), "b");
        assert_eq!(change, HeadChange::Unchanged);
        assert_eq!(buf.head().kind(), &CommandKind::EndOfSession);

        let (old, change) = buf.shift();
        assert!(old.is_none());
        assert_eq!(change, HeadChange::Unchanged);
    }

    #[test]
    fn test_substitute_replaces_head_in_order() {
        let mut buf = buffer();
        let _ = buf.push(Command::define("ls").unwrap());
        let _ = buf.push(command("later"));
        let change = buf.substitute_current(vec![command("pwd"), command("ls")]);
        assert_eq!(change, HeadChange::Started);
        let texts: Vec<_> = buf.queue.iter().map(|c| c.text().to_string()).collect();
        assert_eq!(texts, vec!["pwd", "ls", "later"]);
    }

    #[test]
    fn test_substitute_on_empty_pushes() {
        let mut buf = buffer();
        let change = buf.substitute_current(vec![command("a"), command("b")]);
        assert_eq!(change, HeadChange::Started);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.head().text(), "a");
    }

    #[test]
    fn test_one_start_per_head_transition() {
        let mut buf = buffer();
        let mut starts = 0;
        let mut count = |c: HeadChange| {
            if c == HeadChange::Started {
                starts += 1;
            }
        };
        count(buf.push(Command::define("x").unwrap()));
        count(buf.push(command("y")));
        count(buf.substitute_current(vec![command("x1"), command("x2")]));
        count(buf.shift().1);
        count(buf.shift().1);
        count(buf.shift().1);
        // define, x1, x2, y
        assert_eq!(starts, 4);
        assert!(buf.is_empty());
    }
}
