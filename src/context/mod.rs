//! Context / correspondence manager
//!
//! Owns the command buffer and the context stack. Every exported chunk
//! of terminal output is accumulated and tested against the head
//! command's prompt matcher; the output is attributed to that command
//! and forwarded downstream as [`Correspondence`] events.
//!
//! Side effects are queued in an outbox ([`ManagerEvent`]) drained by the
//! owner, which performs the writes to the child process.

pub mod sftp;
pub mod stack;

use std::mem;
use std::path::PathBuf;

use log::{debug, error, info};
use thiserror::Error;

use crate::command::buffer::{CommandBuffer, HeadChange};
use crate::command::prompt::{PromptMatcher, PromptRules};
use crate::command::{
    create_command_from_text, Command, CommandError, CommandKind, ContextTransition,
    FinishAction, Scope, SFTP_CONTEXT,
};
use crate::terminal::element::{ActionArgs, ActionKind, ActionMarker};
use crate::terminal::stream::{OutputStream, StreamError};
use stack::{Context, ContextStack};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("failed to prepare download directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Command an event is attributed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMeta {
    pub id: u64,
    pub command_text: String,
    /// Remote working directory known when the event was emitted
    pub remote_pwd: Option<String>,
}

/// Output attributed to a command
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    /// This command's share of the chunk
    pub content: OutputStream,
    /// Content after the command's output (its closing prompt)
    pub trailing: OutputStream,
    /// `None` when nothing is pending (unattributed output)
    pub command: Option<CommandMeta>,
    /// The command has finished; `content` completes its output
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// Text to write to the child process
    Write(String),
    Output(Correspondence),
}

pub struct ContextManager {
    rules: PromptRules,
    buffer: CommandBuffer,
    stack: ContextStack,
    /// Output received since the head command started
    accumulation: OutputStream,
    remote_pwd: Option<String>,
    /// Parent directory for `!open` downloads
    temp_root: Option<PathBuf>,
    outbox: Vec<ManagerEvent>,
}

impl ContextManager {
    pub fn new(rules: PromptRules) -> Self {
        let sentinel = Command::end_of_session(&rules);
        Self {
            rules,
            buffer: CommandBuffer::new(sentinel),
            stack: ContextStack::new(),
            accumulation: OutputStream::empty(),
            remote_pwd: None,
            temp_root: None,
            outbox: Vec::new(),
        }
    }

    pub fn with_temp_root(mut self, temp_root: Option<PathBuf>) -> Self {
        self.temp_root = temp_root;
        self
    }

    pub fn rules(&self) -> &PromptRules {
        &self.rules
    }

    pub fn stack(&self) -> &ContextStack {
        &self.stack
    }

    pub fn buffer(&self) -> &CommandBuffer {
        &self.buffer
    }

    pub fn remote_pwd(&self) -> Option<&str> {
        self.remote_pwd.as_deref()
    }

    pub fn in_sftp_context(&self) -> bool {
        self.stack.in_context(SFTP_CONTEXT)
    }

    pub fn scope(&self) -> Scope {
        Scope {
            in_sftp: self.in_sftp_context(),
            parent_in_sftp: self
                .stack
                .parent()
                .is_some_and(|c| c.context_type == SFTP_CONTEXT),
        }
    }

    /// Drain queued side effects, in order
    pub fn take_events(&mut self) -> Vec<ManagerEvent> {
        mem::take(&mut self.outbox)
    }

    /// Register the command line the session was spawned with.
    /// It is already running, so nothing is written.
    pub fn start_session(&mut self, command_line: &str) -> Result<(), ContextError> {
        let command = create_command_from_text(command_line, self.scope(), &self.rules)?.starting();
        info!("Session started: {}", command.command_text());
        self.push_command(command);
        Ok(())
    }

    /// Queue a line of user input.
    ///
    /// While the head command may be prompting interactively (password,
    /// confirmation) the text goes straight to the process instead.
    pub fn buffer_input(&mut self, text: &str) -> Result<(), ContextError> {
        if !self.buffer.is_empty() && self.buffer.head().takes_input() {
            debug!(
                "Passing input through to {:?}",
                self.buffer.head().command_text()
            );
            self.outbox.push(ManagerEvent::Write(text.to_string()));
            return Ok(());
        }
        let define = Command::define(text)?;
        self.push_command(define);
        Ok(())
    }

    /// Queue a prepared command
    pub fn push_command(&mut self, command: Command) {
        if self.buffer.push(command) == HeadChange::Started {
            self.begin_head();
        }
    }

    /// Expand a define into the commands to send for the current context
    pub fn generate_command_list(&self, inner: &str) -> Result<Vec<Command>, ContextError> {
        let scope = self.scope();
        let base = create_command_from_text(inner, scope, &self.rules)?;
        if !scope.in_sftp {
            return Ok(vec![base]);
        }
        sftp::expand(base, scope, &self.rules, self.temp_root.as_deref())
    }

    /// Start the head: expand defines until a concrete command heads
    /// the buffer, then send it
    fn begin_head(&mut self) {
        loop {
            let inner = match self.buffer.head().kind() {
                CommandKind::Define { inner } => inner.clone(),
                CommandKind::EndOfSession => return,
                CommandKind::Shell | CommandKind::Sftp => {
                    self.execute_head();
                    return;
                }
            };

            let change = match self.generate_command_list(&inner) {
                Ok(commands) => self.buffer.substitute_current(commands),
                Err(e) => {
                    error!("Dropping input {:?}: {}", inner.trim_end(), e);
                    self.buffer.shift().1
                }
            };
            if change == HeadChange::Unchanged {
                return;
            }
        }
    }

    fn execute_head(&mut self) {
        self.accumulation = OutputStream::empty();
        let head = self.buffer.head();
        if head.writes_to_process() {
            debug!("Executing {:?}", head.command_text());
            self.outbox.push(ManagerEvent::Write(head.text().to_string()));
        } else {
            debug!("Tracking {:?} without writing", head.command_text());
        }
    }

    /// Split the accumulation into the head's output and what follows it
    fn identify(&self) -> Option<(OutputStream, OutputStream)> {
        match self.buffer.head().prompt() {
            PromptMatcher::MatchImmediately => {
                Some((self.accumulation.clone(), OutputStream::empty()))
            }
            matcher => matcher
                .find(self.accumulation.plain_text())
                .map(|index| self.accumulation.split_by_index(index)),
        }
    }

    /// Handle one exported chunk of terminal output
    pub fn receive_output(&mut self, stream: &OutputStream) -> Result<(), ContextError> {
        let previous_len = self.accumulation.len();
        self.accumulation = self.accumulation.join(stream)?;

        match self.identify() {
            Some((output, end)) => {
                let content = output.slice(previous_len.min(output.len()), output.len());
                let trailing = if end.len() <= stream.len() {
                    end
                } else {
                    stream.clone()
                };
                self.send_output(content, trailing, true);
                self.finish_head(output);
            }
            None => {
                self.send_output(stream.clone(), OutputStream::empty(), false);
                if *self.buffer.head().kind() == CommandKind::EndOfSession {
                    self.trim_idle_accumulation();
                }
            }
        }
        Ok(())
    }

    /// Keep only the trailing partial line while idle; the end-of-session
    /// matcher never looks past the last line.
    fn trim_idle_accumulation(&mut self) {
        let Some(pos) = self.accumulation.plain_text().rfind('\n') else {
            return;
        };
        let (_, rest) = self.accumulation.split_by_index(pos + 1);
        self.accumulation = rest;
    }

    fn meta(&self, command: &Command) -> CommandMeta {
        CommandMeta {
            id: command.id(),
            command_text: command.command_text().to_string(),
            remote_pwd: self.remote_pwd.clone(),
        }
    }

    fn send_output(&mut self, content: OutputStream, trailing: OutputStream, finalized: bool) {
        let head = self.buffer.head();
        let command = match head.kind() {
            CommandKind::EndOfSession => None,
            _ if !head.is_loggable() => {
                debug!("Suppressing output of {:?}", head.command_text());
                return;
            }
            _ => Some(self.meta(head)),
        };
        self.outbox.push(ManagerEvent::Output(Correspondence {
            content,
            trailing,
            command,
            finalized,
        }));
    }

    fn finish_head(&mut self, output: OutputStream) {
        let (finished, change) = self.buffer.shift();
        match finished {
            Some(mut command) => self.finish_command(&mut command, &output),
            None => {
                // Idle sentinel: the innermost context went away
                if self.stack.pop().is_none() {
                    debug!("End of session marker with no open context");
                }
            }
        }
        self.accumulation = OutputStream::empty();
        if change == HeadChange::Started {
            self.begin_head();
        }
    }

    fn finish_command(&mut self, command: &mut Command, output: &OutputStream) {
        debug!("Finished {:?}", command.command_text());

        match command.transition() {
            Some(ContextTransition::Enter { context_type }) => {
                self.stack.push(Context {
                    command_text: command.command_text().to_string(),
                    context_type: context_type.clone(),
                });
                self.remote_pwd = None;
            }
            Some(ContextTransition::Exit) => {
                self.stack.pop();
                self.remote_pwd = None;
            }
            None => {}
        }

        match command.finish_action() {
            Some(FinishAction::ParsePwd) => match self.rules.parse_pwd(output.plain_text()) {
                Some(pwd) => {
                    info!("Remote working directory: {}", pwd);
                    self.remote_pwd = Some(pwd);
                }
                None => error!(
                    "No remote working directory in pwd reply {:?}",
                    output.plain_text()
                ),
            },
            Some(FinishAction::OpenFile(path)) => {
                let marker = ActionMarker::new(ActionKind::FileEntry, ActionArgs::Path(path.clone()))
                    .fallback(path.display().to_string())
                    .describe("file path");
                self.outbox.push(ManagerEvent::Output(Correspondence {
                    content: OutputStream::new(vec![marker.into()], 0, true, false),
                    trailing: OutputStream::empty(),
                    command: Some(self.meta(command)),
                    finalized: true,
                }));
            }
            None => {}
        }

        if let Some(callback) = command.take_callback() {
            callback(output);
        }
    }

    /// The child process exited: nothing pending can complete anymore
    pub fn on_process_exit(&mut self, code: i32) {
        info!(
            "Process exited with code {} ({} pending commands, context depth {})",
            code,
            self.buffer.len(),
            self.stack.depth()
        );
        self.stack.clear();
        self.buffer.clear();
        self.accumulation = OutputStream::empty();
        self.remote_pwd = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn manager() -> ContextManager {
        ContextManager::new(PromptRules::default())
    }

    fn writes(events: &[ManagerEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ManagerEvent::Write(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn outputs(events: &[ManagerEvent]) -> Vec<&Correspondence> {
        events
            .iter()
            .filter_map(|e| match e {
                ManagerEvent::Output(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn feed(manager: &mut ContextManager, text: &str) -> Vec<ManagerEvent> {
        manager
            .receive_output(&OutputStream::from_text(text))
            .unwrap();
        manager.take_events()
    }

    #[test]
    fn test_starting_command_is_not_written() {
        let mut m = manager();
        m.start_session("bash").unwrap();
        assert!(m.take_events().is_empty());
        let events = feed(&mut m, "welcome\nuser@host:~$ ");
        let out = outputs(&events);
        assert_eq!(out.len(), 1);
        assert!(out[0].finalized);
        assert_eq!(out[0].content.plain_text(), "welcome\n");
        assert_eq!(out[0].trailing.plain_text(), "user@host:~$ ");
        assert_eq!(out[0].command.as_ref().unwrap().command_text, "bash");
        assert!(m.buffer().is_empty());
    }

    #[test]
    fn test_input_is_written_and_attributed() {
        let mut m = manager();
        m.buffer_input("ls\r").unwrap();
        assert_eq!(writes(&m.take_events()), vec!["ls\r"]);

        let events = feed(&mut m, "ls\na.txt\n");
        let out = outputs(&events);
        assert!(!out[0].finalized);
        assert_eq!(out[0].command.as_ref().unwrap().command_text, "ls");

        let events = feed(&mut m, "user@host:~$ ");
        let out = outputs(&events);
        assert!(out[0].finalized);
        assert!(out[0].content.is_empty());
        assert_eq!(out[0].trailing.plain_text(), "user@host:~$ ");
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut m = manager();
        m.buffer_input("echo hi\r").unwrap();
        m.take_events();
        let events = feed(&mut m, "echo hi\nhi\nuser@ho");
        assert!(!outputs(&events)[0].finalized);
        let events = feed(&mut m, "st:~$ ");
        assert!(outputs(&events)[0].finalized);
        assert!(m.buffer().is_empty());
    }

    #[test]
    fn test_queued_commands_run_in_order() {
        let mut m = manager();
        m.buffer_input("one\r").unwrap();
        m.buffer_input("two\r").unwrap();
        // Shell commands take input: the second line goes through at once
        assert_eq!(writes(&m.take_events()), vec!["one\r", "two\r"]);
        assert_eq!(m.buffer().len(), 1);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let mut m = manager();
        assert!(matches!(
            m.buffer_input("echo \"oops\r"),
            Err(ContextError::Command(CommandError::UnterminatedQuote(_)))
        ));
        assert!(m.take_events().is_empty());
        assert!(m.buffer().is_empty());
    }

    #[test]
    fn test_sftp_session_tracks_context_and_pwd() {
        let mut m = manager();
        m.buffer_input("sftp host\r").unwrap();
        assert_eq!(writes(&m.take_events()), vec!["sftp host\r"]);
        feed(&mut m, "Connected to host.\nsftp> ");
        assert_eq!(m.stack().depth(), 1);
        assert!(m.in_sftp_context());

        m.buffer_input("cd docs\r").unwrap();
        assert_eq!(writes(&m.take_events()), vec!["cd docs\r"]);
        let events = feed(&mut m, "cd docs\nsftp> ");
        assert_eq!(writes(&events), vec!["pwd\r"]);
        assert_eq!(outputs(&events).len(), 1);

        let events = feed(&mut m, "pwd\nRemote working directory: /home/me/docs\nsftp> ");
        assert!(outputs(&events).is_empty());
        assert_eq!(m.remote_pwd(), Some("/home/me/docs"));

        m.buffer_input("ls\r").unwrap();
        assert_eq!(writes(&m.take_events()), vec!["pwd\r"]);
        let events = feed(&mut m, "pwd\nRemote working directory: /home/me/docs\nsftp> ");
        assert_eq!(writes(&events), vec!["ls\r"]);
        let events = feed(&mut m, "ls\nnotes.txt\nsftp> ");
        let out = outputs(&events);
        assert_eq!(
            out[0].command.as_ref().unwrap().remote_pwd.as_deref(),
            Some("/home/me/docs")
        );

        m.buffer_input("bye\r").unwrap();
        assert_eq!(writes(&m.take_events()), vec!["bye\r"]);
        feed(&mut m, "bye\nuser@host:~$ ");
        assert_eq!(m.stack().depth(), 0);
        assert_eq!(m.remote_pwd(), None);
    }

    #[test]
    fn test_bad_pwd_reply_keeps_previous() {
        let mut m = manager();
        m.buffer_input("sftp host\r").unwrap();
        feed(&mut m, "sftp> ");
        m.buffer_input("pwd\r").unwrap();
        feed(&mut m, "pwd\nRemote working directory: /srv\nsftp> ");
        assert_eq!(m.remote_pwd(), Some("/srv"));
        m.buffer_input("pwd\r").unwrap();
        feed(&mut m, "pwd\nsomething unexpected\nsftp> ");
        assert_eq!(m.remote_pwd(), Some("/srv"));
    }

    #[test]
    fn test_callback_runs_after_context_push() {
        let mut m = manager();
        let seen = Rc::new(RefCell::new(None));
        let seen_in_callback = seen.clone();
        let command = create_command_from_text("sftp host\r", m.scope(), m.rules())
            .unwrap()
            .on_finish(move |output| {
                *seen_in_callback.borrow_mut() = Some(output.plain_text().to_string());
            });
        m.push_command(command);
        feed(&mut m, "Connected.\nsftp> ");
        assert_eq!(seen.borrow().as_deref(), Some("Connected.\n"));
        assert!(m.in_sftp_context());
    }

    #[test]
    fn test_end_of_session_pops_context() {
        let mut m = manager();
        m.buffer_input("ssh box\r").unwrap();
        m.take_events();
        // Push a context by hand: ssh is not a context command by default
        m.stack.push(Context {
            command_text: "ssh box".to_string(),
            context_type: "ssh".to_string(),
        });
        feed(&mut m, "box$ ");
        assert_eq!(m.stack().depth(), 1);

        let events = feed(&mut m, "exit\nlogout\n");
        assert!(outputs(&events)[0].command.is_none());
        assert_eq!(m.stack().depth(), 0);
    }

    #[test]
    fn test_idle_output_keeps_only_partial_line() {
        let mut m = manager();
        for _ in 0..1000 {
            let events = feed(&mut m, "line of background output\n");
            assert!(outputs(&events)[0].command.is_none());
        }
        assert!(m.accumulation.is_empty());

        feed(&mut m, "more\nhalf a li");
        assert_eq!(m.accumulation.plain_text(), "half a li");
    }

    #[test]
    fn test_end_of_session_split_across_idle_chunks() {
        let mut m = manager();
        m.stack.push(Context {
            command_text: "ssh box".to_string(),
            context_type: "ssh".to_string(),
        });
        feed(&mut m, "bye\nlog");
        assert_eq!(m.stack().depth(), 1);
        feed(&mut m, "out\n");
        assert_eq!(m.stack().depth(), 0);
    }

    #[test]
    fn test_open_emits_file_entry() {
        let root = tempfile::tempdir().unwrap();
        let mut m = manager().with_temp_root(Some(root.path().to_path_buf()));
        m.buffer_input("sftp host\r").unwrap();
        feed(&mut m, "sftp> ");
        m.buffer_input("!open notes.txt\r").unwrap();
        let written = m.take_events();
        assert!(writes(&written)[0].starts_with("get notes.txt "));

        let events = feed(&mut m, "Fetching notes.txt\nsftp> ");
        let entry = outputs(&events)
            .into_iter()
            .find_map(|c| c.content.elements().first().and_then(|e| e.as_marker()).cloned())
            .unwrap();
        assert_eq!(entry.kind, ActionKind::FileEntry);
        let ActionArgs::Path(path) = entry.args else {
            panic!("expected a path");
        };
        assert!(path.starts_with(root.path()));
    }

    #[test]
    fn test_process_exit_clears_state() {
        let mut m = manager();
        m.buffer_input("sftp host\r").unwrap();
        feed(&mut m, "sftp> ");
        m.buffer_input("ls\r").unwrap();
        m.on_process_exit(0);
        assert!(m.buffer().is_empty());
        assert_eq!(m.stack().depth(), 0);
    }
}
