//! Command model
//!
//! A [`Command`] is one line of input issued to the child process along
//! with everything needed to attribute output to it: the prompt matcher
//! that signals completion, the context transition it causes and the
//! hooks to run once it finishes.

pub mod buffer;
pub mod prompt;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::terminal::stream::OutputStream;
use prompt::{PromptMatcher, PromptRules};

/// Context type pushed by an `sftp` command
pub const SFTP_CONTEXT: &str = "sftp";

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("no command in {0:?}")]
    InvalidCommandText(String),
    #[error("unterminated escape at end of {0:?}")]
    UnterminatedEscape(String),
    #[error("unterminated quote in {0:?}")]
    UnterminatedQuote(String),
}

/// Split command text into words.
///
/// Single and double quotes group words. Outside single quotes a
/// backslash escapes whitespace, quotes and another backslash; before any
/// other character it is kept literally (so `C:\dir` survives).
pub fn tokenize(text: &str) -> Result<Vec<String>, CommandError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (q, '\\') if q != Some('\'') => {
                let next = chars
                    .peek()
                    .copied()
                    .ok_or_else(|| CommandError::UnterminatedEscape(text.to_string()))?;
                if next.is_whitespace() || matches!(next, '"' | '\'' | '\\') {
                    current.push(next);
                    chars.next();
                } else {
                    current.push('\\');
                }
                in_token = true;
            }
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_token = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quote.is_some() {
        return Err(CommandError::UnterminatedQuote(text.to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(CommandError::InvalidCommandText(text.to_string()));
    }
    Ok(tokens)
}

/// Command verb, from the first word
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Ls,
    Cd,
    Get,
    Put,
    Rm,
    Mkdir,
    Rmdir,
    Rename,
    Pwd,
    Exit,
    Quit,
    Bye,
    Help,
    Question,
    Chmod,
    Chown,
    Chgrp,
    Ln,
    /// `!open <remote>`: fetch and hand over a local copy
    Open,
    Sftp,
    Define,
    Other(String),
}

impl Verb {
    pub fn from_name(name: &str) -> Self {
        let name = name.strip_suffix(".exe").unwrap_or(name);
        match name {
            "ls" => Verb::Ls,
            "cd" => Verb::Cd,
            "get" => Verb::Get,
            "put" => Verb::Put,
            "rm" => Verb::Rm,
            "mkdir" => Verb::Mkdir,
            "rmdir" => Verb::Rmdir,
            "rename" => Verb::Rename,
            "pwd" => Verb::Pwd,
            "exit" => Verb::Exit,
            "quit" => Verb::Quit,
            "bye" => Verb::Bye,
            "help" => Verb::Help,
            "?" => Verb::Question,
            "chmod" => Verb::Chmod,
            "chown" => Verb::Chown,
            "chgrp" => Verb::Chgrp,
            "ln" => Verb::Ln,
            "!open" => Verb::Open,
            "sftp" => Verb::Sftp,
            "define" => Verb::Define,
            other => Verb::Other(other.to_string()),
        }
    }

    pub fn exits_context(&self) -> bool {
        matches!(self, Verb::Exit | Verb::Quit | Verb::Bye)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Shell,
    Sftp,
    /// Placeholder expanded into concrete commands when it reaches the head
    Define { inner: String },
    /// Idle sentinel heading an empty buffer
    EndOfSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextTransition {
    Enter { context_type: String },
    Exit,
}

/// Work the manager performs when a command finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishAction {
    /// Read the remote working directory from the output
    ParsePwd,
    /// Report a downloaded file
    OpenFile(PathBuf),
}

pub type FinishCallback = Box<dyn FnOnce(&OutputStream)>;

/// Where a command is being issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scope {
    pub in_sftp: bool,
    /// Context below the current one is also SFTP
    pub parent_in_sftp: bool,
}

pub struct Command {
    id: u64,
    text: String,
    eol: String,
    tokens: Vec<String>,
    verb: Verb,
    kind: CommandKind,
    prompt: PromptMatcher,
    transition: Option<ContextTransition>,
    loggable: bool,
    takes_input: bool,
    writes_to_process: bool,
    finish_action: Option<FinishAction>,
    callback: Option<FinishCallback>,
}

impl Command {
    fn with_tokens(text: &str, tokens: Vec<String>, kind: CommandKind, prompt: PromptMatcher) -> Self {
        let verb = tokens
            .first()
            .map(|name| Verb::from_name(name))
            .unwrap_or_else(|| Verb::Other(String::new()));
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            text: text.to_string(),
            eol: text[text.trim_end().len()..].to_string(),
            tokens,
            verb,
            kind,
            prompt,
            transition: None,
            loggable: true,
            takes_input: true,
            writes_to_process: true,
            finish_action: None,
            callback: None,
        }
    }

    /// Wrap raw user input for later expansion.
    ///
    /// The text is validated now so malformed input never reaches the
    /// buffer.
    pub fn define(inner: &str) -> Result<Self, CommandError> {
        tokenize(inner)?;
        let text = format!("define {}", inner);
        let tokens = tokenize(&text)?;
        let mut command = Self::with_tokens(
            &text,
            tokens,
            CommandKind::Define {
                inner: inner.to_string(),
            },
            PromptMatcher::MatchImmediately,
        );
        command.takes_input = false;
        command.writes_to_process = false;
        Ok(command)
    }

    /// Idle sentinel heading an empty buffer
    pub fn end_of_session(rules: &PromptRules) -> Self {
        let mut command = Self::with_tokens(
            "",
            Vec::new(),
            CommandKind::EndOfSession,
            rules.end_of_session_matcher(),
        );
        command.takes_input = false;
        command.writes_to_process = false;
        command.transition = Some(ContextTransition::Exit);
        command
    }

    /// Replace the text (and words) sent to the process
    pub fn with_text(mut self, text: &str) -> Result<Self, CommandError> {
        self.tokens = tokenize(text)?;
        self.text = text.to_string();
        self.eol = text[text.trim_end().len()..].to_string();
        Ok(self)
    }

    pub fn non_loggable(mut self) -> Self {
        self.loggable = false;
        self
    }

    /// Already running: registered for attribution, never written
    pub fn starting(mut self) -> Self {
        self.writes_to_process = false;
        self
    }

    pub fn with_finish_action(mut self, action: FinishAction) -> Self {
        self.finish_action = Some(action);
        self
    }

    /// Run `callback` with the command's output once it finishes
    pub fn on_finish(mut self, callback: impl FnOnce(&OutputStream) + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text without the line terminator
    pub fn command_text(&self) -> &str {
        self.text.trim_end()
    }

    pub fn eol(&self) -> &str {
        &self.eol
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn name(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or("")
    }

    pub fn args(&self) -> &[String] {
        self.tokens.get(1..).unwrap_or(&[])
    }

    pub fn verb(&self) -> &Verb {
        &self.verb
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn prompt(&self) -> &PromptMatcher {
        &self.prompt
    }

    pub fn transition(&self) -> Option<&ContextTransition> {
        self.transition.as_ref()
    }

    pub fn is_loggable(&self) -> bool {
        self.loggable
    }

    /// An interactive prompt may be waiting on this command
    pub fn takes_input(&self) -> bool {
        self.takes_input
    }

    pub fn writes_to_process(&self) -> bool {
        self.writes_to_process
    }

    pub fn finish_action(&self) -> Option<&FinishAction> {
        self.finish_action.as_ref()
    }

    pub fn take_callback(&mut self) -> Option<FinishCallback> {
        self.callback.take()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("text", &self.text)
            .field("verb", &self.verb)
            .field("kind", &self.kind)
            .field("prompt", &self.prompt)
            .field("transition", &self.transition)
            .field("loggable", &self.loggable)
            .field("finish_action", &self.finish_action)
            .finish()
    }
}

/// Classify a line of input as a concrete command for `scope`
pub fn create_command_from_text(
    text: &str,
    scope: Scope,
    rules: &PromptRules,
) -> Result<Command, CommandError> {
    let tokens = tokenize(text)?;
    let verb = Verb::from_name(&tokens[0]);

    if verb == Verb::Define {
        let inner = text.trim_start();
        let inner = inner[tokens[0].len().min(inner.len())..].trim_start();
        return Command::define(inner);
    }

    let mut command = if scope.in_sftp {
        let mut command = Command::with_tokens(text, tokens, CommandKind::Sftp, rules.sftp.clone());
        command.takes_input = false;
        command
    } else {
        Command::with_tokens(text, tokens, CommandKind::Shell, rules.shell.clone())
    };

    if scope.in_sftp && verb.exits_context() {
        command.transition = Some(ContextTransition::Exit);
        command.prompt = if scope.parent_in_sftp {
            rules.sftp.clone()
        } else {
            rules.shell.clone()
        };
    } else if !scope.in_sftp && verb == Verb::Sftp {
        command.transition = Some(ContextTransition::Enter {
            context_type: SFTP_CONTEXT.to_string(),
        });
        command.prompt = rules.sftp.clone();
    }

    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHELL: Scope = Scope {
        in_sftp: false,
        parent_in_sftp: false,
    };
    const SFTP: Scope = Scope {
        in_sftp: true,
        parent_in_sftp: false,
    };

    #[test]
    fn test_tokenize_words_and_quotes() {
        assert_eq!(tokenize("ls  -la\r").unwrap(), vec!["ls", "-la"]);
        assert_eq!(
            tokenize(r#"get "my file.txt" 'local dir'"#).unwrap(),
            vec!["get", "my file.txt", "local dir"]
        );
        assert_eq!(tokenize(r"cd my\ dir").unwrap(), vec!["cd", "my dir"]);
        assert_eq!(tokenize(r"get a C:\Users\me").unwrap(), vec!["get", "a", r"C:\Users\me"]);
        assert_eq!(tokenize(r#"echo """#).unwrap(), vec!["echo", ""]);
    }

    #[test]
    fn test_tokenize_errors() {
        assert_eq!(
            tokenize("  \r"),
            Err(CommandError::InvalidCommandText("  \r".to_string()))
        );
        assert_eq!(
            tokenize("echo \\"),
            Err(CommandError::UnterminatedEscape("echo \\".to_string()))
        );
        assert!(matches!(
            tokenize("echo \"open"),
            Err(CommandError::UnterminatedQuote(_))
        ));
    }

    #[test]
    fn test_verb_strips_exe() {
        assert_eq!(Verb::from_name("sftp.exe"), Verb::Sftp);
        assert_eq!(Verb::from_name("vim"), Verb::Other("vim".to_string()));
    }

    #[test]
    fn test_shell_command() {
        let rules = PromptRules::default();
        let command = create_command_from_text("ls -l\r", SHELL, &rules).unwrap();
        assert_eq!(command.kind(), &CommandKind::Shell);
        assert_eq!(command.eol(), "\r");
        assert_eq!(command.command_text(), "ls -l");
        assert_eq!(command.args(), &["-l".to_string()]);
        assert!(command.takes_input());
        assert!(command.transition().is_none());
    }

    #[test]
    fn test_sftp_enters_context() {
        let rules = PromptRules::default();
        let command = create_command_from_text("sftp user@host\r", SHELL, &rules).unwrap();
        assert_eq!(
            command.transition(),
            Some(&ContextTransition::Enter {
                context_type: SFTP_CONTEXT.to_string()
            })
        );
        assert_eq!(command.prompt().find("Connected.\nsftp> "), Some(11));
    }

    #[test]
    fn test_exit_uses_parent_prompt() {
        let rules = PromptRules::default();
        let command = create_command_from_text("bye\r", SFTP, &rules).unwrap();
        assert_eq!(command.transition(), Some(&ContextTransition::Exit));
        assert!(!command.takes_input());
        assert_eq!(command.prompt().find("user@host:~$ "), Some(0));

        let nested = Scope {
            in_sftp: true,
            parent_in_sftp: true,
        };
        let command = create_command_from_text("exit\r", nested, &rules).unwrap();
        assert_eq!(command.prompt().find("user@host:~$ "), None);
    }

    #[test]
    fn test_exit_in_shell_is_plain() {
        let rules = PromptRules::default();
        let command = create_command_from_text("exit\r", SHELL, &rules).unwrap();
        assert!(command.transition().is_none());
    }

    #[test]
    fn test_define() {
        let rules = PromptRules::default();
        let command = create_command_from_text("define  ls -l\r", SHELL, &rules).unwrap();
        assert_eq!(
            command.kind(),
            &CommandKind::Define {
                inner: "ls -l\r".to_string()
            }
        );
        assert!(!command.writes_to_process());
        assert!(matches!(command.prompt(), PromptMatcher::MatchImmediately));
        assert!(Command::define("\r").is_err());
    }

    #[test]
    fn test_callback_taken_once() {
        let rules = PromptRules::default();
        let mut command = create_command_from_text("pwd\r", SHELL, &rules)
            .unwrap()
            .on_finish(|_| {});
        assert!(command.take_callback().is_some());
        assert!(command.take_callback().is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Command::define("ls").unwrap();
        let b = Command::define("ls").unwrap();
        assert_ne!(a.id(), b.id());
    }
}
