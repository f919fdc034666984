//! Script builder
//!
//! Linear scripting on top of [`Automaton`]: each call appends a state
//! after the current one, `if_`/`else_`/`endif` open and join branches.
//!
//! ```ignore
//! let mut script = Script::with_remote(remote);
//! script.write_on_prompt("ls", WriteOptions::default())?;
//! script.if_(Condition::predicate("empty", |t| t.is_some_and(str::is_empty)))?;
//! script.write("echo nothing", WriteOptions::default())?;
//! script.endif()?;
//! script.end()?;
//! let automaton = script.build()?;
//! ```

use std::panic::Location;
use std::rc::Rc;

use regex::Regex;

use super::condition::Condition;
use super::remote::{extract_output, RemoteControl};
use super::{Action, Automaton, AutomatonError, OnDuplicate, StateId, WaitTime};

/// Prompt recognised by `on_prompt`, `write_on_prompt` and `get_input`
pub const DEFAULT_PROMPT: &str = r"(?m)^.+[>$]\s*$";

/// Text to write, fixed or computed when the step runs
#[derive(Clone)]
pub enum WriteData {
    Fixed(String),
    Dynamic(Rc<dyn Fn() -> String>),
}

impl WriteData {
    fn resolve(&self) -> String {
        match self {
            WriteData::Fixed(s) => s.clone(),
            WriteData::Dynamic(f) => f(),
        }
    }
}

impl From<&str> for WriteData {
    fn from(s: &str) -> Self {
        WriteData::Fixed(s.to_string())
    }
}

impl From<String> for WriteData {
    fn from(s: String) -> Self {
        WriteData::Fixed(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Keep the text out of logs and echo
    pub password: bool,
    /// Line ending to switch to before writing
    pub eol: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Root,
    If,
}

struct Frame {
    kind: FrameKind,
    /// State the branches fork from
    root: Option<StateId>,
    /// Last state of the branch being built
    pointer: Option<StateId>,
    /// Finished branch tails waiting to be joined
    tails: Vec<StateId>,
}

pub struct Script {
    automaton: Automaton,
    frames: Vec<Frame>,
    remote: Option<Rc<dyn RemoteControl>>,
    prompt: Regex,
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

impl Script {
    pub fn new() -> Self {
        Self {
            automaton: Automaton::new(),
            frames: vec![Frame {
                kind: FrameKind::Root,
                root: None,
                pointer: None,
                tails: Vec::new(),
            }],
            remote: None,
            prompt: Regex::new(DEFAULT_PROMPT).expect("default prompt pattern is valid"),
        }
    }

    pub fn with_remote(remote: Rc<dyn RemoteControl>) -> Self {
        let mut script = Self::new();
        script.remote = Some(remote);
        script
    }

    pub fn set_prompt(&mut self, prompt: Regex) {
        self.prompt = prompt;
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    fn frame(&mut self) -> &mut Frame {
        // The root frame is never popped
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    #[track_caller]
    fn pointer(&mut self) -> StateId {
        if let Some(pointer) = self.frame().pointer {
            return pointer;
        }
        let start = self
            .automaton
            .add_state("start", "START", Some(Location::caller()));
        let frame = self.frame();
        frame.root = Some(start);
        frame.pointer = Some(start);
        start
    }

    #[track_caller]
    fn add_step(
        &mut self,
        from: Option<StateId>,
        condition: Condition,
        action: Option<Action>,
        description: &str,
    ) -> Result<StateId, AutomatonError> {
        let location = Location::caller();
        let from = match from {
            Some(from) => from,
            None => self.pointer(),
        };
        let name = format!("s{}", self.automaton.len());
        let id = self.automaton.add_state(&name, description, Some(location));
        if let Some(action) = action {
            self.automaton.set_arrival_action(id, action)?;
        }
        self.automaton
            .add_transition(from, condition, id, None, OnDuplicate::Error)?;
        self.frame().pointer = Some(id);
        Ok(id)
    }

    fn remote(&self) -> Result<Rc<dyn RemoteControl>, AutomatonError> {
        self.remote.clone().ok_or(AutomatonError::NoRemoteControl)
    }

    /// Run `action` right after the previous step
    #[track_caller]
    pub fn step(&mut self, action: Action) -> Result<StateId, AutomatonError> {
        self.add_step(None, Condition::Always, Some(action), "DO")
    }

    /// Run `action` once `condition` holds
    #[track_caller]
    pub fn step_on(
        &mut self,
        condition: impl Into<Condition>,
        action: Option<Action>,
    ) -> Result<StateId, AutomatonError> {
        self.add_step(None, condition.into(), action, "DO ON")
    }

    /// Open a branch; the condition must not consume input
    #[track_caller]
    pub fn if_(&mut self, condition: Condition) -> Result<StateId, AutomatonError> {
        if condition.consumes() {
            return Err(AutomatonError::ConsumingCondition(condition.key()));
        }
        let root = self.pointer();
        self.frames.push(Frame {
            kind: FrameKind::If,
            root: Some(root),
            pointer: Some(root),
            tails: Vec::new(),
        });
        self.add_step(Some(root), condition, None, "IF")
    }

    /// Start the alternative branch; `None` means unconditional
    #[track_caller]
    pub fn else_(&mut self, condition: Option<Condition>) -> Result<StateId, AutomatonError> {
        let condition = condition.unwrap_or(Condition::Always);
        if condition.consumes() {
            return Err(AutomatonError::ConsumingCondition(condition.key()));
        }
        let frame = self.frame();
        if frame.kind != FrameKind::If {
            return Err(AutomatonError::ElseWithoutIf);
        }
        let (Some(root), Some(tail)) = (frame.root, frame.pointer) else {
            return Err(AutomatonError::ElseWithoutIf);
        };
        frame.tails.push(tail);
        self.add_step(Some(root), condition, None, "ELSE")
    }

    /// Join all branches of the innermost `if_`. Without an unconditional
    /// `else_` the fork state falls through to the join.
    #[track_caller]
    pub fn endif(&mut self) -> Result<StateId, AutomatonError> {
        if self.frame().kind != FrameKind::If {
            return Err(AutomatonError::EndifWithoutIf);
        }
        let Some(mut frame) = self.frames.pop() else {
            return Err(AutomatonError::EndifWithoutIf);
        };
        let root = frame.root.ok_or(AutomatonError::EndifWithoutIf)?;
        frame.tails.extend(frame.pointer);

        let join = self
            .automaton
            .add_state(&format!("s{}", self.automaton.len()), "ENDIF", Some(Location::caller()));
        self.automaton
            .add_transition(root, Condition::Always, join, None, OnDuplicate::Ignore)?;
        for tail in frame.tails {
            self.automaton
                .add_transition(tail, Condition::Always, join, None, OnDuplicate::Ignore)?;
        }
        self.frame().pointer = Some(join);
        Ok(join)
    }

    /// Jump to `target`, on `condition` or unconditionally. The current
    /// step stays where it is.
    #[track_caller]
    pub fn goto(
        &mut self,
        target: StateId,
        condition: Option<Condition>,
    ) -> Result<StateId, AutomatonError> {
        let location = Location::caller();
        let from = self.pointer();
        let hop = self
            .automaton
            .add_state(&format!("s{}", self.automaton.len()), "GOTO", Some(location));
        self.automaton.add_transition(
            from,
            condition.unwrap_or(Condition::Always),
            hop,
            None,
            OnDuplicate::Error,
        )?;
        self.automaton
            .add_transition(hop, Condition::Always, target, None, OnDuplicate::Error)?;
        Ok(hop)
    }

    #[track_caller]
    pub fn end(&mut self) -> Result<StateId, AutomatonError> {
        let id = self.add_step(None, Condition::Always, None, "END")?;
        self.automaton.mark_end(id)?;
        Ok(id)
    }

    /// Pause; output arriving meanwhile is handled after the pause
    #[track_caller]
    pub fn wait(&mut self, time: impl Into<WaitTime>) -> Result<StateId, AutomatonError> {
        let id = self.add_step(None, Condition::Always, None, "WAIT")?;
        self.automaton.set_wait(id, time.into())?;
        Ok(id)
    }

    #[track_caller]
    pub fn on_prompt(&mut self, action: Option<Action>) -> Result<StateId, AutomatonError> {
        let prompt = Condition::Pattern(self.prompt.clone());
        self.add_step(None, prompt, action, "ON PROMPT")
    }

    fn write_action(&self, data: WriteData, options: WriteOptions) -> Result<Action, AutomatonError> {
        let remote = self.remote()?;
        Ok(Action::sync(move |_| {
            if let Some(eol) = &options.eol {
                remote.change_eol(eol);
            }
            remote.write(&data.resolve(), options.password);
            None
        }))
    }

    #[track_caller]
    pub fn write(
        &mut self,
        data: impl Into<WriteData>,
        options: WriteOptions,
    ) -> Result<StateId, AutomatonError> {
        let action = self.write_action(data.into(), options)?;
        self.add_step(None, Condition::Always, Some(action), "WRITE")
    }

    #[track_caller]
    pub fn write_on_prompt(
        &mut self,
        data: impl Into<WriteData>,
        options: WriteOptions,
    ) -> Result<StateId, AutomatonError> {
        let action = self.write_action(data.into(), options)?;
        let prompt = Condition::Pattern(self.prompt.clone());
        self.add_step(None, prompt, Some(action), "WRITE ON PROMPT")
    }

    /// Run a command line through the remote
    #[track_caller]
    pub fn execute(&mut self, command: &str) -> Result<StateId, AutomatonError> {
        let remote = self.remote()?;
        let command = command.to_string();
        let action = Action::sync(move |_| {
            remote.execute(&command);
            None
        });
        self.add_step(None, Condition::Always, Some(action), "EXECUTE")
    }

    /// Capture the output up to the next prompt. The text (prompt lines
    /// removed) becomes the value of the returned state.
    #[track_caller]
    pub fn get_input(&mut self) -> Result<StateId, AutomatonError> {
        let prompt = self.prompt.clone();
        let action = Action::sync(move |input| {
            Some(extract_output(input.text.as_deref().unwrap_or(""), &prompt))
        });
        let condition = Condition::Pattern(self.prompt.clone());
        self.add_step(None, condition, Some(action), "GET INPUT")
    }

    pub fn build(mut self) -> Result<Automaton, AutomatonError> {
        let open = self.frames.len() - 1;
        if open > 0 {
            return Err(AutomatonError::UnclosedIf(open));
        }
        self.pointer();
        self.automaton.reset();
        Ok(self.automaton)
    }
}
