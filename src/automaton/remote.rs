//! Driving an automaton from a live process
//!
//! Scripts talk to the process through [`RemoteControl`]; process output
//! comes back as [`RemoteEvent`]s on a channel. [`ScriptRunner`] feeds
//! those into the automaton and fires wait timers.

use log::{debug, info};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use super::{Automaton, AutomatonError, Symbol};

/// Operations a script may perform on the process it drives
pub trait RemoteControl {
    /// Send raw text; `password` keeps it out of logs
    fn write(&self, data: &str, password: bool);
    /// Send a command line followed by the line ending
    fn execute(&self, command: &str);
    /// Interrupt whatever is running
    fn stop_command(&self);
    fn change_eol(&self, eol: &str);
}

#[derive(Debug)]
pub enum RemoteEvent {
    Data(Symbol),
    Exit(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// An end state was reached
    Finished,
    /// The process went away first
    Exited(i32),
    /// Event channel closed
    Disconnected,
}

/// Command output with blank lines and prompt lines removed
pub fn extract_output(text: &str, prompt: &Regex) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !prompt.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct ScriptRunner {
    automaton: Automaton,
    events: mpsc::UnboundedReceiver<RemoteEvent>,
}

impl ScriptRunner {
    pub fn new(automaton: Automaton, events: mpsc::UnboundedReceiver<RemoteEvent>) -> Self {
        Self { automaton, events }
    }

    pub fn automaton(&self) -> &Automaton {
        &self.automaton
    }

    pub fn into_automaton(self) -> Automaton {
        self.automaton
    }

    /// Run until an end state, process exit, or channel close
    pub async fn run(&mut self) -> Result<RunOutcome, AutomatonError> {
        self.automaton.input(None).await?;

        loop {
            if self.automaton.is_accepting() && !self.automaton.is_waiting() {
                info!("Script finished");
                return Ok(RunOutcome::Finished);
            }

            let deadline = self.automaton.wait_deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(RemoteEvent::Data(symbol)) => {
                        self.automaton.input(Some(symbol)).await?;
                    }
                    Some(RemoteEvent::Exit(code)) => {
                        info!("Process exited with {} during script", code);
                        return Ok(RunOutcome::Exited(code));
                    }
                    None => return Ok(RunOutcome::Disconnected),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!("Wait timer fired");
                    self.automaton.finish_wait().await?;
                }
            }
        }
    }
}
