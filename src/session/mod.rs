//! Session glue
//!
//! A [`Session`] owns the child process, the terminal that parses its
//! output, and the context manager that attributes that output to
//! commands. Callers push input lines in and poll correspondence events
//! out; nothing here blocks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::rc::Rc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::{debug, info, trace};

use crate::automaton::remote::RemoteControl;
use crate::command::prompt::PromptRules;
use crate::command::tokenize;
use crate::config::Config;
use crate::context::{ContextManager, Correspondence, ManagerEvent};
use crate::terminal::pty::Pty;
use crate::terminal::Terminal;

const READ_BUFFER_SIZE: usize = 4096;

/// The child side of a session
pub trait ProcessIo {
    /// Non-blocking read; `Ok(0)` when nothing is available
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Exit code once the process has exited
    fn try_wait(&mut self) -> Option<i32>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;
    /// Interrupt the foreground command (Ctrl-C)
    fn interrupt(&mut self);
    fn kill(&mut self);
}

impl ProcessIo for Pty {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Pty::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        Pty::write(self, data).map(|_| ())
    }

    fn try_wait(&mut self) -> Option<i32> {
        Pty::try_wait(self)
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.set_size(cols, rows)
    }

    fn interrupt(&mut self) {
        Pty::interrupt(self)
    }

    fn kill(&mut self) {
        Pty::kill(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Output {
        received_at: DateTime<Local>,
        correspondence: Correspondence,
    },
    Exited(i32),
}

/// Requests queued by a script, applied by [`Session::apply_controls`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Write { text: String, password: bool },
    Execute(String),
    Stop,
    ChangeEol(String),
}

/// [`RemoteControl`] handle that queues requests for a session
#[derive(Debug, Clone, Default)]
pub struct ControlQueue {
    queue: Rc<RefCell<VecDeque<Control>>>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<Control> {
        self.queue.borrow_mut().drain(..).collect()
    }

    fn push(&self, control: Control) {
        self.queue.borrow_mut().push_back(control);
    }
}

impl RemoteControl for ControlQueue {
    fn write(&self, data: &str, password: bool) {
        self.push(Control::Write {
            text: data.to_string(),
            password,
        });
    }

    fn execute(&self, command: &str) {
        self.push(Control::Execute(command.to_string()));
    }

    fn stop_command(&self) {
        self.push(Control::Stop);
    }

    fn change_eol(&self, eol: &str) {
        self.push(Control::ChangeEol(eol.to_string()));
    }
}

pub struct Session<P: ProcessIo = Pty> {
    process: P,
    terminal: Terminal,
    manager: ContextManager,
    /// Line ending appended to submitted lines
    eol: String,
    exit_code: Option<i32>,
    events: Vec<SessionEvent>,
    read_buf: Vec<u8>,
}

impl Session<Pty> {
    /// Spawn `command_line` on a new pty
    pub fn spawn(command_line: &str, config: &Config) -> Result<Self> {
        let tokens = tokenize(command_line)?;
        let (program, args) = tokens
            .split_first()
            .with_context(|| format!("No program in {:?}", command_line))?;

        let pty = Pty::spawn(
            program,
            args,
            config.terminal.cols,
            config.terminal.rows,
            &config.terminal.term_env,
            &[("CORTERM".to_string(), env!("CARGO_PKG_VERSION").to_string())],
        )
        .with_context(|| format!("Failed to spawn {:?}", command_line))?;

        Self::with_process(pty, command_line, config)
    }
}

impl<P: ProcessIo> Session<P> {
    /// Wrap an already running process started from `command_line`
    pub fn with_process(process: P, command_line: &str, config: &Config) -> Result<Self> {
        let rules = PromptRules::from_config(&config.prompts).context("Invalid prompt rules")?;
        let mut manager =
            ContextManager::new(rules).with_temp_root(config.session.temp_dir.clone());
        manager.start_session(command_line)?;

        let mut session = Self {
            process,
            terminal: Terminal::new(config.terminal.cols.into(), config.terminal.rows.into()),
            manager,
            eol: config.terminal.eol.clone(),
            exit_code: None,
            events: Vec::new(),
            read_buf: vec![0; READ_BUFFER_SIZE],
        };
        session.dispatch()?;
        Ok(session)
    }

    pub fn manager(&self) -> &ContextManager {
        &self.manager
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn eol(&self) -> &str {
        &self.eol
    }

    /// Submit a line typed by the user. Malformed lines are rejected
    /// before anything reaches the process.
    pub fn send_input(&mut self, line: &str) -> Result<()> {
        let text = format!("{}{}", line, self.eol);
        self.manager.buffer_input(&text)?;
        self.dispatch()
    }

    /// Write raw bytes, bypassing command tracking
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.process.write(data)
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.terminal.resize(cols.into(), rows.into());
        self.process.resize(cols, rows)
    }

    /// Read whatever output is available, attribute it, and return the
    /// resulting events in order
    pub fn poll(&mut self) -> Result<Vec<SessionEvent>> {
        if self.exit_code.is_none() {
            loop {
                let n = self.process.read(&mut self.read_buf)?;
                if n == 0 {
                    break;
                }
                trace!("Read {} bytes", n);
                let stream = self.terminal.parse_raw_output(&self.read_buf[..n]);
                self.manager.receive_output(&stream)?;
                self.dispatch()?;
            }

            if let Some(code) = self.process.try_wait() {
                info!("Session process exited: {}", code);
                self.exit_code = Some(code);
                self.manager.on_process_exit(code);
                self.dispatch()?;
                self.events.push(SessionEvent::Exited(code));
            }
        }
        Ok(mem::take(&mut self.events))
    }

    /// Perform requests queued by a script
    pub fn apply_controls(&mut self, controls: &ControlQueue) -> Result<()> {
        for control in controls.drain() {
            match control {
                Control::Write { text, password } => {
                    if password {
                        debug!("Writing {} hidden bytes", text.len());
                    } else {
                        debug!("Writing {:?}", text);
                    }
                    self.process.write(text.as_bytes())?;
                }
                Control::Execute(command) => self.send_input(&command)?,
                Control::Stop => self.process.interrupt(),
                Control::ChangeEol(eol) => {
                    debug!("Line ending now {:?}", eol);
                    self.eol = eol;
                }
            }
        }
        Ok(())
    }

    pub fn kill(&mut self) {
        if self.exit_code.is_none() {
            self.process.kill();
        }
    }

    /// Carry out the manager's queued side effects
    fn dispatch(&mut self) -> Result<()> {
        for event in self.manager.take_events() {
            match event {
                ManagerEvent::Write(text) => {
                    trace!("Sending {:?}", text);
                    self.process
                        .write(text.as_bytes())
                        .context("Failed to write to session process")?;
                }
                ManagerEvent::Output(correspondence) => {
                    self.events.push(SessionEvent::Output {
                        received_at: Local::now(),
                        correspondence,
                    });
                }
            }
        }
        Ok(())
    }
}
