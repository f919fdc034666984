//! corterm - terminal front-end that attributes output to commands
//!
//! # Architecture
//!
//! ```text
//! child process (pty)
//!        │ bytes
//!        ▼
//! Terminal (vte → ScreenBuffer) ──► OutputStream
//!                                        │
//!                                        ▼
//!                     ContextManager (CommandBuffer + ContextStack)
//!                                        │
//!                                        ▼
//!                              Correspondence events
//! ```
//!
//! Scripts built with [`automaton::sugar::Script`] can drive a session
//! through the [`automaton::remote::RemoteControl`] trait.

pub mod automaton;
pub mod command;
pub mod config;
pub mod context;
pub mod session;
pub mod terminal;
