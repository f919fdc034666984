//! VT escape sequence parser
//!
//! Implements vte crate's Perform trait
//! and applies parsed results to the screen buffer.
//!
//! Printable characters are collected into a single run and flushed
//! before any other instruction, so one `print` reaches the buffer per
//! stretch of plain text.

use log::trace;
use vte::{Params, Perform};

use super::screen::ScreenBuffer;

/// vte::Perform implementation
/// Holds reference to ScreenBuffer and directly applies parsed results
pub struct Performer<'a> {
    pub screen: &'a mut ScreenBuffer,
    /// Printable text not yet handed to the screen
    text: String,
    /// DCS payload collected between hook and unhook
    dcs: &'a mut Option<String>,
}

impl<'a> Performer<'a> {
    pub fn new(screen: &'a mut ScreenBuffer, dcs: &'a mut Option<String>) -> Self {
        Self {
            screen,
            text: String::new(),
            dcs,
        }
    }

    /// Hand pending text to the screen
    pub fn flush(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.screen.print(&text);
        }
    }
}

fn intermediates_str(intermediates: &[u8]) -> String {
    String::from_utf8_lossy(intermediates).into_owned()
}

impl<'a> Perform for Performer<'a> {
    /// Handle printable character
    fn print(&mut self, c: char) {
        self.text.push(c);
    }

    /// Handle C0/C1 control character
    fn execute(&mut self, byte: u8) {
        self.flush();
        self.screen.execute(byte);
    }

    /// Handle CSI sequence
    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        self.flush();
        let params: Vec<Vec<u16>> = params.iter().map(|p| p.to_vec()).collect();
        self.screen
            .csi(&intermediates_str(intermediates), &params, action);
    }

    /// Handle ESC sequence
    fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
        self.flush();
        trace!("ESC {:?} {}", intermediates, byte as char);
        self.screen.esc(&intermediates_str(intermediates), byte);
    }

    /// DCS start
    fn hook(&mut self, params: &Params, intermediates: &[u8], _ignore: bool, action: char) {
        self.flush();
        let params: Vec<u16> = params.iter().flatten().copied().collect();
        self.screen
            .dcs_hook(&intermediates_str(intermediates), &params, action);
        *self.dcs = Some(String::new());
    }

    /// DCS data
    fn put(&mut self, byte: u8) {
        if let Some(ref mut buffer) = self.dcs {
            buffer.push(byte as char);
        }
    }

    /// DCS end
    fn unhook(&mut self) {
        if let Some(buffer) = self.dcs.take() {
            if !buffer.is_empty() {
                self.screen.dcs_put(&buffer);
            }
        }
        self.screen.dcs_unhook();
    }

    /// Handle OSC sequence
    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        self.flush();
        self.screen.osc(params);
    }
}
