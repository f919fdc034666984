//! Terminal emulation
//!
//! Core module integrating the VT parser and the element-list screen
//! buffer. Raw process output goes in, [`OutputStream`] snapshots come out.

pub mod element;
pub mod parser;
pub mod pty;
pub mod screen;
pub mod stream;
pub mod style;

use log::trace;

use parser::Performer;
use screen::ScreenBuffer;
use stream::OutputStream;

/// Terminal state
pub struct Terminal {
    pub screen: ScreenBuffer,
    /// VT parser
    vt_parser: vte::Parser,
    /// DCS payload carried across chunks
    dcs: Option<String>,
}

impl Terminal {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            screen: ScreenBuffer::new(cols, rows),
            vt_parser: vte::Parser::new(),
            dcs: None,
        }
    }

    pub fn resize(&mut self, cols: usize, rows: usize) {
        self.screen.resize(cols, rows);
    }

    /// Feed raw bytes through the parser.
    ///
    /// Text collected from this chunk is flushed at the end, so a run
    /// never spans two chunks.
    pub fn feed(&mut self, data: &[u8]) {
        trace!("Terminal feed: {} bytes", data.len());
        let mut performer = Performer::new(&mut self.screen, &mut self.dcs);
        for &byte in data {
            self.vt_parser.advance(&mut performer, byte);
        }
        performer.flush();
    }

    pub fn stream_out(&mut self, continuous: bool) -> OutputStream {
        self.screen.stream_out(continuous)
    }

    /// Parse a chunk and export what it produced
    pub fn parse_raw_output(&mut self, data: &[u8]) -> OutputStream {
        self.feed(data);
        self.stream_out(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_output_exports_each_chunk() {
        let mut term = Terminal::new(80, 24);
        let first = term.parse_raw_output(b"ls\r\n");
        assert_eq!(first.plain_text(), "ls\n");
        let second = term.parse_raw_output(b"a.txt  b.txt\r\n$ ");
        assert_eq!(second.plain_text(), "a.txt  b.txt\n$ ");
        assert!(second.previous_ends_with_newline());
        assert!(!second.ends_with_newline());
    }

    #[test]
    fn test_sequence_split_across_chunks() {
        let mut term = Terminal::new(80, 24);
        term.feed(b"\x1b[3");
        term.feed(b"2mgreen");
        let run = term.screen.elements()[0].as_run().unwrap();
        assert_eq!(run.text, "green");
        assert_eq!(run.style.classes, "fg2");
    }
}
