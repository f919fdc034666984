//! Element-list screen buffer
//!
//! Instead of a cell grid, output is kept as an append-only list of text
//! runs and action markers. Cursor addressing is approximated: moves that
//! would rewrite content that was already exported are replaced with a
//! fallback marker, and moves over blank trailing content are deferred
//! until the next print so their effect can be judged against what is
//! actually written.

use log::{debug, trace};

use super::element::{ActionArgs, ActionKind, ActionMarker, OutputElement, TextRun};
use super::stream::OutputStream;
use super::style::{get_styles, Attributes};

/// Location of a screen coordinate inside the element list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    /// Text element holding the coordinate (`None` when past the end)
    pub element_index: Option<usize>,
    pub line_index: usize,
    /// Column within the line, in chars
    pub col_index: usize,
    /// Offset within the element text, in chars (line breaks included)
    pub char_index: usize,
    /// Columns missing past the end of the located line
    pub trailing_col: usize,
    /// Rows missing past the end of the buffer
    pub trailing_row: usize,
}

/// Cursor movement waiting for the next print
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingCursorMove {
    Backspace,
    /// Truncate blank content after the target and continue from there
    Overwrite {
        row: usize,
        col: usize,
        element_index: usize,
        char_index: usize,
        trailing_col: usize,
        non_blank_to_overwrite: usize,
    },
    /// Pad past the end of the buffer
    Extend {
        trailing_row: usize,
        trailing_col: usize,
    },
}

pub struct ScreenBuffer {
    cols: usize,
    rows: usize,
    elements: Vec<OutputElement>,
    /// End of the most recent export; nothing before it is mutated again
    stream_tail: usize,
    /// Start of the block a continuous export re-sends
    merged_tail: usize,
    pending_move: Option<PendingCursorMove>,
    attrs: Attributes,
    title: Option<String>,
    pub bell_count: usize,
}

fn is_blank(text: &str) -> bool {
    text.chars().all(char::is_whitespace)
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

impl ScreenBuffer {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            elements: Vec::new(),
            stream_tail: 0,
            merged_tail: 0,
            pending_move: None,
            attrs: Attributes::default(),
            title: None,
            bell_count: 0,
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn resize(&mut self, cols: usize, rows: usize) {
        self.cols = cols;
        self.rows = rows;
    }

    pub fn elements(&self) -> &[OutputElement] {
        &self.elements
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    pub fn stream_tail(&self) -> usize {
        self.stream_tail
    }

    pub fn merged_tail(&self) -> usize {
        self.merged_tail
    }

    fn push(&mut self, element: impl Into<OutputElement>) {
        self.elements.push(element.into());
    }

    fn styled_run(&self, text: impl Into<String>) -> TextRun {
        TextRun::new(
            text,
            get_styles(&self.attrs, false),
            self.attrs.style_key(false),
        )
    }

    fn remove_last_element(&mut self) {
        self.elements.pop();
        self.stream_tail = self.stream_tail.min(self.elements.len());
    }

    /// Print a run of text, resolving any deferred cursor movement first
    pub fn print(&mut self, text: &str) {
        if let Some(pending) = self.pending_move.take() {
            self.apply_cursor_move(pending, text);
        }
        let run = self.styled_run(text);
        self.push(run);
    }

    /// Handle a C0 control
    pub fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' => self.print("\n"),
            b'\t' => self.print("\t"),
            0x07 => {
                trace!("Bell");
                self.bell_count += 1;
            }
            0x08 => self.pending_move = Some(PendingCursorMove::Backspace),
            b'\r' => {
                let marker = ActionMarker::new(ActionKind::ExecuteControl, ActionArgs::Control(byte))
                    .fallback("\\r")
                    .describe("\\r");
                self.push(marker);
            }
            _ => {
                trace!("Unhandled control character: 0x{:02x}", byte);
                let marker = ActionMarker::new(ActionKind::ExecuteControl, ActionArgs::Control(byte))
                    .unhandled(format!("\"{}\"", (byte as char).escape_default()))
                    .describe("Unknown control character");
                self.push(marker);
            }
        }
    }

    /// Handle a CSI sequence
    pub fn csi(&mut self, intermediates: &str, params: &[Vec<u16>], action: char) {
        let first = |default: u16| {
            params
                .first()
                .and_then(|p| p.first())
                .copied()
                .filter(|&v| v != 0)
                .unwrap_or(default)
        };

        match (intermediates, action) {
            ("", 'm') => self.attrs.apply_sgr(params),
            ("", 'J') => {
                let mode = params.first().and_then(|p| p.first()).copied().unwrap_or(0);
                self.erase_display(mode);
            }
            ("", 'X') => self.erase_chars(first(1) as usize),
            ("", 'H') | ("", 'f') => {
                let row = first(1) as usize - 1;
                let col = params
                    .get(1)
                    .and_then(|p| p.first())
                    .copied()
                    .filter(|&v| v != 0)
                    .unwrap_or(1) as usize
                    - 1;
                self.cursor_position(row, col);
            }
            // Private mode set/reset has no visible effect here
            ("?", 'h') | ("?", 'l') => {}
            _ => {
                let flat: Vec<u16> = params.iter().flatten().copied().collect();
                let joined = flat
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                let fallback = if intermediates.is_empty() {
                    format!("CSI({}, {})", joined, action)
                } else {
                    format!("CSI({}, {}, {})", intermediates, joined, action)
                };
                trace!("Unhandled CSI: {}", fallback);
                let marker = ActionMarker::new(
                    ActionKind::Csi,
                    ActionArgs::Sequence {
                        intermediates: intermediates.to_string(),
                        params: flat,
                        action,
                    },
                )
                .unhandled(fallback)
                .describe("Unhandled CSI sequence");
                self.push(marker);
            }
        }
    }

    /// Handle an OSC sequence (already split on `;`)
    pub fn osc(&mut self, params: &[&[u8]]) {
        let joined = params
            .iter()
            .map(|p| String::from_utf8_lossy(p))
            .collect::<Vec<_>>()
            .join(";");

        if matches!(params.first(), Some(&p) if p == b"0") {
            let title = joined.get(2..).unwrap_or("").to_string();
            debug!("Title set: {}", title);
            self.title = Some(title.clone());
            let marker = ActionMarker::new(ActionKind::SetTitle, ActionArgs::Text(title.clone()))
                .unhandled(format!("Set Title({})", title));
            self.push(marker);
        } else {
            let marker = ActionMarker::new(ActionKind::Osc, ActionArgs::Text(joined.clone()))
                .unhandled(format!("OSC({})", joined));
            self.push(marker);
        }
    }

    pub fn esc(&mut self, intermediates: &str, byte: u8) {
        self.push(ActionMarker::new(
            ActionKind::Esc,
            ActionArgs::Esc {
                intermediates: intermediates.to_string(),
                byte,
            },
        ));
    }

    pub fn dcs_hook(&mut self, intermediates: &str, params: &[u16], action: char) {
        self.push(ActionMarker::new(
            ActionKind::DcsHook,
            ActionArgs::Sequence {
                intermediates: intermediates.to_string(),
                params: params.to_vec(),
                action,
            },
        ));
    }

    pub fn dcs_put(&mut self, data: &str) {
        self.push(ActionMarker::new(
            ActionKind::DcsPut,
            ActionArgs::Text(data.to_string()),
        ));
    }

    pub fn dcs_unhook(&mut self) {
        self.push(ActionMarker::new(ActionKind::DcsUnhook, ActionArgs::None));
    }

    /// Drop every element and start over
    pub fn clear(&mut self) {
        self.elements.clear();
        self.stream_tail = 0;
        self.merged_tail = 0;
        self.pending_move = None;
    }

    /// ED (CSI n J)
    fn erase_display(&mut self, mode: u16) {
        let marker = ActionMarker::new(ActionKind::EraseDisplay, ActionArgs::EraseMode(mode));
        let marker = match mode {
            0 => marker.unhandled("Clear Below"),
            1 => marker.unhandled("Clear Above"),
            2 => {
                self.clear();
                marker.fallback("Clear Display")
            }
            _ => marker.unhandled(format!("Clear({})", mode)),
        };
        self.push(marker);
    }

    /// ECH (CSI n X)
    ///
    /// Only acts right after a fallback cursor move whose target lies in
    /// existing text; the characters there are blanked in place.
    fn erase_chars(&mut self, count: usize) {
        let Some(OutputElement::Marker(marker)) = self.elements.last() else {
            return;
        };
        let ActionArgs::Position { row, col } = marker.args else {
            return;
        };
        if marker.kind != ActionKind::CursorMove {
            return;
        }

        let pos = self.locate_position(row, col);
        let Some(idx) = pos.element_index else {
            return;
        };
        if pos.trailing_row != 0 || pos.trailing_col != 0 || idx < self.stream_tail {
            return;
        }
        let Some(run) = self.elements[idx].as_run_mut() else {
            return;
        };
        let line_len = run
            .text
            .split('\n')
            .nth(pos.line_index)
            .map(|l| l.chars().count())
            .unwrap_or(0);
        let n = count.min(line_len.saturating_sub(pos.col_index));
        if n == 0 {
            return;
        }
        let start = byte_offset(&run.text, pos.char_index);
        let end = byte_offset(&run.text, pos.char_index + n);
        run.text.replace_range(start..end, &" ".repeat(n));
    }

    fn total_line_breaks(&self) -> usize {
        self.elements
            .iter()
            .filter_map(OutputElement::as_run)
            .map(TextRun::line_breaks)
            .sum()
    }

    /// Map a visible (row, col) to an element position.
    ///
    /// Rows that scrolled off the top are skipped: row 0 is the first line
    /// of the last `rows` lines.
    pub fn locate_position(&self, row: usize, col: usize) -> Position {
        let offset = (self.total_line_breaks() + 1).saturating_sub(self.rows);
        let row = row + offset;
        let count = self.elements.len();
        let mut current_row = 0;
        let mut current_col = 0;

        for (i, element) in self.elements.iter().enumerate() {
            let Some(run) = element.as_run() else {
                continue;
            };
            let lines = run.lines();

            if current_row + lines.len() > row {
                let mut index = 0;
                for (j, line) in lines.iter().enumerate() {
                    let len = line.chars().count();
                    if current_row + j == row {
                        if current_col + len > col {
                            let col_index = col.saturating_sub(current_col);
                            return Position {
                                element_index: Some(i),
                                line_index: j,
                                col_index,
                                char_index: index + col_index,
                                trailing_col: 0,
                                trailing_row: 0,
                            };
                        }
                        // Row continues in a later element
                        if j == lines.len() - 1 && i < count - 1 {
                            current_col += len;
                            break;
                        }
                        return Position {
                            element_index: Some(i),
                            line_index: j,
                            col_index: len,
                            char_index: index + len,
                            trailing_col: col.saturating_sub(current_col + len),
                            trailing_row: 0,
                        };
                    }
                    index += len + 1;
                }
            }
            current_row += lines.len() - 1;
        }

        Position {
            element_index: None,
            trailing_col: col.saturating_sub(current_col),
            trailing_row: row.saturating_sub(current_row),
            ..Position::default()
        }
    }

    fn push_cursor_fallback(&mut self, row: usize, col: usize) {
        let marker = ActionMarker::new(ActionKind::CursorMove, ActionArgs::Position { row, col })
            .fallback(format!("Cursor Position({}, {})", row, col))
            .describe("Cursor Position");
        self.push(marker);
    }

    /// CUP (CSI row;col H), zero-based
    fn cursor_position(&mut self, row: usize, col: usize) {
        let pos = self.locate_position(row, col);
        let Some(idx) = pos.element_index else {
            self.pending_move = Some(PendingCursorMove::Extend {
                trailing_row: pos.trailing_row,
                trailing_col: pos.trailing_col,
            });
            return;
        };

        // Exported content is never rewritten
        if idx < self.stream_tail {
            self.push_cursor_fallback(row, col);
            return;
        }

        match self.blank_tail_after(idx, &pos) {
            Some(after) => {
                self.pending_move = Some(PendingCursorMove::Overwrite {
                    row,
                    col,
                    element_index: idx,
                    char_index: pos.char_index,
                    trailing_col: pos.trailing_col,
                    non_blank_to_overwrite: after.trim_end().chars().count(),
                });
            }
            None => self.push_cursor_fallback(row, col),
        }
    }

    /// Text from `pos` to the end of its row, provided every later line
    /// is blank and no marker follows.
    fn blank_tail_after(&self, idx: usize, pos: &Position) -> Option<String> {
        let run = self.elements[idx].as_run()?;
        let lines = run.lines();
        let mut after: String = lines[pos.line_index].chars().skip(pos.col_index).collect();
        let mut same_row = true;

        for line in &lines[pos.line_index + 1..] {
            if !is_blank(line) {
                return None;
            }
            same_row = false;
        }

        for element in &self.elements[idx + 1..] {
            let run = element.as_run()?;
            let lines = run.lines();
            let start = if same_row {
                after.push_str(lines[0]);
                1
            } else {
                0
            };
            for line in &lines[start..] {
                if !is_blank(line) {
                    return None;
                }
                same_row = false;
            }
        }

        Some(after)
    }

    fn apply_cursor_move(&mut self, pending: PendingCursorMove, message: &str) {
        match pending {
            PendingCursorMove::Backspace => self.apply_backspace(message),
            PendingCursorMove::Overwrite {
                row,
                col,
                element_index,
                char_index,
                trailing_col,
                non_blank_to_overwrite,
            } => {
                let valid = element_index >= self.stream_tail
                    && element_index < self.elements.len()
                    && message.chars().count() >= non_blank_to_overwrite;
                if !valid {
                    self.push_cursor_fallback(row, col);
                    return;
                }
                let Some(run) = self.elements[element_index].as_run_mut() else {
                    self.push_cursor_fallback(row, col);
                    return;
                };
                let cut = byte_offset(&run.text, char_index);
                run.text.truncate(cut);
                run.text.push_str(&" ".repeat(trailing_col));
                while self.elements.len() > element_index + 1 {
                    self.remove_last_element();
                }
            }
            PendingCursorMove::Extend {
                trailing_row,
                trailing_col,
            } => {
                if trailing_row == 0 && trailing_col == 0 {
                    return;
                }
                let padding = format!("{}{}", "\n".repeat(trailing_row), " ".repeat(trailing_col));
                let run = self.styled_run(padding);
                self.push(run);
            }
        }
    }

    fn apply_backspace(&mut self, message: &str) {
        if message.is_empty() {
            return;
        }
        for i in (self.stream_tail..self.elements.len()).rev() {
            let Some(run) = self.elements[i].as_run_mut() else {
                continue;
            };
            if run.text.is_empty() {
                continue;
            }
            // Cannot back up over a line break
            if run.last_line().is_empty() {
                break;
            }
            run.text.pop();
            return;
        }
        let marker = ActionMarker::new(ActionKind::ExecuteControl, ActionArgs::Control(0x08))
            .fallback("Backspace")
            .describe("Backspace");
        self.push(marker);
    }

    /// Export the elements produced since the last export.
    ///
    /// A fresh export (`continuous == false`) marks everything up to the
    /// previous tail as final. A continuous export re-sends from the
    /// final tail so that a consumer can replace its provisional copy.
    pub fn stream_out(&mut self, continuous: bool) -> OutputStream {
        let (slice_start, new_start) = if continuous {
            (
                self.merged_tail,
                self.stream_tail.saturating_sub(self.merged_tail),
            )
        } else {
            self.merged_tail = self.stream_tail;
            (self.stream_tail, 0)
        };
        let slice_start = slice_start.min(self.elements.len());
        let elements = self.elements[slice_start..].to_vec();
        self.stream_tail = self.elements.len();

        let ends_with_newline = elements
            .iter()
            .rev()
            .find_map(OutputElement::text)
            .map(|t| t.ends_with('\n'))
            .unwrap_or(false);
        let previous_ends_with_newline = self.elements[..slice_start]
            .iter()
            .rev()
            .find_map(OutputElement::text)
            .map(|t| t.ends_with('\n'))
            .unwrap_or(true);

        OutputStream::new(
            elements,
            new_start,
            previous_ends_with_newline,
            ends_with_newline,
        )
    }
}
