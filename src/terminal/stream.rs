//! Exported output streams
//!
//! An [`OutputStream`] is an immutable snapshot of a slice of the screen
//! buffer's elements together with the line-boundary flags needed to
//! stitch consecutive exports back together.

use std::cell::OnceCell;
use std::fmt;

use thiserror::Error;

use super::element::{OutputElement, TextRun};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("cannot join stream with new region at {other} onto stream whose new region starts at {start} of {len}")]
    InvalidStreamJoin {
        start: usize,
        len: usize,
        other: usize,
    },
}

#[derive(Clone, Default)]
pub struct OutputStream {
    elements: Vec<OutputElement>,
    /// Index of the first element not previously exported
    new_start: usize,
    previous_ends_with_newline: bool,
    ends_with_newline: bool,
    plain_text: OnceCell<String>,
}

impl OutputStream {
    pub fn new(
        elements: Vec<OutputElement>,
        new_start: usize,
        previous_ends_with_newline: bool,
        ends_with_newline: bool,
    ) -> Self {
        Self {
            elements,
            new_start,
            previous_ends_with_newline,
            ends_with_newline,
            plain_text: OnceCell::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, true, false)
    }

    /// Single unstyled run
    pub fn from_text(text: &str) -> Self {
        Self::new(
            vec![TextRun::plain(text).into()],
            0,
            true,
            text.ends_with('\n'),
        )
    }

    pub fn elements(&self) -> &[OutputElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn new_start_index(&self) -> usize {
        self.new_start
    }

    /// Elements exported for the first time
    pub fn new_elements(&self) -> &[OutputElement] {
        &self.elements[self.new_start.min(self.elements.len())..]
    }

    pub fn previous_ends_with_newline(&self) -> bool {
        self.previous_ends_with_newline
    }

    pub fn ends_with_newline(&self) -> bool {
        self.ends_with_newline
    }

    /// Concatenated text of every run
    pub fn plain_text(&self) -> &str {
        self.plain_text.get_or_init(|| {
            self.elements
                .iter()
                .filter_map(OutputElement::text)
                .collect()
        })
    }

    /// Whether the content before element `upper` ends with a newline
    fn prefix_ends_with_newline(&self, upper: usize) -> bool {
        if upper >= self.elements.len() {
            return self.ends_with_newline;
        }
        self.elements[..upper]
            .iter()
            .rev()
            .filter_map(OutputElement::text)
            .find(|text| !text.is_empty())
            .map(|text| text.ends_with('\n'))
            .unwrap_or(self.previous_ends_with_newline)
    }

    /// Sub-range of elements `[start, end)`
    pub fn slice(&self, start: usize, end: usize) -> OutputStream {
        let end = end.min(self.elements.len());
        let start = start.min(end);
        OutputStream::new(
            self.elements[start..end].to_vec(),
            self.new_start.saturating_sub(start).min(end - start),
            self.prefix_ends_with_newline(start),
            self.prefix_ends_with_newline(end),
        )
    }

    /// Concatenate `other` after this stream.
    ///
    /// Fails when both sides carry a partially-new region, since the
    /// result could not describe where new content starts.
    pub fn join(&self, other: &OutputStream) -> Result<OutputStream, StreamError> {
        let len = self.elements.len();
        if other.new_start != 0 && self.new_start < len {
            return Err(StreamError::InvalidStreamJoin {
                start: self.new_start,
                len,
                other: other.new_start,
            });
        }
        let mut elements = self.elements.clone();
        elements.extend(other.elements.iter().cloned());
        Ok(OutputStream::new(
            elements,
            other.new_start + self.new_start.min(len),
            self.previous_ends_with_newline,
            other.ends_with_newline,
        ))
    }

    /// Split at a byte offset of [`Self::plain_text`].
    ///
    /// A run straddling the offset is cut in two (on a char boundary);
    /// both halves keep its style.
    pub fn split_by_index(&self, index: usize) -> (OutputStream, OutputStream) {
        if index == 0 {
            return (OutputStream::empty(), self.clone());
        }

        let mut current = 0;
        for (i, element) in self.elements.iter().enumerate() {
            let Some(run) = element.as_run() else {
                continue;
            };
            if run.text.is_empty() {
                continue;
            }
            let len = run.text.len();

            if current + len > index {
                let mut offset = index - current;
                while !run.text.is_char_boundary(offset) {
                    offset -= 1;
                }
                let (head_text, tail_text) = run.text.split_at(offset);
                let head_ends_with_newline = head_text.ends_with('\n');

                let mut first: Vec<OutputElement> = self.elements[..i].to_vec();
                first.push(TextRun::new(head_text, run.style.clone(), run.style_key.clone()).into());
                let mut second: Vec<OutputElement> =
                    vec![TextRun::new(tail_text, run.style.clone(), run.style_key.clone()).into()];
                second.extend(self.elements[i + 1..].iter().cloned());

                return (
                    OutputStream::new(
                        first,
                        self.new_start.min(i + 1),
                        self.previous_ends_with_newline,
                        head_ends_with_newline,
                    ),
                    OutputStream::new(
                        second,
                        self.new_start.saturating_sub(i),
                        head_ends_with_newline,
                        self.ends_with_newline,
                    ),
                );
            }

            if current + len == index {
                let head_ends_with_newline = run.text.ends_with('\n');
                return (
                    OutputStream::new(
                        self.elements[..=i].to_vec(),
                        self.new_start.min(i + 1),
                        self.previous_ends_with_newline,
                        head_ends_with_newline,
                    ),
                    OutputStream::new(
                        self.elements[i + 1..].to_vec(),
                        self.new_start.saturating_sub(i + 1),
                        head_ends_with_newline,
                        self.ends_with_newline,
                    ),
                );
            }

            current += len;
        }

        (self.clone(), OutputStream::empty())
    }
}

impl PartialEq for OutputStream {
    fn eq(&self, other: &Self) -> bool {
        self.elements == other.elements
            && self.new_start == other.new_start
            && self.previous_ends_with_newline == other.previous_ends_with_newline
            && self.ends_with_newline == other.ends_with_newline
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("elements", &self.elements)
            .field("new_start", &self.new_start)
            .field("previous_ends_with_newline", &self.previous_ends_with_newline)
            .field("ends_with_newline", &self.ends_with_newline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::element::{ActionArgs, ActionKind, ActionMarker};

    fn run(text: &str) -> OutputElement {
        TextRun::plain(text).into()
    }

    fn marker() -> OutputElement {
        ActionMarker::new(ActionKind::ExecuteControl, ActionArgs::Control(b'\r'))
            .fallback("\\r")
            .into()
    }

    fn sample() -> OutputStream {
        OutputStream::new(
            vec![run("hello "), marker(), run("world\n"), run("$ ")],
            0,
            true,
            false,
        )
    }

    #[test]
    fn test_plain_text_skips_markers() {
        assert_eq!(sample().plain_text(), "hello world\n$ ");
        assert_eq!(OutputStream::empty().plain_text(), "");
    }

    #[test]
    fn test_split_inside_run() {
        let (first, second) = sample().split_by_index(8);
        assert_eq!(first.plain_text(), "hello wo");
        assert_eq!(second.plain_text(), "rld\n$ ");
        assert_eq!(first.len(), 3);
        assert!(!first.ends_with_newline());
        assert!(!second.previous_ends_with_newline());
    }

    #[test]
    fn test_split_on_run_boundary() {
        let (first, second) = sample().split_by_index(12);
        assert_eq!(first.plain_text(), "hello world\n");
        assert!(first.ends_with_newline());
        assert_eq!(second.elements(), &[run("$ ")]);
        assert!(second.previous_ends_with_newline());
    }

    #[test]
    fn test_split_edges() {
        let stream = sample();
        let (first, second) = stream.split_by_index(0);
        assert!(first.is_empty());
        assert_eq!(second, stream);

        let (first, second) = stream.split_by_index(100);
        assert_eq!(first, stream);
        assert!(second.is_empty());
    }

    #[test]
    fn test_split_respects_char_boundary() {
        let stream = OutputStream::from_text("héllo");
        let (first, second) = stream.split_by_index(2);
        assert_eq!(first.plain_text(), "h");
        assert_eq!(second.plain_text(), "éllo");
    }

    #[test]
    fn test_split_then_join_restores_text() {
        let stream = sample();
        for index in 0..=stream.plain_text().len() {
            let (first, second) = stream.split_by_index(index);
            let joined = first.join(&second).unwrap();
            assert_eq!(joined.plain_text(), stream.plain_text());
            assert_eq!(joined.ends_with_newline(), stream.ends_with_newline());
        }
    }

    #[test]
    fn test_join_rejects_two_partial_regions() {
        let a = OutputStream::new(vec![run("a"), run("b")], 1, true, false);
        let b = OutputStream::new(vec![run("c"), run("d")], 1, false, false);
        assert_eq!(
            a.join(&b),
            Err(StreamError::InvalidStreamJoin {
                start: 1,
                len: 2,
                other: 1
            })
        );
    }

    #[test]
    fn test_join_offsets_new_region() {
        let a = OutputStream::new(vec![run("a"), run("b")], 2, true, false);
        let b = OutputStream::new(vec![run("c\n")], 0, false, true);
        let joined = a.join(&b).unwrap();
        assert_eq!(joined.new_start_index(), 2);
        assert_eq!(joined.new_elements(), &[run("c\n")]);
        assert!(joined.ends_with_newline());
    }

    #[test]
    fn test_slice_boundary_flags() {
        let stream = sample();
        let tail = stream.slice(3, 4);
        assert!(tail.previous_ends_with_newline());
        assert_eq!(tail.plain_text(), "$ ");
        let head = stream.slice(0, 1);
        assert!(!head.ends_with_newline());
    }
}
