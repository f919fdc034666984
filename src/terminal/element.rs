//! Output elements
//!
//! The screen buffer produces an ordered list of elements: styled text
//! runs and action markers for control sequences that could not (or
//! should not) be rendered as text.

use std::path::PathBuf;

use super::style::StyleDescriptor;

/// A contiguous run of text sharing one style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRun {
    pub text: String,
    pub style: StyleDescriptor,
    pub style_key: String,
}

impl TextRun {
    pub fn new(text: impl Into<String>, style: StyleDescriptor, style_key: String) -> Self {
        Self {
            text: text.into(),
            style,
            style_key,
        }
    }

    /// Unstyled run
    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, StyleDescriptor::default(), String::new())
    }

    /// Lines of the run (always at least one)
    pub fn lines(&self) -> Vec<&str> {
        self.text.split('\n').collect()
    }

    pub fn last_line(&self) -> &str {
        self.text.rsplit('\n').next().unwrap_or("")
    }

    pub fn line_breaks(&self) -> usize {
        self.text.matches('\n').count()
    }
}

/// What a marker stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    SetTitle,
    Osc,
    ExecuteControl,
    Csi,
    Esc,
    DcsHook,
    DcsPut,
    DcsUnhook,
    CursorMove,
    EraseDisplay,
    /// Local copy of a remote file fetched on the user's behalf
    FileEntry,
}

/// Arguments captured from the originating sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionArgs {
    None,
    Text(String),
    Control(u8),
    Sequence {
        intermediates: String,
        params: Vec<u16>,
        action: char,
    },
    Esc {
        intermediates: String,
        byte: u8,
    },
    Position {
        row: usize,
        col: usize,
    },
    EraseMode(u16),
    Path(PathBuf),
}

/// How a marker should be presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Approximated: the buffer could not reproduce the effect
    Fallback,
    /// Recognised but not acted upon
    Unhandled,
    Plain,
}

impl Indicator {
    pub fn class_name(&self) -> &'static str {
        match self {
            Indicator::Fallback => "fallback indicator",
            Indicator::Unhandled => "unhandled indicator",
            Indicator::Plain => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMarker {
    pub kind: ActionKind,
    pub args: ActionArgs,
    pub indicator: Indicator,
    /// Short human-readable rendering
    pub fallback: Option<String>,
    pub description: Option<String>,
}

impl ActionMarker {
    pub fn new(kind: ActionKind, args: ActionArgs) -> Self {
        Self {
            kind,
            args,
            indicator: Indicator::Plain,
            fallback: None,
            description: None,
        }
    }

    pub fn fallback(mut self, text: impl Into<String>) -> Self {
        self.indicator = Indicator::Fallback;
        self.fallback = Some(text.into());
        self
    }

    pub fn unhandled(mut self, text: impl Into<String>) -> Self {
        self.indicator = Indicator::Unhandled;
        self.fallback = Some(text.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputElement {
    Text(TextRun),
    Marker(ActionMarker),
}

impl OutputElement {
    pub fn text(&self) -> Option<&str> {
        match self {
            OutputElement::Text(run) => Some(&run.text),
            OutputElement::Marker(_) => None,
        }
    }

    pub fn as_run(&self) -> Option<&TextRun> {
        match self {
            OutputElement::Text(run) => Some(run),
            OutputElement::Marker(_) => None,
        }
    }

    pub fn as_run_mut(&mut self) -> Option<&mut TextRun> {
        match self {
            OutputElement::Text(run) => Some(run),
            OutputElement::Marker(_) => None,
        }
    }

    pub fn as_marker(&self) -> Option<&ActionMarker> {
        match self {
            OutputElement::Marker(marker) => Some(marker),
            OutputElement::Text(_) => None,
        }
    }
}

impl From<TextRun> for OutputElement {
    fn from(run: TextRun) -> Self {
        OutputElement::Text(run)
    }
}

impl From<ActionMarker> for OutputElement {
    fn from(marker: ActionMarker) -> Self {
        OutputElement::Marker(marker)
    }
}
