//! Context stack
//!
//! Nested interactive environments (a shell running `sftp`, an `ssh`
//! inside that shell, ...). Only the top entry decides how input is
//! classified.

use log::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /// Command line that opened the context
    pub command_text: String,
    pub context_type: String,
}

#[derive(Debug, Default)]
pub struct ContextStack {
    entries: Vec<Context>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, context: Context) {
        info!(
            "Entering {} context: {} (depth {})",
            context.context_type,
            context.command_text,
            self.entries.len() + 1
        );
        self.entries.push(context);
    }

    pub fn pop(&mut self) -> Option<Context> {
        let context = self.entries.pop();
        if let Some(ref context) = context {
            info!(
                "Leaving {} context: {} (depth {})",
                context.context_type,
                context.command_text,
                self.entries.len()
            );
        }
        context
    }

    pub fn top(&self) -> Option<&Context> {
        self.entries.last()
    }

    /// Context directly below the top
    pub fn parent(&self) -> Option<&Context> {
        self.entries.iter().rev().nth(1)
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top of stack has this type
    pub fn in_context(&self, context_type: &str) -> bool {
        self.top().is_some_and(|c| c.context_type == context_type)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
