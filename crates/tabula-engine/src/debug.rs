//! Per-token evaluation tracing.
//!
//! The sink is an injected collaborator rather than global state: hosts
//! (and tests) install their own implementation, and the default simply
//! forwards to the `log` facade at debug level.

use std::cell::RefCell;

/// Receives one line per interpreted token while tracing is active.
pub trait TraceSink {
    /// `depth` is the nesting depth of the evaluation stack, for
    /// indentation.
    fn line(&self, depth: usize, message: &str);
}

/// Default sink: forwards to `log::debug!`.
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn line(&self, depth: usize, message: &str) {
        log::debug!("{:indent$}{message}", "", indent = depth * 2);
    }
}

/// Test sink that collects lines.
#[derive(Default)]
pub struct CollectingTraceSink {
    lines: RefCell<Vec<String>>,
}

impl CollectingTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut self.lines.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.lines.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.borrow().is_empty()
    }
}

impl TraceSink for CollectingTraceSink {
    fn line(&self, depth: usize, message: &str) {
        self.lines
            .borrow_mut()
            .push(format!("{:indent$}{message}", "", indent = depth * 2));
    }
}
