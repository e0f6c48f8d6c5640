use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashSet;
use tabula_model::ErrorValue;

use crate::eval::cache::{CellLoc, EntryId, EvaluationCache};
use crate::value::Value;

/// One in-progress formula evaluation. Dependencies are collected here
/// and written to the cache entry only when the result commits, so an
/// aborted evaluation leaves the entry in its pre-evaluation state.
#[derive(Debug)]
struct EvaluationFrame {
    entry: EntryId,
    inputs: AHashSet<EntryId>,
    used_volatile: bool,
}

/// Per-query stack of formula entries currently being evaluated.
///
/// This is explicit data rather than the call stack: evaluation recurses
/// through name definitions and collaborating workbooks, and the cycle
/// check must compare cache entries, not call sites. One tracker exists
/// per top-level `evaluate` call and is threaded through every nested
/// evaluation, including cross-workbook ones.
#[derive(Debug)]
pub struct EvaluationTracker {
    cache: Rc<RefCell<EvaluationCache>>,
    frames: Vec<EvaluationFrame>,
    in_progress: AHashSet<EntryId>,
}

impl EvaluationTracker {
    pub fn new(cache: Rc<RefCell<EvaluationCache>>) -> Self {
        Self {
            cache,
            frames: Vec::new(),
            in_progress: AHashSet::new(),
        }
    }

    pub fn cache(&self) -> &Rc<RefCell<EvaluationCache>> {
        &self.cache
    }

    /// Current nesting depth; used for trace indentation.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Begin evaluating `entry`. Returns `false` if the entry is already
    /// on the stack, which means the formula chain is circular.
    pub fn start_evaluate(&mut self, entry: EntryId) -> bool {
        if !self.in_progress.insert(entry) {
            return false;
        }
        self.frames.push(EvaluationFrame {
            entry,
            inputs: AHashSet::new(),
            used_volatile: false,
        });
        true
    }

    pub fn end_evaluate(&mut self, entry: EntryId) {
        let frame = self.frames.pop();
        debug_assert_eq!(
            frame.as_ref().map(|f| f.entry),
            Some(entry),
            "end_evaluate does not match the top of the evaluation stack"
        );
        self.in_progress.remove(&entry);
    }

    /// Record that the formula on top of the stack read a plain
    /// (non-formula) cell value.
    pub fn accept_plain_value_dependency(&mut self, loc: CellLoc, value: &Value) {
        let Some(frame) = self.frames.last_mut() else {
            // Top-level read of a plain cell; nothing consumes it.
            return;
        };
        let id = self.cache.borrow_mut().update_plain_value(loc, value);
        frame.inputs.insert(id);
    }

    /// Record that the formula on top of the stack depends on another
    /// formula's entry.
    pub fn accept_formula_dependency(&mut self, entry: EntryId) {
        if let Some(frame) = self.frames.last_mut() {
            frame.inputs.insert(entry);
        }
    }

    /// Mark the top frame as having read a volatile or indeterminate
    /// input; the flag commits as the entry's `input_sensitive` bit.
    pub fn mark_volatile(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.used_volatile = true;
        }
    }

    /// Commit `result` to the entry on top of the stack.
    ///
    /// A circular-reference error is never committed: every entry on the
    /// cycle stays cleared, so the next query re-enters and detects the
    /// cycle again instead of serving a poisoned cached value.
    pub fn update_cache_result(&mut self, result: &Value) {
        if self.frames.is_empty() {
            debug_assert!(false, "update_cache_result without a frame");
            return;
        }
        if *result == Value::Error(ErrorValue::Circular) {
            return;
        }
        let frame = self.frames.last_mut().expect("frames checked non-empty");
        let inputs = std::mem::take(&mut frame.inputs);
        self.cache.borrow_mut().commit_formula_result(
            frame.entry,
            result.clone(),
            inputs,
            frame.used_volatile,
        );
    }
}
