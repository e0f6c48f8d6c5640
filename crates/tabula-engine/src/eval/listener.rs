use crate::eval::cache::{CellLoc, EntryId};
use crate::value::Value;

/// Diagnostic hooks around formula evaluation. All methods default to
/// no-ops so implementations observe only what they care about.
pub trait EvaluationListener {
    fn on_start_evaluate(&self, _loc: CellLoc, _entry: EntryId) {}
    fn on_end_evaluate(&self, _entry: EntryId, _result: &Value) {}
    fn on_cache_hit(&self, _loc: CellLoc, _value: &Value) {}
}

/// Oracle declaring certain cells immutable. When a cell is final the
/// evaluator skips dependency bookkeeping for it; formula entries whose
/// `input_sensitive` flag is set keep recording regardless.
pub trait StabilityClassifier {
    fn is_cell_final(&self, sheet_ix: u32, row: u32, col: u32) -> bool;
}

/// Classifier for workbooks that are pure static input data.
pub struct TotallyImmutable;

impl StabilityClassifier for TotallyImmutable {
    fn is_cell_final(&self, _sheet_ix: u32, _row: u32, _col: u32) -> bool {
        true
    }
}
