use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use ahash::AHashMap;
use tabula_model::{CellRef, ErrorValue, Range, SpreadsheetVersion};

use crate::debug::{LogTraceSink, TraceSink};
use crate::error::EvalError;
use crate::eval::cache::{CellLoc, EntryId, EvaluationCache};
use crate::eval::context::OperationEvaluationContext;
use crate::eval::environment::EnvironmentState;
use crate::eval::interpreter;
use crate::eval::listener::{EvaluationListener, StabilityClassifier};
use crate::eval::tracker::EvaluationTracker;
use crate::functions::{self, atp::AnalysisToolPak};
use crate::parser::{self, FormulaType};
use crate::token::Token;
use crate::value::{AreaRef, Value};
use crate::workbook::{EvaluationWorkbook, ParsingWorkbook};

type SharedCache = Rc<RefCell<EvaluationCache>>;

/// Evaluates the formulas of one workbook on demand, caching results and
/// tracking dependencies for invalidation.
///
/// All evaluation entry points take `&self`: mutable state (the cache,
/// memo maps, one-shot flags) lives behind interior mutability so
/// collaborating evaluators can recurse into each other during a single
/// evaluation.
pub struct WorkbookEvaluator {
    workbook: Rc<dyn EvaluationWorkbook>,
    parsing_workbook: Rc<dyn ParsingWorkbook>,
    cache: RefCell<SharedCache>,
    book_ix: Cell<u32>,
    environment: RefCell<Weak<EnvironmentState>>,
    /// Case-insensitive sheet-name -> index memo. Misses fall through to
    /// the workbook; hits are cached.
    sheet_memo: RefCell<AHashMap<String, u32>>,
    /// Case-insensitive (name, sheet) -> name-index memo.
    name_memo: RefCell<AHashMap<(String, i32), u32>>,
    stability_classifier: Option<Rc<dyn StabilityClassifier>>,
    listener: Option<Rc<dyn EvaluationListener>>,
    ignore_missing_workbooks: Cell<bool>,
    debug_output_next_eval: Cell<bool>,
    trace_active: Cell<bool>,
    trace_sink: RefCell<Rc<dyn TraceSink>>,
}

impl WorkbookEvaluator {
    pub fn new<W>(workbook: Rc<W>) -> Self
    where
        W: EvaluationWorkbook + ParsingWorkbook + 'static,
    {
        Self {
            parsing_workbook: Rc::clone(&workbook) as Rc<dyn ParsingWorkbook>,
            workbook,
            cache: RefCell::new(Rc::new(RefCell::new(EvaluationCache::new()))),
            book_ix: Cell::new(0),
            environment: RefCell::new(Weak::new()),
            sheet_memo: RefCell::new(AHashMap::new()),
            name_memo: RefCell::new(AHashMap::new()),
            stability_classifier: None,
            listener: None,
            ignore_missing_workbooks: Cell::new(false),
            debug_output_next_eval: Cell::new(false),
            trace_active: Cell::new(false),
            trace_sink: RefCell::new(Rc::new(LogTraceSink)),
        }
    }

    pub fn set_stability_classifier(&mut self, classifier: Option<Rc<dyn StabilityClassifier>>) {
        self.stability_classifier = classifier;
    }

    pub fn set_evaluation_listener(&mut self, listener: Option<Rc<dyn EvaluationListener>>) {
        self.listener = listener;
    }

    /// When set, a formula that depends on an external workbook that is
    /// not part of the environment recovers to the cell's cached literal
    /// instead of failing.
    pub fn set_ignore_missing_workbooks(&self, ignore: bool) {
        self.ignore_missing_workbooks.set(ignore);
    }

    /// Latch verbose per-token tracing for exactly one subsequent
    /// top-level evaluation; auto-clears afterwards.
    pub fn set_debug_evaluation_output_for_next_eval(&self, value: bool) {
        self.debug_output_next_eval.set(value);
    }

    pub fn set_trace_sink(&self, sink: Rc<dyn TraceSink>) {
        *self.trace_sink.borrow_mut() = sink;
    }

    pub fn book_index(&self) -> u32 {
        self.book_ix.get()
    }

    pub(crate) fn workbook(&self) -> &dyn EvaluationWorkbook {
        &*self.workbook
    }

    pub(crate) fn cache(&self) -> SharedCache {
        Rc::clone(&self.cache.borrow())
    }

    // ---- façade: evaluation -------------------------------------------

    /// Evaluate the cell at `(sheet_ix, cell)`.
    ///
    /// Formula results are dereferenced to a single scalar and never come
    /// back blank (a blank formula result reads as `Number(0)`); reading
    /// a blank non-formula cell yields `Blank`.
    pub fn evaluate(&self, sheet_ix: u32, cell: CellRef) -> Result<Value, EvalError> {
        self.check_sheet(sheet_ix)?;
        self.arm_trace();
        let mut tracker = EvaluationTracker::new(self.cache());
        let result = self.evaluate_any(sheet_ix, cell.row, cell.col, &mut tracker);
        self.trace_active.set(false);
        result
    }

    pub fn evaluate_by_sheet_name(&self, sheet: &str, cell: CellRef) -> Result<Value, EvalError> {
        let sheet_ix = self.get_sheet_index(sheet)?;
        self.evaluate(sheet_ix, cell)
    }

    /// Parse `formula` in cell mode against this workbook and evaluate it
    /// as if it lived at `at`. Without a sheet the formula runs in
    /// workbook scope (sheet index −1), where sheet-relative references
    /// are faults.
    pub fn evaluate_formula(
        &self,
        formula: &str,
        sheet: Option<&str>,
        at: CellRef,
    ) -> Result<Value, EvalError> {
        let sheet_ix: i32 = match sheet {
            Some(name) => self.get_sheet_index(name)? as i32,
            None => -1,
        };
        let tokens = parser::parse(formula, &*self.parsing_workbook, FormulaType::Cell, sheet_ix)?;
        self.arm_trace();
        let mut tracker = EvaluationTracker::new(self.cache());
        let result = {
            let mut ec = OperationEvaluationContext::new(
                self,
                sheet_ix,
                at.row,
                at.col,
                FormulaType::Cell.is_single_value(),
                None,
                &mut tracker,
            );
            interpreter::evaluate_name_formula(&mut ec, &tokens)
        };
        self.trace_active.set(false);
        result
    }

    /// Parse `formula` in data-validation-list mode, shift its relative
    /// references from the region's first cell to `at`, and evaluate it
    /// with the multi-value flag set (an area result is returned as an
    /// area, not dereferenced).
    pub fn evaluate_list(
        &self,
        formula: &str,
        sheet: &str,
        at: CellRef,
        region: Range,
    ) -> Result<Value, EvalError> {
        let sheet_ix = self.get_sheet_index(sheet)? as i32;
        let mut tokens = parser::parse(
            formula,
            &*self.parsing_workbook,
            FormulaType::DataValidationList,
            sheet_ix,
        )?;
        let delta_row = i64::from(at.row) - i64::from(region.start.row);
        let delta_col = i64::from(at.col) - i64::from(region.start.col);
        adjust_region_relative_reference(
            &mut tokens,
            delta_row,
            delta_col,
            self.workbook.spreadsheet_version(),
        )?;
        self.arm_trace();
        let mut tracker = EvaluationTracker::new(self.cache());
        let result = {
            let mut ec = OperationEvaluationContext::new(
                self,
                sheet_ix,
                at.row,
                at.col,
                FormulaType::DataValidationList.is_single_value(),
                None,
                &mut tracker,
            );
            interpreter::evaluate_name_formula(&mut ec, &tokens)
        };
        self.trace_active.set(false);
        result
    }

    /// Read every cell of an area, in row-major order. Useful for
    /// materializing the area results of [`evaluate_list`].
    ///
    /// [`evaluate_list`]: WorkbookEvaluator::evaluate_list
    pub fn evaluate_area_values(&self, area: &AreaRef) -> Result<Vec<Value>, EvalError> {
        let mut tracker = EvaluationTracker::new(self.cache());
        let mut out = Vec::with_capacity((area.height() as usize) * (area.width() as usize));
        for row in area.first_row..=area.last_row {
            for col in area.first_col..=area.last_col {
                let value = if area.book == self.book_index() {
                    self.evaluate_any(area.sheet, row, col, &mut tracker)?
                } else {
                    self.collaborating_evaluator_by_book(area.book)?
                        .evaluate_any(area.sheet, row, col, &mut tracker)?
                };
                out.push(value);
            }
        }
        Ok(out)
    }

    // ---- façade: cache maintenance ------------------------------------

    /// The cell's value or formula changed: clear its cached state and
    /// every transitive consumer.
    pub fn notify_update_cell(&self, sheet_ix: u32, cell: CellRef) {
        let loc = self.loc(sheet_ix, cell);
        self.cache().borrow_mut().notify_update_cell(loc);
    }

    /// The cell was deleted.
    pub fn notify_delete_cell(&self, sheet_ix: u32, cell: CellRef) {
        let loc = self.loc(sheet_ix, cell);
        self.cache().borrow_mut().notify_delete_cell(loc);
    }

    /// Drop the whole cache and the memoized lookup maps.
    pub fn clear_all_cached_results(&self) {
        self.cache().borrow_mut().clear();
        self.sheet_memo.borrow_mut().clear();
        self.name_memo.borrow_mut().clear();
    }

    // ---- façade: function listings ------------------------------------

    /// Names of all functions the evaluator can compute: built-ins plus
    /// the add-in set. Non-empty even for an empty workbook.
    pub fn supported_function_names() -> Vec<String> {
        let mut names: Vec<String> = functions::supported_function_names()
            .into_iter()
            .chain(AnalysisToolPak::supported_function_names())
            .map(str::to_string)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Names the parser recognizes but the evaluator cannot compute.
    pub fn not_supported_function_names() -> Vec<String> {
        let mut names: Vec<String> = functions::not_supported_function_names()
            .into_iter()
            .chain(AnalysisToolPak::not_supported_function_names())
            .map(str::to_string)
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    // ---- environment --------------------------------------------------

    pub(crate) fn attach_to_environment(
        &self,
        environment: Weak<EnvironmentState>,
        cache: SharedCache,
        book_ix: u32,
    ) {
        *self.environment.borrow_mut() = environment;
        *self.cache.borrow_mut() = cache;
        self.book_ix.set(book_ix);
    }

    /// Leave the collaborating environment: a fresh empty cache is
    /// installed and the workbook index resets to 0.
    pub fn detach_from_environment(&self) {
        *self.environment.borrow_mut() = Weak::new();
        *self.cache.borrow_mut() = Rc::new(RefCell::new(EvaluationCache::new()));
        self.book_ix.set(0);
    }

    pub(crate) fn environment(&self) -> Option<Rc<EnvironmentState>> {
        self.environment.borrow().upgrade()
    }

    pub(crate) fn other_workbook_evaluator(
        &self,
        workbook_name: &str,
    ) -> Result<Rc<WorkbookEvaluator>, EvalError> {
        self.environment()
            .and_then(|env| env.evaluator_by_name(workbook_name))
            .ok_or_else(|| EvalError::MissingExternalWorkbook(workbook_name.to_string()))
    }

    pub(crate) fn collaborating_evaluator_by_book(
        &self,
        book_ix: u32,
    ) -> Result<Rc<WorkbookEvaluator>, EvalError> {
        self.environment()
            .and_then(|env| env.evaluator_by_book(book_ix))
            .ok_or_else(|| {
                EvalError::MalformedFormula(format!(
                    "no collaborating workbook with index {book_ix}"
                ))
            })
    }

    // ---- lookups ------------------------------------------------------

    /// Case-insensitive, memoized sheet lookup. A sheet this workbook
    /// does not contain is a `ForeignSheet` fault.
    pub fn get_sheet_index(&self, sheet: &str) -> Result<u32, EvalError> {
        self.sheet_index_opt(sheet)
            .ok_or_else(|| EvalError::ForeignSheet(sheet.to_string()))
    }

    pub(crate) fn sheet_index_opt(&self, sheet: &str) -> Option<u32> {
        let key = sheet.to_lowercase();
        if let Some(&ix) = self.sheet_memo.borrow().get(&key) {
            return Some(ix);
        }
        let ix = self.workbook.sheet_index(sheet)?;
        self.sheet_memo.borrow_mut().insert(key, ix);
        Some(ix)
    }

    /// Case-insensitive, memoized defined-name lookup.
    pub(crate) fn name_index(&self, name: &str, sheet_ix: i32) -> Option<u32> {
        let key = (name.to_lowercase(), sheet_ix);
        if let Some(&ix) = self.name_memo.borrow().get(&key) {
            return Some(ix);
        }
        let ix = self.workbook.lookup_name(name, sheet_ix)?;
        self.name_memo.borrow_mut().insert(key, ix);
        Some(ix)
    }

    // ---- tracing ------------------------------------------------------

    fn arm_trace(&self) {
        self.trace_active.set(self.debug_output_next_eval.replace(false));
    }

    pub(crate) fn trace_active(&self) -> bool {
        self.trace_active.get()
    }

    pub(crate) fn trace_line(&self, depth: usize, message: &str) {
        self.trace_sink.borrow().line(depth, message);
    }

    // ---- core ---------------------------------------------------------

    /// Evaluate any cell (plain or formula), recording dependencies in
    /// `tracker` and serving formula results from the cache when
    /// committed.
    pub(crate) fn evaluate_any(
        &self,
        sheet_ix: u32,
        row: u32,
        col: u32,
        tracker: &mut EvaluationTracker,
    ) -> Result<Value, EvalError> {
        let cell = CellRef::new(row, col);
        let loc = self.loc(sheet_ix, cell);
        let should_record = match &self.stability_classifier {
            Some(classifier) => !classifier.is_cell_final(sheet_ix, row, col),
            None => true,
        };

        if !self.workbook.is_formula_cell(sheet_ix, cell) {
            let result = self.workbook.cell_content(sheet_ix, cell).to_value();
            if should_record {
                tracker.accept_plain_value_dependency(loc, &result);
            }
            return Ok(result);
        }

        let cache = self.cache();
        let entry = cache.borrow_mut().get_or_create_formula_entry(loc);
        let (cached, input_sensitive) = {
            let cache = cache.borrow();
            let e = cache.entry(entry);
            (
                e.and_then(|e| e.value.clone()),
                e.is_some_and(|e| e.input_sensitive),
            )
        };
        if should_record || input_sensitive {
            tracker.accept_formula_dependency(entry);
        }
        if let Some(value) = cached {
            if let Some(listener) = &self.listener {
                listener.on_cache_hit(loc, &value);
            }
            return Ok(value);
        }

        if !tracker.start_evaluate(entry) {
            return Ok(Value::Error(ErrorValue::Circular));
        }
        let outcome = self.evaluate_formula_cell(loc, sheet_ix, cell, entry, tracker);
        tracker.end_evaluate(entry);

        match outcome {
            Ok(value) => Ok(value),
            Err(EvalError::MissingExternalWorkbook(name))
                if self.ignore_missing_workbooks.get() =>
            {
                // Recover with the cell's last stored literal.
                match self.workbook.cached_formula_result(sheet_ix, cell) {
                    Some(content) => {
                        log::warn!(
                            "workbook {name:?} is not loaded; using the cached result of {}",
                            self.cell_address(sheet_ix, cell)
                        );
                        Ok(content.to_value())
                    }
                    None => Err(EvalError::MissingExternalWorkbook(name)),
                }
            }
            Err(e @ EvalError::NotImplemented { .. }) => {
                Err(e.with_cell_address(self.cell_address(sheet_ix, cell)))
            }
            Err(e) => Err(e),
        }
    }

    fn evaluate_formula_cell(
        &self,
        loc: CellLoc,
        sheet_ix: u32,
        cell: CellRef,
        entry: EntryId,
        tracker: &mut EvaluationTracker,
    ) -> Result<Value, EvalError> {
        let Some(tokens) = self.workbook.formula_tokens(sheet_ix, cell) else {
            return Err(EvalError::MalformedFormula(format!(
                "no parsed tokens for formula cell {}",
                self.cell_address(sheet_ix, cell)
            )));
        };
        if let Some(listener) = &self.listener {
            listener.on_start_evaluate(loc, entry);
        }
        let array_group = self.workbook.array_formula_group(sheet_ix, cell);
        let result = {
            let mut ec = OperationEvaluationContext::new(
                self,
                sheet_ix as i32,
                cell.row,
                cell.col,
                true,
                array_group,
                tracker,
            );
            interpreter::evaluate_tokens(&mut ec, &tokens)?
        };
        if let Some(listener) = &self.listener {
            listener.on_end_evaluate(entry, &result);
        }
        tracker.update_cache_result(&result);
        Ok(result)
    }

    fn check_sheet(&self, sheet_ix: u32) -> Result<(), EvalError> {
        if sheet_ix >= self.workbook.sheet_count() {
            return Err(EvalError::ForeignSheet(format!("#{sheet_ix}")));
        }
        Ok(())
    }

    fn loc(&self, sheet_ix: u32, cell: CellRef) -> CellLoc {
        CellLoc {
            book: self.book_ix.get(),
            sheet: sheet_ix,
            row: cell.row,
            col: cell.col,
        }
    }

    fn cell_address(&self, sheet_ix: u32, cell: CellRef) -> String {
        match self.workbook.sheet_name(sheet_ix) {
            Some(name) => format!("{name}!{cell}"),
            None => format!("#{sheet_ix}!{cell}"),
        }
    }
}

/// Shift every relative reference token by `(delta_row, delta_col)`, for
/// re-applying one parsed formula across the cells of a region.
///
/// Negative deltas are rejected. A shifted index past the spreadsheet
/// version's row or column maximum is an `OutOfBounds` fault. Returns
/// whether any token actually moved.
pub fn adjust_region_relative_reference(
    tokens: &mut [Token],
    delta_row: i64,
    delta_col: i64,
    version: SpreadsheetVersion,
) -> Result<bool, EvalError> {
    if delta_row < 0 || delta_col < 0 {
        return Err(EvalError::OutOfBounds(format!(
            "negative region-relative delta ({delta_row}, {delta_col})"
        )));
    }

    fn shift(
        index: u32,
        delta: i64,
        max: u32,
        what: &str,
        version: SpreadsheetVersion,
    ) -> Result<u32, EvalError> {
        let shifted = i64::from(index) + delta;
        if shifted > i64::from(max) {
            return Err(EvalError::OutOfBounds(format!(
                "shifted {what} index {shifted} exceeds the {} limit of {max}",
                version.name()
            )));
        }
        Ok(shifted as u32)
    }

    let max_rows = version.max_rows();
    let max_cols = version.max_cols();
    let mut shifted_any = false;

    for token in tokens.iter_mut() {
        match token {
            Token::Ref(r) | Token::Ref3d { cell: r, .. } => {
                if r.row_relative && delta_row != 0 {
                    r.row = shift(r.row, delta_row, max_rows, "row", version)?;
                    shifted_any = true;
                }
                if r.col_relative && delta_col != 0 {
                    r.col = shift(r.col, delta_col, max_cols, "column", version)?;
                    shifted_any = true;
                }
            }
            Token::Area(a) | Token::Area3d { area: a, .. } => {
                if a.first_row_relative && delta_row != 0 {
                    a.first_row = shift(a.first_row, delta_row, max_rows, "row", version)?;
                    shifted_any = true;
                }
                if a.last_row_relative && delta_row != 0 {
                    a.last_row = shift(a.last_row, delta_row, max_rows, "row", version)?;
                    shifted_any = true;
                }
                if a.first_col_relative && delta_col != 0 {
                    a.first_col = shift(a.first_col, delta_col, max_cols, "column", version)?;
                    shifted_any = true;
                }
                if a.last_col_relative && delta_col != 0 {
                    a.last_col = shift(a.last_col, delta_col, max_cols, "column", version)?;
                    shifted_any = true;
                }
            }
            _ => {}
        }
    }
    Ok(shifted_any)
}
