use std::rc::Rc;

use tabula_model::{ErrorValue, Range};

use crate::error::EvalError;
use crate::eval::evaluator::WorkbookEvaluator;
use crate::eval::tracker::EvaluationTracker;
use crate::functions::udf::Udf;
use crate::token::{AreaToken, ArrayElement, ArrayLiteral, RefToken};
use crate::value::{AreaRef, ArrayValue, SingleRef, Value};
use crate::workbook::EvaluationWorkbook;

/// Result of resolving an extern-sheet index: either a concrete
/// `(workbook, sheet)` pair or an in-band error (`#REF!` for a sheet
/// that no longer exists).
type SheetResolution = Result<(u32, u32), ErrorValue>;

/// Per-invocation evaluation context: the cell being evaluated, the
/// single-vs-multi-value flag, and the handles used to resolve
/// references, names and collaborating workbooks.
///
/// All cell reads go through [`evaluate_cell_value`], which routes to
/// the owning evaluator and records dependencies via the shared tracker.
///
/// [`evaluate_cell_value`]: OperationEvaluationContext::evaluate_cell_value
pub struct OperationEvaluationContext<'a, 't> {
    pub(crate) evaluator: &'a WorkbookEvaluator,
    /// Sheet of the evaluated cell; `-1` means workbook scope (a formula
    /// evaluated without a sheet context).
    pub(crate) sheet_ix: i32,
    pub(crate) row: u32,
    pub(crate) col: u32,
    /// When set, the final result is dereferenced to a single scalar.
    pub(crate) single_value: bool,
    /// The array-formula group containing the evaluated cell, if any.
    pub(crate) array_group: Option<Range>,
    pub(crate) tracker: &'t mut EvaluationTracker,
}

impl<'a, 't> OperationEvaluationContext<'a, 't> {
    pub(crate) fn new(
        evaluator: &'a WorkbookEvaluator,
        sheet_ix: i32,
        row: u32,
        col: u32,
        single_value: bool,
        array_group: Option<Range>,
        tracker: &'t mut EvaluationTracker,
    ) -> Self {
        Self {
            evaluator,
            sheet_ix,
            row,
            col,
            single_value,
            array_group,
            tracker,
        }
    }

    /// Row of the cell the formula belongs to.
    pub fn src_row(&self) -> u32 {
        self.row
    }

    /// Column of the cell the formula belongs to.
    pub fn src_col(&self) -> u32 {
        self.col
    }

    pub fn is_single_value(&self) -> bool {
        self.single_value
    }

    pub(crate) fn workbook(&self) -> &dyn EvaluationWorkbook {
        self.evaluator.workbook()
    }

    /// Mark the formula being evaluated as having read a volatile input
    /// (`NOW`, `RAND`, ...). Commits as the cache entry's
    /// `input_sensitive` flag.
    pub fn mark_volatile(&mut self) {
        self.tracker.mark_volatile();
    }

    pub(crate) fn find_udf(&self, name: &str) -> Option<Rc<dyn Udf>> {
        self.evaluator.workbook().udf_finder().find(name)
    }

    /// Memoized case-insensitive defined-name lookup.
    pub(crate) fn lookup_name(&self, name: &str, sheet_ix: i32) -> Option<u32> {
        self.evaluator.name_index(name, sheet_ix)
    }

    /// The sheet the formula lives on; a fault when the formula was
    /// evaluated in workbook scope but contains sheet-relative
    /// references.
    pub(crate) fn current_sheet(&self) -> Result<u32, EvalError> {
        u32::try_from(self.sheet_ix).map_err(|_| {
            EvalError::MalformedFormula(
                "sheet-relative reference in a formula with no sheet context".to_string(),
            )
        })
    }

    /// Evaluate the cell at `(book, sheet, row, col)`, routing through
    /// the collaborating environment for foreign workbook indexes. The
    /// shared tracker travels along, so cross-workbook cycles are
    /// detected like local ones.
    pub(crate) fn evaluate_cell_value(
        &mut self,
        book: u32,
        sheet: u32,
        row: u32,
        col: u32,
    ) -> Result<Value, EvalError> {
        if book == self.evaluator.book_index() {
            self.evaluator.evaluate_any(sheet, row, col, self.tracker)
        } else {
            let other = self.evaluator.collaborating_evaluator_by_book(book)?;
            other.evaluate_any(sheet, row, col, self.tracker)
        }
    }

    pub(crate) fn ref_value(&self, token: &RefToken) -> Result<Value, EvalError> {
        let sheet = self.current_sheet()?;
        Ok(Value::Ref(SingleRef {
            book: self.evaluator.book_index(),
            sheet,
            row: token.row,
            col: token.col,
        }))
    }

    pub(crate) fn area_value(&self, token: &AreaToken) -> Result<Value, EvalError> {
        let sheet = self.current_sheet()?;
        Ok(Value::Area(area_ref(
            self.evaluator.book_index(),
            sheet,
            token,
        )))
    }

    pub(crate) fn ref3d_value(
        &self,
        extern_ix: u16,
        token: &RefToken,
    ) -> Result<Value, EvalError> {
        Ok(match self.resolve_extern_sheet(extern_ix)? {
            Ok((book, sheet)) => Value::Ref(SingleRef {
                book,
                sheet,
                row: token.row,
                col: token.col,
            }),
            Err(e) => Value::Error(e),
        })
    }

    pub(crate) fn area3d_value(
        &self,
        extern_ix: u16,
        token: &AreaToken,
    ) -> Result<Value, EvalError> {
        Ok(match self.resolve_extern_sheet(extern_ix)? {
            Ok((book, sheet)) => Value::Area(area_ref(book, sheet, token)),
            Err(e) => Value::Error(e),
        })
    }

    pub(crate) fn array_literal_value(&self, literal: &ArrayLiteral) -> Value {
        let values = literal
            .values
            .iter()
            .map(|e| match e {
                ArrayElement::Number(n) => Value::Number(*n),
                ArrayElement::Text(s) => Value::Text(s.clone()),
                ArrayElement::Bool(b) => Value::Bool(*b),
                ArrayElement::Error(e) => Value::Error(*e),
                ArrayElement::Blank => Value::Blank,
            })
            .collect();
        Value::Array(ArrayValue::new(literal.rows, literal.cols, values))
    }

    /// Translate an extern-sheet index into `(workbook, sheet)` indexes.
    ///
    /// A missing collaborating workbook is a fault (recoverable at the
    /// `evaluate_any` boundary); a vanished sheet is an in-band `#REF!`.
    fn resolve_extern_sheet(&self, extern_ix: u16) -> Result<SheetResolution, EvalError> {
        let workbook = self.evaluator.workbook();
        let Some(extern_sheet) = workbook.extern_sheet(extern_ix) else {
            return Err(EvalError::MalformedFormula(format!(
                "extern sheet index {extern_ix} is not in the extern-sheet table"
            )));
        };
        match extern_sheet.workbook.as_deref() {
            None => match workbook.convert_from_extern_sheet_index(extern_ix) {
                Some(sheet) => Ok(Ok((self.evaluator.book_index(), sheet))),
                None => Ok(Err(ErrorValue::Ref)),
            },
            Some(book_name) => {
                let other = self.evaluator.other_workbook_evaluator(book_name)?;
                match other.sheet_index_opt(&extern_sheet.sheet) {
                    Some(sheet) => Ok(Ok((other.book_index(), sheet))),
                    None => Ok(Err(ErrorValue::Ref)),
                }
            }
        }
    }
}

fn area_ref(book: u32, sheet: u32, token: &AreaToken) -> AreaRef {
    AreaRef {
        book,
        sheet,
        first_row: token.first_row.min(token.last_row),
        first_col: token.first_col.min(token.last_col),
        last_row: token.first_row.max(token.last_row),
        last_col: token.first_col.max(token.last_col),
    }
}
