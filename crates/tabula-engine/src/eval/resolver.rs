//! Operand resolution: taking reference and area values down to a single
//! scalar at a specific position, and the final dereference applied to a
//! formula result.

use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::value::{AreaRef, Value};

/// Reduce `value` to a single scalar as seen from the source cell
/// `(src_row, src_col)`.
///
/// Scalars pass through unchanged, `Blank` included; callers that need
/// the blank-to-zero rule apply it themselves. Single references read
/// the target cell. Areas project onto the source row or column: a
/// one-column area uses its sole column, a one-row area its sole row,
/// and a full 2-D area requires the source cell to fall inside its span.
/// Anything else is an in-band `#VALUE!`.
pub fn get_single_value(
    value: Value,
    src_row: u32,
    src_col: u32,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    match value {
        Value::Ref(r) => ec.evaluate_cell_value(r.book, r.sheet, r.row, r.col),
        Value::Area(a) => choose_single_element_from_area(&a, src_row, src_col, ec),
        Value::Array(arr) => Ok(arr
            .get(0, 0)
            .cloned()
            .unwrap_or(Value::Error(ErrorValue::Value))),
        Value::RefList(_) | Value::FunctionName(_) => Ok(Value::Error(ErrorValue::Value)),
        scalar => Ok(scalar),
    }
}

fn choose_single_element_from_area(
    area: &AreaRef,
    src_row: u32,
    src_col: u32,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    if area.is_single_column() {
        if area.is_single_row() {
            return ec.evaluate_cell_value(area.book, area.sheet, area.first_row, area.first_col);
        }
        if !area.contains_row(src_row) {
            return Ok(Value::Error(ErrorValue::Value));
        }
        return ec.evaluate_cell_value(area.book, area.sheet, src_row, area.first_col);
    }
    if !area.is_single_row() {
        if area.contains_row(src_row) && area.contains_col(src_col) {
            return ec.evaluate_cell_value(area.book, area.sheet, src_row, src_col);
        }
        return Ok(Value::Error(ErrorValue::Value));
    }
    if !area.contains_col(src_col) {
        return Ok(Value::Error(ErrorValue::Value));
    }
    ec.evaluate_cell_value(area.book, area.sheet, area.first_row, src_col)
}

/// The dereference applied to the final value of a formula.
///
/// In single-value context the raw value is taken down to one scalar and
/// a blank result is re-typed to `Number(0)`: formulas never evaluate to
/// blank (`ISBLANK` sees the original blank before this boundary). In
/// array-formula context the element for the evaluated cell's position
/// within its group is selected instead, with no blank coercion.
pub fn dereference_result(
    value: Value,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    if let (Some(group), Value::Array(arr)) = (ec.array_group, &value) {
        let rel_row = if arr.rows == 1 {
            0
        } else {
            (ec.src_row().saturating_sub(group.start.row)) as usize
        };
        let rel_col = if arr.cols == 1 {
            0
        } else {
            (ec.src_col().saturating_sub(group.start.col)) as usize
        };
        return Ok(arr
            .get(rel_row, rel_col)
            .cloned()
            .unwrap_or(Value::Error(ErrorValue::NA)));
    }

    let single = get_single_value(value, ec.src_row(), ec.src_col(), ec)?;
    Ok(match single {
        Value::Blank => Value::Number(0.0),
        other => other,
    })
}

/// Truncating integer coercion used by `CHOOSE` and friends.
pub(crate) fn coerce_to_int(value: &Value) -> Result<i32, ErrorValue> {
    let n = value.coerce_to_number()?;
    if !n.is_finite() {
        return Err(ErrorValue::Num);
    }
    Ok(n.trunc() as i32)
}
