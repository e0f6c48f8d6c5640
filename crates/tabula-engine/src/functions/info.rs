//! Information functions. `ISBLANK` inspects the value *before* the
//! blank-to-zero dereference boundary, which is what makes original
//! blanks observable at all.

use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::eval::resolver;
use crate::value::Value;

pub(super) fn is_blank(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let single = resolver::get_single_value(args[0].clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(Value::Bool(matches!(single, Value::Blank)))
}

pub(super) fn is_error(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let single = resolver::get_single_value(args[0].clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(Value::Bool(single.is_error()))
}

pub(super) fn is_na(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let single = resolver::get_single_value(args[0].clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(Value::Bool(single == Value::Error(ErrorValue::NA)))
}

pub(super) fn na(
    _args: &[Value],
    _ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(Value::Error(ErrorValue::NA))
}

/// `ROW()` is the 1-based row of the evaluated cell; `ROW(ref)` the row
/// of the reference (an area answers with its first row).
pub(super) fn row(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let row = match args.first() {
        None | Some(Value::MissingArg) => ec.src_row(),
        Some(Value::Ref(r)) => r.row,
        Some(Value::Area(a)) => a.first_row,
        Some(_) => return Ok(Value::Error(ErrorValue::Value)),
    };
    Ok(Value::Number(f64::from(row) + 1.0))
}

pub(super) fn column(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let col = match args.first() {
        None | Some(Value::MissingArg) => ec.src_col(),
        Some(Value::Ref(r)) => r.col,
        Some(Value::Area(a)) => a.first_col,
        Some(_) => return Ok(Value::Error(ErrorValue::Value)),
    };
    Ok(Value::Number(f64::from(col) + 1.0))
}
