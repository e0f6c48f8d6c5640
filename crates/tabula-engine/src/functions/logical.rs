//! Logical functions and the selection functions the control-flow
//! attributes optimize (`IF`, `CHOOSE`).

use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::eval::resolver;
use crate::value::Value;

/// Coerce a predicate operand to a boolean as `IF` does: dereference to
/// a single value at the source cell, then apply boolean coercion.
///
/// Shared with the interpreter's optimized-`IF` attribute handler.
pub(crate) fn evaluate_predicate(
    value: &Value,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Result<bool, ErrorValue>, EvalError> {
    let single = resolver::get_single_value(value.clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(single.coerce_to_bool())
}

/// Coerce a `CHOOSE` selector to its 1-based index.
///
/// Shared with the interpreter's optimized-`CHOOSE` attribute handler.
pub(crate) fn evaluate_selector(
    value: &Value,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Result<i32, ErrorValue>, EvalError> {
    let single = resolver::get_single_value(value.clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(match single {
        Value::Error(e) => Err(e),
        other => resolver::coerce_to_int(&other),
    })
}

pub(super) fn if_func(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let condition = match evaluate_predicate(&args[0], ec)? {
        Ok(b) => b,
        Err(e) => return Ok(Value::Error(e)),
    };
    let chosen = if condition {
        &args[1]
    } else {
        // A two-argument IF with a false predicate yields FALSE.
        match args.get(2) {
            Some(v) => v,
            None => return Ok(Value::Bool(false)),
        }
    };
    Ok(match chosen {
        Value::MissingArg => Value::Blank,
        other => other.clone(),
    })
}

pub(super) fn choose(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let index = match evaluate_selector(&args[0], ec)? {
        Ok(ix) => ix,
        Err(e) => return Ok(Value::Error(e)),
    };
    if index < 1 || index as usize >= args.len() {
        return Ok(Value::Error(ErrorValue::Value));
    }
    let chosen =
        resolver::get_single_value(args[index as usize].clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(match chosen {
        Value::MissingArg => Value::Blank,
        other => other,
    })
}

pub(super) fn true_func(
    _args: &[Value],
    _ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(Value::Bool(true))
}

pub(super) fn false_func(
    _args: &[Value],
    _ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(Value::Bool(false))
}

pub(super) fn not(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(match evaluate_predicate(&args[0], ec)? {
        Ok(b) => Value::Bool(!b),
        Err(e) => Value::Error(e),
    })
}

/// `AND`/`OR` share their argument walk: booleans and numbers in
/// referenced ranges participate, text and blanks are skipped; literal
/// arguments must coerce. No usable element at all is a `#VALUE!`.
fn collect_bools(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Result<Vec<bool>, ErrorValue>, EvalError> {
    let mut bools = Vec::new();
    for arg in args {
        match arg {
            Value::Ref(_) | Value::Area(_) | Value::RefList(_) | Value::Array(_) => {
                let elements = flatten_reference(arg.clone(), ec)?;
                for v in elements {
                    match v {
                        Value::Error(e) => return Ok(Err(e)),
                        Value::Bool(b) => bools.push(b),
                        Value::Number(n) => bools.push(n != 0.0),
                        _ => {}
                    }
                }
            }
            Value::MissingArg | Value::Blank => {}
            other => match other.coerce_to_bool() {
                Ok(b) => bools.push(b),
                Err(e) => return Ok(Err(e)),
            },
        }
    }
    if bools.is_empty() {
        return Ok(Err(ErrorValue::Value));
    }
    Ok(Ok(bools))
}

fn flatten_reference(
    value: Value,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Vec<Value>, EvalError> {
    let mut out = Vec::new();
    match value {
        Value::Ref(r) => out.push(ec.evaluate_cell_value(r.book, r.sheet, r.row, r.col)?),
        Value::Area(a) => {
            for row in a.first_row..=a.last_row {
                for col in a.first_col..=a.last_col {
                    out.push(ec.evaluate_cell_value(a.book, a.sheet, row, col)?);
                }
            }
        }
        Value::RefList(parts) => {
            for part in parts {
                out.extend(flatten_reference(part, ec)?);
            }
        }
        Value::Array(arr) => out.extend(arr.values),
        other => out.push(other),
    }
    Ok(out)
}

pub(super) fn and(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(match collect_bools(args, ec)? {
        Ok(bools) => Value::Bool(bools.into_iter().all(|b| b)),
        Err(e) => Value::Error(e),
    })
}

pub(super) fn or(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(match collect_bools(args, ec)? {
        Ok(bools) => Value::Bool(bools.into_iter().any(|b| b)),
        Err(e) => Value::Error(e),
    })
}
