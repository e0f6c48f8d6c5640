//! Numeric aggregate functions (`SUM`, `AVERAGE`, `MIN`, `MAX`,
//! `COUNT`, `COUNTA`).
//!
//! All of them walk their arguments element-wise: references and areas
//! are read cell by cell through the evaluation context (recording
//! dependencies), reference unions and arrays are flattened.

use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::value::Value;

/// How an element reached the aggregate: literal arguments coerce
/// aggressively, elements read out of references keep spreadsheet
/// typing (text and booleans in a summed range are skipped, not
/// coerced).
#[derive(Clone, Copy, PartialEq, Eq)]
enum Origin {
    Literal,
    Reference,
}

/// In-band outcome of an element visit.
type Visit = Result<(), ErrorValue>;

fn walk_one(
    value: Value,
    origin: Origin,
    ec: &mut OperationEvaluationContext<'_, '_>,
    visit: &mut impl FnMut(Value, Origin) -> Visit,
) -> Result<Visit, EvalError> {
    match value {
        Value::Ref(r) => {
            let v = ec.evaluate_cell_value(r.book, r.sheet, r.row, r.col)?;
            Ok(visit(v, Origin::Reference))
        }
        Value::Area(a) => {
            for row in a.first_row..=a.last_row {
                for col in a.first_col..=a.last_col {
                    let v = ec.evaluate_cell_value(a.book, a.sheet, row, col)?;
                    if let Err(e) = visit(v, Origin::Reference) {
                        return Ok(Err(e));
                    }
                }
            }
            Ok(Ok(()))
        }
        Value::RefList(parts) => {
            for part in parts {
                if let Err(e) = walk_one(part, origin, ec, visit)? {
                    return Ok(Err(e));
                }
            }
            Ok(Ok(()))
        }
        Value::Array(arr) => {
            for v in arr.values {
                if let Err(e) = visit(v, Origin::Reference) {
                    return Ok(Err(e));
                }
            }
            Ok(Ok(()))
        }
        scalar => Ok(visit(scalar, origin)),
    }
}

fn walk_args(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
    visit: &mut impl FnMut(Value, Origin) -> Visit,
) -> Result<Visit, EvalError> {
    for arg in args {
        if let Err(e) = walk_one(arg.clone(), Origin::Literal, ec, visit)? {
            return Ok(Err(e));
        }
    }
    Ok(Ok(()))
}

/// Collect the numeric elements of the arguments with `SUM`-style
/// coercion rules.
fn collect_numbers(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Result<Vec<f64>, ErrorValue>, EvalError> {
    let mut numbers = Vec::new();
    let outcome = walk_args(args, ec, &mut |value, origin| {
        match (origin, &value) {
            (_, Value::Error(e)) => return Err(*e),
            (_, Value::Number(n)) => numbers.push(*n),
            // Text and booleans inside a referenced range are skipped.
            (Origin::Reference, _) => {}
            (Origin::Literal, Value::Blank | Value::MissingArg) => {}
            (Origin::Literal, _) => numbers.push(value.coerce_to_number()?),
        }
        Ok(())
    })?;
    Ok(outcome.map(|()| numbers))
}

macro_rules! in_band {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return Ok(Value::Error(e)),
        }
    };
}

pub(super) fn sum(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let numbers = in_band!(collect_numbers(args, ec)?);
    Ok(Value::Number(numbers.iter().sum()))
}

pub(super) fn average(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let numbers = in_band!(collect_numbers(args, ec)?);
    if numbers.is_empty() {
        return Ok(Value::Error(ErrorValue::Div0));
    }
    Ok(Value::Number(
        numbers.iter().sum::<f64>() / numbers.len() as f64,
    ))
}

/// `MIN`/`MAX` over no numeric elements evaluate to zero.
pub(super) fn min(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let numbers = in_band!(collect_numbers(args, ec)?);
    if numbers.is_empty() {
        return Ok(Value::Number(0.0));
    }
    Ok(Value::Number(
        numbers.iter().copied().fold(f64::INFINITY, f64::min),
    ))
}

pub(super) fn max(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let numbers = in_band!(collect_numbers(args, ec)?);
    if numbers.is_empty() {
        return Ok(Value::Number(0.0));
    }
    Ok(Value::Number(
        numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    ))
}

/// `COUNT`: numeric elements only. Errors and non-numeric values inside
/// references are skipped, coercible literal arguments count.
pub(super) fn count(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let mut count = 0u64;
    let outcome = walk_args(args, ec, &mut |value, origin| {
        match (origin, &value) {
            (_, Value::Number(_)) => count += 1,
            (Origin::Literal, Value::Error(e)) => return Err(*e),
            (Origin::Literal, Value::Blank | Value::MissingArg) => {}
            (Origin::Literal, other) => {
                if other.coerce_to_number().is_ok() {
                    count += 1;
                }
            }
            (Origin::Reference, _) => {}
        }
        Ok(())
    })?;
    in_band!(outcome);
    Ok(Value::Number(count as f64))
}

/// `COUNTA`: non-blank elements, errors included.
pub(super) fn counta(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let mut count = 0u64;
    let outcome = walk_args(args, ec, &mut |value, _| {
        if !matches!(value, Value::Blank | Value::MissingArg) {
            count += 1;
        }
        Ok(())
    })?;
    in_band!(outcome);
    Ok(Value::Number(count as f64))
}
