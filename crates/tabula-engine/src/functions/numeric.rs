use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::eval::resolver;
use crate::value::Value;

fn single_number(
    value: &Value,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Result<f64, ErrorValue>, EvalError> {
    let single = resolver::get_single_value(value.clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(single.coerce_to_number())
}

macro_rules! in_band {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return Ok(Value::Error(e)),
        }
    };
}

pub(super) fn abs(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let n = in_band!(single_number(&args[0], ec)?);
    Ok(Value::Number(n.abs()))
}

/// Round half away from zero, like the spreadsheet `ROUND`.
pub(super) fn round(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let n = in_band!(single_number(&args[0], ec)?);
    let digits = in_band!(single_number(&args[1], ec)?).trunc() as i32;
    let scale = 10f64.powi(digits);
    if !scale.is_finite() || scale == 0.0 {
        return Ok(Value::Error(ErrorValue::Num));
    }
    Ok(Value::Number((n * scale).round() / scale))
}

/// `MOD` takes the sign of the divisor.
pub(super) fn modulo(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let n = in_band!(single_number(&args[0], ec)?);
    let d = in_band!(single_number(&args[1], ec)?);
    if d == 0.0 {
        return Ok(Value::Error(ErrorValue::Div0));
    }
    Ok(Value::Number(n - d * (n / d).floor()))
}
