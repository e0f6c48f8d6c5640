//! Operator implementations for the stack VM: small data objects that
//! declare their arity and are dispatched through a single table keyed by
//! the operator token.

use std::cmp::Ordering;

use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::eval::resolver;
use crate::token::Token;
use crate::value::Value;

pub(crate) type OperatorFn =
    fn(&[Value], &mut OperationEvaluationContext<'_, '_>) -> Result<Value, EvalError>;

pub(crate) struct Operator {
    pub arity: u8,
    pub eval: OperatorFn,
}

/// Look up the implementation for an operator token. Function-call
/// tokens are dispatched through the function registry instead.
pub(crate) fn lookup(token: &Token) -> Option<&'static Operator> {
    Some(match token {
        Token::Percent => &PERCENT,
        Token::UnaryPlus => &UNARY_PLUS,
        Token::UnaryMinus => &UNARY_MINUS,
        Token::Add => &ADD,
        Token::Sub => &SUB,
        Token::Mul => &MUL,
        Token::Div => &DIV,
        Token::Pow => &POW,
        Token::Concat => &CONCAT,
        Token::Eq => &CMP_EQ,
        Token::Ne => &CMP_NE,
        Token::Lt => &CMP_LT,
        Token::Le => &CMP_LE,
        Token::Gt => &CMP_GT,
        Token::Ge => &CMP_GE,
        _ => return None,
    })
}

/// Resolve one operand to a scalar number; in-band errors short-circuit
/// as `Err` of the *spreadsheet* error so callers can forward them.
fn operand_number(
    value: &Value,
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Result<f64, ErrorValue>, EvalError> {
    let single = resolver::get_single_value(value.clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(single.coerce_to_number())
}

macro_rules! try_in_band {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return Ok(Value::Error(e)),
        }
    };
}

fn eval_percent(
    ops: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let n = try_in_band!(operand_number(&ops[0], ec)?);
    Ok(Value::Number(n / 100.0))
}

fn eval_unary_plus(
    ops: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    // Unary plus preserves the operand (including text), it only forces
    // dereferencing.
    let single = resolver::get_single_value(ops[0].clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(single)
}

fn eval_unary_minus(
    ops: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let n = try_in_band!(operand_number(&ops[0], ec)?);
    Ok(Value::Number(-n))
}

macro_rules! numeric_binop {
    ($name:ident, |$a:ident, $b:ident| $body:expr) => {
        fn $name(
            ops: &[Value],
            ec: &mut OperationEvaluationContext<'_, '_>,
        ) -> Result<Value, EvalError> {
            let $a = try_in_band!(operand_number(&ops[0], ec)?);
            let $b = try_in_band!(operand_number(&ops[1], ec)?);
            Ok($body)
        }
    };
}

numeric_binop!(eval_add, |a, b| Value::Number(a + b));
numeric_binop!(eval_sub, |a, b| Value::Number(a - b));
numeric_binop!(eval_mul, |a, b| Value::Number(a * b));

numeric_binop!(eval_div, |a, b| {
    if b == 0.0 {
        Value::Error(ErrorValue::Div0)
    } else {
        Value::Number(a / b)
    }
});

numeric_binop!(eval_pow, |a, b| {
    let result = a.powf(b);
    if result.is_finite() {
        Value::Number(result)
    } else if a == 0.0 && b < 0.0 {
        Value::Error(ErrorValue::Div0)
    } else {
        Value::Error(ErrorValue::Num)
    }
});

fn eval_concat(
    ops: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let lhs = resolver::get_single_value(ops[0].clone(), ec.src_row(), ec.src_col(), ec)?;
    let rhs = resolver::get_single_value(ops[1].clone(), ec.src_row(), ec.src_col(), ec)?;
    let a = try_in_band!(lhs.coerce_to_string());
    let b = try_in_band!(rhs.coerce_to_string());
    Ok(Value::Text(a + &b))
}

fn compare(
    ops: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
    accept: fn(Ordering) -> bool,
) -> Result<Value, EvalError> {
    let lhs = resolver::get_single_value(ops[0].clone(), ec.src_row(), ec.src_col(), ec)?;
    let rhs = resolver::get_single_value(ops[1].clone(), ec.src_row(), ec.src_col(), ec)?;
    let ordering = try_in_band!(lhs.compare_scalars(&rhs));
    Ok(Value::Bool(accept(ordering)))
}

macro_rules! comparison {
    ($name:ident, $accept:expr) => {
        fn $name(
            ops: &[Value],
            ec: &mut OperationEvaluationContext<'_, '_>,
        ) -> Result<Value, EvalError> {
            compare(ops, ec, $accept)
        }
    };
}

comparison!(eval_eq, |o| o == Ordering::Equal);
comparison!(eval_ne, |o| o != Ordering::Equal);
comparison!(eval_lt, |o| o == Ordering::Less);
comparison!(eval_le, |o| o != Ordering::Greater);
comparison!(eval_gt, |o| o == Ordering::Greater);
comparison!(eval_ge, |o| o != Ordering::Less);

static PERCENT: Operator = Operator {
    arity: 1,
    eval: eval_percent,
};
static UNARY_PLUS: Operator = Operator {
    arity: 1,
    eval: eval_unary_plus,
};
static UNARY_MINUS: Operator = Operator {
    arity: 1,
    eval: eval_unary_minus,
};
static ADD: Operator = Operator {
    arity: 2,
    eval: eval_add,
};
static SUB: Operator = Operator {
    arity: 2,
    eval: eval_sub,
};
static MUL: Operator = Operator {
    arity: 2,
    eval: eval_mul,
};
static DIV: Operator = Operator {
    arity: 2,
    eval: eval_div,
};
static POW: Operator = Operator {
    arity: 2,
    eval: eval_pow,
};
static CONCAT: Operator = Operator {
    arity: 2,
    eval: eval_concat,
};
static CMP_EQ: Operator = Operator {
    arity: 2,
    eval: eval_eq,
};
static CMP_NE: Operator = Operator {
    arity: 2,
    eval: eval_ne,
};
static CMP_LT: Operator = Operator {
    arity: 2,
    eval: eval_lt,
};
static CMP_LE: Operator = Operator {
    arity: 2,
    eval: eval_le,
};
static CMP_GT: Operator = Operator {
    arity: 2,
    eval: eval_gt,
};
static CMP_GE: Operator = Operator {
    arity: 2,
    eval: eval_ge,
};
