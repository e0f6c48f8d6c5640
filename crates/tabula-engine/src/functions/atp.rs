//! The Analysis ToolPak add-in: functions addressed by name through
//! `NameX` tokens rather than by function index. A handful are
//! implemented; the rest of the roster is recognized so workbooks using
//! them parse, and invoking one faults with `NotImplemented`.

use std::rc::Rc;

use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::eval::resolver;
use crate::functions::udf::{NotImplementedUdf, Udf, UdfFinder};
use crate::value::Value;

type AtpFn = fn(&[Value], &mut OperationEvaluationContext<'_, '_>) -> Result<Value, EvalError>;

static IMPLEMENTED: &[(&str, AtpFn)] = &[("ISEVEN", is_even), ("ISODD", is_odd)];

/// Recognized-but-unimplemented ToolPak names.
static ROSTER: &[&str] = &[
    "EDATE",
    "EOMONTH",
    "GCD",
    "LCM",
    "MROUND",
    "NETWORKDAYS",
    "QUOTIENT",
    "RANDBETWEEN",
    "WEEKNUM",
    "WORKDAY",
    "YEARFRAC",
];

pub struct AnalysisToolPak;

impl AnalysisToolPak {
    pub fn is_known_name(name: &str) -> bool {
        Self::lookup_implemented(name).is_some()
            || ROSTER.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn supported_function_names() -> Vec<&'static str> {
        let mut names: Vec<_> = IMPLEMENTED.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names
    }

    pub fn not_supported_function_names() -> Vec<&'static str> {
        let mut names = ROSTER.to_vec();
        names.sort_unstable();
        names
    }

    fn lookup_implemented(name: &str) -> Option<AtpFn> {
        IMPLEMENTED
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| *f)
    }
}

impl UdfFinder for AnalysisToolPak {
    fn find(&self, name: &str) -> Option<Rc<dyn Udf>> {
        if let Some(f) = Self::lookup_implemented(name) {
            return Some(Rc::new(AtpUdf(f)));
        }
        if ROSTER.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            return Some(Rc::new(NotImplementedUdf::new(name.to_ascii_uppercase())));
        }
        None
    }
}

struct AtpUdf(AtpFn);

impl Udf for AtpUdf {
    fn invoke(
        &self,
        args: &[Value],
        ec: &mut OperationEvaluationContext<'_, '_>,
    ) -> Result<Value, EvalError> {
        (self.0)(args, ec)
    }
}

fn parity_arg(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Result<i64, ErrorValue>, EvalError> {
    let Some(arg) = args.first() else {
        return Ok(Err(ErrorValue::Value));
    };
    let single = resolver::get_single_value(arg.clone(), ec.src_row(), ec.src_col(), ec)?;
    Ok(single.coerce_to_number().map(|n| n.trunc() as i64))
}

fn is_even(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(match parity_arg(args, ec)? {
        Ok(n) => Value::Bool(n % 2 == 0),
        Err(e) => Value::Error(e),
    })
}

fn is_odd(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    Ok(match parity_arg(args, ec)? {
        Ok(n) => Value::Bool(n % 2 != 0),
        Err(e) => Value::Error(e),
    })
}
