//! Built-in function registry and implementations.
//!
//! Built-ins are indexed by the numeric function code the parser assigns
//! (the BIFF function indexes); add-in and user functions are looked up
//! by name through [`UdfFinder`](udf::UdfFinder). Registry entries
//! without an implementation are recognized by the parser but fault with
//! `NotImplemented` when invoked.

mod aggregate;
pub mod atp;
mod datetime;
mod info;
pub(crate) mod logical;
mod numeric;
pub mod udf;

use tabula_model::ErrorValue;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::token::FUNCTION_INDEX_EXTERNAL;
use crate::value::Value;

pub(crate) type BuiltinFn =
    fn(&[Value], &mut OperationEvaluationContext<'_, '_>) -> Result<Value, EvalError>;

pub struct FunctionMeta {
    pub index: u16,
    pub name: &'static str,
    pub min_args: u8,
    pub max_args: u8,
    /// Volatile functions mark the evaluating formula as input-sensitive.
    pub volatile: bool,
    pub(crate) implementation: Option<BuiltinFn>,
}

/// Well-known function indexes referenced outside the table.
pub(crate) mod idx {
    pub const COUNT: u16 = 0;
    pub const IF: u16 = 1;
    pub const SUM: u16 = 4;
    pub const CHOOSE: u16 = 100;
}

/// The function-index table. Indexes follow the BIFF assignments so
/// token streams stay compatible with the file formats.
static METADATA: &[FunctionMeta] = &[
    FunctionMeta { index: idx::COUNT, name: "COUNT", min_args: 1, max_args: 255, volatile: false, implementation: Some(aggregate::count) },
    FunctionMeta { index: idx::IF, name: "IF", min_args: 2, max_args: 3, volatile: false, implementation: Some(logical::if_func) },
    FunctionMeta { index: 2, name: "ISNA", min_args: 1, max_args: 1, volatile: false, implementation: Some(info::is_na) },
    FunctionMeta { index: 3, name: "ISERROR", min_args: 1, max_args: 1, volatile: false, implementation: Some(info::is_error) },
    FunctionMeta { index: idx::SUM, name: "SUM", min_args: 1, max_args: 255, volatile: false, implementation: Some(aggregate::sum) },
    FunctionMeta { index: 5, name: "AVERAGE", min_args: 1, max_args: 255, volatile: false, implementation: Some(aggregate::average) },
    FunctionMeta { index: 6, name: "MIN", min_args: 1, max_args: 255, volatile: false, implementation: Some(aggregate::min) },
    FunctionMeta { index: 7, name: "MAX", min_args: 1, max_args: 255, volatile: false, implementation: Some(aggregate::max) },
    FunctionMeta { index: 8, name: "ROW", min_args: 0, max_args: 1, volatile: false, implementation: Some(info::row) },
    FunctionMeta { index: 9, name: "COLUMN", min_args: 0, max_args: 1, volatile: false, implementation: Some(info::column) },
    FunctionMeta { index: 10, name: "NA", min_args: 0, max_args: 0, volatile: false, implementation: Some(info::na) },
    FunctionMeta { index: 24, name: "ABS", min_args: 1, max_args: 1, volatile: false, implementation: Some(numeric::abs) },
    FunctionMeta { index: 27, name: "ROUND", min_args: 2, max_args: 2, volatile: false, implementation: Some(numeric::round) },
    FunctionMeta { index: 28, name: "LOOKUP", min_args: 2, max_args: 3, volatile: false, implementation: None },
    FunctionMeta { index: 29, name: "INDEX", min_args: 2, max_args: 4, volatile: false, implementation: None },
    FunctionMeta { index: 34, name: "TRUE", min_args: 0, max_args: 0, volatile: false, implementation: Some(logical::true_func) },
    FunctionMeta { index: 35, name: "FALSE", min_args: 0, max_args: 0, volatile: false, implementation: Some(logical::false_func) },
    FunctionMeta { index: 36, name: "AND", min_args: 1, max_args: 255, volatile: false, implementation: Some(logical::and) },
    FunctionMeta { index: 37, name: "OR", min_args: 1, max_args: 255, volatile: false, implementation: Some(logical::or) },
    FunctionMeta { index: 38, name: "NOT", min_args: 1, max_args: 1, volatile: false, implementation: Some(logical::not) },
    FunctionMeta { index: 39, name: "MOD", min_args: 2, max_args: 2, volatile: false, implementation: Some(numeric::modulo) },
    FunctionMeta { index: 63, name: "RAND", min_args: 0, max_args: 0, volatile: true, implementation: None },
    FunctionMeta { index: 64, name: "MATCH", min_args: 2, max_args: 3, volatile: false, implementation: None },
    FunctionMeta { index: 74, name: "NOW", min_args: 0, max_args: 0, volatile: true, implementation: Some(datetime::now) },
    FunctionMeta { index: 78, name: "OFFSET", min_args: 3, max_args: 5, volatile: true, implementation: None },
    FunctionMeta { index: idx::CHOOSE, name: "CHOOSE", min_args: 2, max_args: 255, volatile: false, implementation: Some(logical::choose) },
    FunctionMeta { index: 101, name: "HLOOKUP", min_args: 3, max_args: 4, volatile: false, implementation: None },
    FunctionMeta { index: 102, name: "VLOOKUP", min_args: 3, max_args: 4, volatile: false, implementation: None },
    FunctionMeta { index: 129, name: "ISBLANK", min_args: 1, max_args: 1, volatile: false, implementation: Some(info::is_blank) },
    FunctionMeta { index: 148, name: "INDIRECT", min_args: 1, max_args: 2, volatile: true, implementation: None },
    FunctionMeta { index: 169, name: "COUNTA", min_args: 1, max_args: 255, volatile: false, implementation: Some(aggregate::counta) },
    FunctionMeta { index: 221, name: "TODAY", min_args: 0, max_args: 0, volatile: true, implementation: Some(datetime::today) },
];

pub fn by_index(index: u16) -> Option<&'static FunctionMeta> {
    METADATA.iter().find(|m| m.index == index)
}

pub fn by_name(name: &str) -> Option<&'static FunctionMeta> {
    METADATA.iter().find(|m| m.name.eq_ignore_ascii_case(name))
}

/// Names of built-ins that actually have an implementation.
pub fn supported_function_names() -> Vec<&'static str> {
    let mut names: Vec<_> = METADATA
        .iter()
        .filter(|m| m.implementation.is_some())
        .map(|m| m.name)
        .collect();
    names.sort_unstable();
    names
}

/// Names the parser recognizes but the evaluator cannot compute.
pub fn not_supported_function_names() -> Vec<&'static str> {
    let mut names: Vec<_> = METADATA
        .iter()
        .filter(|m| m.implementation.is_none())
        .map(|m| m.name)
        .collect();
    names.sort_unstable();
    names
}

/// Dispatch a function-call token.
pub(crate) fn invoke(
    func_ix: u16,
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    if func_ix == FUNCTION_INDEX_EXTERNAL {
        return invoke_external(args, ec);
    }
    let meta = by_index(func_ix).ok_or_else(|| {
        EvalError::MalformedFormula(format!("unknown function index {func_ix}"))
    })?;
    let Some(implementation) = meta.implementation else {
        return Err(EvalError::not_implemented(meta.name));
    };
    // The parser enforces argument counts; a stream that arrives with a
    // wrong arity anyway degrades to #VALUE! instead of indexing past
    // the operand slice.
    if args.len() < usize::from(meta.min_args) || args.len() > usize::from(meta.max_args) {
        return Ok(Value::Error(ErrorValue::Value));
    }
    if meta.volatile {
        ec.mark_volatile();
    }
    implementation(args, ec)
}

/// An external call: the first operand is the name pushed by the `NameX`
/// token, the rest are the user-visible arguments.
fn invoke_external(
    args: &[Value],
    ec: &mut OperationEvaluationContext<'_, '_>,
) -> Result<Value, EvalError> {
    let Some((Value::FunctionName(name), rest)) = args.split_first() else {
        return Err(EvalError::MalformedFormula(
            "external function call without a name operand".to_string(),
        ));
    };
    let name = name.clone();
    match ec.find_udf(&name) {
        Some(udf) => udf.invoke(rest, ec),
        None => Err(EvalError::not_implemented(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_are_unique() {
        for (i, a) in METADATA.iter().enumerate() {
            for b in &METADATA[i + 1..] {
                assert_ne!(a.index, b.index, "{} and {} share an index", a.name, b.name);
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn lookups_are_case_insensitive() {
        assert_eq!(by_name("sum").unwrap().index, idx::SUM);
        assert_eq!(by_name("Choose").unwrap().index, idx::CHOOSE);
        assert!(by_name("NO_SUCH_FN").is_none());
    }

    #[test]
    fn supported_and_not_supported_partition_the_table() {
        let supported = supported_function_names();
        let not_supported = not_supported_function_names();
        assert!(supported.contains(&"SUM"));
        assert!(not_supported.contains(&"VLOOKUP"));
        assert_eq!(supported.len() + not_supported.len(), METADATA.len());
    }
}
