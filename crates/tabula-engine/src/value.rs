use std::cmp::Ordering;
use std::fmt;

use tabula_model::ErrorValue;

/// A single-cell reference that has been resolved against a workbook and
/// sheet. Plain data: reading the referenced cell goes through the
/// evaluation context, which is where dependency recording happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SingleRef {
    pub book: u32,
    pub sheet: u32,
    pub row: u32,
    pub col: u32,
}

/// A rectangular block of cells resolved against a workbook and sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaRef {
    pub book: u32,
    pub sheet: u32,
    pub first_row: u32,
    pub first_col: u32,
    pub last_row: u32,
    pub last_col: u32,
}

impl AreaRef {
    pub const fn width(&self) -> u32 {
        self.last_col - self.first_col + 1
    }

    pub const fn height(&self) -> u32 {
        self.last_row - self.first_row + 1
    }

    pub const fn contains_row(&self, row: u32) -> bool {
        row >= self.first_row && row <= self.last_row
    }

    pub const fn contains_col(&self, col: u32) -> bool {
        col >= self.first_col && col <= self.last_col
    }

    pub const fn is_single_column(&self) -> bool {
        self.first_col == self.last_col
    }

    pub const fn is_single_row(&self) -> bool {
        self.first_row == self.last_row
    }
}

/// An array literal or array result, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub rows: usize,
    pub cols: usize,
    /// Row-major order values (length = rows * cols).
    pub values: Vec<Value>,
}

impl ArrayValue {
    pub fn new(rows: usize, cols: usize, values: Vec<Value>) -> Self {
        debug_assert_eq!(rows.saturating_mul(cols), values.len());
        Self { rows, cols, values }
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Value> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.values.get(row * self.cols + col)
    }
}

/// The closed set of evaluated values.
///
/// Spreadsheet errors are values (`Value::Error`), propagated as data so
/// operators can decide whether to absorb or forward them. Engine faults
/// travel separately as [`EvalError`](crate::error::EvalError).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    Bool(bool),
    Blank,
    Error(ErrorValue),
    /// Placeholder for an omitted function argument.
    MissingArg,
    /// A resolved single-cell reference, not yet dereferenced.
    Ref(SingleRef),
    /// A resolved 2-D area, not yet dereferenced.
    Area(AreaRef),
    /// A union of references, as produced by the `,` range operator.
    RefList(Vec<Value>),
    Array(ArrayValue),
    /// A function or external name used as an operand (the first argument
    /// of an external function call).
    FunctionName(String),
}

impl Value {
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// Numeric coercion for a *scalar* value. References and areas must
    /// be taken down to a single value first (see
    /// [`resolver`](crate::eval::resolver)).
    pub fn coerce_to_number(&self) -> Result<f64, ErrorValue> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Blank | Value::MissingArg => Ok(0.0),
            Value::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    return Ok(0.0);
                }
                t.parse::<f64>().map_err(|_| ErrorValue::Value)
            }
            Value::Error(e) => Err(*e),
            Value::Ref(_)
            | Value::Area(_)
            | Value::RefList(_)
            | Value::Array(_)
            | Value::FunctionName(_) => Err(ErrorValue::Value),
        }
    }

    pub fn coerce_to_bool(&self) -> Result<bool, ErrorValue> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Blank | Value::MissingArg => Ok(false),
            Value::Text(s) => {
                let t = s.trim();
                if t.eq_ignore_ascii_case("TRUE") {
                    return Ok(true);
                }
                if t.eq_ignore_ascii_case("FALSE") || t.is_empty() {
                    return Ok(false);
                }
                Err(ErrorValue::Value)
            }
            Value::Error(e) => Err(*e),
            Value::Ref(_)
            | Value::Area(_)
            | Value::RefList(_)
            | Value::Array(_)
            | Value::FunctionName(_) => Err(ErrorValue::Value),
        }
    }

    pub fn coerce_to_string(&self) -> Result<String, ErrorValue> {
        match self {
            Value::Text(s) => Ok(s.clone()),
            Value::Number(n) => Ok(format_number_general(*n)),
            Value::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
            Value::Blank | Value::MissingArg => Ok(String::new()),
            Value::Error(e) => Err(*e),
            Value::Ref(_)
            | Value::Area(_)
            | Value::RefList(_)
            | Value::Array(_)
            | Value::FunctionName(_) => Err(ErrorValue::Value),
        }
    }

    /// Spreadsheet comparison ordering for scalars: numbers sort before
    /// text, text before booleans; text comparison is case-insensitive;
    /// blanks compare as the zero value of the other operand's type.
    pub fn compare_scalars(&self, other: &Value) -> Result<Ordering, ErrorValue> {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Number(_) => 0,
                Value::Text(_) => 1,
                Value::Bool(_) => 2,
                _ => 3,
            }
        }

        if let Value::Error(e) = self {
            return Err(*e);
        }
        if let Value::Error(e) = other {
            return Err(*e);
        }

        let a = normalize_blank(self, other);
        let b = normalize_blank(other, self);
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal)),
            (Value::Text(x), Value::Text(y)) => Ok(cmp_case_insensitive(x, y)),
            (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
            _ => Ok(rank(&a).cmp(&rank(&b))),
        }
    }
}

/// A blank compared against a typed operand behaves as that type's zero
/// value (`0`, `""` or `FALSE`).
fn normalize_blank(v: &Value, other: &Value) -> Value {
    if !matches!(v, Value::Blank | Value::MissingArg) {
        return v.clone();
    }
    match other {
        Value::Text(_) => Value::Text(String::new()),
        Value::Bool(_) => Value::Bool(false),
        _ => Value::Number(0.0),
    }
}

pub(crate) fn cmp_case_insensitive(a: &str, b: &str) -> Ordering {
    let mut a_iter = a.chars().flat_map(|c| c.to_uppercase());
    let mut b_iter = b.chars().flat_map(|c| c.to_uppercase());
    loop {
        match (a_iter.next(), b_iter.next()) {
            (Some(ac), Some(bc)) => match ac.cmp(&bc) {
                Ordering::Equal => continue,
                ord => return ord,
            },
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

/// "General" number formatting: integral values print without a decimal
/// point, everything else uses the shortest round-trip form.
pub(crate) fn format_number_general(n: f64) -> String {
    if n == 0.0 {
        // Covers -0.0.
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    format!("{n}")
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<ErrorValue> for Value {
    fn from(value: ErrorValue) -> Self {
        Value::Error(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => f.write_str(&format_number_general(*n)),
            Value::Text(s) => f.write_str(s),
            Value::Bool(b) => f.write_str(if *b { "TRUE" } else { "FALSE" }),
            Value::Blank => Ok(()),
            Value::Error(e) => write!(f, "{e}"),
            Value::MissingArg => f.write_str("<missing>"),
            Value::Ref(r) => write!(
                f,
                "ref[{}]{}",
                r.sheet,
                tabula_model::CellRef::new(r.row, r.col)
            ),
            Value::Area(a) => write!(
                f,
                "area[{}]{}:{}",
                a.sheet,
                tabula_model::CellRef::new(a.first_row, a.first_col),
                tabula_model::CellRef::new(a.last_row, a.last_col)
            ),
            Value::RefList(parts) => write!(f, "reflist({} parts)", parts.len()),
            Value::Array(a) => write!(f, "array({}x{})", a.rows, a.cols),
            Value::FunctionName(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn number_coercion() {
        assert_eq!(Value::Number(2.5).coerce_to_number(), Ok(2.5));
        assert_eq!(Value::Bool(true).coerce_to_number(), Ok(1.0));
        assert_eq!(Value::Blank.coerce_to_number(), Ok(0.0));
        assert_eq!(Value::Text(" 42 ".into()).coerce_to_number(), Ok(42.0));
        assert_eq!(
            Value::Text("forty".into()).coerce_to_number(),
            Err(ErrorValue::Value)
        );
        assert_eq!(
            Value::Error(ErrorValue::Div0).coerce_to_number(),
            Err(ErrorValue::Div0)
        );
    }

    #[test]
    fn bool_coercion_accepts_spellings() {
        assert_eq!(Value::Text("true".into()).coerce_to_bool(), Ok(true));
        assert_eq!(Value::Text("FALSE".into()).coerce_to_bool(), Ok(false));
        assert_eq!(
            Value::Text("yes".into()).coerce_to_bool(),
            Err(ErrorValue::Value)
        );
    }

    #[test]
    fn comparison_is_case_insensitive_and_type_ranked() {
        assert_eq!(
            Value::Text("apple".into()).compare_scalars(&Value::Text("APPLE".into())),
            Ok(Ordering::Equal)
        );
        // Any text sorts above any number.
        assert_eq!(
            Value::Text("1".into()).compare_scalars(&Value::Number(999.0)),
            Ok(Ordering::Greater)
        );
        assert_eq!(
            Value::Bool(false).compare_scalars(&Value::Text("zzz".into())),
            Ok(Ordering::Greater)
        );
    }

    #[test]
    fn blank_compares_as_typed_zero() {
        assert_eq!(
            Value::Blank.compare_scalars(&Value::Number(0.0)),
            Ok(Ordering::Equal)
        );
        assert_eq!(
            Value::Blank.compare_scalars(&Value::Text(String::new())),
            Ok(Ordering::Equal)
        );
        assert_eq!(
            Value::Blank.compare_scalars(&Value::Bool(false)),
            Ok(Ordering::Equal)
        );
    }

    #[test]
    fn general_format_trims_integral_values() {
        assert_eq!(format_number_general(5.0), "5");
        assert_eq!(format_number_general(-0.0), "0");
        assert_eq!(format_number_general(2.5), "2.5");
    }
}
