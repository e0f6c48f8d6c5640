use thiserror::Error;

use crate::parser::ParseError;

/// Engine faults: conditions that mean the inputs or the implementation
/// are broken, as opposed to user-formula errors which travel in-band as
/// [`Value::Error`](crate::value::Value::Error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Bad token-size arithmetic, an empty or over-filled operand stack,
    /// or an unknown token in the middle of a formula.
    #[error("malformed formula: {0}")]
    MalformedFormula(String),

    /// A cell was addressed through a sheet that does not belong to the
    /// evaluating workbook.
    #[error("sheet {0:?} is not part of this workbook")]
    ForeignSheet(String),

    /// A region-relative shift pushed a reference past the row or column
    /// limit of the workbook's spreadsheet version.
    #[error("shifted reference out of bounds: {0}")]
    OutOfBounds(String),

    /// A token the evaluator cannot process (shared-formula host
    /// references, unrecognized token classes).
    #[error("unsupported formula token: {0}")]
    Unsupported(&'static str),

    /// A function named in the formula has no implementation. The cell
    /// address is attached on the way out of the evaluator.
    #[error("function not implemented: {what}{}", .cell.as_deref().map(|c| format!(" (while evaluating cell {c})")).unwrap_or_default())]
    NotImplemented {
        what: String,
        cell: Option<String>,
    },

    /// A formula references a collaborating workbook that is not part of
    /// the current environment. Recoverable when the evaluator is
    /// configured to ignore missing workbooks.
    #[error("could not resolve external workbook name {0:?}")]
    MissingExternalWorkbook(String),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl EvalError {
    pub fn not_implemented(what: impl Into<String>) -> Self {
        EvalError::NotImplemented {
            what: what.into(),
            cell: None,
        }
    }

    /// Attach the triggering cell address to a `NotImplemented` fault,
    /// keeping the innermost address if one is already present.
    pub(crate) fn with_cell_address(self, address: String) -> Self {
        match self {
            EvalError::NotImplemented { what, cell: None } => EvalError::NotImplemented {
                what,
                cell: Some(address),
            },
            other => other,
        }
    }
}
