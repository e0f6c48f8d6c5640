#![forbid(unsafe_code)]

//! Pull-based spreadsheet formula evaluation.
//!
//! Given a workbook whose formulas have been parsed into postfix token
//! streams, the engine computes the value of any cell on demand, caches
//! intermediate results keyed by `(workbook, sheet, row, column)`,
//! detects circular references across arbitrarily deep formula chains
//! (including collaborating workbooks), and invalidates cached results
//! transitively when inputs change.
//!
//! The main entry point is [`WorkbookEvaluator`]; workbooks plug in
//! through the traits in [`workbook`], and [`SimpleWorkbook`] is a
//! ready-made in-memory implementation:
//!
//! ```
//! use tabula_engine::{SimpleWorkbook, Value, WorkbookEvaluator};
//! use tabula_model::CellRef;
//!
//! let wb = SimpleWorkbook::single_sheet();
//! wb.set_value(0, "A1", 2.0);
//! wb.set_value(0, "A2", 3.0);
//! wb.set_formula(0, "A3", "=A1+A2").unwrap();
//!
//! let evaluator = WorkbookEvaluator::new(wb);
//! let a3 = CellRef::from_a1("A3").unwrap();
//! assert_eq!(evaluator.evaluate(0, a3).unwrap(), Value::Number(5.0));
//! ```

pub mod debug;
pub mod error;
pub mod eval;
pub mod functions;
pub mod parser;
pub mod token;
pub mod value;
pub mod workbook;

pub use error::EvalError;
pub use eval::{
    adjust_region_relative_reference, CollaboratingWorkbooksEnvironment, EvaluationListener,
    StabilityClassifier, WorkbookEvaluator,
};
pub use parser::{FormulaType, ParseError};
pub use tabula_model::ErrorValue;
pub use value::Value;
pub use workbook::SimpleWorkbook;
