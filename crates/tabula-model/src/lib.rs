#![forbid(unsafe_code)]

//! Shared data model for the tabula formula engine: cell addresses and
//! ranges (0-indexed, A1 round-tripping), the closed set of spreadsheet
//! error codes, and the row/column limits of the supported file formats.
//!
//! Everything here is plain data. The evaluation engine lives in
//! `tabula-engine` and consumes these types through its collaborator
//! traits.

mod address;
mod error;
mod version;

pub use address::{col_to_name, name_to_col, A1ParseError, CellRef, Range};
pub use error::ErrorValue;
pub use version::SpreadsheetVersion;
