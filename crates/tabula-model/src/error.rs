use core::fmt;

use serde::{Deserialize, Serialize};

/// Spreadsheet error codes.
///
/// These are *values*, not faults: formulas evaluate to them and
/// operators propagate them per spreadsheet semantics. `Circular` is
/// engine-internal (a detected circular reference); it has no
/// representation in the file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorValue {
    /// `#NULL!`
    Null,
    /// `#DIV/0!`
    Div0,
    /// `#VALUE!`
    Value,
    /// `#REF!`
    Ref,
    /// `#NAME?`
    Name,
    /// `#NUM!`
    Num,
    /// `#N/A`
    NA,
    /// `#CIRCULAR!` (engine-internal)
    Circular,
}

impl ErrorValue {
    /// The canonical spelling, including punctuation.
    pub const fn as_code(self) -> &'static str {
        match self {
            ErrorValue::Null => "#NULL!",
            ErrorValue::Div0 => "#DIV/0!",
            ErrorValue::Value => "#VALUE!",
            ErrorValue::Ref => "#REF!",
            ErrorValue::Name => "#NAME?",
            ErrorValue::Num => "#NUM!",
            ErrorValue::NA => "#N/A",
            ErrorValue::Circular => "#CIRCULAR!",
        }
    }

    /// The BIFF error constant stored in the file formats.
    ///
    /// `Circular` never appears in a file; it gets a sentinel outside the
    /// BIFF range.
    pub const fn biff_code(self) -> u16 {
        match self {
            ErrorValue::Null => 0x00,
            ErrorValue::Div0 => 0x07,
            ErrorValue::Value => 0x0F,
            ErrorValue::Ref => 0x17,
            ErrorValue::Name => 0x1D,
            ErrorValue::Num => 0x24,
            ErrorValue::NA => 0x2A,
            ErrorValue::Circular => 0xFFC4,
        }
    }

    pub fn from_biff_code(code: u16) -> Option<Self> {
        match code {
            0x00 => Some(ErrorValue::Null),
            0x07 => Some(ErrorValue::Div0),
            0x0F => Some(ErrorValue::Value),
            0x17 => Some(ErrorValue::Ref),
            0x1D => Some(ErrorValue::Name),
            0x24 => Some(ErrorValue::Num),
            0x2A => Some(ErrorValue::NA),
            _ => None,
        }
    }

    /// Parse an error literal (e.g. `#DIV/0!`).
    pub fn from_code(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        for candidate in [
            ErrorValue::Null,
            ErrorValue::Div0,
            ErrorValue::Value,
            ErrorValue::Ref,
            ErrorValue::Name,
            ErrorValue::Num,
            ErrorValue::NA,
            ErrorValue::Circular,
        ] {
            if raw.eq_ignore_ascii_case(candidate.as_code()) {
                return Some(candidate);
            }
        }
        None
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for e in [
            ErrorValue::Null,
            ErrorValue::Div0,
            ErrorValue::Value,
            ErrorValue::Ref,
            ErrorValue::Name,
            ErrorValue::Num,
            ErrorValue::NA,
        ] {
            assert_eq!(ErrorValue::from_code(e.as_code()), Some(e));
            assert_eq!(ErrorValue::from_biff_code(e.biff_code()), Some(e));
        }
    }

    #[test]
    fn circular_is_not_a_file_format_code() {
        assert_eq!(ErrorValue::from_biff_code(ErrorValue::Circular.biff_code()), None);
        assert_eq!(ErrorValue::from_code("#CIRCULAR!"), Some(ErrorValue::Circular));
    }
}
