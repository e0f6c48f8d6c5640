use serde::{Deserialize, Serialize};

/// Row/column limits of the supported workbook file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpreadsheetVersion {
    /// BIFF8 (`.xls`): 65,536 rows by 256 columns.
    Excel97,
    /// OOXML (`.xlsx`): 1,048,576 rows by 16,384 columns.
    Excel2007,
}

impl SpreadsheetVersion {
    pub const fn name(self) -> &'static str {
        match self {
            SpreadsheetVersion::Excel97 => "EXCEL97",
            SpreadsheetVersion::Excel2007 => "EXCEL2007",
        }
    }

    /// Total number of rows (one past the last valid 0-based index).
    pub const fn max_rows(self) -> u32 {
        match self {
            SpreadsheetVersion::Excel97 => 0x10000,
            SpreadsheetVersion::Excel2007 => 0x100000,
        }
    }

    /// Total number of columns.
    pub const fn max_cols(self) -> u32 {
        match self {
            SpreadsheetVersion::Excel97 => 0x100,
            SpreadsheetVersion::Excel2007 => 0x4000,
        }
    }

    pub const fn last_row_index(self) -> u32 {
        self.max_rows() - 1
    }

    pub const fn last_column_index(self) -> u32 {
        self.max_cols() - 1
    }

    /// Maximum number of arguments a function call may take.
    pub const fn max_function_args(self) -> u8 {
        match self {
            SpreadsheetVersion::Excel97 => 30,
            SpreadsheetVersion::Excel2007 => 255,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_match_the_formats() {
        assert_eq!(SpreadsheetVersion::Excel97.max_rows(), 65_536);
        assert_eq!(SpreadsheetVersion::Excel97.max_cols(), 256);
        assert_eq!(SpreadsheetVersion::Excel2007.last_row_index(), 1_048_575);
        assert_eq!(SpreadsheetVersion::Excel2007.last_column_index(), 16_383);
    }
}
