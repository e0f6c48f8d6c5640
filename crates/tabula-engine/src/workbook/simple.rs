use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use tabula_model::{CellRef, Range, SpreadsheetVersion};

use crate::functions::atp::AnalysisToolPak;
use crate::functions::udf::{AggregatingUdfFinder, UdfFinder};
use crate::parser::{self, FormulaType, ParseError};
use crate::token::Token;
use crate::workbook::{
    CellContent, EvaluationWorkbook, ExternSheet, NameRecord, ParsingWorkbook,
};

#[derive(Debug, Clone, Default)]
struct SimpleCell {
    literal: CellContent,
    tokens: Option<Vec<Token>>,
    /// Last stored result of a formula cell; consulted when evaluation
    /// falls back because an external workbook is missing.
    cached_result: Option<CellContent>,
    array_group: Option<Range>,
}

#[derive(Debug, Default)]
struct SimpleSheet {
    name: String,
    cells: AHashMap<CellRef, SimpleCell>,
}

struct SimpleName {
    name: String,
    /// Scope: a sheet index, or -1 for workbook scope.
    sheet_ix: i32,
    is_function_name: bool,
    definition: Option<Vec<Token>>,
}

/// An in-memory workbook implementing both collaborator traits. All
/// mutators take `&self` (interior mutability) so tests and hosts can
/// keep mutating cells while an evaluator holds the workbook.
pub struct SimpleWorkbook {
    sheets: RefCell<Vec<SimpleSheet>>,
    names: RefCell<Vec<SimpleName>>,
    extern_sheets: RefCell<Vec<ExternSheet>>,
    extern_names: RefCell<Vec<String>>,
    version: SpreadsheetVersion,
    udf_finder: RefCell<Rc<dyn UdfFinder>>,
}

impl SimpleWorkbook {
    pub fn new(version: SpreadsheetVersion) -> Self {
        let toolpak: Rc<dyn UdfFinder> = Rc::new(AnalysisToolPak);
        Self {
            sheets: RefCell::new(Vec::new()),
            names: RefCell::new(Vec::new()),
            extern_sheets: RefCell::new(Vec::new()),
            extern_names: RefCell::new(Vec::new()),
            version,
            udf_finder: RefCell::new(Rc::new(AggregatingUdfFinder::new(vec![toolpak]))),
        }
    }

    /// A workbook with the current format limits and one sheet named
    /// `Sheet1`.
    pub fn single_sheet() -> Rc<Self> {
        let wb = Rc::new(Self::new(SpreadsheetVersion::Excel2007));
        wb.add_sheet("Sheet1");
        wb
    }

    pub fn add_sheet(&self, name: &str) -> u32 {
        let mut sheets = self.sheets.borrow_mut();
        sheets.push(SimpleSheet {
            name: name.to_string(),
            cells: AHashMap::new(),
        });
        (sheets.len() - 1) as u32
    }

    /// Replace the UDF finder (the default chains the analysis add-in).
    pub fn set_udf_finder(&self, finder: Rc<dyn UdfFinder>) {
        *self.udf_finder.borrow_mut() = finder;
    }

    pub fn set_value(&self, sheet_ix: u32, a1: &str, value: impl Into<CellContent>) {
        let cell = CellRef::from_a1(a1).expect("valid A1 reference");
        let mut sheets = self.sheets.borrow_mut();
        let slot = sheets[sheet_ix as usize].cells.entry(cell).or_default();
        slot.literal = value.into();
        slot.tokens = None;
        slot.cached_result = None;
        slot.array_group = None;
    }

    pub fn set_formula(&self, sheet_ix: u32, a1: &str, formula: &str) -> Result<(), ParseError> {
        let tokens = parser::parse(formula, self, FormulaType::Cell, sheet_ix as i32)?;
        self.store_formula(sheet_ix, a1, tokens, None, None);
        Ok(())
    }

    /// Store a formula together with its last known result, the way a
    /// file loader would.
    pub fn set_formula_with_cached_result(
        &self,
        sheet_ix: u32,
        a1: &str,
        formula: &str,
        cached: CellContent,
    ) -> Result<(), ParseError> {
        let tokens = parser::parse(formula, self, FormulaType::Cell, sheet_ix as i32)?;
        self.store_formula(sheet_ix, a1, tokens, Some(cached), None);
        Ok(())
    }

    /// Apply one formula to every cell of `region` as an array-formula
    /// group.
    pub fn set_array_formula(
        &self,
        sheet_ix: u32,
        region_a1: &str,
        formula: &str,
    ) -> Result<(), ParseError> {
        let region = Range::from_a1(region_a1).expect("valid A1 region");
        let tokens = parser::parse(formula, self, FormulaType::ArrayFormula, sheet_ix as i32)?;
        for row in region.start.row..=region.end.row {
            for col in region.start.col..=region.end.col {
                self.store_formula(
                    sheet_ix,
                    &CellRef::new(row, col).to_a1(),
                    tokens.clone(),
                    None,
                    Some(region),
                );
            }
        }
        Ok(())
    }

    pub fn remove_cell(&self, sheet_ix: u32, a1: &str) {
        let cell = CellRef::from_a1(a1).expect("valid A1 reference");
        self.sheets.borrow_mut()[sheet_ix as usize].cells.remove(&cell);
    }

    /// Define a named range (`definition` parsed in named-range mode) or
    /// a bare function name.
    pub fn define_name(
        &self,
        name: &str,
        sheet_scope: i32,
        definition: Option<&str>,
        is_function_name: bool,
    ) -> Result<u32, ParseError> {
        let tokens = match definition {
            Some(text) => Some(parser::parse(
                text,
                self,
                FormulaType::NamedRange,
                sheet_scope,
            )?),
            None => None,
        };
        let mut names = self.names.borrow_mut();
        names.push(SimpleName {
            name: name.to_string(),
            sheet_ix: sheet_scope,
            is_function_name,
            definition: tokens,
        });
        Ok((names.len() - 1) as u32)
    }

    fn store_formula(
        &self,
        sheet_ix: u32,
        a1: &str,
        tokens: Vec<Token>,
        cached: Option<CellContent>,
        array_group: Option<Range>,
    ) {
        let cell = CellRef::from_a1(a1).expect("valid A1 reference");
        let mut sheets = self.sheets.borrow_mut();
        let slot = sheets[sheet_ix as usize].cells.entry(cell).or_default();
        slot.literal = CellContent::Blank;
        slot.tokens = Some(tokens);
        slot.cached_result = cached;
        slot.array_group = array_group;
    }

    fn with_cell<T>(
        &self,
        sheet_ix: u32,
        cell: CellRef,
        f: impl FnOnce(&SimpleCell) -> T,
    ) -> Option<T> {
        let sheets = self.sheets.borrow();
        let sheet = sheets.get(sheet_ix as usize)?;
        sheet.cells.get(&cell).map(f)
    }
}

impl EvaluationWorkbook for SimpleWorkbook {
    fn sheet_count(&self) -> u32 {
        self.sheets.borrow().len() as u32
    }

    fn sheet_index(&self, name: &str) -> Option<u32> {
        self.sheets
            .borrow()
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
            .map(|ix| ix as u32)
    }

    fn sheet_name(&self, sheet_ix: u32) -> Option<String> {
        self.sheets
            .borrow()
            .get(sheet_ix as usize)
            .map(|s| s.name.clone())
    }

    fn is_formula_cell(&self, sheet_ix: u32, cell: CellRef) -> bool {
        self.with_cell(sheet_ix, cell, |c| c.tokens.is_some())
            .unwrap_or(false)
    }

    fn cell_content(&self, sheet_ix: u32, cell: CellRef) -> CellContent {
        self.with_cell(sheet_ix, cell, |c| c.literal.clone())
            .unwrap_or(CellContent::Blank)
    }

    fn formula_tokens(&self, sheet_ix: u32, cell: CellRef) -> Option<Vec<Token>> {
        self.with_cell(sheet_ix, cell, |c| c.tokens.clone())
            .flatten()
    }

    fn cached_formula_result(&self, sheet_ix: u32, cell: CellRef) -> Option<CellContent> {
        self.with_cell(sheet_ix, cell, |c| c.cached_result.clone())
            .flatten()
    }

    fn array_formula_group(&self, sheet_ix: u32, cell: CellRef) -> Option<Range> {
        self.with_cell(sheet_ix, cell, |c| c.array_group).flatten()
    }

    fn name_by_index(&self, name_ix: u32) -> Option<NameRecord> {
        let names = self.names.borrow();
        let record = names.get(name_ix as usize)?;
        Some(NameRecord {
            name: record.name.clone(),
            is_function_name: record.is_function_name,
            definition: record.definition.clone(),
        })
    }

    fn lookup_name(&self, name: &str, sheet_ix: i32) -> Option<u32> {
        let names = self.names.borrow();
        // Sheet scope shadows workbook scope.
        let scoped = names.iter().position(|n| {
            n.sheet_ix == sheet_ix && n.sheet_ix >= 0 && n.name.eq_ignore_ascii_case(name)
        });
        let found = scoped.or_else(|| {
            names
                .iter()
                .position(|n| n.sheet_ix < 0 && n.name.eq_ignore_ascii_case(name))
        })?;
        Some(found as u32)
    }

    fn extern_name(&self, name_ix: u32) -> Option<String> {
        self.extern_names.borrow().get(name_ix as usize).cloned()
    }

    fn extern_sheet(&self, extern_ix: u16) -> Option<ExternSheet> {
        self.extern_sheets.borrow().get(extern_ix as usize).cloned()
    }

    fn convert_from_extern_sheet_index(&self, extern_ix: u16) -> Option<u32> {
        let extern_sheet = self.extern_sheet(extern_ix)?;
        if extern_sheet.workbook.is_some() {
            return None;
        }
        EvaluationWorkbook::sheet_index(self, &extern_sheet.sheet)
    }

    fn spreadsheet_version(&self) -> SpreadsheetVersion {
        self.version
    }

    fn udf_finder(&self) -> Rc<dyn UdfFinder> {
        Rc::clone(&self.udf_finder.borrow())
    }
}

impl ParsingWorkbook for SimpleWorkbook {
    fn sheet_index(&self, name: &str) -> Option<u32> {
        EvaluationWorkbook::sheet_index(self, name)
    }

    fn extern_sheet_index(&self, workbook: Option<&str>, sheet: &str) -> u16 {
        let mut table = self.extern_sheets.borrow_mut();
        if let Some(ix) = table
            .iter()
            .position(|e| e.workbook.as_deref() == workbook && e.sheet.eq_ignore_ascii_case(sheet))
        {
            return ix as u16;
        }
        table.push(ExternSheet {
            workbook: workbook.map(str::to_string),
            sheet: sheet.to_string(),
        });
        (table.len() - 1) as u16
    }

    fn name_index(&self, name: &str, sheet_ix: i32) -> Option<u32> {
        self.lookup_name(name, sheet_ix)
    }

    fn extern_name_index(&self, name: &str) -> Option<u32> {
        // Only names some UDF finder recognizes parse as function calls.
        self.udf_finder.borrow().find(name)?;
        let mut table = self.extern_names.borrow_mut();
        if let Some(ix) = table.iter().position(|n| n.eq_ignore_ascii_case(name)) {
            return Some(ix as u32);
        }
        table.push(name.to_ascii_uppercase());
        Some((table.len() - 1) as u32)
    }

    fn spreadsheet_version(&self) -> SpreadsheetVersion {
        self.version
    }
}

impl From<f64> for CellContent {
    fn from(value: f64) -> Self {
        CellContent::Number(value)
    }
}

impl From<i32> for CellContent {
    fn from(value: i32) -> Self {
        CellContent::Number(f64::from(value))
    }
}

impl From<bool> for CellContent {
    fn from(value: bool) -> Self {
        CellContent::Bool(value)
    }
}

impl From<&str> for CellContent {
    fn from(value: &str) -> Self {
        CellContent::Text(value.to_string())
    }
}

impl From<tabula_model::ErrorValue> for CellContent {
    fn from(value: tabula_model::ErrorValue) -> Self {
        CellContent::Error(value)
    }
}
