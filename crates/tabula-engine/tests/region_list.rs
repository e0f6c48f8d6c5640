//! Region-relative reference adjustment and data-validation-list
//! evaluation.

use std::rc::Rc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tabula_engine::parser::{parse, FormulaType};
use tabula_engine::token::{RefToken, Token};
use tabula_engine::{
    adjust_region_relative_reference, EvalError, SimpleWorkbook, Value, WorkbookEvaluator,
};
use tabula_model::{CellRef, Range, SpreadsheetVersion};

fn cell(a1: &str) -> CellRef {
    CellRef::from_a1(a1).unwrap()
}

fn fixture() -> (Rc<SimpleWorkbook>, WorkbookEvaluator) {
    let wb = SimpleWorkbook::single_sheet();
    let evaluator = WorkbookEvaluator::new(Rc::clone(&wb));
    (wb, evaluator)
}

fn parse_cell_formula(wb: &SimpleWorkbook, formula: &str) -> Vec<Token> {
    parse(formula, wb, FormulaType::Cell, 0).unwrap()
}

#[test]
fn validation_list_shifts_relative_references_to_the_target() {
    let (wb, evaluator) = fixture();
    wb.set_value(0, "A5", 1.0);
    wb.set_value(0, "A6", 2.0);
    wb.set_value(0, "A7", 3.0);

    // The list formula was authored for the first cell of B1:B3; asking
    // for the dropdown of B5 shifts every relative reference down by 4.
    let region = Range::from_a1("B1:B3").unwrap();
    let result = evaluator
        .evaluate_list("=A1:A3", "Sheet1", cell("B5"), region)
        .unwrap();

    let Value::Area(area) = result else {
        panic!("expected an area result, got {result:?}");
    };
    assert_eq!((area.first_row, area.last_row), (4, 6));
    assert_eq!(
        evaluator.evaluate_area_values(&area).unwrap(),
        vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
    );
}

#[test]
fn validation_list_at_the_region_origin_is_unshifted() {
    let (wb, evaluator) = fixture();
    wb.set_value(0, "A1", 9.0);

    let region = Range::from_a1("B1:B3").unwrap();
    let result = evaluator
        .evaluate_list("=A1:A1", "Sheet1", cell("B1"), region)
        .unwrap();
    let Value::Area(area) = result else {
        panic!("expected an area result, got {result:?}");
    };
    assert_eq!((area.first_row, area.first_col), (0, 0));
}

#[test]
fn absolute_references_do_not_shift() {
    let (wb, _evaluator) = fixture();
    let mut tokens = parse_cell_formula(&wb, "=$A$1+A1");
    let shifted =
        adjust_region_relative_reference(&mut tokens, 3, 2, SpreadsheetVersion::Excel2007)
            .unwrap();
    assert!(shifted);
    assert_eq!(
        tokens[0],
        Token::Ref(RefToken {
            row: 0,
            col: 0,
            row_relative: false,
            col_relative: false,
        })
    );
    assert_eq!(
        tokens[1],
        Token::Ref(RefToken {
            row: 3,
            col: 2,
            row_relative: true,
            col_relative: true,
        })
    );
}

#[test]
fn zero_delta_is_the_identity() {
    let (wb, _evaluator) = fixture();
    for formula in ["=A1+B2", "=SUM(A1:C3)", "=IF(A1,B1,C1)"] {
        let mut tokens = parse_cell_formula(&wb, formula);
        let before = tokens.clone();
        let shifted =
            adjust_region_relative_reference(&mut tokens, 0, 0, SpreadsheetVersion::Excel2007)
                .unwrap();
        assert!(!shifted, "{formula}");
        assert_eq!(tokens, before, "{formula}");
    }
}

#[test]
fn negative_deltas_are_rejected() {
    let (wb, _evaluator) = fixture();
    let mut tokens = parse_cell_formula(&wb, "=A1");
    assert!(matches!(
        adjust_region_relative_reference(&mut tokens, -1, 0, SpreadsheetVersion::Excel2007),
        Err(EvalError::OutOfBounds(_))
    ));
}

#[test]
fn shifting_to_the_row_limit_is_accepted_one_past_is_not() {
    let wb = SimpleWorkbook::new(SpreadsheetVersion::Excel97);
    wb.add_sheet("Sheet1");
    let version = SpreadsheetVersion::Excel97;

    let mut tokens = parse("=A1", &wb, FormulaType::Cell, 0).unwrap();
    let max = i64::from(version.max_rows());

    let mut accepted = tokens.clone();
    adjust_region_relative_reference(&mut accepted, max, 0, version).unwrap();
    let Token::Ref(r) = &accepted[0] else {
        panic!("expected a reference token");
    };
    assert_eq!(i64::from(r.row), max);

    assert!(matches!(
        adjust_region_relative_reference(&mut tokens, max + 1, 0, version),
        Err(EvalError::OutOfBounds(_))
    ));
}

#[test]
fn out_of_region_targets_are_rejected() {
    let (wb, evaluator) = fixture();
    wb.set_value(0, "A1", 1.0);
    let region = Range::from_a1("B5:B7").unwrap();
    // A target above the region would need a negative delta.
    assert!(matches!(
        evaluator.evaluate_list("=A1", "Sheet1", cell("B2"), region),
        Err(EvalError::OutOfBounds(_))
    ));
}

proptest! {
    /// Shifting the relative reference `A1` lands exactly on the delta,
    /// for any in-bounds delta.
    #[test]
    fn shift_moves_relative_refs_by_the_delta(delta_row in 0i64..10_000, delta_col in 0i64..1_000) {
        let wb = SimpleWorkbook::single_sheet();
        let mut tokens = parse("=A1", &*wb, FormulaType::Cell, 0).unwrap();
        adjust_region_relative_reference(
            &mut tokens,
            delta_row,
            delta_col,
            SpreadsheetVersion::Excel2007,
        )
        .unwrap();
        let Token::Ref(r) = &tokens[0] else {
            panic!("expected a reference token");
        };
        prop_assert_eq!(i64::from(r.row), delta_row);
        prop_assert_eq!(i64::from(r.col), delta_col);
    }
}
