//! Cross-workbook evaluation through a collaborating environment: a
//! shared cache, cycle detection across books, and the missing-workbook
//! fallback.

use std::rc::Rc;

use pretty_assertions::assert_eq;
use tabula_engine::workbook::CellContent;
use tabula_engine::{
    CollaboratingWorkbooksEnvironment, ErrorValue, EvalError, SimpleWorkbook, Value,
    WorkbookEvaluator,
};
use tabula_model::CellRef;

fn cell(a1: &str) -> CellRef {
    CellRef::from_a1(a1).unwrap()
}

fn book() -> (Rc<SimpleWorkbook>, Rc<WorkbookEvaluator>) {
    let wb = SimpleWorkbook::single_sheet();
    let evaluator = Rc::new(WorkbookEvaluator::new(Rc::clone(&wb)));
    (wb, evaluator)
}

#[test]
fn formulas_can_link_across_workbooks() {
    let (wb1, ev1) = book();
    let (wb2, ev2) = book();
    wb2.set_value(0, "A1", 21.0);
    wb1.set_formula(0, "B1", "=[Book2]Sheet1!A1*2").unwrap();

    let _env = CollaboratingWorkbooksEnvironment::setup(vec![
        ("Book1".to_string(), Rc::clone(&ev1)),
        ("Book2".to_string(), Rc::clone(&ev2)),
    ])
    .unwrap();

    assert_eq!(ev1.book_index(), 0);
    assert_eq!(ev2.book_index(), 1);
    assert_eq!(ev1.evaluate(0, cell("B1")).unwrap(), Value::Number(42.0));

    // The shared cache discriminates by workbook index: invalidating the
    // source cell in Book2 reaches the consumer in Book1.
    ev2.notify_update_cell(0, cell("A1"));
    wb2.set_value(0, "A1", 50.0);
    assert_eq!(ev1.evaluate(0, cell("B1")).unwrap(), Value::Number(100.0));
}

#[test]
fn cross_workbook_formula_chains_evaluate_transitively() {
    let (wb1, ev1) = book();
    let (wb2, ev2) = book();
    wb2.set_value(0, "A1", 5.0);
    wb2.set_formula(0, "B1", "=A1+1").unwrap();
    wb1.set_formula(0, "C1", "=[Book2]Sheet1!B1*10").unwrap();

    let _env = CollaboratingWorkbooksEnvironment::setup(vec![
        ("Book1".to_string(), Rc::clone(&ev1)),
        ("Book2".to_string(), Rc::clone(&ev2)),
    ])
    .unwrap();

    assert_eq!(ev1.evaluate(0, cell("C1")).unwrap(), Value::Number(60.0));
}

#[test]
fn cycles_spanning_workbooks_are_detected() {
    let (wb1, ev1) = book();
    let (wb2, ev2) = book();
    wb1.set_formula(0, "C1", "=[Book2]Sheet1!C1").unwrap();
    wb2.set_formula(0, "C1", "=[Book1]Sheet1!C1").unwrap();

    let _env = CollaboratingWorkbooksEnvironment::setup(vec![
        ("Book1".to_string(), Rc::clone(&ev1)),
        ("Book2".to_string(), Rc::clone(&ev2)),
    ])
    .unwrap();

    assert_eq!(
        ev1.evaluate(0, cell("C1")).unwrap(),
        Value::Error(ErrorValue::Circular)
    );
    assert_eq!(
        ev2.evaluate(0, cell("C1")).unwrap(),
        Value::Error(ErrorValue::Circular)
    );
}

#[test]
fn a_vanished_sheet_in_a_peer_workbook_reads_as_ref_error() {
    let (wb1, ev1) = book();
    let (_wb2, ev2) = book();
    wb1.set_formula(0, "B1", "=[Book2]Nowhere!A1").unwrap();

    let _env = CollaboratingWorkbooksEnvironment::setup(vec![
        ("Book1".to_string(), Rc::clone(&ev1)),
        ("Book2".to_string(), Rc::clone(&ev2)),
    ])
    .unwrap();

    assert_eq!(
        ev1.evaluate(0, cell("B1")).unwrap(),
        Value::Error(ErrorValue::Ref)
    );
}

#[test]
fn missing_workbooks_fault_unless_configured_to_recover() {
    let (wb, evaluator) = book();
    wb.set_formula_with_cached_result(
        0,
        "B1",
        "=[Missing]Sheet1!A1",
        CellContent::Number(99.0),
    )
    .unwrap();

    assert!(matches!(
        evaluator.evaluate(0, cell("B1")),
        Err(EvalError::MissingExternalWorkbook(name)) if name == "Missing"
    ));

    // With the fallback enabled the cell's last stored literal is used;
    // it is not committed to the cache.
    evaluator.set_ignore_missing_workbooks(true);
    assert_eq!(evaluator.evaluate(0, cell("B1")).unwrap(), Value::Number(99.0));
    assert_eq!(evaluator.evaluate(0, cell("B1")).unwrap(), Value::Number(99.0));
}

#[test]
fn missing_workbook_without_a_cached_literal_still_faults() {
    let (wb, evaluator) = book();
    wb.set_formula(0, "B1", "=[Missing]Sheet1!A1").unwrap();
    evaluator.set_ignore_missing_workbooks(true);
    assert!(matches!(
        evaluator.evaluate(0, cell("B1")),
        Err(EvalError::MissingExternalWorkbook(_))
    ));
}

#[test]
fn new_environment_detaches_previous_members() {
    let (wb1, ev1) = book();
    let (wb2, ev2) = book();
    wb2.set_value(0, "A1", 1.0);
    wb1.set_formula(0, "B1", "=[Book2]Sheet1!A1").unwrap();

    let _env = CollaboratingWorkbooksEnvironment::setup(vec![
        ("Book1".to_string(), Rc::clone(&ev1)),
        ("Book2".to_string(), Rc::clone(&ev2)),
    ])
    .unwrap();
    assert_eq!(ev1.evaluate(0, cell("B1")).unwrap(), Value::Number(1.0));
    assert_eq!(ev2.book_index(), 1);

    // Rehoming Book1 into a new environment unhooks the old one
    // entirely: Book2 falls back to a standalone cache and index 0, and
    // Book1 can no longer see it.
    let _env2 =
        CollaboratingWorkbooksEnvironment::setup(vec![("Book1".to_string(), Rc::clone(&ev1))])
            .unwrap();
    assert_eq!(ev2.book_index(), 0);
    assert!(matches!(
        ev1.evaluate(0, cell("B1")),
        Err(EvalError::MissingExternalWorkbook(_))
    ));
}

#[test]
fn duplicate_workbook_names_are_rejected() {
    let (_wb1, ev1) = book();
    let (_wb2, ev2) = book();
    let result = CollaboratingWorkbooksEnvironment::setup(vec![
        ("Book1".to_string(), ev1),
        ("Book1".to_string(), ev2),
    ]);
    assert!(result.is_err());
}
