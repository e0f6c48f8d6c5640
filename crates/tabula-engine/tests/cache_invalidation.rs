//! Cache behavior through the façade: transitive invalidation, deletes,
//! listener hooks, the stability classifier and volatile inputs.

use std::cell::Cell;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use tabula_engine::eval::{CellLoc, EntryId};
use tabula_engine::{
    EvaluationListener, SimpleWorkbook, StabilityClassifier, Value, WorkbookEvaluator,
};
use tabula_model::CellRef;

fn cell(a1: &str) -> CellRef {
    CellRef::from_a1(a1).unwrap()
}

fn fixture() -> (Rc<SimpleWorkbook>, WorkbookEvaluator) {
    let wb = SimpleWorkbook::single_sheet();
    let evaluator = WorkbookEvaluator::new(Rc::clone(&wb));
    (wb, evaluator)
}

#[derive(Default)]
struct CountingListener {
    starts: Cell<usize>,
    ends: Cell<usize>,
    hits: Cell<usize>,
}

impl EvaluationListener for CountingListener {
    fn on_start_evaluate(&self, _loc: CellLoc, _entry: EntryId) {
        self.starts.set(self.starts.get() + 1);
    }

    fn on_end_evaluate(&self, _entry: EntryId, _result: &Value) {
        self.ends.set(self.ends.get() + 1);
    }

    fn on_cache_hit(&self, _loc: CellLoc, _value: &Value) {
        self.hits.set(self.hits.get() + 1);
    }
}

#[test]
fn update_invalidates_the_whole_consumer_chain() {
    let (wb, evaluator) = fixture();
    wb.set_value(0, "A1", 1.0);
    wb.set_formula(0, "A2", "=A1+1").unwrap();
    wb.set_formula(0, "A3", "=A2+1").unwrap();
    wb.set_formula(0, "A4", "=A3+1").unwrap();

    assert_eq!(evaluator.evaluate(0, cell("A4")).unwrap(), Value::Number(4.0));

    evaluator.notify_update_cell(0, cell("A1"));
    wb.set_value(0, "A1", 100.0);
    assert_eq!(evaluator.evaluate(0, cell("A4")).unwrap(), Value::Number(103.0));
    assert_eq!(evaluator.evaluate(0, cell("A2")).unwrap(), Value::Number(101.0));
}

#[test]
fn diamond_dependencies_invalidate_once_and_correctly() {
    let (wb, evaluator) = fixture();
    wb.set_value(0, "A1", 1.0);
    wb.set_formula(0, "B1", "=A1*2").unwrap();
    wb.set_formula(0, "B2", "=A1*3").unwrap();
    wb.set_formula(0, "C1", "=B1+B2").unwrap();

    assert_eq!(evaluator.evaluate(0, cell("C1")).unwrap(), Value::Number(5.0));

    evaluator.notify_update_cell(0, cell("A1"));
    wb.set_value(0, "A1", 2.0);
    assert_eq!(evaluator.evaluate(0, cell("C1")).unwrap(), Value::Number(10.0));
}

#[test]
fn delete_cell_invalidates_consumers() {
    let (wb, evaluator) = fixture();
    wb.set_value(0, "A1", 5.0);
    wb.set_formula(0, "B1", "=A1+1").unwrap();
    assert_eq!(evaluator.evaluate(0, cell("B1")).unwrap(), Value::Number(6.0));

    wb.remove_cell(0, "A1");
    evaluator.notify_delete_cell(0, cell("A1"));
    // The deleted input now reads blank, which dereferences to zero.
    assert_eq!(evaluator.evaluate(0, cell("B1")).unwrap(), Value::Number(1.0));
}

#[test]
fn without_notification_results_stay_cached_until_cleared() {
    let (wb, evaluator) = fixture();
    wb.set_value(0, "A1", 1.0);
    wb.set_formula(0, "B1", "=A1").unwrap();
    assert_eq!(evaluator.evaluate(0, cell("B1")).unwrap(), Value::Number(1.0));

    // A silent workbook change is not visible: the committed result is
    // served from the cache.
    wb.set_value(0, "A1", 2.0);
    assert_eq!(evaluator.evaluate(0, cell("B1")).unwrap(), Value::Number(1.0));

    evaluator.clear_all_cached_results();
    assert_eq!(evaluator.evaluate(0, cell("B1")).unwrap(), Value::Number(2.0));
}

#[test]
fn listener_sees_starts_ends_and_cache_hits() {
    let wb = SimpleWorkbook::single_sheet();
    wb.set_value(0, "A1", 1.0);
    wb.set_formula(0, "B1", "=A1+1").unwrap();

    let listener = Rc::new(CountingListener::default());
    let mut evaluator = WorkbookEvaluator::new(Rc::clone(&wb));
    evaluator.set_evaluation_listener(Some(listener.clone()));

    evaluator.evaluate(0, cell("B1")).unwrap();
    assert_eq!((listener.starts.get(), listener.ends.get(), listener.hits.get()), (1, 1, 0));

    evaluator.evaluate(0, cell("B1")).unwrap();
    assert_eq!((listener.starts.get(), listener.ends.get(), listener.hits.get()), (1, 1, 1));
}

/// Cells a classifier declares final get no dependency bookkeeping, so
/// updating them does not invalidate consumers.
struct FirstRowFinal;

impl StabilityClassifier for FirstRowFinal {
    fn is_cell_final(&self, _sheet_ix: u32, row: u32, _col: u32) -> bool {
        row == 0
    }
}

#[test]
fn stability_classifier_skips_dependency_tracking() {
    let wb = SimpleWorkbook::single_sheet();
    wb.set_value(0, "A1", 1.0); // row 0: declared final
    wb.set_value(0, "A2", 10.0);
    wb.set_formula(0, "B2", "=A1+A2").unwrap();

    let mut evaluator = WorkbookEvaluator::new(Rc::clone(&wb));
    evaluator.set_stability_classifier(Some(Rc::new(FirstRowFinal)));

    assert_eq!(evaluator.evaluate(0, cell("B2")).unwrap(), Value::Number(11.0));

    // Updating the "final" cell does not reach B2's cached result.
    evaluator.notify_update_cell(0, cell("A1"));
    wb.set_value(0, "A1", 100.0);
    assert_eq!(evaluator.evaluate(0, cell("B2")).unwrap(), Value::Number(11.0));

    // Updating the tracked cell does.
    evaluator.notify_update_cell(0, cell("A2"));
    wb.set_value(0, "A2", 20.0);
    assert_eq!(evaluator.evaluate(0, cell("B2")).unwrap(), Value::Number(120.0));
}

/// A formula that read a volatile input is input-sensitive: consumers
/// keep recording a dependency on it even when the classifier has
/// declared its cell final.
#[test]
fn volatile_formulas_override_the_stability_classifier() {
    let wb = SimpleWorkbook::single_sheet();
    wb.set_formula(0, "A1", "=NOW()").unwrap(); // row 0: declared final
    wb.set_formula(0, "B2", "=A1+0").unwrap();

    let listener = Rc::new(CountingListener::default());
    let mut evaluator = WorkbookEvaluator::new(Rc::clone(&wb));
    evaluator.set_stability_classifier(Some(Rc::new(FirstRowFinal)));
    evaluator.set_evaluation_listener(Some(listener.clone()));

    // Commit A1 first so its input-sensitive flag is set before B2
    // records its inputs.
    evaluator.evaluate(0, cell("A1")).unwrap();
    evaluator.evaluate(0, cell("B2")).unwrap();
    let starts_before = listener.starts.get();

    // Clearing A1 must reach B2 through the recorded edge, forcing a
    // re-evaluation rather than a cache hit.
    evaluator.notify_update_cell(0, cell("A1"));
    evaluator.evaluate(0, cell("B2")).unwrap();
    assert!(
        listener.starts.get() > starts_before,
        "B2 should have re-evaluated after its volatile input was cleared"
    );
}
