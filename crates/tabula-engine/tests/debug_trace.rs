//! The one-shot debug trace latch: verbose per-token tracing for exactly
//! one top-level evaluation, delivered through an injected sink.

use std::rc::Rc;

use tabula_engine::debug::{CollectingTraceSink, TraceSink};
use tabula_engine::{SimpleWorkbook, Value, WorkbookEvaluator};
use tabula_model::CellRef;

#[test]
fn trace_latch_fires_once_then_auto_clears() {
    let wb = SimpleWorkbook::single_sheet();
    wb.set_value(0, "A1", 2.0);
    wb.set_formula(0, "B1", "=A1*3").unwrap();

    let evaluator = WorkbookEvaluator::new(Rc::clone(&wb));
    let sink = Rc::new(CollectingTraceSink::new());
    evaluator.set_trace_sink(Rc::clone(&sink) as Rc<dyn TraceSink>);

    // No tracing without the latch.
    evaluator.evaluate(0, CellRef::from_a1("B1").unwrap()).unwrap();
    assert!(sink.is_empty());

    // The latch traces the next top-level call...
    evaluator.set_debug_evaluation_output_for_next_eval(true);
    evaluator.notify_update_cell(0, CellRef::from_a1("B1").unwrap());
    let result = evaluator.evaluate(0, CellRef::from_a1("B1").unwrap()).unwrap();
    assert_eq!(result, Value::Number(6.0));
    let lines = sink.take_lines();
    assert!(!lines.is_empty());
    assert!(lines.iter().any(|l| l.contains("ptg[")));

    // ...and exactly that one: the next evaluation is silent again.
    evaluator.notify_update_cell(0, CellRef::from_a1("B1").unwrap());
    evaluator.evaluate(0, CellRef::from_a1("B1").unwrap()).unwrap();
    assert!(sink.is_empty());
}
