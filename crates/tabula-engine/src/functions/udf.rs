use std::rc::Rc;

use crate::error::EvalError;
use crate::eval::context::OperationEvaluationContext;
use crate::value::Value;

/// A user-defined or add-in function invoked by name.
pub trait Udf {
    fn invoke(
        &self,
        args: &[Value],
        ec: &mut OperationEvaluationContext<'_, '_>,
    ) -> Result<Value, EvalError>;
}

/// Lookup of user-defined functions by (case-insensitive) name.
pub trait UdfFinder {
    fn find(&self, name: &str) -> Option<Rc<dyn Udf>>;
}

/// Chains several finders; the first hit wins.
#[derive(Default)]
pub struct AggregatingUdfFinder {
    finders: Vec<Rc<dyn UdfFinder>>,
}

impl AggregatingUdfFinder {
    pub fn new(finders: Vec<Rc<dyn UdfFinder>>) -> Self {
        Self { finders }
    }

    pub fn add(&mut self, finder: Rc<dyn UdfFinder>) {
        self.finders.push(finder);
    }
}

impl UdfFinder for AggregatingUdfFinder {
    fn find(&self, name: &str) -> Option<Rc<dyn Udf>> {
        self.finders.iter().find_map(|f| f.find(name))
    }
}

/// Placeholder for a function whose name is recognized but which has no
/// implementation; invoking it is an engine fault, not a `#NAME?` error.
pub struct NotImplementedUdf {
    name: String,
}

impl NotImplementedUdf {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Udf for NotImplementedUdf {
    fn invoke(
        &self,
        _args: &[Value],
        _ec: &mut OperationEvaluationContext<'_, '_>,
    ) -> Result<Value, EvalError> {
        Err(EvalError::not_implemented(self.name.clone()))
    }
}
