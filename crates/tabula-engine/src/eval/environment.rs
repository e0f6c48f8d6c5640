//! Collaborating-workbooks environment: a registry of named peer
//! evaluators sharing one cache, so formulas can link across workbooks
//! (`[Book2]Sheet1!A1`).

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;
use thiserror::Error;

use crate::eval::cache::EvaluationCache;
use crate::eval::evaluator::WorkbookEvaluator;

#[derive(Debug, Error)]
pub enum EnvironmentSetupError {
    #[error("a collaborating environment needs at least one workbook")]
    Empty,
    #[error("duplicate workbook name {0:?}")]
    DuplicateName(String),
}

pub(crate) struct EnvironmentState {
    members: Vec<Rc<WorkbookEvaluator>>,
    by_name: AHashMap<String, usize>,
}

impl EnvironmentState {
    pub(crate) fn evaluator_by_name(&self, name: &str) -> Option<Rc<WorkbookEvaluator>> {
        let &ix = self.by_name.get(name)?;
        self.members.get(ix).cloned()
    }

    pub(crate) fn evaluator_by_book(&self, book_ix: u32) -> Option<Rc<WorkbookEvaluator>> {
        self.members.get(book_ix as usize).cloned()
    }
}

/// A group of evaluators linked by workbook name.
///
/// Setting up an environment gives every member a fresh shared cache
/// (previously cached results are dropped) and detaches members from any
/// environment they were part of before, including the other members of
/// those old environments, which fall back to standalone caches.
pub struct CollaboratingWorkbooksEnvironment {
    state: Rc<EnvironmentState>,
}

impl CollaboratingWorkbooksEnvironment {
    pub fn setup(
        entries: Vec<(String, Rc<WorkbookEvaluator>)>,
    ) -> Result<Self, EnvironmentSetupError> {
        if entries.is_empty() {
            return Err(EnvironmentSetupError::Empty);
        }
        let mut by_name = AHashMap::new();
        for (ix, (name, _)) in entries.iter().enumerate() {
            if by_name.insert(name.clone(), ix).is_some() {
                return Err(EnvironmentSetupError::DuplicateName(name.clone()));
            }
        }

        // Tear down every environment the new members belonged to. This
        // detaches *all* members of those environments, not just the
        // ones moving here.
        let mut old_environments: Vec<Rc<EnvironmentState>> = Vec::new();
        for (_, evaluator) in &entries {
            if let Some(env) = evaluator.environment() {
                if !old_environments.iter().any(|e| Rc::ptr_eq(e, &env)) {
                    old_environments.push(env);
                }
            }
        }
        for env in old_environments {
            for member in &env.members {
                member.detach_from_environment();
            }
        }
        for (_, evaluator) in &entries {
            evaluator.detach_from_environment();
        }

        let shared_cache = Rc::new(RefCell::new(EvaluationCache::new()));
        let members: Vec<Rc<WorkbookEvaluator>> =
            entries.iter().map(|(_, e)| Rc::clone(e)).collect();
        let state = Rc::new(EnvironmentState { members, by_name });
        for (book_ix, (_, evaluator)) in entries.iter().enumerate() {
            evaluator.attach_to_environment(
                Rc::downgrade(&state),
                Rc::clone(&shared_cache),
                book_ix as u32,
            );
        }
        Ok(Self { state })
    }

    pub fn member(&self, name: &str) -> Option<Rc<WorkbookEvaluator>> {
        self.state.evaluator_by_name(name)
    }
}
