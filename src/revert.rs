//! Ordered undo log for multi-step operations.
//!
//! Steps are pushed as each change succeeds. `fail` runs them newest first,
//! `success` forgets them. Nothing runs implicitly on drop, callers decide.

use crate::log_debug;

type RevertFn = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct Reverter {
    steps: Vec<RevertFn>,
}

impl Reverter {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn add<F>(&mut self, step: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.steps.push(Box::new(step));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every registered step in reverse order.
    pub fn fail(&mut self) {
        if !self.steps.is_empty() {
            log_debug!("Reverting {} step(s)", self.steps.len());
        }
        while let Some(step) = self.steps.pop() {
            step();
        }
    }

    pub fn success(&mut self) {
        self.steps.clear();
    }

    /// Hand the pending steps to a new reverter, leaving this one empty.
    pub fn take(&mut self) -> Reverter {
        Reverter {
            steps: std::mem::take(&mut self.steps),
        }
    }
}

/// Run `result`'s reverter according to its outcome.
pub fn finish<T>(reverter: &mut Reverter, result: crate::Result<T>) -> crate::Result<T> {
    match result {
        Ok(value) => {
            reverter.success();
            Ok(value)
        }
        Err(err) => {
            reverter.fail();
            Err(err)
        }
    }
}
