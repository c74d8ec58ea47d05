//! In-memory undo log for multi-step operations.
//!
//! Steps are registered right after the side effect they undo succeeds. On
//! failure the log runs them newest first; on success it is disarmed. A log
//! dropped while still armed unwinds itself, so an early `?` return cannot
//! leave partial state behind.

use crate::CoreError;
use tracing::{debug, warn};

type UndoFn<'a> = Box<dyn FnOnce() -> Result<(), CoreError> + 'a>;

pub struct RollbackLog<'a> {
    op: &'static str,
    steps: Vec<(String, UndoFn<'a>)>,
    armed: bool,
}

impl<'a> RollbackLog<'a> {
    pub fn new(op: &'static str) -> Self {
        Self {
            op,
            steps: Vec::new(),
            armed: true,
        }
    }

    pub fn push(
        &mut self,
        label: impl Into<String>,
        undo: impl FnOnce() -> Result<(), CoreError> + 'a,
    ) {
        self.steps.push((label.into(), Box::new(undo)));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The operation succeeded; drop every step without running it.
    pub fn disarm(mut self) {
        self.armed = false;
        self.steps.clear();
    }

    /// Run every step, newest first. Failures are logged and skipped.
    pub fn unwind(mut self) -> usize {
        self.run()
    }

    fn run(&mut self) -> usize {
        self.armed = false;
        let mut failed = 0;
        while let Some((label, undo)) = self.steps.pop() {
            match undo() {
                Ok(()) => debug!("{} rollback: {label}", self.op),
                Err(e) => {
                    failed += 1;
                    warn!("{} rollback: {label} failed: {e}", self.op);
                }
            }
        }
        failed
    }
}

impl Drop for RollbackLog<'_> {
    fn drop(&mut self) {
        if self.armed && !self.steps.is_empty() {
            self.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn unwind_runs_newest_first() {
        let order = RefCell::new(Vec::new());
        let mut log = RollbackLog::new("test");
        log.push("first", || {
            order.borrow_mut().push(1);
            Ok(())
        });
        log.push("second", || {
            order.borrow_mut().push(2);
            Ok(())
        });
        assert_eq!(log.len(), 2);
        assert_eq!(log.unwind(), 0);
        assert_eq!(*order.borrow(), [2, 1]);
    }

    #[test]
    fn disarmed_log_runs_nothing() {
        let ran = RefCell::new(false);
        let mut log = RollbackLog::new("test");
        log.push("step", || {
            *ran.borrow_mut() = true;
            Ok(())
        });
        log.disarm();
        assert!(!*ran.borrow());
    }

    #[test]
    fn drop_while_armed_unwinds_and_continues_past_failures() {
        let ran = RefCell::new(Vec::new());
        {
            let mut log = RollbackLog::new("test");
            log.push("ok", || {
                ran.borrow_mut().push("ok");
                Ok(())
            });
            log.push("fails", || {
                ran.borrow_mut().push("fails");
                Err(CoreError::InvalidParameter("boom".to_owned()))
            });
        }
        assert_eq!(*ran.borrow(), ["fails", "ok"]);
    }
}
