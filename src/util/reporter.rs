use crate::wal::reader::Reporter;
use crate::{Error, IResult};
use std::cell::RefCell;
use std::rc::Rc;

/// A `Reporter` that remembers the first corruption it sees so log
/// recovery can surface it as a status once the replay loop finishes.
#[derive(Clone, Default)]
pub struct LogReporter {
    inner: Rc<RefCell<LogReporterInner>>,
}

#[derive(Default)]
struct LogReporterInner {
    reason: Option<String>,
    dropped_bytes: u64,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes reported dropped so far.
    pub fn dropped_bytes(&self) -> u64 {
        self.inner.borrow().dropped_bytes
    }

    pub fn result(&self) -> IResult<()> {
        match self.inner.borrow().reason.clone() {
            None => Ok(()),
            Some(reason) => Err(Error::CorruptionString(reason)),
        }
    }
}

impl Reporter for LogReporter {
    fn corruption(&mut self, bytes: u64, reason: &str) -> IResult<()> {
        let mut inner = self.inner.borrow_mut();
        inner.dropped_bytes += bytes;
        if inner.reason.is_none() {
            inner.reason = Some(reason.to_owned());
        }
        Ok(())
    }
}
