//! Captured process state
//!
//! [`Capture`] is the mutable, append-only record the event loop writes into
//! while the child runs. [`ProcessResult`] is its frozen copy once the child
//! has terminated.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::HarnessError;
use crate::launch::LaunchError;
use crate::rule::{Expectation, Field, Rule};

/// The final snapshot of a supervised process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when killed by a signal or never started
    pub code: Option<i32>,
    /// Launch error, if one occurred
    pub error: Option<LaunchError>,
}

impl ProcessResult {
    /// Validate an expectation against this snapshot right away.
    pub fn expect(&self, field: Field, expectation: impl Into<Expectation>) -> Result<&Self, HarnessError> {
        Rule::new(field, expectation.into(), false).validate(self)?;
        Ok(self)
    }

    /// Validate a negated expectation against this snapshot right away.
    pub fn not_expect(&self, field: Field, expectation: impl Into<Expectation>) -> Result<&Self, HarnessError> {
        Rule::new(field, expectation.into(), true).validate(self)?;
        Ok(self)
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.code == Some(0)
    }
}

/// Output and outcome accumulated while the child runs
#[derive(Debug, Default)]
pub(crate) struct Capture {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<LaunchError>,
    pub code: Option<i32>,
}

impl Capture {
    /// Record a launch error. The first one sticks.
    pub fn record_error(&mut self, err: LaunchError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn snapshot(&self) -> ProcessResult {
        ProcessResult {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            code: self.code,
            error: self.error.clone(),
        }
    }
}

/// Capture shared with the ready callback. Only the event loop writes to it.
pub(crate) type SharedCapture = Arc<Mutex<Capture>>;

pub(crate) fn lock(capture: &SharedCapture) -> MutexGuard<'_, Capture> {
    // A panicking ready callback must not take the capture down with it.
    capture.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_error_sticks() {
        let mut cap = Capture::default();
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        cap.record_error(LaunchError::spawn("x", &io));
        cap.record_error(LaunchError::timeout(Duration::from_millis(1)));
        assert_eq!(cap.error.as_ref().map(|e| e.message()), Some("spawn x ENOENT"));
    }

    #[test]
    fn test_late_expectations_on_snapshot() {
        let mut cap = Capture::default();
        cap.stdout.push_str("write to stdout");
        cap.code = Some(0);
        let result = cap.snapshot();

        assert!(result.expect(Field::Stdout, "write to stdout").is_ok());
        assert!(result
            .expect(Field::Code, 0)
            .and_then(|r| r.not_expect(Field::Stderr, "oops"))
            .is_ok());
        assert!(result.expect(Field::Code, 1).unwrap_err().is_assertion());
        assert!(result.success());
    }
}
