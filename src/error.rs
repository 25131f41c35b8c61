//! Harness errors

use std::fmt;

use crate::rule::Field;

/// The kind of harness error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An expectation did not hold against the captured result
    Assertion,
    /// Invalid usage (unknown field name, malformed expectation text)
    Usage,
    /// IO error while talking to the child
    Io,
    /// The supervision thread went away without settling
    Internal,
}

/// A harness error with optional assertion context
#[derive(Debug, Clone)]
pub struct HarnessError {
    pub kind: ErrorKind,
    pub message: String,
    pub field: Option<Field>,
    pub actual: Option<String>,
    pub expected: Option<String>,
    pub negated: bool,
}

impl HarnessError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
            actual: None,
            expected: None,
            negated: false,
        }
    }

    pub fn assertion(field: Field, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Assertion, message);
        err.field = Some(field);
        err
    }

    pub fn with_values(mut self, actual: impl Into<String>, expected: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self.expected = Some(expected.into());
        self
    }

    pub fn negated(mut self, negated: bool) -> Self {
        self.negated = negated;
        self
    }

    pub fn usage(what: &str, expected: &str) -> Self {
        Self::new(ErrorKind::Usage, format!("invalid {}: expected {}", what, expected))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    pub fn is_assertion(&self) -> bool {
        self.kind == ErrorKind::Assertion
    }

    /// Error name, stable across messages.
    pub fn name(&self) -> &'static str {
        match self.kind {
            ErrorKind::Assertion => "AssertionError",
            ErrorKind::Usage => "UsageError",
            ErrorKind::Io => "IoError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(field) = self.field {
            write!(f, "{} [{}]: ", self.name(), field)?;
        } else {
            write!(f, "{}: ", self.name())?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HarnessError {}

impl From<std::io::Error> for HarnessError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}
