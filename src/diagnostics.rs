//! Unified diagnostics for the mantra preprocessor.
//!
//! Every failure mode in the crate flows through two channels:
//!
//! - **Recoverable diagnostics** (`Debug`, `Warning`, `NonFatal`) are pushed
//!   into a [`DiagnosticSink`]; processing continues.
//! - **Run-ending failures** (`Fatal`, `Panic`) surface as a [`PreprocError`]
//!   returned from `Preprocessor::get_line`, rendered by the CLI through
//!   `miette`.
//!
//! Diagnostics raised inside a non-emitting conditional branch never reach
//! the sink; the driver enforces that rule before constructing the record.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use miette::Diagnostic as MietteDiagnostic;
use thiserror::Error;

// ============================================================================
// SEVERITY MODEL
// ============================================================================

/// How bad a diagnostic is, and what the driver does about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Discarded in normal builds; only surfaced by verbose tooling.
    Debug,
    /// Reported; processing continues unchanged.
    Warning,
    /// Reported; the current statement is abandoned, the run continues.
    NonFatal,
    /// Reported; the run aborts immediately.
    Fatal,
    /// Internal-invariant violation; aborts with a distinct exit path.
    Panic,
}

impl Severity {
    /// Severities that end the run and are returned as `PreprocError`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Severity::Fatal | Severity::Panic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Warning => "warning",
            Severity::NonFatal => "error",
            Severity::Fatal => "fatal",
            Severity::Panic => "panic",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// DIAGNOSTIC RECORD AND SINKS
// ============================================================================

/// Where in the input a diagnostic was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub file: String,
    pub line: i64,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// One reported diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub loc: Option<SourceLoc>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.loc {
            Some(loc) => write!(f, "{}: {}: {}", loc, self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Receiver for recoverable diagnostics.
///
/// The preprocessor owns its sink; embedders provide one at construction.
pub trait DiagnosticSink {
    fn report(&mut self, diag: Diagnostic);
}

/// A sink that records everything, shared through a cloneable handle.
///
/// Tests hold the handle and inspect the entries after the run.
#[derive(Default)]
pub struct CollectSink {
    entries: Rc<RefCell<Vec<Diagnostic>>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A second handle onto the same entry list.
    pub fn handle(&self) -> Rc<RefCell<Vec<Diagnostic>>> {
        Rc::clone(&self.entries)
    }
}

impl DiagnosticSink for CollectSink {
    fn report(&mut self, diag: Diagnostic) {
        self.entries.borrow_mut().push(diag);
    }
}

/// A sink that drops everything. Used by dependency scans.
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn report(&mut self, _diag: Diagnostic) {}
}

// ============================================================================
// RUN-ENDING ERRORS
// ============================================================================

/// Error type for the two run-ending severities.
#[derive(Debug, Error)]
pub enum PreprocError {
    #[error("{}fatal: {message}", fmt_loc(.loc))]
    Fatal {
        message: String,
        loc: Option<SourceLoc>,
    },
    #[error("{}internal error: {message}", fmt_loc(.loc))]
    Panic {
        message: String,
        loc: Option<SourceLoc>,
    },
}

fn fmt_loc(loc: &Option<SourceLoc>) -> String {
    match loc {
        Some(loc) => format!("{}: ", loc),
        None => String::new(),
    }
}

impl PreprocError {
    pub fn fatal(message: impl Into<String>, loc: Option<SourceLoc>) -> Self {
        PreprocError::Fatal {
            message: message.into(),
            loc,
        }
    }

    pub fn panic(message: impl Into<String>, loc: Option<SourceLoc>) -> Self {
        PreprocError::Panic {
            message: message.into(),
            loc,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PreprocError::Fatal { .. } => Severity::Fatal,
            PreprocError::Panic { .. } => Severity::Panic,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PreprocError::Fatal { message, .. } | PreprocError::Panic { message, .. } => message,
        }
    }
}

impl MietteDiagnostic for PreprocError {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        let code = match self {
            PreprocError::Fatal { .. } => "mantra::fatal",
            PreprocError::Panic { .. } => "mantra::panic",
        };
        Some(Box::new(code))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        match self {
            PreprocError::Panic { .. } => Some(Box::new(
                "this is an internal preprocessor error; please report it as a bug",
            )),
            PreprocError::Fatal { .. } => None,
        }
    }
}
