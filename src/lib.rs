pub use crate::diagnostics::{
    CollectSink, Diagnostic, DiagnosticSink, NullSink, PreprocError, Severity, SourceLoc,
};
pub use crate::driver::{Collaborators, Pass, Preprocessor};

pub mod ccodes;
pub mod cli;
pub mod cond;
pub mod context;
pub mod diagnostics;
pub mod directive;
pub mod driver;
pub mod expr;
pub mod frames;
pub mod macros;
pub mod source;
pub mod token;
