//! Macro tables: two independent hashed-by-name stores, one for
//! single-line macros (parametric text substitutions) and one for
//! multi-line macros (statement-like, arity-matched, with defaults and
//! variadic forms). Context-local single-line macros reuse the same store
//! type, owned per context.

pub mod mmacro;
pub mod smacro;

pub use mmacro::{split_params, trim_param, MMacroDef, MmacroStore, SplitParams};
pub use smacro::{Lookup, SMacro, SmacroStore};
