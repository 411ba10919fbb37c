//! The line driver: owns all preprocessor state and collaborators, pulls
//! raw lines through parameter substitution, directive dispatch, macro
//! expansion and re-serialization, and hands fully expanded,
//! directive-free lines to the caller.
//!
//! Control flow per [`Preprocessor::get_line`] call:
//!
//! 1. retire or replay any expansion end markers at the top of the stack;
//! 2. fetch a line — pending expansion first, then the current source,
//!    popping include frames (with balance checks) at end of file;
//! 3. substitute multi-line macro parameters (unless storing a body or
//!    inside a false conditional branch);
//! 4. give the directive dispatcher a chance to consume the line;
//! 5. store the line if a definition is being gathered, or discard it if a
//!    conditional or exhausted `%rep` suppresses it;
//! 6. run single-line expansion to fixpoint, then try a multi-line
//!    invocation, which queues more lines and loops;
//! 7. otherwise re-serialize and return the line.

mod directive;
mod expand;

use std::collections::HashSet;
use std::mem;
use std::path::PathBuf;
use std::rc::Rc;

use crate::ccodes::{ConditionCodes, X86ConditionCodes};
use crate::context::{ContextStack, CtxError};
use crate::diagnostics::{
    Diagnostic, DiagnosticSink, NullSink, PreprocError, Severity, SourceLoc,
};
use crate::expr::{evaluate, NoSymbols, SymbolResolver};
use crate::frames::{DefKind, ExpFrame, ExpLine, Gather};
use crate::macros::{MmacroStore, SMacro, SmacroStore};
use crate::source::{
    next_logical_line, translate_cpp_marker, IncludeFrame, IncludeResolver, LineSource, SearchPath,
};
use crate::token::{detoken, skip_ws, tokenize, Token};

pub(crate) use directive::DirectiveOutcome;

// ============================================================================
// CONSTRUCTION
// ============================================================================

/// Which pass of the assembler run is driving us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Drive to completion, discard output, record `%include` targets.
    Dependencies,
    /// The optimistic sizing pass. Starts from a clean slate.
    First,
    /// The final pass: macro tables and contexts persist from the first
    /// pass, only the line driver resets.
    Final,
}

/// External collaborators handed to [`Preprocessor::new`].
pub struct Collaborators {
    pub sink: Box<dyn DiagnosticSink>,
    pub symbols: Box<dyn SymbolResolver>,
    pub resolver: Box<dyn IncludeResolver>,
    pub ccodes: Box<dyn ConditionCodes>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            sink: Box::new(NullSink),
            symbols: Box::new(NoSymbols),
            resolver: Box::new(SearchPath::default()),
            ccodes: Box::new(X86ConditionCodes),
        }
    }
}

/// `%arg`/`%local`/`%stacksize` model of the current stack frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackFrame {
    pub size: i64,
    pub pointer: &'static str,
    pub arg_offset: i64,
    pub local_offset: i64,
}

impl Default for StackFrame {
    fn default() -> Self {
        StackFrame {
            size: 4,
            pointer: "ebp",
            arg_offset: 8,
            local_offset: 4,
        }
    }
}

/// Selects the single-line macro store a name belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StoreSel {
    Global,
    /// Context-local store, index from the top of the context stack.
    Ctx(usize),
}

// ============================================================================
// THE PREPROCESSOR
// ============================================================================

pub struct Preprocessor {
    // Collaborators.
    sink: Box<dyn DiagnosticSink>,
    symbols: Box<dyn SymbolResolver>,
    resolver: Box<dyn IncludeResolver>,
    pub(crate) ccodes: Box<dyn ConditionCodes>,

    // Macro state. Persists across the first → final pass boundary.
    pub(crate) smacros: SmacroStore,
    pub(crate) mmacros: MmacroStore,
    pub(crate) contexts: ContextStack,

    // Line-driver state. Reset every pass.
    pub(crate) istk: Vec<IncludeFrame>,
    pub(crate) gather: Option<Gather>,
    pub(crate) nested: Vec<DefKind>,
    pub(crate) active_mmacros: HashSet<u64>,
    pub(crate) unique: u64,
    next_macro_id: u64,
    pub(crate) pass: Pass,
    pub(crate) src_file: String,
    pub(crate) src_line: i64,
    first_line: bool,
    pub(crate) stack_frame: StackFrame,

    // Pre-operations replayed at the start of every pass, and the include
    // dependencies recorded so far.
    preload: Vec<Vec<Token>>,
    deps: Vec<PathBuf>,
    dep_seen: HashSet<PathBuf>,
}

impl Preprocessor {
    pub fn new(collab: Collaborators) -> Self {
        Preprocessor {
            sink: collab.sink,
            symbols: collab.symbols,
            resolver: collab.resolver,
            ccodes: collab.ccodes,
            smacros: SmacroStore::new(),
            mmacros: MmacroStore::new(),
            contexts: ContextStack::new(),
            istk: Vec::new(),
            gather: None,
            nested: Vec::new(),
            active_mmacros: HashSet::new(),
            unique: 0,
            next_macro_id: 0,
            pass: Pass::First,
            src_file: String::new(),
            src_line: 0,
            first_line: false,
            stack_frame: StackFrame::default(),
            preload: Vec::new(),
            deps: Vec::new(),
            dep_seen: HashSet::new(),
        }
    }

    /// Point the driver at a fresh top-level source.
    ///
    /// `Dependencies` and `First` start from a clean slate; `Final` keeps
    /// the macro tables and contexts accumulated by the previous pass and
    /// resets only the line driver, so both passes see identical
    /// definitions and identical `%%`-uniqueness numbering.
    pub fn reset(&mut self, src: Box<dyn LineSource>, name: &str, pass: Pass) {
        self.istk = vec![IncludeFrame::new(src, String::new(), 0)];
        self.gather = None;
        self.nested.clear();
        self.active_mmacros.clear();
        self.unique = 0;
        self.pass = pass;
        self.src_file = name.to_string();
        self.src_line = 0;
        self.first_line = true;
        self.stack_frame = StackFrame::default();
        if pass != Pass::Final {
            self.smacros.clear();
            self.mmacros.clear();
            self.contexts.clear();
            self.deps.clear();
            self.dep_seen.clear();
            self.define_builtins();
        }
    }

    /// Per-pass teardown. `First`/`Dependencies` report a definition left
    /// open at end of input; `Final` releases everything.
    pub fn cleanup(&mut self, pass: Pass) {
        match pass {
            Pass::First | Pass::Dependencies => {
                if let Some(gather) = self.gather.take() {
                    let name = match &gather {
                        Gather::Macro(def) => def.name.clone(),
                        Gather::Rep { .. } => "%rep block".to_string(),
                    };
                    self.sink.report(Diagnostic {
                        severity: Severity::NonFatal,
                        message: format!("end of file while still defining macro `{}'", name),
                        loc: Some(self.loc()),
                    });
                }
            }
            Pass::Final => {
                self.smacros.clear();
                self.mmacros.clear();
                self.contexts.clear();
                self.istk.clear();
                self.gather = None;
                self.nested.clear();
                self.active_mmacros.clear();
                self.preload.clear();
            }
        }
    }

    // --- pre-operations -----------------------------------------------------

    /// Queue a `%define` to run before the first source line of each pass.
    /// Accepts `NAME` or `NAME=VALUE`.
    pub fn pre_define(&mut self, def: &str) {
        let line = match def.split_once('=') {
            Some((name, value)) => format!("%define {} {}", name, value),
            None => format!("%define {}", def),
        };
        self.preload.push(tokenize(&line).tokens);
    }

    /// Queue a `%undef` to run before the first source line of each pass.
    pub fn pre_undefine(&mut self, name: &str) {
        self.preload.push(tokenize(&format!("%undef {}", name)).tokens);
    }

    /// Queue an `%include` to run before the first source line of each
    /// pass.
    pub fn pre_include(&mut self, file: &str) {
        self.preload
            .push(tokenize(&format!("%include \"{}\"", file)).tokens);
    }

    /// `%include` targets resolved so far, in first-touch order.
    pub fn dependencies(&self) -> &[PathBuf] {
        &self.deps
    }

    fn define_builtins(&mut self) {
        for name in ["__FILE__", "__LINE__"] {
            let mac = SMacro {
                id: self.fresh_macro_id(),
                name: name.to_string(),
                casesense: true,
                nparam: 0,
                expansion: Vec::new(),
            };
            self.smacros.define(mac, true);
        }
    }

    // ========================================================================
    // THE PULL LOOP
    // ========================================================================

    /// Produce the next fully expanded, directive-free line, or `None` at
    /// end of input.
    pub fn get_line(&mut self) -> Result<Option<String>, PreprocError> {
        loop {
            if self.first_line {
                self.first_line = false;
                let preload = self.preload.clone();
                if let Some(frame) = self.istk.last_mut() {
                    for line in preload.into_iter().rev() {
                        frame.expansion.push(ExpLine::Text(line));
                    }
                }
            }
            if self.istk.is_empty() {
                return Ok(None);
            }

            let tline = match self.fetch_step()? {
                FetchStep::Line(tokens) => tokens,
                FetchStep::Marker => {
                    self.handle_end_marker()?;
                    continue;
                }
                FetchStep::Read(raw, continued) => {
                    let lineinc = self.istk.last().map_or(1, |f| f.lineinc);
                    self.src_line += lineinc * (1 + continued);
                    let line = translate_cpp_marker(&raw).unwrap_or(raw);
                    let tokenized = tokenize(&line);
                    if tokenized.unterminated_string {
                        self.report(Severity::Warning, "unterminated string")?;
                    }
                    tokenized.tokens
                }
                FetchStep::Pop => {
                    self.pop_include()?;
                    if self.istk.is_empty() {
                        return Ok(None);
                    }
                    continue;
                }
            };

            let defining = self.gather.is_some();
            let suppressed = self.istk.last().map_or(false, IncludeFrame::suppressed);

            // Parameter and local substitution happens before directive
            // dispatch, so constructs like `%define field %1` see bound
            // text — but not while a body is merely being stored, and not
            // in a dead branch.
            let tline = if !defining && !suppressed {
                self.expand_mmac_params(tline)?
            } else {
                tline
            };

            match self.do_directive(&tline)? {
                DirectiveOutcome::Consumed => continue,
                DirectiveOutcome::NotADirective => {}
            }

            if let Some(gather) = self.gather.as_mut() {
                gather.push_line(tline);
                continue;
            }
            if suppressed {
                continue;
            }
            if self.rep_terminated() {
                // Walking out of an exited %rep: discard until its marker.
                continue;
            }

            let tline = self.expand_smacro(tline)?;
            if self.expand_mmacro(&tline)? {
                continue;
            }

            let text = self.detoken_line(&tline, true)?;
            return Ok(Some(text));
        }
    }

    fn fetch_step(&mut self) -> Result<FetchStep, PreprocError> {
        let loc = self.loc();
        let Some(frame) = self.istk.last_mut() else {
            return Ok(FetchStep::Pop);
        };
        match frame.expansion.last() {
            Some(ExpLine::End) => Ok(FetchStep::Marker),
            Some(ExpLine::Text(_)) => {
                let Some(ExpLine::Text(tokens)) = frame.expansion.pop() else {
                    return Err(PreprocError::panic(
                        "expansion stack changed under us",
                        Some(loc),
                    ));
                };
                if let Some(invocation) = frame.invocations.last_mut() {
                    invocation.bump_line();
                }
                Ok(FetchStep::Line(tokens))
            }
            None => match next_logical_line(frame.src.as_mut()) {
                Some((raw, continued)) => Ok(FetchStep::Read(raw, continued)),
                None => Ok(FetchStep::Pop),
            },
        }
    }

    /// Consume the end marker at the top of the expansion stack: requeue a
    /// rep body that still has passes left, otherwise retire the innermost
    /// frame.
    fn handle_end_marker(&mut self) -> Result<(), PreprocError> {
        let top = self
            .istk
            .last()
            .and_then(|frame| frame.invocations.last());
        let requeue = matches!(top, Some(ExpFrame::Rep(rep)) if rep.remaining > 1);
        let finishing_name = top.and_then(|f| f.name().map(str::to_string));
        if top.is_none() {
            return Err(PreprocError::panic(
                "expansion end marker without an active frame",
                Some(self.loc()),
            ));
        }

        if requeue {
            let Some(frame) = self.istk.last_mut() else {
                return Ok(());
            };
            if let Some(ExpFrame::Rep(rep)) = frame.invocations.last_mut() {
                rep.remaining -= 1;
                let body = rep.body.clone();
                // The marker stays put; the fresh copy queues above it.
                for line in body.into_iter().rev() {
                    frame.expansion.push(ExpLine::Text(line));
                }
            }
            return Ok(());
        }

        // A construct left open inside the expansion cannot be recovered.
        match &self.gather {
            Some(Gather::Macro(_)) => {
                self.report(Severity::Panic, "macro definition still open at expansion end")?;
            }
            Some(Gather::Rep { .. }) => {
                if let Some(name) = finishing_name {
                    self.report(
                        Severity::Fatal,
                        format!(
                            "`%rep' without `%endrep' within expansion of macro `{}'",
                            name
                        ),
                    )?;
                }
            }
            None => {}
        }

        if let Some(frame) = self.istk.last_mut() {
            frame.expansion.pop();
            if let Some(ExpFrame::Call(call)) = frame.invocations.pop() {
                self.active_mmacros.remove(&call.def.id);
            }
        }
        Ok(())
    }

    fn pop_include(&mut self) -> Result<(), PreprocError> {
        if self
            .istk
            .last()
            .map_or(false, |frame| !frame.conds.is_empty())
        {
            self.report(Severity::Fatal, "expected `%endif' before end of file")?;
        }
        if let Some(frame) = self.istk.pop() {
            if !self.istk.is_empty() {
                self.src_file = frame.saved_file;
                self.src_line = frame.saved_line;
            }
        }
        Ok(())
    }

    // ========================================================================
    // SHARED HELPERS
    // ========================================================================

    pub(crate) fn loc(&self) -> SourceLoc {
        SourceLoc {
            file: self.src_file.clone(),
            line: self.src_line,
        }
    }

    /// Route a diagnostic. Anything raised inside a non-emitting branch is
    /// dropped outright; fatal severities become the returned error.
    /// Diagnostics raised while expanding a named macro are prefixed with
    /// the call site's name and body line.
    pub(crate) fn report(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
    ) -> Result<(), PreprocError> {
        if self.istk.last().map_or(false, IncludeFrame::suppressed) {
            return Ok(());
        }
        let message = message.into();
        let decorated = match self
            .istk
            .last()
            .and_then(|f| f.invocations.last())
            .and_then(|f| f.name().map(|n| (n.to_string(), f.lineno())))
        {
            Some((name, lineno)) => format!("({}:{}) {}", name, lineno, message),
            None => message,
        };
        match severity {
            Severity::Fatal => Err(PreprocError::fatal(decorated, Some(self.loc()))),
            Severity::Panic => Err(PreprocError::panic(decorated, Some(self.loc()))),
            _ => {
                self.sink.report(Diagnostic {
                    severity,
                    message: decorated,
                    loc: Some(self.loc()),
                });
                Ok(())
            }
        }
    }

    /// Is the innermost invocation an exited-or-exhausted `%rep`?
    pub(crate) fn rep_terminated(&self) -> bool {
        self.istk.last().map_or(false, |frame| {
            matches!(
                frame.invocations.last(),
                Some(ExpFrame::Rep(rep)) if rep.remaining == 0
            )
        })
    }

    pub(crate) fn fresh_macro_id(&mut self) -> u64 {
        let id = self.next_macro_id;
        self.next_macro_id += 1;
        id
    }

    pub(crate) fn ctx_fatal(&self, name: &str, err: CtxError) -> PreprocError {
        let message = match err {
            CtxError::Empty => format!("`{}': context stack is empty", name),
            CtxError::TooShallow(depth) => format!(
                "`{}': context stack is only {} level{} deep",
                name,
                depth,
                if depth == 1 { "" } else { "s" }
            ),
        };
        PreprocError::fatal(message, Some(self.loc()))
    }

    /// Resolve a `%$` name to the context it addresses (or, with
    /// `all_contexts`, the context that owns a macro of that name).
    pub(crate) fn find_context(
        &self,
        name: &str,
        all_contexts: bool,
    ) -> Result<Option<usize>, PreprocError> {
        self.contexts
            .find(name, all_contexts)
            .map_err(|e| self.ctx_fatal(name, e))
    }

    /// Which store does a macro name being defined or undefined live in?
    pub(crate) fn select_store(&self, name: &str) -> Result<StoreSel, PreprocError> {
        match self.find_context(name, false)? {
            Some(idx) => Ok(StoreSel::Ctx(idx)),
            None => Ok(StoreSel::Global),
        }
    }

    pub(crate) fn store_ref(&self, sel: StoreSel) -> &SmacroStore {
        match sel {
            StoreSel::Ctx(idx) => match self.contexts.at(idx) {
                Some(ctx) => &ctx.locals,
                None => &self.smacros,
            },
            StoreSel::Global => &self.smacros,
        }
    }

    pub(crate) fn store_mut(&mut self, sel: StoreSel) -> &mut SmacroStore {
        match sel {
            StoreSel::Ctx(idx) => match self.contexts.at_mut(idx) {
                Some(ctx) => &mut ctx.locals,
                None => &mut self.smacros,
            },
            StoreSel::Global => &mut self.smacros,
        }
    }

    /// First visible single-line macro with this name; context-locals are
    /// searched outward from the addressed context.
    pub(crate) fn smacro_lookup_first(&self, name: &str) -> Result<Option<SMacro>, PreprocError> {
        if name.starts_with("%$") {
            match self.find_context(name, true)? {
                Some(idx) => Ok(self
                    .contexts
                    .at(idx)
                    .and_then(|ctx| ctx.locals.first_match(name))
                    .cloned()),
                None => Ok(self.smacros.first_match(name).cloned()),
            }
        } else {
            Ok(self.smacros.first_match(name).cloned())
        }
    }

    /// The overload with exactly `nparam` parameters, same store rules.
    pub(crate) fn smacro_lookup_exact(
        &self,
        name: &str,
        nparam: usize,
    ) -> Result<Option<SMacro>, PreprocError> {
        if name.starts_with("%$") {
            match self.find_context(name, true)? {
                Some(idx) => Ok(self
                    .contexts
                    .at(idx)
                    .and_then(|ctx| ctx.locals.exact(name, nparam))
                    .cloned()),
                None => Ok(self.smacros.exact(name, nparam).cloned()),
            }
        } else {
            Ok(self.smacros.exact(name, nparam).cloned())
        }
    }

    /// Definedness test behind `%ifdef`. An empty context stack makes a
    /// `%$` name simply undefined rather than an error.
    pub(crate) fn smacro_is_defined(&self, name: &str) -> Result<bool, PreprocError> {
        if name.starts_with("%$") {
            match self.contexts.find(name, false) {
                Ok(Some(idx)) => Ok(self
                    .contexts
                    .at(idx)
                    .map_or(false, |ctx| ctx.locals.defined(name, 0, true).any)),
                Ok(None) | Err(CtxError::Empty) => Ok(false),
                Err(err) => Err(self.ctx_fatal(name, err)),
            }
        } else {
            Ok(self.smacros.defined(name, 0, true).any)
        }
    }

    /// Evaluate an expression, reporting failures as non-fatal
    /// diagnostics framed with the requesting directive's name. `Ok(None)`
    /// means "already reported, abandon the statement".
    pub(crate) fn eval_tokens(
        &mut self,
        tokens: &[Token],
        critical: bool,
        directive_name: &str,
    ) -> Result<Option<i64>, PreprocError> {
        use crate::expr::ExprError;
        match evaluate(tokens, &*self.symbols, critical) {
            Ok(outcome) => {
                for warning in outcome.warnings {
                    self.report(Severity::Warning, warning)?;
                }
                if skip_ws(tokens, outcome.consumed) < tokens.len() {
                    self.report(
                        Severity::Warning,
                        "trailing garbage after expression ignored",
                    )?;
                }
                Ok(Some(outcome.value))
            }
            Err(ExprError::NonConstant(_)) => {
                self.report(
                    Severity::NonFatal,
                    format!("non-constant value given to `{}'", directive_name),
                )?;
                Ok(None)
            }
            Err(err) => {
                self.report(Severity::NonFatal, err.to_string())?;
                Ok(None)
            }
        }
    }

    /// Re-serialize a line. With `expand_locals`, `%$name` tokens become
    /// globally unique `..@N.name` text using their owning context's id.
    pub(crate) fn detoken_line(
        &mut self,
        tokens: &[Token],
        expand_locals: bool,
    ) -> Result<String, PreprocError> {
        let mut warnings = Vec::new();
        let contexts = &self.contexts;
        let result = detoken(
            tokens,
            |name| {
                if !expand_locals {
                    return Ok(None);
                }
                match contexts.find(name, false) {
                    Ok(Some(idx)) => Ok(contexts.at(idx).map(|ctx| {
                        let stripped = name[2..].trim_start_matches('$');
                        format!("..@{}.{}", ctx.number, stripped)
                    })),
                    Ok(None) => Ok(None),
                    Err(err) => Err((name.to_string(), err)),
                }
            },
            |w| warnings.push(w),
        );
        for warning in warnings {
            self.report(Severity::Warning, warning)?;
        }
        result.map_err(|(name, err)| self.ctx_fatal(&name, err))
    }

    /// Tokenize, single-line-expand and re-serialize a string; used by
    /// `%include` and `%error` argument text.
    pub(crate) fn expand_in_string(&mut self, text: &str) -> Result<String, PreprocError> {
        let tokens = tokenize(text).tokens;
        let expanded = self.expand_smacro(tokens)?;
        let mut warnings = Vec::new();
        let out = crate::token::detoken_basic(&expanded, |w| warnings.push(w));
        for warning in warnings {
            self.report(Severity::Warning, warning)?;
        }
        Ok(out)
    }

    /// Open an include file and push its frame.
    pub(crate) fn push_include(&mut self, name: &str) -> Result<(), PreprocError> {
        let mut warnings = Vec::new();
        let expanded = crate::source::expand_env_refs(name, &mut |w| warnings.push(w));
        for warning in warnings {
            self.report(Severity::Warning, warning)?;
        }
        let Some((path, src)) = self.resolver.resolve(&expanded) else {
            return self.report(
                Severity::Fatal,
                format!("unable to open include file `{}'", expanded),
            );
        };
        if self.dep_seen.insert(path.clone()) {
            self.deps.push(path.clone());
        }
        self.report(
            Severity::Debug,
            format!("including `{}'", path.display()),
        )?;
        let saved_file = mem::replace(&mut self.src_file, path.display().to_string());
        let saved_line = mem::replace(&mut self.src_line, 0);
        self.istk
            .push(IncludeFrame::new(src, saved_file, saved_line));
        Ok(())
    }

    /// Register a finished multi-line macro invocation frame.
    pub(crate) fn activate_mmacro(&mut self, def: &Rc<crate::macros::MMacroDef>) {
        self.active_mmacros.insert(def.id);
    }
}

enum FetchStep {
    /// A pending expansion line, already tokenized.
    Line(Vec<Token>),
    /// An end marker is on top; process it and come back.
    Marker,
    /// A raw physical line read from the current source.
    Read(String, i64),
    /// Current source exhausted; pop the include frame.
    Pop,
}
