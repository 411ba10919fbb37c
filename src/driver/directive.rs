//! The directive dispatcher: recognizes a `%directive` at the start of a
//! line, applies the suppression and body-gathering gates in that order,
//! and runs the directive. A consumed line is never forwarded downstream.

use crate::cond::CondState;
use crate::diagnostics::{PreprocError, Severity};
use crate::directive::{lookup, Directive, IfKind};
use crate::frames::{DefKind, ExpFrame, ExpLine, Gather, RepFrame};
use crate::macros::{split_params, MMacroDef, SMacro};
use crate::source::IncludeFrame;
use crate::token::{detoken_basic, read_num, skip_ws, tokenize, Token, TokenKind};

use super::{Preprocessor, StackFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirectiveOutcome {
    /// The line was a directive and has been fully handled.
    Consumed,
    /// Not a directive (or one that must be stored/discarded by the
    /// caller).
    NotADirective,
}

impl Preprocessor {
    pub(crate) fn do_directive(
        &mut self,
        tline: &[Token],
    ) -> Result<DirectiveOutcome, PreprocError> {
        let at = skip_ws(tline, 0);
        let Some(head) = tline.get(at) else {
            return Ok(DirectiveOutcome::NotADirective);
        };
        if !head.is_ppid() {
            return Ok(DirectiveOutcome::NotADirective);
        }
        let b = head.text.as_bytes();
        if b.len() < 2 || matches!(b[1], b'%' | b'$' | b'!') {
            return Ok(DirectiveOutcome::NotADirective);
        }
        let dir = lookup(&head.text);

        // Inside a dead conditional branch, or walking out of an exited
        // %rep, only conditional bookkeeping still runs.
        let dead = self.istk.last().map_or(false, IncludeFrame::suppressed)
            || self.rep_terminated();
        if dead && !dir.map_or(false, Directive::is_condition) {
            return Ok(DirectiveOutcome::NotADirective);
        }

        // While a body is being gathered, everything is stored except the
        // opener/closer bookkeeping of the construct itself.
        if let Some(gather) = &self.gather {
            let named = matches!(gather, Gather::Macro(_));
            match dir {
                Some(Directive::Macro { .. }) => {
                    self.nested.push(DefKind::Macro);
                    return Ok(DirectiveOutcome::NotADirective);
                }
                Some(Directive::EndMacro) => {
                    if let Some(pos) = self.nested.iter().rposition(|k| *k == DefKind::Macro) {
                        self.nested.remove(pos);
                        return Ok(DirectiveOutcome::NotADirective);
                    }
                    // Falls through: closes this gather.
                }
                Some(Directive::Rep) if !named => {
                    self.nested.push(DefKind::Rep);
                    return Ok(DirectiveOutcome::NotADirective);
                }
                Some(Directive::EndRep) if !named => {
                    if let Some(pos) = self.nested.iter().rposition(|k| *k == DefKind::Rep) {
                        self.nested.remove(pos);
                        return Ok(DirectiveOutcome::NotADirective);
                    }
                }
                _ => return Ok(DirectiveOutcome::NotADirective),
            }
        }

        let Some(dir) = dir else {
            self.report(
                Severity::NonFatal,
                format!("unknown preprocessor directive `{}'", head.text),
            )?;
            return Ok(DirectiveOutcome::NotADirective);
        };

        let head_text = head.text.clone();
        match dir {
            Directive::Arg => self.dir_arg_local(tline, at, false)?,
            Directive::Local => self.dir_arg_local(tline, at, true)?,
            Directive::Stacksize => self.dir_stacksize(tline, at)?,
            Directive::Clear => self.dir_clear(tline, at)?,
            Directive::Define { icase, expand } => {
                self.dir_define(tline, at, &head_text, icase, expand)?
            }
            Directive::Undef => self.dir_undef(tline, at, &head_text)?,
            Directive::Assign { icase } => self.dir_assign(tline, at, &head_text, icase)?,
            Directive::Strlen => self.dir_strlen(tline, at, &head_text)?,
            Directive::Substr => self.dir_substr(tline, at, &head_text)?,
            Directive::Macro { icase } => self.dir_macro(tline, at, &head_text, icase)?,
            Directive::EndMacro => self.dir_endmacro(&head_text)?,
            Directive::Rep => self.dir_rep(tline, at)?,
            Directive::EndRep => self.dir_endrep()?,
            Directive::ExitRep => self.dir_exitrep()?,
            Directive::Rotate => self.dir_rotate(tline, at)?,
            Directive::If { kind, negate } => self.dir_if(tline, at, kind, negate, &head_text)?,
            Directive::Elif { kind, negate } => {
                self.dir_elif(tline, at, kind, negate, &head_text)?
            }
            Directive::Else => self.dir_else(tline, at)?,
            Directive::EndIf => self.dir_endif(tline, at)?,
            Directive::Push => self.dir_push(tline, at, &head_text)?,
            Directive::Repl => self.dir_repl(tline, at, &head_text)?,
            Directive::Pop => self.dir_pop(tline, at)?,
            Directive::Scope => self.dir_scope(tline, at)?,
            Directive::EndScope => self.dir_endscope(tline, at)?,
            Directive::Include => self.dir_include(tline, at)?,
            Directive::Line => self.dir_line(tline, at)?,
            Directive::Error => self.dir_error(tline, at)?,
        }
        Ok(DirectiveOutcome::Consumed)
    }

    // ========================================================================
    // SINGLE-LINE MACRO DIRECTIVES
    // ========================================================================

    /// Shared head parsing for the defining directives: skip whitespace,
    /// expand a composite identifier, and demand a definable name (plain
    /// identifier or `%$` local).
    fn parse_macro_name(
        &mut self,
        rest: Vec<Token>,
        directive: &str,
    ) -> Result<Option<(String, Vec<Token>)>, PreprocError> {
        let i = skip_ws(&rest, 0);
        let rest = self.expand_id(rest[i..].to_vec())?;
        let valid = rest.first().map_or(false, |t| {
            t.is_id() || (t.is_ppid() && t.text.as_bytes().get(1) == Some(&b'$'))
        });
        if !valid {
            self.report(
                Severity::NonFatal,
                format!("`{}' expects a macro identifier", directive),
            )?;
            return Ok(None);
        }
        let name = rest[0].text.clone();
        Ok(Some((name, rest[1..].to_vec())))
    }

    /// Commit a single-line macro, honoring the redefinition rules: an
    /// existing definition with the same arity is replaced, a clash
    /// between parametric and parameterless forms is refused with a
    /// warning.
    fn define_smacro(
        &mut self,
        name: &str,
        casesense: bool,
        nparam: usize,
        expansion: Vec<Token>,
        use_macro_case: bool,
    ) -> Result<(), PreprocError> {
        let sel = self.select_store(name)?;
        let lk = self.store_ref(sel).defined(name, nparam, use_macro_case);
        if lk.any && lk.exact.is_none() {
            self.report(
                Severity::Warning,
                format!(
                    "single-line macro `{}' defined both with and without parameters",
                    name
                ),
            )?;
            return Ok(());
        }
        let mac = SMacro {
            id: self.fresh_macro_id(),
            name: name.to_string(),
            casesense,
            nparam,
            expansion,
        };
        self.store_mut(sel).define(mac, use_macro_case);
        Ok(())
    }

    fn dir_define(
        &mut self,
        tline: &[Token],
        at: usize,
        head: &str,
        icase: bool,
        expand: bool,
    ) -> Result<(), PreprocError> {
        let Some((name, body)) = self.parse_macro_name(tline[at + 1..].to_vec(), head)? else {
            return Ok(());
        };
        let body = if expand {
            // %xdefine: bind the replacement's current expansion, not its
            // spelling.
            self.expand_smacro(body)?
        } else {
            body
        };

        // A parameter template only counts when the parenthesis directly
        // abuts the macro name.
        let mut formals: Vec<String> = Vec::new();
        let mut cursor = 0usize;
        if body.first().map_or(false, |t| t.is("(")) {
            cursor = 1;
            loop {
                cursor = skip_ws(&body, cursor);
                let Some(t) = body.get(cursor) else {
                    self.report(Severity::NonFatal, "parameter identifier expected")?;
                    return Ok(());
                };
                if !t.is_id() {
                    self.report(
                        Severity::NonFatal,
                        format!("`{}': parameter identifier expected", t.text),
                    )?;
                    return Ok(());
                }
                formals.push(t.text.clone());
                cursor = skip_ws(&body, cursor + 1);
                if body.get(cursor).map_or(false, |t| t.is(",")) {
                    cursor += 1;
                    continue;
                }
                if !body.get(cursor).map_or(false, |t| t.is(")")) {
                    self.report(
                        Severity::NonFatal,
                        "`)' expected to terminate macro template",
                    )?;
                    return Ok(());
                }
                cursor += 1;
                break;
            }
        }
        if body.get(cursor).map_or(false, Token::is_ws) {
            cursor += 1;
        }
        let mut expansion: Vec<Token> = body[cursor..].to_vec();
        for t in &mut expansion {
            if t.is_id() {
                if let Some(idx) = formals.iter().position(|f| f == &t.text) {
                    t.kind = TokenKind::SmacParam(idx);
                }
            }
        }
        let use_macro_case = !icase && !expand;
        self.define_smacro(&name, !icase, formals.len(), expansion, use_macro_case)
    }

    fn dir_undef(&mut self, tline: &[Token], at: usize, head: &str) -> Result<(), PreprocError> {
        let Some((name, rest)) = self.parse_macro_name(tline[at + 1..].to_vec(), head)? else {
            return Ok(());
        };
        if !rest.is_empty() {
            self.report(Severity::Warning, "trailing garbage after macro name ignored")?;
        }
        let sel = self.select_store(&name)?;
        self.store_mut(sel).undef(&name);
        Ok(())
    }

    fn dir_assign(
        &mut self,
        tline: &[Token],
        at: usize,
        head: &str,
        icase: bool,
    ) -> Result<(), PreprocError> {
        let Some((name, rest)) = self.parse_macro_name(tline[at + 1..].to_vec(), head)? else {
            return Ok(());
        };
        let expanded = self.expand_smacro(rest)?;
        let Some(value) = self.eval_tokens(&expanded, false, head)? else {
            return Ok(());
        };
        self.define_smacro(&name, !icase, 0, vec![Token::number(value)], !icase)
    }

    fn dir_strlen(&mut self, tline: &[Token], at: usize, head: &str) -> Result<(), PreprocError> {
        let Some((name, rest)) = self.parse_macro_name(tline[at + 1..].to_vec(), head)? else {
            return Ok(());
        };
        let expanded = self.expand_smacro(rest)?;
        let i = skip_ws(&expanded, 0);
        let Some(t) = expanded.get(i).filter(|t| t.kind == TokenKind::Str) else {
            self.report(
                Severity::NonFatal,
                format!("`{}' requires string as second parameter", head),
            )?;
            return Ok(());
        };
        let len = (t.text.len() - 2) as i64;
        self.define_smacro(&name, true, 0, vec![Token::number(len)], true)
    }

    fn dir_substr(&mut self, tline: &[Token], at: usize, head: &str) -> Result<(), PreprocError> {
        let Some((name, rest)) = self.parse_macro_name(tline[at + 1..].to_vec(), head)? else {
            return Ok(());
        };
        let expanded = self.expand_smacro(rest)?;
        let i = skip_ws(&expanded, 0);
        let Some(t) = expanded.get(i).filter(|t| t.kind == TokenKind::Str) else {
            self.report(
                Severity::NonFatal,
                format!("`{}' requires string as second parameter", head),
            )?;
            return Ok(());
        };
        let inner = t.text[1..t.text.len() - 1].to_string();
        let Some(index) = self.eval_tokens(&expanded[i + 1..], false, head)? else {
            return Ok(());
        };
        // 1-based; anything out of range yields the empty string.
        let picked = if index >= 1 && (index as usize) <= inner.len() {
            (inner.as_bytes()[index as usize - 1] as char).to_string()
        } else {
            String::new()
        };
        let tok = Token::new(TokenKind::Str, format!("'{}'", picked));
        self.define_smacro(&name, true, 0, vec![tok], true)
    }

    // ========================================================================
    // MULTI-LINE MACRO DIRECTIVES
    // ========================================================================

    fn dir_macro(
        &mut self,
        tline: &[Token],
        at: usize,
        head: &str,
        icase: bool,
    ) -> Result<(), PreprocError> {
        let rest = tline[at + 1..].to_vec();
        let i = skip_ws(&rest, 0);
        let rest = self.expand_id(rest[i..].to_vec())?;
        let Some(name_tok) = rest.first().filter(|t| t.is_id()) else {
            self.report(Severity::NonFatal, format!("`{}' expects a macro name", head))?;
            return Ok(());
        };
        let name = name_tok.text.clone();
        let spec = self.expand_smacro(rest[1..].to_vec())?;

        let mut j = skip_ws(&spec, 0);
        let (mut min, mut max): (i64, i64) = (0, 0);
        match spec.get(j) {
            Some(t) if t.kind == TokenKind::Number => match read_num(&t.text) {
                Some(v) => {
                    min = v;
                    max = v;
                }
                None => {
                    self.report(
                        Severity::NonFatal,
                        format!("unable to parse parameter count `{}'", t.text),
                    )?;
                }
            },
            _ => {
                self.report(
                    Severity::NonFatal,
                    format!("`{}' expects a parameter count", head),
                )?;
            }
        }
        let mut unbounded = false;
        if spec.get(j).is_some() && spec.get(j + 1).map_or(false, |t| t.is("-")) {
            j += 2;
            match spec.get(j) {
                Some(t) if t.is("*") => unbounded = true,
                Some(t) if t.kind == TokenKind::Number => match read_num(&t.text) {
                    Some(v) => {
                        max = v;
                        if min > max {
                            self.report(
                                Severity::NonFatal,
                                "minimum parameter count exceeds maximum",
                            )?;
                        }
                    }
                    None => {
                        self.report(
                            Severity::NonFatal,
                            format!("unable to parse parameter count `{}'", t.text),
                        )?;
                    }
                },
                _ => {
                    self.report(
                        Severity::NonFatal,
                        format!("`{}' expects a parameter count after `-'", head),
                    )?;
                }
            }
        }
        let mut plus = false;
        if spec.get(j).is_some() && spec.get(j + 1).map_or(false, |t| t.is("+")) {
            j += 1;
            plus = true;
        }
        let mut nolist = false;
        if spec.get(j).is_some()
            && spec
                .get(j + 1)
                .map_or(false, |t| t.is_id() && t.text.eq_ignore_ascii_case(".nolist"))
        {
            j += 1;
            nolist = true;
        }
        let defaults = if j + 1 < spec.len() {
            let split = split_params(&spec[j + 1..]);
            if split.brace_error {
                self.report(
                    Severity::NonFatal,
                    "braces do not enclose all of macro parameter",
                )?;
            }
            split.params
        } else {
            Vec::new()
        };

        let nparam_min = min.max(0) as usize;
        let nparam_max = if unbounded {
            usize::MAX
        } else {
            max.max(0) as usize
        };
        if self
            .mmacros
            .overlapping(&name, nparam_min, nparam_max, plus)
            .is_some()
        {
            self.report(
                Severity::Warning,
                format!("redefining multi-line macro `{}'", name),
            )?;
        }

        self.gather = Some(Gather::Macro(MMacroDef {
            id: self.fresh_macro_id(),
            name,
            casesense: !icase,
            nparam_min,
            nparam_max,
            plus,
            nolist,
            defaults,
            body: Vec::new(),
        }));
        Ok(())
    }

    fn dir_endmacro(&mut self, head: &str) -> Result<(), PreprocError> {
        match self.gather.take() {
            Some(Gather::Macro(def)) => {
                self.mmacros.insert(def);
                Ok(())
            }
            other => {
                self.gather = other;
                self.report(Severity::Fatal, format!("`{}': no matching `%macro'", head))
            }
        }
    }

    fn dir_rep(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        let rest = tline[at + 1..].to_vec();
        let mut j = skip_ws(&rest, 0);
        let mut nolist = false;
        if rest
            .get(j)
            .map_or(false, |t| t.is_id() && t.text.eq_ignore_ascii_case(".nolist"))
        {
            nolist = true;
            j = skip_ws(&rest, j + 1);
        }
        let count = if j < rest.len() {
            let expanded = self.expand_smacro(rest[j..].to_vec())?;
            self.eval_tokens(&expanded, false, "%rep")?.unwrap_or(0)
        } else {
            self.report(Severity::NonFatal, "`%rep' expects a repeat count")?;
            0
        };
        self.gather = Some(Gather::Rep {
            remaining: count.saturating_add(1),
            nolist,
            body: Vec::new(),
        });
        Ok(())
    }

    fn dir_endrep(&mut self) -> Result<(), PreprocError> {
        match self.gather.take() {
            Some(Gather::Rep {
                remaining,
                nolist,
                body,
            }) => {
                // The body is not queued here: the end marker replays it
                // once per remaining pass.
                if let Some(frame) = self.istk.last_mut() {
                    frame.expansion.push(ExpLine::End);
                    frame.invocations.push(ExpFrame::Rep(RepFrame {
                        remaining,
                        body,
                        nolist,
                        lineno: 0,
                    }));
                }
                Ok(())
            }
            other => {
                self.gather = other;
                self.report(Severity::Fatal, "`%endrep': no matching `%rep'")
            }
        }
    }

    fn dir_exitrep(&mut self) -> Result<(), PreprocError> {
        let mut found = false;
        if let Some(frame) = self.istk.last_mut() {
            for f in frame.invocations.iter_mut().rev() {
                if let ExpFrame::Rep(rep) = f {
                    rep.remaining = 0;
                    found = true;
                    break;
                }
            }
        }
        if !found {
            self.report(Severity::NonFatal, "`%exitrep' not within `%rep' block")?;
        }
        Ok(())
    }

    fn dir_rotate(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        let rest = tline[at + 1..].to_vec();
        let j = skip_ws(&rest, 0);
        if j >= rest.len() {
            self.report(Severity::NonFatal, "`%rotate' missing rotate count")?;
            return Ok(());
        }
        let expanded = self.expand_smacro(rest[j..].to_vec())?;
        let Some(count) = self.eval_tokens(&expanded, false, "%rotate")? else {
            return Ok(());
        };

        enum Outcome {
            NoMacro,
            NoParams,
            Done,
        }
        let mut outcome = Outcome::NoMacro;
        if let Some(frame) = self.istk.last_mut() {
            let call = frame.invocations.iter_mut().rev().find_map(|f| match f {
                ExpFrame::Call(call) => Some(call),
                ExpFrame::Rep(_) => None,
            });
            if let Some(call) = call {
                if call.nparam == 0 {
                    outcome = Outcome::NoParams;
                } else {
                    let n = call.nparam as i64;
                    let mut r = call.rotate as i64 + count;
                    if r < 0 {
                        r = n - (-r) % n;
                    }
                    r %= n;
                    call.rotate = r as usize;
                    outcome = Outcome::Done;
                }
            }
        }
        match outcome {
            Outcome::NoMacro => {
                self.report(Severity::NonFatal, "`%rotate' invoked outside a macro call")
            }
            Outcome::NoParams => self.report(
                Severity::NonFatal,
                "`%rotate' invoked within macro without parameters",
            ),
            Outcome::Done => Ok(()),
        }
    }

    // ========================================================================
    // CONDITIONAL ASSEMBLY
    // ========================================================================

    fn dir_if(
        &mut self,
        tline: &[Token],
        at: usize,
        kind: IfKind,
        negate: bool,
        head: &str,
    ) -> Result<(), PreprocError> {
        let state = if self.istk.last().map_or(false, IncludeFrame::suppressed) {
            // Opened inside a dead branch: nothing in it can ever emit.
            CondState::Never
        } else {
            let value = self.if_condition(tline[at + 1..].to_vec(), kind, negate, head)?;
            CondState::from_predicate(value)
        };
        if let Some(frame) = self.istk.last_mut() {
            frame.conds.push(state);
        }
        Ok(())
    }

    fn dir_elif(
        &mut self,
        tline: &[Token],
        at: usize,
        kind: IfKind,
        negate: bool,
        head: &str,
    ) -> Result<(), PreprocError> {
        if self.istk.last().map_or(true, |f| f.conds.is_empty()) {
            return self.report(Severity::Fatal, format!("`{}': no matching `%if'", head));
        }
        let top = self
            .istk
            .last()
            .and_then(|f| f.conds.last().copied())
            .unwrap_or(CondState::Never);
        let new_state = match top.on_elif() {
            Some(state) => state,
            None => {
                // The branch so far was false and may now be taken; the
                // normal parameter substitution was inhibited, so do it
                // here before evaluating.
                let expanded = self.expand_mmac_params(tline[at + 1..].to_vec())?;
                let value = self.if_condition(expanded, kind, negate, head)?;
                CondState::from_predicate(value)
            }
        };
        if let Some(slot) = self.istk.last_mut().and_then(|f| f.conds.last_mut()) {
            *slot = new_state;
        }
        Ok(())
    }

    fn dir_else(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        if tline.len() > at + 1 {
            self.report(Severity::Warning, "trailing garbage after `%else' ignored")?;
        }
        if self.istk.last().map_or(true, |f| f.conds.is_empty()) {
            return self.report(Severity::Fatal, "`%else': no matching `%if'");
        }
        if let Some(slot) = self.istk.last_mut().and_then(|f| f.conds.last_mut()) {
            *slot = slot.on_else();
        }
        Ok(())
    }

    fn dir_endif(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        if tline.len() > at + 1 {
            self.report(Severity::Warning, "trailing garbage after `%endif' ignored")?;
        }
        if self.istk.last().map_or(true, |f| f.conds.is_empty()) {
            return self.report(Severity::Fatal, "`%endif': no matching `%if'");
        }
        if let Some(frame) = self.istk.last_mut() {
            frame.conds.pop();
        }
        Ok(())
    }

    /// Evaluate one `%if`-family predicate. `Ok(None)` means evaluation
    /// itself failed (already reported) and the construct goes dead.
    fn if_condition(
        &mut self,
        tokens: Vec<Token>,
        kind: IfKind,
        negate: bool,
        head: &str,
    ) -> Result<Option<bool>, PreprocError> {
        let value: Option<bool> = match kind {
            IfKind::Ctx => {
                if self.contexts.is_empty() {
                    Some(false)
                } else {
                    let top_name = self
                        .contexts
                        .top()
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                    let mut matched = false;
                    let mut ok = true;
                    for t in tokens.iter().filter(|t| !t.is_ws()) {
                        if !t.is_id() {
                            self.report(
                                Severity::NonFatal,
                                format!("`{}' expects context identifiers", head),
                            )?;
                            ok = false;
                            break;
                        }
                        if t.text.eq_ignore_ascii_case(&top_name) {
                            matched = true;
                        }
                    }
                    if ok {
                        Some(matched)
                    } else {
                        None
                    }
                }
            }
            IfKind::Def => {
                let mut matched = false;
                let mut ok = true;
                for t in tokens.iter().filter(|t| !t.is_ws()) {
                    let valid =
                        t.is_id() || (t.is_ppid() && t.text.as_bytes().get(1) == Some(&b'$'));
                    if !valid {
                        self.report(
                            Severity::NonFatal,
                            format!("`{}' expects macro identifiers", head),
                        )?;
                        ok = false;
                        break;
                    }
                    if self.smacro_is_defined(&t.text)? {
                        matched = true;
                    }
                }
                if ok {
                    Some(matched)
                } else {
                    None
                }
            }
            IfKind::Idn { icase } => self.if_identical(tokens, icase, head)?,
            IfKind::MacroExists => self.if_macro_exists(tokens, head)?,
            IfKind::Id | IfKind::Num | IfKind::Str => {
                let expanded = self.expand_smacro(tokens)?;
                let i = skip_ws(&expanded, 0);
                let hit = match expanded.get(i) {
                    Some(t) => match kind {
                        IfKind::Id => t.is_id(),
                        IfKind::Num => t.kind == TokenKind::Number,
                        _ => t.kind == TokenKind::Str,
                    },
                    None => false,
                };
                Some(hit)
            }
            IfKind::Expr => {
                let expanded = self.expand_smacro(tokens)?;
                self.eval_tokens(&expanded, true, head)?.map(|v| v != 0)
            }
        };
        Ok(value.map(|v| v != negate))
    }

    /// `%ifidn`/`%ifidni`: structural token-stream equality of the two
    /// comma-separated halves, whitespace-insensitive, quote style
    /// ignored for strings.
    fn if_identical(
        &mut self,
        tokens: Vec<Token>,
        icase: bool,
        head: &str,
    ) -> Result<Option<bool>, PreprocError> {
        let expanded = self.expand_smacro(tokens)?;
        let Some(comma) = expanded.iter().position(|t| t.is(",")) else {
            self.report(
                Severity::NonFatal,
                format!("`{}' expects two comma-separated arguments", head),
            )?;
            return Ok(None);
        };
        let (left, right) = expanded.split_at(comma);
        let right = &right[1..];
        if right.iter().any(|t| t.is(",")) {
            self.report(
                Severity::NonFatal,
                format!("`{}': more than one comma on line", head),
            )?;
            return Ok(None);
        }
        let l: Vec<&Token> = left.iter().filter(|t| !t.is_ws()).collect();
        let r: Vec<&Token> = right.iter().filter(|t| !t.is_ws()).collect();
        if l.len() != r.len() {
            return Ok(Some(false));
        }
        for (a, b) in l.iter().zip(r.iter()) {
            if a.kind != b.kind {
                return Ok(Some(false));
            }
            let (ta, tb) = if a.kind == TokenKind::Str {
                (
                    &a.text[1..a.text.len() - 1],
                    &b.text[1..b.text.len() - 1],
                )
            } else {
                (a.text.as_str(), b.text.as_str())
            };
            let same = if icase {
                ta.eq_ignore_ascii_case(tb)
            } else {
                ta == tb
            };
            if !same {
                return Ok(Some(false));
            }
        }
        Ok(Some(true))
    }

    /// `%ifmacro`: arity-aware multi-line macro existence.
    fn if_macro_exists(
        &mut self,
        tokens: Vec<Token>,
        head: &str,
    ) -> Result<Option<bool>, PreprocError> {
        let i = skip_ws(&tokens, 0);
        let rest = self.expand_id(tokens[i..].to_vec())?;
        if !rest.first().map_or(false, Token::is_id) {
            self.report(Severity::NonFatal, format!("`{}' expects a macro name", head))?;
            return Ok(None);
        }
        let name = rest[0].text.clone();
        let spec = self.expand_smacro(rest[1..].to_vec())?;
        let mut j = skip_ws(&spec, 0);
        let (mut min, mut max): (i64, i64) = (0, i64::MAX);
        match spec.get(j) {
            None => {}
            Some(t) if t.kind == TokenKind::Number => match read_num(&t.text) {
                Some(v) => {
                    min = v;
                    max = v;
                }
                None => {
                    self.report(
                        Severity::NonFatal,
                        format!("unable to parse parameter count `{}'", t.text),
                    )?;
                }
            },
            Some(_) => {
                self.report(
                    Severity::NonFatal,
                    format!("`{}' expects a parameter count or nothing", head),
                )?;
            }
        }
        if spec.get(j).is_some() && spec.get(j + 1).map_or(false, |t| t.is("-")) {
            j += 2;
            match spec.get(j) {
                Some(t) if t.is("*") => max = i64::MAX,
                Some(t) if t.kind == TokenKind::Number => match read_num(&t.text) {
                    Some(v) => {
                        max = v;
                        if min > max {
                            self.report(
                                Severity::NonFatal,
                                "minimum parameter count exceeds maximum",
                            )?;
                        }
                    }
                    None => {
                        self.report(
                            Severity::NonFatal,
                            format!("unable to parse parameter count `{}'", t.text),
                        )?;
                    }
                },
                _ => {
                    self.report(
                        Severity::NonFatal,
                        format!("`{}' expects a parameter count after `-'", head),
                    )?;
                }
            }
        }
        let mut plus = false;
        if spec.get(j).is_some() && spec.get(j + 1).map_or(false, |t| t.is("+")) {
            plus = true;
        }
        let min = min.max(0) as usize;
        let max = if max == i64::MAX {
            usize::MAX
        } else {
            max.max(0) as usize
        };
        Ok(Some(self.mmacros.overlapping(&name, min, max, plus).is_some()))
    }

    // ========================================================================
    // CONTEXTS AND SCOPES
    // ========================================================================

    fn context_name_arg(
        &mut self,
        tline: &[Token],
        at: usize,
        head: &str,
    ) -> Result<Option<String>, PreprocError> {
        let rest = tline[at + 1..].to_vec();
        let i = skip_ws(&rest, 0);
        let rest = self.expand_id(rest[i..].to_vec())?;
        if !rest.first().map_or(false, Token::is_id) {
            self.report(
                Severity::NonFatal,
                format!("`{}' expects a context identifier", head),
            )?;
            return Ok(None);
        }
        if rest.len() > 1 {
            self.report(
                Severity::Warning,
                format!("trailing garbage after `{}' ignored", head),
            )?;
        }
        Ok(Some(rest[0].text.clone()))
    }

    fn dir_push(&mut self, tline: &[Token], at: usize, head: &str) -> Result<(), PreprocError> {
        let Some(name) = self.context_name_arg(tline, at, head)? else {
            return Ok(());
        };
        let number = self.unique;
        self.unique += 1;
        self.contexts.push(name, number);
        Ok(())
    }

    fn dir_repl(&mut self, tline: &[Token], at: usize, head: &str) -> Result<(), PreprocError> {
        let Some(name) = self.context_name_arg(tline, at, head)? else {
            return Ok(());
        };
        if !self.contexts.repl(name) {
            self.report(Severity::NonFatal, "`%repl': context stack is empty")?;
        }
        Ok(())
    }

    fn dir_pop(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        if tline.len() > at + 1 {
            self.report(Severity::Warning, "trailing garbage after `%pop' ignored")?;
        }
        if self.contexts.pop().is_none() {
            return self.report(Severity::Fatal, "`%pop': context stack is already empty");
        }
        Ok(())
    }

    fn dir_scope(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        if tline.len() > at + 1 {
            self.report(Severity::Warning, "trailing garbage after `%scope' ignored")?;
        }
        self.smacros.push_scope();
        Ok(())
    }

    fn dir_endscope(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        if tline.len() > at + 1 {
            self.report(
                Severity::Warning,
                "trailing garbage after `%endscope' ignored",
            )?;
        }
        if !self.smacros.pop_scope() {
            return self.report(Severity::Fatal, "`%endscope': already popped all levels");
        }
        Ok(())
    }

    fn dir_clear(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        if tline.len() > at + 1 {
            self.report(Severity::Warning, "trailing garbage after `%clear' ignored")?;
        }
        self.smacros.clear();
        self.mmacros.clear();
        Ok(())
    }

    // ========================================================================
    // INPUT CONTROL
    // ========================================================================

    fn dir_include(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        let rest = &tline[at + 1..];
        let i = skip_ws(rest, 0);
        let Some(t) = rest.get(i).filter(|t| t.kind == TokenKind::Str) else {
            self.report(Severity::NonFatal, "`%include' expects a file name")?;
            return Ok(());
        };
        if i + 1 < rest.len() {
            self.report(
                Severity::Warning,
                "trailing garbage after `%include' ignored",
            )?;
        }
        let name = t.text[1..t.text.len() - 1].to_string();
        let name = self.expand_in_string(&name)?;
        self.push_include(&name)
    }

    fn dir_line(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        let rest = &tline[at + 1..];
        let mut j = skip_ws(rest, 0);
        let lineno = match rest.get(j).filter(|t| t.kind == TokenKind::Number) {
            Some(t) => match read_num(&t.text) {
                Some(v) => v,
                None => {
                    self.report(Severity::NonFatal, "`%line' expects line number")?;
                    return Ok(());
                }
            },
            None => {
                self.report(Severity::NonFatal, "`%line' expects line number")?;
                return Ok(());
            }
        };
        j += 1;
        let mut lineinc = 1;
        if rest.get(j).map_or(false, |t| t.is("+")) {
            j += 1;
            match rest
                .get(j)
                .filter(|t| t.kind == TokenKind::Number)
                .and_then(|t| read_num(&t.text))
            {
                Some(v) => {
                    lineinc = v;
                    j += 1;
                }
                None => {
                    self.report(Severity::NonFatal, "`%line' expects line increment")?;
                    return Ok(());
                }
            }
        }
        j = skip_ws(rest, j);
        if j < rest.len() {
            let mut warnings = Vec::new();
            let fname = detoken_basic(&rest[j..], |w| warnings.push(w));
            for warning in warnings {
                self.report(Severity::Warning, warning)?;
            }
            self.src_file = fname;
        }
        self.src_line = lineno;
        if let Some(frame) = self.istk.last_mut() {
            frame.lineinc = lineinc;
        }
        Ok(())
    }

    fn dir_error(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        let rest = self.expand_smacro(tline[at + 1..].to_vec())?;
        let i = skip_ws(&rest, 0);
        match rest.get(i) {
            Some(t) if t.kind == TokenKind::Str => {
                let inner = t.text[1..t.text.len() - 1].to_string();
                let message = self.expand_in_string(&inner)?;
                self.report(Severity::NonFatal, message)?;
            }
            _ => {
                // An unquoted operand still produces a diagnostic, just a
                // softer one.
                let mut warnings = Vec::new();
                let text = detoken_basic(&rest[i..], |w| warnings.push(w));
                for warning in warnings {
                    self.report(Severity::Warning, warning)?;
                }
                self.report(Severity::Warning, text)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // STACK-FRAME SUGAR
    // ========================================================================

    fn dir_stacksize(&mut self, tline: &[Token], at: usize) -> Result<(), PreprocError> {
        let rest = &tline[at + 1..];
        let i = skip_ws(rest, 0);
        let Some(t) = rest.get(i).filter(|t| t.is_id()) else {
            self.report(Severity::NonFatal, "`%stacksize' missing size parameter")?;
            return Ok(());
        };
        self.stack_frame = match t.text.to_ascii_lowercase().as_str() {
            "flat" => StackFrame {
                size: 4,
                pointer: "ebp",
                arg_offset: 8,
                local_offset: 4,
            },
            "large" => StackFrame {
                size: 2,
                pointer: "bp",
                arg_offset: 4,
                local_offset: 2,
            },
            "small" => StackFrame {
                size: 2,
                pointer: "bp",
                arg_offset: 6,
                local_offset: 2,
            },
            _ => {
                self.report(Severity::NonFatal, "`%stacksize' invalid size type")?;
                return Ok(());
            }
        };
        Ok(())
    }

    /// `%arg name:type, …` and `%local name:type, …` desugar into
    /// `%define`/`%assign` lines fed back through this dispatcher.
    fn dir_arg_local(
        &mut self,
        tline: &[Token],
        at: usize,
        local: bool,
    ) -> Result<(), PreprocError> {
        let which = if local { "%local" } else { "%arg" };
        let mut offset = if local {
            self.stack_frame.local_offset
        } else {
            self.stack_frame.arg_offset
        };
        let mut i = at;
        loop {
            i = skip_ws(tline, i + 1);
            let Some(name_tok) = tline.get(i).filter(|t| t.is_id()) else {
                self.report(
                    Severity::NonFatal,
                    format!("`{}' missing argument parameter", which),
                )?;
                return Ok(());
            };
            let name = name_tok.text.clone();
            i += 1;
            if !tline.get(i).map_or(false, |t| t.is(":")) {
                self.report(
                    Severity::NonFatal,
                    format!("syntax error processing `{}' directive", which),
                )?;
                return Ok(());
            }
            i += 1;
            let Some(type_tok) = tline.get(i).filter(|t| t.is_id()) else {
                self.report(
                    Severity::NonFatal,
                    format!("`{}' missing size type parameter", which),
                )?;
                return Ok(());
            };
            // The size type may itself be a macro.
            let expanded = self.expand_smacro(vec![type_tok.clone()])?;
            let k = skip_ws(&expanded, 0);
            let type_name = expanded
                .get(k)
                .map(|t| t.text.to_ascii_lowercase())
                .unwrap_or_default();
            let base = match type_name.as_str() {
                "byte" => 1,
                "word" => 2,
                "dword" => 4,
                "qword" => 8,
                "tword" => 10,
                _ => {
                    self.report(
                        Severity::NonFatal,
                        format!("invalid size type for `{}'", which),
                    )?;
                    return Ok(());
                }
            };
            let size = std::cmp::max(base, self.stack_frame.size);
            let line = if local {
                format!("%define {} ({}-{})", name, self.stack_frame.pointer, offset)
            } else {
                format!("%define {} ({}+{})", name, self.stack_frame.pointer, offset)
            };
            self.do_directive(&tokenize(&line).tokens)?;
            offset += size;
            if local {
                let line = format!("%assign %$localsize %$localsize+{}", size);
                self.do_directive(&tokenize(&line).tokens)?;
            }
            i = skip_ws(tline, i + 1);
            if !tline.get(i).map_or(false, |t| t.is(",")) {
                break;
            }
        }
        Ok(())
    }
}
