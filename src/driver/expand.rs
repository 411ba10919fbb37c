//! The three expansion layers, in the order a line meets them:
//!
//! 1. [`Preprocessor::expand_mmac_params`] — `%0`, `%n`, `%+n`/`%-n`,
//!    `%{a:b}` ranges and `%%name` uniques, bound against the innermost
//!    *named* invocation frame;
//! 2. [`Preprocessor::expand_smacro`] — the single-line fixpoint rewriter
//!    with its cycle guard;
//! 3. [`Preprocessor::expand_mmacro`] — multi-line invocation, which queues
//!    body lines instead of producing text.

use std::rc::Rc;

use crate::diagnostics::{PreprocError, Severity};
use crate::frames::{CallFrame, ExpFrame, ExpLine};
use crate::macros::{split_params, trim_param, MMacroDef, SMacro};
use crate::token::{join_adjacent, paste_tokens, skip_ws, Token, TokenKind};

use super::Preprocessor;

// ============================================================================
// PARAMETER & LOCAL SUBSTITUTION
// ============================================================================

/// Does this token reference multi-line macro invocation state?
fn is_param_ref(tok: &Token) -> bool {
    if !tok.is_ppid() {
        return false;
    }
    let b = tok.text.as_bytes();
    if b.len() < 2 {
        return false;
    }
    match b[1] {
        // `%+` alone is the paste operator, not a parameter.
        b'+' | b'-' => b.len() > 2,
        b'%' => true,
        b'0'..=b'9' => true,
        _ => false,
    }
}

/// Snapshot of the innermost named invocation frame.
struct ParamsView {
    nparam: usize,
    rotate: usize,
    unique: u64,
    params: Vec<Vec<Token>>,
}

impl ParamsView {
    /// Bound tokens of 0-based parameter `idx`, rotation applied.
    fn param(&self, idx: usize) -> Option<&[Token]> {
        if idx >= self.nparam {
            return None;
        }
        let rotated = if self.nparam > 1 {
            (idx + self.rotate) % self.nparam
        } else {
            idx
        };
        self.params.get(rotated).map(Vec::as_slice)
    }
}

/// The condition-code keyword a bound parameter consists of, if it is one
/// identifier (an optional trailing comma tolerated) and nothing else.
fn param_condition_name(param: &[Token]) -> Option<String> {
    let i = skip_ws(param, 0);
    let tok = param.get(i)?;
    if !tok.is_id() {
        return None;
    }
    let j = skip_ws(param, i + 1);
    if j < param.len() && !param[j].is(",") {
        return None;
    }
    Some(tok.text.clone())
}

impl Preprocessor {
    /// Expand invocation-frame references on one physical line.
    pub(crate) fn expand_mmac_params(
        &mut self,
        tline: Vec<Token>,
    ) -> Result<Vec<Token>, PreprocError> {
        if !tline.iter().any(is_param_ref) {
            return Ok(tline);
        }

        // %rep frames are anonymous: parameters belong to the nearest
        // enclosing real macro call.
        let view: Option<ParamsView> = self.istk.last().and_then(|frame| {
            frame.invocations.iter().rev().find_map(|f| match f {
                ExpFrame::Call(call) => Some(ParamsView {
                    nparam: call.nparam,
                    rotate: call.rotate,
                    unique: call.unique,
                    params: call.params.clone(),
                }),
                ExpFrame::Rep(_) => None,
            })
        });

        let mut out: Vec<Token> = Vec::with_capacity(tline.len());
        for tok in tline {
            if !is_param_ref(&tok) {
                out.push(tok);
                continue;
            }
            let Some(view) = view.as_ref() else {
                self.report(
                    Severity::NonFatal,
                    format!("`{}': not in a macro call", tok.text),
                )?;
                continue;
            };
            let text = tok.text.as_str();

            if let Some(colon) = text.find(':') {
                // %{a:b}: the comma-joined argument range a..b. Indices
                // out of range contribute nothing.
                let first: i64 = text[1..colon].parse().unwrap_or(0);
                let last: i64 = text[colon + 1..].parse().unwrap_or(0);
                let mut end = last - 1;
                if end < 0 {
                    end += view.nparam as i64;
                }
                let mut joined_any = false;
                let mut k = first - 1;
                while k <= end {
                    if k >= 0 {
                        if let Some(ptoks) = view.param(k as usize) {
                            if !ptoks.is_empty() {
                                if joined_any {
                                    out.push(Token::other(","));
                                }
                                joined_any = true;
                                out.extend(ptoks.iter().cloned());
                            }
                        }
                    }
                    k += 1;
                }
                continue;
            }

            match text.as_bytes()[1] {
                b'0' => out.push(Token::number(view.nparam as i64)),
                b'%' => out.push(Token::id(format!("..@{}.{}", view.unique, &text[2..]))),
                b'+' | b'-' => {
                    let want_inverse = text.as_bytes()[1] == b'-';
                    let n: i64 = text[2..].parse().unwrap_or(0);
                    let cc = (n >= 1)
                        .then(|| view.param(n as usize - 1))
                        .flatten()
                        .and_then(param_condition_name)
                        .filter(|name| self.ccodes.is_condition(name));
                    let Some(cc) = cc else {
                        self.report(
                            Severity::NonFatal,
                            format!("macro parameter {} is not a condition code", n),
                        )?;
                        continue;
                    };
                    if want_inverse {
                        match self.ccodes.inverse(&cc) {
                            Some(inv) => out.push(Token::id(inv)),
                            None => {
                                self.report(
                                    Severity::NonFatal,
                                    format!(
                                        "condition code `{}' is not invertible",
                                        cc.to_ascii_lowercase()
                                    ),
                                )?;
                            }
                        }
                    } else {
                        out.push(Token::id(cc.to_ascii_lowercase()));
                    }
                }
                _ => {
                    let n: usize = text[1..].parse().unwrap_or(0);
                    if n >= 1 {
                        if let Some(ptoks) = view.param(n - 1) {
                            out.extend(ptoks.iter().cloned());
                        }
                        // Out of range: the reference vanishes.
                    }
                }
            }
        }

        join_adjacent(&mut out);
        Ok(out)
    }

    // ========================================================================
    // SINGLE-LINE EXPANSION (FIXPOINT REWRITER)
    // ========================================================================

    /// Expand all single-line macro calls in a line, rescanning after any
    /// token pasting until nothing more changes.
    ///
    /// The cycle guard is the `active` set of definition identities plus
    /// end markers threaded through the scan worklist: a macro whose
    /// expansion is still being scanned will not match again until the
    /// scan passes its end marker.
    pub(crate) fn expand_smacro(&mut self, tline: Vec<Token>) -> Result<Vec<Token>, PreprocError> {
        let mut active: std::collections::HashSet<u64> = std::collections::HashSet::new();
        // Worklist, last element = next item.
        let mut input: Vec<ScanItem> = tline.into_iter().rev().map(ScanItem::Tok).collect();

        loop {
            let mut out: Vec<Token> = Vec::new();
            while let Some(item) = input.pop() {
                let tok = match item {
                    ScanItem::End(id) => {
                        active.remove(&id);
                        continue;
                    }
                    ScanItem::Tok(tok) => tok,
                };
                if !tok.is_id() && !tok.is_ppid() {
                    out.push(tok);
                    continue;
                }
                let name = tok.text.clone();
                let Some(first) = self.smacro_lookup_first(&name)? else {
                    out.push(tok);
                    continue;
                };

                if first.nparam == 0 {
                    self.splice_niladic(first, tok, &mut active, &mut input, &mut out);
                    continue;
                }

                self.expand_parametric(tok, &mut active, &mut input, &mut out)?;
            }

            if paste_tokens(&mut out) {
                // Pasting may have built new macro names: rescan. All end
                // markers were consumed above, so nothing is active.
                active.clear();
                input = out.into_iter().rev().map(ScanItem::Tok).collect();
                continue;
            }
            return Ok(out);
        }
    }

    fn splice_niladic(
        &mut self,
        mac: SMacro,
        tok: Token,
        active: &mut std::collections::HashSet<u64>,
        input: &mut Vec<ScanItem>,
        out: &mut Vec<Token>,
    ) {
        if active.contains(&mac.id) {
            // Self-reference inside its own expansion: leave the name.
            out.push(tok);
            return;
        }
        if mac.expansion.is_empty() {
            match mac.name.as_str() {
                "__FILE__" => out.push(Token::new(
                    TokenKind::Str,
                    format!("\"{}\"", self.src_file),
                )),
                "__LINE__" => out.push(Token::number(self.src_line)),
                _ => {} // expands to nothing
            }
            return;
        }
        active.insert(mac.id);
        input.push(ScanItem::End(mac.id));
        for t in mac.expansion.iter().rev() {
            input.push(ScanItem::Tok(t.clone()));
        }
    }

    /// Handle a name whose first visible definition takes parameters:
    /// find the argument list, re-resolve the overload for the actual
    /// count, and splice — or put everything back and emit the name.
    fn expand_parametric(
        &mut self,
        name_tok: Token,
        active: &mut std::collections::HashSet<u64>,
        input: &mut Vec<ScanItem>,
        out: &mut Vec<Token>,
    ) -> Result<(), PreprocError> {
        // Look for the opening parenthesis, skipping whitespace (and
        // retiring any end markers met on the way).
        let mut skipped_ws: Vec<Token> = Vec::new();
        let mut found_paren = false;
        while let Some(item) = input.pop() {
            match item {
                ScanItem::End(id) => {
                    active.remove(&id);
                }
                ScanItem::Tok(t) if t.is_ws() => skipped_ws.push(t),
                ScanItem::Tok(t) if t.is("(") => {
                    found_paren = true;
                    break;
                }
                item => {
                    input.push(item);
                    break;
                }
            }
        }
        if !found_paren {
            // Called without parameters: not an invocation at all.
            out.push(name_tok);
            for t in skipped_ws.into_iter().rev() {
                input.push(ScanItem::Tok(t));
            }
            return Ok(());
        }

        // Parse the argument region. Top-level commas split; `{…}` groups
        // and nested parentheses protect their commas.
        let mut params: Vec<Vec<Token>> = vec![Vec::new()];
        let mut consumed: Vec<Token> = vec![Token::other("(")];
        let mut pending_ws = false;
        let mut brackets: i32 = 0;
        let mut paren: i32 = 0;
        loop {
            let t = match input.pop() {
                None => {
                    self.report(Severity::NonFatal, "macro call expects terminating `)'")?;
                    break;
                }
                Some(ScanItem::End(id)) => {
                    active.remove(&id);
                    continue;
                }
                Some(ScanItem::Tok(t)) => t,
            };
            consumed.push(t.clone());
            let cur = params.len() - 1;

            if t.is_ws() && brackets <= 0 {
                if !params[cur].is_empty() {
                    pending_ws = true;
                }
                continue;
            }
            if t.kind == TokenKind::Other && t.text.len() == 1 {
                let ch = t.text.as_bytes()[0];
                if ch == b',' && paren == 0 && brackets <= 0 {
                    params.push(Vec::new());
                    pending_ws = false;
                    continue;
                }
                if ch == b'{' && (brackets > 0 || (brackets == 0 && params[cur].is_empty())) {
                    brackets += 1;
                    if brackets == 1 {
                        continue; // the group opener itself is not bound
                    }
                }
                if ch == b'}' && brackets > 0 {
                    brackets -= 1;
                    if brackets == 0 {
                        brackets = -1; // group closed; expect , or )
                        continue;
                    }
                }
                if ch == b'(' && brackets == 0 {
                    paren += 1;
                }
                if ch == b')' && brackets <= 0 {
                    paren -= 1;
                    if paren < 0 {
                        break; // the call's closing parenthesis
                    }
                }
            }
            if brackets < 0 {
                brackets = 0;
                self.report(
                    Severity::NonFatal,
                    "braces do not enclose all of macro parameter",
                )?;
            }
            if pending_ws {
                let last = params.len() - 1;
                params[last].push(Token::whitespace());
                pending_ws = false;
            }
            let cur = params.len() - 1;
            params[cur].push(t);
        }

        let nparam = params.len();
        let exact = self.smacro_lookup_exact(&name_tok.text, nparam)?;
        let usable = match exact {
            Some(m) if active.contains(&m.id) => None,
            Some(m) => Some(m),
            None => {
                self.report(
                    Severity::Warning,
                    format!(
                        "macro `{}' exists, but not taking {} parameters",
                        name_tok.text, nparam
                    ),
                )?;
                None
            }
        };
        let Some(mac) = usable else {
            // Leave the call text in the stream to be scanned as plain
            // tokens: arguments and parentheses first, the whitespace that
            // preceded them on top so the original order re-emerges.
            out.push(name_tok);
            let mut restore = consumed;
            while let Some(t) = restore.pop() {
                input.push(ScanItem::Tok(t));
            }
            for t in skipped_ws.into_iter().rev() {
                input.push(ScanItem::Tok(t));
            }
            return Ok(());
        };

        // Splice the substituted expansion back into the scan.
        active.insert(mac.id);
        input.push(ScanItem::End(mac.id));
        let mut splice: Vec<Token> = Vec::new();
        for t in &mac.expansion {
            match t.kind {
                TokenKind::SmacParam(idx) => {
                    if let Some(p) = params.get(idx) {
                        splice.extend(p.iter().cloned());
                    }
                }
                _ => splice.push(t.clone()),
            }
        }
        for t in splice.into_iter().rev() {
            input.push(ScanItem::Tok(t));
        }
        Ok(())
    }

    /// Expand single-line macros inside a *composite* identifier — a run
    /// of adjacent id/number tokens — leaving a lone identifier alone so
    /// that defining directives can bind it literally.
    pub(crate) fn expand_id(&mut self, tokens: Vec<Token>) -> Result<Vec<Token>, PreprocError> {
        let run = tokens
            .iter()
            .position(|t| {
                !(t.is_id() || t.is_ppid() || t.kind == TokenKind::Number)
            })
            .unwrap_or(tokens.len());
        if run <= 1 {
            return Ok(tokens);
        }
        let mut head = tokens;
        let tail = head.split_off(run);
        let mut expanded = self.expand_smacro(head)?;
        expanded.extend(tail);
        Ok(expanded)
    }

    // ========================================================================
    // MULTI-LINE INVOCATION
    // ========================================================================

    /// Find the definition a call line matches and bind its parameters.
    fn is_mmacro(
        &mut self,
        name: &str,
        args: &[Token],
    ) -> Result<Option<(Rc<MMacroDef>, Vec<Vec<Token>>, usize)>, PreprocError> {
        if !self.mmacros.has_name(name) {
            return Ok(None);
        }
        let split = split_params(args);
        if split.brace_error {
            self.report(
                Severity::NonFatal,
                "braces do not enclose all of macro parameter",
            )?;
        }
        let raw = split.params;
        let call_count = raw.len();

        let candidates: Vec<Rc<MMacroDef>> = self.mmacros.matches(name).cloned().collect();
        let mut skipped_active = false;
        for def in candidates {
            if !def.accepts(call_count) {
                continue;
            }
            if self.active_mmacros.contains(&def.id) {
                // Self-recursive invocation: skip this definition and keep
                // searching the family.
                skipped_active = true;
                continue;
            }

            let mut raws = raw.clone();
            while raws.len() < def.nparam_min + def.defaults.len() {
                let backfill = raws.len() - def.nparam_min;
                raws.push(def.defaults[backfill].clone());
            }
            let mut nparam = raws.len();
            if def.plus && nparam > def.nparam_max {
                nparam = def.nparam_max;
            }

            let mut params: Vec<Vec<Token>> = Vec::with_capacity(nparam);
            for i in 0..nparam {
                if def.plus && i == nparam - 1 && raws.len() > nparam {
                    // Greedy tail: everything from here on, commas restored.
                    let mut tail: Vec<Token> = Vec::new();
                    for (k, run) in raws[i..].iter().enumerate() {
                        if k > 0 {
                            tail.push(Token::other(","));
                        }
                        tail.extend(run.iter().cloned());
                    }
                    params.push(trim_param(&tail));
                } else {
                    params.push(trim_param(&raws[i]));
                }
            }
            return Ok(Some((def, params, nparam)));
        }

        if !skipped_active {
            self.report(
                Severity::Warning,
                format!(
                    "macro `{}' exists, but not taking {} parameters",
                    name, call_count
                ),
            )?;
        }
        Ok(None)
    }

    /// Attempt to treat a line as a multi-line macro call (with optional
    /// leading label). On success the body is queued and `true` returned;
    /// the line produces no direct output.
    pub(crate) fn expand_mmacro(&mut self, tline: &[Token]) -> Result<bool, PreprocError> {
        let first = skip_ws(tline, 0);
        let Some(first_tok) = tline.get(first) else {
            return Ok(false);
        };
        if !first_tok.is_id() && !first_tok.is_ppid() {
            return Ok(false);
        }

        let mut label: Option<usize> = None; // index of the label token
        let mut label_end = first; // tokens [0..label_end) form the label line
        let mut dont_prepend = 0i32;

        let mut matched = self.is_mmacro(&first_tok.text, &tline[first + 1..])?;
        if matched.is_none() {
            // Maybe a label, then a macro call: `lbl:  themacro args`.
            let mut j = skip_ws(tline, first + 1);
            if tline.get(j).map_or(false, |t| t.is(":")) {
                dont_prepend = 1;
                j = skip_ws(tline, j + 1);
            }
            let Some(second) = tline.get(j) else {
                return Ok(false);
            };
            if !second.is_id() {
                return Ok(false);
            }
            matched = self.is_mmacro(&second.text, &tline[j + 1..])?;
            if matched.is_none() {
                return Ok(false);
            }
            label = Some(first);
            label_end = j;
        }
        let Some((def, params, nparam)) = matched else {
            return Ok(false);
        };

        let unique = self.unique;
        self.unique += 1;
        let label_tok = label.map(|i| tline[i].clone());

        // Queue bottom-up: end marker, body lines in reverse, label last so
        // it emerges first.
        let mut queued: Vec<ExpLine> = Vec::with_capacity(def.body.len() + 2);
        queued.push(ExpLine::End);
        for line in def.body.iter().rev() {
            let mut copy: Vec<Token> = Vec::with_capacity(line.len());
            for t in line {
                let b = t.text.as_bytes();
                if t.is_ppid() && b.len() >= 3 && b[1] == b'0' && b[2] == b'0' {
                    // `%00`: the invocation label lands here instead of
                    // being prepended.
                    dont_prepend = -1;
                    if let Some(lbl) = &label_tok {
                        copy.push(lbl.clone());
                    }
                    continue;
                }
                copy.push(t.clone());
            }
            queued.push(ExpLine::Text(copy));
        }
        if label.is_some() && dont_prepend >= 0 {
            let mut label_line: Vec<Token> = tline[..label_end].to_vec();
            while label_line.last().map_or(false, Token::is_ws) {
                label_line.pop();
            }
            if dont_prepend == 0 {
                label_line.push(Token::other(":"));
            }
            queued.push(ExpLine::Text(label_line));
        }

        self.activate_mmacro(&def);
        let frame_entry = ExpFrame::Call(CallFrame {
            def,
            params,
            nparam,
            rotate: 0,
            unique,
            lineno: 0,
        });
        if let Some(frame) = self.istk.last_mut() {
            frame.expansion.extend(queued);
            frame.invocations.push(frame_entry);
        }
        Ok(true)
    }
}

enum ScanItem {
    Tok(Token),
    /// Passing this point ends the expansion of the identified macro.
    End(u64),
}
