//! Directive names and their classification.
//!
//! Directive recognition is case-insensitive and happens on the first
//! non-whitespace token of a line, which must be a preprocessor-id that is
//! not a `%%`/`%$`/`%!` form. A recognized directive line is consumed by
//! the dispatcher and never forwarded downstream.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Predicate family of an `%if`/`%elif` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfKind {
    /// Plain `%if`: evaluate an expression in critical mode.
    Expr,
    /// `%ifctx`: compare the top context name.
    Ctx,
    /// `%ifdef`: single-line macro table membership.
    Def,
    /// `%ifid`: first token is an identifier (after expansion).
    Id,
    /// `%ifidn`/`%ifidni`: token-stream structural equality.
    Idn { icase: bool },
    /// `%ifmacro`: arity-aware multi-line macro existence.
    MacroExists,
    /// `%ifnum`: first token is a number.
    Num,
    /// `%ifstr`: first token is a string.
    Str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Arg,
    Assign { icase: bool },
    Clear,
    /// `%define` family; `expand` marks the `x` forms that pre-expand
    /// their replacement text.
    Define { icase: bool, expand: bool },
    Elif { kind: IfKind, negate: bool },
    Else,
    EndIf,
    EndMacro,
    EndRep,
    EndScope,
    Error,
    ExitRep,
    If { kind: IfKind, negate: bool },
    Include,
    Line,
    Local,
    Macro { icase: bool },
    Pop,
    Push,
    Rep,
    Repl,
    Rotate,
    Scope,
    Stacksize,
    Strlen,
    Substr,
    Undef,
}

impl Directive {
    /// Conditional-tracking directives are processed even on suppressed
    /// lines, so nested `%if`/`%endif` bookkeeping never desynchronizes.
    pub fn is_condition(self) -> bool {
        matches!(
            self,
            Directive::If { .. } | Directive::Elif { .. } | Directive::Else | Directive::EndIf
        )
    }
}

const IF_KINDS: [(&str, IfKind); 9] = [
    ("", IfKind::Expr),
    ("ctx", IfKind::Ctx),
    ("def", IfKind::Def),
    ("id", IfKind::Id),
    ("idn", IfKind::Idn { icase: false }),
    ("idni", IfKind::Idn { icase: true }),
    ("macro", IfKind::MacroExists),
    ("num", IfKind::Num),
    ("str", IfKind::Str),
];

static TABLE: Lazy<HashMap<String, Directive>> = Lazy::new(|| {
    let mut table = HashMap::new();
    let mut put = |name: &str, d: Directive| {
        table.insert(name.to_string(), d);
    };

    put("%arg", Directive::Arg);
    put("%assign", Directive::Assign { icase: false });
    put("%iassign", Directive::Assign { icase: true });
    put("%clear", Directive::Clear);
    put("%define", Directive::Define { icase: false, expand: false });
    put("%idefine", Directive::Define { icase: true, expand: false });
    put("%xdefine", Directive::Define { icase: false, expand: true });
    put("%ixdefine", Directive::Define { icase: true, expand: true });
    put("%else", Directive::Else);
    put("%endif", Directive::EndIf);
    put("%endm", Directive::EndMacro);
    put("%endmacro", Directive::EndMacro);
    put("%endrep", Directive::EndRep);
    put("%endscope", Directive::EndScope);
    put("%error", Directive::Error);
    put("%exitrep", Directive::ExitRep);
    put("%macro", Directive::Macro { icase: false });
    put("%imacro", Directive::Macro { icase: true });
    put("%include", Directive::Include);
    put("%line", Directive::Line);
    put("%local", Directive::Local);
    put("%pop", Directive::Pop);
    put("%push", Directive::Push);
    put("%rep", Directive::Rep);
    put("%repl", Directive::Repl);
    put("%rotate", Directive::Rotate);
    put("%scope", Directive::Scope);
    put("%stacksize", Directive::Stacksize);
    put("%strlen", Directive::Strlen);
    put("%substr", Directive::Substr);
    put("%undef", Directive::Undef);

    for (suffix, kind) in IF_KINDS {
        put(&format!("%if{}", suffix), Directive::If { kind, negate: false });
        put(&format!("%elif{}", suffix), Directive::Elif { kind, negate: false });
        // The negated spellings: %ifnctx … %ifnstr. Plain %if has none.
        if !suffix.is_empty() {
            put(&format!("%ifn{}", suffix), Directive::If { kind, negate: true });
            put(&format!("%elifn{}", suffix), Directive::Elif { kind, negate: true });
        }
    }

    table
});

/// Look a directive up by its full spelling, `%` included.
pub fn lookup(name: &str) -> Option<Directive> {
    TABLE.get(&name.to_ascii_lowercase()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_core_directives() {
        assert_eq!(lookup("%define"), Some(Directive::Define { icase: false, expand: false }));
        assert_eq!(lookup("%IXDEFINE"), Some(Directive::Define { icase: true, expand: true }));
        assert_eq!(lookup("%endm"), Some(Directive::EndMacro));
        assert_eq!(lookup("%endmacro"), Some(Directive::EndMacro));
        assert_eq!(lookup("%nonsense"), None);
    }

    #[test]
    fn conditional_family_is_complete() {
        for base in ["ctx", "def", "id", "idn", "idni", "macro", "num", "str"] {
            for prefix in ["%if", "%ifn", "%elif", "%elifn"] {
                let name = format!("{prefix}{base}");
                let d = lookup(&name).unwrap_or_else(|| panic!("missing {name}"));
                assert!(d.is_condition(), "{name}");
            }
        }
        assert_eq!(lookup("%if"), Some(Directive::If { kind: IfKind::Expr, negate: false }));
        assert_eq!(lookup("%ifn"), None);
        assert_eq!(lookup("%elifn"), None);
    }

    #[test]
    fn condition_classification() {
        assert!(lookup("%endif").map_or(false, Directive::is_condition));
        assert!(lookup("%else").map_or(false, Directive::is_condition));
        assert!(!lookup("%rep").map_or(false, Directive::is_condition));
    }
}
