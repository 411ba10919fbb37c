//! Multi-line macro definitions, their store, and call-argument splitting.
//!
//! A name maps to a *family* of definitions distinguished by arity range;
//! invocation picks the first definition whose `[min, max]` range (or
//! unbounded `+` form) accepts the actual argument count. Definitions are
//! immutable once `%endmacro` closes them; all per-invocation state lives
//! in `frames::CallFrame`.

use std::collections::HashMap;
use std::rc::Rc;

use crate::token::{skip_ws, Token};

/// A closed multi-line macro definition.
#[derive(Debug)]
pub struct MMacroDef {
    /// Identity used to refuse self-recursive invocation.
    pub id: u64,
    pub name: String,
    pub casesense: bool,
    pub nparam_min: usize,
    /// `usize::MAX` encodes the `-*` unbounded spelling.
    pub nparam_max: usize,
    /// Greedy trailing parameter (`+` spelling): the last parameter swallows
    /// the rest of the call line, commas included.
    pub plus: bool,
    /// Suppress listing of the expansion (`.nolist`).
    pub nolist: bool,
    /// Default parameter token runs, raw as written (braces kept); entry 0
    /// backfills call parameter `min+1`.
    pub defaults: Vec<Vec<Token>>,
    /// Body lines in source order.
    pub body: Vec<Vec<Token>>,
}

impl MMacroDef {
    pub fn matches_name(&self, name: &str) -> bool {
        if self.casesense {
            self.name == name
        } else {
            self.name.eq_ignore_ascii_case(name)
        }
    }

    /// Does this definition accept `nparam` actual arguments?
    pub fn accepts(&self, nparam: usize) -> bool {
        self.nparam_min <= nparam && (self.plus || nparam <= self.nparam_max)
    }

    /// Arity-range overlap test used by redefinition warnings and
    /// `%ifmacro`.
    pub fn overlaps(&self, min: usize, max: usize, plus: bool) -> bool {
        (self.nparam_min <= max || plus) && (min <= self.nparam_max || self.plus)
    }
}

/// Name → definition-family store. Newest definitions are consulted first.
#[derive(Debug, Default)]
pub struct MmacroStore {
    families: HashMap<String, Vec<Rc<MMacroDef>>>,
}

fn bucket_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl MmacroStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: MMacroDef) {
        self.families
            .entry(bucket_key(&def.name))
            .or_default()
            .insert(0, Rc::new(def));
    }

    /// All definitions whose name matches `name`, newest first.
    pub fn matches<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Rc<MMacroDef>> {
        self.families
            .get(&bucket_key(name))
            .into_iter()
            .flatten()
            .filter(move |def| def.matches_name(name))
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.matches(name).next().is_some()
    }

    /// A definition whose name is exactly `name` (case-sensitive, the way
    /// redefinition warnings and `%ifmacro` compare) and whose arity range
    /// overlaps `[min, max]`/`plus`.
    pub fn overlapping(&self, name: &str, min: usize, max: usize, plus: bool) -> Option<&Rc<MMacroDef>> {
        self.families
            .get(&bucket_key(name))?
            .iter()
            .find(|def| def.name == name && def.overlaps(min, max, plus))
    }

    pub fn clear(&mut self) {
        self.families.clear();
    }
}

// ============================================================================
// CALL-ARGUMENT SPLITTING
// ============================================================================

/// Raw parameter runs split out of a call (or default-parameter) token list.
#[derive(Debug, Default)]
pub struct SplitParams {
    /// One raw run per parameter: leading whitespace skipped, top-level
    /// commas removed, braces kept.
    pub params: Vec<Vec<Token>>,
    /// A brace group closed before its parameter did.
    pub brace_error: bool,
}

/// Split a multi-line macro argument region on top-level commas.
///
/// Arguments are not parenthesized — they run to end of line. A parameter
/// that *starts* with `{` extends to the matching `}` and may contain
/// commas.
pub fn split_params(tokens: &[Token]) -> SplitParams {
    let mut out = SplitParams::default();
    let mut i = 0;
    while i < tokens.len() {
        i = skip_ws(tokens, i);
        if i >= tokens.len() {
            // A whitespace-only region still counts as one (empty)
            // parameter; a comma at end of line does not.
            out.params.push(Vec::new());
            break;
        }
        let brace = tokens[i].is("{");
        let start = i;
        if brace {
            while i < tokens.len() && !tokens[i].is("}") {
                i += 1;
            }
            if i < tokens.len() {
                i += 1; // include the closing brace
            }
            out.params.push(tokens[start..i].to_vec());
            // Only whitespace may separate the brace from the comma.
            i = skip_ws(tokens, i);
            if i < tokens.len() && !tokens[i].is(",") {
                out.brace_error = true;
                while i < tokens.len() && !tokens[i].is(",") {
                    i += 1;
                }
            }
        } else {
            while i < tokens.len() && !tokens[i].is(",") {
                i += 1;
            }
            out.params.push(tokens[start..i].to_vec());
        }
        if i < tokens.len() {
            i += 1; // eat the comma; the loop emits the parameter after it
        }
    }
    out
}

/// Trim a raw parameter run into its bound form: outer whitespace stripped,
/// a surrounding `{…}` group unwrapped.
pub fn trim_param(raw: &[Token]) -> Vec<Token> {
    let mut lo = skip_ws(raw, 0);
    let mut hi = raw.len();
    if lo < hi && raw[lo].is("{") {
        lo += 1;
        let mut end = lo;
        while end < hi && !raw[end].is("}") {
            end += 1;
        }
        hi = end;
    } else {
        while hi > lo && raw[hi - 1].is_ws() {
            hi -= 1;
        }
    }
    raw[lo..hi].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn split_texts(line: &str) -> Vec<String> {
        split_params(&tokenize(line).tokens)
            .params
            .iter()
            .map(|p| {
                trim_param(p)
                    .iter()
                    .map(|t| t.text.clone())
                    .collect::<String>()
            })
            .collect()
    }

    #[test]
    fn splits_on_top_level_commas() {
        assert_eq!(split_texts("a, b, c"), ["a", "b", "c"]);
        assert_eq!(split_texts("ax"), ["ax"]);
    }

    #[test]
    fn empty_argument_region_has_no_params() {
        assert!(split_params(&[]).params.is_empty());
    }

    #[test]
    fn interior_empty_params_are_kept_trailing_comma_is_not() {
        assert_eq!(split_texts("a,"), ["a"]);
        assert_eq!(split_texts("a,,b"), ["a", "", "b"]);
    }

    #[test]
    fn braces_protect_commas() {
        let parts = split_texts("{eax, ebx}, ecx");
        assert_eq!(parts, ["eax,ebx", "ecx"]);
    }

    #[test]
    fn brace_junk_is_flagged() {
        let out = split_params(&tokenize("{a} junk, b").tokens);
        assert!(out.brace_error);
        assert_eq!(out.params.len(), 2);
    }

    #[test]
    fn arity_acceptance() {
        let def = MMacroDef {
            id: 1,
            name: "m".into(),
            casesense: true,
            nparam_min: 1,
            nparam_max: 3,
            plus: false,
            nolist: false,
            defaults: vec![],
            body: vec![],
        };
        assert!(!def.accepts(0));
        assert!(def.accepts(1));
        assert!(def.accepts(3));
        assert!(!def.accepts(4));
    }

    #[test]
    fn plus_form_accepts_excess() {
        let def = MMacroDef {
            id: 1,
            name: "m".into(),
            casesense: true,
            nparam_min: 2,
            nparam_max: 2,
            plus: true,
            nolist: false,
            defaults: vec![],
            body: vec![],
        };
        assert!(def.accepts(2));
        assert!(def.accepts(7));
        assert!(!def.accepts(1));
    }

    #[test]
    fn store_family_walk_is_newest_first() {
        let mut store = MmacroStore::new();
        for (id, min) in [(1u64, 1usize), (2, 2)] {
            store.insert(MMacroDef {
                id,
                name: "m".into(),
                casesense: true,
                nparam_min: min,
                nparam_max: min,
                plus: false,
                nolist: false,
                defaults: vec![],
                body: vec![],
            });
        }
        let ids: Vec<u64> = store.matches("m").map(|d| d.id).collect();
        assert_eq!(ids, [2, 1]);
        assert!(store.overlapping("m", 2, 2, false).is_some());
        assert!(store.overlapping("m", 3, 3, false).is_none());
    }

    #[test]
    fn case_insensitive_family_matching() {
        let mut store = MmacroStore::new();
        store.insert(MMacroDef {
            id: 1,
            name: "Mac".into(),
            casesense: false,
            nparam_min: 0,
            nparam_max: 0,
            plus: false,
            nolist: false,
            defaults: vec![],
            body: vec![],
        });
        assert!(store.has_name("MAC"));
        assert!(store.has_name("mac"));
    }
}
