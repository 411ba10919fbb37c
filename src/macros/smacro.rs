//! Single-line macro definitions and their scoped store.
//!
//! Several definitions may share a name as long as they differ in arity;
//! resolution first asks whether *any* definition of the name is visible,
//! then whether one with the call's exact arity exists. The two answers are
//! handled differently by callers: "not a macro" falls through silently,
//! "macro exists but wrong arity" is a warning with the call left alone.
//!
//! Visibility is a stack of scopes: `%scope` pushes one, `%endscope`
//! destroys everything defined since. Lookups walk the stack outward and
//! stop at the innermost scope that knows the name at all, so an inner
//! definition shadows every outer one regardless of arity.

use std::collections::HashMap;

use crate::token::Token;

/// One single-line macro definition.
#[derive(Debug, Clone)]
pub struct SMacro {
    /// Identity used by the expansion cycle guard; unique per definition.
    pub id: u64,
    pub name: String,
    pub casesense: bool,
    /// 0 = niladic.
    pub nparam: usize,
    /// Stored expansion; formal parameters appear as `SmacParam` tokens.
    pub expansion: Vec<Token>,
}

impl SMacro {
    fn matches_name(&self, name: &str, use_macro_case: bool) -> bool {
        if self.casesense && use_macro_case {
            self.name == name
        } else {
            self.name.eq_ignore_ascii_case(name)
        }
    }
}

/// Result of a definedness query.
#[derive(Debug, Default, Clone)]
pub struct Lookup {
    /// Some definition of the name is visible (at any compatible arity).
    pub any: bool,
    /// The definition with exactly the queried arity, if one exists in the
    /// innermost scope that knows the name.
    pub exact: Option<SMacro>,
}

/// Buckets are keyed case-insensitively; entries decide case sensitivity
/// for themselves.
fn bucket_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// A stack of name → definitions scopes.
#[derive(Debug, Default)]
pub struct SmacroStore {
    scopes: Vec<HashMap<String, Vec<SMacro>>>,
}

impl SmacroStore {
    pub fn new() -> Self {
        SmacroStore {
            scopes: vec![HashMap::new()],
        }
    }

    /// Open a new innermost scope (`%scope`).
    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Destroy the innermost scope (`%endscope`). Refuses to pop the last
    /// one; the caller reports that as an unbalanced `%endscope`.
    pub fn pop_scope(&mut self) -> bool {
        if self.scopes.len() <= 1 {
            return false;
        }
        self.scopes.pop();
        true
    }

    /// Define `mac` in the innermost scope, replacing a same-name,
    /// same-arity definition there if present.
    pub fn define(&mut self, mac: SMacro, use_macro_case: bool) {
        let Some(scope) = self.scopes.last_mut() else {
            return;
        };
        let bucket = scope.entry(bucket_key(&mac.name)).or_default();
        if let Some(slot) = bucket
            .iter_mut()
            .find(|m| m.nparam == mac.nparam && m.matches_name(&mac.name, use_macro_case))
        {
            *slot = mac;
        } else {
            bucket.insert(0, mac);
        }
    }

    /// Remove every visible definition of `name`, in all scopes.
    pub fn undef(&mut self, name: &str) {
        let key = bucket_key(name);
        for scope in &mut self.scopes {
            if let Some(bucket) = scope.get_mut(&key) {
                bucket.retain(|m| !m.matches_name(name, true));
                if bucket.is_empty() {
                    scope.remove(&key);
                }
            }
        }
    }

    /// The definedness query behind `%define` redefinition checks,
    /// `%undef` and `%ifdef`.
    ///
    /// `arity` 0 asks for "any form"; a definition with zero parameters is
    /// considered compatible with every call arity (it could be picked up
    /// by niladic fallback). When `use_macro_case` is false the name match
    /// ignores case even for case-sensitive definitions; that is how the
    /// case-insensitive defining directives detect collisions.
    pub fn defined(&self, name: &str, arity: usize, use_macro_case: bool) -> Lookup {
        let key = bucket_key(name);
        for scope in self.scopes.iter().rev() {
            let Some(bucket) = scope.get(&key) else {
                continue;
            };
            let candidates: Vec<&SMacro> = bucket
                .iter()
                .filter(|m| {
                    m.matches_name(name, use_macro_case)
                        && (arity == 0 || m.nparam == 0 || m.nparam == arity)
                })
                .collect();
            if candidates.is_empty() {
                continue;
            }
            let exact = candidates
                .iter()
                .find(|m| m.nparam == arity)
                .map(|m| (*m).clone());
            return Lookup { any: true, exact };
        }
        Lookup::default()
    }

    /// First visible definition of `name`, shadowing order. Decides whether
    /// a reference takes the niladic or the parametric expansion path.
    pub fn first_match(&self, name: &str) -> Option<&SMacro> {
        let key = bucket_key(name);
        for scope in self.scopes.iter().rev() {
            if let Some(m) = scope
                .get(&key)
                .and_then(|b| b.iter().find(|m| m.matches_name(name, true)))
            {
                return Some(m);
            }
        }
        None
    }

    /// The overload of `name` with exactly `nparam` parameters, searching
    /// every scope outward.
    pub fn exact(&self, name: &str, nparam: usize) -> Option<&SMacro> {
        let key = bucket_key(name);
        for scope in self.scopes.iter().rev() {
            if let Some(m) = scope.get(&key).and_then(|b| {
                b.iter()
                    .find(|m| m.nparam == nparam && m.matches_name(name, true))
            }) {
                return Some(m);
            }
        }
        None
    }

    /// Does any scope hold a definition of `name`? Used when hunting for
    /// the context that owns a `%$`-local macro.
    pub fn contains_name(&self, name: &str) -> bool {
        let key = bucket_key(name);
        self.scopes.iter().any(|scope| {
            scope
                .get(&key)
                .map_or(false, |b| b.iter().any(|m| m.matches_name(name, true)))
        })
    }

    /// Drop everything, leaving a single empty scope.
    pub fn clear(&mut self) {
        self.scopes.clear();
        self.scopes.push(HashMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(id: u64, name: &str, casesense: bool, nparam: usize) -> SMacro {
        SMacro {
            id,
            name: name.into(),
            casesense,
            nparam,
            expansion: vec![Token::id("x")],
        }
    }

    #[test]
    fn define_and_first_match() {
        let mut store = SmacroStore::new();
        store.define(mac(1, "FOO", true, 0), true);
        assert!(store.first_match("FOO").is_some());
        assert!(store.first_match("foo").is_none());
    }

    #[test]
    fn case_insensitive_definitions_match_any_spelling() {
        let mut store = SmacroStore::new();
        store.define(mac(1, "foo", false, 0), true);
        assert!(store.first_match("FOO").is_some());
        assert!(store.first_match("Foo").is_some());
    }

    #[test]
    fn arity_overloads_coexist() {
        let mut store = SmacroStore::new();
        store.define(mac(1, "F", true, 1), true);
        store.define(mac(2, "F", true, 2), true);
        assert_eq!(store.exact("F", 1).map(|m| m.id), Some(1));
        assert_eq!(store.exact("F", 2).map(|m| m.id), Some(2));
        assert!(store.exact("F", 3).is_none());
        let l = store.defined("F", 3, true);
        assert!(!l.any, "wrong arity with no niladic form is not defined");
    }

    #[test]
    fn niladic_is_compatible_with_any_arity_query() {
        let mut store = SmacroStore::new();
        store.define(mac(1, "N", true, 0), true);
        let l = store.defined("N", 4, true);
        assert!(l.any);
        assert!(l.exact.is_none());
    }

    #[test]
    fn redefinition_replaces_in_place() {
        let mut store = SmacroStore::new();
        store.define(mac(1, "X", true, 0), true);
        store.define(mac(2, "X", true, 0), true);
        assert_eq!(store.first_match("X").map(|m| m.id), Some(2));
    }

    #[test]
    fn scopes_shadow_and_unwind() {
        let mut store = SmacroStore::new();
        store.define(mac(1, "V", true, 0), true);
        store.push_scope();
        store.define(mac(2, "V", true, 0), true);
        assert_eq!(store.first_match("V").map(|m| m.id), Some(2));
        assert!(store.pop_scope());
        assert_eq!(store.first_match("V").map(|m| m.id), Some(1));
        assert!(!store.pop_scope(), "outermost scope must survive");
    }

    #[test]
    fn undef_removes_all_arities() {
        let mut store = SmacroStore::new();
        store.define(mac(1, "G", true, 0), true);
        store.define(mac(2, "G", true, 2), true);
        store.undef("G");
        assert!(store.first_match("G").is_none());
    }
}
