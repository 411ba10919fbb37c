//! The context stack: named scopes pushed by `%push`, popped by `%pop`,
//! renamed in place by `%repl`.
//!
//! A context disambiguates `%$name`-style local identifiers: each one owns
//! a private single-line macro store and a process-unique number that
//! `detoken` splices into emitted local labels, so two contexts never
//! collide even when their surface text is identical. The number of leading
//! `$` signs in a reference selects how many contexts to skip: `%$x` lives
//! in the top context, `%$$x` one below it, and so on.

use crate::macros::SmacroStore;

#[derive(Debug)]
pub struct Context {
    pub name: String,
    /// Unique id rendered into resolved local labels (`..@N.x`).
    pub number: u64,
    /// Context-local single-line macros; destroyed with the context.
    pub locals: SmacroStore,
}

/// Why a `%$` reference could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxError {
    /// No context has been pushed at all.
    Empty,
    /// The reference skips more contexts than exist; carries the stack
    /// depth that was available.
    TooShallow(usize),
}

#[derive(Debug, Default)]
pub struct ContextStack {
    stack: Vec<Context>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, number: u64) {
        self.stack.push(Context {
            name,
            number,
            locals: SmacroStore::new(),
        });
    }

    pub fn pop(&mut self) -> Option<Context> {
        self.stack.pop()
    }

    /// Rename the top context without disturbing its locals or number.
    pub fn repl(&mut self, name: String) -> bool {
        match self.stack.last_mut() {
            Some(top) => {
                top.name = name;
                true
            }
            None => false,
        }
    }

    pub fn top(&self) -> Option<&Context> {
        self.stack.last()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    /// Context at `idx` steps below the top (0 = top).
    pub fn at(&self, idx: usize) -> Option<&Context> {
        let len = self.stack.len();
        if idx < len {
            self.stack.get(len - 1 - idx)
        } else {
            None
        }
    }

    pub fn at_mut(&mut self, idx: usize) -> Option<&mut Context> {
        let len = self.stack.len();
        if idx < len {
            self.stack.get_mut(len - 1 - idx)
        } else {
            None
        }
    }

    /// Number of leading `$` signs after `%` in a local name, or `None` if
    /// the token is not a `%$` form at all.
    pub fn local_depth(name: &str) -> Option<usize> {
        let rest = name.strip_prefix("%$")?;
        Some(1 + rest.bytes().take_while(|&c| c == b'$').count())
    }

    /// Resolve a `%$` reference to a context index (from the top).
    ///
    /// Returns `Ok(None)` for names that are not `%$` forms. With
    /// `all_contexts`, the search continues outward from the addressed
    /// context until one actually *owns* a macro of that name — the mode
    /// the single-line rewriter uses — and resolves to `None` when no
    /// context does.
    pub fn find(&self, name: &str, all_contexts: bool) -> Result<Option<usize>, CtxError> {
        let Some(depth) = Self::local_depth(name) else {
            return Ok(None);
        };
        if self.stack.is_empty() {
            return Err(CtxError::Empty);
        }
        let idx = depth - 1;
        if idx >= self.stack.len() {
            return Err(CtxError::TooShallow(self.stack.len()));
        }
        if !all_contexts {
            return Ok(Some(idx));
        }
        for i in idx..self.stack.len() {
            if self
                .at(i)
                .map_or(false, |ctx| ctx.locals.contains_name(name))
            {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::SMacro;

    fn local(id: u64, name: &str) -> SMacro {
        SMacro {
            id,
            name: name.into(),
            casesense: true,
            nparam: 0,
            expansion: vec![],
        }
    }

    #[test]
    fn local_depth_counts_dollars() {
        assert_eq!(ContextStack::local_depth("%$x"), Some(1));
        assert_eq!(ContextStack::local_depth("%$$x"), Some(2));
        assert_eq!(ContextStack::local_depth("%$$$x"), Some(3));
        assert_eq!(ContextStack::local_depth("%x"), None);
        assert_eq!(ContextStack::local_depth("plain"), None);
    }

    #[test]
    fn find_addresses_by_depth() {
        let mut stack = ContextStack::new();
        stack.push("outer".into(), 1);
        stack.push("inner".into(), 2);
        assert_eq!(stack.find("%$x", false), Ok(Some(0)));
        assert_eq!(stack.find("%$$x", false), Ok(Some(1)));
        assert_eq!(stack.find("%$$$x", false), Err(CtxError::TooShallow(2)));
    }

    #[test]
    fn find_on_empty_stack_is_an_error() {
        let stack = ContextStack::new();
        assert_eq!(stack.find("%$x", false), Err(CtxError::Empty));
        assert_eq!(stack.find("notlocal", false), Ok(None));
    }

    #[test]
    fn all_contexts_search_finds_the_owner() {
        let mut stack = ContextStack::new();
        stack.push("outer".into(), 1);
        stack
            .at_mut(0)
            .expect("outer")
            .locals
            .define(local(1, "%$v"), true);
        stack.push("inner".into(), 2);
        // Addressed at the top context, owned one below.
        assert_eq!(stack.find("%$v", true), Ok(Some(1)));
        assert_eq!(stack.find("%$w", true), Ok(None));
    }

    #[test]
    fn repl_keeps_number_and_locals() {
        let mut stack = ContextStack::new();
        stack.push("old".into(), 7);
        assert!(stack.repl("new".into()));
        let top = stack.top().expect("top");
        assert_eq!(top.name, "new");
        assert_eq!(top.number, 7);
    }
}
