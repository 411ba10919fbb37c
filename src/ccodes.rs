//! Condition-code knowledge for `%+n`/`%-n` parameter substitution.
//!
//! Which names are condition codes, and what each one's syntactic inverse
//! is, belongs to the target architecture rather than to the text-rewriting
//! machinery, so the driver consults a [`ConditionCodes`] collaborator. The
//! crate ships the x86 table as the default implementation; `cxz` and
//! `ecxz` are treated as condition codes here even though they are not
//! invertible.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Architecture collaborator: condition-code membership and inversion.
pub trait ConditionCodes {
    /// Is `name` a condition-code keyword? Case-insensitive.
    fn is_condition(&self, name: &str) -> bool;

    /// The syntactic complement of `name` (`z` ⇄ `nz`, …), or `None` when
    /// the code is not invertible.
    fn inverse(&self, name: &str) -> Option<&'static str>;
}

const CONDITIONS: [&str; 32] = [
    "a", "ae", "b", "be", "c", "cxz", "e", "ecxz", "g", "ge", "l", "le", "na", "nae", "nb", "nbe",
    "nc", "ne", "ng", "nge", "nl", "nle", "no", "np", "ns", "nz", "o", "p", "pe", "po", "s", "z",
];

/// Inverse table, indexed in parallel with `CONDITIONS`. `None` marks the
/// non-invertible codes.
const INVERSES: [Option<&str>; 32] = [
    Some("na"),
    Some("nae"),
    Some("nb"),
    Some("nbe"),
    Some("nc"),
    None, // cxz
    Some("ne"),
    None, // ecxz
    Some("ng"),
    Some("nge"),
    Some("nl"),
    Some("nle"),
    Some("a"),
    Some("ae"),
    Some("b"),
    Some("be"),
    Some("c"),
    Some("e"),
    Some("g"),
    Some("ge"),
    Some("l"),
    Some("le"),
    Some("o"),
    Some("p"),
    Some("s"),
    Some("z"),
    Some("no"),
    Some("np"),
    Some("po"),
    Some("pe"),
    Some("ns"),
    Some("nz"),
];

static INDEX: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    CONDITIONS
        .iter()
        .enumerate()
        .map(|(i, name)| (*name, i))
        .collect()
});

/// The x86 condition-code table.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86ConditionCodes;

impl ConditionCodes for X86ConditionCodes {
    fn is_condition(&self, name: &str) -> bool {
        INDEX.contains_key(name.to_ascii_lowercase().as_str())
    }

    fn inverse(&self, name: &str) -> Option<&'static str> {
        let idx = *INDEX.get(name.to_ascii_lowercase().as_str())?;
        INVERSES[idx]
    }
}
