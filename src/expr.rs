//! The preprocessor's expression evaluator.
//!
//! A small recursive-descent parser over a token slice, one method per
//! precedence level. `%if`/`%elif` evaluate in *critical* mode, which
//! unlocks the relational and boolean levels and turns an unresolvable
//! symbol into a hard evaluation error — the preprocessor performs no
//! forward-reference tracking, so a value must exist *now* or not at all.
//! Everything else (`%assign`, `%rep`, `%rotate`, `%substr`) evaluates in
//! plain arithmetic mode, where the expression simply ends at the first
//! boolean operator.
//!
//! Conventions carried from the assembler's evaluator: relational
//! operators yield `-1`/`0`, boolean operators `1`/`0`, `/` and `%` are
//! unsigned while `//` and `%%` are signed, and all arithmetic wraps at 64
//! bits.

use std::fmt;

use crate::token::{read_num, read_str_num, skip_ws, Token, TokenKind};

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Symbol-table collaborator consulted for bound names and the positional
/// pseudo-symbols.
pub trait SymbolResolver {
    fn lookup(&self, name: &str) -> Option<i64>;

    /// Value of the `$` pseudo-symbol ("here").
    fn here(&self) -> Option<i64> {
        None
    }

    /// Value of the `$$` pseudo-symbol (start of the current section).
    fn section_base(&self) -> Option<i64> {
        None
    }

    /// Value of `seg name`.
    fn segment_of(&self, _name: &str) -> Option<i64> {
        None
    }
}

/// A resolver that knows nothing. The preprocessor's default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn lookup(&self, _name: &str) -> Option<i64> {
        None
    }
}

// ============================================================================
// RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    /// The expression is syntactically fine but has no preprocess-time
    /// value (unresolved symbol, `$`/`$$` without a resolver, …).
    NonConstant(String),
    /// Malformed expression.
    Syntax(String),
    DivideByZero,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::NonConstant(msg) | ExprError::Syntax(msg) => write!(f, "{}", msg),
            ExprError::DivideByZero => write!(f, "division by zero"),
        }
    }
}

#[derive(Debug)]
pub struct EvalOutcome {
    pub value: i64,
    /// Index of the first token not consumed by the expression; anything
    /// non-whitespace beyond it is the caller's "trailing garbage".
    pub consumed: usize,
    /// Soft complaints (over-long character constants).
    pub warnings: Vec<String>,
}

/// Evaluate a token slice to a 64-bit value.
pub fn evaluate(
    tokens: &[Token],
    resolver: &dyn SymbolResolver,
    critical: bool,
) -> Result<EvalOutcome, ExprError> {
    let mut parser = Parser {
        toks: tokens,
        pos: 0,
        resolver,
        critical,
        warnings: Vec::new(),
    };
    let value = parser.top_level()?;
    Ok(EvalOutcome {
        value,
        consumed: parser.pos,
        warnings: parser.warnings,
    })
}

// ============================================================================
// PARSER
// ============================================================================

struct Parser<'a> {
    toks: &'a [Token],
    pos: usize,
    resolver: &'a dyn SymbolResolver,
    critical: bool,
    warnings: Vec<String>,
}

impl<'a> Parser<'a> {
    fn peek(&mut self) -> Option<&'a Token> {
        self.pos = skip_ws(self.toks, self.pos);
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let tok = self.peek()?;
        self.pos += 1;
        Some(tok)
    }

    /// Consume an `Other` token with exactly this text.
    fn eat(&mut self, text: &str) -> bool {
        if self.peek().map_or(false, |t| t.is(text)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn top_level(&mut self) -> Result<i64, ExprError> {
        if self.critical {
            self.bool_or()
        } else {
            self.bit_or()
        }
    }

    // --- boolean and relational levels (critical mode only) ---

    fn bool_or(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.bool_xor()?;
        while self.eat("||") {
            let rhs = self.bool_xor()?;
            lhs = ((lhs != 0) || (rhs != 0)) as i64;
        }
        Ok(lhs)
    }

    fn bool_xor(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.bool_and()?;
        while self.eat("^^") {
            let rhs = self.bool_and()?;
            lhs = ((lhs != 0) ^ (rhs != 0)) as i64;
        }
        Ok(lhs)
    }

    fn bool_and(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.relational()?;
        while self.eat("&&") {
            let rhs = self.relational()?;
            lhs = ((lhs != 0) && (rhs != 0)) as i64;
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.bit_or()?;
        loop {
            let op = match self.peek() {
                Some(t)
                    if t.kind == TokenKind::Other
                        && matches!(
                            t.text.as_str(),
                            "=" | "==" | "!=" | "<>" | "<" | "<=" | ">" | ">="
                        ) =>
                {
                    t.text.as_str()
                }
                _ => break,
            };
            self.pos += 1;
            let rhs = self.bit_or()?;
            let truth = match op {
                "=" | "==" => lhs == rhs,
                "!=" | "<>" => lhs != rhs,
                "<" => lhs < rhs,
                "<=" => lhs <= rhs,
                ">" => lhs > rhs,
                ">=" => lhs >= rhs,
                _ => unreachable!("relational operator set"),
            };
            lhs = if truth { -1 } else { 0 };
        }
        Ok(lhs)
    }

    // --- arithmetic levels ---

    fn bit_or(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.bit_xor()?;
        while self.eat("|") {
            lhs |= self.bit_xor()?;
        }
        Ok(lhs)
    }

    fn bit_xor(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.bit_and()?;
        while self.eat("^") {
            lhs ^= self.bit_and()?;
        }
        Ok(lhs)
    }

    fn bit_and(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.shift()?;
        while self.eat("&") {
            lhs &= self.shift()?;
        }
        Ok(lhs)
    }

    fn shift(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.add_sub()?;
        loop {
            if self.eat("<<") {
                let rhs = self.add_sub()?;
                lhs = shift_left(lhs, rhs);
            } else if self.eat(">>") {
                let rhs = self.add_sub()?;
                lhs = shift_right(lhs, rhs);
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn add_sub(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.mul_div()?;
        loop {
            if self.eat("+") {
                lhs = lhs.wrapping_add(self.mul_div()?);
            } else if self.eat("-") {
                lhs = lhs.wrapping_sub(self.mul_div()?);
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn mul_div(&mut self) -> Result<i64, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            if self.eat("*") {
                lhs = lhs.wrapping_mul(self.unary()?);
            } else if self.eat("/") {
                let rhs = self.unary()?;
                if rhs == 0 {
                    return Err(ExprError::DivideByZero);
                }
                lhs = ((lhs as u64) / (rhs as u64)) as i64;
            } else if self.eat("%") {
                let rhs = self.unary()?;
                if rhs == 0 {
                    return Err(ExprError::DivideByZero);
                }
                lhs = ((lhs as u64) % (rhs as u64)) as i64;
            } else if self.eat("//") {
                let rhs = self.unary()?;
                if rhs == 0 {
                    return Err(ExprError::DivideByZero);
                }
                lhs = lhs.wrapping_div(rhs);
            } else if self.eat("%%") {
                let rhs = self.unary()?;
                if rhs == 0 {
                    return Err(ExprError::DivideByZero);
                }
                lhs = lhs.wrapping_rem(rhs);
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<i64, ExprError> {
        if self.eat("-") {
            return Ok(self.unary()?.wrapping_neg());
        }
        if self.eat("+") {
            return self.unary();
        }
        if self.eat("~") {
            return Ok(!self.unary()?);
        }
        if self.eat("!") {
            return Ok((self.unary()? == 0) as i64);
        }
        if self
            .peek()
            .map_or(false, |t| t.is_id() && t.text.eq_ignore_ascii_case("seg"))
        {
            self.pos += 1;
            let Some(operand) = self.peek() else {
                return Err(ExprError::Syntax("`seg' expects a symbol".into()));
            };
            if !operand.is_id() {
                return Err(ExprError::Syntax("`seg' expects a symbol".into()));
            }
            let name = operand.text.clone();
            self.pos += 1;
            return self.resolver.segment_of(&name).ok_or_else(|| {
                ExprError::NonConstant(format!("unable to resolve segment of `{}'", name))
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<i64, ExprError> {
        let Some(tok) = self.bump() else {
            return Err(ExprError::Syntax("expression syntax error".into()));
        };

        // Positional pseudo-symbols are recognized by spelling, before kind.
        if tok.text == "$" {
            return self
                .resolver
                .here()
                .ok_or_else(|| ExprError::NonConstant("`$' is not constant here".into()));
        }
        if tok.text == "$$" {
            return self
                .resolver
                .section_base()
                .ok_or_else(|| ExprError::NonConstant("`$$' is not constant here".into()));
        }

        match tok.kind {
            TokenKind::Other if tok.text == "(" => {
                let value = self.top_level()?;
                if !self.eat(")") {
                    return Err(ExprError::Syntax("expecting `)'".into()));
                }
                Ok(value)
            }
            TokenKind::Number => read_num(&tok.text)
                .ok_or_else(|| ExprError::Syntax(format!("invalid numeric constant `{}'", tok.text))),
            TokenKind::Str => {
                let inner = &tok.text[1..tok.text.len().saturating_sub(1)];
                let (value, overflow) = read_str_num(inner);
                if overflow {
                    self.warnings.push("character constant too long".into());
                }
                Ok(value)
            }
            TokenKind::Id => {
                // A `$`-prefixed identifier is an escaped plain symbol.
                let name = tok.text.strip_prefix('$').unwrap_or(&tok.text);
                match self.resolver.lookup(name) {
                    Some(value) => Ok(value),
                    None if self.critical => {
                        Err(ExprError::Syntax(format!("symbol `{}' undefined", name)))
                    }
                    None => Err(ExprError::NonConstant(format!(
                        "`{}' is not a constant",
                        name
                    ))),
                }
            }
            _ => Err(ExprError::Syntax("expression syntax error".into())),
        }
    }
}

fn shift_left(lhs: i64, rhs: i64) -> i64 {
    if (0..64).contains(&rhs) {
        ((lhs as u64) << rhs) as i64
    } else {
        0
    }
}

fn shift_right(lhs: i64, rhs: i64) -> i64 {
    if (0..64).contains(&rhs) {
        ((lhs as u64) >> rhs) as i64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn eval(src: &str, critical: bool) -> Result<i64, ExprError> {
        evaluate(&tokenize(src).tokens, &NoSymbols, critical).map(|o| o.value)
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval("1+2*3", false), Ok(7));
        assert_eq!(eval("(1+2)*3", false), Ok(9));
        assert_eq!(eval("10-4-3", false), Ok(3));
        assert_eq!(eval("2*3+4*5", false), Ok(26));
    }

    #[test]
    fn division_flavors() {
        assert_eq!(eval("7/2", false), Ok(3));
        assert_eq!(eval("7%3", false), Ok(1));
        assert_eq!(eval("-7//2", false), Ok(-3));
        assert_eq!(eval("-7%%2", false), Ok(-1));
        assert_eq!(eval("1/0", false), Err(ExprError::DivideByZero));
    }

    #[test]
    fn unsigned_division_treats_negatives_as_large() {
        // -1 / 2 in unsigned 64-bit space.
        assert_eq!(eval("-1/2", false), Ok(((u64::MAX) / 2) as i64));
    }

    #[test]
    fn bitwise_and_shifts() {
        assert_eq!(eval("1<<4", false), Ok(16));
        assert_eq!(eval("255>>4", false), Ok(15));
        assert_eq!(eval("12&10", false), Ok(8));
        assert_eq!(eval("12|3", false), Ok(15));
        assert_eq!(eval("12^10", false), Ok(6));
        assert_eq!(eval("~0", false), Ok(-1));
        assert_eq!(eval("1<<200", false), Ok(0));
    }

    #[test]
    fn relational_yields_all_bits() {
        assert_eq!(eval("2 >= 2", true), Ok(-1));
        assert_eq!(eval("1 > 2", true), Ok(0));
        assert_eq!(eval("3 <> 4", true), Ok(-1));
        assert_eq!(eval("3 = 3", true), Ok(-1));
    }

    #[test]
    fn boolean_operators_normalize() {
        assert_eq!(eval("5 && 3", true), Ok(1));
        assert_eq!(eval("0 || 7", true), Ok(1));
        assert_eq!(eval("1 ^^ 1", true), Ok(0));
        assert_eq!(eval("!5", true), Ok(0));
        assert_eq!(eval("!0", true), Ok(1));
    }

    #[test]
    fn relational_terminates_noncritical_expression() {
        // Outside %if, the expression simply ends before the operator.
        let toks = tokenize("1 < 2").tokens;
        let out = evaluate(&toks, &NoSymbols, false).expect("value");
        assert_eq!(out.value, 1);
        assert!(out.consumed < toks.len());
    }

    #[test]
    fn radix_literals_and_char_constants() {
        assert_eq!(eval("0x10 + 10h + $10", false), Ok(48));
        assert_eq!(eval("'A'", false), Ok(0x41));
        assert_eq!(eval("'AB'", false), Ok(0x4241));
    }

    #[test]
    fn undefined_symbols() {
        assert!(matches!(
            eval("bogus + 1", false),
            Err(ExprError::NonConstant(_))
        ));
        assert!(matches!(eval("bogus + 1", true), Err(ExprError::Syntax(_))));
    }

    #[test]
    fn here_without_resolver_is_non_constant() {
        assert!(matches!(eval("$", false), Err(ExprError::NonConstant(_))));
        assert!(matches!(eval("$$+2", false), Err(ExprError::NonConstant(_))));
    }

    #[test]
    fn resolver_supplies_symbols() {
        struct Fixed;
        impl SymbolResolver for Fixed {
            fn lookup(&self, name: &str) -> Option<i64> {
                (name == "answer").then_some(42)
            }
            fn here(&self) -> Option<i64> {
                Some(0x100)
            }
        }
        let toks = tokenize("answer * 2").tokens;
        assert_eq!(evaluate(&toks, &Fixed, true).map(|o| o.value), Ok(84));
        let toks = tokenize("$ + 2").tokens;
        assert_eq!(evaluate(&toks, &Fixed, false).map(|o| o.value), Ok(0x102));
    }

    #[test]
    fn unbalanced_parenthesis_is_a_syntax_error() {
        assert!(matches!(eval("(1+2", false), Err(ExprError::Syntax(_))));
        assert!(matches!(eval("", false), Err(ExprError::Syntax(_))));
    }
}
