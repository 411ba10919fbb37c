//! The token model: typed fragments of a source line.
//!
//! A line is held as an owned `Vec<Token>`; expansion always deep-copies
//! token text, so no token is ever shared between two lines. [`tokenize`] is
//! a single deterministic pass that only *splits* — it never parses values
//! out of numbers or strings; that happens where the value is needed.
//!
//! Classification rules:
//!
//! - identifiers start with a letter, `_`, `.`, `?` or `@` (optionally a
//!   leading `$` to defeat keyword recognition downstream);
//! - numbers start with a digit or `$` and continue through alphanumerics,
//!   `_` and `$`;
//! - strings are `'…'` or `"…"`, kept with their quotes;
//! - `%`-forms become preprocessor-ids: `%name`, `%%name`, `%$name` (any
//!   number of `$`), `%!ENV`, `%1`/`%+1`/`%-1`, the bare paste operator
//!   `%+`, and the brace form `%{…}` which is stored as `%` plus the brace
//!   content;
//! - everything else is an operator, with the two-character forms `<<`,
//!   `>>`, `//`, `%%`, `==`, `!=`, `<>`, `<=`, `>=`, `&&`, `||`, `^^`
//!   recognized greedily.
//!
//! Comments (`;` to end of line) and trailing whitespace are dropped during
//! tokenization and never reach the rewriting machinery.

// ============================================================================
// TOKEN TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// An ordinary identifier.
    Id,
    /// A `%`-prefixed preprocessor identifier or parameter reference.
    PreprocId,
    /// A numeric literal (radix undecoded).
    Number,
    /// A quoted string, quotes included in the text.
    Str,
    /// A run of whitespace, canonicalized to a single space.
    Whitespace,
    /// An operator or any other punctuation.
    Other,
    /// Placeholder for the n-th formal parameter inside a stored
    /// single-line macro expansion. Never appears on a live line.
    SmacParam(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Token {
            kind,
            text: text.into(),
        }
    }

    pub fn id(text: impl Into<String>) -> Self {
        Token::new(TokenKind::Id, text)
    }

    pub fn other(text: impl Into<String>) -> Self {
        Token::new(TokenKind::Other, text)
    }

    pub fn whitespace() -> Self {
        Token::new(TokenKind::Whitespace, " ")
    }

    /// A number token carrying a decimal rendering of `value`.
    pub fn number(value: i64) -> Self {
        Token::new(TokenKind::Number, value.to_string())
    }

    pub fn is_ws(&self) -> bool {
        self.kind == TokenKind::Whitespace
    }

    pub fn is_id(&self) -> bool {
        self.kind == TokenKind::Id
    }

    pub fn is_ppid(&self) -> bool {
        self.kind == TokenKind::PreprocId
    }

    /// True for an `Other` token with exactly this text.
    pub fn is(&self, text: &str) -> bool {
        self.kind == TokenKind::Other && self.text == text
    }
}

/// Index of the first non-whitespace token at or after `from`.
pub fn skip_ws(tokens: &[Token], from: usize) -> usize {
    let mut i = from;
    while i < tokens.len() && tokens[i].is_ws() {
        i += 1;
    }
    i
}

// ============================================================================
// CHARACTER CLASSES
// ============================================================================

fn is_id_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || matches!(c, b'_' | b'.' | b'?' | b'@')
}

fn is_id_char(c: u8) -> bool {
    is_id_start(c) || c.is_ascii_digit() || matches!(c, b'$' | b'#' | b'~')
}

fn is_num_start(c: u8) -> bool {
    c.is_ascii_digit() || c == b'$'
}

fn is_num_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'$')
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\x0b' | b'\x0c' | b'\r' | b'\n')
}

const TWO_CHAR_OPS: [[u8; 2]; 11] = [
    *b">>", *b"<<", *b"//", *b"<=", *b">=", *b"==", *b"!=", *b"<>", *b"&&", *b"||", *b"^^",
];

// ============================================================================
// TOKENIZE
// ============================================================================

/// Result of tokenizing one line.
pub struct Tokenized {
    pub tokens: Vec<Token>,
    /// Set when a string literal ran to end of line without its closing
    /// quote; the caller decides how loudly to complain.
    pub unterminated_string: bool,
}

/// Split one line of text into tokens.
pub fn tokenize(line: &str) -> Tokenized {
    let b = line.as_bytes();
    let mut tokens = Vec::new();
    let mut unterminated = false;
    let mut i = 0;

    while i < b.len() {
        let start = i;
        if b[i] == b'%' {
            i += 1;
            let next = b.get(i).copied();
            let after = b.get(i + 1).copied();
            if next.map_or(false, |c| c.is_ascii_digit())
                || (matches!(next, Some(b'-') | Some(b'+'))
                    && after.map_or(false, |c| c.is_ascii_digit()))
                || (next == Some(b'+') && after.map_or(true, is_space))
            {
                // %1, %-1, %+1, or the bare paste operator %+
                if matches!(next, Some(b'-') | Some(b'+')) {
                    i += 1;
                }
                while i < b.len() && b[i].is_ascii_digit() {
                    i += 1;
                }
                tokens.push(Token::new(TokenKind::PreprocId, &line[start..i]));
            } else if next == Some(b'{') {
                // %{...}: the stored text is `%` plus the brace content.
                i += 1;
                let inner_start = i;
                while i < b.len() && b[i] != b'}' {
                    i += 1;
                }
                let text = format!("%{}", &line[inner_start..i]);
                if i < b.len() {
                    i += 1;
                }
                tokens.push(Token::new(TokenKind::PreprocId, text));
            } else if next.map_or(false, is_id_char)
                || (matches!(next, Some(b'!') | Some(b'%') | Some(b'$'))
                    && after.map_or(false, is_id_char))
            {
                i += 1;
                while i < b.len() && is_id_char(b[i]) {
                    i += 1;
                }
                tokens.push(Token::new(TokenKind::PreprocId, &line[start..i]));
            } else {
                // A lone % is an operator; %% is the signed-modulo operator.
                if next == Some(b'%') {
                    i += 1;
                }
                tokens.push(Token::other(&line[start..i]));
            }
        } else if is_id_start(b[i]) || (b[i] == b'$' && b.get(i + 1).copied().map_or(false, is_id_start)) {
            i += 1;
            while i < b.len() && is_id_char(b[i]) {
                i += 1;
            }
            tokens.push(Token::id(&line[start..i]));
        } else if b[i] == b'\'' || b[i] == b'"' {
            let quote = b[i];
            i += 1;
            while i < b.len() && b[i] != quote {
                i += 1;
            }
            if i < b.len() {
                i += 1;
                tokens.push(Token::new(TokenKind::Str, &line[start..i]));
            } else {
                // Unterminated: close it with its own quote so downstream
                // consumers always see a balanced literal.
                unterminated = true;
                let mut text = line[start..].to_string();
                text.push(quote as char);
                tokens.push(Token::new(TokenKind::Str, text));
            }
        } else if is_num_start(b[i]) {
            i += 1;
            while i < b.len() && is_num_char(b[i]) {
                i += 1;
            }
            tokens.push(Token::new(TokenKind::Number, &line[start..i]));
        } else if is_space(b[i]) {
            while i < b.len() && is_space(b[i]) {
                i += 1;
            }
            // Whitespace just before end-of-line or a comment is dropped
            // along with the comment itself.
            if i >= b.len() || b[i] == b';' {
                break;
            }
            tokens.push(Token::whitespace());
        } else if b[i] == b';' {
            break;
        } else {
            let pair = [b[i], b.get(i + 1).copied().unwrap_or(0)];
            if TWO_CHAR_OPS.contains(&pair) {
                i += 2;
            } else {
                // Advance a whole character so multi-byte input cannot
                // split a UTF-8 boundary.
                i += line[i..].chars().next().map_or(1, char::len_utf8);
            }
            tokens.push(Token::other(&line[start..i]));
        }
    }

    Tokenized {
        tokens,
        unterminated_string: unterminated,
    }
}

// ============================================================================
// DETOKEN
// ============================================================================

/// Convert a token list back into text.
///
/// `resolve_local` is consulted for `%$`-prefixed preprocessor-ids and may
/// rewrite them into globally unique names (or fail the line outright, which
/// is why it returns a `Result`). `%!ENV` forms are replaced with the value
/// of the environment variable; an unset variable becomes empty text and is
/// reported through `warn`.
pub fn detoken<E>(
    tokens: &[Token],
    mut resolve_local: impl FnMut(&str) -> Result<Option<String>, E>,
    mut warn: impl FnMut(String),
) -> Result<String, E> {
    let mut out = String::new();
    for tok in tokens {
        match tok.kind {
            TokenKind::Whitespace => out.push(' '),
            TokenKind::PreprocId if tok.text.starts_with("%!") => {
                let var = &tok.text[2..];
                match std::env::var(var) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => {
                        warn(format!("environment variable `{}' does not exist", var));
                    }
                }
            }
            TokenKind::PreprocId if tok.text.starts_with("%$") => {
                match resolve_local(&tok.text)? {
                    Some(resolved) => out.push_str(&resolved),
                    None => out.push_str(&tok.text),
                }
            }
            _ => out.push_str(&tok.text),
        }
    }
    Ok(out)
}

/// Detoken without local-label resolution. Used for stored text and for
/// directives that re-serialize their argument tokens.
pub fn detoken_basic(tokens: &[Token], warn: impl FnMut(String)) -> String {
    match detoken::<std::convert::Infallible>(tokens, |_| Ok(None), warn) {
        Ok(text) => text,
        Err(never) => match never {},
    }
}

// ============================================================================
// TOKEN PASTING
// ============================================================================

fn pasteable_left(kind: TokenKind) -> bool {
    matches!(kind, TokenKind::Id | TokenKind::PreprocId)
}

fn pasteable_right(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Id | TokenKind::PreprocId | TokenKind::Number
    )
}

/// The paste pass run after single-line macro expansion.
///
/// Deletes `%+` operators together with their surrounding whitespace, then
/// concatenates adjacent identifier-like tokens (which can only become
/// adjacent through substitution). Returns true if any concatenation
/// happened, in which case the caller must rescan the whole line for newly
/// formed macro names.
pub fn paste_tokens(tokens: &mut Vec<Token>) -> bool {
    // %+ removal: a paste operator between two tokens disappears along with
    // the whitespace around it, forcing its neighbours together.
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].kind == TokenKind::PreprocId && tokens[i].text == "%+" {
            let mut lo = i;
            while lo > 0 && tokens[lo - 1].is_ws() {
                lo -= 1;
            }
            let mut hi = i + 1;
            while hi < tokens.len() && tokens[hi].is_ws() {
                hi += 1;
            }
            if lo > 0 && hi < tokens.len() {
                tokens.drain(lo..hi);
                i = lo;
                continue;
            }
        }
        i += 1;
    }

    // Adjacent-token concatenation.
    let mut merged = false;
    let mut i = 0;
    while i + 1 < tokens.len() {
        if pasteable_left(tokens[i].kind) && pasteable_right(tokens[i + 1].kind) {
            let next = tokens.remove(i + 1);
            tokens[i].text.push_str(&next.text);
            merged = true;
        } else {
            i += 1;
        }
    }
    merged
}

/// The joining pass run after multi-line macro parameter substitution:
/// collapse doubled whitespace and merge identifier/number tokens that
/// substitution has made adjacent. Unlike [`paste_tokens`] this never
/// triggers a rescan.
pub fn join_adjacent(tokens: &mut Vec<Token>) {
    let mut i = 0;
    while i + 1 < tokens.len() {
        let merge = match (tokens[i].kind, tokens[i + 1].kind) {
            (TokenKind::Whitespace, TokenKind::Whitespace) => {
                tokens.remove(i + 1);
                continue;
            }
            (TokenKind::Id, TokenKind::Id)
            | (TokenKind::Id, TokenKind::Number)
            | (TokenKind::Number, TokenKind::Number) => true,
            _ => false,
        };
        if merge {
            let next = tokens.remove(i + 1);
            tokens[i].text.push_str(&next.text);
        } else {
            i += 1;
        }
    }
}

// ============================================================================
// NUMERIC READERS
// ============================================================================

/// Decode a numeric literal in any of the accepted radix spellings:
/// `$1F`/`0x1F`/`1Fh` hex, `17q`/`17o` octal, `1011b` binary, `42`/`42d`
/// decimal. Returns `None` for anything malformed.
pub fn read_num(text: &str) -> Option<i64> {
    // A leading minus only occurs on synthesized tokens (`%assign` of a
    // negative value); source text always arrives sign-free.
    if let Some(rest) = text.strip_prefix('-') {
        return read_num(rest).map(i64::wrapping_neg);
    }
    let b = text.as_bytes();
    if b.is_empty() {
        return None;
    }

    let (radix, digits): (u32, &str) = if b[0] == b'$' {
        (16, &text[1..])
    } else if text.len() > 2 && (text.starts_with("0x") || text.starts_with("0X")) {
        (16, &text[2..])
    } else {
        match b[b.len() - 1].to_ascii_lowercase() {
            b'h' => (16, &text[..text.len() - 1]),
            b'q' | b'o' => (8, &text[..text.len() - 1]),
            b'b' => (2, &text[..text.len() - 1]),
            b'd' => (10, &text[..text.len() - 1]),
            _ => (10, text),
        }
    };

    if digits.is_empty() {
        return None;
    }
    // Wrapping accumulation: assembler constants are 64-bit modular.
    let mut value: i64 = 0;
    for c in digits.bytes() {
        let d = (c as char).to_digit(radix)? as i64;
        value = value.wrapping_mul(radix as i64).wrapping_add(d);
    }
    Some(value)
}

/// Decode a character constant from the *inner* text of a string token
/// (quotes already stripped). Bytes pack little-endian; constants longer
/// than eight bytes keep the low eight and set the overflow flag.
pub fn read_str_num(inner: &str) -> (i64, bool) {
    let bytes = inner.as_bytes();
    let mut value: i64 = 0;
    for (i, &byte) in bytes.iter().take(8).enumerate() {
        value |= (byte as i64) << (8 * i);
    }
    (value, bytes.len() > 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(line: &str) -> Vec<TokenKind> {
        tokenize(line).tokens.iter().map(|t| t.kind).collect()
    }

    fn texts(line: &str) -> Vec<String> {
        tokenize(line).tokens.iter().map(|t| t.text.clone()).collect()
    }

    #[test]
    fn classifies_basic_line() {
        let toks = tokenize("mov ax, 5").tokens;
        let expect = [
            (TokenKind::Id, "mov"),
            (TokenKind::Whitespace, " "),
            (TokenKind::Id, "ax"),
            (TokenKind::Other, ","),
            (TokenKind::Whitespace, " "),
            (TokenKind::Number, "5"),
        ];
        assert_eq!(toks.len(), expect.len());
        for (tok, (kind, text)) in toks.iter().zip(expect) {
            assert_eq!(tok.kind, kind);
            assert_eq!(tok.text, text);
        }
    }

    #[test]
    fn drops_comments_and_trailing_whitespace() {
        assert_eq!(texts("inc cx   ; bump counter"), ["inc", " ", "cx"]);
        assert_eq!(texts("inc cx   "), ["inc", " ", "cx"]);
        assert_eq!(texts("; whole line comment"), Vec::<String>::new());
    }

    #[test]
    fn preprocessor_forms() {
        assert_eq!(texts("%define"), ["%define"]);
        assert_eq!(texts("%%local"), ["%%local"]);
        assert_eq!(texts("%$var"), ["%$var"]);
        assert_eq!(texts("%$$outer"), ["%$$outer"]);
        assert_eq!(texts("%!HOME"), ["%!HOME"]);
        assert_eq!(texts("%1"), ["%1"]);
        assert_eq!(texts("%-3"), ["%-3"]);
        assert_eq!(texts("%+2"), ["%+2"]);
        assert_eq!(texts("%{1:3}"), ["%1:3"]);
        assert!(kinds("%$var").iter().all(|k| *k == TokenKind::PreprocId));
    }

    #[test]
    fn bare_paste_operator_is_preproc_id() {
        let toks = tokenize("a %+ b").tokens;
        assert_eq!(toks[2].kind, TokenKind::PreprocId);
        assert_eq!(toks[2].text, "%+");
    }

    #[test]
    fn modulo_operators() {
        // %% not followed by an id char is the signed-modulo operator.
        assert_eq!(texts("5 %% 3"), ["5", " ", "%%", " ", "3"]);
        assert_eq!(texts("5 % 3"), ["5", " ", "%", " ", "3"]);
    }

    #[test]
    fn two_char_operators_are_single_tokens() {
        for op in ["<<", ">>", "//", "==", "!=", "<>", "<=", ">=", "&&", "||", "^^"] {
            let toks = tokenize(op).tokens;
            assert_eq!(toks.len(), 1, "{op}");
            assert_eq!(toks[0].text, op);
        }
    }

    #[test]
    fn unterminated_string_is_closed_and_flagged() {
        let out = tokenize("db 'oops");
        assert!(out.unterminated_string);
        let last = out.tokens.last().expect("tokens");
        assert_eq!(last.kind, TokenKind::Str);
        assert_eq!(last.text, "'oops'");
    }

    #[test]
    fn dollar_prefixed_forms() {
        // $ then identifier: identifier; $ then digits: number; lone $: number-ish.
        assert_eq!(kinds("$foo")[0], TokenKind::Id);
        assert_eq!(kinds("$1F")[0], TokenKind::Number);
        assert_eq!(kinds("$")[0], TokenKind::Number);
        assert_eq!(texts("$$"), ["$$"]);
    }

    #[test]
    fn paste_removes_operator_and_joins() {
        let mut toks = tokenize("foo %+ bar").tokens;
        let rescanned = paste_tokens(&mut toks);
        assert!(rescanned);
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].text, "foobar");
    }

    #[test]
    fn paste_concatenates_adjacent_ids() {
        let mut toks = vec![Token::id("loop"), Token::number(3)];
        assert!(paste_tokens(&mut toks));
        assert_eq!(toks[0].text, "loop3");
    }

    #[test]
    fn join_adjacent_collapses_whitespace() {
        let mut toks = vec![
            Token::id("a"),
            Token::whitespace(),
            Token::whitespace(),
            Token::id("b"),
        ];
        join_adjacent(&mut toks);
        assert_eq!(toks.len(), 3);
    }

    #[test]
    fn read_num_radices() {
        assert_eq!(read_num("42"), Some(42));
        assert_eq!(read_num("42d"), Some(42));
        assert_eq!(read_num("$2A"), Some(42));
        assert_eq!(read_num("0x2A"), Some(42));
        assert_eq!(read_num("2Ah"), Some(42));
        assert_eq!(read_num("52q"), Some(42));
        assert_eq!(read_num("101010b"), Some(42));
        assert_eq!(read_num("12x9"), None);
        assert_eq!(read_num(""), None);
        assert_eq!(read_num("$"), None);
    }

    #[test]
    fn read_str_num_packs_little_endian() {
        assert_eq!(read_str_num("A"), (0x41, false));
        assert_eq!(read_str_num("AB"), (0x4241, false));
        assert_eq!(read_str_num("ABCDEFGHI").1, true);
    }

    #[test]
    fn detoken_round_trips_plain_text() {
        let toks = tokenize("mov  ax, [bx+si]").tokens;
        let text = detoken_basic(&toks, |_| {});
        assert_eq!(text, "mov ax, [bx+si]");
    }
}
