use std::path::Path;

use chrono::{DateTime, Utc};

use crate::dates::{self, DateSettings};
use crate::duration::Duration;

/// Attribute-modifier vocabulary accepted in `name.<mod>:<value>` pairs.
pub const MODIFIERS: &[&str] = &[
    "before", "under", "below", "after", "over", "above", "none", "any", "is", "equals", "isnt",
    "not", "has", "contains", "hasnt", "startswith", "left", "endswith", "right", "word", "noword",
];

/// Operators, longest first so that greedy matching never splits `==` into
/// `=` `=`.
const OPERATORS: &[&str] = &[
    "_hastag_", "_notag_", "and", "xor", "not", "or", "!==", "==", "!=", "<=", ">=", "!~", "=",
    "<", ">", "~", "!", "+", "-", "*", "/", "(", ")",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Left,
    Right,
}

/// Binding power and associativity; higher binds tighter.
pub fn operator_info(op: &str) -> Option<(u8, Assoc)> {
    let info = match op {
        "!" | "not" => (15, Assoc::Right),
        "*" | "/" => (13, Assoc::Left),
        "+" | "-" => (12, Assoc::Left),
        "<" | "<=" | ">" | ">=" => (10, Assoc::Left),
        "=" | "==" | "!=" | "!==" | "~" | "!~" | "_hastag_" | "_notag_" => (9, Assoc::Left),
        "and" => (5, Assoc::Left),
        "xor" => (4, Assoc::Left),
        "or" => (3, Assoc::Left),
        "(" | ")" => (0, Assoc::Left),
        _ => return None,
    };
    Some(info)
}

pub fn is_operator(text: &str) -> bool {
    OPERATORS.contains(&text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Separator,
    Uuid,
    Number,
    Duration,
    Date,
    Tag,
    Pair,
    Pattern,
    Substitution,
    Set,
    Operator,
    Identifier,
    Word,
    Str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub lexeme: String,
    pub kind: TokenKind,
    /// Whether the surface form was quoted; quoted input never desugars.
    pub quoted: bool,
}

impl Token {
    pub fn new(lexeme: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            lexeme: lexeme.into(),
            kind,
            quoted: false,
        }
    }

    pub fn word(lexeme: impl Into<String>) -> Self {
        Self::new(lexeme, TokenKind::Word)
    }

    pub fn operator(lexeme: impl Into<String>) -> Self {
        Self::new(lexeme, TokenKind::Operator)
    }
}

/// Character-level tokenizer. Restartable: `lex` is a pure function of its
/// input. Never fails; unrecognizable runs come back as `Word` tokens.
pub struct Lexer<'a> {
    input: &'a [u8],
    text: &'a str,
    pos: usize,
    after_separator: bool,
    now: DateTime<Utc>,
    dates: DateSettings,
}

impl<'a> Lexer<'a> {
    pub fn new(text: &'a str, now: DateTime<Utc>, dates: DateSettings) -> Self {
        Self {
            input: text.as_bytes(),
            text,
            pos: 0,
            after_separator: false,
            now,
            dates,
        }
    }

    pub fn lex(text: &'a str, now: DateTime<Utc>, dates: &DateSettings) -> Vec<Token> {
        let mut lexer = Lexer::new(text, now, dates.clone());
        let mut out = Vec::new();
        while let Some(token) = lexer.token() {
            out.push(token);
        }
        out
    }

    /// Next token, or None at end of input.
    pub fn token(&mut self) -> Option<Token> {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos >= self.input.len() {
            return None;
        }

        if self.after_separator {
            let start = self.pos;
            while self.pos < self.input.len() && !self.input[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            return Some(Token::word(&self.text[start..self.pos]));
        }

        // Try every recognizer; keep the longest match, resolving length
        // ties by table order.
        let recognizers: &[fn(&Lexer<'a>) -> Option<Matched>] = &[
            Lexer::match_separator,
            Lexer::match_uuid,
            Lexer::match_number,
            Lexer::match_duration,
            Lexer::match_date,
            Lexer::match_tag,
            Lexer::match_pair,
            Lexer::match_pattern,
            Lexer::match_substitution,
            Lexer::match_set,
            Lexer::match_operator,
            Lexer::match_identifier,
            Lexer::match_string,
        ];

        let mut best: Option<Matched> = None;
        for recognize in recognizers {
            if let Some(m) = recognize(self) {
                let longer = best.as_ref().map(|b| m.consumed > b.consumed).unwrap_or(true);
                if longer {
                    best = Some(m);
                }
            }
        }

        if let Some(m) = best {
            self.pos += m.consumed;
            if m.token.kind == TokenKind::Separator {
                self.after_separator = true;
            }
            return Some(m.token);
        }

        // Fallback: a whitespace-delimited word.
        let start = self.pos;
        while self.pos < self.input.len() && !self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        Some(Token::word(&self.text[start..self.pos]))
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn char_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    /// Boundary test for atom recognizers: the match must not run into an
    /// identifier continuation.
    fn boundary_at(&self, offset: usize) -> bool {
        match self.char_at(offset) {
            None => true,
            Some(c) => !(c.is_ascii_alphanumeric() || c == b'_'),
        }
    }

    fn match_separator(&self) -> Option<Matched> {
        if self.rest() == "--" || self.rest().starts_with("-- ") {
            Some(Matched::new(Token::new("--", TokenKind::Separator), 2))
        } else {
            None
        }
    }

    fn match_uuid(&self) -> Option<Matched> {
        let mut total = uuid_prefix_len(self.rest())?;
        while self.char_at(total) == Some(b',') {
            match uuid_prefix_len(&self.rest()[total + 1..]) {
                Some(len) => total += 1 + len,
                None => break,
            }
        }
        if !self.boundary_at(total) {
            return None;
        }
        Some(Matched::new(
            Token::new(&self.rest()[..total], TokenKind::Uuid),
            total,
        ))
    }

    fn match_number(&self) -> Option<Matched> {
        let mut len = 0;
        while self.char_at(len).map(|c| c.is_ascii_digit()).unwrap_or(false) {
            len += 1;
        }
        if len == 0 {
            return None;
        }
        if self.char_at(len) == Some(b'.') {
            let mut frac = len + 1;
            while self.char_at(frac).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                frac += 1;
            }
            if frac > len + 1 {
                len = frac;
            }
        }
        // A number must be followed by an expression boundary, so that `2x`
        // and `5h` stay whole for later rules.
        match self.char_at(len) {
            None => {}
            Some(b')') | Some(b'+') | Some(b'-') | Some(b'*') | Some(b'/') => {}
            Some(c) if c.is_ascii_whitespace() => {}
            _ => return None,
        }
        Some(Matched::new(
            Token::new(&self.rest()[..len], TokenKind::Number),
            len,
        ))
    }

    fn match_duration(&self) -> Option<Matched> {
        let end = self.atom_end();
        if end == 0 {
            return None;
        }
        let candidate = &self.rest()[..end];
        Duration::parse_token(candidate)?;
        Some(Matched::new(Token::new(candidate, TokenKind::Duration), end))
    }

    fn match_date(&self) -> Option<Matched> {
        let end = self.atom_end_with(|c| {
            c.is_ascii_alphanumeric() || matches!(c, b'-' | b':' | b'.' | b'_' | b'T' | b'Z' | b'/')
        });
        if end == 0 {
            return None;
        }
        let candidate = &self.rest()[..end];
        dates::parse_date(candidate, self.now, &self.dates)?;
        Some(Matched::new(Token::new(candidate, TokenKind::Date), end))
    }

    fn match_tag(&self) -> Option<Matched> {
        let sign = self.char_at(0)?;
        if sign != b'+' && sign != b'-' {
            return None;
        }
        let mut len = 1;
        if !self
            .char_at(len)
            .map(|c| c.is_ascii_alphabetic() || c == b'_')
            .unwrap_or(false)
        {
            return None;
        }
        while self
            .char_at(len)
            .map(|c| c.is_ascii_alphanumeric() || c == b'_')
            .unwrap_or(false)
        {
            len += 1;
        }
        Some(Matched::new(
            Token::new(&self.rest()[..len], TokenKind::Tag),
            len,
        ))
    }

    fn match_pair(&self) -> Option<Matched> {
        let mut len = 0;
        if !self
            .char_at(0)
            .map(|c| c.is_ascii_alphabetic() || c == b'_')
            .unwrap_or(false)
        {
            return None;
        }
        while self
            .char_at(len)
            .map(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
            .unwrap_or(false)
        {
            len += 1;
        }

        let sep = self.char_at(len)?;
        if sep != b':' && sep != b'=' {
            return None;
        }
        let name = &self.rest()[..len];
        if name.ends_with('.') {
            return None;
        }
        let value_start = len + 1;

        // Quoted value: strip the quotes, remember the quoting.
        if let Some(quote) = self.char_at(value_start).filter(|c| *c == b'"' || *c == b'\'') {
            let mut end = value_start + 1;
            while let Some(c) = self.char_at(end) {
                if c == quote {
                    let lexeme = format!(
                        "{}{}{}",
                        name,
                        sep as char,
                        &self.rest()[value_start + 1..end]
                    );
                    let mut token = Token::new(lexeme, TokenKind::Pair);
                    token.quoted = true;
                    return Some(Matched::new(token, end + 1));
                }
                end += 1;
            }
            return None;
        }

        // A bare value runs to whitespace; parentheses stay outside so that
        // `(project:home)` closes its group.
        let mut end = value_start;
        while self
            .char_at(end)
            .map(|c| !c.is_ascii_whitespace() && c != b'(' && c != b')')
            .unwrap_or(false)
        {
            end += 1;
        }
        Some(Matched::new(
            Token::new(&self.rest()[..end], TokenKind::Pair),
            end,
        ))
    }

    fn match_pattern(&self) -> Option<Matched> {
        if self.char_at(0) != Some(b'/') {
            return None;
        }
        let mut end = 1;
        while let Some(c) = self.char_at(end) {
            if c == b'/' {
                // Optional regex flags.
                let mut flags_end = end + 1;
                while self
                    .char_at(flags_end)
                    .map(|c| matches!(c, b'g' | b'i' | b'm' | b's'))
                    .unwrap_or(false)
                {
                    flags_end += 1;
                }
                if !self.boundary_at(flags_end) {
                    return None;
                }
                return Some(Matched::new(
                    Token::new(&self.rest()[..flags_end], TokenKind::Pattern),
                    flags_end,
                ));
            }
            if c == b'\\' {
                end += 1;
            }
            end += 1;
        }
        None
    }

    fn match_substitution(&self) -> Option<Matched> {
        if self.char_at(0) != Some(b'/') {
            return None;
        }
        let mut slashes = vec![0_usize];
        let mut idx = 1;
        while let Some(c) = self.char_at(idx) {
            if c == b'\\' {
                idx += 2;
                continue;
            }
            if c == b'/' {
                slashes.push(idx);
                if slashes.len() == 3 {
                    break;
                }
            }
            idx += 1;
        }
        if slashes.len() != 3 {
            return None;
        }
        let mut end = slashes[2] + 1;
        if self.char_at(end) == Some(b'g') {
            end += 1;
        }
        if !self.boundary_at(end) {
            return None;
        }
        let candidate = &self.rest()[..end];
        // A token that names a real directory is a path, not a substitution.
        if Path::new(candidate).is_dir() {
            return None;
        }
        Some(Matched::new(
            Token::new(candidate, TokenKind::Substitution),
            end,
        ))
    }

    fn match_set(&self) -> Option<Matched> {
        let mut idx = 0;
        let mut elements = 0;
        loop {
            let digits = self.digits_at(idx);
            if digits == 0 {
                return None;
            }
            idx += digits;
            if self.char_at(idx) == Some(b'-') {
                let range_digits = self.digits_at(idx + 1);
                if range_digits == 0 {
                    return None;
                }
                idx += 1 + range_digits;
            }
            elements += 1;
            if self.char_at(idx) == Some(b',') {
                idx += 1;
                continue;
            }
            break;
        }
        if elements == 0 || !self.boundary_at(idx) {
            return None;
        }
        Some(Matched::new(
            Token::new(&self.rest()[..idx], TokenKind::Set),
            idx,
        ))
    }

    fn match_operator(&self) -> Option<Matched> {
        for op in OPERATORS {
            if self.rest().starts_with(op) {
                let alphabetic = op.chars().next().map(char::is_alphabetic).unwrap_or(false)
                    || op.starts_with('_');
                if alphabetic && !self.boundary_at(op.len()) {
                    continue;
                }
                return Some(Matched::new(Token::operator(*op), op.len()));
            }
        }
        None
    }

    fn match_identifier(&self) -> Option<Matched> {
        // Plain identifier, `rc.<path>`, `<id>.<attr>` and `<uuid>.<attr>`
        // all land here; the DOM resolves them later.
        let mut len = self.identifier_len(0)?;

        while self.char_at(len) == Some(b'.') {
            match self.identifier_len(len + 1) {
                Some(seg) => len += 1 + seg,
                None => break,
            }
        }
        Some(Matched::new(
            Token::new(&self.rest()[..len], TokenKind::Identifier),
            len,
        ))
    }

    fn identifier_len(&self, offset: usize) -> Option<usize> {
        if !self
            .char_at(offset)
            .map(|c| c.is_ascii_alphabetic() || c == b'_')
            .unwrap_or(false)
        {
            return None;
        }
        let mut len = 1;
        while self
            .char_at(offset + len)
            .map(|c| c.is_ascii_alphanumeric() || c == b'_')
            .unwrap_or(false)
        {
            len += 1;
        }
        Some(len)
    }

    fn match_string(&self) -> Option<Matched> {
        let quote = self.char_at(0).filter(|c| *c == b'"' || *c == b'\'')?;
        let mut end = 1;
        while let Some(c) = self.char_at(end) {
            if c == quote {
                let mut token = Token::new(&self.rest()[1..end], TokenKind::Str);
                token.quoted = true;
                return Some(Matched::new(token, end + 1));
            }
            if c == b'\\' {
                end += 1;
            }
            end += 1;
        }
        None
    }

    fn digits_at(&self, offset: usize) -> usize {
        let mut len = 0;
        while self
            .char_at(offset + len)
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false)
        {
            len += 1;
        }
        len
    }

    /// Length of the run of identifier-ish characters starting here.
    fn atom_end(&self) -> usize {
        self.atom_end_with(|c| c.is_ascii_alphanumeric() || c == b'.' || c == b'_')
    }

    fn atom_end_with(&self, allowed: impl Fn(u8) -> bool) -> usize {
        let mut len = 0;
        while self.char_at(len).map(&allowed).unwrap_or(false) {
            len += 1;
        }
        len
    }
}

struct Matched {
    token: Token,
    consumed: usize,
}

impl Matched {
    fn new(token: Token, consumed: usize) -> Self {
        Self { token, consumed }
    }
}

/// Length of a (possibly partial) uuid at the start of `text`: hex digits
/// with hyphens at the canonical 8-4-4-4-12 offsets, at least 8 characters.
fn uuid_prefix_len(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut len = 0;
    while len < 36 && len < bytes.len() {
        let c = bytes[len];
        let ok = if matches!(len, 8 | 13 | 18 | 23) {
            c == b'-'
        } else {
            c.is_ascii_hexdigit()
        };
        if !ok {
            break;
        }
        len += 1;
    }
    // A trailing hyphen belongs to the next token, not the partial.
    if len > 0 && bytes[len - 1] == b'-' {
        len -= 1;
    }
    if len >= 8 { Some(len) } else { None }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{Lexer, Token, TokenKind, uuid_prefix_len};
    use crate::dates::DateSettings;

    fn lex(text: &str) -> Vec<Token> {
        let now = Utc.with_ymd_and_hms(2026, 3, 18, 12, 0, 0).unwrap();
        Lexer::lex(text, now, &DateSettings::default())
    }

    fn kinds(text: &str) -> Vec<TokenKind> {
        lex(text).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexing_is_total() {
        for input in ["", " ", "@@@", "a b c", "((((", "\"unterminated"] {
            let tokens = lex(input);
            let nonspace: String = input.chars().filter(|c| !c.is_whitespace()).collect();
            let joined: String = tokens
                .iter()
                .map(|t| t.lexeme.chars().filter(|c| !c.is_whitespace()).collect::<String>())
                .collect();
            // No character outside quotes is dropped.
            if !input.contains('"') && !input.contains('\'') {
                assert_eq!(nonspace, joined, "lost characters lexing {input:?}");
            }
        }
    }

    #[test]
    fn separator_forces_words() {
        let tokens = lex("-- +tag project:x 123");
        assert_eq!(tokens[0].kind, TokenKind::Separator);
        for token in &tokens[1..] {
            assert_eq!(token.kind, TokenKind::Word, "token {:?}", token.lexeme);
        }
    }

    #[test]
    fn uuid_full_partial_and_list() {
        assert_eq!(
            kinds("a0b1c2d3-0000-4000-8000-000000000000"),
            vec![TokenKind::Uuid]
        );
        assert_eq!(kinds("a0b1c2d3"), vec![TokenKind::Uuid]);
        assert_eq!(kinds("a0b1c2d3,deadbeef"), vec![TokenKind::Uuid]);
        // Too short to be a uuid.
        assert_eq!(kinds("a0b1c2"), vec![TokenKind::Identifier]);
    }

    #[test]
    fn numbers_need_expression_boundaries() {
        assert_eq!(kinds("42"), vec![TokenKind::Number]);
        assert_eq!(kinds("3.25"), vec![TokenKind::Number]);
        assert_eq!(
            kinds("1 + 2"),
            vec![TokenKind::Number, TokenKind::Operator, TokenKind::Number]
        );
    }

    #[test]
    fn durations() {
        assert_eq!(kinds("2d"), vec![TokenKind::Duration]);
        assert_eq!(kinds("10mins"), vec![TokenKind::Duration]);
        assert_eq!(kinds("weekly"), vec![TokenKind::Duration]);
        // Eight hex digits ending in d stay a uuid prefix.
        assert_eq!(kinds("1234567d"), vec![TokenKind::Uuid]);
    }

    #[test]
    fn dates() {
        assert_eq!(kinds("today"), vec![TokenKind::Date]);
        assert_eq!(kinds("eom"), vec![TokenKind::Date]);
        assert_eq!(kinds("2026-06-01"), vec![TokenKind::Date]);
        assert_eq!(kinds("monday"), vec![TokenKind::Date]);
    }

    #[test]
    fn tags_keep_their_sign() {
        let tokens = lex("+home -work");
        assert_eq!(tokens[0].kind, TokenKind::Tag);
        assert_eq!(tokens[0].lexeme, "+home");
        assert_eq!(tokens[1].kind, TokenKind::Tag);
        assert_eq!(tokens[1].lexeme, "-work");
    }

    #[test]
    fn pairs_plain_modified_and_quoted() {
        assert_eq!(kinds("project:home"), vec![TokenKind::Pair]);
        assert_eq!(kinds("due.before:eom"), vec![TokenKind::Pair]);
        assert_eq!(kinds("priority="), vec![TokenKind::Pair]);

        let tokens = lex("description:\"two words\"");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Pair);
        assert_eq!(tokens[0].lexeme, "description:two words");
        assert!(tokens[0].quoted);
    }

    #[test]
    fn patterns_and_substitutions() {
        assert_eq!(kinds("/needle/"), vec![TokenKind::Pattern]);
        assert_eq!(kinds("/foo/bar/"), vec![TokenKind::Substitution]);
        assert_eq!(kinds("/foo/bar/g"), vec![TokenKind::Substitution]);
    }

    #[test]
    fn sets() {
        assert_eq!(kinds("1,3-5"), vec![TokenKind::Set]);
        assert_eq!(kinds("1-3,5,7-9"), vec![TokenKind::Set]);
        // A lone integer is a number, not a one-element set.
        assert_eq!(kinds("7"), vec![TokenKind::Number]);
    }

    #[test]
    fn operators_longest_first() {
        assert_eq!(
            lex("!== == != ! =").iter().map(|t| t.lexeme.as_str()).collect::<Vec<_>>(),
            vec!["!==", "==", "!=", "!", "="]
        );
        assert_eq!(kinds("and"), vec![TokenKind::Operator]);
        // Word operators need word boundaries.
        assert_eq!(kinds("android"), vec![TokenKind::Identifier]);
    }

    #[test]
    fn dom_references_are_identifiers() {
        assert_eq!(kinds("rc.gc"), vec![TokenKind::Identifier]);
        assert_eq!(kinds("project"), vec![TokenKind::Identifier]);
        assert_eq!(kinds("due_date"), vec![TokenKind::Identifier]);
    }

    #[test]
    fn quoted_strings_remember_quoting() {
        let tokens = lex("\"hello world\"");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, "hello world");
        assert!(tokens[0].quoted);
    }

    #[test]
    fn adjacent_tokens_in_parenthesized_filters() {
        let tokens = lex("(+home or +work)");
        let lexemes: Vec<&str> = tokens.iter().map(|t| t.lexeme.as_str()).collect();
        assert_eq!(lexemes, vec!["(", "+home", "or", "+work", ")"]);
    }

    #[test]
    fn uuid_prefix_lengths() {
        assert_eq!(uuid_prefix_len("deadbeef"), Some(8));
        assert_eq!(uuid_prefix_len("deadbeef-dead"), Some(13));
        assert_eq!(uuid_prefix_len("dead"), None);
        assert_eq!(
            uuid_prefix_len("a0b1c2d3-0000-4000-8000-000000000000"),
            Some(36)
        );
    }

    #[test]
    fn words_for_everything_else() {
        assert_eq!(kinds("@@@"), vec![TokenKind::Word]);
        assert_eq!(kinds("..."), vec![TokenKind::Word]);
    }
}
