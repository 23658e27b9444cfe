use crate::error::{Error, Result};

/// Reserved expression keywords (operators and literal words).
const KEYWORDS: &[&str] = &[
    "and", "or", "not", "has", "in", "eq", "ne", "gt", "ge", "lt", "le", "add", "sub", "mul",
    "div", "mod", "null", "true", "false",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Keyword,
    Int,
    Decimal,
    Float,
    Str,
    Date,
    Time,
    DateTimeOffset,
    Duration,
    Guid,
    Geo,
    LParen,
    RParen,
    Comma,
    Slash,
    Eq,
    At,
    Dollar,
    Minus,
    Colon,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub pos: usize,
}

impl Token {
    fn new(kind: TokenKind, lexeme: impl Into<String>, pos: usize) -> Self {
        Token {
            kind,
            lexeme: lexeme.into(),
            pos,
        }
    }

    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Keyword && self.lexeme == kw
    }
}

/// Tokenize a full OData expression. Deterministic and total; errors carry
/// the byte offset of the offending character.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer {
        input: input.as_bytes(),
        text: input,
        pos: 0,
    };
    let mut tokens = Vec::new();
    loop {
        let tok = lexer.next_token()?;
        let done = tok.kind == TokenKind::Eof;
        tokens.push(tok);
        if done {
            return Ok(tokens);
        }
    }
}

struct Lexer<'a> {
    input: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn next_token(&mut self) -> Result<Token> {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        let start = self.pos;
        let Some(&c) = self.input.get(self.pos) else {
            return Ok(Token::new(TokenKind::Eof, "", start));
        };

        match c {
            b'(' => self.single(TokenKind::LParen, "("),
            b')' => self.single(TokenKind::RParen, ")"),
            b',' => self.single(TokenKind::Comma, ","),
            b'/' => self.single(TokenKind::Slash, "/"),
            b'=' => self.single(TokenKind::Eq, "="),
            b'@' => self.single(TokenKind::At, "@"),
            b'$' => self.single(TokenKind::Dollar, "$"),
            b':' => self.single(TokenKind::Colon, ":"),
            b'\'' => self.string_literal(start),
            b'-' => {
                // Minus starts a negative number; otherwise it's unary.
                if self
                    .input
                    .get(self.pos + 1)
                    .is_some_and(|c| c.is_ascii_digit())
                {
                    self.number(start)
                } else {
                    self.single(TokenKind::Minus, "-")
                }
            }
            c if c.is_ascii_digit() => {
                if let Some(tok) = self.try_guid(start) {
                    return Ok(tok);
                }
                if let Some(tok) = self.try_date_or_datetime(start) {
                    return Ok(tok);
                }
                if let Some(tok) = self.try_time(start) {
                    return Ok(tok);
                }
                self.number(start)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                if let Some(tok) = self.try_guid(start) {
                    return Ok(tok);
                }
                self.word(start)
            }
            _ => Err(Error::validation(format!(
                "unexpected character {:?} at offset {start}",
                self.text[start..].chars().next().unwrap_or('?')
            ))),
        }
    }

    fn single(&mut self, kind: TokenKind, lexeme: &str) -> Result<Token> {
        let tok = Token::new(kind, lexeme, self.pos);
        self.pos += 1;
        Ok(tok)
    }

    /// Single-quoted string with `''` as the escape for a literal quote.
    fn string_literal(&mut self, start: usize) -> Result<Token> {
        self.pos += 1;
        let mut value = String::new();
        while self.pos < self.input.len() {
            let c = self.input[self.pos];
            if c == b'\'' {
                if self.input.get(self.pos + 1) == Some(&b'\'') {
                    value.push('\'');
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                return Ok(Token::new(TokenKind::Str, value, start));
            }
            let ch = self.text[self.pos..].chars().next().unwrap_or('\u{fffd}');
            value.push(ch);
            self.pos += ch.len_utf8();
        }
        Err(Error::validation(format!(
            "unterminated string literal at offset {start}"
        )))
    }

    fn number(&mut self, start: usize) -> Result<Token> {
        if self.input[self.pos] == b'-' {
            self.pos += 1;
        }
        while self.peek_digit() {
            self.pos += 1;
        }
        let mut kind = TokenKind::Int;
        if self.input.get(self.pos) == Some(&b'.')
            && self
                .input
                .get(self.pos + 1)
                .is_some_and(|c| c.is_ascii_digit())
        {
            kind = TokenKind::Decimal;
            self.pos += 1;
            while self.peek_digit() {
                self.pos += 1;
            }
        }
        if matches!(self.input.get(self.pos), Some(b'e' | b'E')) {
            let mut ahead = self.pos + 1;
            if matches!(self.input.get(ahead), Some(b'+' | b'-')) {
                ahead += 1;
            }
            if self.input.get(ahead).is_some_and(|c| c.is_ascii_digit()) {
                kind = TokenKind::Float;
                self.pos = ahead;
                while self.peek_digit() {
                    self.pos += 1;
                }
            }
        }
        Ok(Token::new(kind, &self.text[start..self.pos], start))
    }

    fn word(&mut self, start: usize) -> Result<Token> {
        loop {
            match self.input.get(self.pos) {
                Some(c) if c.is_ascii_alphanumeric() || *c == b'_' => self.pos += 1,
                // Dotted identifiers: qualified type and function names
                // (geo.distance, Edm.Int32, NS.SubType).
                Some(b'.')
                    if self
                        .input
                        .get(self.pos + 1)
                        .is_some_and(u8::is_ascii_alphabetic) =>
                {
                    self.pos += 2;
                }
                _ => break,
            }
        }
        let word = &self.text[start..self.pos];

        // Prefixed literals: duration'...', geography'...', geometry'...'.
        if self.input.get(self.pos) == Some(&b'\'') {
            match word {
                "duration" => {
                    let inner = self.string_literal(start)?;
                    return Ok(Token::new(TokenKind::Duration, inner.lexeme, start));
                }
                "geography" | "geometry" => {
                    let inner = self.string_literal(start)?;
                    return Ok(Token::new(
                        TokenKind::Geo,
                        format!("{word}'{}'", inner.lexeme),
                        start,
                    ));
                }
                _ => {}
            }
        }

        if KEYWORDS.contains(&word) {
            Ok(Token::new(TokenKind::Keyword, word, start))
        } else {
            Ok(Token::new(TokenKind::Ident, word, start))
        }
    }

    fn peek_digit(&self) -> bool {
        self.input
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit())
    }

    /// 8-4-4-4-12 hex with dashes. Tried before identifiers and numbers
    /// because a GUID may begin with either a digit or a hex letter.
    fn try_guid(&mut self, start: usize) -> Option<Token> {
        const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
        let mut p = start;
        for (i, len) in GROUPS.iter().enumerate() {
            for _ in 0..*len {
                if !self.input.get(p).is_some_and(u8::is_ascii_hexdigit) {
                    return None;
                }
                p += 1;
            }
            if i < GROUPS.len() - 1 {
                if self.input.get(p) != Some(&b'-') {
                    return None;
                }
                p += 1;
            }
        }
        // A trailing identifier or hex character means it was not a GUID.
        if self
            .input
            .get(p)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_' || *c == b'-')
        {
            return None;
        }
        let tok = Token::new(TokenKind::Guid, &self.text[start..p], start);
        self.pos = p;
        Some(tok)
    }

    /// `YYYY-MM-DD`, optionally followed by `THH:MM[:SS[.f]]` and a zone.
    fn try_date_or_datetime(&mut self, start: usize) -> Option<Token> {
        let mut p = start;
        if !self.digits(&mut p, 4) || !self.expect(&mut p, b'-') {
            return None;
        }
        if !self.digits(&mut p, 2) || !self.expect(&mut p, b'-') {
            return None;
        }
        if !self.digits(&mut p, 2) {
            return None;
        }
        if self.input.get(p) != Some(&b'T') {
            let tok = Token::new(TokenKind::Date, &self.text[start..p], start);
            self.pos = p;
            return Some(tok);
        }
        p += 1;
        if !self.digits(&mut p, 2) || !self.expect(&mut p, b':') || !self.digits(&mut p, 2) {
            return None;
        }
        if self.input.get(p) == Some(&b':') {
            p += 1;
            if !self.digits(&mut p, 2) {
                return None;
            }
            if self.input.get(p) == Some(&b'.') {
                p += 1;
                let frac = p;
                while self.input.get(p).is_some_and(u8::is_ascii_digit) {
                    p += 1;
                }
                if p == frac {
                    return None;
                }
            }
        }
        // Zone: Z or +hh:mm / -hh:mm.
        match self.input.get(p) {
            Some(b'Z') => p += 1,
            Some(b'+' | b'-') => {
                p += 1;
                if !self.digits(&mut p, 2) || !self.expect(&mut p, b':') || !self.digits(&mut p, 2)
                {
                    return None;
                }
            }
            _ => return None,
        }
        let tok = Token::new(TokenKind::DateTimeOffset, &self.text[start..p], start);
        self.pos = p;
        Some(tok)
    }

    /// `HH:MM:SS[.f]`.
    fn try_time(&mut self, start: usize) -> Option<Token> {
        let mut p = start;
        if !self.digits(&mut p, 2) || !self.expect(&mut p, b':') {
            return None;
        }
        if !self.digits(&mut p, 2) || !self.expect(&mut p, b':') || !self.digits(&mut p, 2) {
            return None;
        }
        if self.input.get(p) == Some(&b'.') {
            p += 1;
            let frac = p;
            while self.input.get(p).is_some_and(u8::is_ascii_digit) {
                p += 1;
            }
            if p == frac {
                return None;
            }
        }
        let tok = Token::new(TokenKind::Time, &self.text[start..p], start);
        self.pos = p;
        Some(tok)
    }

    fn digits(&self, p: &mut usize, n: usize) -> bool {
        for _ in 0..n {
            if !self.input.get(*p).is_some_and(u8::is_ascii_digit) {
                return false;
            }
            *p += 1;
        }
        true
    }

    fn expect(&self, p: &mut usize, c: u8) -> bool {
        if self.input.get(*p) == Some(&c) {
            *p += 1;
            true
        } else {
            false
        }
    }
}
