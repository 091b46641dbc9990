//! Tokenizer shared by the policy and schema text parsers.

use std::fmt::{Display, Formatter, Result as FmtResult};

use crate::ast::PatternElem;
use crate::error::PolicyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident(String),
    /// Raw string body between the quotes, escapes not yet processed.
    Str(String),
    Int(u64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Colon,
    PathSep,
    Dot,
    At,
    Question,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    AndAnd,
    OrOr,
    Bang,
    Plus,
    Minus,
    Star,
    Eof,
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TokenKind::Ident(name) => write!(f, "`{name}`"),
            TokenKind::Str(raw) => write!(f, "string \"{raw}\""),
            TokenKind::Int(n) => write!(f, "integer {n}"),
            TokenKind::Eof => write!(f, "end of input"),
            other => write!(f, "`{}`", other.symbol()),
        }
    }
}

impl TokenKind {
    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Semi => ";",
            TokenKind::Colon => ":",
            TokenKind::PathSep => "::",
            TokenKind::Dot => ".",
            TokenKind::At => "@",
            TokenKind::Question => "?",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Less => "<",
            TokenKind::LessEq => "<=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEq => ">=",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Bang => "!",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Ident(_) | TokenKind::Str(_) | TokenKind::Int(_) | TokenKind::Eof => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) start: usize,
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, PolicyError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        if c == b'/' && bytes.get(pos + 1) == Some(&b'/') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }

        let start = pos;
        let two = |next: u8| bytes.get(pos + 1) == Some(&next);
        let (kind, len) = match c {
            b'(' => (TokenKind::LParen, 1),
            b')' => (TokenKind::RParen, 1),
            b'{' => (TokenKind::LBrace, 1),
            b'}' => (TokenKind::RBrace, 1),
            b'[' => (TokenKind::LBracket, 1),
            b']' => (TokenKind::RBracket, 1),
            b',' => (TokenKind::Comma, 1),
            b';' => (TokenKind::Semi, 1),
            b'.' => (TokenKind::Dot, 1),
            b'@' => (TokenKind::At, 1),
            b'?' => (TokenKind::Question, 1),
            b'+' => (TokenKind::Plus, 1),
            b'-' => (TokenKind::Minus, 1),
            b'*' => (TokenKind::Star, 1),
            b':' if two(b':') => (TokenKind::PathSep, 2),
            b':' => (TokenKind::Colon, 1),
            b'=' if two(b'=') => (TokenKind::EqEq, 2),
            b'!' if two(b'=') => (TokenKind::NotEq, 2),
            b'!' => (TokenKind::Bang, 1),
            b'<' if two(b'=') => (TokenKind::LessEq, 2),
            b'<' => (TokenKind::Less, 1),
            b'>' if two(b'=') => (TokenKind::GreaterEq, 2),
            b'>' => (TokenKind::Greater, 1),
            b'&' if two(b'&') => (TokenKind::AndAnd, 2),
            b'|' if two(b'|') => (TokenKind::OrOr, 2),
            b'"' => {
                let mut end = pos + 1;
                loop {
                    match bytes.get(end) {
                        None => {
                            return Err(PolicyError::syntax(
                                input,
                                start,
                                "unterminated string literal",
                            ));
                        }
                        Some(b'\\') => end += 2,
                        Some(b'"') => break,
                        Some(_) => end += 1,
                    }
                }
                let raw = input[pos + 1..end].to_string();
                (TokenKind::Str(raw), end + 1 - pos)
            }
            b'0'..=b'9' => {
                let mut end = pos;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let digits = &input[pos..end];
                let value: u64 = digits.parse().map_err(|_| {
                    PolicyError::syntax(input, start, format!("integer literal {digits} is too large"))
                })?;
                (TokenKind::Int(value), end - pos)
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let mut end = pos;
                while end < bytes.len() && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric())
                {
                    end += 1;
                }
                (TokenKind::Ident(input[pos..end].to_string()), end - pos)
            }
            _ => {
                let ch = input[pos..].chars().next().unwrap_or('?');
                return Err(PolicyError::syntax(
                    input,
                    start,
                    format!("unexpected character `{ch}`"),
                ));
            }
        };
        tokens.push(Token { kind, start });
        pos += len;
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        start: input.len(),
    });
    Ok(tokens)
}

pub(crate) fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Decode the escapes of a raw string token body.
pub(crate) fn unescape(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(decode_escape(&mut chars, false)?.unwrap_or('*'));
    }
    Ok(out)
}

/// Decode a `like` pattern body: unescaped `*` is a wildcard, `\*` a literal star.
pub(crate) fn unescape_pattern(raw: &str) -> Result<Vec<PatternElem>, String> {
    let mut out = Vec::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push(PatternElem::Wildcard),
            '\\' => out.push(PatternElem::Char(decode_escape(&mut chars, true)?.unwrap_or('*'))),
            c => out.push(PatternElem::Char(c)),
        }
    }
    Ok(out)
}

/// Returns `Ok(None)` for `\*`, which is only meaningful inside patterns.
fn decode_escape(chars: &mut std::str::Chars<'_>, in_pattern: bool) -> Result<Option<char>, String> {
    let decoded = match chars.next() {
        Some('n') => '\n',
        Some('r') => '\r',
        Some('t') => '\t',
        Some('0') => '\0',
        Some('\\') => '\\',
        Some('"') => '"',
        Some('\'') => '\'',
        Some('*') if in_pattern => return Ok(None),
        Some('u') => {
            if chars.next() != Some('{') {
                return Err("expected `{` after `\\u`".to_string());
            }
            let mut hex = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(h) if h.is_ascii_hexdigit() && hex.len() < 6 => hex.push(h),
                    _ => return Err("malformed unicode escape".to_string()),
                }
            }
            u32::from_str_radix(&hex, 16)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| format!("invalid unicode scalar \\u{{{hex}}}"))?
        }
        Some(other) => return Err(format!("unknown escape sequence `\\{other}`")),
        None => return Err("dangling `\\` at end of string".to_string()),
    };
    Ok(Some(decoded))
}

/// Render `s` as the body of a double-quoted literal.
pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        push_escaped(&mut out, c);
    }
    out
}

pub(crate) fn escape_pattern(elems: &[PatternElem]) -> String {
    let mut out = String::new();
    for elem in elems {
        match elem {
            PatternElem::Wildcard => out.push('*'),
            PatternElem::Char('*') => out.push_str("\\*"),
            PatternElem::Char(c) => push_escaped(&mut out, *c),
        }
    }
    out
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        '\0' => out.push_str("\\0"),
        c if c.is_control() => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
        c => out.push(c),
    }
}
