//! Lexer and token stream for the contract scripting language
//!
//! Converts source text into a flat sequence of typed tokens carrying line
//! and column information. The token stream supports re-serialization back
//! to equivalent source (`dump`), token counting, and slicing/replacing of
//! contiguous token ranges, which the compiler's rewrite pre-pass relies on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted identifier length in bytes
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Lexical error, located at a source line
#[derive(Debug, Clone, PartialEq, Error)]
#[error("syntax error at line {line}: {message}")]
pub struct SyntaxError {
    /// 1-indexed source line
    pub line: usize,
    /// Human-readable description
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Token classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    /// Identifier or non-keyword name
    Name,
    /// Reserved keyword
    Keyword,
    /// Integer literal
    Int,
    /// Floating point literal
    Number,
    /// String literal (text holds the decoded contents)
    Str,
    /// Operator or delimiter
    Operator,
    /// End of input marker
    Eof,
}

/// A single token with its source position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    /// Literal text; for `Str` tokens this is the decoded string contents
    pub text: String,
    /// 1-indexed source line
    pub line: usize,
    /// 1-indexed source column
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            column,
        }
    }

    /// True if this token is the given keyword
    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text == kw
    }

    /// True if this token is the given operator or delimiter
    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }
}

const KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto",
    "if", "in", "let", "local", "nil", "not", "offline", "or", "record", "return", "then", "true",
    "type", "var", "while",
];

/// An ordered, immutable-once-produced sequence of tokens
///
/// Rewrite operations (`replace_range`) produce a new stream rather than
/// mutating tokens in place.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    /// Number of tokens, excluding the trailing EOF marker
    pub fn len(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Slice a contiguous token range (indices into the full sequence)
    pub fn slice(&self, start: usize, end: usize) -> &[Token] {
        &self.tokens[start..end]
    }

    /// Produce a new stream with `start..end` replaced by `replacement`
    pub fn replace_range(&self, start: usize, end: usize, replacement: Vec<Token>) -> TokenStream {
        let mut tokens = Vec::with_capacity(self.tokens.len() - (end - start) + replacement.len());
        tokens.extend_from_slice(&self.tokens[..start]);
        tokens.extend(replacement);
        tokens.extend_from_slice(&self.tokens[end..]);
        TokenStream::new(tokens)
    }

    /// Re-serialize the token stream to equivalent source text
    ///
    /// Line breaks follow the recorded token lines so diagnostics against the
    /// dumped text still point at the original lines.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut line = 1usize;
        let mut first_on_line = true;
        for tok in &self.tokens {
            if tok.kind == TokenKind::Eof {
                break;
            }
            while line < tok.line {
                out.push('\n');
                line += 1;
                first_on_line = true;
            }
            if !first_on_line {
                out.push(' ');
            }
            match tok.kind {
                TokenKind::Str => {
                    out.push('"');
                    for c in tok.text.chars() {
                        match c {
                            '"' => out.push_str("\\\""),
                            '\\' => out.push_str("\\\\"),
                            '\n' => out.push_str("\\n"),
                            '\t' => out.push_str("\\t"),
                            '\r' => out.push_str("\\r"),
                            other => out.push(other),
                        }
                    }
                    out.push('"');
                }
                _ => out.push_str(&tok.text),
            }
            first_on_line = false;
        }
        out
    }
}

/// Tokenize source text
///
/// Fails with a line-located [`SyntaxError`] on malformed literals,
/// unterminated strings or long comments, and over-length identifiers.
pub fn tokenize(source: &str) -> Result<TokenStream, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line, message)
    }

    fn run(mut self) -> Result<TokenStream, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments()?;
            let (line, column) = (self.line, self.column);
            let c = match self.peek() {
                Some(c) => c,
                None => {
                    tokens.push(Token::new(TokenKind::Eof, "", line, column));
                    break;
                }
            };

            let token = if c.is_ascii_alphabetic() || c == '_' {
                self.lex_name(line, column)?
            } else if c.is_ascii_digit() {
                self.lex_number(line, column)?
            } else if c == '"' || c == '\'' {
                self.lex_short_string(line, column)?
            } else if c == '[' && (self.peek_at(1) == Some('[') || self.peek_at(1) == Some('=')) {
                match self.try_long_bracket() {
                    Some(text) => Token::new(TokenKind::Str, text?, line, column),
                    None => self.lex_operator(line, column)?,
                }
            } else {
                self.lex_operator(line, column)?
            };
            tokens.push(token);
        }
        Ok(TokenStream::new(tokens))
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), SyntaxError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.peek_at(1) == Some('-') => {
                    self.bump();
                    self.bump();
                    // long comment form --[[ ... ]]
                    if self.peek() == Some('[')
                        && (self.peek_at(1) == Some('[') || self.peek_at(1) == Some('='))
                    {
                        if let Some(body) = self.try_long_bracket() {
                            body?;
                            continue;
                        }
                    }
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex_name(&mut self, line: usize, column: usize) -> Result<Token, SyntaxError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if text.len() > MAX_IDENTIFIER_LEN {
            return Err(SyntaxError::new(
                line,
                format!("identifier too long ({} > {} bytes)", text.len(), MAX_IDENTIFIER_LEN),
            ));
        }
        let kind = if KEYWORDS.contains(&text.as_str()) {
            TokenKind::Keyword
        } else {
            TokenKind::Name
        };
        Ok(Token::new(kind, text, line, column))
    }

    fn lex_number(&mut self, line: usize, column: usize) -> Result<Token, SyntaxError> {
        let mut text = String::new();
        let mut is_float = false;

        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            text.push(self.bump().unwrap());
            text.push(self.bump().unwrap());
            let mut digits = 0;
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    text.push(c);
                    self.bump();
                    digits += 1;
                } else {
                    break;
                }
            }
            if digits == 0 {
                return Err(self.error("malformed hexadecimal literal"));
            }
            return Ok(Token::new(TokenKind::Int, text, line, column));
        }

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float && self.peek_at(1).map_or(false, |n| n.is_ascii_digit())
            {
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E') && !text.is_empty() {
                // exponent part, optional sign
                let sign_ok = matches!(self.peek_at(1), Some('+') | Some('-'))
                    && self.peek_at(2).map_or(false, |n| n.is_ascii_digit());
                let digit_ok = self.peek_at(1).map_or(false, |n| n.is_ascii_digit());
                if !sign_ok && !digit_ok {
                    return Err(self.error("malformed number literal: empty exponent"));
                }
                is_float = true;
                text.push(c);
                self.bump();
                if sign_ok {
                    text.push(self.bump().unwrap());
                }
                while let Some(n) = self.peek() {
                    if n.is_ascii_digit() {
                        text.push(n);
                        self.bump();
                    } else {
                        break;
                    }
                }
                break;
            } else {
                break;
            }
        }

        // trailing alphabetic garbage such as `3abc`
        if self.peek().map_or(false, |c| c.is_ascii_alphabetic() || c == '_') {
            return Err(self.error(format!("malformed number literal near '{}'", text)));
        }

        let kind = if is_float { TokenKind::Number } else { TokenKind::Int };
        Ok(Token::new(kind, text, line, column))
    }

    fn lex_short_string(&mut self, line: usize, column: usize) -> Result<Token, SyntaxError> {
        let quote = self.bump().unwrap();
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(SyntaxError::new(line, "unterminated string literal")),
                Some('\n') => return Err(SyntaxError::new(line, "unterminated string literal")),
                Some('\\') => {
                    self.bump();
                    let esc = self
                        .bump()
                        .ok_or_else(|| SyntaxError::new(line, "unterminated string literal"))?;
                    match esc {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '\\' => text.push('\\'),
                        '"' => text.push('"'),
                        '\'' => text.push('\''),
                        '0' => text.push('\0'),
                        other => {
                            return Err(self.error(format!("invalid escape sequence '\\{}'", other)))
                        }
                    }
                }
                Some(c) if c == quote => {
                    self.bump();
                    break;
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
        Ok(Token::new(TokenKind::Str, text, line, column))
    }

    /// Attempt a long-bracket form `[[ ... ]]` / `[=[ ... ]=]`
    ///
    /// Returns None when the cursor is not at a long bracket opener; the
    /// cursor is untouched in that case.
    fn try_long_bracket(&mut self) -> Option<Result<String, SyntaxError>> {
        let start_pos = self.pos;
        let (start_line, start_col) = (self.line, self.column);
        if self.peek() != Some('[') {
            return None;
        }
        self.bump();
        let mut level = 0;
        while self.peek() == Some('=') {
            level += 1;
            self.bump();
        }
        if self.peek() != Some('[') {
            self.pos = start_pos;
            self.line = start_line;
            self.column = start_col;
            return None;
        }
        self.bump();
        // leading newline immediately after the opener is dropped, as in Lua
        if self.peek() == Some('\n') {
            self.bump();
        }
        let open_line = start_line;
        let mut text = String::new();
        loop {
            match self.peek() {
                None => {
                    return Some(Err(SyntaxError::new(
                        open_line,
                        "unterminated long bracket",
                    )))
                }
                Some(']') => {
                    let mut ahead = 1;
                    let mut eq = 0;
                    while self.peek_at(ahead) == Some('=') {
                        eq += 1;
                        ahead += 1;
                    }
                    if eq == level && self.peek_at(ahead) == Some(']') {
                        for _ in 0..ahead + 1 {
                            self.bump();
                        }
                        return Some(Ok(text));
                    }
                    text.push(']');
                    self.bump();
                }
                Some(c) => {
                    text.push(c);
                    self.bump();
                }
            }
        }
    }

    fn lex_operator(&mut self, line: usize, column: usize) -> Result<Token, SyntaxError> {
        // longest-match first
        const THREE: &[&str] = &["..."];
        const TWO: &[&str] = &["==", "~=", "<=", ">=", "//", "..", "=>", "::"];
        const ONE: &[&str] = &[
            "+", "-", "*", "/", "%", "^", "#", "<", ">", "=", "(", ")", "{", "}", "[", "]", ";",
            ":", ",", ".", "|", "&", "~",
        ];

        let rest: String = self.chars[self.pos..self.chars.len().min(self.pos + 3)]
            .iter()
            .collect();
        for set in [THREE, TWO, ONE] {
            for op in set {
                if rest.starts_with(op) {
                    for _ in 0..op.len() {
                        self.bump();
                    }
                    return Ok(Token::new(TokenKind::Operator, *op, line, column));
                }
            }
        }
        Err(self.error(format!(
            "unexpected character '{}'",
            rest.chars().next().unwrap_or('?')
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokens() {
        let stream = tokenize("let x: int = 42").unwrap();
        let kinds: Vec<TokenKind> = stream
            .tokens()
            .iter()
            .map(|t| t.kind)
            .filter(|k| *k != TokenKind::Eof)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword,
                TokenKind::Name,
                TokenKind::Operator,
                TokenKind::Name,
                TokenKind::Operator,
                TokenKind::Int,
            ]
        );
        assert_eq!(stream.len(), 6);
    }

    #[test]
    fn test_line_tracking() {
        let stream = tokenize("let a = 1\nlet b = 2").unwrap();
        let b_tok = stream
            .tokens()
            .iter()
            .find(|t| t.text == "b")
            .expect("token b");
        assert_eq!(b_tok.line, 2);
    }

    #[test]
    fn test_string_escapes() {
        let stream = tokenize(r#"let s = "a\nb""#).unwrap();
        let s = stream
            .tokens()
            .iter()
            .find(|t| t.kind == TokenKind::Str)
            .unwrap();
        assert_eq!(s.text, "a\nb");
    }

    #[test]
    fn test_long_string_and_comment() {
        let stream = tokenize("--[[ long\ncomment ]] let s = [[hello\nworld]]").unwrap();
        let s = stream
            .tokens()
            .iter()
            .find(|t| t.kind == TokenKind::Str)
            .unwrap();
        assert_eq!(s.text, "hello\nworld");
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("let s = \"abc").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_unterminated_long_comment() {
        let err = tokenize("--[[ never closed\nlet x = 1").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_overlong_identifier() {
        let name = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        let err = tokenize(&format!("let {} = 1", name)).unwrap_err();
        assert!(err.message.contains("identifier too long"));
    }

    #[test]
    fn test_hex_and_float_literals() {
        let stream = tokenize("0xff 3.25 1e3").unwrap();
        let toks = stream.tokens();
        assert_eq!(toks[0].kind, TokenKind::Int);
        assert_eq!(toks[1].kind, TokenKind::Number);
        assert_eq!(toks[2].kind, TokenKind::Number);
    }

    #[test]
    fn test_dump_round_trip() {
        let source = "let x = 1\nfunction f(a: int): int\nreturn a + x\nend";
        let stream = tokenize(source).unwrap();
        let dumped = stream.dump();
        let restream = tokenize(&dumped).unwrap();
        assert_eq!(stream.len(), restream.len());
        for (a, b) in stream.tokens().iter().zip(restream.tokens()) {
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.text, b.text);
            assert_eq!(a.line, b.line);
        }
    }

    #[test]
    fn test_replace_range() {
        let stream = tokenize("a b c d").unwrap();
        let replaced = stream.replace_range(
            1,
            3,
            vec![Token::new(TokenKind::Name, "x", 1, 1)],
        );
        let texts: Vec<&str> = replaced
            .tokens()
            .iter()
            .filter(|t| t.kind != TokenKind::Eof)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(texts, vec!["a", "x", "d"]);
    }
}
