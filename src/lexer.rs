//! Byte-stream lexer: source text → token stream with source positions and
//! template-string continuation.

use std::rc::Rc;

use crate::errors::{ApeError, ErrorKind};
use crate::position::{CompilationFile, SourcePosition};
use crate::token::{Token, TokenKind};

#[derive(Clone, Copy)]
struct RawPos {
    position: usize,
    read_position: usize,
    ch: Option<u8>,
    line: u32,
    column: u32,
}

/// Byte-oriented lexer with two-token lookahead (`cur`/`peek`) and a single
/// level of rewind used to re-enter template-string scanning after an
/// embedded `${expr}` has been parsed.
pub struct Lexer<'a> {
    source: &'a [u8],
    text: &'a str,
    file: Rc<CompilationFile>,

    position: usize,
    read_position: usize,
    ch: Option<u8>,
    line: u32,
    column: u32,

    /// Raw cursor snapshot taken immediately before `peek` was scanned.
    pre_peek: RawPos,
    rewind_available: bool,
    /// One-shot flag: the next scan performed to (re)fill `peek` should be
    /// treated as a template-string segment continuation rather than code.
    resume_template: bool,

    pub cur: Token<'a>,
    pub peek: Token<'a>,

    pub errors: Vec<ApeError>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file: Rc<CompilationFile>) -> Self {
        let mut lex = Self {
            source: source.as_bytes(),
            text: source,
            file,
            position: 0,
            read_position: 0,
            ch: None,
            line: 0,
            column: 0,
            pre_peek: RawPos { position: 0, read_position: 0, ch: None, line: 0, column: 0 },
            rewind_available: false,
            resume_template: false,
            cur: Token::new(TokenKind::Eof, "", SourcePosition::synthetic(CompilationFile::new("", ""))),
            peek: Token::new(TokenKind::Eof, "", SourcePosition::synthetic(CompilationFile::new("", ""))),
            errors: Vec::new(),
        };
        lex.read_char();
        // Two priming reads populate cur and peek.
        lex.cur = lex.scan();
        lex.pre_peek = lex.snapshot();
        lex.peek = lex.scan();
        lex
    }

    fn snapshot(&self) -> RawPos {
        RawPos { position: self.position, read_position: self.read_position, ch: self.ch, line: self.line, column: self.column }
    }

    fn restore(&mut self, snap: RawPos) {
        self.position = snap.position;
        self.read_position = snap.read_position;
        self.ch = snap.ch;
        self.line = snap.line;
        self.column = snap.column;
    }

    /// Advances by one token. After this call `cur` and `peek` are valid
    /// until the next call.
    pub fn advance(&mut self) {
        self.cur = std::mem::replace(&mut self.peek, Token::new(TokenKind::Eof, "", self.cur.position.clone()));
        self.pre_peek = self.snapshot();
        self.peek = self.scan();
        self.rewind_available = true;
    }

    /// Undoes the most recent `advance` once. A second rewind without an
    /// intervening advance fails (returns `false`).
    pub fn rewind(&mut self) -> bool {
        if !self.rewind_available {
            return false;
        }
        self.restore(self.pre_peek);
        self.rewind_available = false;
        true
    }

    /// Tells the lexer that the text starting at the current raw cursor
    /// (immediately after the `}` closing a `${...}` interpolation) is a
    /// template-string literal segment, not code. Call `rewind()` first,
    /// then this, then `advance()` to pull the segment into `cur`.
    pub fn resume_template_string(&mut self) {
        self.resume_template = true;
        self.peek = self.scan();
    }

    fn current_pos(&self) -> SourcePosition {
        SourcePosition::new(self.file.clone(), self.line, self.column)
    }

    fn read_char(&mut self) {
        self.ch = self.source.get(self.read_position).copied();
        self.position = self.read_position;
        self.read_position += 1;
        if let Some(b'\n') = self.ch {
            // column/line updated on next advance past the newline
        }
    }

    fn advance_char(&mut self) {
        if self.ch == Some(b'\n') {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        self.read_char();
    }

    fn peek_char(&self) -> Option<u8> {
        self.source.get(self.read_position).copied()
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.ch {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => self.advance_char(),
                Some(b'/') if self.peek_char() == Some(b'/') => {
                    while self.ch.is_some() && self.ch != Some(b'\n') {
                        self.advance_char();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan(&mut self) -> Token<'a> {
        if std::mem::take(&mut self.resume_template) {
            return self.scan_template_segment(false);
        }
        self.scan_normal()
    }

    fn scan_normal(&mut self) -> Token<'a> {
        self.skip_whitespace_and_comments();
        let pos = self.current_pos();
        let ch = match self.ch {
            None => return Token::new(TokenKind::Eof, "", pos),
            Some(c) => c,
        };

        macro_rules! one {
            ($kind:expr) => {{
                let start = self.position;
                self.advance_char();
                Token::new($kind, &self.text[start..self.position.min(self.text.len())], pos)
            }};
        }
        macro_rules! two_or_one {
            ($second:expr, $two_kind:expr, $one_kind:expr) => {{
                let start = self.position;
                self.advance_char();
                if self.ch == Some($second) {
                    self.advance_char();
                    Token::new($two_kind, &self.text[start..self.position], pos)
                } else {
                    Token::new($one_kind, &self.text[start..self.position], pos)
                }
            }};
        }

        match ch {
            b'=' => two_or_one!(b'=', TokenKind::Eq, TokenKind::Assign),
            b'+' => {
                let start = self.position;
                self.advance_char();
                match self.ch {
                    Some(b'+') => {
                        self.advance_char();
                        Token::new(TokenKind::PlusPlus, &self.text[start..self.position], pos)
                    }
                    Some(b'=') => {
                        self.advance_char();
                        Token::new(TokenKind::PlusAssign, &self.text[start..self.position], pos)
                    }
                    _ => Token::new(TokenKind::Plus, &self.text[start..self.position], pos),
                }
            }
            b'-' => {
                let start = self.position;
                self.advance_char();
                match self.ch {
                    Some(b'-') => {
                        self.advance_char();
                        Token::new(TokenKind::MinusMinus, &self.text[start..self.position], pos)
                    }
                    Some(b'=') => {
                        self.advance_char();
                        Token::new(TokenKind::MinusAssign, &self.text[start..self.position], pos)
                    }
                    _ => Token::new(TokenKind::Minus, &self.text[start..self.position], pos),
                }
            }
            b'!' => two_or_one!(b'=', TokenKind::NotEq, TokenKind::Bang),
            b'*' => two_or_one!(b'=', TokenKind::AsteriskAssign, TokenKind::Asterisk),
            b'/' => two_or_one!(b'=', TokenKind::SlashAssign, TokenKind::Slash),
            b'%' => two_or_one!(b'=', TokenKind::PercentAssign, TokenKind::Percent),
            b'^' => two_or_one!(b'=', TokenKind::BitXorAssign, TokenKind::BitXor),
            b'~' => one!(TokenKind::Tilde),
            b'<' => {
                let start = self.position;
                self.advance_char();
                match self.ch {
                    Some(b'=') => {
                        self.advance_char();
                        Token::new(TokenKind::LtEq, &self.text[start..self.position], pos)
                    }
                    Some(b'<') => {
                        self.advance_char();
                        if self.ch == Some(b'=') {
                            self.advance_char();
                            Token::new(TokenKind::LShiftAssign, &self.text[start..self.position], pos)
                        } else {
                            Token::new(TokenKind::LShift, &self.text[start..self.position], pos)
                        }
                    }
                    _ => Token::new(TokenKind::Lt, &self.text[start..self.position], pos),
                }
            }
            b'>' => {
                let start = self.position;
                self.advance_char();
                match self.ch {
                    Some(b'=') => {
                        self.advance_char();
                        Token::new(TokenKind::GtEq, &self.text[start..self.position], pos)
                    }
                    Some(b'>') => {
                        self.advance_char();
                        if self.ch == Some(b'=') {
                            self.advance_char();
                            Token::new(TokenKind::RShiftAssign, &self.text[start..self.position], pos)
                        } else {
                            Token::new(TokenKind::RShift, &self.text[start..self.position], pos)
                        }
                    }
                    _ => Token::new(TokenKind::Gt, &self.text[start..self.position], pos),
                }
            }
            b'&' => {
                let start = self.position;
                self.advance_char();
                match self.ch {
                    Some(b'&') => {
                        self.advance_char();
                        Token::new(TokenKind::And, &self.text[start..self.position], pos)
                    }
                    Some(b'=') => {
                        self.advance_char();
                        Token::new(TokenKind::BitAndAssign, &self.text[start..self.position], pos)
                    }
                    _ => Token::new(TokenKind::BitAnd, &self.text[start..self.position], pos),
                }
            }
            b'|' => {
                let start = self.position;
                self.advance_char();
                match self.ch {
                    Some(b'|') => {
                        self.advance_char();
                        Token::new(TokenKind::Or, &self.text[start..self.position], pos)
                    }
                    Some(b'=') => {
                        self.advance_char();
                        Token::new(TokenKind::BitOrAssign, &self.text[start..self.position], pos)
                    }
                    _ => Token::new(TokenKind::BitOr, &self.text[start..self.position], pos),
                }
            }
            b',' => one!(TokenKind::Comma),
            b';' => one!(TokenKind::Semicolon),
            b':' => one!(TokenKind::Colon),
            b'(' => one!(TokenKind::LParen),
            b')' => one!(TokenKind::RParen),
            b'{' => one!(TokenKind::LBrace),
            b'}' => one!(TokenKind::RBrace),
            b'[' => one!(TokenKind::LBracket),
            b']' => one!(TokenKind::RBracket),
            b'.' => one!(TokenKind::Dot),
            b'?' => one!(TokenKind::Question),
            b'"' | b'\'' => self.scan_string(ch),
            b'`' => {
                self.advance_char();
                self.scan_template_segment(true)
            }
            _ if ch.is_ascii_digit() => self.scan_number(),
            _ if ch.is_ascii_alphabetic() || ch == b'_' => self.scan_ident(),
            _ => {
                let start = self.position;
                self.advance_char();
                let literal = &self.text[start..self.position.min(self.text.len())];
                self.errors.push(ApeError::new(ErrorKind::Parsing, format!("illegal character '{literal}'"), pos.clone()));
                Token::new(TokenKind::Illegal, literal, pos)
            }
        }
    }

    /// `[A-Za-z_][A-Za-z0-9_]*`, with `::` permitted inside for
    /// namespace-qualified names. A single `:` terminates the identifier.
    fn scan_ident(&mut self) -> Token<'a> {
        let pos = self.current_pos();
        let start = self.position;
        loop {
            match self.ch {
                Some(c) if c.is_ascii_alphanumeric() || c == b'_' => self.advance_char(),
                Some(b':') if self.peek_char() == Some(b':') => {
                    self.advance_char();
                    self.advance_char();
                }
                _ => break,
            }
        }
        let literal = &self.text[start..self.position];
        let kind = Token::keyword_kind(literal).unwrap_or(TokenKind::Ident);
        Token::new(kind, literal, pos)
    }

    /// Greedy digit-plus-suffix scan; accepts decimal/hex/float forms
    /// without validating. Numeric validation is deferred to the parser.
    fn scan_number(&mut self) -> Token<'a> {
        let pos = self.current_pos();
        let start = self.position;
        loop {
            match self.ch {
                Some(c) if c.is_ascii_digit() => self.advance_char(),
                Some(b'.' | b'x' | b'X' | b'a' | b'A' | b'b' | b'B' | b'c' | b'C' | b'd' | b'D' | b'e' | b'E' | b'f' | b'F') => {
                    self.advance_char();
                }
                _ => break,
            }
        }
        Token::new(TokenKind::Number, &self.text[start..self.position], pos)
    }

    fn scan_string(&mut self, quote: u8) -> Token<'a> {
        let pos = self.current_pos();
        self.advance_char(); // consume opening quote
        let start = self.position;
        while let Some(c) = self.ch {
            if c == b'\\' {
                self.advance_char();
                if self.ch.is_some() {
                    self.advance_char();
                }
                continue;
            }
            if c == quote {
                break;
            }
            self.advance_char();
        }
        let literal = &self.text[start..self.position];
        if self.ch == Some(quote) {
            self.advance_char();
        } else {
            self.errors.push(ApeError::new(ErrorKind::Parsing, "unterminated string literal".into(), pos.clone()));
        }
        Token::new(TokenKind::String, literal, pos)
    }

    /// Scans a template-string segment: raw text up to `${` (interpolation
    /// follows) or the closing backtick (segment is final). When
    /// `consume_leading_backtick` is false, the caller's raw cursor is
    /// already positioned right after a `}` that closed an interpolation.
    fn scan_template_segment(&mut self, consume_leading_backtick: bool) -> Token<'a> {
        let pos = self.current_pos();
        let _ = consume_leading_backtick;
        let start = self.position;
        let mut final_segment = true;
        loop {
            match self.ch {
                None => {
                    self.errors.push(ApeError::new(ErrorKind::Parsing, "unterminated template string".into(), pos.clone()));
                    break;
                }
                Some(b'`') => {
                    self.advance_char();
                    break;
                }
                Some(b'$') if self.peek_char() == Some(b'{') => {
                    final_segment = false;
                    self.advance_char();
                    self.advance_char();
                    break;
                }
                Some(b'\\') => {
                    self.advance_char();
                    if self.ch.is_some() {
                        self.advance_char();
                    }
                }
                Some(_) => self.advance_char(),
            }
        }
        let end = if final_segment { self.position.saturating_sub(1) } else { self.position.saturating_sub(2) };
        let mut tok = Token::new(TokenKind::TemplateStringPart, &self.text[start..end.max(start)], pos);
        tok.template_final = final_segment;
        tok
    }
}
