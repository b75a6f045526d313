//! Token kinds produced by the lexer.

use crate::position::SourcePosition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Illegal,
    Eof,

    // Literals
    Ident,
    Number,
    String,
    /// One segment of a backtick template string. `is_final` is carried on
    /// the token's payload rather than the kind so the parser can match on
    /// `TokenKind::TemplateStringPart` uniformly.
    TemplateStringPart,
    True,
    False,
    Null,

    // Keywords
    Function,
    Var,
    Const,
    If,
    Else,
    Return,
    While,
    Break,
    For,
    In,
    Continue,
    Import,
    Include,
    Recover,

    // Punctuators
    Comma,
    Semicolon,
    Colon,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Dot,
    Question,

    // Operators
    Assign,
    Plus,
    Minus,
    Bang,
    Asterisk,
    Slash,
    Percent,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eq,
    NotEq,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Tilde,
    LShift,
    RShift,
    PlusPlus,
    MinusMinus,

    // Compound assignment
    PlusAssign,
    MinusAssign,
    AsteriskAssign,
    SlashAssign,
    PercentAssign,
    BitAndAssign,
    BitOrAssign,
    BitXorAssign,
    LShiftAssign,
    RShiftAssign,
}

#[derive(Debug, Clone)]
pub struct Token<'a> {
    pub kind: TokenKind,
    /// Non-owning slice into the source buffer; the source outlives all tokens.
    pub literal: &'a str,
    pub position: SourcePosition,
    /// Set only for `TemplateStringPart`: true when this segment ends with
    /// the closing backtick (no following `${`).
    pub template_final: bool,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind, literal: &'a str, position: SourcePosition) -> Self {
        Self { kind, literal, position, template_final: false }
    }

    pub fn keyword_kind(ident: &str) -> Option<TokenKind> {
        Some(match ident {
            "function" => TokenKind::Function,
            "var" => TokenKind::Var,
            "const" => TokenKind::Const,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "return" => TokenKind::Return,
            "while" => TokenKind::While,
            "break" => TokenKind::Break,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "continue" => TokenKind::Continue,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "null" => TokenKind::Null,
            "import" => TokenKind::Import,
            "include" => TokenKind::Include,
            "recover" => TokenKind::Recover,
            _ => return None,
        })
    }
}
