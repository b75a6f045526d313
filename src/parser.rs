//! Pratt/precedence-climbing parser: token stream → `Expression` AST
//! (spec.md §4.2). Grounded on `ouros/src/parser` precedence-table shape,
//! adapted to this language's statement set and desugarings.

use crate::ast::*;
use crate::errors::{ApeError, ErrorKind};
use crate::lexer::Lexer;
use crate::position::SourcePosition;
use crate::token::TokenKind;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Prec {
    Lowest,
    Assign,
    Ternary,
    LogicalOr,
    LogicalAnd,
    BitOr,
    BitXor,
    BitAnd,
    Equals,
    LessGreater,
    Shift,
    Sum,
    Product,
    Prefix,
    IncDec,
    Postfix,
}

fn infix_precedence(kind: TokenKind) -> Prec {
    use TokenKind::*;
    match kind {
        Assign | PlusAssign | MinusAssign | AsteriskAssign | SlashAssign | PercentAssign
        | BitAndAssign | BitOrAssign | BitXorAssign | LShiftAssign | RShiftAssign => Prec::Assign,
        Question => Prec::Ternary,
        Or => Prec::LogicalOr,
        And => Prec::LogicalAnd,
        BitOr => Prec::BitOr,
        BitXor => Prec::BitXor,
        BitAnd => Prec::BitAnd,
        Eq | NotEq => Prec::Equals,
        Lt | LtEq | Gt | GtEq => Prec::LessGreater,
        LShift | RShift => Prec::Shift,
        Plus | Minus => Prec::Sum,
        Asterisk | Slash | Percent => Prec::Product,
        PlusPlus | MinusMinus => Prec::IncDec,
        LParen | LBracket | Dot => Prec::Postfix,
        _ => Prec::Lowest,
    }
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    pub errors: crate::errors::ErrorList,
}

impl<'a> Parser<'a> {
    pub fn new(lexer: Lexer<'a>) -> Self {
        Self { lexer, errors: crate::errors::ErrorList::new() }
    }

    fn pos(&self) -> SourcePosition {
        self.lexer.cur.position.clone()
    }

    fn advance(&mut self) {
        self.lexer.advance();
    }

    fn cur_is(&self, kind: TokenKind) -> bool {
        self.lexer.cur.kind == kind
    }

    fn peek_is(&self, kind: TokenKind) -> bool {
        self.lexer.peek.kind == kind
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(ApeError::new(ErrorKind::Parsing, msg.into(), self.pos()));
    }

    /// Advances past `cur` if `peek` matches `kind`, else records an error
    /// and leaves the cursor where it is.
    fn expect_peek(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.peek_is(kind) {
            self.advance();
            true
        } else {
            self.error(format!("expected {what}, got {:?}", self.lexer.peek.kind));
            false
        }
    }

    pub fn parse_program(&mut self) -> Block {
        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::Eof) {
            if let Some(stmt) = self.parse_statement() {
                statements.push(stmt);
            }
            self.advance();
        }
        Block { statements }
    }

    fn parse_block(&mut self) -> Block {
        // cur is the opening `{`.
        self.advance();
        let mut statements = Vec::new();
        while !self.cur_is(TokenKind::RBrace) && !self.cur_is(TokenKind::Eof) {
            if let Some(stmt) = self.parse_statement() {
                statements.push(stmt);
            }
            self.advance();
        }
        Block { statements }
    }

    fn parse_statement(&mut self) -> Option<Expression> {
        match self.lexer.cur.kind {
            TokenKind::Var => self.parse_define(true),
            TokenKind::Const => self.parse_define(false),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break => {
                let pos = self.pos();
                Some(Expression::new(ExpressionKind::Break, pos))
            }
            TokenKind::Continue => {
                let pos = self.pos();
                Some(Expression::new(ExpressionKind::Continue, pos))
            }
            TokenKind::Return => self.parse_return(),
            TokenKind::Function if self.peek_is(TokenKind::Ident) => self.parse_function_statement(),
            TokenKind::Include => self.parse_include(),
            TokenKind::Recover => self.parse_recover(),
            TokenKind::LBrace => {
                let pos = self.pos();
                Some(Expression::new(ExpressionKind::Block(self.parse_block()), pos))
            }
            TokenKind::Semicolon => None,
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_define(&mut self, assignable: bool) -> Option<Expression> {
        let pos = self.pos();
        if !self.expect_peek(TokenKind::Ident, "identifier") {
            return None;
        }
        let name = Identifier { name: self.lexer.cur.literal.to_string(), position: self.pos() };
        if !self.expect_peek(TokenKind::Assign, "'='") {
            return None;
        }
        self.advance();
        let value = self.parse_expression(Prec::Lowest)?;
        if self.peek_is(TokenKind::Semicolon) {
            self.advance();
        }
        Some(Expression::new(
            ExpressionKind::Define { name, value: Box::new(value), assignable },
            pos,
        ))
    }

    fn parse_if(&mut self) -> Option<Expression> {
        let pos = self.pos();
        let mut cases = Vec::new();
        if !self.expect_peek(TokenKind::LParen, "'('") {
            return None;
        }
        self.advance();
        let test = self.parse_expression(Prec::Lowest)?;
        if !self.expect_peek(TokenKind::RParen, "')'") {
            return None;
        }
        if !self.expect_peek(TokenKind::LBrace, "'{'") {
            return None;
        }
        let consequence = self.parse_block();
        cases.push(IfCase { test: Box::new(test), consequence });

        let mut alternative = None;
        while self.peek_is(TokenKind::Else) {
            self.advance();
            if self.peek_is(TokenKind::If) {
                self.advance();
                if !self.expect_peek(TokenKind::LParen, "'('") {
                    return None;
                }
                self.advance();
                let test = self.parse_expression(Prec::Lowest)?;
                if !self.expect_peek(TokenKind::RParen, "')'") {
                    return None;
                }
                if !self.expect_peek(TokenKind::LBrace, "'{'") {
                    return None;
                }
                let consequence = self.parse_block();
                cases.push(IfCase { test: Box::new(test), consequence });
            } else {
                if !self.expect_peek(TokenKind::LBrace, "'{'") {
                    return None;
                }
                alternative = Some(self.parse_block());
                break;
            }
        }
        Some(Expression::new(ExpressionKind::If { cases, alternative }, pos))
    }

    fn parse_while(&mut self) -> Option<Expression> {
        let pos = self.pos();
        if !self.expect_peek(TokenKind::LParen, "'('") {
            return None;
        }
        self.advance();
        let test = self.parse_expression(Prec::Lowest)?;
        if !self.expect_peek(TokenKind::RParen, "')'") {
            return None;
        }
        if !self.expect_peek(TokenKind::LBrace, "'{'") {
            return None;
        }
        let body = self.parse_block();
        Some(Expression::new(ExpressionKind::While { test: Box::new(test), body }, pos))
    }

    fn parse_for(&mut self) -> Option<Expression> {
        let pos = self.pos();
        if !self.expect_peek(TokenKind::LParen, "'('") {
            return None;
        }
        // Disambiguate `for (x in src)` from `for (init; test; update)` by
        // peeking for `in` after the leading identifier.
        if self.peek_is(TokenKind::Ident) {
            let checkpoint_ident = self.lexer.peek.literal.to_string();
            let checkpoint_pos = self.lexer.peek.position.clone();
            self.advance(); // cur = ident
            if self.peek_is(TokenKind::In) {
                self.advance(); // cur = in
                self.advance();
                let source = self.parse_expression(Prec::Lowest)?;
                if !self.expect_peek(TokenKind::RParen, "')'") {
                    return None;
                }
                if !self.expect_peek(TokenKind::LBrace, "'{'") {
                    return None;
                }
                let body = self.parse_block();
                return Some(Expression::new(
                    ExpressionKind::ForEach {
                        iterator: Identifier { name: checkpoint_ident, position: checkpoint_pos },
                        source: Box::new(source),
                        body,
                    },
                    pos,
                ));
            }
            // Not a foreach: cur currently sits on the identifier; rewind the
            // parse by treating it as the start of the init-statement. Since
            // we already consumed the ident token, re-drive init parsing
            // from here via the classic-for path below, using cur as-is.
            return self.parse_classic_for_from_ident(pos);
        }
        self.advance();
        self.parse_classic_for_inner(pos, None)
    }

    fn parse_for_init(&mut self) -> Option<Expression> {
        match self.lexer.cur.kind {
            TokenKind::Var => self.parse_define(true),
            TokenKind::Const => self.parse_define(false),
            _ => self.parse_expression_statement(),
        }
    }

    /// `cur` is the loop variable's identifier, already consumed, for the
    /// classic-for path entered after a failed foreach lookahead.
    fn parse_classic_for_from_ident(&mut self, pos: SourcePosition) -> Option<Expression> {
        let init = self.parse_expression_statement()?;
        self.parse_classic_for_inner(pos, Some(init))
    }

    fn parse_classic_for_inner(&mut self, pos: SourcePosition, init: Option<Expression>) -> Option<Expression> {
        let init = match init {
            Some(i) => Some(i),
            None if !self.cur_is(TokenKind::Semicolon) => self.parse_for_init(),
            None => None,
        };
        if !self.cur_is(TokenKind::Semicolon) {
            self.error("expected ';' after for-loop initializer");
            return None;
        }
        self.advance();
        let test = if !self.cur_is(TokenKind::Semicolon) {
            Some(self.parse_expression(Prec::Lowest)?)
        } else {
            None
        };
        if !self.expect_peek(TokenKind::Semicolon, "';'") {
            return None;
        }
        self.advance();
        let update = if !self.cur_is(TokenKind::RParen) {
            Some(self.parse_expression(Prec::Lowest)?)
        } else {
            None
        };
        if !self.expect_peek(TokenKind::RParen, "')'") {
            return None;
        }
        if !self.expect_peek(TokenKind::LBrace, "'{'") {
            return None;
        }
        let body = self.parse_block();
        Some(Expression::new(
            ExpressionKind::For {
                init: init.map(Box::new),
                test: test.map(Box::new),
                update: update.map(Box::new),
                body,
            },
            pos,
        ))
    }

    fn parse_return(&mut self) -> Option<Expression> {
        let pos = self.pos();
        if self.peek_is(TokenKind::Semicolon) || self.peek_is(TokenKind::RBrace) {
            return Some(Expression::new(ExpressionKind::Return(None), pos));
        }
        self.advance();
        let value = self.parse_expression(Prec::Lowest)?;
        if self.peek_is(TokenKind::Semicolon) {
            self.advance();
        }
        Some(Expression::new(ExpressionKind::Return(Some(Box::new(value))), pos))
    }

    fn parse_function_statement(&mut self) -> Option<Expression> {
        let pos = self.pos();
        self.advance(); // cur = function name ident
        let name = self.lexer.cur.literal.to_string();
        let literal = self.parse_function_literal_rest(pos.clone(), Some(name.clone()))?;
        let def_pos = pos;
        Some(Expression::new(
            ExpressionKind::Define {
                name: Identifier { name, position: def_pos.clone() },
                value: Box::new(literal),
                assignable: false,
            },
            def_pos,
        ))
    }

    fn parse_function_literal(&mut self) -> Option<Expression> {
        let pos = self.pos();
        self.parse_function_literal_rest(pos, None)
    }

    /// `cur` is positioned on the function name (named form) or the
    /// `function` keyword itself (anonymous form) when this is called;
    /// either way the next token must be `(`.
    fn parse_function_literal_rest(&mut self, pos: SourcePosition, name: Option<String>) -> Option<Expression> {
        if !self.expect_peek(TokenKind::LParen, "'('") {
            return None;
        }
        let mut params = Vec::new();
        if !self.peek_is(TokenKind::RParen) {
            self.advance();
            params.push(Identifier { name: self.lexer.cur.literal.to_string(), position: self.pos() });
            while self.peek_is(TokenKind::Comma) {
                self.advance();
                self.advance();
                params.push(Identifier { name: self.lexer.cur.literal.to_string(), position: self.pos() });
            }
        }
        if !self.expect_peek(TokenKind::RParen, "')'") {
            return None;
        }
        if !self.expect_peek(TokenKind::LBrace, "'{'") {
            return None;
        }
        let body = self.parse_block();
        Some(Expression::new(
            ExpressionKind::FunctionLiteral(FunctionLiteral { name, params, body, position: pos.clone() }),
            pos,
        ))
    }

    fn parse_include(&mut self) -> Option<Expression> {
        let pos = self.pos();
        if !self.expect_peek(TokenKind::String, "a module path string") {
            return None;
        }
        let path = unescape(self.lexer.cur.literal);
        if self.peek_is(TokenKind::Semicolon) {
            self.advance();
        }
        Some(Expression::new(ExpressionKind::Include { path, canonical: None }, pos))
    }

    fn parse_recover(&mut self) -> Option<Expression> {
        let pos = self.pos();
        if !self.expect_peek(TokenKind::LParen, "'('") {
            return None;
        }
        if !self.expect_peek(TokenKind::Ident, "an error-binding identifier") {
            return None;
        }
        let error_name = Identifier { name: self.lexer.cur.literal.to_string(), position: self.pos() };
        if !self.expect_peek(TokenKind::RParen, "')'") {
            return None;
        }
        if !self.expect_peek(TokenKind::LBrace, "'{'") {
            return None;
        }
        let body = self.parse_block();
        Some(Expression::new(ExpressionKind::Recover { error_name, body }, pos))
    }

    fn parse_expression_statement(&mut self) -> Option<Expression> {
        let pos = self.pos();
        let expr = self.parse_expression(Prec::Lowest)?;
        if self.peek_is(TokenKind::Semicolon) {
            self.advance();
        }
        Some(Expression::new(ExpressionKind::ExpressionStatement(Box::new(expr)), pos))
    }

    fn parse_expression(&mut self, precedence: Prec) -> Option<Expression> {
        let mut left = self.parse_prefix()?;
        while !self.peek_is(TokenKind::Semicolon) && precedence < infix_precedence(self.lexer.peek.kind) {
            left = match self.lexer.peek.kind {
                TokenKind::Assign
                | TokenKind::PlusAssign
                | TokenKind::MinusAssign
                | TokenKind::AsteriskAssign
                | TokenKind::SlashAssign
                | TokenKind::PercentAssign
                | TokenKind::BitAndAssign
                | TokenKind::BitOrAssign
                | TokenKind::BitXorAssign
                | TokenKind::LShiftAssign
                | TokenKind::RShiftAssign => {
                    self.advance();
                    self.parse_assignment(left)?
                }
                TokenKind::Question => {
                    self.advance();
                    self.parse_ternary(left)?
                }
                TokenKind::And => {
                    self.advance();
                    self.parse_logical(left, LogicalOp::And)?
                }
                TokenKind::Or => {
                    self.advance();
                    self.parse_logical(left, LogicalOp::Or)?
                }
                TokenKind::LParen => {
                    self.advance();
                    self.parse_call(left, None)?
                }
                TokenKind::LBracket => {
                    self.advance();
                    self.parse_index(left)?
                }
                TokenKind::Dot => {
                    self.advance();
                    self.parse_dot(left)?
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    self.advance();
                    self.parse_postfix_incdec(left)?
                }
                kind => {
                    self.advance();
                    self.parse_infix(left, kind)?
                }
            };
        }
        Some(left)
    }

    fn parse_prefix(&mut self) -> Option<Expression> {
        let pos = self.pos();
        match self.lexer.cur.kind {
            TokenKind::Ident => Some(Expression::new(
                ExpressionKind::Identifier(Identifier { name: self.lexer.cur.literal.to_string(), position: pos.clone() }),
                pos,
            )),
            TokenKind::Number => self.parse_number_literal(),
            TokenKind::String => {
                let value = unescape(self.lexer.cur.literal);
                Some(Expression::new(ExpressionKind::StringLiteral { value, was_allocated: true }, pos))
            }
            TokenKind::TemplateStringPart => self.parse_template_string(),
            TokenKind::True => Some(Expression::new(ExpressionKind::BoolLiteral(true), pos)),
            TokenKind::False => Some(Expression::new(ExpressionKind::BoolLiteral(false), pos)),
            TokenKind::Null => Some(Expression::new(ExpressionKind::NullLiteral, pos)),
            TokenKind::Bang => {
                self.advance();
                let right = self.parse_expression(Prec::Prefix)?;
                Some(Expression::new(ExpressionKind::Prefix { op: PrefixOp::Bang, right: Box::new(right) }, pos))
            }
            TokenKind::Minus => {
                self.advance();
                let right = self.parse_expression(Prec::Prefix)?;
                Some(Expression::new(ExpressionKind::Prefix { op: PrefixOp::Minus, right: Box::new(right) }, pos))
            }
            TokenKind::Tilde => {
                self.advance();
                let right = self.parse_expression(Prec::Prefix)?;
                Some(Expression::new(ExpressionKind::Prefix { op: PrefixOp::BitNot, right: Box::new(right) }, pos))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => self.parse_prefix_incdec(pos),
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression(Prec::Lowest)?;
                if !self.expect_peek(TokenKind::RParen, "')'") {
                    return None;
                }
                Some(expr)
            }
            TokenKind::LBracket => self.parse_array_literal(pos),
            TokenKind::LBrace => self.parse_map_literal(pos),
            TokenKind::Function => self.parse_function_literal(),
            other => {
                self.error(format!("unexpected token {other:?} in expression position"));
                None
            }
        }
    }

    fn parse_number_literal(&mut self) -> Option<Expression> {
        let pos = self.pos();
        let literal = self.lexer.cur.literal;
        let value = parse_number(literal);
        match value {
            Some(v) => Some(Expression::new(ExpressionKind::NumberLiteral(v), pos)),
            None => {
                self.error(format!("invalid number literal '{literal}'"));
                None
            }
        }
    }

    /// `x op= rhs` → `x = x op rhs`. `left` has already been parsed; `cur`
    /// sits on the compound-assignment operator.
    fn parse_assignment(&mut self, left: Expression) -> Option<Expression> {
        let pos = self.pos();
        let op_kind = self.lexer.cur.kind;
        if !matches!(left.kind, ExpressionKind::Identifier(_) | ExpressionKind::Index { .. }) {
            self.error("assignment target must be an identifier or index expression");
        }
        self.advance();
        let rhs = self.parse_expression(Prec::Assign)?;
        let source = match compound_op(op_kind) {
            None => rhs,
            Some(op) => Expression::new(
                ExpressionKind::Infix { op, left: Box::new(left.clone()), right: Box::new(rhs) },
                pos.clone(),
            ),
        };
        Some(Expression::new(
            ExpressionKind::Assignment { dest: Box::new(left), source: Box::new(source), is_postfix: false },
            pos,
        ))
    }

    fn parse_prefix_incdec(&mut self, pos: SourcePosition) -> Option<Expression> {
        let is_inc = self.cur_is(TokenKind::PlusPlus);
        self.advance();
        let target = self.parse_expression(Prec::Prefix)?;
        let one = Expression::new(ExpressionKind::NumberLiteral(1.0), pos.clone());
        let op = if is_inc { InfixOp::Plus } else { InfixOp::Minus };
        let source = Expression::new(
            ExpressionKind::Infix { op, left: Box::new(target.clone()), right: Box::new(one) },
            pos.clone(),
        );
        Some(Expression::new(
            ExpressionKind::Assignment { dest: Box::new(target), source: Box::new(source), is_postfix: false },
            pos,
        ))
    }

    fn parse_postfix_incdec(&mut self, target: Expression) -> Option<Expression> {
        let pos = target.position.clone();
        let is_inc = self.cur_is(TokenKind::PlusPlus);
        let one = Expression::new(ExpressionKind::NumberLiteral(1.0), pos.clone());
        let op = if is_inc { InfixOp::Plus } else { InfixOp::Minus };
        let source = Expression::new(
            ExpressionKind::Infix { op, left: Box::new(target.clone()), right: Box::new(one) },
            pos.clone(),
        );
        Some(Expression::new(
            ExpressionKind::Assignment { dest: Box::new(target), source: Box::new(source), is_postfix: true },
            pos,
        ))
    }

    fn parse_ternary(&mut self, test: Expression) -> Option<Expression> {
        let pos = test.position.clone();
        self.advance();
        let then_branch = self.parse_expression(Prec::Lowest)?;
        if !self.expect_peek(TokenKind::Colon, "':'") {
            return None;
        }
        self.advance();
        let else_branch = self.parse_expression(Prec::Ternary)?;
        Some(Expression::new(
            ExpressionKind::Ternary { test: Box::new(test), then_branch: Box::new(then_branch), else_branch: Box::new(else_branch) },
            pos,
        ))
    }

    fn parse_logical(&mut self, left: Expression, op: LogicalOp) -> Option<Expression> {
        let pos = left.position.clone();
        let prec = match op {
            LogicalOp::And => Prec::LogicalAnd,
            LogicalOp::Or => Prec::LogicalOr,
        };
        self.advance();
        let right = self.parse_expression(prec)?;
        Some(Expression::new(ExpressionKind::Logical { op, left: Box::new(left), right: Box::new(right) }, pos))
    }

    fn parse_infix(&mut self, left: Expression, kind: TokenKind) -> Option<Expression> {
        let pos = left.position.clone();
        let op = match infix_op(kind) {
            Some(op) => op,
            None => {
                self.error(format!("{kind:?} is not a valid infix operator"));
                return None;
            }
        };
        let prec = infix_precedence(kind);
        self.advance();
        let right = self.parse_expression(prec)?;
        Some(Expression::new(ExpressionKind::Infix { op, left: Box::new(left), right: Box::new(right) }, pos))
    }

    fn parse_call(&mut self, callee: Expression, receiver: Option<Expression>) -> Option<Expression> {
        let pos = callee.position.clone();
        let mut args = Vec::new();
        if !self.peek_is(TokenKind::RParen) {
            self.advance();
            args.push(self.parse_expression(Prec::Lowest)?);
            while self.peek_is(TokenKind::Comma) {
                self.advance();
                self.advance();
                args.push(self.parse_expression(Prec::Lowest)?);
            }
        }
        if !self.expect_peek(TokenKind::RParen, "')'") {
            return None;
        }
        Some(Expression::new(
            ExpressionKind::Call { callee: Box::new(callee), args, receiver: receiver.map(Box::new) },
            pos,
        ))
    }

    fn parse_index(&mut self, left: Expression) -> Option<Expression> {
        let pos = left.position.clone();
        self.advance();
        let index = self.parse_expression(Prec::Lowest)?;
        if !self.expect_peek(TokenKind::RBracket, "']'") {
            return None;
        }
        Some(Expression::new(ExpressionKind::Index { left: Box::new(left), index: Box::new(index), via_dot: false }, pos))
    }

    /// `left.name` desugars to `left["name"]` (`via_dot = true`); if
    /// immediately followed by a call, the call records `left` again as its
    /// receiver for `this` binding (spec.md §4.5.4).
    fn parse_dot(&mut self, left: Expression) -> Option<Expression> {
        let pos = left.position.clone();
        if !self.expect_peek(TokenKind::Ident, "a member name") {
            return None;
        }
        let name = self.lexer.cur.literal.to_string();
        let name_pos = self.pos();
        let index_expr = Expression::new(
            ExpressionKind::Index {
                left: Box::new(left.clone()),
                index: Box::new(Expression::new(ExpressionKind::StringLiteral { value: name, was_allocated: false }, name_pos)),
                via_dot: true,
            },
            pos,
        );
        if self.peek_is(TokenKind::LParen) {
            self.advance();
            self.parse_call(index_expr, Some(left))
        } else {
            Some(index_expr)
        }
    }

    fn parse_array_literal(&mut self, pos: SourcePosition) -> Option<Expression> {
        let mut items = Vec::new();
        if !self.peek_is(TokenKind::RBracket) {
            self.advance();
            items.push(self.parse_expression(Prec::Lowest)?);
            while self.peek_is(TokenKind::Comma) {
                self.advance();
                self.advance();
                items.push(self.parse_expression(Prec::Lowest)?);
            }
        }
        if !self.expect_peek(TokenKind::RBracket, "']'") {
            return None;
        }
        Some(Expression::new(ExpressionKind::ArrayLiteral(items), pos))
    }

    fn parse_map_literal(&mut self, pos: SourcePosition) -> Option<Expression> {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        if !self.peek_is(TokenKind::RBrace) {
            self.advance();
            let (k, v) = self.parse_map_entry()?;
            keys.push(k);
            values.push(v);
            while self.peek_is(TokenKind::Comma) {
                self.advance();
                self.advance();
                let (k, v) = self.parse_map_entry()?;
                keys.push(k);
                values.push(v);
            }
        }
        if !self.expect_peek(TokenKind::RBrace, "'}'") {
            return None;
        }
        Some(Expression::new(ExpressionKind::MapLiteral { keys, values }, pos))
    }

    fn parse_map_entry(&mut self) -> Option<(Expression, Expression)> {
        // Bare identifiers as keys are sugar for string-literal keys.
        let key = if self.cur_is(TokenKind::Ident) && self.peek_is(TokenKind::Colon) {
            let pos = self.pos();
            Expression::new(ExpressionKind::StringLiteral { value: self.lexer.cur.literal.to_string(), was_allocated: false }, pos)
        } else {
            self.parse_expression(Prec::Lowest)?
        };
        if !self.expect_peek(TokenKind::Colon, "':'") {
            return None;
        }
        self.advance();
        let value = self.parse_expression(Prec::Lowest)?;
        Some((key, value))
    }

    fn parse_template_string(&mut self) -> Option<Expression> {
        let pos = self.pos();
        let mut result: Option<Expression> = None;
        loop {
            let segment = unescape(self.lexer.cur.literal);
            let is_final = self.lexer.cur.template_final;
            if !segment.is_empty() || result.is_none() {
                let lit = Expression::new(ExpressionKind::StringLiteral { value: segment, was_allocated: true }, pos.clone());
                result = Some(match result {
                    None => lit,
                    Some(acc) => Expression::new(
                        ExpressionKind::Infix { op: InfixOp::Plus, left: Box::new(acc), right: Box::new(lit) },
                        pos.clone(),
                    ),
                });
            }
            if is_final {
                break;
            }
            self.advance();
            let inner = self.parse_expression(Prec::Lowest)?;
            let call = Expression::new(
                ExpressionKind::Call {
                    callee: Box::new(Expression::new(
                        ExpressionKind::Identifier(Identifier { name: "tostring".into(), position: pos.clone() }),
                        pos.clone(),
                    )),
                    args: vec![inner],
                    receiver: None,
                },
                pos.clone(),
            );
            result = Some(match result {
                None => call,
                Some(acc) => Expression::new(
                    ExpressionKind::Infix { op: InfixOp::Plus, left: Box::new(acc), right: Box::new(call) },
                    pos.clone(),
                ),
            });
            if !self.expect_peek(TokenKind::RBrace, "'}' closing template interpolation") {
                return None;
            }
            if !self.lexer.rewind() {
                self.error("internal error: template interpolation rewind unavailable");
                return None;
            }
            self.lexer.resume_template_string();
            self.advance();
        }
        result
    }
}

fn compound_op(kind: TokenKind) -> Option<InfixOp> {
    use TokenKind::*;
    Some(match kind {
        PlusAssign => InfixOp::Plus,
        MinusAssign => InfixOp::Minus,
        AsteriskAssign => InfixOp::Asterisk,
        SlashAssign => InfixOp::Slash,
        PercentAssign => InfixOp::Percent,
        BitAndAssign => InfixOp::BitAnd,
        BitOrAssign => InfixOp::BitOr,
        BitXorAssign => InfixOp::BitXor,
        LShiftAssign => InfixOp::LShift,
        RShiftAssign => InfixOp::RShift,
        Assign => return None,
        _ => return None,
    })
}

fn infix_op(kind: TokenKind) -> Option<InfixOp> {
    use TokenKind::*;
    Some(match kind {
        Plus => InfixOp::Plus,
        Minus => InfixOp::Minus,
        Asterisk => InfixOp::Asterisk,
        Slash => InfixOp::Slash,
        Percent => InfixOp::Percent,
        Lt => InfixOp::Lt,
        LtEq => InfixOp::LtEq,
        Gt => InfixOp::Gt,
        GtEq => InfixOp::GtEq,
        Eq => InfixOp::Eq,
        NotEq => InfixOp::NotEq,
        BitAnd => InfixOp::BitAnd,
        BitOr => InfixOp::BitOr,
        BitXor => InfixOp::BitXor,
        LShift => InfixOp::LShift,
        RShift => InfixOp::RShift,
        _ => return None,
    })
}

/// Parses a lexer number literal (decimal, `0x` hex, or float form) via the
/// platform string-to-double, per spec.md §4.1/§4.2.
fn parse_number(literal: &str) -> Option<f64> {
    if let Some(hex) = literal.strip_prefix("0x").or_else(|| literal.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as f64);
    }
    literal.parse::<f64>().ok()
}

/// Processes `\"`, `\\`, `\/`, `\b`, `\f`, `\n`, `\r`, `\t`, `\0`. Unknown
/// escapes pass through verbatim (spec.md §4.2).
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::CompilationFile;

    fn parse(src: &str) -> (Block, crate::errors::ErrorList) {
        let file = CompilationFile::new("<test>", src);
        let lexer = Lexer::new(src, file);
        let mut parser = Parser::new(lexer);
        let block = parser.parse_program();
        (block, parser.errors)
    }

    #[test]
    fn parses_for_loop_with_string_concat() {
        let (block, errors) = parse(r#"var s = ""; for (var i = 0; i < 3; i++) { s += i; } return s;"#);
        assert!(errors.is_empty());
        assert_eq!(block.statements.len(), 3);
    }

    #[test]
    fn compound_assignment_desugars_to_infix() {
        let (block, errors) = parse("x += 1;");
        assert!(errors.is_empty());
        let ExpressionKind::ExpressionStatement(stmt) = &block.statements[0].kind else { panic!() };
        let ExpressionKind::Assignment { source, .. } = &stmt.kind else { panic!() };
        assert!(matches!(source.kind, ExpressionKind::Infix { op: InfixOp::Plus, .. }));
    }

    #[test]
    fn named_function_statement_desugars_to_const() {
        let (block, errors) = parse("function adder(x) { return x; }");
        assert!(errors.is_empty());
        let ExpressionKind::Define { assignable, value, .. } = &block.statements[0].kind else { panic!() };
        assert!(!assignable);
        assert!(matches!(&value.kind, ExpressionKind::FunctionLiteral(f) if f.name.as_deref() == Some("adder")));
    }

    #[test]
    fn template_string_lowers_to_tostring_call() {
        let (block, errors) = parse("return `hi ${1+2}!`;");
        assert!(errors.is_empty());
        let ExpressionKind::Return(Some(expr)) = &block.statements[0].kind else { panic!() };
        // Outer node is the final `+ "!"` infix.
        assert!(matches!(expr.kind, ExpressionKind::Infix { op: InfixOp::Plus, .. }));
    }

    #[test]
    fn dot_call_records_receiver() {
        let (block, errors) = parse("obj.method(1);");
        assert!(errors.is_empty());
        let ExpressionKind::ExpressionStatement(expr) = &block.statements[0].kind else { panic!() };
        let ExpressionKind::Call { receiver, .. } = &expr.kind else { panic!() };
        assert!(receiver.is_some());
    }
}
