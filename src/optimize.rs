//! Constant-folding peephole optimizer (spec.md §4.3). A pure pass: each
//! call either returns a freshly-built literal node or `None` ("no
//! change"). Folds recursively on children before examining the operator.
//!
//! Grounded on `original_source/ccopt.c`: that file's public entry point
//! returns `NULL` before its dispatch switch runs, so the pass is
//! effectively dead in the source it was distilled from. Preserved here,
//! implemented, but gated off by default — see
//! `CompilerConfig::constant_folding` in `bytecode::compiler`.

use crate::ast::{Expression, ExpressionKind, InfixOp, PrefixOp};

pub fn fold(expr: &Expression) -> Option<Expression> {
    match &expr.kind {
        ExpressionKind::Infix { op, left, right } => {
            let folded_left = fold(left);
            let folded_right = fold(right);
            let l = folded_left.as_ref().unwrap_or(left);
            let r = folded_right.as_ref().unwrap_or(right);
            if let Some(folded) = fold_infix(*op, l, r, &expr.position) {
                return Some(folded);
            }
            if folded_left.is_some() || folded_right.is_some() {
                return Some(Expression::new(
                    ExpressionKind::Infix {
                        op: *op,
                        left: Box::new(folded_left.unwrap_or_else(|| left.as_ref().clone())),
                        right: Box::new(folded_right.unwrap_or_else(|| right.as_ref().clone())),
                    },
                    expr.position.clone(),
                ));
            }
            None
        }
        ExpressionKind::Prefix { op, right } => {
            let folded_right = fold(right);
            let r = folded_right.as_ref().unwrap_or(right);
            if let Some(folded) = fold_prefix(*op, r, &expr.position) {
                return Some(folded);
            }
            folded_right.map(|r| {
                Expression::new(ExpressionKind::Prefix { op: *op, right: Box::new(r) }, expr.position.clone())
            })
        }
        _ => None,
    }
}

fn fold_infix(op: InfixOp, left: &Expression, right: &Expression, pos: &crate::position::SourcePosition) -> Option<Expression> {
    use ExpressionKind::*;
    match (&left.kind, &right.kind) {
        (NumberLiteral(a), NumberLiteral(b)) => fold_numeric(op, *a, *b, pos),
        (StringLiteral { value: a, .. }, StringLiteral { value: b, .. }) if op == InfixOp::Plus => {
            Some(Expression::new(
                StringLiteral { value: format!("{a}{b}"), was_allocated: true },
                pos.clone(),
            ))
        }
        _ => None,
    }
}

fn fold_numeric(op: InfixOp, a: f64, b: f64, pos: &crate::position::SourcePosition) -> Option<Expression> {
    let num = |v: f64| Some(Expression::new(ExpressionKind::NumberLiteral(v), pos.clone()));
    let boolean = |v: bool| Some(Expression::new(ExpressionKind::BoolLiteral(v), pos.clone()));
    match op {
        InfixOp::Plus => num(a + b),
        InfixOp::Minus => num(a - b),
        InfixOp::Asterisk => num(a * b),
        InfixOp::Slash => {
            if b == 0.0 { None } else { num(a / b) }
        }
        InfixOp::Percent => {
            let bi = b as i64;
            if bi == 0 { None } else { num(((a as i64) % bi) as f64) }
        }
        InfixOp::Lt => boolean(a < b),
        InfixOp::Gt => boolean(a > b),
        InfixOp::LtEq => boolean(a <= b),
        InfixOp::GtEq => boolean(a >= b),
        InfixOp::Eq => boolean(a == b),
        InfixOp::NotEq => boolean(a != b),
        InfixOp::BitAnd => num(((a as i64) & (b as i64)) as f64),
        InfixOp::BitOr => num(((a as i64) | (b as i64)) as f64),
        InfixOp::BitXor => num(((a as i64) ^ (b as i64)) as f64),
        InfixOp::LShift => num(((a as i64) << ((b as i64) & 63)) as f64),
        InfixOp::RShift => num(((a as i64) >> ((b as i64) & 63)) as f64),
    }
}

fn fold_prefix(op: PrefixOp, right: &Expression, pos: &crate::position::SourcePosition) -> Option<Expression> {
    match (op, &right.kind) {
        (PrefixOp::Minus, ExpressionKind::NumberLiteral(n)) => {
            Some(Expression::new(ExpressionKind::NumberLiteral(-n), pos.clone()))
        }
        (PrefixOp::Bang, ExpressionKind::BoolLiteral(b)) => {
            Some(Expression::new(ExpressionKind::BoolLiteral(!b), pos.clone()))
        }
        (PrefixOp::BitNot, ExpressionKind::NumberLiteral(n)) => {
            Some(Expression::new(ExpressionKind::NumberLiteral(!(*n as i64) as f64), pos.clone()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{CompilationFile, SourcePosition};

    fn pos() -> SourcePosition {
        SourcePosition::synthetic(CompilationFile::new("<test>", ""))
    }

    fn num(n: f64) -> Expression {
        Expression::new(ExpressionKind::NumberLiteral(n), pos())
    }

    #[test]
    fn folds_numeric_addition() {
        let expr = Expression::new(
            ExpressionKind::Infix { op: InfixOp::Plus, left: Box::new(num(2.0)), right: Box::new(num(3.0)) },
            pos(),
        );
        let folded = fold(&expr).unwrap();
        assert!(matches!(folded.kind, ExpressionKind::NumberLiteral(n) if n == 5.0));
    }

    #[test]
    fn idempotent_on_already_folded_input() {
        let expr = Expression::new(
            ExpressionKind::Infix { op: InfixOp::Plus, left: Box::new(num(2.0)), right: Box::new(num(3.0)) },
            pos(),
        );
        let once = fold(&expr).unwrap();
        let twice = fold(&once);
        assert!(twice.is_none(), "folding an already-literal node should report no change");
    }

    #[test]
    fn non_constant_operands_are_not_folded() {
        let ident = Expression::new(
            ExpressionKind::Identifier(crate::ast::Identifier { name: "x".into(), position: pos() }),
            pos(),
        );
        let expr = Expression::new(
            ExpressionKind::Infix { op: InfixOp::Plus, left: Box::new(ident), right: Box::new(num(3.0)) },
            pos(),
        );
        assert!(fold(&expr).is_none());
    }
}
