//! Expression parsing with precedence climbing

use super::ast::{BinOp, Expr, TableKeyExpr, UnOp};
use super::{ParseFailure, Parser};
use crate::lexer::TokenKind;

/// (left, right) binding powers; right < left gives right associativity
fn binary_power(op: BinOp) -> (u8, u8) {
    match op {
        BinOp::Or => (1, 2),
        BinOp::And => (3, 4),
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (5, 6),
        BinOp::Concat => (8, 7),
        BinOp::Add | BinOp::Sub => (9, 10),
        BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 12),
        BinOp::Pow => (16, 15),
    }
}

const UNARY_POWER: u8 = 13;

impl<'t> Parser<'t> {
    pub(crate) fn parse_expr(&mut self) -> Result<Expr, ParseFailure> {
        self.parse_binary(0)
    }

    fn current_binop(&self) -> Option<BinOp> {
        let tok = self.peek();
        let op = match tok.kind {
            TokenKind::Operator => match tok.text.as_str() {
                "+" => BinOp::Add,
                "-" => BinOp::Sub,
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                "//" => BinOp::IDiv,
                "%" => BinOp::Mod,
                "^" => BinOp::Pow,
                ".." => BinOp::Concat,
                "==" => BinOp::Eq,
                "~=" => BinOp::Ne,
                "<" => BinOp::Lt,
                "<=" => BinOp::Le,
                ">" => BinOp::Gt,
                ">=" => BinOp::Ge,
                _ => return None,
            },
            TokenKind::Keyword => match tok.text.as_str() {
                "and" => BinOp::And,
                "or" => BinOp::Or,
                _ => return None,
            },
            _ => return None,
        };
        Some(op)
    }

    fn parse_binary(&mut self, min_power: u8) -> Result<Expr, ParseFailure> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.current_binop() {
            let (left_power, right_power) = binary_power(op);
            if left_power < min_power {
                break;
            }
            let line = self.bump().line;
            let rhs = self.parse_binary(right_power)?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseFailure> {
        let tok = self.peek();
        let op = if tok.is_operator("-") {
            Some(UnOp::Neg)
        } else if tok.is_operator("#") {
            Some(UnOp::Len)
        } else if tok.is_keyword("not") {
            Some(UnOp::Not)
        } else {
            None
        };
        if let Some(op) = op {
            let line = self.bump().line;
            let operand = self.parse_binary(UNARY_POWER)?;
            return Ok(Expr::UnOp {
                op,
                operand: Box::new(operand),
                line,
            });
        }
        self.parse_simple_expr()
    }

    fn parse_simple_expr(&mut self) -> Result<Expr, ParseFailure> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Keyword => match tok.text.as_str() {
                "nil" => Ok(Expr::Nil { line: self.bump().line }),
                "true" => Ok(Expr::True { line: self.bump().line }),
                "false" => Ok(Expr::False { line: self.bump().line }),
                "function" => {
                    let line = self.bump().line;
                    let body = self.parse_function_body()?;
                    Ok(Expr::Function { body, line })
                }
                _ => Err(self.failure("unexpected token in expression")),
            },
            TokenKind::Int => {
                self.bump();
                let value = parse_int(&tok.text)
                    .ok_or_else(|| self.failure("integer literal out of range"))?;
                Ok(Expr::Int { value, line: tok.line })
            }
            TokenKind::Number => {
                self.bump();
                let value: f64 = tok
                    .text
                    .parse()
                    .map_err(|_| self.failure("malformed number literal"))?;
                Ok(Expr::Number { value, line: tok.line })
            }
            TokenKind::Str => {
                self.bump();
                Ok(Expr::Str {
                    value: tok.text,
                    line: tok.line,
                })
            }
            TokenKind::Operator if tok.text == "{" => self.parse_table_constructor(),
            _ => self.parse_suffixed_expr(),
        }
    }

    /// Primary expression plus any chain of `.name`, `[expr]`, `:m(args)`,
    /// and call suffixes
    pub(crate) fn parse_suffixed_expr(&mut self) -> Result<Expr, ParseFailure> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            let tok = self.peek().clone();
            if tok.is_operator(".") {
                self.bump();
                let name = self.expect_name()?.text;
                expr = Expr::Member {
                    object: Box::new(expr),
                    name,
                    line: tok.line,
                };
            } else if tok.is_operator("[") {
                self.bump();
                let index = self.parse_expr()?;
                self.expect_operator("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                    line: tok.line,
                };
            } else if tok.is_operator(":") && self.peek_at(1).kind == TokenKind::Name
                && self.peek_at(2).is_operator("(")
            {
                self.bump();
                let method = self.expect_name()?.text;
                let args = self.parse_call_args()?;
                expr = Expr::MethodCall {
                    object: Box::new(expr),
                    method,
                    args,
                    line: tok.line,
                };
            } else if tok.is_operator("(") {
                let args = self.parse_call_args()?;
                expr = Expr::Call {
                    function: Box::new(expr),
                    args,
                    line: tok.line,
                };
            } else if tok.kind == TokenKind::Str {
                // `f "literal"` sugar
                self.bump();
                expr = Expr::Call {
                    function: Box::new(expr),
                    args: vec![Expr::Str {
                        value: tok.text,
                        line: tok.line,
                    }],
                    line: tok.line,
                };
            } else if tok.is_operator("{") {
                let table = self.parse_table_constructor()?;
                let line = table.line();
                expr = Expr::Call {
                    function: Box::new(expr),
                    args: vec![table],
                    line,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, ParseFailure> {
        let tok = self.peek().clone();
        if tok.kind == TokenKind::Name {
            self.bump();
            return Ok(Expr::Name {
                name: tok.text,
                line: tok.line,
            });
        }
        if tok.is_operator("(") {
            self.bump();
            let inner = self.parse_expr()?;
            self.expect_operator(")")?;
            return Ok(inner);
        }
        Err(self.failure("unexpected token"))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseFailure> {
        self.expect_operator("(")?;
        let mut args = Vec::new();
        if !self.check_operator(")") {
            loop {
                args.push(self.parse_expr()?);
                if !self.accept_operator(",") {
                    break;
                }
            }
        }
        self.expect_operator(")")?;
        Ok(args)
    }

    fn parse_table_constructor(&mut self) -> Result<Expr, ParseFailure> {
        let open = self.expect_operator("{")?;
        let line = open.line;
        let mut array_items = Vec::new();
        let mut map_items = Vec::new();
        while !self.check_operator("}") {
            let tok = self.peek().clone();
            if tok.kind == TokenKind::Name && self.peek_at(1).is_operator("=") {
                self.bump();
                self.bump();
                let value = self.parse_expr()?;
                map_items.push((TableKeyExpr::Name(tok.text), value));
            } else if tok.is_operator("[") {
                self.bump();
                let key = self.parse_expr()?;
                self.expect_operator("]")?;
                self.expect_operator("=")?;
                let value = self.parse_expr()?;
                map_items.push((TableKeyExpr::Expr(key), value));
            } else {
                array_items.push(self.parse_expr()?);
            }
            if !self.accept_operator(",") && !self.accept_operator(";") {
                break;
            }
        }
        self.expect_operator("}")?;
        Ok(Expr::Table {
            array_items,
            map_items,
            line,
        })
    }
}

/// Parse a decimal or `0x` integer literal
pub(crate) fn parse_int(text: &str) -> Option<i64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
