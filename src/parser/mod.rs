//! Recursive-descent parser for the contract scripting language
//!
//! Consumes the token stream produced by [`crate::lexer`] and builds the AST
//! in [`ast`]. Binary expressions are parsed by precedence climbing, so the
//! left recursion present in the surface grammar is eliminated when the
//! parser is constructed, not discovered at parse time. Parsing never
//! partially succeeds: either a complete [`ast::Chunk`] is returned or the
//! first unmatched-token diagnostic is reported as a [`ParseFailure`].

pub mod ast;
mod expr;
mod stmt;
mod types;

use crate::lexer::{Token, TokenKind, TokenStream};
use ast::{Block, Chunk};
use thiserror::Error;

/// First-failure parse diagnostic
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at line {line} near '{near}': {message}")]
pub struct ParseFailure {
    /// 1-indexed line of the unmatched token
    pub line: usize,
    /// Text of the unmatched token
    pub near: String,
    /// Simplified token-level message
    pub message: String,
}

/// Parse a token stream into a chunk
pub fn parse_syntax(stream: &TokenStream) -> Result<Chunk, ParseFailure> {
    let mut parser = Parser::new(stream.tokens());
    let block = parser.parse_block()?;
    parser.expect_eof()?;
    Ok(Chunk { block })
}

pub(crate) struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub(crate) fn peek(&self) -> &Token {
        // the lexer always terminates the stream with an Eof token
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("non-empty token stream"))
    }

    pub(crate) fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens
            .get(self.pos + ahead)
            .unwrap_or_else(|| self.tokens.last().expect("non-empty token stream"))
    }

    pub(crate) fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    pub(crate) fn line(&self) -> usize {
        self.peek().line
    }

    pub(crate) fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    pub(crate) fn check_keyword(&self, kw: &str) -> bool {
        self.peek().is_keyword(kw)
    }

    pub(crate) fn check_operator(&self, op: &str) -> bool {
        self.peek().is_operator(op)
    }

    pub(crate) fn accept_keyword(&mut self, kw: &str) -> bool {
        if self.check_keyword(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub(crate) fn accept_operator(&mut self, op: &str) -> bool {
        if self.check_operator(op) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect_keyword(&mut self, kw: &str) -> Result<Token, ParseFailure> {
        if self.check_keyword(kw) {
            Ok(self.bump())
        } else {
            Err(self.failure(format!("expected '{}'", kw)))
        }
    }

    pub(crate) fn expect_operator(&mut self, op: &str) -> Result<Token, ParseFailure> {
        if self.check_operator(op) {
            Ok(self.bump())
        } else {
            Err(self.failure(format!("expected '{}'", op)))
        }
    }

    pub(crate) fn expect_name(&mut self) -> Result<Token, ParseFailure> {
        if self.peek().kind == TokenKind::Name {
            Ok(self.bump())
        } else {
            Err(self.failure("expected a name"))
        }
    }

    fn expect_eof(&mut self) -> Result<(), ParseFailure> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(self.failure("expected end of input"))
        }
    }

    pub(crate) fn failure(&self, message: impl Into<String>) -> ParseFailure {
        let tok = self.peek();
        let near = if tok.kind == TokenKind::Eof {
            "<eof>".to_string()
        } else {
            tok.text.clone()
        };
        ParseFailure {
            line: tok.line,
            near,
            message: message.into(),
        }
    }

    /// True when the current token terminates a block
    pub(crate) fn at_block_end(&self) -> bool {
        self.at_eof()
            || self.check_keyword("end")
            || self.check_keyword("else")
            || self.check_keyword("elseif")
    }

    pub(crate) fn parse_block(&mut self) -> Result<Block, ParseFailure> {
        let mut statements = Vec::new();
        while !self.at_block_end() {
            if self.accept_operator(";") {
                continue;
            }
            let stat = self.parse_statement()?;
            statements.push(stat);
        }
        Ok(Block { statements })
    }
}

#[cfg(test)]
mod tests {
    use super::ast::*;
    use super::*;
    use crate::lexer::tokenize;

    fn parse(source: &str) -> Chunk {
        parse_syntax(&tokenize(source).unwrap()).unwrap()
    }

    fn parse_err(source: &str) -> ParseFailure {
        parse_syntax(&tokenize(source).unwrap()).unwrap_err()
    }

    #[test]
    fn test_declarations() {
        let chunk = parse("let x: int = 1\nvar y = 2\nlocal z");
        assert_eq!(chunk.block.statements.len(), 3);
        match &chunk.block.statements[0] {
            Statement::Declare { names, mutable, .. } => {
                assert_eq!(names, &vec!["x".to_string()]);
                assert!(!mutable);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_function_declaration() {
        let chunk = parse("function add(a: number, b: number): number\nreturn a + b\nend");
        match &chunk.block.statements[0] {
            Statement::FunctionDecl { target, body, .. } => {
                assert_eq!(target, &FunctionTarget::Name("add".to_string()));
                assert_eq!(body.params.len(), 2);
                assert!(body.return_annotation.is_some());
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_method_declaration_gets_self() {
        let chunk = parse("var M = {}\nfunction M:init()\nend");
        match &chunk.block.statements[1] {
            Statement::FunctionDecl { target, .. } => {
                assert_eq!(
                    target,
                    &FunctionTarget::Method {
                        table: "M".to_string(),
                        name: "init".to_string()
                    }
                );
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let chunk = parse("let x = 1 + 2 * 3");
        match &chunk.block.statements[0] {
            Statement::Declare { exprs, .. } => match &exprs[0] {
                Expr::BinOp { op: BinOp::Add, rhs, .. } => {
                    assert!(matches!(**rhs, Expr::BinOp { op: BinOp::Mul, .. }));
                }
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_concat_right_assoc() {
        let chunk = parse("let s = 'a' .. 'b' .. 'c'");
        match &chunk.block.statements[0] {
            Statement::Declare { exprs, .. } => match &exprs[0] {
                Expr::BinOp { op: BinOp::Concat, rhs, .. } => {
                    assert!(matches!(**rhs, Expr::BinOp { op: BinOp::Concat, .. }));
                }
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_table_constructor_parts() {
        let chunk = parse("let t = { 1, 2, x = 3, [\"y\"] = 4 }");
        match &chunk.block.statements[0] {
            Statement::Declare { exprs, .. } => match &exprs[0] {
                Expr::Table {
                    array_items,
                    map_items,
                    ..
                } => {
                    assert_eq!(array_items.len(), 2);
                    assert_eq!(map_items.len(), 2);
                }
                other => panic!("unexpected expr {:?}", other),
            },
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_numeric_and_iter_for() {
        let chunk = parse("for i = 1, 10, 2 do end\nfor k, v in pairs(t) do end");
        assert!(matches!(
            chunk.block.statements[0],
            Statement::NumericFor { .. }
        ));
        assert!(matches!(chunk.block.statements[1], Statement::IterFor { .. }));
    }

    #[test]
    fn test_goto_and_label() {
        let chunk = parse("::top::\ngoto top");
        assert!(matches!(chunk.block.statements[0], Statement::Label { .. }));
        assert!(matches!(chunk.block.statements[1], Statement::Goto { .. }));
    }

    #[test]
    fn test_type_declarations() {
        let chunk = parse(
            "type Pair<K, V> = { first: K, second: V }\ntype Mode = \"fast\" | \"safe\" | true",
        );
        match &chunk.block.statements[0] {
            Statement::TypeDecl { generics, ty, .. } => {
                assert_eq!(generics.len(), 2);
                assert!(matches!(ty, TypeExpr::Record { .. }));
            }
            other => panic!("unexpected statement {:?}", other),
        }
        match &chunk.block.statements[1] {
            Statement::TypeDecl { ty, .. } => {
                assert!(matches!(ty, TypeExpr::Union { .. }));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_function_type_annotation() {
        let chunk = parse("let f: (int, int) => int = nil");
        match &chunk.block.statements[0] {
            Statement::Declare { annotations, .. } => {
                assert!(matches!(
                    annotations[0],
                    Some(TypeExpr::Function { .. })
                ));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_first_failure_reported() {
        let err = parse_err("let = 5");
        assert_eq!(err.line, 1);
        assert_eq!(err.near, "=");
    }

    #[test]
    fn test_statement_level_garbage() {
        let err = parse_err("let x = 1\nend");
        assert_eq!(err.line, 2);
        assert_eq!(err.near, "end");
    }

    #[test]
    fn test_assignment_targets() {
        let chunk = parse("t.a = 1\nt[\"b\"] = 2\nx, y = 1, 2");
        assert!(matches!(chunk.block.statements[0], Statement::Assign { .. }));
        assert!(matches!(chunk.block.statements[1], Statement::Assign { .. }));
        match &chunk.block.statements[2] {
            Statement::Assign { targets, exprs, .. } => {
                assert_eq!(targets.len(), 2);
                assert_eq!(exprs.len(), 2);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_call_is_valid_statement_but_literal_is_not() {
        parse("print(1)");
        let err = parse_err("42");
        assert_eq!(err.line, 1);
    }
}
