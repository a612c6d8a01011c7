//! Type-annotation sub-grammar
//!
//! Covers primitive names, generic instantiation `Name<T1, ...>`, inline
//! records `{ field: T }`, function types `(T1, T2) => R`, and unions of
//! literal or type alternatives `"a" | "b" | true`.

use super::ast::{TypeExpr, UnionMember};
use super::{ParseFailure, Parser};
use crate::lexer::TokenKind;
use crate::parser::expr::parse_int;

impl<'t> Parser<'t> {
    pub(crate) fn parse_type_expr(&mut self) -> Result<TypeExpr, ParseFailure> {
        let line = self.line();
        let first = self.parse_union_member()?;
        if !self.check_operator("|") {
            // a single non-literal member is just that type
            if let UnionMember::Type(ty) = first {
                return Ok(ty);
            }
            return Ok(TypeExpr::Union {
                members: vec![first],
                line,
            });
        }
        let mut members = vec![first];
        while self.accept_operator("|") {
            members.push(self.parse_union_member()?);
        }
        Ok(TypeExpr::Union { members, line })
    }

    fn parse_union_member(&mut self) -> Result<UnionMember, ParseFailure> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Str => {
                self.bump();
                Ok(UnionMember::Str(tok.text))
            }
            TokenKind::Int => {
                self.bump();
                let value = parse_int(&tok.text)
                    .ok_or_else(|| self.failure("integer literal out of range"))?;
                Ok(UnionMember::Int(value))
            }
            TokenKind::Keyword if tok.text == "true" => {
                self.bump();
                Ok(UnionMember::Bool(true))
            }
            TokenKind::Keyword if tok.text == "false" => {
                self.bump();
                Ok(UnionMember::Bool(false))
            }
            _ => Ok(UnionMember::Type(self.parse_primary_type()?)),
        }
    }

    fn parse_primary_type(&mut self) -> Result<TypeExpr, ParseFailure> {
        let tok = self.peek().clone();

        // nil is a keyword but also a valid type name
        if tok.is_keyword("nil") {
            let line = self.bump().line;
            return Ok(TypeExpr::Named {
                name: "nil".to_string(),
                args: Vec::new(),
                line,
            });
        }

        if tok.is_keyword("function") {
            let line = self.bump().line;
            return Ok(TypeExpr::Named {
                name: "function".to_string(),
                args: Vec::new(),
                line,
            });
        }

        if tok.is_operator("{") {
            return self.parse_record_type();
        }

        if tok.is_operator("(") {
            return self.parse_function_type();
        }

        if tok.kind == TokenKind::Name {
            let line = self.bump().line;
            let name = tok.text;
            let mut args = Vec::new();
            if self.accept_operator("<") {
                loop {
                    args.push(self.parse_type_expr()?);
                    if !self.accept_operator(",") {
                        break;
                    }
                }
                self.expect_operator(">")?;
            }
            return Ok(TypeExpr::Named { name, args, line });
        }

        Err(self.failure("expected a type"))
    }

    fn parse_record_type(&mut self) -> Result<TypeExpr, ParseFailure> {
        let open = self.expect_operator("{")?;
        let line = open.line;
        let mut fields = Vec::new();
        while !self.check_operator("}") {
            let name = self.expect_name()?.text;
            self.expect_operator(":")?;
            let ty = self.parse_type_expr()?;
            fields.push((name, ty));
            if !self.accept_operator(",") && !self.accept_operator(";") {
                break;
            }
        }
        self.expect_operator("}")?;
        Ok(TypeExpr::Record { fields, line })
    }

    fn parse_function_type(&mut self) -> Result<TypeExpr, ParseFailure> {
        let open = self.expect_operator("(")?;
        let line = open.line;
        let mut params = Vec::new();
        if !self.check_operator(")") {
            loop {
                params.push(self.parse_type_expr()?);
                if !self.accept_operator(",") {
                    break;
                }
            }
        }
        self.expect_operator(")")?;
        self.expect_operator("=>")?;
        let ret = self.parse_type_expr()?;
        Ok(TypeExpr::Function {
            params,
            ret: Box::new(ret),
            line,
        })
    }
}
