//! Statement parsing

use super::ast::{Expr, FunctionBody, FunctionTarget, Param, Statement, TypeExpr};
use super::{ParseFailure, Parser};
use crate::lexer::TokenKind;

impl<'t> Parser<'t> {
    pub(crate) fn parse_statement(&mut self) -> Result<Statement, ParseFailure> {
        let tok = self.peek().clone();
        match tok.kind {
            TokenKind::Keyword => match tok.text.as_str() {
                "let" => self.parse_declaration(false),
                "var" | "local" => self.parse_local(),
                "if" => self.parse_if(),
                "while" => self.parse_while(),
                "do" => self.parse_do(),
                "for" => self.parse_for(),
                "function" => self.parse_function_decl(),
                "return" => self.parse_return(),
                "break" => {
                    let line = self.bump().line;
                    Ok(Statement::Break { line })
                }
                "goto" => {
                    let line = self.bump().line;
                    let label = self.expect_name()?.text;
                    Ok(Statement::Goto { label, line })
                }
                "type" => self.parse_type_decl(),
                "offline" => Err(self.failure(
                    "'offline' marker is only valid before 'function' and must be expanded before parsing",
                )),
                other => Err(self.failure(format!("unexpected keyword '{}'", other))),
            },
            TokenKind::Operator if tok.text == "::" => {
                let line = self.bump().line;
                let name = self.expect_name()?.text;
                self.expect_operator("::")?;
                Ok(Statement::Label { name, line })
            }
            _ => self.parse_expr_statement(),
        }
    }

    /// `var`/`local` declaration, or `local function name(...)`
    fn parse_local(&mut self) -> Result<Statement, ParseFailure> {
        if self.peek_at(1).is_keyword("function") {
            let line = self.bump().line; // var/local
            self.expect_keyword("function")?;
            let name = self.expect_name()?.text;
            let body = self.parse_function_body()?;
            return Ok(Statement::LocalFunction { name, body, line });
        }
        self.parse_declaration(true)
    }

    fn parse_declaration(&mut self, mutable: bool) -> Result<Statement, ParseFailure> {
        let line = self.bump().line; // let/var/local
        let mut names = Vec::new();
        let mut annotations = Vec::new();
        loop {
            names.push(self.expect_name()?.text);
            if self.accept_operator(":") {
                annotations.push(Some(self.parse_type_expr()?));
            } else {
                annotations.push(None);
            }
            if !self.accept_operator(",") {
                break;
            }
        }
        let mut exprs = Vec::new();
        if self.accept_operator("=") {
            loop {
                exprs.push(self.parse_expr()?);
                if !self.accept_operator(",") {
                    break;
                }
            }
        }
        Ok(Statement::Declare {
            names,
            annotations,
            exprs,
            mutable,
            line,
        })
    }

    fn parse_if(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.bump().line;
        let mut arms = Vec::new();
        let condition = self.parse_expr()?;
        self.expect_keyword("then")?;
        let body = self.parse_block()?;
        arms.push((condition, body));
        let mut else_block = None;
        loop {
            if self.accept_keyword("elseif") {
                let condition = self.parse_expr()?;
                self.expect_keyword("then")?;
                let body = self.parse_block()?;
                arms.push((condition, body));
            } else if self.accept_keyword("else") {
                else_block = Some(self.parse_block()?);
                self.expect_keyword("end")?;
                break;
            } else {
                self.expect_keyword("end")?;
                break;
            }
        }
        Ok(Statement::If {
            arms,
            else_block,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.bump().line;
        let condition = self.parse_expr()?;
        self.expect_keyword("do")?;
        let body = self.parse_block()?;
        self.expect_keyword("end")?;
        Ok(Statement::While {
            condition,
            body,
            line,
        })
    }

    fn parse_do(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.bump().line;
        let body = self.parse_block()?;
        self.expect_keyword("end")?;
        Ok(Statement::Do { body, line })
    }

    fn parse_for(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.bump().line;
        let first = self.expect_name()?.text;
        if self.accept_operator("=") {
            let start = self.parse_expr()?;
            self.expect_operator(",")?;
            let stop = self.parse_expr()?;
            let step = if self.accept_operator(",") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect_keyword("do")?;
            let body = self.parse_block()?;
            self.expect_keyword("end")?;
            return Ok(Statement::NumericFor {
                var: first,
                start,
                stop,
                step,
                body,
                line,
            });
        }

        let mut names = vec![first];
        while self.accept_operator(",") {
            names.push(self.expect_name()?.text);
        }
        self.expect_keyword("in")?;
        let iter = self.parse_expr()?;
        self.expect_keyword("do")?;
        let body = self.parse_block()?;
        self.expect_keyword("end")?;
        Ok(Statement::IterFor {
            names,
            iter,
            body,
            line,
        })
    }

    fn parse_function_decl(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.bump().line;
        let first = self.expect_name()?.text;
        let target = if self.accept_operator(".") {
            let name = self.expect_name()?.text;
            FunctionTarget::Member { table: first, name }
        } else if self.accept_operator(":") {
            let name = self.expect_name()?.text;
            FunctionTarget::Method { table: first, name }
        } else {
            FunctionTarget::Name(first)
        };
        let body = self.parse_function_body()?;
        Ok(Statement::FunctionDecl { target, body, line })
    }

    pub(crate) fn parse_function_body(&mut self) -> Result<FunctionBody, ParseFailure> {
        let open = self.expect_operator("(")?;
        let line = open.line;
        let mut params = Vec::new();
        if !self.check_operator(")") {
            loop {
                if self.check_operator("...") {
                    return Err(self.failure("user functions cannot be variadic"));
                }
                let name = self.expect_name()?.text;
                let annotation = if self.accept_operator(":") {
                    Some(self.parse_type_expr()?)
                } else {
                    None
                };
                params.push(Param { name, annotation });
                if !self.accept_operator(",") {
                    break;
                }
            }
        }
        self.expect_operator(")")?;
        let return_annotation: Option<TypeExpr> = if self.accept_operator(":") {
            Some(self.parse_type_expr()?)
        } else {
            None
        };
        let block = self.parse_block()?;
        self.expect_keyword("end")?;
        Ok(FunctionBody {
            params,
            return_annotation,
            block,
            line,
        })
    }

    fn parse_return(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.bump().line;
        let expr = if self.at_block_end() || self.check_operator(";") {
            None
        } else {
            Some(self.parse_expr()?)
        };
        Ok(Statement::Return { expr, line })
    }

    fn parse_type_decl(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.bump().line;
        let name = self.expect_name()?.text;
        let mut generics = Vec::new();
        if self.accept_operator("<") {
            loop {
                generics.push(self.expect_name()?.text);
                if !self.accept_operator(",") {
                    break;
                }
            }
            self.expect_operator(">")?;
        }
        self.expect_operator("=")?;
        let ty = self.parse_type_expr()?;
        Ok(Statement::TypeDecl {
            name,
            generics,
            ty,
            line,
        })
    }

    /// Assignment or expression statement
    fn parse_expr_statement(&mut self) -> Result<Statement, ParseFailure> {
        let line = self.line();
        let first = self.parse_suffixed_expr()?;
        if self.check_operator("=") || self.check_operator(",") {
            let mut targets = vec![first];
            while self.accept_operator(",") {
                targets.push(self.parse_suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target, Expr::Name { .. } | Expr::Member { .. } | Expr::Index { .. }) {
                    return Err(self.failure("invalid assignment target"));
                }
            }
            self.expect_operator("=")?;
            let mut exprs = Vec::new();
            loop {
                exprs.push(self.parse_expr()?);
                if !self.accept_operator(",") {
                    break;
                }
            }
            return Ok(Statement::Assign {
                targets,
                exprs,
                line,
            });
        }

        if !matches!(first, Expr::Call { .. } | Expr::MethodCall { .. }) {
            return Err(self.failure("expected a statement"));
        }
        Ok(Statement::ExprStat { expr: first, line })
    }
}
