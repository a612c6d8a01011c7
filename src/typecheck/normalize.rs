//! Canonical re-serialization of a checked program
//!
//! The rendered text is stable for a given tree: one statement per line,
//! four-space indentation, canonical operator spacing. Re-parsing the
//! rendered text yields an equivalent tree, which keeps repeated
//! compilations of the same normalized source deterministic.

use crate::parser::ast::{
    Block, Chunk, Expr, FunctionBody, FunctionTarget, Statement, TableKeyExpr, TypeExpr,
    UnionMember,
};
use std::fmt::Write;

pub fn render_chunk(chunk: &Chunk) -> String {
    let mut out = String::new();
    render_block(&mut out, &chunk.block, 0);
    out
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn render_block(out: &mut String, block: &Block, level: usize) {
    for statement in &block.statements {
        render_statement(out, statement, level);
    }
}

fn render_statement(out: &mut String, statement: &Statement, level: usize) {
    indent(out, level);
    match statement {
        Statement::Declare {
            names,
            annotations,
            exprs,
            mutable,
            ..
        } => {
            out.push_str(if *mutable { "var " } else { "let " });
            for (i, name) in names.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(name);
                if let Some(Some(annotation)) = annotations.get(i) {
                    out.push_str(": ");
                    render_type(out, annotation);
                }
            }
            if !exprs.is_empty() {
                out.push_str(" = ");
                render_expr_list(out, exprs);
            }
            out.push('\n');
        }
        Statement::Assign { targets, exprs, .. } => {
            render_expr_list(out, targets);
            out.push_str(" = ");
            render_expr_list(out, exprs);
            out.push('\n');
        }
        Statement::ExprStat { expr, .. } => {
            render_expr(out, expr);
            out.push('\n');
        }
        Statement::If { arms, else_block, .. } => {
            for (i, (condition, body)) in arms.iter().enumerate() {
                if i == 0 {
                    out.push_str("if ");
                } else {
                    indent(out, level);
                    out.push_str("elseif ");
                }
                render_expr(out, condition);
                out.push_str(" then\n");
                render_block(out, body, level + 1);
            }
            if let Some(body) = else_block {
                indent(out, level);
                out.push_str("else\n");
                render_block(out, body, level + 1);
            }
            indent(out, level);
            out.push_str("end\n");
        }
        Statement::NumericFor {
            var,
            start,
            stop,
            step,
            body,
            ..
        } => {
            let _ = write!(out, "for {} = ", var);
            render_expr(out, start);
            out.push_str(", ");
            render_expr(out, stop);
            if let Some(step) = step {
                out.push_str(", ");
                render_expr(out, step);
            }
            out.push_str(" do\n");
            render_block(out, body, level + 1);
            indent(out, level);
            out.push_str("end\n");
        }
        Statement::IterFor {
            names, iter, body, ..
        } => {
            let _ = write!(out, "for {} in ", names.join(", "));
            render_expr(out, iter);
            out.push_str(" do\n");
            render_block(out, body, level + 1);
            indent(out, level);
            out.push_str("end\n");
        }
        Statement::While { condition, body, .. } => {
            out.push_str("while ");
            render_expr(out, condition);
            out.push_str(" do\n");
            render_block(out, body, level + 1);
            indent(out, level);
            out.push_str("end\n");
        }
        Statement::Do { body, .. } => {
            out.push_str("do\n");
            render_block(out, body, level + 1);
            indent(out, level);
            out.push_str("end\n");
        }
        Statement::FunctionDecl { target, body, .. } => {
            out.push_str("function ");
            match target {
                FunctionTarget::Name(name) => out.push_str(name),
                FunctionTarget::Member { table, name } => {
                    let _ = write!(out, "{}.{}", table, name);
                }
                FunctionTarget::Method { table, name } => {
                    let _ = write!(out, "{}:{}", table, name);
                }
            }
            render_function_body(out, body, level);
        }
        Statement::LocalFunction { name, body, .. } => {
            let _ = write!(out, "local function {}", name);
            render_function_body(out, body, level);
        }
        Statement::Return { expr, .. } => {
            out.push_str("return");
            if let Some(expr) = expr {
                out.push(' ');
                render_expr(out, expr);
            }
            out.push('\n');
        }
        Statement::Break { .. } => out.push_str("break\n"),
        Statement::Goto { label, .. } => {
            let _ = writeln!(out, "goto {}", label);
        }
        Statement::Label { name, .. } => {
            let _ = writeln!(out, "::{}::", name);
        }
        Statement::TypeDecl {
            name, generics, ty, ..
        } => {
            let _ = write!(out, "type {}", name);
            if !generics.is_empty() {
                let _ = write!(out, "<{}>", generics.join(", "));
            }
            out.push_str(" = ");
            render_type(out, ty);
            out.push('\n');
        }
    }
}

fn render_function_body(out: &mut String, body: &FunctionBody, level: usize) {
    out.push('(');
    for (i, param) in body.params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&param.name);
        if let Some(annotation) = &param.annotation {
            out.push_str(": ");
            render_type(out, annotation);
        }
    }
    out.push(')');
    if let Some(ret) = &body.return_annotation {
        out.push_str(": ");
        render_type(out, ret);
    }
    out.push('\n');
    render_block(out, &body.block, level + 1);
    indent(out, level);
    out.push_str("end\n");
}

fn render_expr_list(out: &mut String, exprs: &[Expr]) {
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        render_expr(out, expr);
    }
}

fn render_string_literal(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
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

fn render_expr(out: &mut String, expr: &Expr) {
    match expr {
        Expr::Nil { .. } => out.push_str("nil"),
        Expr::True { .. } => out.push_str("true"),
        Expr::False { .. } => out.push_str("false"),
        Expr::Int { value, .. } => {
            let _ = write!(out, "{}", value);
        }
        Expr::Number { value, .. } => {
            // keep a trailing decimal so the literal re-lexes as a float
            if value.fract() == 0.0 && value.is_finite() {
                let _ = write!(out, "{:.1}", value);
            } else {
                let _ = write!(out, "{}", value);
            }
        }
        Expr::Str { value, .. } => render_string_literal(out, value),
        Expr::Name { name, .. } => out.push_str(name),
        Expr::Function { body, .. } => {
            out.push_str("function");
            // anonymous functions render inline with a single-space body
            out.push('(');
            for (i, param) in body.params.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&param.name);
                if let Some(annotation) = &param.annotation {
                    out.push_str(": ");
                    render_type(out, annotation);
                }
            }
            out.push(')');
            if let Some(ret) = &body.return_annotation {
                out.push_str(": ");
                render_type(out, ret);
            }
            out.push(' ');
            let mut inner = String::new();
            render_block(&mut inner, &body.block, 0);
            out.push_str(inner.trim_end().replace('\n', " ").as_str());
            out.push_str(" end");
        }
        Expr::Table {
            array_items,
            map_items,
            ..
        } => {
            out.push('{');
            let mut first = true;
            for item in array_items {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                render_expr(out, item);
            }
            for (key, value) in map_items {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                match key {
                    TableKeyExpr::Name(name) => {
                        let _ = write!(out, "{} = ", name);
                    }
                    TableKeyExpr::Expr(key) => {
                        out.push('[');
                        render_expr(out, key);
                        out.push_str("] = ");
                    }
                }
                render_expr(out, value);
            }
            out.push('}');
        }
        Expr::Member { object, name, .. } => {
            render_expr(out, object);
            let _ = write!(out, ".{}", name);
        }
        Expr::Index { object, index, .. } => {
            render_expr(out, object);
            out.push('[');
            render_expr(out, index);
            out.push(']');
        }
        Expr::Call { function, args, .. } => {
            render_expr(out, function);
            out.push('(');
            render_expr_list(out, args);
            out.push(')');
        }
        Expr::MethodCall {
            object,
            method,
            args,
            ..
        } => {
            render_expr(out, object);
            let _ = write!(out, ":{}", method);
            out.push('(');
            render_expr_list(out, args);
            out.push(')');
        }
        Expr::BinOp { op, lhs, rhs, .. } => {
            render_operand(out, lhs);
            let _ = write!(out, " {} ", op.symbol());
            render_operand(out, rhs);
        }
        Expr::UnOp { op, operand, .. } => {
            match op {
                crate::parser::ast::UnOp::Not => out.push_str("not "),
                other => out.push_str(other.symbol()),
            }
            render_operand(out, operand);
        }
    }
}

/// Operands of composite expressions are parenthesized when they are
/// themselves operators, which sidesteps re-deriving precedence here
fn render_operand(out: &mut String, expr: &Expr) {
    if matches!(expr, Expr::BinOp { .. } | Expr::UnOp { .. }) {
        out.push('(');
        render_expr(out, expr);
        out.push(')');
    } else {
        render_expr(out, expr);
    }
}

fn render_type(out: &mut String, ty: &TypeExpr) {
    match ty {
        TypeExpr::Named { name, args, .. } => {
            out.push_str(name);
            if !args.is_empty() {
                out.push('<');
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    render_type(out, arg);
                }
                out.push('>');
            }
        }
        TypeExpr::Record { fields, .. } => {
            out.push_str("{ ");
            for (i, (name, field_ty)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{}: ", name);
                render_type(out, field_ty);
            }
            out.push_str(" }");
        }
        TypeExpr::Function { params, ret, .. } => {
            out.push('(');
            for (i, param) in params.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_type(out, param);
            }
            out.push_str(") => ");
            render_type(out, ret);
        }
        TypeExpr::Union { members, .. } => {
            for (i, member) in members.iter().enumerate() {
                if i > 0 {
                    out.push_str(" | ");
                }
                match member {
                    UnionMember::Str(s) => render_string_literal(out, s),
                    UnionMember::Int(v) => {
                        let _ = write!(out, "{}", v);
                    }
                    UnionMember::Bool(b) => {
                        let _ = write!(out, "{}", b);
                    }
                    UnionMember::Type(t) => render_type(out, t),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_syntax;

    fn normalize(source: &str) -> String {
        render_chunk(&parse_syntax(&tokenize(source).unwrap()).unwrap())
    }

    #[test]
    fn test_render_is_reparseable_and_stable() {
        let source = "let x=1\nif x>0 then\nprint(x)\nelse\nprint(0-x)\nend";
        let first = normalize(source);
        let second = normalize(&first);
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_function() {
        let rendered = normalize("function add(a: number, b: number): number\nreturn a+b\nend");
        assert!(rendered.contains("function add(a: number, b: number): number"));
        assert!(rendered.contains("return a + b"));
    }

    #[test]
    fn test_render_types() {
        let rendered = normalize("type Mode = \"fast\" | \"safe\"\nlet m: Mode = \"fast\"");
        assert!(rendered.contains("type Mode = \"fast\" | \"safe\""));
    }
}
