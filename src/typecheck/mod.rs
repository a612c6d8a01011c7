//! Static type checker
//!
//! Walks the AST, resolving a type environment with primitives, generics,
//! records, container types, union-of-literal types and function types.
//! Errors are collected into a list rather than short-circuiting, so one
//! pass reports every independent problem it can find. In contract mode the
//! checker additionally enforces the contract-specific rules (storage schema
//! whitelist, lifecycle API protection, eager import resolution) and
//! extracts the contract/storage types for the module metadata.

pub mod contract;
mod env;
mod normalize;
pub mod types;

pub use env::{contract_record, is_whitelisted_global, BUILTIN_GLOBALS, GLOBAL_WHITELIST};
pub use types::{FuncType, RecordType, Type, UnionAlt};

use crate::parser::ast::{
    Block, Chunk, Expr, FunctionBody, FunctionTarget, Statement, TableKeyExpr, TypeExpr, UnOp,
};
use env::{Binding, TypeDef, TypeEnv};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use types::{match_overload, render_signatures, OPERATOR_OVERLOADS};

/// The four engine-invoked lifecycle APIs
pub const LIFECYCLE_APIS: [&str; 4] = ["init", "on_deposit", "on_destroy", "on_upgrade"];

/// Maximum type-alias expansion depth before recursion is reported
const MAX_TYPE_DEPTH: usize = 32;

/// Checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Plain,
    Contract,
}

/// A collected type error, line-located
#[derive(Debug, Clone, PartialEq, Error)]
#[error("type error at line {line}: {message}")]
pub struct TypeError {
    pub line: usize,
    pub message: String,
}

impl TypeError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Host-side contract existence predicate used for eager import checks
pub trait ContractRegistry {
    fn contract_exists(&self, name: &str) -> bool;
    fn contract_exists_by_address(&self, address: &str) -> bool;
}

/// A registry that knows no contracts; plain-mode checks never consult it
pub struct EmptyRegistry;

impl ContractRegistry for EmptyRegistry {
    fn contract_exists(&self, _name: &str) -> bool {
        false
    }
    fn contract_exists_by_address(&self, _address: &str) -> bool {
        false
    }
}

/// One resolved binding for the tooling dump
#[derive(Debug, Clone, Serialize)]
pub struct BindingInfo {
    pub name: String,
    pub line: usize,
    pub ty: String,
}

/// Output of a successful check
#[derive(Debug, Clone)]
pub struct CheckedProgram {
    /// The checked tree, reused as the compiler's input
    pub chunk: Chunk,
    /// Canonical re-serialization of the program
    pub normalized_source: String,
    /// Contract record type (contract mode only)
    pub contract_type: Option<Type>,
    /// Declared storage record type (contract mode only)
    pub storage_type: Option<Type>,
    /// Distinct literal event names passed to `emit`, sorted
    pub event_names: Vec<String>,
    /// Exported API names of the returned module table, in declaration order
    pub api_names: Vec<String>,
    /// Resolved bindings with inferred types
    pub bindings: Vec<BindingInfo>,
}

impl CheckedProgram {
    /// Tooling dump of every resolved binding's inferred type
    pub fn binding_dump_json(&self) -> String {
        serde_json::to_string_pretty(&self.bindings).unwrap_or_default()
    }
}

/// Type-check a chunk
pub fn check(
    chunk: &Chunk,
    mode: CheckMode,
    registry: &dyn ContractRegistry,
) -> Result<CheckedProgram, Vec<TypeError>> {
    let mut checker = Checker::new(mode, registry);
    checker.check_block(&chunk.block);

    let mut contract_type = None;
    let mut storage_type = None;
    let mut api_names = Vec::new();
    if mode == CheckMode::Contract {
        let outcome = contract::validate_contract(&mut checker, chunk);
        contract_type = outcome.contract_type;
        storage_type = outcome.storage_type;
        api_names = outcome.api_names;
    } else if let Some(name) = checker.returned_name.clone() {
        api_names = contract::collect_module_apis(chunk, &name);
    }

    if !checker.errors.is_empty() {
        return Err(checker.errors);
    }

    let bindings = checker
        .env
        .binding_dump()
        .iter()
        .map(|(name, line, ty)| BindingInfo {
            name: name.clone(),
            line: *line,
            ty: ty.to_string(),
        })
        .collect();

    Ok(CheckedProgram {
        chunk: chunk.clone(),
        normalized_source: normalize::render_chunk(chunk),
        contract_type,
        storage_type,
        event_names: checker.event_names.into_iter().collect(),
        api_names,
        bindings,
    })
}

struct FuncCtx {
    declared_ret: Option<Type>,
    observed_ret: Option<Type>,
}

pub(crate) struct Checker<'a> {
    env: TypeEnv,
    pub(crate) errors: Vec<TypeError>,
    mode: CheckMode,
    registry: &'a dyn ContractRegistry,
    event_names: BTreeSet<String>,
    func_stack: Vec<FuncCtx>,
    generics_in_scope: Vec<String>,
    /// Name returned by the chunk's top-level `return`, if it is a name
    pub(crate) returned_name: Option<String>,
    /// Type of the chunk's top-level returned expression
    pub(crate) chunk_return_type: Option<Type>,
    pub(crate) chunk_return_line: usize,
}

impl<'a> Checker<'a> {
    fn new(mode: CheckMode, registry: &'a dyn ContractRegistry) -> Self {
        Self {
            env: TypeEnv::new(),
            errors: Vec::new(),
            mode,
            registry,
            event_names: BTreeSet::new(),
            func_stack: Vec::new(),
            generics_in_scope: Vec::new(),
            returned_name: None,
            chunk_return_type: None,
            chunk_return_line: 0,
        }
    }

    pub(crate) fn error(&mut self, line: usize, message: impl Into<String>) {
        self.errors.push(TypeError::new(line, message));
    }

    // ----- type resolution -----

    fn resolve_type(&mut self, expr: &TypeExpr) -> Type {
        self.resolve_type_with(expr, &HashMap::new(), 0)
    }

    fn resolve_type_with(
        &mut self,
        expr: &TypeExpr,
        subst: &HashMap<String, Type>,
        depth: usize,
    ) -> Type {
        if depth > MAX_TYPE_DEPTH {
            self.error(expr.line(), "type alias expansion too deep");
            return Type::Object;
        }
        match expr {
            TypeExpr::Named { name, args, line } => {
                self.resolve_named_type(name, args, *line, subst, depth)
            }
            TypeExpr::Record { fields, line: _ } => {
                let resolved: Vec<(String, Type)> = fields
                    .iter()
                    .map(|(n, t)| (n.clone(), self.resolve_type_with(t, subst, depth + 1)))
                    .collect();
                Type::Record(Arc::new(RecordType {
                    name: "record".to_string(),
                    fields: resolved,
                }))
            }
            TypeExpr::Function { params, ret, .. } => {
                let params = params
                    .iter()
                    .map(|p| self.resolve_type_with(p, subst, depth + 1))
                    .collect();
                let ret = self.resolve_type_with(ret, subst, depth + 1);
                Type::Func(Arc::new(FuncType::new(params, ret)))
            }
            TypeExpr::Union { members, .. } => {
                let alts = members
                    .iter()
                    .map(|m| match m {
                        crate::parser::ast::UnionMember::Str(s) => UnionAlt::Str(s.clone()),
                        crate::parser::ast::UnionMember::Int(i) => UnionAlt::Int(*i),
                        crate::parser::ast::UnionMember::Bool(b) => UnionAlt::Bool(*b),
                        crate::parser::ast::UnionMember::Type(t) => {
                            UnionAlt::Type(self.resolve_type_with(t, subst, depth + 1))
                        }
                    })
                    .collect();
                Type::Union(alts)
            }
        }
    }

    fn resolve_named_type(
        &mut self,
        name: &str,
        args: &[TypeExpr],
        line: usize,
        subst: &HashMap<String, Type>,
        depth: usize,
    ) -> Type {
        let primitive = match name {
            "int" => Some(Type::Int),
            "number" => Some(Type::Number),
            "bool" => Some(Type::Bool),
            "string" => Some(Type::String),
            "table" => Some(Type::Table),
            "function" => Some(Type::Function),
            "object" => Some(Type::Object),
            "nil" => Some(Type::Nil),
            _ => None,
        };
        if let Some(ty) = primitive {
            if !args.is_empty() {
                self.error(line, format!("type '{}' does not take generic arguments", name));
            }
            return ty;
        }

        if let Some(ty) = subst.get(name) {
            if !args.is_empty() {
                self.error(line, format!("generic parameter '{}' cannot be instantiated", name));
            }
            return ty.clone();
        }

        if self.generics_in_scope.iter().any(|g| g == name) {
            return Type::Generic(name.to_string());
        }

        match name {
            "Array" | "Map" => {
                if args.len() != 1 {
                    self.error(
                        line,
                        format!("generic type '{}' expects 1 argument, got {}", name, args.len()),
                    );
                    return Type::Table;
                }
                let inner = self.resolve_type_with(&args[0], subst, depth + 1);
                if name == "Array" {
                    Type::Array(Box::new(inner))
                } else {
                    Type::Map(Box::new(inner))
                }
            }
            "Contract" => {
                if args.len() != 1 {
                    self.error(
                        line,
                        format!("generic type 'Contract' expects 1 argument, got {}", args.len()),
                    );
                    return Type::Object;
                }
                let storage = self.resolve_type_with(&args[0], subst, depth + 1);
                contract_record(storage)
            }
            _ => {
                let def = match self.env.type_def(name).cloned() {
                    Some(def) => def,
                    None => {
                        self.error(line, format!("unknown type '{}'", name));
                        return Type::Object;
                    }
                };
                if def.generics.len() != args.len() {
                    self.error(
                        line,
                        format!(
                            "generic type '{}' expects {} argument(s), got {}",
                            name,
                            def.generics.len(),
                            args.len()
                        ),
                    );
                    return Type::Object;
                }
                let mut inner_subst = HashMap::new();
                for (g, a) in def.generics.iter().zip(args) {
                    inner_subst.insert(g.clone(), self.resolve_type_with(a, subst, depth + 1));
                }
                let resolved = self.resolve_type_with(&def.body, &inner_subst, depth + 1);
                // a record alias takes its declared name
                if let Type::Record(rec) = &resolved {
                    if rec.name == "record" {
                        return Type::Record(Arc::new(RecordType {
                            name: name.to_string(),
                            fields: rec.fields.clone(),
                        }));
                    }
                }
                resolved
            }
        }
    }

    // ----- statements -----

    fn check_block(&mut self, block: &Block) {
        for statement in &block.statements {
            self.check_statement(statement);
        }
    }

    fn check_scoped_block(&mut self, block: &Block) {
        self.env.push_scope();
        self.check_block(block);
        self.env.pop_scope();
    }

    fn check_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Declare {
                names,
                annotations,
                exprs,
                mutable,
                line,
            } => self.check_declare(names, annotations, exprs, *mutable, *line),
            Statement::Assign { targets, exprs, line } => self.check_assign(targets, exprs, *line),
            Statement::ExprStat { expr, .. } => {
                self.check_expr(expr);
            }
            Statement::If { arms, else_block, .. } => {
                for (condition, body) in arms {
                    self.check_expr(condition);
                    self.check_scoped_block(body);
                }
                if let Some(body) = else_block {
                    self.check_scoped_block(body);
                }
            }
            Statement::NumericFor {
                var,
                start,
                stop,
                step,
                body,
                line,
            } => {
                let t_start = self.check_expr(start);
                let t_stop = self.check_expr(stop);
                let t_step = step.as_ref().map(|s| self.check_expr(s));
                let mut numeric = true;
                for t in [Some(&t_start), Some(&t_stop), t_step.as_ref()].into_iter().flatten() {
                    if !Type::Number.accepts(t) {
                        self.error(
                            *line,
                            format!("numeric for bound must be int or number, got {}", t),
                        );
                        numeric = false;
                    }
                }
                let var_ty = if numeric
                    && t_start == Type::Int
                    && t_stop == Type::Int
                    && t_step.map_or(true, |t| t == Type::Int)
                {
                    Type::Int
                } else {
                    Type::Number
                };
                self.env.push_scope();
                self.env.declare(Binding {
                    name: var.clone(),
                    ty: var_ty,
                    mutable: false,
                    initialized: true,
                    line: *line,
                });
                self.check_block(body);
                self.env.pop_scope();
            }
            Statement::IterFor {
                names,
                iter,
                body,
                line,
            } => {
                let iter_ty = self.check_expr(iter);
                let (key_ty, value_ty) = iteration_types(&iter_ty, iter);
                self.env.push_scope();
                for (i, name) in names.iter().enumerate() {
                    let ty = match i {
                        0 => key_ty.clone(),
                        1 => value_ty.clone(),
                        _ => Type::Nil,
                    };
                    self.env.declare(Binding {
                        name: name.clone(),
                        ty,
                        mutable: false,
                        initialized: true,
                        line: *line,
                    });
                }
                self.check_block(body);
                self.env.pop_scope();
            }
            Statement::While { condition, body, .. } => {
                self.check_expr(condition);
                self.check_scoped_block(body);
            }
            Statement::Do { body, .. } => self.check_scoped_block(body),
            Statement::FunctionDecl { target, body, line } => {
                self.check_function_decl(target, body, *line)
            }
            Statement::LocalFunction { name, body, line } => {
                if self.env.declared_in_current_scope(name) {
                    self.error(*line, format!("'{}' is already declared in this scope", name));
                }
                // declare before checking the body so recursion resolves
                let sig = self.signature_of(body);
                self.env.declare(Binding {
                    name: name.clone(),
                    ty: sig,
                    mutable: false,
                    initialized: true,
                    line: *line,
                });
                self.check_function_body(body, None);
            }
            Statement::Return { expr, line } => {
                let ty = expr.as_ref().map(|e| self.check_expr(e)).unwrap_or(Type::Nil);
                if !self.func_stack.is_empty() {
                    let declared = self
                        .func_stack
                        .last()
                        .and_then(|ctx| ctx.declared_ret.clone());
                    match declared {
                        Some(declared) => {
                            if !declared.accepts(&ty) {
                                self.error(
                                    *line,
                                    format!(
                                        "return type mismatch: declared {}, got {}",
                                        declared, ty
                                    ),
                                );
                            }
                        }
                        None => {
                            let ctx = self.func_stack.last_mut().expect("function context");
                            ctx.observed_ret = Some(match ctx.observed_ret.take() {
                                None => ty,
                                Some(prev) if prev == ty => prev,
                                Some(_) => Type::Object,
                            });
                        }
                    }
                } else {
                    self.chunk_return_line = *line;
                    self.chunk_return_type = Some(ty);
                    if let Some(Expr::Name { name, .. }) = expr {
                        self.returned_name = Some(name.clone());
                    }
                }
            }
            Statement::Break { .. } | Statement::Goto { .. } | Statement::Label { .. } => {}
            Statement::TypeDecl {
                name,
                generics,
                ty,
                line,
            } => {
                let def = TypeDef {
                    generics: generics.clone(),
                    body: ty.clone(),
                    line: *line,
                };
                if !self.env.define_type(name, def) {
                    self.error(*line, format!("type '{}' is already declared", name));
                    return;
                }
                // resolve eagerly with generics bound so malformed bodies
                // are reported at the declaration
                let saved = self.generics_in_scope.len();
                self.generics_in_scope.extend(generics.iter().cloned());
                let body = ty.clone();
                self.resolve_type(&body);
                self.generics_in_scope.truncate(saved);
            }
        }
    }

    fn check_declare(
        &mut self,
        names: &[String],
        annotations: &[Option<TypeExpr>],
        exprs: &[Expr],
        mutable: bool,
        line: usize,
    ) {
        let expr_types: Vec<Type> = exprs.iter().map(|e| self.check_expr(e)).collect();
        for (i, name) in names.iter().enumerate() {
            if self.env.declared_in_current_scope(name) {
                self.error(line, format!("'{}' is already declared in this scope", name));
                continue;
            }
            let annotation = annotations.get(i).and_then(|a| a.as_ref());
            let declared = annotation.map(|a| self.resolve_type(a));
            let value = exprs.get(i);
            let value_ty = expr_types.get(i).cloned();

            if let (Some(declared), Some(value_ty)) = (&declared, &value_ty) {
                self.check_value_against(declared, value_ty, value, line, name);
            }

            let ty = match (declared, value_ty) {
                (Some(d), _) => d,
                (None, Some(Type::Nil)) | (None, None) => Type::Object,
                (None, Some(t)) => t,
            };
            let initialized = mutable || value.is_some();
            self.env.declare(Binding {
                name: name.clone(),
                ty,
                mutable,
                initialized,
                line,
            });
        }
    }

    /// Declared-type vs value check, with exact-literal matching for unions
    /// and field checking for table literals against records
    fn check_value_against(
        &mut self,
        declared: &Type,
        value_ty: &Type,
        value: Option<&Expr>,
        line: usize,
        what: &str,
    ) {
        if let (Type::Union(alts), Some(expr)) = (declared, value) {
            if let Some(ok) = literal_matches_union(alts, expr) {
                if !ok {
                    self.error(
                        line,
                        format!(
                            "value for '{}' is not one of the declared alternatives {}",
                            what, declared
                        ),
                    );
                }
                return;
            }
        }
        if let (Type::Record(record), Some(Expr::Table { map_items, array_items, .. })) =
            (declared, value)
        {
            if !array_items.is_empty() {
                self.error(
                    line,
                    format!("record {} cannot be built from an array-style table", record.shape()),
                );
            }
            for (key, item) in map_items {
                if let TableKeyExpr::Name(field) = key {
                    match record.field(field) {
                        Some(field_ty) => {
                            let field_ty = field_ty.clone();
                            let item_ty = self.check_expr(item);
                            if !field_ty.accepts(&item_ty) {
                                self.error(
                                    line,
                                    format!(
                                        "field '{}' of record {} expects {}, got {}",
                                        field,
                                        record.shape(),
                                        field_ty,
                                        item_ty
                                    ),
                                );
                            }
                        }
                        None => {
                            self.error(
                                line,
                                format!("record {} has no field '{}'", record.shape(), field),
                            );
                        }
                    }
                }
            }
            return;
        }
        if !declared.accepts(value_ty) {
            self.error(
                line,
                format!("cannot assign {} to '{}' declared as {}", value_ty, what, declared),
            );
        }
    }

    fn check_assign(&mut self, targets: &[Expr], exprs: &[Expr], line: usize) {
        let expr_types: Vec<Type> = exprs.iter().map(|e| self.check_expr(e)).collect();
        for (i, target) in targets.iter().enumerate() {
            let value_ty = expr_types.get(i).cloned().unwrap_or(Type::Nil);
            let value = exprs.get(i);
            match target {
                Expr::Name { name, line } => {
                    let line = *line;
                    let binding = self
                        .env
                        .lookup(name)
                        .map(|b| (b.mutable, b.initialized, b.ty.clone()));
                    match binding {
                        None => {
                            if is_whitelisted_global(name) {
                                self.error(
                                    line,
                                    format!("cannot assign to builtin global '{}'", name),
                                );
                            } else {
                                self.error(
                                    line,
                                    format!(
                                        "use of undeclared name '{}' (global bindings cannot be created)",
                                        name
                                    ),
                                );
                            }
                        }
                        Some((mutable, initialized, declared)) => {
                            if !mutable && initialized {
                                self.error(
                                    line,
                                    format!("cannot reassign immutable binding '{}'", name),
                                );
                            } else {
                                self.check_value_against(&declared, &value_ty, value, line, name);
                                if let Some(binding) = self.env.lookup_mut(name) {
                                    binding.initialized = true;
                                }
                            }
                        }
                    }
                }
                Expr::Member { object, name, line } => {
                    let obj_ty = self.check_expr(object);
                    if let Type::Record(record) = &obj_ty {
                        match record.field(name) {
                            Some(field_ty) => {
                                if !field_ty.accepts(&value_ty) {
                                    let field_ty = field_ty.clone();
                                    self.error(
                                        *line,
                                        format!(
                                            "field '{}' of record {} expects {}, got {}",
                                            name,
                                            record.shape(),
                                            field_ty,
                                            value_ty
                                        ),
                                    );
                                }
                            }
                            None => {
                                let shape = record.shape();
                                self.error(
                                    *line,
                                    format!("record {} has no field '{}'", shape, name),
                                );
                            }
                        }
                    }
                }
                Expr::Index { object, index, line } => {
                    let obj_ty = self.check_expr(object);
                    let index_ty = self.check_expr(index);
                    match obj_ty {
                        Type::Array(elem) => {
                            if !Type::Int.accepts(&index_ty) {
                                self.error(*line, format!("array index must be int, got {}", index_ty));
                            }
                            if !elem.accepts(&value_ty) {
                                self.error(
                                    *line,
                                    format!("array element expects {}, got {}", elem, value_ty),
                                );
                            }
                        }
                        Type::Map(elem) => {
                            if !Type::String.accepts(&index_ty) {
                                self.error(*line, format!("map key must be string, got {}", index_ty));
                            }
                            if !elem.accepts(&value_ty) {
                                self.error(
                                    *line,
                                    format!("map value expects {}, got {}", elem, value_ty),
                                );
                            }
                        }
                        _ => {}
                    }
                }
                other => {
                    self.error(line, format!("invalid assignment target {:?}", other));
                }
            }
        }
    }

    fn check_function_decl(&mut self, target: &FunctionTarget, body: &FunctionBody, line: usize) {
        match target {
            FunctionTarget::Name(name) => {
                let sig = self.signature_of(body);
                if self.env.lookup(name).is_none() {
                    self.env.declare(Binding {
                        name: name.clone(),
                        ty: sig,
                        mutable: false,
                        initialized: true,
                        line,
                    });
                } else if self.env.declared_in_current_scope(name) {
                    self.error(line, format!("'{}' is already declared in this scope", name));
                }
                self.check_function_body(body, None);
            }
            FunctionTarget::Member { table, name: _ } | FunctionTarget::Method { table, name: _ } => {
                if self.env.lookup(table).is_none() {
                    self.error(line, format!("use of undeclared name '{}'", table));
                }
                let implicit_self = matches!(target, FunctionTarget::Method { .. });
                self.check_function_body(body, implicit_self.then_some("self"));
            }
        }
    }

    fn signature_of(&mut self, body: &FunctionBody) -> Type {
        let params = body
            .params
            .iter()
            .map(|p| {
                p.annotation
                    .as_ref()
                    .map(|a| self.resolve_type(a))
                    .unwrap_or(Type::Object)
            })
            .collect();
        let ret = body
            .return_annotation
            .as_ref()
            .map(|a| self.resolve_type(a))
            .unwrap_or(Type::Object);
        Type::Func(Arc::new(FuncType::new(params, ret)))
    }

    fn check_function_body(&mut self, body: &FunctionBody, implicit_self: Option<&str>) -> Type {
        let declared_ret = body.return_annotation.as_ref().map(|a| self.resolve_type(a));
        self.env.push_scope();
        if let Some(self_name) = implicit_self {
            self.env.declare(Binding {
                name: self_name.to_string(),
                ty: Type::Object,
                mutable: false,
                initialized: true,
                line: body.line,
            });
        }
        let mut params = Vec::new();
        for param in &body.params {
            let ty = param
                .annotation
                .as_ref()
                .map(|a| self.resolve_type(a))
                .unwrap_or(Type::Object);
            params.push(ty.clone());
            if self.env.declared_in_current_scope(&param.name) {
                self.error(
                    body.line,
                    format!("parameter '{}' is declared twice", param.name),
                );
            }
            self.env.declare(Binding {
                name: param.name.clone(),
                ty,
                mutable: true,
                initialized: true,
                line: body.line,
            });
        }
        self.func_stack.push(FuncCtx {
            declared_ret: declared_ret.clone(),
            observed_ret: None,
        });
        self.check_block(&body.block);
        let ctx = self.func_stack.pop().expect("function context");
        self.env.pop_scope();
        let ret = declared_ret
            .or(ctx.observed_ret)
            .unwrap_or(Type::Nil);
        Type::Func(Arc::new(FuncType::new(params, ret)))
    }

    // ----- expressions -----

    fn check_expr(&mut self, expr: &Expr) -> Type {
        match expr {
            Expr::Nil { .. } => Type::Nil,
            Expr::True { .. } | Expr::False { .. } => Type::Bool,
            Expr::Int { .. } => Type::Int,
            Expr::Number { .. } => Type::Number,
            Expr::Str { .. } => Type::String,
            Expr::Name { name, line } => self.check_name(name, *line),
            Expr::Function { body, .. } => self.check_function_body(body, None),
            Expr::Table {
                array_items,
                map_items,
                ..
            } => {
                for item in array_items {
                    self.check_expr(item);
                }
                for (key, value) in map_items {
                    if let TableKeyExpr::Expr(key) = key {
                        self.check_expr(key);
                    }
                    self.check_expr(value);
                }
                Type::Table
            }
            Expr::Member { object, name, line } => {
                let obj_ty = self.check_expr(object);
                match &obj_ty {
                    Type::Record(record) => match record.field(name) {
                        Some(ty) => ty.clone(),
                        None => {
                            let shape = record.shape();
                            self.error(*line, format!("record {} has no field '{}'", shape, name));
                            Type::Object
                        }
                    },
                    _ => Type::Object,
                }
            }
            Expr::Index { object, index, line } => {
                let obj_ty = self.check_expr(object);
                let index_ty = self.check_expr(index);
                match obj_ty {
                    Type::Array(elem) => {
                        if !Type::Int.accepts(&index_ty) {
                            self.error(*line, format!("array index must be int, got {}", index_ty));
                        }
                        *elem
                    }
                    Type::Map(value) => {
                        if !Type::String.accepts(&index_ty) {
                            self.error(*line, format!("map key must be string, got {}", index_ty));
                        }
                        *value
                    }
                    _ => Type::Object,
                }
            }
            Expr::Call { function, args, line } => self.check_call(function, args, *line),
            Expr::MethodCall {
                object,
                method,
                args,
                line,
            } => {
                if self.mode == CheckMode::Contract && LIFECYCLE_APIS.contains(&method.as_str()) {
                    self.error(
                        *line,
                        format!(
                            "lifecycle api '{}' cannot be invoked from contract code",
                            method
                        ),
                    );
                }
                self.check_expr(object);
                for arg in args {
                    self.check_expr(arg);
                }
                Type::Object
            }
            Expr::BinOp { op, lhs, rhs, line } => {
                let lt = self.check_expr(lhs);
                let rt = self.check_expr(rhs);
                self.check_operator(op.symbol(), &[lt, rt], *line)
            }
            Expr::UnOp { op, operand, line } => {
                let ot = self.check_expr(operand);
                let key = match op {
                    UnOp::Neg => "unary-",
                    UnOp::Not => "not",
                    UnOp::Len => "#",
                };
                self.check_operator(key, &[ot], *line)
            }
        }
    }

    fn check_name(&mut self, name: &str, line: usize) -> Type {
        if let Some(binding) = self.env.lookup(name) {
            let initialized = binding.initialized;
            let ty = binding.ty.clone();
            if !initialized {
                self.error(
                    line,
                    format!("use of '{}' before it has been initialized", name),
                );
            }
            return ty;
        }
        if let Some(ty) = BUILTIN_GLOBALS.get(name) {
            return ty.clone();
        }
        self.error(line, format!("use of undeclared name '{}'", name));
        Type::Object
    }

    fn check_operator(&mut self, symbol: &str, args: &[Type], line: usize) -> Type {
        // and/or keep the operand type when both sides agree
        if (symbol == "and" || symbol == "or") && args.len() == 2 && args[0] == args[1] {
            return args[0].clone();
        }
        let overloads = match OPERATOR_OVERLOADS.get(symbol) {
            Some(o) => o,
            None => return Type::Object,
        };
        match match_overload(overloads, args) {
            Some(sig) => sig.ret.clone(),
            None => {
                self.error(
                    line,
                    format!(
                        "operator '{}': declared {}, got {}",
                        symbol.trim_start_matches("unary"),
                        render_signatures(overloads),
                        Type::render_tuple(args)
                    ),
                );
                Type::Object
            }
        }
    }

    fn check_call(&mut self, function: &Expr, args: &[Expr], line: usize) -> Type {
        let arg_types: Vec<Type> = args.iter().map(|a| self.check_expr(a)).collect();
        let callee_name = callee_display_name(function);

        // contract-specific call rules
        if let Expr::Name { name, .. } = function {
            self.check_special_call(name, args, line);
        }
        if self.mode == CheckMode::Contract {
            if let Expr::Member { name, .. } = function {
                if LIFECYCLE_APIS.contains(&name.as_str()) {
                    self.error(
                        line,
                        format!(
                            "lifecycle api '{}' cannot be invoked from contract code",
                            name
                        ),
                    );
                }
            }
        }

        let callee_ty = self.check_expr(function);
        match callee_ty {
            Type::Func(sig) => {
                let arity_ok = sig.variadic || sig.params.len() == arg_types.len();
                let types_ok = sig
                    .params
                    .iter()
                    .zip(&arg_types)
                    .all(|(p, a)| p.accepts(a));
                if !arity_ok || !types_ok {
                    self.error(
                        line,
                        format!(
                            "call to '{}': declared {}, got {}",
                            callee_name,
                            Type::Func(sig.clone()),
                            Type::render_tuple(&arg_types)
                        ),
                    );
                }
                sig.ret.clone()
            }
            Type::Function | Type::Object | Type::Table => Type::Object,
            other => {
                self.error(
                    line,
                    format!(
                        "attempt to call a non-function value of type {} ('{}')",
                        other, callee_name
                    ),
                );
                Type::Object
            }
        }
    }

    /// emit collection, lifecycle protection, eager import resolution
    fn check_special_call(&mut self, name: &str, args: &[Expr], line: usize) {
        match name {
            "emit" => match args.first() {
                Some(Expr::Str { value, .. }) => {
                    self.event_names.insert(value.clone());
                }
                _ => self.error(line, "emit requires a string literal event name"),
            },
            "import_contract" if self.mode == CheckMode::Contract => {
                if let Some(Expr::Str { value, .. }) = args.first() {
                    if !self.registry.contract_exists(value) {
                        self.error(line, format!("imported contract '{}' does not exist", value));
                    }
                }
            }
            "import_contract_from_address" if self.mode == CheckMode::Contract => {
                if let Some(Expr::Str { value, .. }) = args.first() {
                    if !self.registry.contract_exists_by_address(value) {
                        self.error(
                            line,
                            format!("imported contract address '{}' does not exist", value),
                        );
                    }
                }
            }
            _ if self.mode == CheckMode::Contract && LIFECYCLE_APIS.contains(&name) => {
                // a bare-name call to a lifecycle api (e.g. a local named init)
                // is suspicious enough to reject in contract mode
                self.error(
                    line,
                    format!("lifecycle api '{}' cannot be invoked from contract code", name),
                );
            }
            _ => {}
        }
    }

    pub(crate) fn storage_field_allowed(ty: &Type) -> bool {
        matches!(
            ty,
            Type::Int
                | Type::Number
                | Type::Bool
                | Type::String
                | Type::Table
                | Type::Array(_)
                | Type::Map(_)
                | Type::Record(_)
        )
    }
}

/// Key/value types produced by iterating a value of `iter_ty`
fn iteration_types(iter_ty: &Type, iter_expr: &Expr) -> (Type, Type) {
    // see through pairs(t) / ipairs(t)
    if let Expr::Call { function, args, .. } = iter_expr {
        if let Expr::Name { name, .. } = function.as_ref() {
            if (name == "pairs" || name == "ipairs") && args.len() == 1 {
                return (Type::Object, Type::Object);
            }
        }
    }
    match iter_ty {
        Type::Array(elem) => (Type::Int, (**elem).clone()),
        Type::Map(value) => (Type::String, (**value).clone()),
        _ => (Type::Object, Type::Object),
    }
}

/// Exact literal matching against a union's alternatives; None when the
/// expression is not a literal
fn literal_matches_union(alts: &[UnionAlt], expr: &Expr) -> Option<bool> {
    match expr {
        Expr::Str { value, .. } => Some(alts.iter().any(|a| matches!(a, UnionAlt::Str(s) if s == value))),
        Expr::Int { value, .. } => Some(alts.iter().any(|a| {
            matches!(a, UnionAlt::Int(i) if i == value)
                || matches!(a, UnionAlt::Type(Type::Int))
        })),
        Expr::True { .. } => Some(alts.iter().any(|a| matches!(a, UnionAlt::Bool(true)))),
        Expr::False { .. } => Some(alts.iter().any(|a| matches!(a, UnionAlt::Bool(false)))),
        _ => None,
    }
}

fn callee_display_name(function: &Expr) -> String {
    match function {
        Expr::Name { name, .. } => name.clone(),
        Expr::Member { name, .. } => name.clone(),
        _ => "function".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_syntax;

    fn check_source(source: &str, mode: CheckMode) -> Result<CheckedProgram, Vec<TypeError>> {
        let chunk = parse_syntax(&tokenize(source).unwrap()).unwrap();
        check(&chunk, mode, &EmptyRegistry)
    }

    #[test]
    fn test_add_signature_inferred() {
        let program = check_source(
            "function add(a: number, b: number): number\nreturn a + b\nend\nlet x = add(1, 2)",
            CheckMode::Plain,
        )
        .unwrap();
        let add = program.bindings.iter().find(|b| b.name == "add").unwrap();
        assert_eq!(add.ty, "(number, number) => number");
    }

    #[test]
    fn test_call_argument_mismatch() {
        let errors = check_source(
            "function add(a: number, b: number): number\nreturn a + b\nend\nlet x = add(1, \"x\")",
            CheckMode::Plain,
        )
        .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("(number, number) => number"));
        assert!(errors[0].message.contains("(int, string)"));
        assert_eq!(errors[0].line, 4);
    }

    #[test]
    fn test_operator_mismatch_message_shape() {
        let errors = check_source("let x = 1 + \"a\"", CheckMode::Plain).unwrap_err();
        assert!(errors[0].message.contains("operator '+'"));
        assert!(errors[0].message.contains("(int, int) => int"));
        assert!(errors[0].message.contains("(int, string)"));
    }

    #[test]
    fn test_let_reassignment_rejected() {
        let errors = check_source("let x = 1\nx = 2", CheckMode::Plain).unwrap_err();
        assert!(errors[0].message.contains("immutable"));
    }

    #[test]
    fn test_let_use_before_init() {
        let errors = check_source("let x: int\nlet y = x + 1\nx = 2", CheckMode::Plain).unwrap_err();
        assert!(errors[0].message.contains("before it has been initialized"));
    }

    #[test]
    fn test_deferred_let_initialization_ok() {
        check_source("let x: int\nx = 2\nlet y = x + 1", CheckMode::Plain).unwrap();
    }

    #[test]
    fn test_redeclaration_rejected() {
        let errors = check_source("let x = 1\nlet x = 2", CheckMode::Plain).unwrap_err();
        assert!(errors[0].message.contains("already declared"));
    }

    #[test]
    fn test_shadowing_in_inner_scope_ok() {
        check_source("let x = 1\ndo\nlet x = 2\nend", CheckMode::Plain).unwrap();
    }

    #[test]
    fn test_record_field_access() {
        let source = "type Person = { name: string, age: int }\n\
                      let p: Person = { name = \"ada\", age = 36 }\n\
                      let n = p.name";
        let program = check_source(source, CheckMode::Plain).unwrap();
        let n = program.bindings.iter().find(|b| b.name == "n").unwrap();
        assert_eq!(n.ty, "string");
    }

    #[test]
    fn test_unknown_record_field_names_shape() {
        let source = "type Person = { name: string }\n\
                      let p: Person = { name = \"ada\" }\n\
                      let n = p.nope";
        let errors = check_source(source, CheckMode::Plain).unwrap_err();
        assert!(errors[0].message.contains("Person { name: string }"));
        assert!(errors[0].message.contains("'nope'"));
    }

    #[test]
    fn test_generic_arity_enforced() {
        let source = "type Pair<K, V> = { first: K, second: V }\nlet p: Pair<int> = nil";
        let errors = check_source(source, CheckMode::Plain).unwrap_err();
        assert!(errors[0].message.contains("expects 2 argument(s), got 1"));
    }

    #[test]
    fn test_generic_instantiation() {
        let source = "type Box<T> = { value: T }\n\
                      let b: Box<int> = { value = 1 }\n\
                      let v = b.value";
        let program = check_source(source, CheckMode::Plain).unwrap();
        let v = program.bindings.iter().find(|b| b.name == "v").unwrap();
        assert_eq!(v.ty, "int");
    }

    #[test]
    fn test_union_literal_assignment() {
        check_source("type Mode = \"fast\" | \"safe\"\nlet m: Mode = \"fast\"", CheckMode::Plain)
            .unwrap();
        let errors = check_source(
            "type Mode = \"fast\" | \"safe\"\nlet m: Mode = \"slow\"",
            CheckMode::Plain,
        )
        .unwrap_err();
        assert!(errors[0].message.contains("alternatives"));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let errors = check_source(
            "let a = 1 + \"x\"\nlet b = unknown_name\nlet c = 2 .. 3",
            CheckMode::Plain,
        )
        .unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_event_names_collected() {
        let program = check_source(
            "emit(\"Transfer\", \"{}\")\nemit(\"Minted\", \"{}\")\nemit(\"Transfer\", \"{}\")",
            CheckMode::Plain,
        )
        .unwrap();
        assert_eq!(program.event_names, vec!["Minted", "Transfer"]);
    }

    #[test]
    fn test_undeclared_assignment_rejected() {
        let errors = check_source("x = 5", CheckMode::Plain).unwrap_err();
        assert!(errors[0].message.contains("undeclared"));
    }
}
