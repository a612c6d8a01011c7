//! Lexical scope chain and builtin environment for the checker

use super::types::{FuncType, RecordType, Type};
use crate::parser::ast::TypeExpr;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A declared binding
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub ty: Type,
    pub mutable: bool,
    /// `let` bindings start uninitialized when declared without a value
    pub initialized: bool,
    pub line: usize,
}

/// A user type declaration, instantiated on use
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub generics: Vec<String>,
    pub body: TypeExpr,
    pub line: usize,
}

#[derive(Debug, Default)]
struct Scope {
    bindings: HashMap<String, Binding>,
}

/// Scope chain plus user type definitions
#[derive(Debug)]
pub struct TypeEnv {
    scopes: Vec<Scope>,
    type_defs: HashMap<String, TypeDef>,
    /// Bindings in declaration order, for the debug dump
    dump: Vec<(String, usize, Type)>,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            type_defs: HashMap::new(),
            dump: Vec::new(),
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    /// True when `name` is already declared in the innermost scope
    pub fn declared_in_current_scope(&self, name: &str) -> bool {
        self.scopes
            .last()
            .map(|s| s.bindings.contains_key(name))
            .unwrap_or(false)
    }

    pub fn declare(&mut self, binding: Binding) {
        self.dump
            .push((binding.name.clone(), binding.line, binding.ty.clone()));
        if let Some(scope) = self.scopes.last_mut() {
            scope.bindings.insert(binding.name.clone(), binding);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.bindings.get(name))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.bindings.get_mut(name))
    }

    pub fn define_type(&mut self, name: &str, def: TypeDef) -> bool {
        if self.type_defs.contains_key(name) {
            return false;
        }
        self.type_defs.insert(name.to_string(), def);
        true
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.type_defs.get(name)
    }

    /// Declaration-ordered binding dump for tooling
    pub fn binding_dump(&self) -> &[(String, usize, Type)] {
        &self.dump
    }
}

/// The reserved storage-bearing contract record: `Contract<S>` with fields
/// `id: string`, `name: string`, `storage: S`
pub fn contract_record(storage: Type) -> Type {
    Type::Record(Arc::new(RecordType {
        name: "Contract".to_string(),
        fields: vec![
            ("id".to_string(), Type::String),
            ("name".to_string(), Type::String),
            ("storage".to_string(), storage),
        ],
    }))
}

fn func(params: Vec<Type>, ret: Type) -> Type {
    Type::Func(Arc::new(FuncType::new(params, ret)))
}

fn vfunc(params: Vec<Type>, ret: Type) -> Type {
    Type::Func(Arc::new(FuncType::variadic(params, ret)))
}

fn lib_record(name: &str, fields: Vec<(&str, Type)>) -> Type {
    Type::Record(Arc::new(RecordType {
        name: name.to_string(),
        fields: fields
            .into_iter()
            .map(|(n, t)| (n.to_string(), t))
            .collect(),
    }))
}

/// Builtin global environment, typed
///
/// Mirrors the runtime whitelist: every name the VM will let a script read
/// has a declared type here so checked programs cannot reference anything
/// the sandbox would reject.
pub static BUILTIN_GLOBALS: Lazy<BTreeMap<&'static str, Type>> = Lazy::new(|| {
    use Type::*;
    let mut table = BTreeMap::new();

    table.insert("print", vfunc(vec![], Nil));
    table.insert("pprint", vfunc(vec![], Nil));
    table.insert("tostring", func(vec![Object], String));
    table.insert("tojsonstring", func(vec![Object], String));
    table.insert("tonumber", func(vec![Object], Number));
    table.insert("tointeger", func(vec![Object], Int));
    table.insert("type", func(vec![Object], String));
    table.insert("pairs", func(vec![Table], Object));
    table.insert("ipairs", func(vec![Table], Object));
    table.insert("error", func(vec![String], Nil));
    table.insert("select", vfunc(vec![Object], Object));
    table.insert("exit", func(vec![], Nil));

    table.insert(
        "table",
        lib_record(
            "table",
            vec![
                ("insert", vfunc(vec![Table], Nil)),
                ("append", func(vec![Table, Object], Nil)),
                ("remove", vfunc(vec![Table], Object)),
                ("length", func(vec![Table], Int)),
                ("concat", vfunc(vec![Table], String)),
                ("sort", func(vec![Table], Nil)),
            ],
        ),
    );
    table.insert(
        "string",
        lib_record(
            "string",
            vec![
                ("len", func(vec![String], Int)),
                ("sub", vfunc(vec![String, Int], String)),
                ("upper", func(vec![String], String)),
                ("lower", func(vec![String], String)),
                ("rep", func(vec![String, Int], String)),
                ("byte", vfunc(vec![String], Int)),
            ],
        ),
    );
    table.insert(
        "math",
        lib_record(
            "math",
            vec![
                ("floor", func(vec![Number], Int)),
                ("ceil", func(vec![Number], Int)),
                ("abs", func(vec![Number], Number)),
                ("max", func(vec![Number, Number], Number)),
                ("min", func(vec![Number, Number], Number)),
            ],
        ),
    );
    table.insert(
        "json",
        lib_record(
            "json",
            vec![
                ("dumps", func(vec![Object], String)),
                ("loads", func(vec![String], Object)),
            ],
        ),
    );

    table.insert("emit", func(vec![String, String], Nil));
    table.insert("import_contract", func(vec![String], Object));
    table.insert("import_contract_from_address", func(vec![String], Object));
    table.insert("caller", String);
    table.insert("caller_address", String);
    table.insert("self", Object);

    table.insert(
        "transfer_from_contract_to_address",
        func(vec![String, String, Int], Int),
    );
    table.insert(
        "transfer_from_contract_to_public_account",
        func(vec![String, String, Int], Int),
    );
    table.insert("get_contract_balance_amount", func(vec![String, String], Int));
    table.insert("get_chain_now", func(vec![], Int));
    table.insert("get_chain_random", func(vec![], Number));
    table.insert("get_transaction_id", func(vec![], String));
    table.insert("get_transaction_fee", func(vec![], Int));
    table.insert("get_header_block_num", func(vec![], Int));
    table.insert("get_current_contract_address", func(vec![], String));
    table.insert("Stream", func(vec![], Object));

    table
});

/// Names a compiled chunk may read as globals; shared with the verifier
pub static GLOBAL_WHITELIST: Lazy<Vec<&'static str>> =
    Lazy::new(|| BUILTIN_GLOBALS.keys().copied().collect());

pub fn is_whitelisted_global(name: &str) -> bool {
    BUILTIN_GLOBALS.contains_key(name)
}
