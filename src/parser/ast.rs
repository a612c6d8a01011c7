//! Abstract syntax tree for the contract scripting language
//!
//! Nodes are owned exclusively by the parse tree; passes that rewrite a
//! program produce a new tree rather than mutating shared nodes.

use serde::{Deserialize, Serialize};

/// A parsed chunk: the top-level statement block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub block: Block,
}

/// An ordered statement list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub statements: Vec<Statement>,
}

/// Statement variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// `let` / `var` / `local` declaration
    Declare {
        names: Vec<String>,
        /// Optional annotation per name
        annotations: Vec<Option<TypeExpr>>,
        exprs: Vec<Expr>,
        mutable: bool,
        line: usize,
    },
    /// Assignment to one or more targets
    Assign {
        targets: Vec<Expr>,
        exprs: Vec<Expr>,
        line: usize,
    },
    /// A call evaluated for its side effects
    ExprStat { expr: Expr, line: usize },
    If {
        /// (condition, body) arms: `if` plus any `elseif`s
        arms: Vec<(Expr, Block)>,
        else_block: Option<Block>,
        line: usize,
    },
    NumericFor {
        var: String,
        start: Expr,
        stop: Expr,
        step: Option<Expr>,
        body: Block,
        line: usize,
    },
    IterFor {
        names: Vec<String>,
        iter: Expr,
        body: Block,
        line: usize,
    },
    While {
        condition: Expr,
        body: Block,
        line: usize,
    },
    Do { body: Block, line: usize },
    /// `function Name(...)`, `function T.name(...)`, `function T:name(...)`
    FunctionDecl {
        target: FunctionTarget,
        body: FunctionBody,
        line: usize,
    },
    LocalFunction {
        name: String,
        body: FunctionBody,
        line: usize,
    },
    Return { expr: Option<Expr>, line: usize },
    Break { line: usize },
    Goto { label: String, line: usize },
    Label { name: String, line: usize },
    /// `type Name<G...> = { ... }` or `type Name = T`
    TypeDecl {
        name: String,
        generics: Vec<String>,
        ty: TypeExpr,
        line: usize,
    },
}

/// Where a function declaration binds its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FunctionTarget {
    /// `function name(...)` over an existing local binding
    Name(String),
    /// `function tbl.name(...)`
    Member { table: String, name: String },
    /// `function tbl:name(...)` with implicit `self`
    Method { table: String, name: String },
}

/// Parameter with optional annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub annotation: Option<TypeExpr>,
}

/// Function literal body shared by declarations and anonymous functions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBody {
    pub params: Vec<Param>,
    pub return_annotation: Option<TypeExpr>,
    pub block: Block,
    pub line: usize,
}

/// Expression variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Nil { line: usize },
    True { line: usize },
    False { line: usize },
    Int { value: i64, line: usize },
    Number { value: f64, line: usize },
    Str { value: String, line: usize },
    Name { name: String, line: usize },
    Function { body: FunctionBody, line: usize },
    /// Table constructor distinguishing array part and map part
    Table {
        array_items: Vec<Expr>,
        map_items: Vec<(TableKeyExpr, Expr)>,
        line: usize,
    },
    Member {
        object: Box<Expr>,
        name: String,
        line: usize,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        line: usize,
    },
    Call {
        function: Box<Expr>,
        args: Vec<Expr>,
        line: usize,
    },
    MethodCall {
        object: Box<Expr>,
        method: String,
        args: Vec<Expr>,
        line: usize,
    },
    BinOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: usize,
    },
    UnOp {
        op: UnOp,
        operand: Box<Expr>,
        line: usize,
    },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Expr::Nil { line }
            | Expr::True { line }
            | Expr::False { line }
            | Expr::Int { line, .. }
            | Expr::Number { line, .. }
            | Expr::Str { line, .. }
            | Expr::Name { line, .. }
            | Expr::Function { line, .. }
            | Expr::Table { line, .. }
            | Expr::Member { line, .. }
            | Expr::Index { line, .. }
            | Expr::Call { line, .. }
            | Expr::MethodCall { line, .. }
            | Expr::BinOp { line, .. }
            | Expr::UnOp { line, .. } => *line,
        }
    }
}

/// Key of a map-part entry in a table constructor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableKeyExpr {
    /// `name = value`
    Name(String),
    /// `[expr] = value`
    Expr(Expr),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Operator spelling as written in source
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::IDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Concat => "..",
            BinOp::Eq => "==",
            BinOp::Ne => "~=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

impl UnOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "not",
            UnOp::Len => "#",
        }
    }
}

/// Type annotation sub-grammar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    /// `Name` or generic instantiation `Name<T1, ...>`
    Named {
        name: String,
        args: Vec<TypeExpr>,
        line: usize,
    },
    /// Inline record `{ field: T, ... }`
    Record {
        fields: Vec<(String, TypeExpr)>,
        line: usize,
    },
    /// `(T1, T2) => R`
    Function {
        params: Vec<TypeExpr>,
        ret: Box<TypeExpr>,
        line: usize,
    },
    /// Union of literal/type alternatives: `"a" | "b" | true`
    Union { members: Vec<UnionMember>, line: usize },
}

impl TypeExpr {
    pub fn line(&self) -> usize {
        match self {
            TypeExpr::Named { line, .. }
            | TypeExpr::Record { line, .. }
            | TypeExpr::Function { line, .. }
            | TypeExpr::Union { line, .. } => *line,
        }
    }
}

/// One alternative of a union type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnionMember {
    Str(String),
    Int(i64),
    Bool(bool),
    Type(TypeExpr),
}
