//! Type model for the static checker
//!
//! Types are compared structurally; records compare by name plus field set.
//! The operator overload table lives here too, seeded with the specialized
//! integer signatures ahead of the general numeric ones so that integer
//! arguments select the integer result type.

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A checked type
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int,
    Number,
    Bool,
    String,
    Table,
    Function,
    Object,
    Nil,
    Array(Box<Type>),
    Map(Box<Type>),
    Record(Arc<RecordType>),
    Union(Vec<UnionAlt>),
    Func(Arc<FuncType>),
    Generic(String),
}

/// A named record with an ordered field set
#[derive(Debug, Clone, PartialEq)]
pub struct RecordType {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl RecordType {
    pub fn field(&self, name: &str) -> Option<&Type> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Render the field shape for diagnostics
    pub fn shape(&self) -> String {
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(n, t)| format!("{}: {}", n, t))
            .collect();
        format!("{} {{ {} }}", self.name, fields.join(", "))
    }
}

/// A function signature
#[derive(Debug, Clone, PartialEq)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub ret: Type,
    /// Accepts fewer or extra arguments beyond `params` (builtins only)
    pub variadic: bool,
}

impl FuncType {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self {
            params,
            ret,
            variadic: false,
        }
    }

    pub fn variadic(params: Vec<Type>, ret: Type) -> Self {
        Self {
            params,
            ret,
            variadic: true,
        }
    }
}

/// One alternative of a union type
#[derive(Debug, Clone, PartialEq)]
pub enum UnionAlt {
    Str(String),
    Int(i64),
    Bool(bool),
    Type(Type),
}

impl fmt::Display for UnionAlt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnionAlt::Str(s) => write!(f, "\"{}\"", s),
            UnionAlt::Int(i) => write!(f, "{}", i),
            UnionAlt::Bool(b) => write!(f, "{}", b),
            UnionAlt::Type(t) => write!(f, "{}", t),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Number => write!(f, "number"),
            Type::Bool => write!(f, "bool"),
            Type::String => write!(f, "string"),
            Type::Table => write!(f, "table"),
            Type::Function => write!(f, "function"),
            Type::Object => write!(f, "object"),
            Type::Nil => write!(f, "nil"),
            Type::Array(elem) => write!(f, "Array<{}>", elem),
            Type::Map(value) => write!(f, "Map<{}>", value),
            Type::Record(record) => write!(f, "record {}", record.shape()),
            Type::Union(alts) => {
                let parts: Vec<String> = alts.iter().map(|a| a.to_string()).collect();
                write!(f, "{}", parts.join(" | "))
            }
            Type::Func(func) => {
                let params: Vec<String> = func.params.iter().map(|p| p.to_string()).collect();
                write!(f, "({}) => {}", params.join(", "), func.ret)
            }
            Type::Generic(name) => write!(f, "{}", name),
        }
    }
}

impl Type {
    /// Format an argument tuple for diagnostics
    pub fn render_tuple(types: &[Type]) -> String {
        let parts: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        format!("({})", parts.join(", "))
    }

    /// True when a value of `from` may be bound where `self` is declared
    pub fn accepts(&self, from: &Type) -> bool {
        if self == from {
            return true;
        }
        match (self, from) {
            (Type::Object, _) => true,
            (_, Type::Nil) => true,
            (_, Type::Object) => true,
            (Type::Number, Type::Int) => true,
            (Type::Table, Type::Array(_))
            | (Type::Table, Type::Map(_))
            | (Type::Table, Type::Record(_)) => true,
            (Type::Function, Type::Func(_)) => true,
            (Type::Array(a), Type::Array(b)) => a.accepts(b),
            (Type::Map(a), Type::Map(b)) => a.accepts(b),
            (Type::Array(_), Type::Table) | (Type::Map(_), Type::Table) => true,
            (Type::Record(_), Type::Table) => true,
            (Type::Union(alts), _) => alts.iter().any(|alt| match alt {
                UnionAlt::Type(t) => t.accepts(from),
                UnionAlt::Str(_) => *from == Type::String,
                UnionAlt::Int(_) => *from == Type::Int,
                UnionAlt::Bool(_) => *from == Type::Bool,
            }),
            (Type::Func(a), Type::Func(b)) => {
                a.params.len() == b.params.len()
                    && a.params.iter().zip(&b.params).all(|(x, y)| x.accepts(y))
                    && a.ret.accepts(&b.ret)
            }
            _ => false,
        }
    }
}

/// Operator overload table: operator symbol to its signature list,
/// specialized overloads first
pub static OPERATOR_OVERLOADS: Lazy<BTreeMap<&'static str, Vec<FuncType>>> = Lazy::new(|| {
    use Type::*;
    let mut table = BTreeMap::new();
    let int2 = |ret: Type| FuncType::new(vec![Int, Int], ret);
    let num2 = |ret: Type| FuncType::new(vec![Number, Number], ret);

    for op in ["+", "-", "*", "^"] {
        table.insert(op, vec![int2(Int), num2(Number)]);
    }
    table.insert("/", vec![num2(Number)]);
    table.insert("//", vec![int2(Int), num2(Int)]);
    table.insert("%", vec![int2(Int), num2(Number)]);
    table.insert("..", vec![FuncType::new(vec![String, String], String)]);
    for op in ["<", "<=", ">", ">="] {
        table.insert(
            op,
            vec![num2(Bool), FuncType::new(vec![String, String], Bool)],
        );
    }
    for op in ["==", "~="] {
        table.insert(op, vec![FuncType::new(vec![Object, Object], Bool)]);
    }
    for op in ["and", "or"] {
        table.insert(op, vec![FuncType::new(vec![Object, Object], Object)]);
    }
    // unary operators keyed by symbol with a single parameter
    table.insert("unary-", vec![
        FuncType::new(vec![Int], Int),
        FuncType::new(vec![Number], Number),
    ]);
    table.insert("not", vec![FuncType::new(vec![Object], Bool)]);
    table.insert("#", vec![FuncType::new(vec![Object], Int)]);
    table
});

/// Pick the first overload accepting the argument tuple
///
/// Variadic signatures check only the overlapping prefix; everything else
/// requires exact arity.
pub fn match_overload<'a>(overloads: &'a [FuncType], args: &[Type]) -> Option<&'a FuncType> {
    overloads.iter().find(|sig| {
        let arity_ok = sig.variadic || sig.params.len() == args.len();
        arity_ok && sig.params.iter().zip(args).all(|(p, a)| p.accepts(a))
    })
}

/// Render the declared signatures of an operation for diagnostics
pub fn render_signatures(overloads: &[FuncType]) -> String {
    let parts: Vec<String> = overloads
        .iter()
        .map(|sig| Type::Func(Arc::new(sig.clone())).to_string())
        .collect();
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_widens_to_number() {
        assert!(Type::Number.accepts(&Type::Int));
        assert!(!Type::Int.accepts(&Type::Number));
    }

    #[test]
    fn test_integer_overload_selected_first() {
        let add = OPERATOR_OVERLOADS.get("+").unwrap();
        let sig = match_overload(add, &[Type::Int, Type::Int]).unwrap();
        assert_eq!(sig.ret, Type::Int);
        let sig = match_overload(add, &[Type::Int, Type::Number]).unwrap();
        assert_eq!(sig.ret, Type::Number);
    }

    #[test]
    fn test_concat_rejects_numbers() {
        let concat = OPERATOR_OVERLOADS.get("..").unwrap();
        assert!(match_overload(concat, &[Type::Int, Type::Int]).is_none());
        assert!(match_overload(concat, &[Type::String, Type::String]).is_some());
    }

    #[test]
    fn test_union_accepts_literal_base_types() {
        let mode = Type::Union(vec![
            UnionAlt::Str("fast".into()),
            UnionAlt::Str("safe".into()),
            UnionAlt::Bool(true),
        ]);
        assert!(mode.accepts(&Type::String));
        assert!(mode.accepts(&Type::Bool));
        assert!(!mode.accepts(&Type::Int));
    }

    #[test]
    fn test_record_structural_compare() {
        let a = Type::Record(Arc::new(RecordType {
            name: "P".into(),
            fields: vec![("x".into(), Type::Int)],
        }));
        let b = Type::Record(Arc::new(RecordType {
            name: "P".into(),
            fields: vec![("x".into(), Type::Int)],
        }));
        let c = Type::Record(Arc::new(RecordType {
            name: "P".into(),
            fields: vec![("x".into(), Type::Number)],
        }));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
