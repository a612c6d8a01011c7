//! Runtime values for the virtual machine
//!
//! Tables keep an explicit array part plus a `BTreeMap` map part so that
//! iteration order is deterministic across sessions and nodes. Reference
//! values (tables, closures) compare by identity, everything else by value.

use crate::bytecode::Prototype;
use crate::storage::{StorageValue, MAX_STORAGE_DEPTH};
use crate::vm::errors::VmError;
use crate::vm::resolver::FieldResolver;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Deterministically ordered table key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableKey {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKey::Int(i) => write!(f, "{}", i),
            TableKey::Str(s) => write!(f, "{}", s),
            TableKey::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// A table with distinct array and map parts
#[derive(Debug, Default)]
pub struct Table {
    pub array: Vec<Value>,
    pub map: BTreeMap<TableKey, Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &TableKey) -> Value {
        if let TableKey::Int(i) = key {
            let i = *i;
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[i as usize - 1].clone();
            }
        }
        self.map.get(key).cloned().unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, key: TableKey, value: Value) {
        if let TableKey::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                self.array[i as usize - 1] = value;
                return;
            }
            if i as usize == self.array.len() + 1 {
                if value != Value::Nil {
                    self.array.push(value);
                    // absorb any map entries that extend the dense run
                    loop {
                        let next = TableKey::Int(self.array.len() as i64 + 1);
                        match self.map.remove(&next) {
                            Some(v) => self.array.push(v),
                            None => break,
                        }
                    }
                }
                return;
            }
        }
        if value == Value::Nil {
            self.map.remove(&key);
        } else {
            self.map.insert(key, value);
        }
    }

    /// `#` length: the array part only
    pub fn len(&self) -> i64 {
        self.array.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.map.is_empty()
    }

    /// Snapshot of every key in canonical iteration order: the dense array
    /// run first, then map keys in `TableKey` order
    pub fn iteration_keys(&self) -> Vec<TableKey> {
        let mut keys = Vec::with_capacity(self.array.len() + self.map.len());
        for i in 1..=self.array.len() {
            keys.push(TableKey::Int(i as i64));
        }
        keys.extend(self.map.keys().cloned());
        keys
    }
}

/// A callable user function with resolved captures
#[derive(Debug)]
pub struct Closure {
    pub proto: Rc<Prototype>,
    pub upvalues: Vec<Rc<RefCell<Value>>>,
}

/// A proxied cross-contract API function: calling it pushes the owning
/// contract onto the session's current-contract stack for the duration
#[derive(Debug)]
pub struct ContractFn {
    pub address: String,
    pub contract_name: Option<String>,
    pub closure: Rc<Closure>,
    /// The contract's own module table, bound as `self` for the call
    pub module: Value,
}

/// Native host functions exposed through the global whitelist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinFn {
    Print,
    Pprint,
    Tostring,
    Tojsonstring,
    Tonumber,
    Tointeger,
    TypeOf,
    Pairs,
    Ipairs,
    ErrorFn,
    Select,
    Exit,
    TableInsert,
    TableAppend,
    TableRemove,
    TableLength,
    TableConcat,
    TableSort,
    StrLen,
    StrSub,
    StrUpper,
    StrLower,
    StrRep,
    StrByte,
    MathFloor,
    MathCeil,
    MathAbs,
    MathMax,
    MathMin,
    JsonDumps,
    JsonLoads,
    Emit,
    ImportContract,
    ImportContractFromAddress,
    TransferToAddress,
    TransferToAccount,
    GetContractBalance,
    GetChainNow,
    GetChainRandom,
    GetTransactionId,
    GetTransactionFee,
    GetHeaderBlockNum,
    GetCurrentContractAddress,
    StreamNew,
    StreamAppend,
    StreamSize,
    StreamDump,
}

/// Iteration state produced by `IterPrep`
#[derive(Debug)]
pub struct TableIter {
    pub table: Rc<RefCell<Table>>,
    pub keys: Vec<TableKey>,
    pub pos: usize,
}

/// A runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(Rc<str>),
    Table(Rc<RefCell<Table>>),
    Closure(Rc<Closure>),
    Builtin(BuiltinFn),
    ContractFn(Rc<ContractFn>),
    Resolver(Rc<dyn FieldResolver>),
    Stream(u32),
    Iterator(Rc<RefCell<TableIter>>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Int(a), Value::Number(b)) | (Value::Number(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::ContractFn(a), Value::ContractFn(b)) => Rc::ptr_eq(a, b),
            (Value::Resolver(a), Value::Resolver(b)) => Rc::ptr_eq(a, b),
            (Value::Stream(a), Value::Stream(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn from_str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn new_table() -> Value {
        Value::Table(Rc::new(RefCell::new(Table::new())))
    }

    /// Lua truthiness: everything except nil and false
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) | Value::Builtin(_) | Value::ContractFn(_) => "function",
            Value::Resolver(_) => "table",
            Value::Stream(_) => "stream",
            Value::Iterator(_) => "iterator",
        }
    }

    /// Numeric view, widening ints
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Display form used by print/tostring
    pub fn display(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    format!("{:.1}", n)
                } else {
                    n.to_string()
                }
            }
            Value::Str(s) => s.to_string(),
            Value::Table(t) => format!("table: {:p}", Rc::as_ptr(t)),
            Value::Closure(c) => format!("function: {:p}", Rc::as_ptr(c)),
            Value::Builtin(_) => "function: builtin".to_string(),
            Value::ContractFn(f) => format!("function: contract {}", f.address),
            Value::Resolver(r) => format!("table: {}", r.describe()),
            Value::Stream(handle) => format!("stream: {}", handle),
            Value::Iterator(_) => "iterator".to_string(),
        }
    }

    /// Canonical JSON projection; array form only for a dense, non-empty
    /// array part with an empty map part, the empty table is `{}`
    pub fn to_json(&self) -> Result<serde_json::Value, VmError> {
        self.to_json_depth(0)
    }

    fn to_json_depth(&self, depth: usize) -> Result<serde_json::Value, VmError> {
        if depth > MAX_STORAGE_DEPTH {
            return Err(VmError::ValueTooDeep);
        }
        Ok(match self {
            Value::Nil => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Table(table) => {
                let table = table.borrow();
                if table.map.is_empty() && !table.array.is_empty() {
                    let mut items = Vec::with_capacity(table.array.len());
                    for item in &table.array {
                        items.push(item.to_json_depth(depth + 1)?);
                    }
                    serde_json::Value::Array(items)
                } else {
                    let mut object = serde_json::Map::new();
                    for (i, item) in table.array.iter().enumerate() {
                        object.insert((i + 1).to_string(), item.to_json_depth(depth + 1)?);
                    }
                    for (key, item) in &table.map {
                        object.insert(key.to_string(), item.to_json_depth(depth + 1)?);
                    }
                    serde_json::Value::Object(object)
                }
            }
            other => {
                return Err(VmError::UnserializableValue {
                    type_name: other.type_name().to_string(),
                })
            }
        })
    }

    /// Build a value from JSON (json.loads)
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Number(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::from_str(s),
            serde_json::Value::Array(items) => {
                let mut table = Table::new();
                table.array = items.iter().map(Value::from_json).collect();
                Value::Table(Rc::new(RefCell::new(table)))
            }
            serde_json::Value::Object(map) => {
                let mut table = Table::new();
                for (key, item) in map {
                    table
                        .map
                        .insert(TableKey::Str(key.clone()), Value::from_json(item));
                }
                Value::Table(Rc::new(RefCell::new(table)))
            }
        }
    }

    /// Convert to a storage value; reference cycles are cut by the depth
    /// bound, callables are unsupported
    pub fn to_storage(&self, streams: &dyn Fn(u32) -> Option<Vec<u8>>) -> Result<StorageValue, VmError> {
        self.to_storage_depth(streams, 0)
    }

    fn to_storage_depth(
        &self,
        streams: &dyn Fn(u32) -> Option<Vec<u8>>,
        depth: usize,
    ) -> Result<StorageValue, VmError> {
        if depth > MAX_STORAGE_DEPTH {
            return Err(VmError::ValueTooDeep);
        }
        Ok(match self {
            Value::Nil => StorageValue::Null,
            Value::Bool(b) => StorageValue::Bool(*b),
            Value::Int(i) => StorageValue::Int(*i),
            Value::Number(n) => StorageValue::Number(*n),
            Value::Str(s) => StorageValue::String(s.to_string()),
            Value::Stream(handle) => StorageValue::Stream(
                streams(*handle).ok_or(VmError::InvalidStreamHandle { handle: *handle })?,
            ),
            Value::Table(table) => {
                let table = table.borrow();
                if table.map.is_empty() && !table.array.is_empty() {
                    let mut items = Vec::with_capacity(table.array.len());
                    for item in &table.array {
                        items.push(item.to_storage_depth(streams, depth + 1)?);
                    }
                    StorageValue::Array(items)
                } else {
                    let mut map = BTreeMap::new();
                    for (i, item) in table.array.iter().enumerate() {
                        map.insert((i + 1).to_string(), item.to_storage_depth(streams, depth + 1)?);
                    }
                    for (key, item) in &table.map {
                        map.insert(key.to_string(), item.to_storage_depth(streams, depth + 1)?);
                    }
                    StorageValue::Table(map)
                }
            }
            other => {
                return Err(VmError::UnserializableValue {
                    type_name: other.type_name().to_string(),
                })
            }
        })
    }

    /// Materialize a storage value in the VM
    pub fn from_storage(value: &StorageValue, streams: &mut dyn FnMut(Vec<u8>) -> u32) -> Value {
        match value {
            StorageValue::Null | StorageValue::Unsupported => Value::Nil,
            StorageValue::Bool(b) => Value::Bool(*b),
            StorageValue::Int(i) => Value::Int(*i),
            StorageValue::Number(n) => Value::Number(*n),
            StorageValue::String(s) => Value::from_str(s),
            StorageValue::Stream(bytes) => Value::Stream(streams(bytes.clone())),
            StorageValue::Array(items) => {
                let mut table = Table::new();
                table.array = items
                    .iter()
                    .map(|item| Value::from_storage(item, streams))
                    .collect();
                Value::Table(Rc::new(RefCell::new(table)))
            }
            StorageValue::Table(map) => {
                let mut table = Table::new();
                for (key, item) in map {
                    let table_key = match key.parse::<i64>() {
                        Ok(i) => TableKey::Int(i),
                        Err(_) => TableKey::Str(key.clone()),
                    };
                    table.set(table_key, Value::from_storage(item, streams));
                }
                Value::Table(Rc::new(RefCell::new(table)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_array_append_semantics() {
        let mut table = Table::new();
        table.set(TableKey::Int(1), Value::Int(10));
        table.set(TableKey::Int(2), Value::Int(20));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&TableKey::Int(1)), Value::Int(10));
        // sparse key lands in the map part
        table.set(TableKey::Int(10), Value::Int(100));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&TableKey::Int(10)), Value::Int(100));
    }

    #[test]
    fn test_table_absorbs_dense_run() {
        let mut table = Table::new();
        table.set(TableKey::Int(2), Value::Int(20));
        table.set(TableKey::Int(1), Value::Int(10));
        // inserting 1 makes 2 contiguous; both live in the array part
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_iteration_order_deterministic() {
        let mut table = Table::new();
        table.set(TableKey::Str("b".into()), Value::Int(2));
        table.set(TableKey::Str("a".into()), Value::Int(1));
        table.set(TableKey::Int(1), Value::Int(0));
        let keys = table.iteration_keys();
        assert_eq!(
            keys,
            vec![
                TableKey::Int(1),
                TableKey::Str("a".into()),
                TableKey::Str("b".into()),
            ]
        );
    }

    #[test]
    fn test_json_dense_array_form() {
        let value = Value::from_json(&serde_json::json!([1, 2, 3]));
        assert_eq!(value.to_json().unwrap().to_string(), "[1,2,3]");
    }

    #[test]
    fn test_json_empty_table_is_map_form() {
        let value = Value::new_table();
        assert_eq!(value.to_json().unwrap().to_string(), "{}");
    }

    #[test]
    fn test_json_sparse_table_is_map_form() {
        let table = Value::new_table();
        if let Value::Table(t) = &table {
            t.borrow_mut().set(TableKey::Int(1), Value::Int(1));
            t.borrow_mut().set(TableKey::Int(5), Value::Int(5));
        }
        assert_eq!(table.to_json().unwrap().to_string(), r#"{"1":1,"5":5}"#);
    }

    #[test]
    fn test_equality_by_identity_for_tables() {
        let a = Value::new_table();
        let b = Value::new_table();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_int_number_cross_equality() {
        assert_eq!(Value::Int(3), Value::Number(3.0));
        assert_ne!(Value::Int(3), Value::Number(3.5));
    }

    #[test]
    fn test_storage_round_trip() {
        let table = Value::new_table();
        if let Value::Table(t) = &table {
            t.borrow_mut()
                .set(TableKey::Str("count".into()), Value::Int(7));
        }
        let stored = table.to_storage(&|_| None).unwrap();
        assert_eq!(stored.type_name(), "table");
        let mut alloc = |_bytes: Vec<u8>| 0u32;
        let back = Value::from_storage(&stored, &mut alloc);
        if let Value::Table(t) = back {
            assert_eq!(t.borrow().get(&TableKey::Str("count".into())), Value::Int(7));
        } else {
            panic!("expected table");
        }
    }

    #[test]
    fn test_closure_not_storable() {
        let err = Value::Builtin(BuiltinFn::Print).to_storage(&|_| None).unwrap_err();
        assert!(matches!(err, VmError::UnserializableValue { .. }));
    }
}
