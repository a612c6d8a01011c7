//! Bytecode representation and the serializable module stream
//!
//! A compiled function is a [`Prototype`]: a flat instruction sequence with
//! a constants pool, debug local names with live ranges, upvalue
//! descriptors, nested child prototypes and a line-number-per-instruction
//! table. A [`ModuleStream`] bundles the root prototype with the contract
//! metadata (exported/offline API names, event names, storage schema) and
//! round-trips through a versioned binary envelope.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Envelope magic for serialized module streams
pub const STREAM_MAGIC: &[u8; 4] = b"CSBC";

/// Bytecode format version; streams are not wire-compatible across versions
pub const STREAM_VERSION: u32 = 3;

/// Per-function register ceiling
pub const MAX_REGISTERS: usize = 250;

/// Per-function local variable ceiling
pub const MAX_LOCALS: usize = 200;

/// Arithmetic instruction variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
}

/// Comparison instruction variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Unary instruction variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    Len,
}

/// A register-machine instruction
///
/// Registers are `u8` slots within the executing frame; `k` operands index
/// the frame prototype's constants pool. There is deliberately no
/// environment-write instruction: global stores are unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Copy a register
    Move { dst: u8, src: u8 },
    /// Load a constant
    LoadConst { dst: u8, k: u32 },
    /// Load a boolean
    LoadBool { dst: u8, value: bool },
    /// Clear `count` registers starting at `dst`
    LoadNil { dst: u8, count: u8 },
    /// Read a whitelisted global; `name_k` indexes a string constant
    GetGlobal { dst: u8, name_k: u32 },
    /// Read an upvalue
    GetUpvalue { dst: u8, index: u8 },
    /// Write an upvalue
    SetUpvalue { src: u8, index: u8 },
    /// Fresh empty table
    NewTable { dst: u8 },
    /// `dst = obj[k]` with a string-constant key
    GetField { dst: u8, obj: u8, key_k: u32 },
    /// `obj[k] = src` with a string-constant key
    SetField { obj: u8, key_k: u32, src: u8 },
    /// `dst = obj[idx]`
    GetIndex { dst: u8, obj: u8, idx: u8 },
    /// `obj[idx] = src`
    SetIndex { obj: u8, idx: u8, src: u8 },
    /// Method fetch: `dst = obj[k]`, `dst+1 = obj`
    GetMethod { dst: u8, obj: u8, key_k: u32 },
    /// Append `count` registers starting at `start` to the array part of `obj`
    AppendList { obj: u8, start: u8, count: u8 },
    /// `dst = lhs <op> rhs`
    Arith { op: ArithOp, dst: u8, lhs: u8, rhs: u8 },
    /// `dst = <op> src`
    Unary { op: UnaryOp, dst: u8, src: u8 },
    /// `dst = lhs <cmp> rhs`
    Compare { op: CompareOp, dst: u8, lhs: u8, rhs: u8 },
    /// Concatenate `count` registers starting at `start`
    Concat { dst: u8, start: u8, count: u8 },
    /// Relative jump; offset is from the next instruction
    Jump { offset: i32 },
    /// Jump when the truthiness of `reg` equals `jump_if`
    TestJump { reg: u8, jump_if: bool, offset: i32 },
    /// Call `base` with `args` arguments in following registers; the single
    /// result lands back in `base`
    Call { base: u8, args: u8 },
    /// Instantiate child prototype `proto` capturing per its descriptors
    Closure { dst: u8, proto: u32 },
    /// Return the value in `src` (or nil when `has_value` is false)
    Return { src: u8, has_value: bool },
    /// Numeric for setup over (start, stop, step) at `base..base+2`
    ForPrep { base: u8, offset: i32 },
    /// Numeric for step/test; loop variable is exposed at `base + 3`
    ForLoop { base: u8, offset: i32 },
    /// Normalize the iterable at `base` into iteration state
    IterPrep { base: u8 },
    /// Produce next key/value at `base+1`, `base+2`; jump back while iterating
    IterNext { base: u8, offset: i32 },
}

/// A constant pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Number(f64),
    Str(String),
}

impl Constant {
    pub fn type_name(&self) -> &'static str {
        match self {
            Constant::Nil => "nil",
            Constant::Bool(_) => "bool",
            Constant::Int(_) => "int",
            Constant::Number(_) => "number",
            Constant::Str(_) => "string",
        }
    }
}

/// Debug record of a local variable's register and live range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVar {
    pub name: String,
    pub register: u8,
    /// First instruction index where the local is live
    pub start_pc: u32,
    /// One past the last instruction index where the local is live
    pub end_pc: u32,
}

/// Capture descriptor: where a closure's upvalue comes from in the parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpvalDesc {
    pub name: String,
    /// True: captures parent local register `index`; false: re-captures
    /// parent upvalue `index`
    pub from_parent_stack: bool,
    pub index: u8,
}

/// A compiled function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    /// Function name for diagnostics; empty for the chunk and anonymous fns
    pub name: String,
    /// Source line where the function is defined (0 for the chunk)
    pub line_defined: usize,
    pub param_count: u8,
    /// Method functions receive `self` as an implicit first parameter
    pub is_method: bool,
    pub max_registers: u8,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Source line per instruction, parallel to `instructions`
    pub line_info: Vec<u32>,
    pub locals: Vec<LocalVar>,
    pub upvalues: Vec<UpvalDesc>,
    pub protos: Vec<Prototype>,
}

impl Prototype {
    pub fn new(name: impl Into<String>, line_defined: usize) -> Self {
        Self {
            name: name.into(),
            line_defined,
            param_count: 0,
            is_method: false,
            max_registers: 0,
            instructions: Vec::new(),
            constants: Vec::new(),
            line_info: Vec::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            protos: Vec::new(),
        }
    }
}

/// A field of the declared storage schema carried in module metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageField {
    pub name: String,
    /// Rendered type, e.g. `int` or `Array<string>`
    pub ty: String,
}

/// The serializable unit combining bytecode with contract metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStream {
    /// Root prototype of the compiled chunk
    pub bytecode: Prototype,
    /// Exported API names, unique, case-sensitive, declaration order
    pub api_names: Vec<String>,
    /// Query-only APIs excluded from consensus-affecting execution
    pub offline_api_names: Vec<String>,
    /// Distinct event names the module may emit
    pub event_names: Vec<String>,
    /// Declared storage schema (empty outside contract mode)
    pub storage_schema: Vec<StorageField>,
}

/// Failure to reconstruct a module stream from bytes
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UndumpError {
    #[error("not a module stream: bad magic")]
    BadMagic,
    #[error("unsupported module stream version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("corrupt module stream: {0}")]
    Corrupt(String),
}

impl ModuleStream {
    pub fn new(bytecode: Prototype) -> Self {
        Self {
            bytecode,
            api_names: Vec::new(),
            offline_api_names: Vec::new(),
            event_names: Vec::new(),
            storage_schema: Vec::new(),
        }
    }

    /// Serialize into the versioned envelope
    pub fn serialize(&self) -> Vec<u8> {
        let payload = serde_json::to_vec(self).expect("module stream serialization");
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(STREAM_MAGIC);
        out.extend_from_slice(&STREAM_VERSION.to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Reconstruct from envelope bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, UndumpError> {
        if bytes.len() < 8 || &bytes[0..4] != STREAM_MAGIC {
            return Err(UndumpError::BadMagic);
        }
        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version_bytes);
        if version != STREAM_VERSION {
            return Err(UndumpError::VersionMismatch {
                found: version,
                expected: STREAM_VERSION,
            });
        }
        serde_json::from_slice(&bytes[8..]).map_err(|e| UndumpError::Corrupt(e.to_string()))
    }

    /// Content-derived contract address, stable across nodes
    pub fn derive_address(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.serialize());
        let digest = hasher.finalize();
        hex::encode(digest)[..40].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> ModuleStream {
        let mut proto = Prototype::new("", 0);
        proto.constants.push(Constant::Str("greeting".into()));
        proto.constants.push(Constant::Int(7));
        proto.instructions.push(Instruction::LoadConst { dst: 0, k: 1 });
        proto.instructions.push(Instruction::Return {
            src: 0,
            has_value: true,
        });
        proto.line_info = vec![1, 1];
        proto.max_registers = 1;
        let mut stream = ModuleStream::new(proto);
        stream.api_names = vec!["init".into(), "get".into()];
        stream.offline_api_names = vec!["get".into()];
        stream.event_names = vec!["Changed".into()];
        stream
    }

    #[test]
    fn test_round_trip() {
        let stream = sample_stream();
        let bytes = stream.serialize();
        let restored = ModuleStream::deserialize(&bytes).unwrap();
        assert_eq!(stream, restored);
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(
            ModuleStream::deserialize(b"XXXX0000rest"),
            Err(UndumpError::BadMagic)
        );
        assert_eq!(ModuleStream::deserialize(b"CS"), Err(UndumpError::BadMagic));
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = sample_stream().serialize();
        bytes[4..8].copy_from_slice(&999u32.to_le_bytes());
        assert!(matches!(
            ModuleStream::deserialize(&bytes),
            Err(UndumpError::VersionMismatch { found: 999, .. })
        ));
    }

    #[test]
    fn test_corrupt_payload() {
        let mut bytes = sample_stream().serialize();
        let len = bytes.len();
        bytes.truncate(len - 10);
        assert!(matches!(
            ModuleStream::deserialize(&bytes),
            Err(UndumpError::Corrupt(_))
        ));
    }

    #[test]
    fn test_address_stable_and_content_derived() {
        let a = sample_stream();
        let b = sample_stream();
        assert_eq!(a.derive_address(), b.derive_address());
        assert_eq!(a.derive_address().len(), 40);

        let mut c = sample_stream();
        c.api_names.push("extra".into());
        assert_ne!(a.derive_address(), c.derive_address());
    }
}
